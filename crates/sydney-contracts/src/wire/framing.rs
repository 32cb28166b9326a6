/// Record separator terminating every logical frame.
pub const FRAME_DELIMITER: char = '\u{1e}';

pub const NEGOTIATION_FRAME: &str = r#"{"protocol":"json","version":1}"#;
pub const KEEP_ALIVE_FRAME: &str = r#"{"type":6}"#;

pub fn encode_frame(payload: &str) -> String {
    let mut frame = String::with_capacity(payload.len() + 1);
    frame.push_str(payload);
    frame.push(FRAME_DELIMITER);
    frame
}

/// Split one physical message into its logical frames, skipping empty ones.
pub fn split_frames(message: &str) -> Vec<&str> {
    message
        .split(FRAME_DELIMITER)
        .filter(|frame| !frame.is_empty())
        .collect()
}
