mod framing;
pub mod inbound;
pub mod outbound;

pub use framing::{
    encode_frame, split_frames, FRAME_DELIMITER, KEEP_ALIVE_FRAME, NEGOTIATION_FRAME,
};
