//! Turns decoded frames into `StreamEvent`s.
//!
//! The answer arrives as a series of cumulative snapshots. A write cursor
//! tracks how much of it has already gone downstream, so each snapshot only
//! contributes its new suffix.

use sydney_contracts::events::{
    GenerativeImage, GenerativeMusic, SourceAttribute, StreamErrorKind, StreamEvent,
};
use sydney_contracts::wire::inbound::{
    decode_frame, parse_search_result_items, AnswerMessage, ChatMessage, CompletionFrame,
    InboundFrame, UpdateFrame,
};
use tracing::{debug, warn};

pub const NO_SEARCH_RESULT_MARKER: &str = "Web search returned no relevant result";
pub const IMAGE_CREATE_URL: &str = "https://www.bing.com/images/create";

#[derive(Debug, Default)]
pub struct StreamClassifier {
    cursor: usize,
    sources: Vec<SourceAttribute>,
    emitted_sources: Vec<SourceAttribute>,
    suggestions_sent: bool,
    finished: bool,
}

impl StreamClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set once a terminal frame, an apology, or a malformed frame was seen.
    /// Further frames are ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn feed(&mut self, raw: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        match decode_frame(raw) {
            Ok(InboundFrame::Update(frame)) => self.on_update(frame),
            Ok(InboundFrame::Completion(frame)) => self.on_completion(frame),
            Ok(InboundFrame::Other { kind }) => {
                debug!(kind, "ignoring frame");
                Vec::new()
            }
            Err(err) => {
                self.finished = true;
                vec![StreamEvent::Error(StreamErrorKind::MalformedFrame(
                    err.to_string(),
                ))]
            }
        }
    }

    fn on_completion(&mut self, frame: CompletionFrame) -> Vec<StreamEvent> {
        self.finished = true;
        if !frame.is_success() {
            return vec![StreamEvent::Error(StreamErrorKind::Rejected {
                value: frame.value,
                message: frame.message,
            })];
        }
        if !self.suggestions_sent && !frame.suggested_responses.is_empty() {
            self.suggestions_sent = true;
            return vec![StreamEvent::SuggestedResponses(frame.suggested_responses)];
        }
        Vec::new()
    }

    fn on_update(&mut self, frame: UpdateFrame) -> Vec<StreamEvent> {
        let Some(message) = frame.message else {
            return Vec::new();
        };
        match message {
            ChatMessage::SearchQuery { text } => vec![StreamEvent::SearchQuery(text)],
            ChatMessage::SearchResult { text, hidden_text } => {
                self.buffer_search_results(&text, &hidden_text);
                Vec::new()
            }
            ChatMessage::Loader { text } => vec![StreamEvent::Loading(text)],
            ChatMessage::Progress {
                text,
                content_origin,
            } => {
                if content_origin == "CodeInterpreter" {
                    vec![StreamEvent::ExecutingTask(text)]
                } else {
                    vec![StreamEvent::Loading(text)]
                }
            }
            ChatMessage::GenerateContent {
                content_type,
                text,
                message_id,
                request_id,
            } => match content_type.as_str() {
                "IMAGE" => vec![StreamEvent::GenerativeImageTrigger(GenerativeImage {
                    url: generative_image_url(&text, &message_id),
                    text,
                })],
                "SUNO" => vec![StreamEvent::GenerativeMusicTrigger(GenerativeMusic {
                    text,
                    iframe_id: message_id,
                    request_id,
                })],
                other => {
                    debug!(content_type = other, "ignoring generated content type");
                    Vec::new()
                }
            },
            ChatMessage::Answer(answer) => self.on_answer(frame.has_cursor, answer),
            ChatMessage::Unknown { message_type, raw } => {
                warn!(
                    message_type = message_type.as_str(),
                    raw = %raw,
                    "unsupported message type"
                );
                Vec::new()
            }
        }
    }

    fn on_answer(&mut self, has_cursor: bool, answer: AnswerMessage) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if has_cursor {
            self.cursor = 0;
        }
        let text = answer.text.as_deref().unwrap_or_default();
        if let Some(card_text) = answer.card_text.as_deref() {
            if let Some(event) = self.reconcile_citations(card_text, text) {
                events.push(event);
            }
        }

        if answer.is_apology() {
            self.finished = true;
            let kind = if self.cursor > 0 {
                StreamErrorKind::Revoked
            } else {
                StreamErrorKind::Filtered
            };
            events.push(StreamEvent::Error(kind));
            return events;
        }

        if let Some(text) = answer.text.as_deref() {
            if let Some(delta) = self.advance(text) {
                events.push(StreamEvent::MessageTextDelta(delta));
            }
        }
        if !answer.suggested_responses.is_empty() {
            self.suggestions_sent = true;
            events.push(StreamEvent::SuggestedResponses(answer.suggested_responses));
        }
        events
    }

    /// Move the cursor to the end of `text`, returning the unseen suffix.
    /// A shorter snapshot clamps the cursor without emitting anything.
    fn advance(&mut self, text: &str) -> Option<String> {
        if text.len() <= self.cursor {
            self.cursor = text.len();
            return None;
        }
        let mut start = self.cursor;
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        self.cursor = text.len();
        Some(text[start..].to_string())
    }

    fn buffer_search_results(&mut self, text: &str, hidden_text: &str) {
        if hidden_text.contains(NO_SEARCH_RESULT_MARKER) || text.contains(NO_SEARCH_RESULT_MARKER) {
            debug!("search returned no relevant result");
            return;
        }
        let Some(items) =
            parse_search_result_items(text).or_else(|| parse_search_result_items(hidden_text))
        else {
            warn!(text, "cannot parse search results");
            return;
        };
        for item in items {
            if self.sources.iter().any(|source| source.link == item.url) {
                continue;
            }
            self.sources.push(SourceAttribute {
                index: 0,
                link: item.url,
                title: item.title,
            });
        }
    }

    /// Number buffered sources from `[n]: url "title"` markers that the card
    /// carries but the plain answer text does not. Emits the numbered list
    /// when it changed.
    fn reconcile_citations(&mut self, card_text: &str, answer_text: &str) -> Option<StreamEvent> {
        for line in card_text.lines() {
            let line = line.trim();
            if line.is_empty() || answer_text.contains(line) {
                continue;
            }
            let Some(marker) = parse_citation_marker(line) else {
                continue;
            };
            match self
                .sources
                .iter_mut()
                .find(|source| source.link == marker.link)
            {
                Some(source) => source.index = marker.index,
                None => self.sources.push(marker),
            }
        }

        let mut resolved: Vec<SourceAttribute> = self
            .sources
            .iter()
            .filter(|source| source.index > 0)
            .cloned()
            .collect();
        resolved.sort_by_key(|source| source.index);
        if resolved.is_empty() || resolved == self.emitted_sources {
            return None;
        }
        self.emitted_sources = resolved.clone();
        Some(StreamEvent::SearchResult(resolved))
    }
}

/// Parse `[3]: https://example.com "Title"`.
fn parse_citation_marker(line: &str) -> Option<SourceAttribute> {
    let rest = line.strip_prefix('[')?;
    let (index, rest) = rest.split_once("]:")?;
    let index: u32 = index.trim().parse().ok()?;
    if index == 0 {
        return None;
    }
    let rest = rest.trim();
    let (link, title) = match rest.split_once(char::is_whitespace) {
        Some((link, title)) => (link, title.trim().trim_matches('"')),
        None => (rest, ""),
    };
    if link.is_empty() {
        return None;
    }
    Some(SourceAttribute {
        index,
        link: link.to_string(),
        title: title.to_string(),
    })
}

/// Result page the image creator answers on for a generation request.
pub fn generative_image_url(prompt: &str, message_id: &str) -> String {
    let params = [
        ("partner", "sydney"),
        ("re", "1"),
        ("showselective", "1"),
        ("sude", "1"),
        ("kseed", "7500"),
        ("SFX", "2"),
        ("gptexp", "unknown"),
        ("q", prompt),
        ("iframeid", message_id),
    ];
    match reqwest::Url::parse_with_params(IMAGE_CREATE_URL, &params) {
        Ok(url) => url.to_string(),
        Err(_) => IMAGE_CREATE_URL.to_string(),
    }
}
