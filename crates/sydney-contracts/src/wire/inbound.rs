//! Decoding of inbound frames into a small set of typed shapes.
//!
//! Only the discriminator fields are read up front; the chosen variant then
//! pulls the handful of fields it needs. Shapes nothing acts on land in
//! `ChatMessage::Unknown`.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {source}")]
pub struct FrameError {
    #[from]
    source: serde_json::Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `type 1`: an interim update.
    Update(UpdateFrame),
    /// `type 2`: the terminal frame of the invocation.
    Completion(CompletionFrame),
    /// Pings, invocation-complete markers, and anything else.
    Other { kind: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateFrame {
    /// Set when a new response cursor begins with this frame.
    pub has_cursor: bool,
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionFrame {
    pub value: String,
    pub message: String,
    /// Suggestions carried by the last message of the item, if any.
    pub suggested_responses: Vec<String>,
}

impl CompletionFrame {
    pub fn is_success(&self) -> bool {
        self.value == "Success"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    SearchQuery {
        text: String,
    },
    SearchResult {
        text: String,
        hidden_text: String,
    },
    Loader {
        text: String,
    },
    Progress {
        text: String,
        content_origin: String,
    },
    GenerateContent {
        content_type: String,
        text: String,
        message_id: String,
        request_id: String,
    },
    Answer(AnswerMessage),
    Unknown {
        message_type: String,
        raw: Value,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerMessage {
    /// Cumulative answer text so far. Absent on messages that only carry
    /// suggestions or cards.
    pub text: Option<String>,
    pub content_origin: String,
    pub suggested_responses: Vec<String>,
    /// First text block of the first adaptive card, where citation markers
    /// live.
    pub card_text: Option<String>,
}

impl AnswerMessage {
    pub fn is_apology(&self) -> bool {
        self.content_origin == "Apology"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchResultItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageFields {
    message_type: Option<String>,
    text: Option<String>,
    hidden_text: Option<String>,
    content_origin: Option<String>,
    content_type: Option<String>,
    message_id: Option<String>,
    request_id: Option<String>,
    #[serde(default)]
    suggested_responses: Vec<SuggestedResponse>,
    #[serde(default)]
    adaptive_cards: Vec<AdaptiveCard>,
}

#[derive(Debug, Deserialize)]
struct SuggestedResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AdaptiveCard {
    #[serde(default)]
    body: Vec<CardBlock>,
}

#[derive(Debug, Deserialize)]
struct CardBlock {
    text: Option<String>,
}

/// Decode one logical frame. Invalid JSON is an error; valid JSON of an
/// unexpected shape is not.
pub fn decode_frame(raw: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = value.get("type").and_then(Value::as_i64).unwrap_or(0);
    let frame = match kind {
        1 => InboundFrame::Update(decode_update(&value)),
        2 => InboundFrame::Completion(decode_completion(&value)),
        other => InboundFrame::Other { kind: other },
    };
    Ok(frame)
}

fn decode_update(value: &Value) -> UpdateFrame {
    let argument = value.pointer("/arguments/0");
    let has_cursor = argument.and_then(|arg| arg.get("cursor")).is_some();
    let message = argument
        .and_then(|arg| arg.pointer("/messages/0"))
        .map(decode_message);
    UpdateFrame {
        has_cursor,
        message,
    }
}

fn decode_completion(value: &Value) -> CompletionFrame {
    let text_at = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let suggested_responses = value
        .pointer("/item/messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| MessageFields::deserialize(message).ok())
        .map(|fields| suggestion_texts(&fields))
        .unwrap_or_default();
    CompletionFrame {
        value: text_at("/item/result/value"),
        message: text_at("/item/result/message"),
        suggested_responses,
    }
}

fn decode_message(raw: &Value) -> ChatMessage {
    let Ok(fields) = MessageFields::deserialize(raw) else {
        return ChatMessage::Unknown {
            message_type: String::new(),
            raw: raw.clone(),
        };
    };
    let text = fields.text.clone().unwrap_or_default();
    let hidden_text = fields.hidden_text.clone().unwrap_or_default();
    match fields.message_type.as_deref() {
        None => ChatMessage::Answer(AnswerMessage {
            suggested_responses: suggestion_texts(&fields),
            card_text: fields
                .adaptive_cards
                .first()
                .and_then(|card| card.body.first())
                .and_then(|block| block.text.clone()),
            content_origin: fields.content_origin.unwrap_or_default(),
            text: fields.text,
        }),
        Some("InternalSearchQuery") => ChatMessage::SearchQuery { text: hidden_text },
        Some("InternalSearchResult") => ChatMessage::SearchResult { text, hidden_text },
        Some("InternalLoaderMessage") => ChatMessage::Loader {
            text: fields
                .hidden_text
                .or(fields.text)
                .unwrap_or_else(|| raw.to_string()),
        },
        Some("Progress") => ChatMessage::Progress {
            text,
            content_origin: fields.content_origin.unwrap_or_default(),
        },
        Some("GenerateContentQuery") => ChatMessage::GenerateContent {
            content_type: fields.content_type.unwrap_or_default(),
            text,
            message_id: fields.message_id.unwrap_or_default(),
            request_id: fields.request_id.unwrap_or_default(),
        },
        Some(other) => ChatMessage::Unknown {
            message_type: other.to_string(),
            raw: raw.clone(),
        },
    }
}

fn suggestion_texts(fields: &MessageFields) -> Vec<String> {
    fields
        .suggested_responses
        .iter()
        .map(|response| response.text.clone())
        .filter(|text| !text.is_empty())
        .collect()
}

/// Parse the JSON carried by an `InternalSearchResult`.
///
/// The payload is a list of groups, each a list of `{title, url}` items;
/// newer revisions key the groups by name instead. Groups that are not lists
/// are skipped. Returns `None` when the text is not one of those shapes.
pub fn parse_search_result_items(text: &str) -> Option<Vec<SearchResultItem>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let groups: Vec<&Value> = match &value {
        Value::Array(groups) => groups.iter().collect(),
        Value::Object(groups) => groups.values().collect(),
        _ => return None,
    };
    let mut items = Vec::new();
    for group in groups {
        let Some(entries) = group.as_array() else {
            continue;
        };
        for entry in entries {
            if let Ok(item) = SearchResultItem::deserialize(entry) {
                if !item.url.is_empty() {
                    items.push(item);
                }
            }
        }
    }
    Some(items)
}
