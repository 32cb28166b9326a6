//! Outbound `type 4` invocation envelope.

use serde::Serialize;

use crate::session::LocationHint;

pub const PREVIOUS_MESSAGE_ID: &str = "discover-web--page-ping-mriduna-----";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub arguments: Vec<ChatArgument>,
    pub invocation_id: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatArgument {
    pub source: String,
    pub options_sets: Vec<String>,
    pub allowed_message_types: Vec<String>,
    pub slice_ids: Vec<String>,
    pub verbosity: String,
    pub scenario: String,
    pub plugins: Vec<PluginRef>,
    pub trace_id: String,
    pub request_id: String,
    pub is_start_of_session: bool,
    pub message: ChatMessageBody,
    pub tone: String,
    /// Omitted when empty; upstream rejects an explicit null.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_signature: Option<String>,
    pub participant: Participant,
    pub spoken_text_mode: String,
    pub conversation_id: String,
    pub previous_messages: Vec<PreviousMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageBody {
    pub locale: String,
    pub market: String,
    pub region: String,
    pub location_hints: Vec<LocationHint>,
    pub author: String,
    pub input_method: String,
    pub text: String,
    pub message_type: String,
    pub request_id: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginRef {
    pub id: String,
    pub category: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousMessage {
    pub author: String,
    pub description: String,
    pub context_type: String,
    pub message_type: String,
    pub message_id: String,
}

impl PreviousMessage {
    /// Prior chat text travels as a single synthetic web-page context message.
    pub fn web_page_context(description: impl Into<String>) -> Self {
        Self {
            author: "user".to_string(),
            description: description.into(),
            context_type: "WebPage".to_string(),
            message_type: "Context".to_string(),
            message_id: PREVIOUS_MESSAGE_ID.to_string(),
        }
    }
}
