use sydney_contracts::conversation::Conversation;
use sydney_contracts::random::RandomSource;
use sydney_contracts::session::{SessionContext, ALLOWED_MESSAGE_TYPES, MESSAGE_TYPE_LABELS};
use sydney_contracts::wire::outbound::{
    ChatArgument, ChatMessageBody, ChatRequest, Participant, PluginRef, PreviousMessage,
};

use crate::error::{Result, SydneyError};

/// One user turn, built fresh for every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTurn {
    pub prompt: String,
    pub prior_context: String,
    pub image_url: Option<String>,
    pub request_id: String,
    pub trace_id: String,
}

impl OutboundTurn {
    pub fn new(
        prompt: impl Into<String>,
        prior_context: impl Into<String>,
        image_url: Option<String>,
        random: &mut dyn RandomSource,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            prior_context: prior_context.into(),
            image_url: image_url.filter(|url| !url.trim().is_empty()),
            request_id: random.uuid().to_string(),
            trace_id: random.hex(16),
        }
    }
}

pub fn build_request(
    session: &SessionContext,
    conversation: &Conversation,
    turn: &OutboundTurn,
    random: &mut dyn RandomSource,
) -> ChatRequest {
    let message = ChatMessageBody {
        locale: session.locale.clone(),
        market: session.locale.clone(),
        region: session.region(),
        location_hints: session.location_hints.clone(),
        author: "user".to_string(),
        input_method: "Keyboard".to_string(),
        text: turn.prompt.clone(),
        message_type: random.pick(MESSAGE_TYPE_LABELS).to_string(),
        request_id: turn.request_id.clone(),
        message_id: turn.request_id.clone(),
        image_url: turn.image_url.clone(),
    };
    let argument = ChatArgument {
        source: "cib".to_string(),
        options_sets: session.option_sets().to_vec(),
        allowed_message_types: ALLOWED_MESSAGE_TYPES
            .iter()
            .map(|kind| kind.to_string())
            .collect(),
        slice_ids: session.slice_ids.clone(),
        verbosity: "verbose".to_string(),
        scenario: "SERP".to_string(),
        plugins: session
            .plugins
            .iter()
            .map(|plugin| PluginRef {
                id: plugin.id().to_string(),
                category: plugin.category(),
            })
            .collect(),
        trace_id: turn.trace_id.clone(),
        request_id: turn.request_id.clone(),
        is_start_of_session: true,
        message,
        tone: session.style.as_str().to_string(),
        conversation_signature: Some(conversation.conversation_signature.clone())
            .filter(|signature| !signature.is_empty()),
        participant: Participant {
            id: conversation.client_id.clone(),
        },
        spoken_text_mode: "None".to_string(),
        conversation_id: conversation.conversation_id.clone(),
        previous_messages: vec![PreviousMessage::web_page_context(&turn.prior_context)],
    };
    ChatRequest {
        arguments: vec![argument],
        invocation_id: "0".to_string(),
        target: "chat".to_string(),
        kind: 4,
    }
}

pub fn encode_request(request: &ChatRequest) -> Result<String> {
    serde_json::to_string(request)
        .map_err(|err| SydneyError::Other(format!("failed to serialize chat request: {err}")))
}
