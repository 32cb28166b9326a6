use std::time::Duration;

use sydney_contracts::conversation::Conversation;
use sydney_contracts::session::SessionContext;
use tracing::{debug, info};

use crate::error::{truncate_text, Result, SydneyError};
use crate::http::{HttpRequest, HttpTransport};

pub const ACCESS_TOKEN_HEADER: &str = "X-Sydney-Encryptedconversationsignature";

const PROVISION_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a conversation and fold any cookies and access token the endpoint
/// hands back into the session.
pub fn provision(http: &dyn HttpTransport, session: &SessionContext) -> Result<Conversation> {
    let request = HttpRequest::get(&session.endpoints.create_conversation)
        .with_headers(session.create_conversation_headers())
        .with_timeout(PROVISION_TIMEOUT);
    let reply = http.execute(request)?;
    if reply.status != 200 {
        return Err(SydneyError::ProvisionFailed {
            status: reply.status,
            body: truncate_text(&reply.body, 512),
        });
    }

    let refreshed = session
        .cookies
        .absorb_set_cookies(reply.header_values("set-cookie"));
    if refreshed > 0 {
        debug!(refreshed, "cookies updated by conversation create");
    }

    let conversation: Conversation = serde_json::from_str(&reply.body)
        .map_err(|err| SydneyError::http("conversation create returned invalid JSON", err))?;
    let conversation = conversation.with_access_token(reply.header(ACCESS_TOKEN_HEADER));

    let result = &conversation.result;
    if !result.is_success() {
        return Err(SydneyError::ProvisionRejected {
            value: result.value.clone(),
            message: result.message.clone(),
        });
    }
    info!(
        conversation_id = conversation.conversation_id.as_str(),
        "created conversation"
    );
    Ok(conversation)
}
