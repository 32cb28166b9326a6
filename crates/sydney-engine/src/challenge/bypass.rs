use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sydney_contracts::cookies::{parse_cookie_header, CookieMap};
use sydney_contracts::random::RandomSource;
use tracing::{debug, info};

use super::{new_iframe_id, validate_challenge_cookies, ChallengeRequest, ChallengeResolver};
use crate::cancel::CancelSignal;
use crate::error::{truncate_text, Result, SydneyError};
use crate::http::{HttpRequest, HttpTransport};

const BYPASS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassRequest {
    #[serde(rename = "IG")]
    pub ig: String,
    pub cookies: String,
    #[serde(rename = "iframeid")]
    pub iframe_id: String,
    #[serde(rename = "convId")]
    pub conversation_id: String,
    #[serde(rename = "rid")]
    pub message_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BypassResponse {
    pub result: BypassResult,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BypassResult {
    pub cookies: String,
    pub screenshot: String,
}

/// Hands the session cookies to an operator-run bypass service that solves
/// the challenge remotely.
pub struct BypassChallenge {
    server: String,
    http: Arc<dyn HttpTransport>,
}

impl BypassChallenge {
    pub fn new(server: impl Into<String>, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            server: server.into(),
            http,
        }
    }
}

impl ChallengeResolver for BypassChallenge {
    fn name(&self) -> &'static str {
        "bypass"
    }

    fn resolve(
        &self,
        request: &ChallengeRequest<'_>,
        random: &mut dyn RandomSource,
        cancel: &CancelSignal,
    ) -> Result<CookieMap> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(SydneyError::BypassFailed(
                "no bypass server specified".to_string(),
            ));
        }
        cancel.check()?;
        let payload = BypassRequest {
            ig: random.hex(16).to_uppercase(),
            cookies: request.session.cookies.header(),
            iframe_id: new_iframe_id(random),
            conversation_id: request.conversation_id.to_string(),
            message_id: request.message_id.to_string(),
        };
        debug!(
            conversation_id = request.conversation_id,
            iframe_id = payload.iframe_id.as_str(),
            "requesting captcha bypass"
        );
        let body = serde_json::to_value(&payload)
            .map_err(|err| SydneyError::BypassFailed(format!("cannot encode request: {err}")))?;
        let reply = self
            .http
            .execute(HttpRequest::post_json(server, body).with_timeout(BYPASS_TIMEOUT))
            .map_err(|err| {
                SydneyError::BypassFailed(format!(
                    "cannot communicate with captcha bypass server: {err}"
                ))
            })?;
        cancel.check()?;
        debug!(body = truncate_text(&reply.body, 512), "bypass response");

        let response: BypassResponse = serde_json::from_str(&reply.body).map_err(|err| {
            SydneyError::BypassFailed(format!(
                "cannot decode bypass response ({}): {err}",
                reply.status
            ))
        })?;
        if !response.error.is_empty() {
            return Err(SydneyError::BypassFailed(response.error));
        }

        let diff = parse_cookie_header(&response.result.cookies);
        info!(
            cookies = ?diff.keys().collect::<Vec<_>>(),
            "bypass server returned cookies"
        );
        validate_challenge_cookies(diff).map_err(|err| match err {
            SydneyError::InvalidChallengeResult(detail) if !response.result.screenshot.is_empty() => {
                SydneyError::InvalidChallengeResult(format!(
                    "{detail}; screenshot: {}{}",
                    server.trim_end_matches('/'),
                    response.result.screenshot
                ))
            }
            other => other,
        })
    }
}
