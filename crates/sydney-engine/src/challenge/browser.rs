use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use sydney_contracts::cookies::{parse_set_cookie, CookieMap};
use sydney_contracts::random::RandomSource;
use tracing::{debug, info};

use super::devtools::BrowserLauncher;
use super::{new_iframe_id, validate_challenge_cookies, ChallengeRequest, ChallengeResolver};
use crate::cancel::CancelSignal;
use crate::error::{Result, SydneyError};

pub const CHALLENGE_PAGE_URL: &str = "https://www.bing.com/turing/captcha/challenge";
pub const VERIFY_URL_PATTERN: &str = "https://www.bing.com/challenge/verify*";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_SLICE: Duration = Duration::from_millis(250);
const COOKIE_DOMAIN: &str = ".bing.com";
const COOKIE_LIFETIME_SECS: u64 = 3600;
const HINT_SCRIPT: &str = "(() => { const add = () => { const info = document.createElement('h3'); \
info.textContent = '\u{2191} Please help click if this cannot be processed automatically!'; \
document.body.appendChild(info); }; \
if (document.body) { add(); } else { document.addEventListener('DOMContentLoaded', add); } })()";

/// Opens the challenge page in a real browser seeded with the session's
/// cookies and waits for the verification response to hand back new ones.
pub struct BrowserChallenge {
    launcher: Box<dyn BrowserLauncher>,
    timeout: Duration,
}

impl BrowserChallenge {
    pub fn new(launcher: Box<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ChallengeResolver for BrowserChallenge {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn resolve(
        &self,
        request: &ChallengeRequest<'_>,
        random: &mut dyn RandomSource,
        cancel: &CancelSignal,
    ) -> Result<CookieMap> {
        cancel.check()?;
        let mut devtools = self.launcher.launch()?;

        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
            + COOKIE_LIFETIME_SECS;
        let cookies: Vec<Value> = request
            .session
            .cookies
            .snapshot()
            .iter()
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "value": value,
                    "domain": COOKIE_DOMAIN,
                    "path": "/",
                    "expires": expires,
                })
            })
            .collect();
        devtools.call("Network.enable", json!({}))?;
        devtools.call("Network.setCookies", json!({ "cookies": cookies }))?;
        devtools.call(
            "Fetch.enable",
            json!({"patterns": [{"urlPattern": VERIFY_URL_PATTERN, "requestStage": "Response"}]}),
        )?;
        let page_url = format!("{CHALLENGE_PAGE_URL}?q=&iframeid={}", new_iframe_id(random));
        devtools.call("Page.navigate", json!({ "url": page_url }))?;
        if let Err(err) = devtools.call("Runtime.evaluate", json!({ "expression": HINT_SCRIPT })) {
            debug!(error = %err, "cannot add challenge hint");
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            cancel.check()?;
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(SydneyError::ChallengeTimeout);
            };
            let Some(event) = devtools.next_event(remaining.min(EVENT_SLICE))? else {
                continue;
            };
            if event.method != "Fetch.requestPaused" {
                continue;
            }
            let diff = cookies_from_paused_response(&event.params);
            if let Some(request_id) = event.params.get("requestId").and_then(Value::as_str) {
                if let Err(err) =
                    devtools.call("Fetch.continueRequest", json!({ "requestId": request_id }))
                {
                    debug!(error = %err, "cannot release verify request");
                }
            }
            info!(
                cookies = ?diff.keys().collect::<Vec<_>>(),
                "captcha verification returned cookies"
            );
            return validate_challenge_cookies(diff);
        }
    }
}

/// `Set-Cookie` pairs from a paused response. DevTools joins repeated
/// headers with newlines.
fn cookies_from_paused_response(params: &Value) -> CookieMap {
    let mut cookies = CookieMap::new();
    let Some(headers) = params.get("responseHeaders").and_then(Value::as_array) else {
        return cookies;
    };
    for header in headers {
        let name = header.get("name").and_then(Value::as_str).unwrap_or_default();
        if !name.eq_ignore_ascii_case("set-cookie") {
            continue;
        }
        let value = header.get("value").and_then(Value::as_str).unwrap_or_default();
        for line in value.lines() {
            if let Some((name, value)) = parse_set_cookie(line) {
                cookies.insert(name, value);
            }
        }
    }
    cookies
}
