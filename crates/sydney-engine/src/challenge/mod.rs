//! Clearing the captcha the upstream injects mid-session.
//!
//! Two strategies share `ChallengeResolver`: driving a local browser to the
//! challenge page, or handing the cookies to a remote bypass service. Either
//! returns the cookie diff; merging and persisting it is up to the caller.

mod browser;
mod bypass;
mod devtools;

use sydney_contracts::cookies::CookieMap;
use sydney_contracts::random::RandomSource;
use sydney_contracts::session::SessionContext;

use crate::cancel::CancelSignal;
use crate::error::{Result, SydneyError};

pub use browser::{BrowserChallenge, CHALLENGE_PAGE_URL, VERIFY_URL_PATTERN};
pub use bypass::{BypassChallenge, BypassRequest, BypassResponse};
pub use devtools::{BrowserLauncher, ChromeLauncher, DevtoolsEvent, DevtoolsSession};

/// Cookie the upstream sets once a challenge is cleared.
pub const CLEARED_MARKER_COOKIE: &str = "cct";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStrategy {
    #[default]
    Browser,
    Bypass,
}

impl ChallengeStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "browser" => Some(Self::Browser),
            "bypass" => Some(Self::Bypass),
            _ => None,
        }
    }
}

/// What a resolver needs to know about the blocked turn.
pub struct ChallengeRequest<'a> {
    pub session: &'a SessionContext,
    pub conversation_id: &'a str,
    pub message_id: &'a str,
}

pub trait ChallengeResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Clear the challenge and return the cookies that changed.
    fn resolve(
        &self,
        request: &ChallengeRequest<'_>,
        random: &mut dyn RandomSource,
        cancel: &CancelSignal,
    ) -> Result<CookieMap>;
}

/// A diff only counts if it carries the cleared marker.
pub fn validate_challenge_cookies(diff: CookieMap) -> Result<CookieMap> {
    if !diff.contains_key(CLEARED_MARKER_COOKIE) {
        return Err(SydneyError::InvalidChallengeResult(format!(
            "no cookie named {CLEARED_MARKER_COOKIE} found"
        )));
    }
    Ok(diff)
}

pub(crate) fn new_iframe_id(random: &mut dyn RandomSource) -> String {
    format!("local-gen-{}", random.uuid())
}

#[cfg(test)]
mod tests {
    use sydney_contracts::cookies::parse_cookie_header;
    use sydney_contracts::random::SequenceRandom;

    use super::*;

    #[test]
    fn chrome_launcher_backs_the_browser_strategy() {
        let launcher: Box<dyn BrowserLauncher> =
            Box::new(ChromeLauncher::new(Some("/opt/chrome".into())));
        let resolver = BrowserChallenge::new(launcher);
        assert_eq!(resolver.name(), "browser");
    }

    #[test]
    fn marker_cookie_is_required() {
        assert!(validate_challenge_cookies(parse_cookie_header("cct=ok; _U=x")).is_ok());
        let err = validate_challenge_cookies(parse_cookie_header("_U=x"));
        assert!(matches!(err, Err(SydneyError::InvalidChallengeResult(_))));
    }

    #[test]
    fn strategy_parse_is_case_insensitive() {
        assert_eq!(ChallengeStrategy::parse(" Bypass "), Some(ChallengeStrategy::Bypass));
        assert_eq!(ChallengeStrategy::parse("browser"), Some(ChallengeStrategy::Browser));
        assert_eq!(ChallengeStrategy::parse("manual"), None);
    }

    #[test]
    fn iframe_ids_are_local_gen_prefixed() {
        let mut random = SequenceRandom::new(vec![0], 0);
        assert_eq!(
            new_iframe_id(&mut random),
            "local-gen-00000000-0000-4000-8000-000000000000"
        );
    }
}
