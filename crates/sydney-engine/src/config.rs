//! Client configuration: an optional JSON file, overlaid by `SYDNEY_*`
//! environment variables. CLI flags are applied on top by the binary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sydney_contracts::cookies::{parse_cookie_header, CookieMap, CookieStore, FileCookieStore};
use sydney_contracts::session::SessionSettings;

use crate::challenge::ChallengeStrategy;
use crate::error::{Result, SydneyError};

pub const DEFAULT_COOKIES_FILE: &str = "cookies.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub session: SessionSettings,
    pub bypass_server: Option<String>,
    pub challenge: ChallengeStrategy,
    /// Browser executable for the interactive challenge. Well-known names on
    /// `PATH` are tried when unset.
    pub browser: Option<PathBuf>,
    /// JSON array of option sets that replaces the computed list.
    pub debug_option_sets_file: Option<PathBuf>,
    pub cookies_file: PathBuf,
    /// Cookie string used instead of the cookie file's content.
    pub cookie_header: Option<String>,
    pub max_challenge_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            bypass_server: None,
            challenge: ChallengeStrategy::default(),
            browser: None,
            debug_option_sets_file: None,
            cookies_file: PathBuf::from(DEFAULT_COOKIES_FILE),
            cookie_header: None,
            max_challenge_retries: 1,
        }
    }
}

impl ClientConfig {
    /// Read `path` if given (a missing file is an error), then apply the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(non_empty_env)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            SydneyError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|err| SydneyError::Config(format!("invalid {}: {err}", path.display())))
    }

    /// Overlay environment values. `lookup` returns trimmed, non-empty values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(proxy) = lookup("SYDNEY_PROXY")
            .or_else(|| lookup("HTTPS_PROXY"))
            .or_else(|| lookup("HTTP_PROXY"))
        {
            self.session.proxy = Some(proxy);
        }
        if let Some(domain) = lookup("SYDNEY_WSS_DOMAIN") {
            self.session.wss_domain = Some(domain);
        }
        if let Some(url) = lookup("SYDNEY_CREATE_CONVERSATION_URL") {
            self.session.create_conversation_url = Some(url);
        }
        if let Some(server) = lookup("SYDNEY_BYPASS_SERVER") {
            self.bypass_server = Some(server);
        }
        if let Some(browser) = lookup("SYDNEY_BROWSER") {
            self.browser = Some(PathBuf::from(browser));
        }
        if let Some(cookies) = lookup("SYDNEY_COOKIES") {
            self.cookie_header = Some(cookies);
        }
        if let Some(path) = lookup("SYDNEY_DEBUG_OPTIONS_SETS") {
            self.debug_option_sets_file = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("SYDNEY_CHALLENGE") {
            self.challenge = ChallengeStrategy::parse(&raw).ok_or_else(|| {
                SydneyError::Config(format!("unknown challenge strategy {raw}"))
            })?;
        }
        Ok(())
    }

    /// Session settings with the debug option-set file, if any, read in.
    pub fn session_settings(&self) -> Result<SessionSettings> {
        let mut settings = self.session.clone();
        if let Some(path) = &self.debug_option_sets_file {
            let raw = fs::read_to_string(path).map_err(|err| {
                SydneyError::Config(format!("cannot read {}: {err}", path.display()))
            })?;
            let sets: Vec<String> = serde_json::from_str(&raw).map_err(|err| {
                SydneyError::Config(format!(
                    "{} must be a JSON array of strings: {err}",
                    path.display()
                ))
            })?;
            settings.debug_option_sets = Some(sets);
        }
        Ok(settings)
    }

    pub fn cookie_store(&self) -> FileCookieStore {
        FileCookieStore::new(&self.cookies_file)
    }

    /// The cookie override when set, otherwise whatever `store` holds.
    pub fn initial_cookies(&self, store: &dyn CookieStore) -> Result<CookieMap> {
        if let Some(header) = &self.cookie_header {
            return Ok(parse_cookie_header(header));
        }
        store
            .load()
            .map_err(|err| SydneyError::Config(format!("cannot load cookies: {err:#}")))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
