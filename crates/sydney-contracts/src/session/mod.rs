//! Per-client session state: locale, style, feature flags, computed option
//! sets, browser identity, and the shared cookie jar.

mod headers;
mod options;

use serde::{Deserialize, Serialize};

use crate::cookies::CookieJar;
use crate::random::RandomSource;

pub use headers::{header_value, set_header, BrowserIdentity, HeaderList, SEARCH_REFERER};
pub use options::{
    location_hints, region_for_locale, ConversationStyle, LatLng, LocationHint, Plugin,
    ALLOWED_MESSAGE_TYPES, BASE_OPTION_SETS, GPT4_TURBO_OPTION_SET, MESSAGE_TYPE_LABELS,
    NO_SEARCH_OPTION_SET, SLICE_IDS,
};

pub const DEFAULT_LOCALE: &str = "en-US";
pub const DEFAULT_CHAT_HUB_URL: &str = "wss://sydney.bing.com/sydney/ChatHub";
pub const DEFAULT_CREATE_CONVERSATION_URL: &str =
    "https://edgeservices.bing.com/edgesvc/turing/conversation/create";

/// User-facing knobs a session is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub style: ConversationStyle,
    pub locale: String,
    pub no_search: bool,
    pub gpt4_turbo: bool,
    pub plugins: Vec<Plugin>,
    pub wss_domain: Option<String>,
    pub create_conversation_url: Option<String>,
    pub proxy: Option<String>,
    /// Replaces the computed option sets wholesale when non-empty.
    pub debug_option_sets: Option<Vec<String>>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            style: ConversationStyle::default(),
            locale: DEFAULT_LOCALE.to_string(),
            no_search: false,
            gpt4_turbo: false,
            plugins: Vec::new(),
            wss_domain: None,
            create_conversation_url: None,
            proxy: None,
            debug_option_sets: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub chat_hub: String,
    pub create_conversation: String,
}

impl Endpoints {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        let chat_hub = match non_empty(settings.wss_domain.as_deref()) {
            Some(domain) => format!("wss://{domain}/sydney/ChatHub"),
            None => DEFAULT_CHAT_HUB_URL.to_string(),
        };
        let create_conversation = non_empty(settings.create_conversation_url.as_deref())
            .unwrap_or(DEFAULT_CREATE_CONVERSATION_URL)
            .to_string();
        Self {
            chat_hub,
            create_conversation,
        }
    }
}

/// Everything a turn needs to know about the client it runs under.
///
/// Cloning shares the cookie jar; every other field is copied.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub locale: String,
    pub style: ConversationStyle,
    pub no_search: bool,
    pub gpt4_turbo: bool,
    pub plugins: Vec<Plugin>,
    pub slice_ids: Vec<String>,
    pub location_hints: Vec<LocationHint>,
    pub cookies: CookieJar,
    pub proxy: Option<String>,
    pub endpoints: Endpoints,
    option_sets: Vec<String>,
    debug_option_sets: Option<Vec<String>>,
    identity: BrowserIdentity,
}

impl SessionContext {
    pub fn new(settings: SessionSettings, cookies: CookieJar, random: &mut dyn RandomSource) -> Self {
        let identity = BrowserIdentity {
            forwarded_for: format!("1.0.0.{}", random.below(255) + 1),
            sec_ms_gec: random.hex(32),
            client_request_id: random.uuid().to_string(),
        };
        let endpoints = Endpoints::from_settings(&settings);
        let locale = non_empty(Some(&settings.locale))
            .unwrap_or(DEFAULT_LOCALE)
            .to_string();
        let mut session = Self {
            location_hints: location_hints(&locale),
            locale,
            style: settings.style,
            no_search: settings.no_search,
            gpt4_turbo: settings.gpt4_turbo,
            plugins: settings.plugins,
            slice_ids: SLICE_IDS.iter().map(|id| id.to_string()).collect(),
            cookies,
            proxy: settings.proxy,
            endpoints,
            option_sets: Vec::new(),
            debug_option_sets: settings.debug_option_sets,
            identity,
        };
        session.recompute_option_sets();
        session
    }

    /// Per-turn view with style, locale or search overridden. The cookie jar
    /// stays shared with `self`.
    pub fn with_overrides(
        &self,
        style: Option<ConversationStyle>,
        locale: Option<&str>,
        no_search: Option<bool>,
    ) -> Self {
        let mut session = self.clone();
        if let Some(style) = style {
            session.style = style;
        }
        if let Some(locale) = non_empty(locale) {
            session.locale = locale.to_string();
            session.location_hints = location_hints(locale);
        }
        if let Some(no_search) = no_search {
            session.no_search = no_search;
        }
        session.recompute_option_sets();
        session
    }

    pub fn option_sets(&self) -> &[String] {
        &self.option_sets
    }

    pub fn region(&self) -> String {
        region_for_locale(&self.locale)
    }

    pub fn identity(&self) -> &BrowserIdentity {
        &self.identity
    }

    pub fn chat_headers(&self) -> HeaderList {
        headers::chat_profile(&self.identity, &self.cookies.header())
    }

    pub fn create_conversation_headers(&self) -> HeaderList {
        headers::create_conversation_profile(&self.identity, &self.cookies.header())
    }

    pub fn image_headers(&self) -> HeaderList {
        headers::image_profile(&self.identity, &self.cookies.header())
    }

    fn recompute_option_sets(&mut self) {
        self.option_sets = compute_option_sets(
            self.style,
            self.no_search,
            self.gpt4_turbo,
            &self.plugins,
            self.debug_option_sets.as_deref(),
        );
    }
}

/// Base sets, the style marker, then feature and plugin sets. A non-empty
/// override list replaces all of it.
pub fn compute_option_sets(
    style: ConversationStyle,
    no_search: bool,
    gpt4_turbo: bool,
    plugins: &[Plugin],
    override_sets: Option<&[String]>,
) -> Vec<String> {
    if let Some(sets) = override_sets.filter(|sets| !sets.is_empty()) {
        return sets.to_vec();
    }
    let mut sets: Vec<String> = BASE_OPTION_SETS.iter().map(|set| set.to_string()).collect();
    sets.push(style.option_set().to_string());
    if no_search {
        sets.push(NO_SEARCH_OPTION_SET.to_string());
    }
    if gpt4_turbo {
        sets.push(GPT4_TURBO_OPTION_SET.to_string());
    }
    for plugin in plugins {
        for set in plugin.option_sets() {
            if !sets.iter().any(|existing| existing == set) {
                sets.push(set.to_string());
            }
        }
    }
    sets
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
