use serde::{Deserialize, Serialize};

pub const BASE_OPTION_SETS: &[&str] = &[
    "nlu_direct_response_filter",
    "deepleo",
    "disable_emoji_spoken_text",
    "responsible_ai_policy_235",
    "enablemm",
    "iycapbing",
    "iyxapbing",
    "dv3sugg",
    "iyoloxap",
    "iyoloneutral",
    "gencontentv3",
    "nojbf",
];

pub const NO_SEARCH_OPTION_SET: &str = "nosearchall";
pub const GPT4_TURBO_OPTION_SET: &str = "dlgpt4t";

pub const SLICE_IDS: &[&str] = &[
    "winmuid1tf",
    "newmma-prod",
    "imgchatgptv2",
    "tts2",
    "voicelang2",
    "anssupfotest",
    "emptyoson",
    "tempcacheread",
    "temptacache",
    "ctrlworkpay",
    "winlongmsg2tf",
    "628fabocs0",
    "531rai268s0",
    "602refusal",
    "621alllocs0",
    "621docxfmtho",
    "621preclsvn",
    "330uaug",
    "529rweas0",
    "0626snptrcs0",
    "619dagslnv1nr",
];

pub const ALLOWED_MESSAGE_TYPES: &[&str] = &[
    "ActionRequest",
    "Chat",
    "Context",
    "InternalSearchQuery",
    "InternalSearchResult",
    "Disengaged",
    "InternalLoaderMessage",
    "Progress",
    "RenderCardRequest",
    "AdsQuery",
    "SemanticSerp",
    "GenerateContentQuery",
    "SearchQuery",
];

/// Labels the outbound message type is drawn from, one per turn.
pub const MESSAGE_TYPE_LABELS: &[&str] = &["Chat", "SearchQuery"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStyle {
    #[default]
    Creative,
    Balanced,
    Precise,
}

impl ConversationStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creative => "Creative",
            Self::Balanced => "Balanced",
            Self::Precise => "Precise",
        }
    }

    pub fn option_set(self) -> &'static str {
        match self {
            Self::Creative => "h3imaginative",
            Self::Balanced => "galileo",
            Self::Precise => "h3precise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "creative" => Some(Self::Creative),
            "balanced" => Some(Self::Balanced),
            "precise" => Some(Self::Precise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plugin {
    Suno,
}

impl Plugin {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "suno" => Some(Self::Suno),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Suno => "Suno",
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Suno => "c310c353-b9f0-4d76-ab0d-1dd5e979cf68",
        }
    }

    pub fn category(self) -> u32 {
        match self {
            Self::Suno => 1,
        }
    }

    pub fn option_sets(self) -> &'static [&'static str] {
        match self {
            Self::Suno => &["014CB21D"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationHint {
    pub country: String,
    pub state: String,
    pub city: String,
    #[serde(rename = "timezoneoffset")]
    pub timezone_offset: i32,
    #[serde(rename = "countryConfidence")]
    pub country_confidence: i32,
    #[serde(rename = "Center")]
    pub center: LatLng,
    #[serde(rename = "RegionType")]
    pub region_type: i32,
    #[serde(rename = "SourceType")]
    pub source_type: i32,
}

fn hint(country: &str, state: &str, city: &str, tz: i32, lat: f64, long: f64) -> LocationHint {
    LocationHint {
        country: country.to_string(),
        state: state.to_string(),
        city: city.to_string(),
        timezone_offset: tz,
        country_confidence: 8,
        center: LatLng {
            latitude: lat,
            longitude: long,
        },
        region_type: 2,
        source_type: 1,
    }
}

/// Location hints sent with a message. Unknown locales fall back to `en-US`.
pub fn location_hints(locale: &str) -> Vec<LocationHint> {
    let hint = match locale {
        "zh-CN" => hint("China", "", "Beijing", 8, 39.9042, 116.4074),
        "en-GB" => hint("United Kingdom", "", "London", 0, 51.5074, -0.1278),
        "en-IE" => hint("Norway", "", "Oslo", 1, 59.9139, 10.7522),
        _ => hint(
            "United States",
            "California",
            "Los Angeles",
            8,
            34.0536909,
            -118.242766,
        ),
    };
    vec![hint]
}

/// The region code is the last two characters of the locale.
pub fn region_for_locale(locale: &str) -> String {
    let chars: Vec<char> = locale.chars().collect();
    let start = chars.len().saturating_sub(2);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_parse_is_case_insensitive() {
        assert_eq!(ConversationStyle::parse(" precise "), Some(ConversationStyle::Precise));
        assert_eq!(ConversationStyle::parse("Creative"), Some(ConversationStyle::Creative));
        assert_eq!(ConversationStyle::parse("loud"), None);
    }

    #[test]
    fn unknown_locale_uses_us_hint() {
        assert_eq!(location_hints("fr-FR")[0].city, "Los Angeles");
        assert_eq!(location_hints("zh-CN")[0].country, "China");
    }

    #[test]
    fn region_is_locale_suffix() {
        assert_eq!(region_for_locale("en-US"), "US");
        assert_eq!(region_for_locale("x"), "x");
    }

    #[test]
    fn location_hint_uses_upstream_field_names() -> anyhow::Result<()> {
        let value = serde_json::to_value(&location_hints("en-GB")[0])?;
        assert_eq!(value["timezoneoffset"], 0);
        assert_eq!(value["countryConfidence"], 8);
        assert_eq!(value["Center"]["Latitude"], 51.5074);
        assert_eq!(value["RegionType"], 2);
        Ok(())
    }
}
