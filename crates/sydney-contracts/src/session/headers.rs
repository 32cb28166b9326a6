//! Browser header profiles.
//!
//! The upstream fingerprints clients by their headers, so these mirror what a
//! desktop Edge sends for each kind of request.

pub type HeaderList = Vec<(String, String)>;

pub const SEARCH_REFERER: &str = "https://www.bing.com/search?q=Bing+AI&showconv=1";

const EDGE_113_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/113.0.0.0 Safari/537.36 Edg/113.0.1774.50";
const EDGE_112_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36 Edg/112.0.1722.46";

/// Per-session identity values shared by every profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub forwarded_for: String,
    pub sec_ms_gec: String,
    pub client_request_id: String,
}

pub(crate) fn chat_profile(identity: &BrowserIdentity, cookie: &str) -> HeaderList {
    let mut headers = pairs(&[
        ("accept", "application/json"),
        ("accept-language", "en-US,en;q=0.9"),
        ("content-type", "application/json"),
        (
            "sec-ch-ua",
            r#""Microsoft Edge";v="113", "Chromium";v="113", "Not-A.Brand";v="24""#,
        ),
        ("sec-ch-ua-arch", r#""x86""#),
        ("sec-ch-ua-bitness", r#""64""#),
        ("sec-ch-ua-full-version", r#""113.0.1774.50""#),
        (
            "sec-ch-ua-full-version-list",
            r#""Microsoft Edge";v="113.0.1774.50", "Chromium";v="113.0.5672.127", "Not-A.Brand";v="24.0.0.0""#,
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-model", r#""""#),
        ("sec-ch-ua-platform", r#""Windows""#),
        ("sec-ch-ua-platform-version", r#""15.0.0""#),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-origin"),
        ("sec-ms-gec-version", "1-115.0.1866.1"),
        (
            "x-ms-useragent",
            "azsdk-js-api-client-factory/1.0.0-beta.1 core-rest-pipeline/1.10.0 OS/Win32",
        ),
        ("user-agent", EDGE_113_UA),
        ("referer", SEARCH_REFERER),
        ("referrer-policy", "origin-when-cross-origin"),
    ]);
    headers.push(("sec-ms-gec".to_string(), identity.sec_ms_gec.clone()));
    headers.push((
        "x-ms-client-request-id".to_string(),
        identity.client_request_id.clone(),
    ));
    push_identity(&mut headers, identity, cookie);
    headers
}

pub(crate) fn create_conversation_profile(identity: &BrowserIdentity, cookie: &str) -> HeaderList {
    let mut headers = pairs(&[
        ("authority", "www.bing.com"),
        ("accept", "application/json"),
        ("accept-language", "en-US,en;q=0.9"),
        ("cache-control", "max-age=0"),
        (
            "sec-ch-ua",
            r#""Chromium";v="110", "Not A(Brand";v="24", "Microsoft Edge";v="110""#,
        ),
        ("sec-ch-ua-arch", r#""x86""#),
        ("sec-ch-ua-bitness", r#""64""#),
        ("sec-ch-ua-full-version", r#""110.0.1587.69""#),
        (
            "sec-ch-ua-full-version-list",
            r#""Chromium";v="110.0.5481.192", "Not A(Brand";v="24.0.0.0", "Microsoft Edge";v="110.0.1587.69""#,
        ),
        ("sec-ch-ua-mobile", r#""?0""#),
        ("sec-ch-ua-model", r#""""#),
        ("sec-ch-ua-platform", r#""Windows""#),
        ("sec-ch-ua-platform-version", r#""15.0.0""#),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", EDGE_112_UA),
        ("x-edge-shopping-flag", "1"),
    ]);
    push_identity(&mut headers, identity, cookie);
    headers
}

pub(crate) fn image_profile(identity: &BrowserIdentity, cookie: &str) -> HeaderList {
    let mut headers = pairs(&[
        ("authority", "www.bing.com"),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
        ("accept-language", "en-US,en;q=0.9"),
        ("cache-control", "no-cache"),
        ("referer", SEARCH_REFERER),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", EDGE_112_UA),
        ("sec-fetch-dest", "iframe"),
    ]);
    push_identity(&mut headers, identity, cookie);
    headers
}

/// Replace or append a header, matching names case-insensitively.
pub fn set_header(headers: &mut HeaderList, name: &str, value: impl Into<String>) {
    let value = value.into();
    if let Some(slot) = headers
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
    {
        slot.1 = value;
        return;
    }
    headers.push((name.to_string(), value));
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn push_identity(headers: &mut HeaderList, identity: &BrowserIdentity, cookie: &str) {
    headers.push(("x-forwarded-for".to_string(), identity.forwarded_for.clone()));
    headers.push(("cookie".to_string(), cookie.to_string()));
}

fn pairs(raw: &[(&str, &str)]) -> HeaderList {
    raw.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
