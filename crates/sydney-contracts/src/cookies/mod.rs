//! Cookie strings as the Bing web endpoints expect them.
//!
//! Cookies travel as a single `k=v; k2=v2` header. The jar keeps insertion
//! order so the rendered header is stable across requests.

mod store;

use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;

pub use store::{CookieStore, FileCookieStore, MemoryCookieStore, StoredCookie};

pub type CookieMap = IndexMap<String, String>;

/// Render cookies as `k=v; k2=v2`. Empty maps render to an empty string.
pub fn format_cookie_header(cookies: &CookieMap) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse a `k=v; k2=v2` string.
///
/// Segments are split on `;` and trimmed; each is split at its first `=` so
/// values may themselves contain `=`. Segments without `=` are skipped.
pub fn parse_cookie_header(raw: &str) -> CookieMap {
    let mut cookies = CookieMap::new();
    for segment in raw.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some((name, value)) = segment.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        cookies.insert(name.to_string(), value.trim().to_string());
    }
    cookies
}

/// Extract the `name=value` pair of a `Set-Cookie` header, dropping its
/// attributes.
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Shared, mutable cookie set for one session.
///
/// Clones share the same underlying map, so cookies harvested by one turn are
/// visible to the next.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<Mutex<CookieMap>>,
}

impl CookieJar {
    pub fn new(cookies: CookieMap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cookies)),
        }
    }

    pub fn from_header(raw: &str) -> Self {
        Self::new(parse_cookie_header(raw))
    }

    pub fn snapshot(&self) -> CookieMap {
        self.lock().clone()
    }

    pub fn header(&self) -> String {
        format_cookie_header(&self.lock())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(name.into(), value.into());
    }

    /// Overwrite-by-name merge. Returns the number of cookies that changed.
    pub fn merge(&self, cookies: &CookieMap) -> usize {
        let mut guard = self.lock();
        let mut changed = 0;
        for (name, value) in cookies {
            if guard.get(name) != Some(value) {
                guard.insert(name.clone(), value.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Merge raw `Set-Cookie` header values.
    pub fn absorb_set_cookies<'a>(&self, headers: impl IntoIterator<Item = &'a str>) -> usize {
        let parsed: CookieMap = headers.into_iter().filter_map(parse_set_cookie).collect();
        self.merge(&parsed)
    }

    fn lock(&self) -> MutexGuard<'_, CookieMap> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_joins_pairs_in_insertion_order() {
        let mut cookies = CookieMap::new();
        cookies.insert("_U".to_string(), "abc".to_string());
        cookies.insert("SRCHHPGUSR".to_string(), "x=1".to_string());
        assert_eq!(format_cookie_header(&cookies), "_U=abc; SRCHHPGUSR=x=1");
        assert_eq!(format_cookie_header(&CookieMap::new()), "");
    }

    #[test]
    fn parse_keeps_equals_inside_values() {
        let cookies = parse_cookie_header(" _U=abc ;MUID=1=2=3; junk ;; =nope");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("_U").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("MUID").map(String::as_str), Some("1=2=3"));
    }

    #[test]
    fn set_cookie_drops_attributes() {
        assert_eq!(
            parse_set_cookie("cct=token=; domain=.bing.com; path=/; secure"),
            Some(("cct".to_string(), "token=".to_string()))
        );
        assert_eq!(parse_set_cookie("; path=/"), None);
    }

    #[test]
    fn jar_clones_share_state() {
        let jar = CookieJar::from_header("a=1");
        let other = jar.clone();
        other.insert("b", "2");
        assert_eq!(jar.header(), "a=1; b=2");

        let mut update = CookieMap::new();
        update.insert("a".to_string(), "1".to_string());
        update.insert("c".to_string(), "3".to_string());
        assert_eq!(jar.merge(&update), 1);
        assert_eq!(other.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn absorb_set_cookies_merges_by_name() {
        let jar = CookieJar::from_header("MUID=old");
        let changed = jar.absorb_set_cookies(["MUID=new; path=/", "SUID=M; secure"]);
        assert_eq!(changed, 2);
        assert_eq!(jar.header(), "MUID=new; SUID=M");
    }
}
