use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::CookieMap;

/// One entry of `cookies.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// Persistence for the session cookie jar.
///
/// `save` merges into whatever is already stored, so concurrent sessions that
/// refresh different cookies do not clobber each other.
pub trait CookieStore: Send + Sync {
    fn load(&self) -> anyhow::Result<CookieMap>;
    fn save(&self, cookies: &CookieMap) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileCookieStore {
    path: PathBuf,
}

impl FileCookieStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CookieStore for FileCookieStore {
    /// A missing file is an empty jar; a corrupt one is an error.
    fn load(&self) -> anyhow::Result<CookieMap> {
        if !self.path.exists() {
            return Ok(CookieMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(CookieMap::new());
        }
        let rows: Vec<StoredCookie> = serde_json::from_str(&raw).map_err(|err| {
            anyhow::anyhow!("invalid cookie file {}: {err}", self.path.display())
        })?;
        Ok(rows_to_map(rows))
    }

    fn save(&self, cookies: &CookieMap) -> anyhow::Result<()> {
        let mut on_disk = read_rows(&self.path).map(rows_to_map).unwrap_or_default();
        for (name, value) in cookies {
            on_disk.insert(name.clone(), value.clone());
        }
        write_rows(&self.path, &on_disk)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    cookies: Mutex<CookieMap>,
}

impl MemoryCookieStore {
    pub fn new(cookies: CookieMap) -> Self {
        Self {
            cookies: Mutex::new(cookies),
        }
    }
}

impl CookieStore for MemoryCookieStore {
    fn load(&self) -> anyhow::Result<CookieMap> {
        let guard = self
            .cookies
            .lock()
            .map_err(|_| anyhow::anyhow!("cookie store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, cookies: &CookieMap) -> anyhow::Result<()> {
        let mut guard = self
            .cookies
            .lock()
            .map_err(|_| anyhow::anyhow!("cookie store lock poisoned"))?;
        for (name, value) in cookies {
            guard.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

fn rows_to_map(rows: Vec<StoredCookie>) -> CookieMap {
    rows.into_iter()
        .filter(|row| !row.name.trim().is_empty())
        .map(|row| (row.name, row.value))
        .collect()
}

fn read_rows(path: &Path) -> Option<Vec<StoredCookie>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_rows(path: &Path, cookies: &CookieMap) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rows: Vec<StoredCookie> = cookies
        .iter()
        .map(|(name, value)| StoredCookie {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    std::fs::write(path, serde_json::to_string_pretty(&rows)?)?;
    Ok(())
}
