// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! On-disk HTTP response cache.

Entries live under `<root>/http/<sha256-of-url>` with a JSON sidecar
(`.meta`) recording the URL, validator headers, and timestamps. Bodies are
written to a temporary file and renamed into place, so a partial response
is never observable. Freshness honors `Cache-Control: max-age`; absent
that, a heuristic based on `Last-Modified` age applies. Eviction is LRU by
access time and only runs when explicitly invoked with a size ceiling.
*/

use {
    crate::error::Result,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{
        collections::BTreeMap,
        fs,
        io::Write,
        path::{Path, PathBuf},
    },
    tracing::debug,
};

/// Heuristic freshness: a tenth of the entry's age at storage time,
/// capped at one day.
const HEURISTIC_FRESH_DIVISOR: i64 = 10;
const HEURISTIC_FRESH_MAX_SECS: i64 = 86_400;

/// Sidecar metadata for one cached response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntryMetadata {
    pub url: String,

    /// Selected response headers (lowercased names): `etag`,
    /// `last-modified`, `cache-control`, `date`.
    pub headers: BTreeMap<String, String>,

    /// Unix seconds when the body was stored or last revalidated.
    pub stored_at: i64,

    /// Unix seconds of the last read. Drives LRU eviction.
    pub last_access: i64,
}

impl EntryMetadata {
    /// `max-age` seconds from `Cache-Control`, if present.
    fn max_age(&self) -> Option<i64> {
        let cache_control = self.headers.get("cache-control")?;

        cache_control
            .split(',')
            .map(str::trim)
            .find_map(|directive| directive.strip_prefix("max-age="))
            .and_then(|v| v.parse::<i64>().ok())
    }

    fn last_modified_epoch(&self) -> Option<i64> {
        let value = self.headers.get("last-modified")?;
        mailparse::dateparse(value).ok()
    }

    /// Whether the entry may be served without revalidation at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        let age = now - self.stored_at;

        if let Some(max_age) = self.max_age() {
            return age < max_age;
        }

        if let Some(last_modified) = self.last_modified_epoch() {
            let fresh_for = ((self.stored_at - last_modified) / HEURISTIC_FRESH_DIVISOR)
                .clamp(0, HEURISTIC_FRESH_MAX_SECS);
            return age < fresh_for;
        }

        false
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(String::as_str)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified").map(String::as_str)
    }

    /// Whether the origin forbade storing this response.
    pub fn is_no_store(headers: &BTreeMap<String, String>) -> bool {
        headers
            .get("cache-control")
            .map(|v| v.split(',').any(|d| d.trim() == "no-store"))
            .unwrap_or(false)
    }
}

/// A cache hit: the body path plus its metadata.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub body_path: PathBuf,
    pub metadata: EntryMetadata,
}

/// The cache itself. Cheap to clone paths around; all state is on disk.
#[derive(Clone, Debug)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `<dir>/http`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().join("http");
        fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn body_path(&self, url: &str) -> PathBuf {
        self.root.join(Self::key(url))
    }

    fn meta_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("{}.meta", Self::key(url)))
    }

    /// Look up an entry, updating its access time.
    pub fn lookup(&self, url: &str, now: i64) -> Result<Option<CachedEntry>> {
        let body_path = self.body_path(url);
        let meta_path = self.meta_path(url);

        if !body_path.is_file() || !meta_path.is_file() {
            return Ok(None);
        }

        let mut metadata: EntryMetadata = serde_json::from_slice(&fs::read(&meta_path)?)?;
        metadata.last_access = now;
        self.write_meta(url, &metadata)?;

        Ok(Some(CachedEntry {
            body_path,
            metadata,
        }))
    }

    /// Store a response body and its headers.
    ///
    /// Responses marked `no-store` are not written. Returns the body path
    /// when stored.
    pub fn store(
        &self,
        url: &str,
        headers: BTreeMap<String, String>,
        body: &[u8],
        now: i64,
    ) -> Result<Option<PathBuf>> {
        if EntryMetadata::is_no_store(&headers) {
            debug!(url, "response is no-store; not caching");
            return Ok(None);
        }

        let body_path = self.body_path(url);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(body)?;
        tmp.persist(&body_path).map_err(|e| e.error)?;

        self.write_meta(
            url,
            &EntryMetadata {
                url: url.to_string(),
                headers,
                stored_at: now,
                last_access: now,
            },
        )?;

        Ok(Some(body_path))
    }

    /// Mark an entry revalidated (after a `304 Not Modified`).
    pub fn refresh(&self, url: &str, now: i64) -> Result<()> {
        if let Some(entry) = self.lookup(url, now)? {
            let mut metadata = entry.metadata;
            metadata.stored_at = now;
            self.write_meta(url, &metadata)?;
        }

        Ok(())
    }

    fn write_meta(&self, url: &str, metadata: &EntryMetadata) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&serde_json::to_vec(metadata)?)?;
        tmp.persist(self.meta_path(url)).map_err(|e| e.error)?;

        Ok(())
    }

    /// Evict least-recently-used entries until total body size is at most
    /// `max_bytes`.
    pub fn evict(&self, max_bytes: u64) -> Result<()> {
        let mut entries = Vec::new();
        let mut total = 0u64;

        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();

            if path.extension().map(|e| e == "meta").unwrap_or(false) {
                continue;
            }

            let size = dir_entry.metadata()?.len();
            total += size;

            let meta_path = path.with_extension("meta");
            let last_access = fs::read(&meta_path)
                .ok()
                .and_then(|data| serde_json::from_slice::<EntryMetadata>(&data).ok())
                .map(|m| m.last_access)
                .unwrap_or(0);

            entries.push((last_access, size, path, meta_path));
        }

        if total <= max_bytes {
            return Ok(());
        }

        entries.sort();

        for (_, size, body_path, meta_path) in entries {
            if total <= max_bytes {
                break;
            }

            debug!(path = %body_path.display(), "evicting cache entry");
            let _ = fs::remove_file(&body_path);
            let _ = fs::remove_file(&meta_path);
            total -= size;
        }

        Ok(())
    }
}
