//! Scan cache: content hash → prior scan results, per absolute file path.
//!
//! An entry is reusable only while the stored hash equals the hash of the
//! file's current content. Stale entries are replaced wholesale, never merged.

pub mod fs;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

use crate::domain::VulnerabilityRecord;

/// SHA-256 digest of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContentHash({})",
            self.to_hex().chars().take(12).collect::<String>()
        )
    }
}

impl FromStr for ContentHash {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidHash(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CacheError::InvalidHash(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CacheError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Persisted value for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedScan {
    pub content_hash: ContentHash,
    pub vulnerabilities: Vec<VulnerabilityRecord>,
}

/// One cache entry, keyed by absolute file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCacheEntry {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub vulnerabilities: Vec<VulnerabilityRecord>,
}

/// In-memory view of the scan cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanCache {
    entries: BTreeMap<PathBuf, CachedScan>,
}

impl ScanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Results for `path`, only if they were computed from content with `hash`.
    pub fn lookup(&self, path: &Path, hash: &ContentHash) -> Option<&[VulnerabilityRecord]> {
        self.entries
            .get(path)
            .filter(|cached| &cached.content_hash == hash)
            .map(|cached| cached.vulnerabilities.as_slice())
    }

    /// Any entry computed from identical content, regardless of path.
    pub fn lookup_by_hash(&self, hash: &ContentHash) -> Option<(&Path, &[VulnerabilityRecord])> {
        self.entries
            .iter()
            .find(|(_, cached)| &cached.content_hash == hash)
            .map(|(path, cached)| (path.as_path(), cached.vulnerabilities.as_slice()))
    }

    /// Insert or replace the entry for `entry.path`.
    pub fn insert(&mut self, entry: ScanCacheEntry) {
        self.entries.insert(
            entry.path,
            CachedScan {
                content_hash: entry.content_hash,
                vulnerabilities: entry.vulnerabilities,
            },
        );
    }

    pub fn entry(&self, path: &Path) -> Option<ScanCacheEntry> {
        self.entries.get(path).map(|cached| ScanCacheEntry {
            path: path.to_path_buf(),
            content_hash: cached.content_hash,
            vulnerabilities: cached.vulnerabilities.clone(),
        })
    }
}

/// Persistence seam for the scan cache.
pub trait CacheStore: Send + Sync {
    /// Load the cache, failing on unreadable or malformed content.
    fn try_load(&self) -> Result<ScanCache>;

    /// Replace the persisted cache with `cache`.
    fn persist(&self, cache: &ScanCache) -> Result<()>;

    /// Load the cache, treating corruption as an empty cache.
    fn load(&self) -> ScanCache {
        match self.try_load() {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!(event = "cache.corrupt", error = %err, "starting with an empty scan cache");
                ScanCache::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;

    fn record(file: &str) -> VulnerabilityRecord {
        VulnerabilityRecord::new(file, 1, "SSRF", Severity::High, "requests.get(url)")
    }

    #[test]
    fn hash_display_fromstr_roundtrip() {
        let h = ContentHash::compute(b"hello world");
        let hex = h.to_string();
        assert_eq!(hex.len(), 64);
        let parsed: ContentHash = hex.parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hash_rejects_bad_hex() {
        assert!("not-valid-hex".parse::<ContentHash>().is_err());
        assert!("abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let h = ContentHash::compute(b"x");
        let json = serde_json::to_value(h).unwrap();
        assert_eq!(json, serde_json::Value::String(h.to_hex()));
    }

    #[test]
    fn lookup_requires_matching_hash() {
        let mut cache = ScanCache::new();
        let path = PathBuf::from("/src/a.py");
        let old = ContentHash::compute(b"v1");
        cache.insert(ScanCacheEntry {
            path: path.clone(),
            content_hash: old,
            vulnerabilities: vec![record("a.py")],
        });

        assert_eq!(cache.lookup(&path, &old).map(<[_]>::len), Some(1));
        assert!(cache.lookup(&path, &ContentHash::compute(b"v2")).is_none());
    }

    #[test]
    fn insert_replaces_stale_entry() {
        let mut cache = ScanCache::new();
        let path = PathBuf::from("/src/a.py");
        cache.insert(ScanCacheEntry {
            path: path.clone(),
            content_hash: ContentHash::compute(b"v1"),
            vulnerabilities: vec![record("a.py"), record("a.py")],
        });
        let fresh = ContentHash::compute(b"v2");
        cache.insert(ScanCacheEntry {
            path: path.clone(),
            content_hash: fresh,
            vulnerabilities: vec![],
        });

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&path, &fresh), Some(&[][..]));
    }

    #[test]
    fn lookup_by_hash_finds_other_paths() {
        let mut cache = ScanCache::new();
        let hash = ContentHash::compute(b"same");
        cache.insert(ScanCacheEntry {
            path: PathBuf::from("/src/a.py"),
            content_hash: hash,
            vulnerabilities: vec![record("a.py")],
        });
        let (path, vulns) = cache.lookup_by_hash(&hash).unwrap();
        assert_eq!(path, Path::new("/src/a.py"));
        assert_eq!(vulns[0].file, "a.py");
    }
}
