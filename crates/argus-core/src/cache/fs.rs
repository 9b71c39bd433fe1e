use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CacheError, CacheStore, Result, ScanCache};

/// JSON-file-backed scan cache.
///
/// Layout: a single object mapping absolute file path to
/// `{ "content_hash": "<hex>", "vulnerabilities": [...] }`.
pub struct FsCacheStore {
    path: PathBuf,
}

impl FsCacheStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for FsCacheStore {
    fn try_load(&self) -> Result<ScanCache> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ScanCache::new()),
            Err(e) => return Err(CacheError::Io(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn persist(&self, cache: &ScanCache) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Atomic write: temp file in the same directory, then rename.
        let json = serde_json::to_vec_pretty(cache)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContentHash, ScanCacheEntry};
    use crate::domain::{Severity, VulnerabilityRecord};

    fn make_store() -> (tempfile::TempDir, FsCacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path().join("cache").join("scan_cache.json"));
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let (_dir, store) = make_store();
        assert!(store.try_load().unwrap().is_empty());
    }

    #[test]
    fn persist_then_load() {
        let (_dir, store) = make_store();
        let mut cache = ScanCache::new();
        let hash = ContentHash::compute(b"print(1)");
        cache.insert(ScanCacheEntry {
            path: PathBuf::from("/src/app.py"),
            content_hash: hash,
            vulnerabilities: vec![VulnerabilityRecord::new(
                "app.py",
                1,
                "Command Injection",
                Severity::High,
                "os.system",
            )],
        });
        store.persist(&cache).unwrap();

        let loaded = store.try_load().unwrap();
        assert_eq!(loaded, cache);
        assert!(loaded.lookup(Path::new("/src/app.py"), &hash).is_some());
    }

    #[test]
    fn corrupt_file_reports_corruption() {
        let (_dir, store) = make_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();

        match store.try_load() {
            Err(CacheError::Corrupt { path, .. }) => assert_eq!(path, store.path()),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let (_dir, store) = make_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"[1, 2, 3]").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn persist_overwrites_previous_content() {
        let (_dir, store) = make_store();
        let mut cache = ScanCache::new();
        cache.insert(ScanCacheEntry {
            path: PathBuf::from("/a.py"),
            content_hash: ContentHash::compute(b"a"),
            vulnerabilities: vec![],
        });
        store.persist(&cache).unwrap();
        store.persist(&ScanCache::new()).unwrap();
        assert!(store.try_load().unwrap().is_empty());
    }
}
