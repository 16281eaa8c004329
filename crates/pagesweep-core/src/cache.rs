//! Response cache keyed by [`FetchRequest::cache_key`](crate::FetchRequest::cache_key).
//!
//! No TTL and no eviction. Overwriting an existing key is tolerated.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;

/// Key/value store for raw response bodies.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, payload: &[u8]) -> io::Result<()>;
}

/// In-process cache, lost at exit.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, payload: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), payload.to_vec());
        Ok(())
    }
}

/// Distinguishes tmp files of concurrent writers within one process
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// One `<dir>/<key>.json` file per entry, persisted across runs.
///
/// Writes go to a unique `.tmp` file that is renamed into place, so readers
/// never observe a partially written entry.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    /// Open (creating if needed) a cache directory and drop stale tmp files.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        cleanup_tmp_files(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Paths of every stored entry, sorted.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let pattern = self.dir.join("*.json");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| io::Error::other("cache path is not valid UTF-8"))?;
        let paths = glob::glob(pattern).map_err(io::Error::other)?;
        let mut entries: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
        entries.sort();
        Ok(entries)
    }

    /// Total bytes across all entries.
    pub fn size_bytes(&self) -> io::Result<u64> {
        let mut total = 0;
        for path in self.entries()? {
            total += fs::metadata(&path)?.len();
        }
        Ok(total)
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> io::Result<usize> {
        let entries = self.entries()?;
        for path in &entries {
            fs::remove_file(path)?;
        }
        log::info!("Removed {} cache entries from {}", entries.len(), self.dir.display());
        Ok(entries.len())
    }
}

impl ResponseCache for DirCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("cache read {key}: {e}");
                None
            }
        }
    }

    fn put(&self, key: &str, payload: &[u8]) -> io::Result<()> {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!("{key}.{}.{seq}.tmp", std::process::id()));
        fs::write(&tmp, payload)?;
        if let Err(e) = fs::rename(&tmp, self.entry_path(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
}

/// Remove stale .tmp files left by an interrupted run
pub fn cleanup_tmp_files(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn memory_roundtrip() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").is_none());
        cache.put("k", b"v1").unwrap();
        cache.put("k", b"v2").unwrap();
        assert_eq!(cache.get("k").as_deref(), Some(&b"v2"[..]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dir_cache_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        DirCache::new(dir.path()).unwrap().put("abc", b"{}").unwrap();

        let reopened = DirCache::new(dir.path()).unwrap();
        assert_eq!(reopened.get("abc").as_deref(), Some(&b"{}"[..]));
        assert!(reopened.get("missing").is_none());
    }

    #[test]
    fn dir_cache_removes_stale_tmp() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc.1.0.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("keep.json"), b"{}").unwrap();

        let cache = DirCache::new(dir.path()).unwrap();
        assert!(!dir.path().join("abc.1.0.tmp").exists());
        assert_eq!(cache.entries().unwrap().len(), 1);
    }

    #[test]
    fn dir_cache_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirCache::new(dir.path()).unwrap();
        cache.put("a", b"1").unwrap();
        cache.put("b", b"22").unwrap();
        assert_eq!(cache.size_bytes().unwrap(), 3);
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn concurrent_overwrites_leave_whole_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DirCache::new(dir.path()).unwrap());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let payload = vec![b'a' + i; 4096];
                    for _ in 0..20 {
                        cache.put("same", &payload).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stored = cache.get("same").unwrap();
        assert_eq!(stored.len(), 4096);
        assert!(stored.iter().all(|&b| b == stored[0]));
        assert_eq!(cache.entries().unwrap().len(), 1);
    }
}
