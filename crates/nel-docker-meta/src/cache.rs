//! On-disk metadata cache with LRU eviction.
//!
//! Each entry is a single JSON document under the cache directory, filename
//! `sha256(docker_id | pattern).json`. File mtime tracks recency: reads touch
//! it, eviction removes the oldest. Writes go through a temp file and an
//! atomic rename so readers never observe a partial entry.

use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Entry count above which the oldest entry is evicted before a write.
pub const MAX_CACHE_ENTRIES: usize = 200;

/// One cached resolution, exactly as serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub docker_id: String,
    /// `<prefix>/<filename>` pattern key.
    pub pattern: String,
    /// Path of the matched member inside the image.
    pub cached_file_path: String,
    /// Raw UTF-8 content of the matched file.
    pub metadata: String,
    /// Manifest digest the content was validated against.
    pub digest: String,
}

/// Cache hit/eviction counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub evictions: u64,
}

/// Handle on the cache directory.
#[derive(Debug)]
pub struct MetaCache {
    dir: PathBuf,
    max_entries: usize,
    evictions: AtomicU64,
}

impl MetaCache {
    /// Open (creating) a cache directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_entries: MAX_CACHE_ENTRIES,
            evictions: AtomicU64::new(0),
        })
    }

    /// Open the default per-user cache, `~/.nemo-evaluator/docker-meta/`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().ok_or(crate::Error::NoHome)?;
        Self::open(home.join(".nemo-evaluator").join("docker-meta"))
    }

    #[cfg(test)]
    fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    fn entry_path(&self, docker_id: &str, pattern: &str) -> PathBuf {
        let key = format!("{}|{}", docker_id, pattern);
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.json", hash))
    }

    /// Load the entry for `(docker_id, pattern)` and mark it recently used.
    pub fn load(&self, docker_id: &str, pattern: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(docker_id, pattern);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                touch(&path);
                Ok(Some(entry))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "removing unreadable cache entry");
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Write (or replace) an entry, evicting the oldest file first when the
    /// directory is full.
    pub fn store(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.docker_id, &entry.pattern);
        if !path.exists() {
            self.evict_to_capacity()?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(entry)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(docker_id = %entry.docker_id, pattern = %entry.pattern, "cached metadata");
        Ok(())
    }

    /// Drop a stale entry.
    pub fn invalidate(&self, docker_id: &str, pattern: &str) -> Result<()> {
        let path = self.entry_path(docker_id, pattern);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.entry_files()?.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }

    fn entry_files(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let mut files = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let mtime = dirent.metadata()?.modified()?;
                files.push((path, mtime));
            }
        }
        Ok(files)
    }

    fn evict_to_capacity(&self) -> Result<()> {
        let mut files = self.entry_files()?;
        if files.len() < self.max_entries {
            return Ok(());
        }
        files.sort_by_key(|(_, mtime)| *mtime);
        let excess = files.len() + 1 - self.max_entries;
        for (path, _) in files.into_iter().take(excess) {
            debug!(path = %path.display(), "evicting oldest cache entry");
            let _ = std::fs::remove_file(path);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Best-effort mtime bump for LRU bookkeeping.
fn touch(path: &Path) {
    use nix::sys::stat::utimes;
    use nix::sys::time::TimeVal;
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let tv = TimeVal::new(now.as_secs() as i64, now.subsec_micros() as i64);
    if let Err(e) = utimes(path, &tv, &tv) {
        warn!(path = %path.display(), error = %e, "failed to touch cache entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> CacheEntry {
        CacheEntry {
            docker_id: id.to_string(),
            pattern: "/opt/metadata/framework.yml".to_string(),
            cached_file_path: "/opt/metadata/x/framework.yml".to_string(),
            metadata: "framework:\n  name: demo\n".to_string(),
            digest: "sha256:abc".to_string(),
        }
    }

    #[test]
    fn test_store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap();
        let e = entry("img-a");
        cache.store(&e).unwrap();
        let loaded = cache.load("img-a", &e.pattern).unwrap().unwrap();
        assert_eq!(loaded, e);
        assert!(cache.load("img-b", &e.pattern).unwrap().is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap();
        let e = entry("img-a");
        cache.store(&e).unwrap();
        cache.invalidate("img-a", &e.pattern).unwrap();
        assert!(cache.load("img-a", &e.pattern).unwrap().is_none());
        // Idempotent.
        cache.invalidate("img-a", &e.pattern).unwrap();
    }

    #[test]
    fn test_eviction_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap().with_max_entries(5);
        for i in 0..5 {
            cache.store(&entry(&format!("img-{}", i))).unwrap();
            // Distinct mtimes so LRU ordering is deterministic.
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(cache.stats().unwrap().entries, 5);

        cache.store(&entry("img-new")).unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.evictions, 1);
        // The oldest entry went away; the newest remains.
        assert!(cache.load("img-0", &entry("x").pattern).unwrap().is_none());
        assert!(cache.load("img-new", &entry("x").pattern).unwrap().is_some());
    }

    #[test]
    fn test_rewrite_of_existing_entry_does_not_evict() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap().with_max_entries(2);
        cache.store(&entry("img-a")).unwrap();
        cache.store(&entry("img-b")).unwrap();
        let mut updated = entry("img-a");
        updated.digest = "sha256:def".to_string();
        cache.store(&updated).unwrap();
        assert_eq!(cache.stats().unwrap().entries, 2);
        assert_eq!(cache.stats().unwrap().evictions, 0);
    }
}
