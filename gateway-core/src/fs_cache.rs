use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Negative-or-positive stat result, mirroring what `std::fs::Metadata` would
/// tell a caller, minus anything the gateway never needs (permissions, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub is_file: bool,
    pub is_dir: bool,
    pub mtime_ms: i64,
    pub len: u64,
}

impl StatRecord {
    pub const NEGATIVE: StatRecord = StatRecord {
        is_file: false,
        is_dir: false,
        mtime_ms: 0,
        len: 0,
    };

    pub fn exists(&self) -> bool {
        self.is_file || self.is_dir
    }
}

struct Aged<T> {
    value: T,
    at: Instant,
}

/// LRU + TTL cache over directory listings and stat results.
///
/// Grounded on the same shape the reference codebase's `localfs` feature
/// pulls `lru` and `parking_lot` in for: bounded memory, short critical
/// sections, no async needed for the cache hit path itself.
pub struct FsCache {
    dirs: Mutex<LruCache<PathBuf, Aged<Arc<Vec<String>>>>>,
    stats: Mutex<LruCache<PathBuf, Aged<StatRecord>>>,
    ttl: Duration,
}

impl FsCache {
    pub fn new(dir_capacity: usize, stat_capacity: usize, ttl: Duration) -> Self {
        Self {
            dirs: Mutex::new(LruCache::new(
                NonZeroUsize::new(dir_capacity.max(1)).unwrap(),
            )),
            stats: Mutex::new(LruCache::new(
                NonZeroUsize::new(stat_capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }

    fn fresh(&self, at: Instant) -> bool {
        at.elapsed() < self.ttl
    }

    pub fn get_stat(&self, path: &Path) -> Option<StatRecord> {
        let mut guard = self.stats.lock();
        if let Some(aged) = guard.get(path) {
            if self.fresh(aged.at) {
                return Some(aged.value);
            }
        }
        guard.pop(path);
        None
    }

    pub fn put_stat(&self, path: PathBuf, record: StatRecord) {
        self.stats.lock().put(
            path,
            Aged {
                value: record,
                at: Instant::now(),
            },
        );
    }

    pub fn get_dir(&self, path: &Path) -> Option<Arc<Vec<String>>> {
        let mut guard = self.dirs.lock();
        if let Some(aged) = guard.get(path) {
            if self.fresh(aged.at) {
                return Some(Arc::clone(&aged.value));
            }
        }
        guard.pop(path);
        None
    }

    pub fn put_dir(&self, path: PathBuf, entries: Vec<String>) {
        self.dirs.lock().put(
            path,
            Aged {
                value: Arc::new(entries),
                at: Instant::now(),
            },
        );
    }

    /// Resolves a stat, consulting the cache first and falling back to a
    /// blocking `std::fs::metadata` call off the async executor.
    pub async fn stat(&self, path: &Path) -> StatRecord {
        if let Some(hit) = self.get_stat(path) {
            return hit;
        }
        let owned = path.to_path_buf();
        let record = tokio::task::spawn_blocking(move || stat_blocking(&owned))
            .await
            .unwrap_or(StatRecord::NEGATIVE);
        self.put_stat(path.to_path_buf(), record);
        record
    }

    /// Resolves a directory listing truncated to `max_list` entries.
    pub async fn read_dir(&self, path: &Path, max_list: usize) -> Arc<Vec<String>> {
        if let Some(hit) = self.get_dir(path) {
            return hit;
        }
        let owned = path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || read_dir_blocking(&owned, max_list))
            .await
            .unwrap_or_default();
        self.put_dir(path.to_path_buf(), entries.clone());
        Arc::new(entries)
    }
}

fn stat_blocking(path: &Path) -> StatRecord {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            StatRecord {
                is_file: meta.is_file(),
                is_dir: meta.is_dir(),
                mtime_ms,
                len: meta.len(),
            }
        }
        Err(_) => StatRecord::NEGATIVE,
    }
}

fn read_dir_blocking(path: &Path, max_list: usize) -> Vec<String> {
    let Ok(iter) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for entry in iter.flatten() {
        if names.len() >= max_list {
            break;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stat_caches_negative_results() {
        let cache = FsCache::new(16, 16, Duration::from_secs(3600));
        let missing = PathBuf::from("/definitely/not/a/real/path/xyz");
        let first = cache.stat(&missing).await;
        assert!(!first.exists());
        // second call must come from the cache, not a fresh syscall; same value either way
        let second = cache.stat(&missing).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn read_dir_respects_max_list() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), b"x").unwrap();
        }
        let cache = FsCache::new(16, 16, Duration::from_secs(3600));
        let listing = cache.read_dir(dir.path(), 5).await;
        assert_eq!(listing.len(), 5);
    }

    #[test]
    fn ttl_expiry_evicts_entry() {
        let cache = FsCache::new(16, 16, Duration::from_millis(1));
        cache.put_stat(PathBuf::from("/a"), StatRecord::NEGATIVE);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_stat(&PathBuf::from("/a")).is_none());
    }
}
