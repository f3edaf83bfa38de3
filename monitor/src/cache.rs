//! Content cache for conversation files.
//!
//! Every read of a conversation log goes through [`ContentCache`]. Entries are
//! keyed by path and validated against a file [`Signature`] (size plus
//! modification time) taken immediately before each lookup, so a cached
//! entry is only ever returned for the exact file version it was read from.
//!
//! Concurrent requests for the same path and signature share a single disk
//! read. Disk reads are bounded by a semaphore and run on the blocking pool.
//! Failed reads are returned to every waiter but never cached.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Default number of files kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Default number of concurrent disk reads.
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 4;

/// Errors returned by [`ContentCache::get`].
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The file could not be stat'ed or read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The blocking read task was cancelled or panicked.
    #[error("read task for {} failed: {message}", path.display())]
    Task { path: PathBuf, message: String },
}

impl CacheError {
    fn read(path: &Path, source: io::Error) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    /// Returns the underlying I/O error kind, if this was an I/O failure.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Read { source, .. } => Some(source.kind()),
            Self::Task { .. } => None,
        }
    }
}

/// Version identity of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Signature {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Contents of one file at a known [`Signature`].
#[derive(Debug, Clone)]
pub struct CachedContent {
    pub signature: Signature,
    pub text: Arc<str>,
}

/// Cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub capacity: NonZeroUsize,
    /// Entries older than this are treated as misses.
    pub ttl: Option<Duration>,
    pub max_concurrent_reads: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ttl: None,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
        }
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Disk reads actually performed.
    pub reads: u64,
    pub entries: usize,
}

type ReadFuture = Shared<BoxFuture<'static, Result<CachedContent, CacheError>>>;

#[derive(Debug)]
struct Entry {
    content: CachedContent,
    last_accessed: Instant,
}

struct Inner {
    entries: Mutex<LruCache<PathBuf, Entry>>,
    in_flight: Mutex<HashMap<(PathBuf, Signature), ReadFuture>>,
    read_permits: Semaphore,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
}

/// Shared, signature-validated file content cache.
///
/// Cloning is cheap; all clones share the same entries.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContentCache {
    #[must_use]
    pub fn new(options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(LruCache::new(options.capacity)),
                in_flight: Mutex::new(HashMap::new()),
                read_permits: Semaphore::new(options.max_concurrent_reads.max(1)),
                ttl: options.ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                reads: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the current contents of `path`.
    ///
    /// The file is stat'ed first. A cached entry whose signature differs from
    /// the current one is discarded and the file is read again.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Read`] if the file cannot be stat'ed or read.
    pub async fn get(&self, path: &Path) -> Result<CachedContent, CacheError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| CacheError::read(path, e))?;
        let signature = Signature::from_metadata(&metadata);

        if let Some(content) = self.lookup(path, signature) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            trace!(path = %path.display(), "Cache hit");
            return Ok(content);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        let read = self.read_future(path, signature);
        let result = read.await;

        // Store before retiring the in-flight read so late callers find one or the other.
        let mut in_flight = lock(&self.inner.in_flight);
        if let Ok(content) = &result {
            self.store(path, content.clone());
        }
        in_flight.remove(&(path.to_path_buf(), signature));
        result
    }

    /// Drops any cached entry for `path`.
    pub fn invalidate(&self, path: &Path) {
        if lock(&self.inner.entries).pop(path).is_some() {
            debug!(path = %path.display(), "Evicted cache entry");
        }
    }

    /// Removes entries idle for longer than the configured TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.inner.ttl else {
            return 0;
        };

        let mut entries = lock(&self.inner.entries);
        let expired: Vec<PathBuf> = entries
            .iter()
            .filter(|(_, entry)| entry.last_accessed.elapsed() >= ttl)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            entries.pop(path);
        }
        expired.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            reads: self.inner.reads.load(Ordering::Relaxed),
            entries: lock(&self.inner.entries).len(),
        }
    }

    fn lookup(&self, path: &Path, signature: Signature) -> Option<CachedContent> {
        let mut entries = lock(&self.inner.entries);
        let entry = entries.get_mut(path)?;

        let expired = self
            .inner
            .ttl
            .is_some_and(|ttl| entry.last_accessed.elapsed() >= ttl);

        if entry.content.signature == signature && !expired {
            entry.last_accessed = Instant::now();
            return Some(entry.content.clone());
        }

        entries.pop(path);
        None
    }

    fn store(&self, path: &Path, content: CachedContent) {
        lock(&self.inner.entries).put(
            path.to_path_buf(),
            Entry {
                content,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Joins an in-flight read for the same version or starts a new one.
    fn read_future(&self, path: &Path, signature: Signature) -> ReadFuture {
        let key = (path.to_path_buf(), signature);
        let mut in_flight = lock(&self.inner.in_flight);

        if let Some(existing) = in_flight.get(&key) {
            trace!(path = %path.display(), "Joining in-flight read");
            return existing.clone();
        }
        if let Some(content) = self.lookup(path, signature) {
            return futures::future::ready(Ok(content)).boxed().shared();
        }

        let inner = Arc::clone(&self.inner);
        let owned = path.to_path_buf();
        let future = async move { read_from_disk(inner, owned, signature).await }
            .boxed()
            .shared();

        in_flight.insert(key, future.clone());
        future
    }
}

async fn read_from_disk(
    inner: Arc<Inner>,
    path: PathBuf,
    expected: Signature,
) -> Result<CachedContent, CacheError> {
    let _permit = inner
        .read_permits
        .acquire()
        .await
        .map_err(|e| CacheError::Task {
            path: path.clone(),
            message: e.to_string(),
        })?;

    inner.reads.fetch_add(1, Ordering::Relaxed);
    debug!(path = %path.display(), len = expected.len, "Reading conversation file");

    let blocking_path = path.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&blocking_path)?;
        let signature = Signature::from_metadata(&file.metadata()?);
        let mut bytes = Vec::with_capacity(usize::try_from(signature.len).unwrap_or(0));
        io::Read::read_to_end(&mut &file, &mut bytes)?;
        Ok::<_, io::Error>((signature, bytes))
    })
    .await;

    let (signature, bytes) = match joined {
        Ok(Ok(read)) => read,
        Ok(Err(e)) => return Err(CacheError::read(&path, e)),
        Err(e) => {
            return Err(CacheError::Task {
                path,
                message: e.to_string(),
            })
        }
    };

    // The file may have grown between stat and read; record what was read.
    let signature = Signature {
        len: bytes.len() as u64,
        modified: signature.modified,
    };

    Ok(CachedContent {
        signature,
        text: Arc::from(String::from_utf8_lossy(&bytes).as_ref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, text: &str) {
        std::fs::write(path, text).expect("write file");
    }

    fn cache() -> ContentCache {
        ContentCache::new(CacheOptions::default())
    }

    #[tokio::test]
    async fn second_read_of_unchanged_file_is_a_hit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, "one\n");

        let cache = cache();
        let first = cache.get(&path).await.unwrap();
        let second = cache.get(&path).await.unwrap();

        assert_eq!(&*first.text, "one\n");
        assert_eq!(&*second.text, "one\n");
        let stats = cache.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn appended_content_is_never_served_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, "one\n");

        let cache = cache();
        assert_eq!(&*cache.get(&path).await.unwrap().text, "one\n");

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"two\n").unwrap();
        file.sync_all().unwrap();

        let after = cache.get(&path).await.unwrap();
        assert_eq!(&*after.text, "one\ntwo\n");
        assert_eq!(after.signature.len, 8);
        assert_eq!(cache.stats().reads, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_read() {
        const TASKS: usize = 16;
        const SIZE: usize = 4 * 1024 * 1024;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, &"x".repeat(SIZE));

        let cache = cache();
        let barrier = Arc::new(tokio::sync::Barrier::new(TASKS));
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let cache = cache.clone();
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.get(&path).await
                })
            })
            .collect();

        for handle in handles {
            let content = handle.await.unwrap().unwrap();
            assert_eq!(content.text.len(), SIZE);
        }

        let stats = cache.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.hits + stats.misses, TASKS as u64);
    }

    #[tokio::test]
    async fn missing_file_error_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.jsonl");

        let cache = cache();
        let err = cache.get(&path).await.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert_eq!(cache.stats().entries, 0);

        write(&path, "now here\n");
        assert_eq!(&*cache.get(&path).await.unwrap().text, "now here\n");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin.jsonl");
        std::fs::write(&path, [b'o', b'k', 0xff, b'\n']).unwrap();

        let content = cache().get(&path).await.unwrap();
        assert!(content.text.starts_with("ok"));
        assert!(content.text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn invalidate_forces_a_reread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, "one\n");

        let cache = cache();
        cache.get(&path).await.unwrap();
        cache.invalidate(&path);
        assert_eq!(cache.stats().entries, 0);

        cache.get(&path).await.unwrap();
        assert_eq!(cache.stats().reads, 2);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, "one\n");

        let cache = ContentCache::new(CacheOptions {
            ttl: Some(Duration::from_millis(20)),
            ..CacheOptions::default()
        });
        cache.get(&path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.purge_expired(), 1);
        cache.get(&path).await.unwrap();
        assert_eq!(cache.stats().reads, 2);
    }

    #[tokio::test]
    async fn frequently_read_entries_stay_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jsonl");
        write(&path, "one\n");

        let cache = ContentCache::new(CacheOptions {
            ttl: Some(Duration::from_millis(200)),
            ..CacheOptions::default()
        });
        cache.get(&path).await.unwrap();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cache.get(&path).await.unwrap();
        }

        assert_eq!(cache.purge_expired(), 0);
        let stats = cache.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.hits, 6);
    }

    #[tokio::test]
    async fn capacity_bounds_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(CacheOptions {
            capacity: NonZeroUsize::new(2).unwrap(),
            ..CacheOptions::default()
        });

        for name in ["a", "b", "c"] {
            let path = dir.path().join(format!("{name}.jsonl"));
            write(&path, name);
            cache.get(&path).await.unwrap();
        }

        assert_eq!(cache.stats().entries, 2);
    }
}
