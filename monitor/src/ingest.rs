//! Ingestion pipeline.
//!
//! One task owns the [`ConversationStore`] and consumes [`WatchEvent`]s:
//!
//! ```text
//! FileWatcher ──WatchEvent──▶ Ingestor ──read──▶ ContentCache
//!                                 │
//!                                 ├──parse (blocking pool)
//!                                 └──upsert──▶ ConversationStore ──▶ StateChangeSink
//! ```
//!
//! Events for one file are applied in the order they arrive, so ingestion
//! passes follow debounce-settle order. A pass that has started always runs
//! to completion before the next event or a shutdown signal is looked at.
//! On shutdown the debouncer flushes its pending paths and the ingest task
//! applies them before it exits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, ContentCache};
use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::parser::parse;
use crate::store::{ConversationSource, ConversationStore, StateChangeSink, StoreReader};
use crate::utils::session_filename::conversation_identity;
use crate::watcher::{discover_conversation_files, FileWatcher, WatchEvent};

/// Capacity of the watcher -> ingestor queue.
const WATCH_EVENT_BUFFER: usize = 1000;

/// How long [`MonitorHandle::shutdown`] waits for the ingest task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters shared between the ingest task and its handle.
#[derive(Debug, Default)]
pub struct IngestStats {
    passes: AtomicU64,
    read_failures: AtomicU64,
    parse_warnings: AtomicU64,
}

impl IngestStats {
    /// Completed read-parse-upsert passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    /// Malformed lines seen across all passes.
    #[must_use]
    pub fn parse_warnings(&self) -> u64 {
        self.parse_warnings.load(Ordering::Relaxed)
    }
}

/// Owner of the store; turns watch events into store mutations.
#[derive(Debug)]
pub struct Ingestor {
    root: PathBuf,
    store: ConversationStore,
    cache: ContentCache,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    /// Creates an ingestor for the log tree under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, store: ConversationStore, cache: ContentCache) -> Self {
        Self {
            root: root.into(),
            store,
            cache,
            stats: Arc::new(IngestStats::default()),
        }
    }

    #[must_use]
    pub fn reader(&self) -> StoreReader {
        self.store.reader()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Ingests every conversation file already under the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be read. Individual files that
    /// fail are logged and skipped.
    pub async fn scan(&mut self) -> Result<usize> {
        let files = discover_conversation_files(&self.root)?;
        info!(root = %self.root.display(), file_count = files.len(), "Scanning existing conversations");

        for path in &files {
            self.ingest(path).await;
        }
        Ok(files.len())
    }

    /// Applies one watch event.
    pub async fn handle(&mut self, event: WatchEvent) {
        let now = Utc::now();
        match event {
            WatchEvent::FileCreated(path) => {
                if let Some(source) = source_for(&self.root, &path, now).await {
                    self.store.seed(source, now);
                }
            }
            WatchEvent::SizeSampled {
                path,
                previous,
                current,
            } => {
                if current > previous {
                    if let Some(identity) = conversation_identity(&self.root, &path) {
                        self.store.record_growth(&identity.id, current - previous, now);
                    }
                }
            }
            WatchEvent::Settled { path, coalesced } => {
                debug!(path = %path.display(), coalesced, "Ingesting settled file");
                self.ingest(&path).await;
            }
            WatchEvent::FileRemoved(path) => {
                self.cache.invalidate(&path);
                self.mark_unreachable(&path);
            }
            WatchEvent::Unreachable { path, reason } => {
                warn!(path = %path.display(), reason = %reason, "Conversation file unreachable");
                self.mark_unreachable(&path);
            }
        }
    }

    /// Re-infers every conversation as time passes.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let changed = self.store.refresh(now);
        let purged = self.cache.purge_expired();
        if !changed.is_empty() || purged > 0 {
            debug!(changed = changed.len(), purged, "Periodic refresh");
        }
    }

    /// Read, parse and upsert one file.
    async fn ingest(&mut self, path: &Path) {
        let Some(identity) = conversation_identity(&self.root, path) else {
            return;
        };

        let content = match self.cache.get(path).await {
            Ok(content) => content,
            Err(e) => {
                self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                self.read_failed(path, &identity.id, &e);
                return;
            }
        };

        let text = Arc::clone(&content.text);
        let parsed = match tokio::task::spawn_blocking(move || parse(&text)).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Parse task failed");
                return;
            }
        };

        if !parsed.warnings.is_empty() {
            self.stats
                .parse_warnings
                .fetch_add(parsed.warnings.len() as u64, Ordering::Relaxed);
            for warning in &parsed.warnings {
                debug!(path = %path.display(), line = warning.line, reason = %warning.reason, "Parse warning");
            }
        }

        let now = Utc::now();
        let last_modified = content
            .signature
            .modified
            .map_or(now, DateTime::<Utc>::from);

        let source = ConversationSource {
            id: identity.id,
            project_path: identity.project_path,
            file_path: path.to_path_buf(),
            last_modified,
        };
        self.store
            .upsert(source, parsed.messages, parsed.summary, now);
        self.stats.passes.fetch_add(1, Ordering::Relaxed);
    }

    fn read_failed(&mut self, path: &Path, id: &str, error: &CacheError) {
        warn!(path = %path.display(), error = %error, "Failed to read conversation file");
        if error.io_kind() == Some(std::io::ErrorKind::NotFound) {
            self.cache.invalidate(path);
        }
        self.store.mark_unreachable(id);
    }

    fn mark_unreachable(&mut self, path: &Path) {
        if let Some(identity) = conversation_identity(&self.root, path) {
            self.store.mark_unreachable(&identity.id);
        }
    }

    /// Consumes watch events until the channel closes.
    ///
    /// After a shutdown signal the ticker stops and remaining events, including
    /// settles flushed by the closing debouncer, are applied until the channel
    /// closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
        refresh_interval: Duration,
    ) {
        let mut ticker = interval_at(Instant::now() + refresh_interval, refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Ingest task started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, draining pending events");
                        while let Some(event) = events.recv().await {
                            self.handle(event).await;
                        }
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Watch event channel closed");
                        break;
                    };
                    self.handle(event).await;
                }
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
            }
        }

        info!(passes = self.stats.passes(), "Ingest task stopped");
    }
}

/// Builds the source record for a newly seen file, or `None` if the path is
/// not a conversation log.
async fn source_for(root: &Path, path: &Path, now: DateTime<Utc>) -> Option<ConversationSource> {
    let identity = conversation_identity(root, path)?;
    let last_modified = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map_or(now, DateTime::<Utc>::from);

    Some(ConversationSource {
        id: identity.id,
        project_path: identity.project_path,
        file_path: path.to_path_buf(),
        last_modified,
    })
}

/// A running monitor: watcher plus ingest task.
///
/// The store lives inside the ingest task; callers read it through
/// [`MonitorHandle::reader`].
#[derive(Debug)]
pub struct MonitorHandle {
    reader: StoreReader,
    stats: Arc<IngestStats>,
    cache: ContentCache,
    watcher: FileWatcher,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Starts watching `config.watch_dir`, ingests existing files, and spawns
    /// the ingest task. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Watch`] if the root directory cannot be
    /// watched. This is the only fatal startup failure.
    pub async fn start(config: &Config, sink: Arc<dyn StateChangeSink>) -> Result<Self> {
        let cache = ContentCache::new(config.cache);
        let store = ConversationStore::new(config.inference.clone(), sink);
        let mut ingestor = Ingestor::new(config.watch_dir.clone(), store, cache.clone());

        let (event_tx, event_rx) = mpsc::channel(WATCH_EVENT_BUFFER);
        let watcher = FileWatcher::new(config.watch_dir.clone(), config.debounce, event_tx)?;

        ingestor.scan().await?;

        let reader = ingestor.reader();
        let stats = ingestor.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let refresh_interval = config.refresh_interval;

        let task = tokio::spawn(async move {
            ingestor.run(event_rx, shutdown_rx, refresh_interval).await;
        });

        info!(
            watch_dir = %config.watch_dir.display(),
            conversations = reader.len(),
            "Monitor started"
        );

        Ok(Self {
            reader,
            stats,
            cache,
            watcher,
            shutdown_tx,
            task,
        })
    }

    #[must_use]
    pub fn reader(&self) -> StoreReader {
        self.reader.clone()
    }

    #[must_use]
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    #[must_use]
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    #[must_use]
    pub fn watch_dir(&self) -> PathBuf {
        self.watcher.watch_dir().to_path_buf()
    }

    /// Stops the watcher and waits for the ingest task to apply the
    /// remaining events and finish.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Task`] if the task panicked or did not stop
    /// in time.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shutdown_tx,
            task,
            watcher,
            ..
        } = self;

        drop(watcher);
        // The task may already have exited if the event channel closed.
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(joined) => joined.map_err(MonitorError::from),
            Err(_) => Err(MonitorError::Task(
                "ingest task did not stop within timeout".to_string(),
            )),
        }
    }
}

/// Parses every conversation under `config.watch_dir` once, without watching.
///
/// # Errors
///
/// Returns an error if the root directory cannot be read.
pub async fn snapshot(config: &Config) -> Result<StoreReader> {
    let store = ConversationStore::new(config.inference.clone(), Arc::new(crate::store::NullSink));
    let mut ingestor = Ingestor::new(config.watch_dir.clone(), store, ContentCache::new(config.cache));
    ingestor.scan().await?;
    Ok(ingestor.reader())
}
