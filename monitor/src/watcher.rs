//! File watcher for conversation logs.
//!
//! Watches a directory tree for `.jsonl` conversation files and turns raw
//! file system notifications into [`WatchEvent`]s for the ingestion task.
//!
//! # Architecture
//!
//! The [`notify`] callback is kept lightweight: it filters paths and forwards
//! raw events over an internal channel to a dedicated async task. That task
//! does the per-event work:
//!
//! - samples the file size on **every** raw event and reports the change as
//!   [`WatchEvent::SizeSampled`] before any debouncing, so typing-style
//!   growth is visible immediately;
//! - feeds the path into a [`Debouncer`]; once writes to a file have been
//!   quiet for the debounce interval a single [`WatchEvent::Settled`] is
//!   emitted for the whole burst.
//!
//! Watch errors never stop the watcher; affected paths are reported as
//! [`WatchEvent::Unreachable`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use chatpulse_monitor::watcher::{FileWatcher, WatchEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!     let _watcher = FileWatcher::new(
//!         PathBuf::from("/home/user/.claude/projects"),
//!         Duration::from_millis(500),
//!         tx,
//!     )?;
//!
//!     while let Some(event) = rx.recv().await {
//!         if let WatchEvent::Settled { path, coalesced } = event {
//!             println!("{} settled after {coalesced} writes", path.display());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::utils::debounce::{Debouncer, Settled};
use crate::utils::session_filename::is_conversation_file;

/// Events emitted by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new conversation file appeared.
    FileCreated(PathBuf),

    /// The file size changed between two raw notifications.
    SizeSampled {
        path: PathBuf,
        previous: u64,
        current: u64,
    },

    /// Writes to the file have settled; it should be re-ingested once.
    Settled {
        path: PathBuf,
        /// Raw notifications folded into this event.
        coalesced: usize,
    },

    /// A conversation file was removed or renamed away.
    FileRemoved(PathBuf),

    /// The file could not be observed.
    Unreachable { path: PathBuf, reason: String },
}

impl WatchEvent {
    /// The path this event refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::FileCreated(path)
            | Self::FileRemoved(path)
            | Self::SizeSampled { path, .. }
            | Self::Settled { path, .. }
            | Self::Unreachable { path, .. } => path,
        }
    }
}

/// Raw events from the notify callback, processed by the async task.
#[derive(Debug)]
enum InternalEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Failed { path: PathBuf, reason: String },
}

/// Errors that can occur during file watching operations.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the file system watcher.
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// Failed to read a directory or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The watch directory does not exist or is inaccessible.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The event receiver has been dropped.
    #[error("failed to send event: channel closed")]
    ChannelClosed,
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

type SizeMap = Arc<RwLock<HashMap<PathBuf, u64>>>;

/// Recursive watcher over a conversation log directory.
///
/// Dropping the watcher stops the notify subscription; the internal task and
/// the debouncer then drain and exit.
#[derive(Debug)]
pub struct FileWatcher {
    /// Kept alive to maintain the watch subscription.
    #[allow(dead_code)]
    watcher: RecommendedWatcher,

    /// Last sampled size for each known file.
    sizes: SizeMap,

    watch_dir: PathBuf,
}

impl FileWatcher {
    /// Starts watching `watch_dir` recursively.
    ///
    /// Existing files are recorded with their current size but no events are
    /// emitted for them; use [`discover_conversation_files`] for the startup
    /// scan. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist, cannot be scanned,
    /// or the platform watcher cannot be initialized.
    pub fn new(
        watch_dir: PathBuf,
        debounce: Duration,
        event_sender: mpsc::Sender<WatchEvent>,
    ) -> Result<Self> {
        if !watch_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(watch_dir));
        }

        let sizes: SizeMap = Arc::new(RwLock::new(scan_existing_files(&watch_dir)?));

        let (settled_tx, settled_rx) = mpsc::channel::<Settled<PathBuf>>(1000);
        let debouncer = Debouncer::new(debounce, settled_tx);

        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(1000);

        let sizes_for_task = Arc::clone(&sizes);
        let sender_for_task = event_sender.clone();
        tokio::spawn(async move {
            process_internal_events(internal_rx, sizes_for_task, debouncer, sender_for_task).await;
        });

        tokio::spawn(forward_settled(settled_rx, event_sender));

        let watcher = create_watcher(internal_tx, &watch_dir)?;

        info!(
            watch_dir = %watch_dir.display(),
            debounce_ms = debounce.as_millis(),
            "Initialized file watcher"
        );

        Ok(Self {
            watcher,
            sizes,
            watch_dir,
        })
    }

    /// Returns the directory being watched.
    #[must_use]
    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// Returns the number of files whose size is tracked.
    pub async fn tracked_file_count(&self) -> usize {
        self.sizes.read().await.len()
    }

    /// Returns the last sampled size of `path`.
    pub async fn file_size(&self, path: &Path) -> Option<u64> {
        self.sizes.read().await.get(path).copied()
    }
}

/// Lists every conversation file below `dir`, sorted by path.
///
/// Unreadable subdirectories are skipped with a warning.
///
/// # Errors
///
/// Returns an error if `dir` itself cannot be read.
pub fn discover_conversation_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(WatcherError::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = scan_existing_files(dir)?.into_keys().collect();
    files.sort();
    Ok(files)
}

fn create_watcher(
    internal_tx: mpsc::Sender<InternalEvent>,
    watch_dir: &Path,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            handle_notify_event(res, &internal_tx);
        },
        Config::default(),
    )?;

    watcher.watch(watch_dir, RecursiveMode::Recursive)?;

    debug!(watch_dir = %watch_dir.display(), "Started recursive file watch");

    Ok(watcher)
}

/// Notify callback: filter and forward, nothing else.
fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    internal_tx: &mpsc::Sender<InternalEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, paths = ?e.paths, "File watcher error");
            for path in e.paths.iter().filter(|p| is_conversation_file(p)) {
                queue(
                    internal_tx,
                    InternalEvent::Failed {
                        path: path.clone(),
                        reason: e.to_string(),
                    },
                );
            }
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    for path in event.paths.iter().filter(|p| is_conversation_file(p)) {
        let internal_event = match event.kind {
            EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                InternalEvent::Created(path.clone())
            }
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                InternalEvent::Modified(path.clone())
            }
            EventKind::Remove(RemoveKind::File | RemoveKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                InternalEvent::Removed(path.clone())
            }
            _ => {
                trace!(kind = ?event.kind, path = %path.display(), "Ignoring event kind");
                continue;
            }
        };
        queue(internal_tx, internal_event);
    }
}

/// Never blocks the notify thread; a full queue drops the event.
fn queue(internal_tx: &mpsc::Sender<InternalEvent>, event: InternalEvent) {
    if let Err(e) = internal_tx.try_send(event) {
        warn!(error = %e, "Failed to queue internal event, channel may be full");
    }
}

async fn process_internal_events(
    mut rx: mpsc::Receiver<InternalEvent>,
    sizes: SizeMap,
    debouncer: Debouncer<PathBuf>,
    sender: mpsc::Sender<WatchEvent>,
) {
    while let Some(event) = rx.recv().await {
        let delivered = match event {
            InternalEvent::Created(path) => {
                handle_change(&path, true, &sizes, &debouncer, &sender).await
            }
            InternalEvent::Modified(path) => {
                handle_change(&path, false, &sizes, &debouncer, &sender).await
            }
            InternalEvent::Removed(path) => handle_removed(path, &sizes, &sender).await,
            InternalEvent::Failed { path, reason } => {
                sender
                    .send(WatchEvent::Unreachable { path, reason })
                    .await
                    .is_ok()
            }
        };

        if !delivered {
            debug!("Watch event receiver dropped");
            break;
        }
    }

    debug!("Internal event processor shutting down");
}

/// Samples the size of a created or modified file and restarts its settle timer.
///
/// Returns `false` once the event receiver is gone.
async fn handle_change(
    path: &Path,
    created: bool,
    sizes: &SizeMap,
    debouncer: &Debouncer<PathBuf>,
    sender: &mpsc::Sender<WatchEvent>,
) -> bool {
    let current = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = %path.display(), "File vanished before it could be sampled");
            return true;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to sample file size");
            return sender
                .send(WatchEvent::Unreachable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
                .await
                .is_ok();
        }
    };

    let previous = sizes.write().await.insert(path.to_path_buf(), current);

    if previous.is_none() || created {
        if previous.is_none() {
            info!(path = %path.display(), "New conversation file detected");
        }
        if sender
            .send(WatchEvent::FileCreated(path.to_path_buf()))
            .await
            .is_err()
        {
            return false;
        }
    }

    let previous = previous.unwrap_or(0);
    if previous != current {
        trace!(path = %path.display(), previous, current, "File size changed");
        if sender
            .send(WatchEvent::SizeSampled {
                path: path.to_path_buf(),
                previous,
                current,
            })
            .await
            .is_err()
        {
            return false;
        }
    }

    if let Err(e) = debouncer.notify(path.to_path_buf()).await {
        warn!(path = %path.display(), error = %e, "Failed to schedule settle timer");
    }
    true
}

async fn handle_removed(path: PathBuf, sizes: &SizeMap, sender: &mpsc::Sender<WatchEvent>) -> bool {
    info!(path = %path.display(), "Conversation file removed");
    sizes.write().await.remove(&path);
    sender.send(WatchEvent::FileRemoved(path)).await.is_ok()
}

async fn forward_settled(
    mut settled_rx: mpsc::Receiver<Settled<PathBuf>>,
    sender: mpsc::Sender<WatchEvent>,
) {
    while let Some(settled) = settled_rx.recv().await {
        debug!(
            path = %settled.key.display(),
            coalesced = settled.coalesced,
            "File settled"
        );
        let event = WatchEvent::Settled {
            path: settled.key,
            coalesced: settled.coalesced,
        };
        if sender.send(event).await.is_err() {
            break;
        }
    }
}

/// Scans a directory tree for existing conversation files and their sizes.
fn scan_existing_files(dir: &Path) -> Result<HashMap<PathBuf, u64>> {
    let mut sizes = HashMap::new();
    scan_directory_recursive(dir, &mut sizes)?;
    debug!(file_count = sizes.len(), "Scanned existing conversation files");
    Ok(sizes)
}

fn scan_directory_recursive(dir: &Path, sizes: &mut HashMap<PathBuf, u64>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(dir = %dir.display(), "Permission denied, skipping directory");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            scan_directory_recursive(&path, sizes)?;
        } else if is_conversation_file(&path) {
            match fs::metadata(&path) {
                Ok(meta) => {
                    trace!(path = %path.display(), size = meta.len(), "Found conversation file");
                    sizes.insert(path, meta.len());
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat conversation file");
                }
            }
        }
    }

    Ok(())
}
