//! Per-key settle timer for bursts of file notifications.
//!
//! A key is reported once, after no further notification for that key has
//! arrived for the configured interval. Every notification resets the key's
//! timer; timers never stack, so N notifications spaced closer than the
//! interval produce exactly one [`Settled`] output.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use chatpulse_monitor::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (settled_tx, mut settled_rx) = mpsc::channel(100);
//!     let debouncer = Debouncer::new(Duration::from_millis(100), settled_tx);
//!
//!     let path = PathBuf::from("/logs/session.jsonl");
//!     for _ in 0..3 {
//!         debouncer.notify(path.clone()).await.unwrap();
//!     }
//!
//!     let settled = settled_rx.recv().await.unwrap();
//!     assert_eq!(settled.key, path);
//!     assert_eq!(settled.coalesced, 3);
//! }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default settle interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Error type for debouncer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebouncerError {
    /// The background task has stopped.
    ChannelClosed,
}

impl std::fmt::Display for DebouncerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "debouncer channel closed"),
        }
    }
}

impl std::error::Error for DebouncerError {}

/// A key whose burst of notifications has gone quiet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled<K> {
    pub key: K,
    /// Number of notifications folded into this output.
    pub coalesced: usize,
    /// When the first notification of the burst arrived.
    pub first_seen: Instant,
}

#[derive(Debug)]
struct Pending {
    deadline: Instant,
    coalesced: usize,
    first_seen: Instant,
}

/// Coalesces notifications per key.
///
/// Dropping the debouncer closes its input; pending keys are flushed
/// immediately and the background task exits.
#[derive(Debug)]
pub struct Debouncer<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    input_tx: mpsc::Sender<K>,
}

impl<K> Debouncer<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Spawns the settle loop and returns its input handle.
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<Settled<K>>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(1000);

        tokio::spawn(async move {
            run_settle_loop(interval, input_rx, output_tx).await;
        });

        Self { input_tx }
    }

    /// Records a notification for `key`, restarting its timer.
    ///
    /// # Errors
    ///
    /// Returns `DebouncerError::ChannelClosed` if the background task has
    /// terminated.
    pub async fn notify(&self, key: K) -> Result<(), DebouncerError> {
        self.input_tx
            .send(key)
            .await
            .map_err(|_| DebouncerError::ChannelClosed)
    }

    /// Non-blocking variant of [`notify`](Self::notify).
    ///
    /// Returns `false` if the input queue is full or closed.
    pub fn try_notify(&self, key: K) -> bool {
        self.input_tx.try_send(key).is_ok()
    }
}

async fn run_settle_loop<K>(
    interval: Duration,
    mut input_rx: mpsc::Receiver<K>,
    output_tx: mpsc::Sender<Settled<K>>,
) where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    let mut pending: HashMap<K, Pending> = HashMap::new();

    debug!(interval_ms = interval.as_millis(), "Starting debounce loop");

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            key = input_rx.recv() => {
                let Some(key) = key else {
                    debug!(pending = pending.len(), "Input closed, flushing pending keys");
                    flush_all_pending(&mut pending, &output_tx).await;
                    break;
                };

                let now = Instant::now();
                let entry = pending.entry(key.clone()).or_insert(Pending {
                    deadline: now,
                    coalesced: 0,
                    first_seen: now,
                });
                entry.deadline = now + interval;
                entry.coalesced += 1;
                trace!(key = ?key, coalesced = entry.coalesced, "Timer reset");
            }

            () = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                if !emit_expired(&mut pending, &output_tx).await {
                    break;
                }
            }
        }
    }

    debug!("Debounce loop terminated");
}

/// Emits every key whose deadline has passed. Returns `false` once the
/// receiver is gone.
async fn emit_expired<K>(
    pending: &mut HashMap<K, Pending>,
    output_tx: &mpsc::Sender<Settled<K>>,
) -> bool
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    let now = Instant::now();
    let expired: Vec<K> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(key, _)| key.clone())
        .collect();

    for key in expired {
        let Some(p) = pending.remove(&key) else {
            continue;
        };
        trace!(key = ?key, coalesced = p.coalesced, "Key settled");
        let settled = Settled {
            key,
            coalesced: p.coalesced,
            first_seen: p.first_seen,
        };
        if output_tx.send(settled).await.is_err() {
            warn!("Settled receiver dropped, stopping debounce loop");
            return false;
        }
    }
    true
}

async fn flush_all_pending<K>(
    pending: &mut HashMap<K, Pending>,
    output_tx: &mpsc::Sender<Settled<K>>,
) where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    for (key, p) in pending.drain() {
        let settled = Settled {
            key,
            coalesced: p.coalesced,
            first_seen: p.first_seen,
        };
        if let Err(e) = output_tx.send(settled).await {
            warn!(key = ?e.0.key, "Failed to flush pending key");
        }
    }
}
