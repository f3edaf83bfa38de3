//! ChatPulse Monitor - conversation log ingestion and state inference.
//!
//! This crate watches a tree of append-only conversation logs (by default
//! `~/.claude/projects/**/*.jsonl`), reconstructs each conversation's message
//! timeline, and infers a live activity state for it.
//!
//! # Overview
//!
//! ```text
//! FileWatcher ─▶ Debouncer ─▶ Ingestor ─▶ ContentCache ─▶ parser ─▶ ConversationStore
//!                                                                      │
//!                                                    infer() ◀─────────┤
//!                                                                      ▼
//!                                                              StateChangeSink
//! ```
//!
//! # Modules
//!
//! - [`types`]: Messages, conversations, states and state-change events
//! - [`cache`]: Signature-validated file content cache
//! - [`parser`]: JSONL conversation log parsing
//! - [`inference`]: Ordered-rule state inference
//! - [`watcher`]: File system watcher for conversation logs
//! - [`store`]: Single-writer in-memory conversation store
//! - [`ingest`]: Ingest task and monitor lifecycle
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations
//! - [`utils`]: Debouncing and path helpers

pub mod cache;
pub mod config;
pub mod error;
pub mod inference;
pub mod ingest;
pub mod parser;
pub mod store;
pub mod types;
pub mod utils;
pub mod watcher;

pub use cache::{CacheError, CacheOptions, CachedContent, ContentCache, Signature};
pub use config::{Config, ConfigError};
pub use error::{MonitorError, Result};
pub use inference::{infer, infer_with_rule, Inference, InferenceConfig, Rule};
pub use ingest::{snapshot, IngestStats, Ingestor, MonitorHandle};
pub use parser::{parse, ParseWarning, ParsedConversation};
pub use store::{ConversationSource, ConversationStore, NullSink, StateChangeSink, StoreReader};
pub use types::{
    ChangeTrigger, Conversation, ConversationOverview, ConversationState, ConversationSummary,
    Message, Role, StateChangeContext, StateChangeEvent, ToolInvocation,
};
pub use utils::{Debouncer, DebouncerError, DEFAULT_DEBOUNCE_MS};
pub use watcher::{discover_conversation_files, FileWatcher, WatchEvent, WatcherError};
