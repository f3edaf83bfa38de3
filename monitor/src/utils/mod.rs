//! Utility modules for the ChatPulse monitor.
//!
//! - [`debounce`]: Per-key settle timer for bursts of file notifications
//! - [`session_filename`]: Conversation identity from log file paths

pub mod debounce;
pub mod session_filename;

pub use debounce::{Debouncer, DebouncerError, Settled, DEFAULT_DEBOUNCE_MS};
pub use session_filename::{conversation_identity, is_conversation_file, ConversationIdentity};
