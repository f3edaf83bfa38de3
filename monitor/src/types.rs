//! Core data types for conversation monitoring.
//!
//! These types describe what the ingestion pipeline reconstructs from a
//! conversation log: the ordered [`Message`] timeline, the derived
//! [`ConversationSummary`], the inferred [`ConversationState`], and the
//! [`StateChangeEvent`] emitted when that state moves.
//!
//! All types serialize with `camelCase` field names to match the JSON
//! contract consumed by dashboard clients.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Parses a role name as written in conversation logs.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "user" | "human" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A single tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Identifier used to pair the call with its result, when the log has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Tool name as reported by the assistant (e.g. `Read`, `Bash`).
    pub tool_name: String,

    /// Whether a result for this call has been recorded.
    pub has_result: bool,
}

impl ToolInvocation {
    /// Creates an invocation that has not produced a result yet.
    #[must_use]
    pub fn pending(id: Option<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id,
            tool_name: tool_name.into(),
            has_result: false,
        }
    }
}

/// One parsed message of a conversation.
///
/// Messages are immutable once parsed. Their order within a conversation is
/// the line order of the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Message {
    /// Returns `true` if any tool call in this message is still waiting for a result.
    #[must_use]
    pub fn has_unresolved_tools(&self) -> bool {
        self.tool_invocations.iter().any(|t| !t.has_result)
    }

    /// Returns `true` if the message carries no tool calls at all.
    #[must_use]
    pub fn is_plain_text(&self) -> bool {
        self.tool_invocations.is_empty()
    }
}

/// Cheap aggregate figures derived while parsing a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub message_count: usize,
    pub user_message_count: usize,
    pub assistant_message_count: usize,
    pub tool_invocation_count: usize,
    pub estimated_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Number of lines skipped as malformed.
    pub warning_count: usize,
}

/// Inferred activity of a conversation.
///
/// The first four variants are time buckets used when no richer signal
/// applies; the rest are derived from the last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    RecentlyActive,
    Idle,
    Inactive,
    Old,
    AssistantWorking,
    ExecutingTools,
    AnalyzingResults,
    AwaitingUserInput,
    TaskCompleted,
    EncounteredIssue,
    UserTyping,
}

impl ConversationState {
    /// Human-readable label for dashboards.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::RecentlyActive => "Recently active",
            Self::Idle => "Idle",
            Self::Inactive => "Inactive",
            Self::Old => "Old",
            Self::AssistantWorking => "Assistant working",
            Self::ExecutingTools => "Executing tools",
            Self::AnalyzingResults => "Analyzing results",
            Self::AwaitingUserInput => "Awaiting user input",
            Self::TaskCompleted => "Task completed",
            Self::EncounteredIssue => "Encountered issue",
            Self::UserTyping => "User typing",
        }
    }

    /// Returns `true` for the purely time-based states.
    #[must_use]
    pub fn is_time_bucket(self) -> bool {
        matches!(
            self,
            Self::RecentlyActive | Self::Idle | Self::Inactive | Self::Old
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The store's snapshot of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub project_path: String,
    pub file_path: PathBuf,
    pub messages: Vec<Message>,
    pub last_modified: DateTime<Utc>,
    pub current_state: ConversationState,
    pub summary: ConversationSummary,
    /// Cleared when the source file becomes inaccessible.
    pub reachable: bool,
}

impl Conversation {
    /// Returns the most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Builds the lightweight listing view of this conversation.
    #[must_use]
    pub fn overview(&self) -> ConversationOverview {
        ConversationOverview {
            id: self.id.clone(),
            project_path: self.project_path.clone(),
            state: self.current_state,
            state_label: self.current_state.label(),
            message_count: self.summary.message_count,
            estimated_tokens: self.summary.estimated_tokens,
            last_modified: self.last_modified,
            reachable: self.reachable,
        }
    }
}

/// Listing entry returned by the read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOverview {
    pub id: String,
    pub project_path: String,
    pub state: ConversationState,
    pub state_label: &'static str,
    pub message_count: usize,
    pub estimated_tokens: usize,
    pub last_modified: DateTime<Utc>,
    pub reachable: bool,
}

/// What caused a state to be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTrigger {
    /// A new conversation file appeared.
    Seed,
    /// The file settled after a burst of writes and was re-parsed.
    Ingest,
    /// The file grew before a full line was flushed.
    Growth,
    /// Periodic re-evaluation as time passed.
    Tick,
}

/// Extra detail attached to a [`StateChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeContext {
    pub project_path: String,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_role: Option<Role>,
    pub trigger: ChangeTrigger,
    /// Name of the inference rule that produced the new state.
    pub rule: String,
}

/// Emitted when a conversation's inferred state changes.
///
/// `previous_state` is `None` the first time a conversation is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    pub conversation_id: String,
    pub previous_state: Option<ConversationState>,
    pub new_state: ConversationState,
    pub context: StateChangeContext,
    pub timestamp: DateTime<Utc>,
}
