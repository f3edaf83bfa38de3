//! Conversation log parser.
//!
//! Turns the raw contents of a JSONL conversation log into an ordered
//! [`Message`] sequence plus a [`ConversationSummary`].
//!
//! # Record Format
//!
//! Each line is one JSON object. The parser accepts the shape written by
//! Claude Code as well as flatter variants:
//!
//! ```json
//! {"type":"user","uuid":"u1","parentUuid":null,"timestamp":"2026-01-15T10:00:00Z",
//!  "message":{"role":"user","content":"Fix the failing test"}}
//! {"type":"assistant","uuid":"a1","parentUuid":"u1","timestamp":"2026-01-15T10:00:02Z",
//!  "message":{"role":"assistant","content":[
//!     {"type":"text","text":"Running the tests."},
//!     {"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"cargo test"}}]}}
//! {"type":"user","uuid":"u2","timestamp":"2026-01-15T10:00:09Z",
//!  "message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_1"}]}}
//! ```
//!
//! A `user` record made only of `tool_result` blocks is not a user message:
//! it resolves the matching invocation (`has_result = true`) and is folded away.
//!
//! # Failure Handling
//!
//! Lines are parsed independently. A malformed line is skipped and reported
//! as a [`ParseWarning`]; append-only files are routinely read while the last
//! line is still being written. Records of other types (`summary`, `system`,
//! `progress`, ...) are ignored without a warning.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{ConversationSummary, Message, Role, ToolInvocation};

/// Rough number of characters per token used for the size heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// A single skipped line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseWarning {
    /// 1-based line number in the source file.
    pub line: usize,
    pub reason: String,
}

/// Output of [`parse`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConversation {
    pub messages: Vec<Message>,
    pub summary: ConversationSummary,
    pub warnings: Vec<ParseWarning>,
}

/// Raw record structure for deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type", default)]
    record_type: Option<String>,

    #[serde(default)]
    role: Option<String>,

    #[serde(default, alias = "id")]
    uuid: Option<String>,

    #[serde(default, alias = "parentId")]
    parent_uuid: Option<String>,

    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    message: Option<RawMessage>,

    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: Option<String>,

    #[serde(default)]
    content: Option<RawContent>,
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Content of one record after flattening its blocks.
#[derive(Debug, Default)]
struct RecordBody {
    text: Option<String>,
    tools: Vec<ToolInvocation>,
    results: Vec<Option<String>>,
}

impl RecordBody {
    fn from_content(content: Option<RawContent>) -> Self {
        let mut body = Self::default();
        let mut text_parts: Vec<String> = Vec::new();

        match content {
            None => {}
            Some(RawContent::Text(text)) => text_parts.push(text),
            Some(RawContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        RawBlock::Text { text } => text_parts.push(text),
                        RawBlock::ToolUse { id, name } => {
                            body.tools.push(ToolInvocation::pending(id, name));
                        }
                        RawBlock::ToolResult { tool_use_id } => body.results.push(tool_use_id),
                        RawBlock::Other => {}
                    }
                }
            }
        }

        let text = text_parts
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            body.text = Some(text);
        }

        body
    }

    /// A record that only carries tool results.
    fn is_result_only(&self) -> bool {
        !self.results.is_empty() && self.text.is_none() && self.tools.is_empty()
    }
}

/// Incremental state while walking the lines of one file.
#[derive(Debug, Default)]
struct ParseState {
    messages: Vec<Message>,
    warnings: Vec<ParseWarning>,
    /// Tool invocation id -> (message index, invocation index).
    tool_index: HashMap<String, (usize, usize)>,
    last_activity: Option<DateTime<Utc>>,
}

impl ParseState {
    fn warn(&mut self, line: usize, reason: impl Into<String>) {
        let warning = ParseWarning {
            line,
            reason: reason.into(),
        };
        debug!(line, reason = %warning.reason, "Skipping malformed record");
        self.warnings.push(warning);
    }

    fn accept(&mut self, line_no: usize, line: &str) {
        let record: RawRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                self.warn(line_no, format!("invalid record: {e}"));
                return;
            }
        };

        let (message_role, message_content) = match record.message {
            Some(m) => (m.role, m.content),
            None => (None, None),
        };

        let role_name = message_role
            .or(record.role)
            .or_else(|| record.record_type.clone());
        let role = match role_name.as_deref().and_then(Role::from_name) {
            Some(role) => role,
            None if record.record_type.is_some() => {
                trace!(line = line_no, record_type = ?record.record_type, "Ignoring non-message record");
                return;
            }
            None => {
                self.warn(line_no, "missing or unknown role");
                return;
            }
        };

        let Some(timestamp) = record.timestamp else {
            self.warn(line_no, "missing timestamp");
            return;
        };

        self.last_activity = Some(self.last_activity.map_or(timestamp, |t| t.max(timestamp)));

        let body = RecordBody::from_content(message_content.or(record.content));
        self.resolve_results(&body.results);

        if role == Role::User && body.is_result_only() {
            trace!(line = line_no, "Folded tool results into earlier invocation");
            return;
        }

        let index = self.messages.len();
        for (slot, tool) in body.tools.iter().enumerate() {
            if let Some(id) = &tool.id {
                self.tool_index.insert(id.clone(), (index, slot));
            }
        }

        self.messages.push(Message {
            id: record.uuid.unwrap_or_else(|| format!("line-{line_no}")),
            role,
            timestamp,
            text_content: body.text,
            tool_invocations: body.tools,
            parent_id: record.parent_uuid,
        });
    }

    /// Marks invocations answered by `results` as resolved.
    ///
    /// A result without an id resolves the oldest pending call of the most
    /// recent assistant message.
    fn resolve_results(&mut self, results: &[Option<String>]) {
        for result in results {
            let target = match result {
                Some(id) => self.tool_index.get(id).copied(),
                None => self.latest_pending_invocation(),
            };

            if let Some((message, slot)) = target {
                if let Some(tool) = self
                    .messages
                    .get_mut(message)
                    .and_then(|m| m.tool_invocations.get_mut(slot))
                {
                    tool.has_result = true;
                }
            }
        }
    }

    fn latest_pending_invocation(&self) -> Option<(usize, usize)> {
        let (index, message) = self
            .messages
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.role == Role::Assistant)?;
        let slot = message
            .tool_invocations
            .iter()
            .position(|t| !t.has_result)?;
        Some((index, slot))
    }

    fn finish(self) -> ParsedConversation {
        let summary = summarize(&self.messages, self.last_activity, self.warnings.len());
        ParsedConversation {
            messages: self.messages,
            summary,
            warnings: self.warnings,
        }
    }
}

/// Parses the full contents of a conversation log.
///
/// Never fails: every line that cannot be understood becomes a
/// [`ParseWarning`] and the rest of the file is still returned.
///
/// # Example
///
/// ```
/// use chatpulse_monitor::parser::parse;
///
/// let raw = concat!(
///     r#"{"type":"user","timestamp":"2026-01-15T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
///     "\n",
///     "{ truncated",
/// );
/// let parsed = parse(raw);
/// assert_eq!(parsed.messages.len(), 1);
/// assert_eq!(parsed.warnings.len(), 1);
/// ```
#[must_use]
pub fn parse(raw: &str) -> ParsedConversation {
    let mut state = ParseState::default();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        state.accept(index + 1, line);
    }

    state.finish()
}

/// Builds the summary for an already-parsed message list.
fn summarize(
    messages: &[Message],
    last_activity: Option<DateTime<Utc>>,
    warning_count: usize,
) -> ConversationSummary {
    let user_message_count = messages.iter().filter(|m| m.role == Role::User).count();
    let tool_invocation_count = messages.iter().map(|m| m.tool_invocations.len()).sum();

    ConversationSummary {
        message_count: messages.len(),
        user_message_count,
        assistant_message_count: messages.len() - user_message_count,
        tool_invocation_count,
        estimated_tokens: estimate_tokens(messages),
        last_activity,
        warning_count,
    }
}

/// Size-proportional token estimate over message text and tool names.
#[must_use]
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages
        .iter()
        .map(|m| {
            let text = m.text_content.as_deref().map_or(0, |t| t.chars().count());
            let tools: usize = m.tool_invocations.iter().map(|t| t.tool_name.len()).sum();
            text + tools
        })
        .sum();

    chars.div_ceil(CHARS_PER_TOKEN)
}
