//! State inference engine.
//!
//! [`infer`] maps a conversation's last message, the time elapsed, and the
//! recent growth of its source file to a [`ConversationState`]. It is a pure
//! function: the same inputs always produce the same state, and nothing else
//! is consulted.
//!
//! Classification is an ordered list of [`Rule`]s; the first rule that
//! produces a state wins.
//!
//! | # | Rule            | Produces |
//! |---|-----------------|----------|
//! | 1 | `UserMessage`   | `AssistantWorking` when the last message is from the user |
//! | 2 | `ToolActivity`  | `ExecutingTools` for unresolved calls, `AnalyzingResults` after a resolved read-class call |
//! | 3 | `UserTyping`    | `UserTyping` after a plain assistant reply older than the typing threshold, with no file growth |
//! | 4 | `MessageContent`| `TaskCompleted`, `EncounteredIssue` or `AwaitingUserInput` from reply wording |
//! | 5 | `TimeBucket`    | `RecentlyActive`, `Idle`, `Inactive` or `Old` from time since last modification |
//!
//! Rules 1 to 4 only apply while the last message is inside the activity
//! horizon (the recently-active threshold). Past it the time buckets decide.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{Conversation, ConversationState, Message, Role};

/// Default typing threshold in seconds.
pub const DEFAULT_TYPING_THRESHOLD_SECS: u64 = 30;

/// Default RecentlyActive -> Idle boundary in minutes.
pub const DEFAULT_RECENT_MINUTES: u64 = 5;

/// Default Idle -> Inactive boundary in minutes.
pub const DEFAULT_IDLE_MINUTES: u64 = 60;

/// Default Inactive -> Old boundary in minutes.
pub const DEFAULT_INACTIVE_MINUTES: u64 = 1440;

const DEFAULT_COMPLETION_KEYWORDS: &[&str] = &[
    "done",
    "completed",
    "finished",
    "all set",
    "successfully",
    "task complete",
    "is now working",
    "all tests pass",
];

const DEFAULT_ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "failure",
    "exception",
    "unable to",
    "cannot",
    "couldn't",
    "traceback",
    "panicked",
];

const DEFAULT_SOLICITATION_PHRASES: &[&str] = &[
    "would you like",
    "do you want",
    "should i",
    "shall i",
    "let me know",
    "please confirm",
    "which option",
    "what would you prefer",
];

const DEFAULT_READ_TOOLS: &[&str] = &[
    "read",
    "grep",
    "glob",
    "ls",
    "webfetch",
    "websearch",
    "notebookread",
];

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// Thresholds and keyword sets used by [`infer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Quiet time after a plain assistant reply before the user is assumed to be typing.
    pub typing_threshold: Duration,
    pub recent: Duration,
    pub idle: Duration,
    pub inactive: Duration,
    pub completion_keywords: Vec<String>,
    pub error_keywords: Vec<String>,
    pub solicitation_phrases: Vec<String>,
    /// Tool names (case-insensitive) that only inspect state.
    pub read_tools: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            typing_threshold: Duration::from_secs(DEFAULT_TYPING_THRESHOLD_SECS),
            recent: Duration::from_secs(DEFAULT_RECENT_MINUTES * 60),
            idle: Duration::from_secs(DEFAULT_IDLE_MINUTES * 60),
            inactive: Duration::from_secs(DEFAULT_INACTIVE_MINUTES * 60),
            completion_keywords: owned(DEFAULT_COMPLETION_KEYWORDS),
            error_keywords: owned(DEFAULT_ERROR_KEYWORDS),
            solicitation_phrases: owned(DEFAULT_SOLICITATION_PHRASES),
            read_tools: owned(DEFAULT_READ_TOOLS),
        }
    }
}

impl InferenceConfig {
    fn is_read_tool(&self, name: &str) -> bool {
        self.read_tools.iter().any(|t| t.eq_ignore_ascii_case(name))
    }
}

/// One classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    UserMessage,
    ToolActivity,
    UserTyping,
    MessageContent,
    TimeBucket,
}

/// Evaluation order.
pub const RULES: [Rule; 5] = [
    Rule::UserMessage,
    Rule::ToolActivity,
    Rule::UserTyping,
    Rule::MessageContent,
    Rule::TimeBucket,
];

impl Rule {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::ToolActivity => "tool_activity",
            Self::UserTyping => "user_typing",
            Self::MessageContent => "message_content",
            Self::TimeBucket => "time_bucket",
        }
    }

    fn evaluate(self, input: &Input<'_>) -> Option<ConversationState> {
        match self {
            Self::UserMessage => user_message(input.live_message()?),
            Self::ToolActivity => tool_activity(input.live_message()?, input.config),
            Self::UserTyping => user_typing(input.live_message()?, input),
            Self::MessageContent => message_content(input.live_message()?, input.config),
            Self::TimeBucket => Some(time_bucket(input.since_modified, input.config)),
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A state together with the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inference {
    pub state: ConversationState,
    pub rule: Rule,
}

struct Input<'a> {
    last: Option<&'a Message>,
    since_message: Duration,
    since_modified: Duration,
    recent_size_delta: u64,
    config: &'a InferenceConfig,
}

impl<'a> Input<'a> {
    /// The last message, if it is still inside the activity horizon.
    fn live_message(&self) -> Option<&'a Message> {
        self.last.filter(|_| self.since_message <= self.config.recent)
    }
}

/// Elapsed time from `then` to `now`, clamped at zero for future timestamps.
fn elapsed(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Infers the state of `conversation` at `now`.
///
/// `recent_size_delta` is the number of bytes the source file grew within
/// the recent window; any growth suppresses `UserTyping`.
#[must_use]
pub fn infer(
    conversation: &Conversation,
    now: DateTime<Utc>,
    recent_size_delta: u64,
    config: &InferenceConfig,
) -> ConversationState {
    infer_with_rule(conversation, now, recent_size_delta, config).state
}

/// Like [`infer`], also reporting which rule matched.
#[must_use]
pub fn infer_with_rule(
    conversation: &Conversation,
    now: DateTime<Utc>,
    recent_size_delta: u64,
    config: &InferenceConfig,
) -> Inference {
    let last = conversation.last_message();
    let input = Input {
        last,
        since_message: last.map_or(Duration::MAX, |m| elapsed(m.timestamp, now)),
        since_modified: elapsed(conversation.last_modified, now),
        recent_size_delta,
        config,
    };

    RULES
        .iter()
        .find_map(|rule| {
            rule.evaluate(&input)
                .map(|state| Inference { state, rule: *rule })
        })
        .unwrap_or(Inference {
            state: time_bucket(input.since_modified, config),
            rule: Rule::TimeBucket,
        })
}

fn user_message(message: &Message) -> Option<ConversationState> {
    (message.role == Role::User).then_some(ConversationState::AssistantWorking)
}

fn tool_activity(message: &Message, config: &InferenceConfig) -> Option<ConversationState> {
    if message.role != Role::Assistant || message.tool_invocations.is_empty() {
        return None;
    }

    if message.has_unresolved_tools() {
        return Some(ConversationState::ExecutingTools);
    }

    message
        .tool_invocations
        .last()
        .filter(|tool| config.is_read_tool(&tool.tool_name))
        .map(|_| ConversationState::AnalyzingResults)
}

fn user_typing(message: &Message, input: &Input<'_>) -> Option<ConversationState> {
    let typing = message.role == Role::Assistant
        && message.is_plain_text()
        && input.since_message > input.config.typing_threshold
        && input.recent_size_delta == 0;
    typing.then_some(ConversationState::UserTyping)
}

fn message_content(message: &Message, config: &InferenceConfig) -> Option<ConversationState> {
    if message.role != Role::Assistant {
        return None;
    }
    let text = message.text_content.as_deref()?;
    let normalized = normalize(text);

    if contains_any(&normalized, &config.completion_keywords) {
        return Some(ConversationState::TaskCompleted);
    }
    if contains_any(&normalized, &config.error_keywords) {
        return Some(ConversationState::EncounteredIssue);
    }
    if text.trim_end().ends_with('?') || contains_any(&normalized, &config.solicitation_phrases)
    {
        return Some(ConversationState::AwaitingUserInput);
    }
    None
}

fn time_bucket(since_modified: Duration, config: &InferenceConfig) -> ConversationState {
    if since_modified < config.recent {
        ConversationState::RecentlyActive
    } else if since_modified < config.idle {
        ConversationState::Idle
    } else if since_modified < config.inactive {
        ConversationState::Inactive
    } else {
        ConversationState::Old
    }
}

/// Lowercases and pads words with single spaces so phrases match on word
/// boundaries only.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() || c == '\'' || c == '\u{2019}' {
            out.push(if c == '\u{2019}' { '\'' } else { c });
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn contains_any(normalized: &str, phrases: &[String]) -> bool {
    phrases.iter().any(|phrase| {
        let needle = normalize(phrase);
        !needle.trim().is_empty() && normalized.contains(&needle)
    })
}
