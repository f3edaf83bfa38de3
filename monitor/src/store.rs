//! In-memory conversation store.
//!
//! [`ConversationStore`] is the single source of truth for conversation
//! snapshots. It has exactly one writer: every mutating method takes
//! `&mut self`, so only the owner (the ingestion task) can change state.
//! Any number of [`StoreReader`] handles can take snapshot reads
//! concurrently.
//!
//! A conversation's `current_state` is never set directly. Every mutation
//! recomputes it with [`infer_with_rule`], and when the result differs from
//! the previous state a [`StateChangeEvent`] is handed to the configured
//! [`StateChangeSink`] before the mutating call returns.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::inference::{infer_with_rule, Inference, InferenceConfig};
use crate::types::{
    ChangeTrigger, Conversation, ConversationOverview, ConversationState, ConversationSummary,
    Message, StateChangeContext, StateChangeEvent,
};

/// Receives state changes as the store produces them.
///
/// Called synchronously from the writer; implementations must not block.
pub trait StateChangeSink: Send + Sync {
    fn emit(&self, event: &StateChangeEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StateChangeSink for NullSink {
    fn emit(&self, _event: &StateChangeEvent) {}
}

impl<F> StateChangeSink for F
where
    F: Fn(&StateChangeEvent) + Send + Sync,
{
    fn emit(&self, event: &StateChangeEvent) {
        self(event);
    }
}

/// Where a conversation's content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSource {
    pub id: String,
    pub project_path: String,
    pub file_path: PathBuf,
    /// Modification time of the source file.
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Growth {
    delta: u64,
    observed_at: DateTime<Utc>,
}

type ConversationMap = Arc<RwLock<HashMap<String, Conversation>>>;

fn read(map: &ConversationMap) -> RwLockReadGuard<'_, HashMap<String, Conversation>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(map: &ConversationMap) -> RwLockWriteGuard<'_, HashMap<String, Conversation>> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable read-only view of the store.
#[derive(Clone)]
pub struct StoreReader {
    conversations: ConversationMap,
}

impl std::fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader")
            .field("conversations", &self.len())
            .finish()
    }
}

impl StoreReader {
    /// Returns a snapshot of one conversation.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Conversation> {
        read(&self.conversations).get(id).cloned()
    }

    /// Returns snapshots of every conversation, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = read(&self.conversations).values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Lightweight listing, most recently modified first.
    #[must_use]
    pub fn list(&self) -> Vec<ConversationOverview> {
        let mut list: Vec<ConversationOverview> = read(&self.conversations)
            .values()
            .map(Conversation::overview)
            .collect();
        list.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Current state of every conversation.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, ConversationState> {
        read(&self.conversations)
            .iter()
            .map(|(id, c)| (id.clone(), c.current_state))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.conversations).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single-writer conversation store.
pub struct ConversationStore {
    conversations: ConversationMap,
    growth: HashMap<String, Growth>,
    sink: Arc<dyn StateChangeSink>,
    config: InferenceConfig,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("conversations", &read(&self.conversations).len())
            .field("growth", &self.growth.len())
            .finish_non_exhaustive()
    }
}

impl ConversationStore {
    #[must_use]
    pub fn new(config: InferenceConfig, sink: Arc<dyn StateChangeSink>) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            growth: HashMap::new(),
            sink,
            config,
        }
    }

    /// Returns a read handle sharing this store's data.
    #[must_use]
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            conversations: Arc::clone(&self.conversations),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Conversation> {
        read(&self.conversations).get(id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Conversation> {
        self.reader().all()
    }

    /// Inference settings in use.
    #[must_use]
    pub fn inference_config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Registers an empty conversation for a newly discovered file.
    ///
    /// Does nothing if the conversation is already known.
    pub fn seed(&mut self, source: ConversationSource, now: DateTime<Utc>) -> Option<StateChangeEvent> {
        if read(&self.conversations).contains_key(&source.id) {
            return None;
        }
        debug!(conversation_id = %source.id, "Seeding conversation");
        self.apply(source, Vec::new(), ConversationSummary::default(), ChangeTrigger::Seed, now)
    }

    /// Replaces a conversation's messages after a re-parse.
    ///
    /// The conversation becomes reachable again if it had been marked otherwise.
    pub fn upsert(
        &mut self,
        source: ConversationSource,
        messages: Vec<Message>,
        summary: ConversationSummary,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        self.apply(source, messages, summary, ChangeTrigger::Ingest, now)
    }

    /// Records raw file growth and re-infers the conversation immediately.
    ///
    /// The growth counts as recent for one typing threshold after `now`.
    pub fn record_growth(
        &mut self,
        id: &str,
        delta: u64,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        if delta == 0 {
            return None;
        }
        self.growth.insert(
            id.to_string(),
            Growth {
                delta,
                observed_at: now,
            },
        );
        self.reinfer(id, ChangeTrigger::Growth, now)
    }

    /// Flags a conversation whose source can no longer be read.
    ///
    /// Returns `false` if the conversation is unknown.
    pub fn mark_unreachable(&mut self, id: &str) -> bool {
        match write(&self.conversations).get_mut(id) {
            Some(conversation) => {
                if conversation.reachable {
                    info!(conversation_id = %id, "Conversation marked unreachable");
                }
                conversation.reachable = false;
                true
            }
            None => false,
        }
    }

    /// Re-infers every conversation at `now`, returning the events emitted.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<StateChangeEvent> {
        let threshold = self.typing_window();
        self.growth
            .retain(|_, g| now.signed_duration_since(g.observed_at) <= threshold);

        let ids: Vec<String> = read(&self.conversations).keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.reinfer(id, ChangeTrigger::Tick, now))
            .collect()
    }

    fn typing_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.typing_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
    }

    /// Growth observed within the typing window before `now`.
    fn recent_growth(&self, id: &str, now: DateTime<Utc>) -> u64 {
        let window = self.typing_window();
        self.growth
            .get(id)
            .filter(|g| now.signed_duration_since(g.observed_at) <= window)
            .map_or(0, |g| g.delta)
    }

    fn apply(
        &mut self,
        source: ConversationSource,
        messages: Vec<Message>,
        summary: ConversationSummary,
        trigger: ChangeTrigger,
        now: DateTime<Utc>,
    ) -> Option<StateChangeEvent> {
        let growth = self.recent_growth(&source.id, now);

        let mut conversation = Conversation {
            id: source.id,
            project_path: source.project_path,
            file_path: source.file_path,
            messages,
            last_modified: source.last_modified,
            current_state: ConversationState::RecentlyActive,
            summary,
            reachable: true,
        };
        let inference = infer_with_rule(&conversation, now, growth, &self.config);
        conversation.current_state = inference.state;

        let event = {
            let mut conversations = write(&self.conversations);
            let previous = conversations.get(&conversation.id).map(|c| c.current_state);
            let event = (previous != Some(inference.state))
                .then(|| change_event(&conversation, previous, inference, trigger, now));
            conversations.insert(conversation.id.clone(), conversation);
            event
        };

        self.publish(event)
    }

    fn reinfer(&mut self, id: &str, trigger: ChangeTrigger, now: DateTime<Utc>) -> Option<StateChangeEvent> {
        let growth = self.recent_growth(id, now);

        let event = {
            let mut conversations = write(&self.conversations);
            let conversation = conversations.get_mut(id)?;
            let inference = infer_with_rule(conversation, now, growth, &self.config);
            let previous = conversation.current_state;
            if previous == inference.state {
                return None;
            }
            conversation.current_state = inference.state;
            Some(change_event(conversation, Some(previous), inference, trigger, now))
        };

        self.publish(event)
    }

    fn publish(&self, event: Option<StateChangeEvent>) -> Option<StateChangeEvent> {
        let event = event?;
        debug!(
            conversation_id = %event.conversation_id,
            previous = ?event.previous_state,
            new = ?event.new_state,
            rule = %event.context.rule,
            "State changed"
        );
        self.sink.emit(&event);
        Some(event)
    }
}

fn change_event(
    conversation: &Conversation,
    previous_state: Option<ConversationState>,
    inference: Inference,
    trigger: ChangeTrigger,
    now: DateTime<Utc>,
) -> StateChangeEvent {
    StateChangeEvent {
        conversation_id: conversation.id.clone(),
        previous_state,
        new_state: inference.state,
        context: StateChangeContext {
            project_path: conversation.project_path.clone(),
            message_count: conversation.messages.len(),
            last_message_role: conversation.last_message().map(|m| m.role),
            trigger,
            rule: inference.rule.name().to_string(),
        },
        timestamp: now,
    }
}
