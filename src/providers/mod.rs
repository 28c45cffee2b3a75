use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::Event;

mod error;
pub use error::ProviderError;

/// Immutable snapshot of an instance's history.
///
/// Backed by an `Arc`, so clones are cheap and the same snapshot can be
/// iterated any number of times across replay turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    events: Arc<Vec<Event>>,
}

impl History {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events: Arc::new(events) }
    }

    /// Number of events; the value to pass as `expected_version` on append.
    pub fn version(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }

    pub fn is_terminal(&self) -> bool {
        self.events.iter().any(Event::is_terminal)
    }

    /// A copy of this history with `delta` appended, ids assigned in order.
    pub fn extended(&self, delta: &[Event]) -> History {
        let mut events = Vec::with_capacity(self.events.len() + delta.len());
        events.extend(self.events.iter().cloned());
        for e in delta {
            let mut e = e.clone();
            e.set_event_id(events.len() as u64 + 1);
            events.push(e);
        }
        History::new(events)
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Instance metadata written once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub created_at_ms: u64,
    #[serde(default)]
    pub dedup_key: Option<String>,
}

/// Result of `HistoryStore::create_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The dedup key was already taken; carries the record that owns it.
    Existing(InstanceRecord),
}

/// Append-only, per-instance strongly consistent event log.
///
/// Implementations must make an appended batch visible to every later read
/// before `append` returns, and must apply the batch all-or-nothing.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create the instance record with an empty history. With a dedup key
    /// that is already in use, nothing is created and the existing record
    /// is returned.
    async fn create_instance(&self, record: InstanceRecord) -> Result<CreateOutcome, ProviderError>;

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Read the full history. Unknown instances yield `InstanceNotFound`.
    async fn read(&self, instance: &str) -> Result<History, ProviderError>;

    /// Append `events` if the log currently holds exactly `expected_version`
    /// events. Returns the new version.
    ///
    /// The store assigns event ids and discards completions for sequence ids
    /// that already have one, as well as anything after a terminal event.
    async fn append(&self, instance: &str, expected_version: u64, events: Vec<Event>) -> Result<u64, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Remove the record, history and dedup key of an instance.
    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError>;
}

/// Validate `expected_version` and return the events that should actually be
/// written, with ids assigned. Shared by the bundled stores.
pub(crate) fn prepare_append(
    instance: &str,
    existing: &[Event],
    expected_version: u64,
    events: Vec<Event>,
) -> Result<Vec<Event>, ProviderError> {
    let actual = existing.len() as u64;
    if actual != expected_version {
        return Err(ProviderError::ConcurrencyConflict {
            instance: instance.to_string(),
            expected: expected_version,
            actual,
        });
    }
    let mut closed = existing.iter().any(Event::is_terminal);
    let mut completed: HashSet<u64> = existing
        .iter()
        .filter(|e| e.is_completion())
        .filter_map(Event::sequence_id)
        .collect();

    let mut accepted = Vec::with_capacity(events.len());
    for mut e in events {
        if closed {
            tracing::debug!(instance_id = %instance, kind = e.kind(), "discarding event after terminal");
            continue;
        }
        if e.is_completion() {
            if let Some(seq) = e.sequence_id() {
                if !completed.insert(seq) {
                    tracing::debug!(instance_id = %instance, sequence_id = seq, "discarding duplicate completion");
                    continue;
                }
            }
        }
        closed = e.is_terminal();
        e.set_event_id(actual + accepted.len() as u64 + 1);
        accepted.push(e);
    }
    Ok(accepted)
}

// Providers are datastores only; the runtime owns queues and workers.

/// In-memory provider for tests and embedded use.
pub mod in_memory;
/// Filesystem-backed provider, durable across restarts.
pub mod fs;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;
