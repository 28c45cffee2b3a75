use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{prepare_append, CreateOutcome, History, HistoryStore, InstanceRecord, ProviderError};
use crate::Event;

#[derive(Default)]
struct State {
    records: HashMap<String, InstanceRecord>,
    histories: HashMap<String, Vec<Event>>,
    // dedup key -> instance id
    dedup: HashMap<String, String>,
}

/// Process-local store. A single lock covers records, histories and the
/// dedup index, which makes every operation linearizable.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<CreateOutcome, ProviderError> {
        let mut g = self.state.lock().await;
        if let Some(key) = &record.dedup_key {
            if let Some(owner) = g.dedup.get(key) {
                if let Some(existing) = g.records.get(owner) {
                    return Ok(CreateOutcome::Existing(existing.clone()));
                }
            }
        }
        if g.records.contains_key(&record.instance_id) {
            return Err(ProviderError::InstanceAlreadyExists(record.instance_id));
        }
        if let Some(key) = &record.dedup_key {
            g.dedup.insert(key.clone(), record.instance_id.clone());
        }
        g.histories.insert(record.instance_id.clone(), Vec::new());
        g.records.insert(record.instance_id.clone(), record);
        Ok(CreateOutcome::Created)
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.state.lock().await.records.get(instance).cloned())
    }

    async fn read(&self, instance: &str) -> Result<History, ProviderError> {
        let g = self.state.lock().await;
        match g.histories.get(instance) {
            Some(events) => Ok(History::new(events.clone())),
            None => Err(ProviderError::InstanceNotFound(instance.to_string())),
        }
    }

    async fn append(&self, instance: &str, expected_version: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut g = self.state.lock().await;
        let log = g
            .histories
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        let accepted = prepare_append(instance, log, expected_version, events)?;
        log.extend(accepted);
        Ok(log.len() as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.state.lock().await.records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let record = g
            .records
            .remove(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        g.histories.remove(instance);
        if let Some(key) = record.dedup_key {
            g.dedup.remove(&key);
        }
        Ok(())
    }
}
