//! Fault-injecting store wrappers.
//!
//! Wrap a real `HistoryStore` and make `append` fail a configurable number of
//! times, to exercise the coordinator's re-read-and-redo path.

use async_trait::async_trait;
use duraflow::providers::{CreateOutcome, HistoryStore, InstanceRecord, ProviderError};
use duraflow::{Event, History};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Another writer appended first.
    Conflict,
    /// Transient storage failure.
    Busy,
    /// The write lands, then the store reports a transient failure.
    CommitThenBusy,
}

/// Fails the next `remaining` appends with `fault`, then delegates.
pub struct FaultInjectingStore {
    inner: Arc<dyn HistoryStore>,
    fault: Fault,
    skip: AtomicU32,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn HistoryStore>, fault: Fault, count: u32) -> Self {
        Self {
            inner,
            fault,
            skip: AtomicU32::new(0),
            remaining: AtomicU32::new(count),
            injected: AtomicU32::new(0),
        }
    }

    /// Let the first `appends` appends through untouched.
    pub fn after(self, appends: u32) -> Self {
        self.skip.store(appends, Ordering::SeqCst);
        self
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_fault(&self) -> bool {
        if self
            .skip
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HistoryStore for FaultInjectingStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<CreateOutcome, ProviderError> {
        self.inner.create_instance(record).await
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.inner.read_instance(instance).await
    }

    async fn read(&self, instance: &str) -> Result<History, ProviderError> {
        self.inner.read(instance).await
    }

    async fn append(&self, instance: &str, expected_version: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        if self.take_fault() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            if let Fault::CommitThenBusy = self.fault {
                self.inner.append(instance, expected_version, events).await?;
                return Err(ProviderError::retryable("append", "injected: sync failed after write"));
            }
            return Err(match self.fault {
                Fault::Conflict => ProviderError::ConcurrencyConflict {
                    instance: instance.to_string(),
                    expected: expected_version,
                    actual: expected_version + 1,
                },
                Fault::Busy | Fault::CommitThenBusy => ProviderError::retryable("append", "injected: store busy"),
            });
        }
        self.inner.append(instance, expected_version, events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.inner.purge_instance(instance).await
    }
}
