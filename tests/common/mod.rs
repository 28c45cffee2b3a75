// Not every test binary uses every helper.
#![allow(dead_code)]

pub mod fault_injection;

use duraflow::providers::{FsHistoryStore, HistoryStore, InMemoryHistoryStore};
use duraflow::runtime::{RetryPolicy, RuntimeOptions};
use duraflow::{Event, History};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub async fn wait_for_history<F>(store: StdArc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&History) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn HistoryStore>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&History) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if let Some(e) = selector(&hist) {
                return Some(e);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until an `ActivityScheduled` with the given sequence id is recorded.
pub async fn wait_for_scheduled(store: StdArc<dyn HistoryStore>, instance: &str, sequence_id: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::ActivityScheduled { sequence_id: s, .. } if *s == sequence_id))
        },
        5_000,
    )
    .await
}

pub fn kinds(history: &History) -> Vec<&'static str> {
    history.iter().map(Event::kind).collect()
}

pub fn count_kind(history: &History, kind: &str) -> usize {
    history.iter().filter(|e| e.kind() == kind).count()
}

pub fn in_memory_store() -> StdArc<dyn HistoryStore> {
    StdArc::new(InMemoryHistoryStore::new()) as StdArc<dyn HistoryStore>
}

pub fn create_fs_store() -> (StdArc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    (store, td)
}

/// Options with short backoffs so retry tests finish quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        activity_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(50),
        },
        instance_idle_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}
