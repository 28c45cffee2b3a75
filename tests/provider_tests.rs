//! Store contract, run against every bundled `HistoryStore`.

use duraflow::providers::{CreateOutcome, HistoryStore, InstanceRecord, ProviderError};
use duraflow::{Event, UNASSIGNED_EVENT_ID as U};
use std::sync::Arc;

mod common;

fn record(id: &str, key: Option<&str>) -> InstanceRecord {
    InstanceRecord {
        instance_id: id.to_string(),
        orchestration: "Flow".to_string(),
        input: "in".to_string(),
        created_at_ms: 7,
        dedup_key: key.map(str::to_string),
    }
}

fn started() -> Event {
    Event::OrchestratorStarted {
        event_id: U,
        name: "Flow".into(),
        input: "in".into(),
    }
}

fn scheduled(seq: u64) -> Event {
    Event::ActivityScheduled {
        event_id: U,
        sequence_id: seq,
        name: "A".into(),
        input: seq.to_string(),
    }
}

fn completed(seq: u64, output: &str) -> Event {
    Event::ActivityCompleted {
        event_id: U,
        sequence_id: seq,
        output: output.into(),
    }
}

async fn create_read_append(store: Arc<dyn HistoryStore>) {
    assert!(matches!(
        store.create_instance(record("i1", None)).await.unwrap(),
        CreateOutcome::Created
    ));
    assert_eq!(store.read_instance("i1").await.unwrap(), Some(record("i1", None)));
    assert!(store.read("i1").await.unwrap().is_empty());

    assert_eq!(store.append("i1", 0, vec![started(), scheduled(1)]).await.unwrap(), 2);
    assert_eq!(store.append("i1", 2, vec![completed(1, "a")]).await.unwrap(), 3);

    let history = store.read("i1").await.unwrap();
    assert_eq!(history.version(), 3);
    let ids: Vec<u64> = history.iter().map(Event::event_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(common::kinds(&history), vec!["OrchestratorStarted", "ActivityScheduled", "ActivityCompleted"]);

    assert!(matches!(
        store.create_instance(record("i1", None)).await,
        Err(ProviderError::InstanceAlreadyExists(_))
    ));
}

async fn stale_version_is_rejected(store: Arc<dyn HistoryStore>) {
    store.create_instance(record("i2", None)).await.unwrap();
    store.append("i2", 0, vec![started()]).await.unwrap();

    let err = store.append("i2", 0, vec![scheduled(1)]).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::ConcurrencyConflict { expected, actual, .. } => {
            assert_eq!((expected, actual), (0, 1));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(store.read("i2").await.unwrap().version(), 1);
}

async fn duplicate_and_post_terminal_events_are_discarded(store: Arc<dyn HistoryStore>) {
    store.create_instance(record("i3", None)).await.unwrap();
    store.append("i3", 0, vec![started(), scheduled(1)]).await.unwrap();
    let v = store
        .append("i3", 2, vec![completed(1, "first"), completed(1, "second")])
        .await
        .unwrap();
    assert_eq!(v, 3);

    let v = store
        .append(
            "i3",
            3,
            vec![
                Event::OrchestratorCompleted {
                    event_id: U,
                    output: "first".into(),
                },
                scheduled(2),
            ],
        )
        .await
        .unwrap();
    assert_eq!(v, 4);
    let history = store.read("i3").await.unwrap();
    assert!(history.is_terminal());
    assert_eq!(common::count_kind(&history, "ActivityCompleted"), 1);

    // Nothing is accepted once closed
    assert_eq!(store.append("i3", 4, vec![completed(2, "late")]).await.unwrap(), 4);
}

async fn unknown_instance_is_not_found(store: Arc<dyn HistoryStore>) {
    assert!(matches!(store.read("ghost").await, Err(ProviderError::InstanceNotFound(_))));
    assert!(matches!(
        store.append("ghost", 0, vec![started()]).await,
        Err(ProviderError::InstanceNotFound(_))
    ));
    assert_eq!(store.read_instance("ghost").await.unwrap(), None);
    assert!(matches!(
        store.purge_instance("ghost").await,
        Err(ProviderError::InstanceNotFound(_))
    ));
}

async fn concurrent_appends_at_same_version(store: Arc<dyn HistoryStore>) {
    store.create_instance(record("race", None)).await.unwrap();
    store.append("race", 0, vec![started()]).await.unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|n| {
            let s = store.clone();
            tokio::spawn(async move { s.append("race", 1, vec![scheduled(n + 1)]).await })
        })
        .collect();
    let results: Vec<Result<u64, ProviderError>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ProviderError::ConcurrencyConflict { .. })));
    assert_eq!(store.read("race").await.unwrap().version(), 2);
}

async fn concurrent_deduped_creates(store: Arc<dyn HistoryStore>) {
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let s = store.clone();
            tokio::spawn(async move { s.create_instance(record(&format!("d{n}"), Some("once"))).await })
        })
        .collect();
    let outcomes: Vec<CreateOutcome> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let created = outcomes.iter().filter(|o| matches!(o, CreateOutcome::Created)).count();
    assert_eq!(created, 1);
    let owners: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| match o {
            CreateOutcome::Existing(rec) => Some(rec.instance_id.as_str()),
            CreateOutcome::Created => None,
        })
        .collect();
    let listed = store.list_instances().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(owners.iter().all(|o| *o == listed[0]));
}

async fn purge_removes_everything(store: Arc<dyn HistoryStore>) {
    store.create_instance(record("p1", Some("k"))).await.unwrap();
    store.create_instance(record("p2", None)).await.unwrap();
    store.append("p1", 0, vec![started()]).await.unwrap();

    store.purge_instance("p1").await.unwrap();
    assert_eq!(store.read_instance("p1").await.unwrap(), None);
    assert!(matches!(store.read("p1").await, Err(ProviderError::InstanceNotFound(_))));
    assert_eq!(store.list_instances().await.unwrap(), vec!["p2".to_string()]);

    // The key can be claimed again
    assert!(matches!(
        store.create_instance(record("p3", Some("k"))).await.unwrap(),
        CreateOutcome::Created
    ));
}

macro_rules! store_contract {
    ($($name:ident),* $(,)?) => {
        mod in_memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::common::in_memory_store()).await;
                }
            )*
        }

        mod filesystem {
            $(
                #[tokio::test]
                async fn $name() {
                    let (store, _td) = super::common::create_fs_store();
                    super::$name(store).await;
                }
            )*
        }
    };
}

store_contract!(
    create_read_append,
    stale_version_is_rejected,
    duplicate_and_post_terminal_events_are_discarded,
    unknown_instance_is_not_found,
    concurrent_appends_at_same_version,
    concurrent_deduped_creates,
    purge_removes_everything,
);

#[tokio::test]
async fn filesystem_history_survives_reopen() {
    use duraflow::providers::FsHistoryStore;

    let td = tempfile::tempdir().unwrap();
    {
        let store = FsHistoryStore::new(td.path(), false);
        store.create_instance(record("keep", Some("durable"))).await.unwrap();
        store.append("keep", 0, vec![started(), scheduled(1)]).await.unwrap();
    }
    let reopened = FsHistoryStore::new(td.path(), false);
    assert_eq!(reopened.read("keep").await.unwrap().version(), 2);
    match reopened.create_instance(record("other", Some("durable"))).await.unwrap() {
        CreateOutcome::Existing(rec) => assert_eq!(rec.instance_id, "keep"),
        CreateOutcome::Created => panic!("dedup key lost across reopen"),
    }
}
