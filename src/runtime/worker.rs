//! Activity worker pool.
//!
//! - Spawns `worker_concurrency` workers sharing one work queue
//! - Executes each item in its own task (panics become permanent failures)
//! - Retries transient failures and timeouts with exponential backoff
//! - Reports the final outcome to the coordinator

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::replay::panic_message;
use super::status::ScheduleIndex;
use super::{ActivityHandler, ActivityWorkItem, OrchestratorMsg, Runtime};
use crate::ActivityError;

impl Runtime {
    pub(super) fn start_workers(self: Arc<Self>, rx: mpsc::UnboundedReceiver<ActivityWorkItem>) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..self.options.worker_concurrency.max(1))
            .map(|worker_id| {
                let rt = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next item
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(item) => rt.execute_work_item(item, worker_id).await,
                            None => break,
                        }
                    }
                })
            })
            .collect()
    }

    /// Queue an activity for execution. Returns immediately.
    pub(crate) fn schedule_work(&self, item: ActivityWorkItem) {
        if let Err(e) = self.work_tx.send(item) {
            warn!(instance_id = %e.0.instance, sequence_id = e.0.sequence_id, "work queue closed; dropping item");
        }
    }

    async fn execute_work_item(&self, item: ActivityWorkItem, worker_id: usize) {
        if self.already_settled(&item).await {
            debug!(
                instance_id = %item.instance,
                sequence_id = item.sequence_id,
                activity_name = %item.name,
                "skipping work item for settled instance or operation"
            );
            return;
        }

        debug!(
            instance_id = %item.instance,
            sequence_id = item.sequence_id,
            activity_name = %item.name,
            worker_id,
            "activity started"
        );
        let start = Instant::now();
        let result = match self.activities.get(&item.name) {
            Some(handler) => self.execute_with_retry(handler, &item).await,
            None => Err(format!("unregistered:{}", item.name)),
        };
        debug!(
            instance_id = %item.instance,
            sequence_id = item.sequence_id,
            activity_name = %item.name,
            worker_id,
            outcome = if result.is_ok() { "success" } else { "failure" },
            duration_ms = start.elapsed().as_millis() as u64,
            "activity finished"
        );

        self.post(match result {
            Ok(output) => OrchestratorMsg::ActivityCompleted {
                instance: item.instance,
                sequence_id: item.sequence_id,
                output,
            },
            Err(error) => OrchestratorMsg::ActivityFailed {
                instance: item.instance,
                sequence_id: item.sequence_id,
                error,
            },
        });
    }

    /// True when the instance is terminal or the operation already completed.
    /// Read errors fall through to execution; completions are deduped anyway.
    async fn already_settled(&self, item: &ActivityWorkItem) -> bool {
        match self.store.read(&item.instance).await {
            Ok(h) => h.is_terminal() || ScheduleIndex::of(&h).completed.contains(&item.sequence_id),
            Err(_) => false,
        }
    }

    async fn execute_with_retry(&self, handler: Arc<dyn ActivityHandler>, item: &ActivityWorkItem) -> Result<String, String> {
        let policy = &self.options.activity_retry;
        let mut attempt: u32 = 1;
        loop {
            let err = match self.attempt_once(handler.clone(), item.input.clone()).await {
                Ok(output) => return Ok(output),
                Err(ActivityError::Permanent(m)) => return Err(m),
                Err(ActivityError::Transient(m)) => m,
            };
            if attempt >= policy.max_attempts.max(1) {
                return Err(format!("retries exhausted after {attempt} attempts: {err}"));
            }
            let backoff = policy.backoff_for(attempt);
            warn!(
                instance_id = %item.instance,
                sequence_id = item.sequence_id,
                activity_name = %item.name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient activity failure; retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn attempt_once(&self, handler: Arc<dyn ActivityHandler>, input: String) -> Result<String, ActivityError> {
        let task = tokio::spawn(async move { handler.invoke(input).await });
        let abort = task.abort_handle();
        let joined = match self.options.activity_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(ActivityError::Transient(format!(
                        "timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => task.await,
        };
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ActivityError::Permanent(format!(
                "activity panicked: {}",
                panic_message(&*e.into_panic())
            ))),
            Err(_) => Err(ActivityError::Permanent("activity cancelled".to_string())),
        }
    }
}
