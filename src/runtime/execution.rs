//! Per-instance coordinator.
//!
//! One drain task per active instance consumes its inbox, so turns of the same
//! instance never overlap. Each batch of messages becomes one decision:
//! read history, fold in new completions, replay, append atomically with the
//! version that was read, and only then dispatch the new work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::replay::{replay_handler, TurnStatus, DIVERGENCE_PREFIX};
use super::status::{outstanding_work, ScheduleIndex, ScheduledKind};
use super::timers::TimerRequest;
use super::{now_ms, ActivityWorkItem, OrchestratorMsg, Runtime};
use crate::providers::{History, ProviderError};
use crate::{Action, Event, UNASSIGNED_EVENT_ID};

/// Work to dispatch once the decision is durable.
#[derive(Debug, Default)]
struct Committed {
    work: Vec<ActivityWorkItem>,
    timers: Vec<(u64, u64)>,
}

impl Runtime {
    pub(super) async fn run_instance(
        self: Arc<Self>,
        instance: String,
        mut inbox: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) {
        let idle = self.options.instance_idle_timeout;
        let limit = self.options.completion_batch_limit.max(1);
        loop {
            let first = match tokio::time::timeout(idle, inbox.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => match self.router.retire(&instance, &mut inbox) {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let mut batch = vec![first];
            while batch.len() < limit {
                match inbox.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }
            self.process_batch(&instance, &batch).await;
        }
        debug!(instance_id = %instance, "instance inbox retired");
    }

    /// Decide and append, redoing the decision on conflicts and retryable
    /// store errors.
    ///
    /// A failed append may still have been committed, so a redo re-dispatches
    /// everything outstanding in the re-read history, like a resume.
    async fn process_batch(&self, instance: &str, batch: &[OrchestratorMsg]) {
        let mut attempt: u32 = 0;
        loop {
            match self.decide_and_append(instance, batch, attempt > 0).await {
                Ok(Some(committed)) => {
                    self.dispatch(instance, committed);
                    return;
                }
                Ok(None) => return,
                Err(e) if e.is_retryable() && attempt < self.options.append_retry_limit => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempt.min(8));
                    warn!(instance_id = %instance, attempt, backoff_ms, error = %e, "append failed; re-reading history");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(ProviderError::InstanceNotFound(_)) => {
                    warn!(instance_id = %instance, messages = batch.len(), "dropping messages for unknown instance");
                    return;
                }
                Err(e) => {
                    error!(instance_id = %instance, attempt, error = %e, "giving up on turn");
                    return;
                }
            }
        }
    }

    async fn decide_and_append(
        &self,
        instance: &str,
        batch: &[OrchestratorMsg],
        redo: bool,
    ) -> Result<Option<Committed>, ProviderError> {
        let history = self.store.read(instance).await?;
        if history.is_terminal() {
            for msg in batch {
                if !matches!(msg, OrchestratorMsg::Start { .. } | OrchestratorMsg::Resume { .. }) {
                    warn!(instance_id = %instance, kind = msg.kind(), "dropping late message for terminal instance");
                }
            }
            return Ok(None);
        }

        let (name, input) = match history.iter().next() {
            Some(Event::OrchestratorStarted { name, input, .. }) => (name.clone(), input.clone()),
            _ => {
                let record = self
                    .store
                    .read_instance(instance)
                    .await?
                    .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
                (record.orchestration, record.input)
            }
        };

        let mut delta: Vec<Event> = Vec::new();
        if history.is_empty() {
            delta.push(Event::OrchestratorStarted {
                event_id: UNASSIGNED_EVENT_ID,
                name: name.clone(),
                input: input.clone(),
            });
        }

        let folded = fold_messages(instance, &history, batch);
        delta.extend(folded.completions);

        if let Some(reason) = folded.terminate {
            if history.is_empty() {
                // Never started; nothing to record besides the termination
                delta.clear();
            }
            delta.push(Event::OrchestratorTerminated {
                event_id: UNASSIGNED_EVENT_ID,
                reason,
            });
            self.store.append(instance, history.version(), delta).await?;
            debug!(instance_id = %instance, "instance terminated");
            return Ok(None);
        }

        let mut committed = Committed::default();
        let outcome = match folded.divergence {
            Some(msg) => TurnStatus::Diverged(msg),
            None => {
                let replayed = history.extended(&delta);
                match self.orchestrations.get(&name) {
                    Some(handler) => {
                        let turn = replay_handler(handler, instance, &input, &replayed);
                        if turn.status == TurnStatus::Pending {
                            self.materialize(instance, &turn.actions, &mut delta, &mut committed);
                            if folded.resume || redo {
                                let (work, timers) = outstanding_work(instance, &replayed);
                                committed.work.extend(work);
                                committed.timers.extend(timers);
                            }
                        } else if !turn.actions.is_empty() {
                            debug!(
                                instance_id = %instance,
                                dropped = turn.actions.len(),
                                "orchestration finished with unawaited operations; not scheduling them"
                            );
                        }
                        turn.status
                    }
                    None => TurnStatus::Failed(format!("unregistered:{name}")),
                }
            }
        };

        match outcome {
            TurnStatus::Pending => {}
            TurnStatus::Completed(output) => delta.push(Event::OrchestratorCompleted {
                event_id: UNASSIGNED_EVENT_ID,
                output,
            }),
            TurnStatus::Failed(error) => delta.push(Event::OrchestratorFailed {
                event_id: UNASSIGNED_EVENT_ID,
                error,
            }),
            TurnStatus::Diverged(msg) => {
                warn!(instance_id = %instance, divergence = %msg, "replay divergence; failing instance");
                delta.push(Event::OrchestratorFailed {
                    event_id: UNASSIGNED_EVENT_ID,
                    error: format!("{DIVERGENCE_PREFIX}{msg}"),
                })
            }
        }

        if !delta.is_empty() {
            let version = self.store.append(instance, history.version(), delta).await?;
            debug!(instance_id = %instance, version, "turn committed");
        }
        if committed.work.is_empty() && committed.timers.is_empty() {
            return Ok(None);
        }
        Ok(Some(committed))
    }

    fn materialize(&self, instance: &str, actions: &[Action], delta: &mut Vec<Event>, committed: &mut Committed) {
        let now = now_ms();
        for action in actions {
            let event = action.to_event(now);
            match &event {
                Event::TimerCreated {
                    sequence_id,
                    fire_at_ms,
                    ..
                } => committed.timers.push((*sequence_id, *fire_at_ms)),
                Event::ActivityScheduled {
                    sequence_id,
                    name,
                    input,
                    ..
                } => committed.work.push(ActivityWorkItem {
                    instance: instance.to_string(),
                    sequence_id: *sequence_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => {}
            }
            delta.push(event);
        }
    }

    fn dispatch(&self, instance: &str, committed: Committed) {
        debug!(
            instance_id = %instance,
            work = committed.work.len(),
            timers = committed.timers.len(),
            "dispatching"
        );
        for item in committed.work {
            self.schedule_work(item);
        }
        for (sequence_id, fire_at_ms) in committed.timers {
            let req = TimerRequest {
                instance: instance.to_string(),
                sequence_id,
                fire_at_ms,
            };
            if self.timer_tx.send(req).is_err() {
                warn!(instance_id = %instance, sequence_id, "timer service stopped; timer not armed");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Folded {
    completions: Vec<Event>,
    terminate: Option<String>,
    divergence: Option<String>,
    resume: bool,
}

/// Turn inbox messages into completion events, deduped against history and
/// each other, and validated against what was actually scheduled.
fn fold_messages(instance: &str, history: &History, batch: &[OrchestratorMsg]) -> Folded {
    let idx = ScheduleIndex::of(history);
    let mut seen: HashSet<u64> = idx.completed.clone();
    let mut out = Folded::default();

    for msg in batch {
        let (seq, kind, event) = match msg {
            OrchestratorMsg::Start { .. } | OrchestratorMsg::Resume { .. } => {
                out.resume = true;
                continue;
            }
            OrchestratorMsg::Terminate { reason, .. } => {
                out.terminate.get_or_insert_with(|| reason.clone());
                continue;
            }
            OrchestratorMsg::ActivityCompleted {
                sequence_id, output, ..
            } => (
                *sequence_id,
                ScheduledKind::Activity,
                Event::ActivityCompleted {
                    event_id: UNASSIGNED_EVENT_ID,
                    sequence_id: *sequence_id,
                    output: output.clone(),
                },
            ),
            OrchestratorMsg::ActivityFailed {
                sequence_id, error, ..
            } => (
                *sequence_id,
                ScheduledKind::Activity,
                Event::ActivityFailed {
                    event_id: UNASSIGNED_EVENT_ID,
                    sequence_id: *sequence_id,
                    error: error.clone(),
                },
            ),
            OrchestratorMsg::TimerFired {
                sequence_id,
                fire_at_ms,
                ..
            } => (
                *sequence_id,
                ScheduledKind::Timer,
                Event::TimerFired {
                    event_id: UNASSIGNED_EVENT_ID,
                    sequence_id: *sequence_id,
                    fire_at_ms: *fire_at_ms,
                },
            ),
        };

        if seen.contains(&seq) {
            warn!(instance_id = %instance, sequence_id = seq, kind = msg.kind(), "dropping duplicate completion");
            continue;
        }
        match idx.scheduled.get(&seq) {
            None => {
                out.divergence.get_or_insert_with(|| {
                    format!("no matching schedule for completion sequence_id={seq} ({})", msg.kind())
                });
            }
            Some(k) if *k != kind => {
                out.divergence.get_or_insert_with(|| {
                    format!("completion kind mismatch for sequence_id={seq}: scheduled {k:?}, got {}", msg.kind())
                });
            }
            Some(_) => {
                seen.insert(seq);
                out.completions.push(event);
            }
        }
    }
    out
}
