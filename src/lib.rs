//! Replay-driven durable orchestration engine.
//!
//! An orchestration is an ordinary async function that schedules named
//! activities through an [`OrchestrationContext`]. Every decision it makes is
//! recorded as an append-only [`Event`] in a per-instance history. Each time
//! something new happens (an activity completes, a timer fires) the function is
//! re-run from the top against that history: recorded results are fed back
//! without re-executing any activity, and execution that reaches past the end
//! of history produces new [`Action`]s. The function never holds a thread while
//! it waits.
//!
//! - Data model: [`Event`], [`Action`], [`providers::History`]
//! - Replay: [`OrchestrationContext`], [`futures`], [`runtime::replay`]
//! - Coordinator and activity dispatch: [`runtime::Runtime`]
//! - Instance management: [`client::Client`]
//! - Storage: [`providers::HistoryStore`] with in-memory and filesystem backends
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod samples;

pub use client::Client;
pub use error::{ActivityError, EngineError, TaskError};
pub use crate::futures::{DurableFuture, DurableTimer, JoinFuture, TimedJoinFuture};
pub use providers::History;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{InstanceInfo, OrchestrationStatus, Runtime, RuntimeOptions};

/// Placeholder id carried by events that have not been appended yet. The
/// history store assigns the real id.
pub const UNASSIGNED_EVENT_ID: u64 = 0;

// Internal codec utilities for typed I/O
pub(crate) mod codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;

    /// Encode to JSON text. Strings keep their quotes so that `decode`
    /// returns exactly what was encoded.
    pub fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| e.to_string())
    }

    /// Decode JSON text. Input that is not valid JSON is retried as a bare
    /// string, so untyped callers may pass raw text such as `ORDER-9`.
    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        match serde_json::from_str::<T>(s) {
            Ok(v) => Ok(v),
            Err(first) => serde_json::from_value(Value::String(s.to_string())).map_err(|_| first.to_string()),
        }
    }

}

/// Append-only orchestration history entries persisted by a store and
/// consumed during replay.
///
/// `event_id` is the 1-based position in the instance log and is assigned by
/// the store on append. Scheduling events carry a `sequence_id` allocated in
/// call order by the orchestration; completions refer back to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance started by orchestration name with input.
    OrchestratorStarted { event_id: u64, name: String, input: String },
    /// Activity was scheduled.
    ActivityScheduled {
        event_id: u64,
        sequence_id: u64,
        name: String,
        input: String,
    },
    /// Activity completed successfully.
    ActivityCompleted { event_id: u64, sequence_id: u64, output: String },
    /// Activity failed permanently (or exhausted its retries).
    ActivityFailed { event_id: u64, sequence_id: u64, error: String },
    /// Durable timer created; fires at wall-clock `fire_at_ms`.
    TimerCreated { event_id: u64, sequence_id: u64, fire_at_ms: u64 },
    /// Durable timer fired.
    TimerFired { event_id: u64, sequence_id: u64, fire_at_ms: u64 },
    /// Orchestration returned a final result.
    OrchestratorCompleted { event_id: u64, output: String },
    /// Orchestration failed (uncaught activity failure, fault, or divergence).
    OrchestratorFailed { event_id: u64, error: String },
    /// Orchestration was terminated on request.
    OrchestratorTerminated { event_id: u64, reason: String },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestratorStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::OrchestratorCompleted { event_id, .. }
            | Event::OrchestratorFailed { event_id, .. }
            | Event::OrchestratorTerminated { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestratorStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::OrchestratorCompleted { event_id, .. }
            | Event::OrchestratorFailed { event_id, .. }
            | Event::OrchestratorTerminated { event_id, .. } => *event_id = id,
        }
    }

    /// Sequence id for scheduling and completion events.
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { sequence_id, .. }
            | Event::ActivityCompleted { sequence_id, .. }
            | Event::ActivityFailed { sequence_id, .. }
            | Event::TimerCreated { sequence_id, .. }
            | Event::TimerFired { sequence_id, .. } => Some(*sequence_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. } | Event::OrchestratorTerminated { .. }
        )
    }

    /// True for events that resolve a previously scheduled operation.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. } | Event::ActivityFailed { .. } | Event::TimerFired { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::OrchestratorStarted { .. } => "OrchestratorStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            Event::OrchestratorFailed { .. } => "OrchestratorFailed",
            Event::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }
}

/// Declarative decisions produced by a replay turn. The coordinator
/// materializes them into `Event`s and dispatches the corresponding work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    ScheduleActivity { sequence_id: u64, name: String, input: String },
    /// Create a durable timer that fires after `delay_ms`.
    CreateTimer { sequence_id: u64, delay_ms: u64 },
}

impl Action {
    pub fn sequence_id(&self) -> u64 {
        match self {
            Action::ScheduleActivity { sequence_id, .. } | Action::CreateTimer { sequence_id, .. } => *sequence_id,
        }
    }

    /// Materialize into the history event recorded for this decision. Timer
    /// fire times are fixed here, outside the orchestration function.
    pub fn to_event(&self, now_ms: u64) -> Event {
        match self {
            Action::ScheduleActivity {
                sequence_id,
                name,
                input,
            } => Event::ActivityScheduled {
                event_id: UNASSIGNED_EVENT_ID,
                sequence_id: *sequence_id,
                name: name.clone(),
                input: input.clone(),
            },
            Action::CreateTimer { sequence_id, delay_ms } => Event::TimerCreated {
                event_id: UNASSIGNED_EVENT_ID,
                sequence_id: *sequence_id,
                fire_at_ms: now_ms.saturating_add(*delay_ms),
            },
        }
    }
}

/// A scheduling decision already present in history.
#[derive(Debug, Clone)]
enum RecordedSchedule {
    Activity { sequence_id: u64, name: String, input: String },
    Timer { sequence_id: u64 },
}

/// Recorded outcome of a scheduled operation.
#[derive(Debug, Clone)]
pub(crate) enum Recorded {
    Completed(String),
    Failed(String),
    TimerFired,
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    // Scheduling events in history order: the replay cursor walks these
    recorded_schedules: Vec<RecordedSchedule>,
    // sequence_id -> (position in history, outcome)
    recorded_outcomes: HashMap<u64, (usize, Recorded)>,
    next_sequence_id: u64,
    actions: Vec<Action>,
    // Furthest history position among outcomes the function has consumed
    observed_pos: Option<usize>,
    last_outcome_pos: Option<usize>,
    // Set once the function emits a new action or waits on an unrecorded outcome
    past_history: bool,
    divergence: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: &History) -> Self {
        let mut recorded_schedules = Vec::new();
        let mut recorded_outcomes = HashMap::new();
        for (pos, e) in history.iter().enumerate() {
            match e {
                Event::ActivityScheduled {
                    sequence_id,
                    name,
                    input,
                    ..
                } => recorded_schedules.push(RecordedSchedule::Activity {
                    sequence_id: *sequence_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                Event::TimerCreated { sequence_id, .. } => {
                    recorded_schedules.push(RecordedSchedule::Timer { sequence_id: *sequence_id })
                }
                Event::ActivityCompleted { sequence_id, output, .. } => {
                    recorded_outcomes
                        .entry(*sequence_id)
                        .or_insert((pos, Recorded::Completed(output.clone())));
                }
                Event::ActivityFailed { sequence_id, error, .. } => {
                    recorded_outcomes
                        .entry(*sequence_id)
                        .or_insert((pos, Recorded::Failed(error.clone())));
                }
                Event::TimerFired { sequence_id, .. } => {
                    recorded_outcomes.entry(*sequence_id).or_insert((pos, Recorded::TimerFired));
                }
                _ => {}
            }
        }
        let last_outcome_pos = recorded_outcomes.values().map(|(pos, _)| *pos).max();
        Self {
            instance,
            recorded_schedules,
            recorded_outcomes,
            next_sequence_id: 1,
            actions: Vec::new(),
            observed_pos: None,
            last_outcome_pos,
            past_history: false,
            divergence: None,
        }
    }

    fn diverge(&mut self, msg: String) {
        // Keep the first mismatch; later ones are consequences of it
        if self.divergence.is_none() {
            self.divergence = Some(msg);
        }
    }

    /// Advance the cursor for a new activity call.
    fn claim_activity(&mut self, name: &str, input: &str) -> u64 {
        let seq = self.next_sequence_id;
        self.next_sequence_id += 1;
        match self.recorded_schedules.get((seq - 1) as usize).cloned() {
            Some(RecordedSchedule::Activity {
                sequence_id,
                name: n,
                input: i,
            }) => {
                if sequence_id != seq || n != name || i != input {
                    self.diverge(format!(
                        "sequence {seq}: history has ActivityScheduled#{sequence_id}('{n}','{i}') but orchestration scheduled activity('{name}','{input}')"
                    ));
                }
            }
            Some(RecordedSchedule::Timer { sequence_id }) => {
                self.diverge(format!(
                    "sequence {seq}: history has TimerCreated#{sequence_id} but orchestration scheduled activity('{name}','{input}')"
                ));
            }
            None => {
                self.past_history = true;
                self.actions.push(Action::ScheduleActivity {
                    sequence_id: seq,
                    name: name.to_string(),
                    input: input.to_string(),
                })
            }
        }
        seq
    }

    /// Advance the cursor for a new timer.
    fn claim_timer(&mut self, delay_ms: u64) -> u64 {
        let seq = self.next_sequence_id;
        self.next_sequence_id += 1;
        match self.recorded_schedules.get((seq - 1) as usize).cloned() {
            Some(RecordedSchedule::Timer { sequence_id }) => {
                if sequence_id != seq {
                    self.diverge(format!(
                        "sequence {seq}: history has TimerCreated#{sequence_id} out of order"
                    ));
                }
            }
            Some(RecordedSchedule::Activity { sequence_id, name, input }) => {
                self.diverge(format!(
                    "sequence {seq}: history has ActivityScheduled#{sequence_id}('{name}','{input}') but orchestration created a timer"
                ));
            }
            None => {
                self.past_history = true;
                self.actions.push(Action::CreateTimer {
                    sequence_id: seq,
                    delay_ms,
                })
            }
        }
        seq
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// User-facing orchestration context. Cloning is cheap; all clones share the
/// same replay state.
#[derive(Clone, Debug)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context that replays against `history`.
    pub fn new(instance: impl Into<String>, history: History) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), &history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // Replay state stays consistent across a user panic; recover the guard
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the code currently running already ran in an earlier turn.
    ///
    /// Replay ends once the function consumes the last recorded outcome in
    /// history order, schedules something new, or waits on an outcome that
    /// is not recorded yet. Outcomes that are never awaited do not hold it
    /// open.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        if inner.past_history {
            return false;
        }
        match (inner.last_outcome_pos, inner.observed_pos) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(last), Some(seen)) => seen < last,
        }
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it by
    /// sequence id. Calling this is the scheduling point: the activity is
    /// scheduled even if the future is never awaited.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let seq = self.lock().claim_activity(&name, &input);
        DurableFuture::activity(self.clone(), seq)
    }

    /// Typed helper that serializes the input as JSON.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        match codec::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => DurableFuture::rejected(self.clone(), format!("encode input: {e}")),
        }
    }

    /// Create a durable timer.
    pub fn create_timer(&self, delay: Duration) -> DurableTimer {
        let seq = self.lock().claim_timer(saturating_millis(delay));
        DurableTimer(DurableFuture::timer(self.clone(), seq))
    }

    /// Fan-in: resolve once every future has a recorded outcome. Results are
    /// returned in the order of `futures`, independent of completion order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(self.clone(), futures)
    }

    /// Fan-in with a deadline. A durable timer is created after the branches;
    /// any branch whose outcome is not recorded before the timer fires
    /// resolves to `Err(TaskError::TimedOut)`.
    pub fn join_with_timeout(&self, futures: Vec<DurableFuture>, timeout: Duration) -> TimedJoinFuture {
        let timer_seq = self.lock().claim_timer(saturating_millis(timeout));
        TimedJoinFuture::new(self.clone(), futures, timer_seq)
    }

    pub(crate) fn outcome(&self, seq: u64) -> Option<(usize, Recorded)> {
        self.lock().recorded_outcomes.get(&seq).cloned()
    }

    pub(crate) fn mark_observed(&self, seqs: impl IntoIterator<Item = u64>) {
        let mut inner = self.lock();
        let furthest = seqs
            .into_iter()
            .filter_map(|seq| inner.recorded_outcomes.get(&seq).map(|(pos, _)| *pos))
            .max();
        if furthest > inner.observed_pos {
            inner.observed_pos = furthest;
        }
    }

    /// The function is blocked on an outcome history does not hold yet.
    pub(crate) fn mark_waiting(&self) {
        self.lock().past_history = true;
    }

    pub(crate) fn has_diverged(&self) -> bool {
        self.lock().divergence.is_some()
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Divergence detected while scheduling, or recorded scheduling events
    /// the function never reached in this turn.
    pub(crate) fn divergence(&self) -> Option<String> {
        let inner = self.lock();
        if let Some(d) = &inner.divergence {
            return Some(d.clone());
        }
        let claimed = (inner.next_sequence_id - 1) as usize;
        if inner.recorded_schedules.len() > claimed {
            return Some(format!(
                "history records {} scheduled operations but orchestration issued only {claimed}",
                inner.recorded_schedules.len()
            ));
        }
        None
    }
}
