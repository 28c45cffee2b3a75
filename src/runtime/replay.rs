//! One replay turn: rebuild the orchestration's state from history by running
//! it from the top, and collect the new decisions it makes.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::OrchestrationHandler;
use crate::providers::History;
use crate::{Action, Event, OrchestrationContext, UNASSIGNED_EVENT_ID};

/// Prefix of the `OrchestratorFailed` error recorded for a replay divergence.
pub const DIVERGENCE_PREFIX: &str = "replay divergence: ";

/// Result of a single turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// Suspended; `actions` holds the newly scheduled work.
    Pending,
    Completed(String),
    Failed(String),
    /// Execution did not reproduce the recorded scheduling decisions.
    Diverged(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub actions: Vec<Action>,
    pub status: TurnStatus,
}

/// Run one turn of `orchestrator` against `history`.
///
/// The future is polled exactly once with a no-op waker: durable futures are
/// resolved synchronously from history, so anything still pending after the
/// poll is waiting on work that has not completed yet.
pub fn run_turn<F, Fut>(instance: &str, history: &History, orchestrator: F) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, history.clone());
    let polled = catch_unwind(AssertUnwindSafe(|| {
        let fut = orchestrator(ctx.clone());
        let mut fut = std::pin::pin!(fut);
        let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
        fut.as_mut().poll(&mut cx)
    }));

    let actions = ctx.take_actions();
    let status = match (ctx.divergence(), polled) {
        (Some(msg), _) => TurnStatus::Diverged(msg),
        (None, Err(payload)) => TurnStatus::Failed(format!("orchestration panicked: {}", panic_message(&*payload))),
        (None, Ok(Poll::Ready(Ok(output)))) => TurnStatus::Completed(output),
        (None, Ok(Poll::Ready(Err(error)))) => TurnStatus::Failed(error),
        (None, Ok(Poll::Pending)) => TurnStatus::Pending,
    };
    tracing::debug!(
        instance_id = %instance,
        history_len = history.version(),
        actions = actions.len(),
        status = ?status,
        "replay turn"
    );
    TurnOutcome { actions, status }
}

/// Run one turn of a registered handler.
pub fn replay_handler(
    handler: Arc<dyn OrchestrationHandler>,
    instance: &str,
    input: &str,
    history: &History,
) -> TurnOutcome {
    let input = input.to_string();
    run_turn(instance, history, move |ctx| async move { handler.invoke(ctx, input).await })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Synchronous host loop that drives an orchestrator to a terminal state.
///
/// Each turn the newly scheduled actions are handed to `execute`, which
/// returns completion events (`ActivityCompleted`, `ActivityFailed`,
/// `TimerFired`) to record before the next turn. `execute` may hold results
/// back and release them on later turns, in any order.
pub struct Executor;

impl Executor {
    pub fn drive_to_completion<F, Fut, X>(
        instance: &str,
        name: &str,
        input: &str,
        orchestrator: F,
        mut execute: X,
    ) -> (History, TurnStatus)
    where
        F: Fn(OrchestrationContext, String) -> Fut,
        Fut: Future<Output = Result<String, String>>,
        X: FnMut(&[Action]) -> Vec<Event>,
    {
        let mut events = vec![Event::OrchestratorStarted {
            event_id: UNASSIGNED_EVENT_ID,
            name: name.to_string(),
            input: input.to_string(),
        }];
        loop {
            let history = History::default().extended(&events);
            let outcome = run_turn(instance, &history, |ctx| orchestrator(ctx, input.to_string()));
            let terminal = match &outcome.status {
                TurnStatus::Pending => None,
                TurnStatus::Completed(output) => Some(Event::OrchestratorCompleted {
                    event_id: UNASSIGNED_EVENT_ID,
                    output: output.clone(),
                }),
                TurnStatus::Failed(error) => Some(Event::OrchestratorFailed {
                    event_id: UNASSIGNED_EVENT_ID,
                    error: error.clone(),
                }),
                TurnStatus::Diverged(msg) => Some(Event::OrchestratorFailed {
                    event_id: UNASSIGNED_EVENT_ID,
                    error: format!("{DIVERGENCE_PREFIX}{msg}"),
                }),
            };
            if let Some(done) = terminal {
                events.push(done);
                return (History::default().extended(&events), outcome.status);
            }

            events.extend(outcome.actions.iter().map(|a| a.to_event(0)));
            let completions = execute(&outcome.actions);
            if outcome.actions.is_empty() && completions.is_empty() {
                let status = TurnStatus::Failed("orchestration stalled: no new actions or completions".to_string());
                return (History::default().extended(&events), status);
            }
            events.extend(completions);
        }
    }
}
