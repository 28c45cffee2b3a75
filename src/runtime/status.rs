use std::collections::{HashMap, HashSet};

use super::{ActivityWorkItem, OrchestrationStatus};
use crate::providers::History;
use crate::Event;

/// Fold a history into the instance status. Status is never stored on its
/// own; this fold is the only source of truth.
pub fn status_from_history(history: &History) -> OrchestrationStatus {
    for e in history.iter() {
        match e {
            Event::OrchestratorCompleted { output, .. } => {
                return OrchestrationStatus::Completed { output: output.clone() }
            }
            Event::OrchestratorFailed { error, .. } => return OrchestrationStatus::Failed { error: error.clone() },
            Event::OrchestratorTerminated { reason, .. } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() }
            }
            _ => {}
        }
    }
    if history.is_empty() {
        OrchestrationStatus::Pending
    } else {
        OrchestrationStatus::Running
    }
}

/// What kind of operation a sequence id was scheduled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduledKind {
    Activity,
    Timer,
}

/// Index of scheduled operations and the subset that already completed.
#[derive(Debug, Default)]
pub(crate) struct ScheduleIndex {
    pub scheduled: HashMap<u64, ScheduledKind>,
    pub completed: HashSet<u64>,
}

impl ScheduleIndex {
    pub(crate) fn of(history: &History) -> Self {
        let mut idx = ScheduleIndex::default();
        for e in history.iter() {
            match e {
                Event::ActivityScheduled { sequence_id, .. } => {
                    idx.scheduled.insert(*sequence_id, ScheduledKind::Activity);
                }
                Event::TimerCreated { sequence_id, .. } => {
                    idx.scheduled.insert(*sequence_id, ScheduledKind::Timer);
                }
                e if e.is_completion() => {
                    if let Some(seq) = e.sequence_id() {
                        idx.completed.insert(seq);
                    }
                }
                _ => {}
            }
        }
        idx
    }
}

/// Work scheduled in history that has no completion yet.
pub(crate) fn outstanding_work(instance: &str, history: &History) -> (Vec<ActivityWorkItem>, Vec<(u64, u64)>) {
    let idx = ScheduleIndex::of(history);
    let mut work = Vec::new();
    let mut timers = Vec::new();
    for e in history.iter() {
        match e {
            Event::ActivityScheduled {
                sequence_id,
                name,
                input,
                ..
            } if !idx.completed.contains(sequence_id) => work.push(ActivityWorkItem {
                instance: instance.to_string(),
                sequence_id: *sequence_id,
                name: name.clone(),
                input: input.clone(),
            }),
            Event::TimerCreated {
                sequence_id,
                fire_at_ms,
                ..
            } if !idx.completed.contains(sequence_id) => timers.push((*sequence_id, *fire_at_ms)),
            _ => {}
        }
    }
    (work, timers)
}
