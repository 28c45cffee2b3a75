use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Messages consumed by the orchestration coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorMsg {
    Start { instance: String },
    /// Replay and re-dispatch outstanding work (crash recovery).
    Resume { instance: String },
    ActivityCompleted { instance: String, sequence_id: u64, output: String },
    ActivityFailed { instance: String, sequence_id: u64, error: String },
    TimerFired { instance: String, sequence_id: u64, fire_at_ms: u64 },
    Terminate { instance: String, reason: String },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::Start { instance }
            | OrchestratorMsg::Resume { instance }
            | OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::Terminate { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorMsg::Start { .. } => "Start",
            OrchestratorMsg::Resume { .. } => "Resume",
            OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
            OrchestratorMsg::ActivityFailed { .. } => "ActivityFailed",
            OrchestratorMsg::TimerFired { .. } => "TimerFired",
            OrchestratorMsg::Terminate { .. } => "Terminate",
        }
    }
}

/// Per-instance single-consumer inboxes.
///
/// Every send and every retirement happens under one lock, so a message is
/// either delivered to a live inbox or starts a new one.
#[derive(Default)]
pub(crate) struct InstanceRouter {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>> {
        self.inboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver to the instance's inbox. Returns the receiver when a new inbox
    /// was created; the caller must spawn its drain task.
    pub(crate) fn deliver(&self, msg: OrchestratorMsg) -> Option<mpsc::UnboundedReceiver<OrchestratorMsg>> {
        let mut g = self.lock();
        let instance = msg.instance().to_string();
        let msg = match g.get(&instance) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return None,
                // Drain task went away without retiring (aborted); start over
                Err(mpsc::error::SendError(m)) => m,
            },
            None => msg,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // rx is alive in this scope; the send cannot fail
        let _ = tx.send(msg);
        g.insert(instance, tx);
        Some(rx)
    }

    /// Retire an idle inbox. If a message slipped in before the lock was
    /// taken it is returned and the inbox stays registered.
    pub(crate) fn retire(
        &self,
        instance: &str,
        rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Option<OrchestratorMsg> {
        let mut g = self.lock();
        if let Ok(msg) = rx.try_recv() {
            return Some(msg);
        }
        g.remove(instance);
        rx.close();
        None
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(i: &str) -> OrchestratorMsg {
        OrchestratorMsg::Start { instance: i.into() }
    }

    #[test]
    fn first_message_creates_inbox_later_ones_reuse_it() {
        let r = InstanceRouter::default();
        let mut rx = r.deliver(start("a")).expect("new inbox");
        assert!(r.deliver(OrchestratorMsg::Resume { instance: "a".into() }).is_none());
        assert!(r.deliver(start("b")).is_some());
        assert_eq!(rx.try_recv().unwrap().kind(), "Start");
        assert_eq!(rx.try_recv().unwrap().kind(), "Resume");
        assert_eq!(r.active(), 2);
    }

    #[test]
    fn retire_hands_back_pending_message() {
        let r = InstanceRouter::default();
        let mut rx = r.deliver(start("a")).unwrap();
        let _ = rx.try_recv();
        assert!(r.deliver(OrchestratorMsg::Resume { instance: "a".into() }).is_none());
        assert_eq!(r.retire("a", &mut rx).map(|m| m.kind()), Some("Resume"));
        assert!(r.retire("a", &mut rx).is_none());
        assert_eq!(r.active(), 0);
        // After retirement a new inbox is created
        assert!(r.deliver(start("a")).is_some());
    }

    #[test]
    fn dead_inbox_is_replaced() {
        let r = InstanceRouter::default();
        drop(r.deliver(start("a")));
        let mut rx = r.deliver(start("a")).expect("replacement inbox");
        assert_eq!(rx.try_recv().unwrap(), start("a"));
    }
}
