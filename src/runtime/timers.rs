use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tokio::sync::mpsc;

use super::OrchestratorMsg;

/// Durable timer to arm. Re-arming an already armed timer is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerRequest {
    pub instance: String,
    pub sequence_id: u64,
    pub fire_at_ms: u64,
}

/// In-process timer service.
/// Maintains a min-ordered queue of armed timers and posts `TimerFired` when due.
pub(crate) struct TimerService {
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    out: mpsc::UnboundedSender<OrchestratorMsg>,
    armed: HashSet<(String, u64)>,
    min_heap: BinaryHeap<Reverse<(u64, String, u64)>>,
}

impl TimerService {
    pub(crate) fn start(
        out: mpsc::UnboundedSender<OrchestratorMsg>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<TimerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel::<TimerRequest>();
        let mut svc = TimerService {
            rx,
            out,
            armed: HashSet::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(req) = self.rx.try_recv() {
                self.insert(req);
            }

            let now = now_ms();
            while let Some(ts) = self.min_heap.peek().map(|Reverse((ts, _, _))| *ts) {
                if ts > now {
                    break;
                }
                if let Some(Reverse((fire_at_ms, instance, sequence_id))) = self.min_heap.pop() {
                    self.armed.remove(&(instance.clone(), sequence_id));
                    tracing::debug!(instance_id = %instance, sequence_id, fire_at_ms, "timer fired");
                    if self
                        .out
                        .send(OrchestratorMsg::TimerFired {
                            instance,
                            sequence_id,
                            fire_at_ms,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }

            // Wait for the next due timer or a new request
            if let Some(next_ts) = self.min_heap.peek().map(|Reverse((ts, _, _))| *ts) {
                let dur_ms = next_ts.saturating_sub(now_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => match maybe {
                        Some(req) => self.insert(req),
                        None => return,
                    },
                }
            } else {
                match self.rx.recv().await {
                    Some(req) => self.insert(req),
                    None => return,
                }
            }
        }
    }

    fn insert(&mut self, req: TimerRequest) {
        if self.armed.insert((req.instance.clone(), req.sequence_id)) {
            self.min_heap
                .push(Reverse((req.fire_at_ms, req.instance, req.sequence_id)));
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_in_due_order_and_ignores_rearm() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, tx) = TimerService::start(out_tx);
        let now = now_ms();
        for (seq, delay) in [(1u64, 60u64), (2, 10)] {
            tx.send(TimerRequest {
                instance: "i".into(),
                sequence_id: seq,
                fire_at_ms: now + delay,
            })
            .unwrap();
        }
        tx.send(TimerRequest {
            instance: "i".into(),
            sequence_id: 2,
            fire_at_ms: now + 10,
        })
        .unwrap();

        let mut fired = Vec::new();
        for _ in 0..2 {
            match out_rx.recv().await.unwrap() {
                OrchestratorMsg::TimerFired { sequence_id, .. } => fired.push(sequence_id),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(fired, vec![2, 1]);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), out_rx.recv())
                .await
                .is_err(),
            "re-armed timer must not fire twice"
        );
        handle.abort();
    }

    #[tokio::test]
    async fn past_due_timers_fire_immediately() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, tx) = TimerService::start(out_tx);
        tx.send(TimerRequest {
            instance: "i".into(),
            sequence_id: 7,
            fire_at_ms: 1,
        })
        .unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            OrchestratorMsg::TimerFired {
                instance: "i".into(),
                sequence_id: 7,
                fire_at_ms: 1
            }
        );
        handle.abort();
    }
}
