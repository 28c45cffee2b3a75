use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::{codec, OrchestrationContext, Recorded, TaskError};

#[derive(Debug, Clone)]
enum Kind {
    Activity,
    Timer,
    // Rejected before scheduling (e.g. input could not be encoded)
    Rejected(String),
}

/// Future returned by `OrchestrationContext::schedule_activity`. It resolves
/// purely from recorded history and never executes anything itself.
#[derive(Debug)]
pub struct DurableFuture {
    ctx: OrchestrationContext,
    sequence_id: u64,
    kind: Kind,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, sequence_id: u64) -> Self {
        Self {
            ctx,
            sequence_id,
            kind: Kind::Activity,
        }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, sequence_id: u64) -> Self {
        Self {
            ctx,
            sequence_id,
            kind: Kind::Timer,
        }
    }

    pub(crate) fn rejected(ctx: OrchestrationContext, error: String) -> Self {
        Self {
            ctx,
            sequence_id: 0,
            kind: Kind::Rejected(error),
        }
    }

    /// Sequence id correlating this future with its history events.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Decode the successful output as JSON into `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> impl Future<Output = Result<T, TaskError>> + Send {
        async move {
            let raw = self.await?;
            codec::decode::<T>(&raw).map_err(|e| TaskError::Failed(format!("decode output: {e}")))
        }
    }

    /// History position and value of the recorded outcome, if any.
    pub(crate) fn peek(&self) -> Option<(usize, Result<String, TaskError>)> {
        match &self.kind {
            Kind::Rejected(e) => Some((0, Err(TaskError::Failed(e.clone())))),
            Kind::Activity => match self.ctx.outcome(self.sequence_id)? {
                (pos, Recorded::Completed(out)) => Some((pos, Ok(out))),
                (pos, Recorded::Failed(err)) => Some((pos, Err(TaskError::Failed(err)))),
                (_, Recorded::TimerFired) => None,
            },
            Kind::Timer => match self.ctx.outcome(self.sequence_id)? {
                (pos, Recorded::TimerFired) => Some((pos, Ok(String::new()))),
                _ => None,
            },
        }
    }

    fn observed_key(&self) -> Option<u64> {
        match self.kind {
            Kind::Rejected(_) => None,
            _ => Some(self.sequence_id),
        }
    }
}

impl Future for DurableFuture {
    type Output = Result<String, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // A diverged turn is discarded; stop making progress
        if this.ctx.has_diverged() {
            return Poll::Pending;
        }
        match this.peek() {
            Some((_, value)) => {
                this.ctx.mark_observed(this.observed_key());
                Poll::Ready(value)
            }
            None => {
                this.ctx.mark_waiting();
                Poll::Pending
            }
        }
    }
}

/// Durable delay returned by `OrchestrationContext::create_timer`.
#[derive(Debug)]
pub struct DurableTimer(pub(crate) DurableFuture);

impl DurableTimer {
    pub fn sequence_id(&self) -> u64 {
        self.0.sequence_id
    }
}

impl Future for DurableTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.get_mut().0).poll(cx).map(|_| ())
    }
}

/// Fan-in over several durable futures. Results are in argument order.
#[derive(Debug)]
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, TaskError>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.ctx.has_diverged() {
            return Poll::Pending;
        }
        let mut results = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.peek() {
                Some((_, value)) => results.push(value),
                None => {
                    this.ctx.mark_waiting();
                    return Poll::Pending;
                }
            }
        }
        this.ctx
            .mark_observed(this.children.iter().filter_map(DurableFuture::observed_key));
        Poll::Ready(results)
    }
}

/// Fan-in bounded by a durable timer. Branches whose outcome is recorded after
/// the timer fired resolve to `TaskError::TimedOut`.
#[derive(Debug)]
pub struct TimedJoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    timer_seq: u64,
}

impl TimedJoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>, timer_seq: u64) -> Self {
        Self {
            ctx,
            children,
            timer_seq,
        }
    }

    /// Sequence id of the deadline timer.
    pub fn timer_sequence_id(&self) -> u64 {
        self.timer_seq
    }
}

impl Future for TimedJoinFuture {
    type Output = Vec<Result<String, TaskError>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.ctx.has_diverged() {
            return Poll::Pending;
        }
        let fired_at = match this.ctx.outcome(this.timer_seq) {
            Some((pos, Recorded::TimerFired)) => Some(pos),
            _ => None,
        };
        let mut results = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match (child.peek(), fired_at) {
                (Some((pos, value)), Some(deadline)) if pos < deadline => results.push(value),
                (Some((_, value)), None) => results.push(value),
                (_, Some(_)) => results.push(Err(TaskError::TimedOut)),
                (None, None) => {
                    this.ctx.mark_waiting();
                    return Poll::Pending;
                }
            }
        }
        // The timer and any late completions are settled once the join resolves
        let keys: Vec<u64> = this
            .children
            .iter()
            .filter_map(DurableFuture::observed_key)
            .chain(std::iter::once(this.timer_seq))
            .collect();
        this.ctx.mark_observed(keys);
        Poll::Ready(results)
    }
}
