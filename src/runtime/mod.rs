use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::HistoryStore;
use crate::OrchestrationContext;

pub mod activity;
mod execution;
pub mod registry;
pub mod replay;
mod router;
mod status;
mod timers;
mod worker;

pub use activity::{ActivityHandler, FnActivity};
use registry::{ActivityRegistry, OrchestrationRegistry};
pub use replay::{run_turn, Executor, TurnOutcome, TurnStatus, DIVERGENCE_PREFIX};
pub use router::OrchestratorMsg;
use router::InstanceRouter;
pub use status::status_from_history;
pub(crate) use timers::now_ms;
use timers::{TimerRequest, TimerService};

/// Exponential backoff policy for transient activity failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// Retry policy for `ActivityError::Transient` and activity timeouts.
    pub activity_retry: RetryPolicy,
    /// Per-attempt activity timeout. `None` waits indefinitely.
    pub activity_timeout: Option<Duration>,
    /// How many times a turn is re-read and redone after a conflicting or
    /// retryable append failure before the coordinator gives up.
    pub append_retry_limit: u32,
    /// Maximum inbox messages folded into a single turn.
    pub completion_batch_limit: usize,
    /// Idle time after which a per-instance inbox task exits.
    pub instance_idle_timeout: Duration,
    /// Resume every non-terminal instance found in the store at start.
    pub resume_on_start: bool,
    /// Install a fmt subscriber honoring `RUST_LOG` if none is set.
    pub install_tracing_subscriber: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            activity_retry: RetryPolicy::default(),
            activity_timeout: None,
            append_retry_limit: 8,
            completion_batch_limit: 128,
            instance_idle_timeout: Duration::from_secs(1),
            resume_on_start: true,
            install_tracing_subscriber: true,
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// Created, no turn recorded yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Instance metadata plus its status folded from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub created_at_ms: u64,
    pub status: OrchestrationStatus,
    pub history_len: u64,
}

/// Ephemeral unit of activity work. Delivery is at-least-once; the
/// coordinator discards duplicate completions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityWorkItem {
    pub instance: String,
    pub sequence_id: u64,
    pub name: String,
    pub input: String,
}

/// In-process runtime that executes activities and drives orchestrations.
///
/// Owns the coordinator (one inbox task per active instance), the activity
/// worker pool and the timer service. The history store is the only shared
/// mutable state; everything else can be rebuilt from it on restart.
pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    options: RuntimeOptions,
    router: InstanceRouter,
    orchestrator_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    work_tx: mpsc::UnboundedSender<ActivityWorkItem>,
    timer_tx: mpsc::UnboundedSender<TimerRequest>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime backed by a fresh in-memory store.
    pub async fn start(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        Self::start_with_store(Arc::new(InMemoryHistoryStore::new()), activities, orchestrations).await
    }

    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if options.install_tracing_subscriber {
            // ok to call many times; only the first install wins
            let _ = crate::logging::init_tracing();
        }

        let (orchestrator_tx, orchestrator_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (timer_handle, timer_tx) = TimerService::start(orchestrator_tx.clone());

        let runtime = Arc::new(Self {
            store,
            orchestrations,
            activities,
            options,
            router: InstanceRouter::default(),
            orchestrator_tx,
            work_tx,
            timer_tx,
            joins: Mutex::new(Vec::new()),
        });

        let mut joins = vec![timer_handle];
        joins.push(runtime.clone().start_orchestration_dispatcher(orchestrator_rx));
        joins.extend(runtime.clone().start_workers(work_rx));
        runtime.joins.lock().await.extend(joins);

        if runtime.options.resume_on_start {
            runtime.resume_all().await;
        }
        info!(
            workers = runtime.options.worker_concurrency,
            orchestrations = runtime.orchestrations.count(),
            activities = runtime.activities.count(),
            "runtime started"
        );
        runtime
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Completion-report entry point for out-of-process workers. Reports for
    /// unknown or already completed sequence ids are discarded by the coordinator.
    pub fn report_activity_result(&self, instance: &str, sequence_id: u64, result: Result<String, String>) {
        let msg = match result {
            Ok(output) => OrchestratorMsg::ActivityCompleted {
                instance: instance.to_string(),
                sequence_id,
                output,
            },
            Err(error) => OrchestratorMsg::ActivityFailed {
                instance: instance.to_string(),
                sequence_id,
                error,
            },
        };
        self.post(msg);
    }

    pub(crate) fn post(&self, msg: OrchestratorMsg) {
        if let Err(e) = self.orchestrator_tx.send(msg) {
            warn!(instance_id = %e.0.instance(), "runtime stopped; dropping message");
        }
    }

    /// Post `Start`/`Resume` for every non-terminal instance in the store.
    async fn resume_all(&self) {
        let ids = match self.store.list_instances().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "recovery: cannot list instances");
                return;
            }
        };
        let mut resumed = 0usize;
        for instance in ids {
            match self.store.read(&instance).await {
                Ok(h) if h.is_terminal() => {}
                Ok(h) if h.is_empty() => {
                    self.post(OrchestratorMsg::Start { instance });
                    resumed += 1;
                }
                Ok(_) => {
                    self.post(OrchestratorMsg::Resume { instance });
                    resumed += 1;
                }
                Err(e) => warn!(instance_id = %instance, error = %e, "recovery: cannot read history"),
            }
        }
        if resumed > 0 {
            info!(resumed, "recovery: resumed non-terminal instances");
        }
    }

    /// Routes coordinator messages into per-instance inboxes, spawning one
    /// drain task per active instance.
    fn start_orchestration_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Dropping the set on abort cancels the instance tasks too
            let mut instances = tokio::task::JoinSet::new();
            while let Some(msg) = rx.recv().await {
                while instances.try_join_next().is_some() {}
                let instance = msg.instance().to_string();
                debug!(instance_id = %instance, kind = msg.kind(), "routing message");
                if let Some(inbox) = self.router.deliver(msg) {
                    let rt = self.clone();
                    instances.spawn(async move { rt.run_instance(instance, inbox).await });
                }
            }
        })
    }

    /// Abort background tasks. In-flight activities are not awaited.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}
