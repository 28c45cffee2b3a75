use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::providers::{CreateOutcome, History, InstanceRecord};
use crate::runtime::{status_from_history, InstanceInfo, OrchestrationStatus, OrchestratorMsg, Runtime};
use crate::{codec, runtime};

/// Instance manager: starts, inspects, terminates and purges orchestration
/// instances. A thin layer over the runtime's store and coordinator inbox.
#[derive(Clone)]
pub struct Client {
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Create a new instance and post `Start`. Returns the generated id.
    pub async fn start_orchestration(&self, name: &str, input: impl Into<String>) -> Result<String, EngineError> {
        let record = new_record(name, input.into(), None);
        let instance = record.instance_id.clone();
        self.runtime.store().create_instance(record).await?;
        info!(instance_id = %instance, orchestration = %name, "instance created");
        self.runtime.post(OrchestratorMsg::Start {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    pub async fn start_orchestration_typed<In: Serialize>(&self, name: &str, input: &In) -> Result<String, EngineError> {
        let payload = codec::encode(input).map_err(EngineError::Codec)?;
        self.start_orchestration(name, payload).await
    }

    /// Idempotent start: every call with the same `dedup_key` returns the id
    /// of the one instance created for it.
    pub async fn start_orchestration_deduped(
        &self,
        name: &str,
        input: impl Into<String>,
        dedup_key: &str,
    ) -> Result<String, EngineError> {
        let record = new_record(name, input.into(), Some(dedup_key.to_string()));
        let instance = record.instance_id.clone();
        match self.runtime.store().create_instance(record).await? {
            CreateOutcome::Created => {
                info!(instance_id = %instance, orchestration = %name, dedup_key, "instance created");
                self.runtime.post(OrchestratorMsg::Start {
                    instance: instance.clone(),
                });
                Ok(instance)
            }
            CreateOutcome::Existing(existing) => {
                debug!(instance_id = %existing.instance_id, dedup_key, "start deduplicated");
                Ok(existing.instance_id)
            }
        }
    }

    pub async fn get_status(&self, instance: &str) -> Result<InstanceInfo, EngineError> {
        let store = self.runtime.store();
        let record = store
            .read_instance(instance)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance.to_string()))?;
        let history = store.read(instance).await?;
        Ok(InstanceInfo {
            instance_id: record.instance_id,
            orchestration: record.orchestration,
            input: record.input,
            created_at_ms: record.created_at_ms,
            status: status_from_history(&history),
            history_len: history.version(),
        })
    }

    /// Request termination. Applied asynchronously by the coordinator; a
    /// no-op for instances that are already terminal.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        let info = self.get_status(instance).await?;
        if info.status.is_terminal() {
            debug!(instance_id = %instance, "terminate ignored; instance already terminal");
            return Ok(());
        }
        self.runtime.post(OrchestratorMsg::Terminate {
            instance: instance.to_string(),
            reason: reason.into(),
        });
        Ok(())
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self.get_status(instance).await?.status;
            if status.is_terminal() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::WaitTimeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(100);
        }
    }

    /// Wait for the instance and return its output, turning every other
    /// terminal status into an error.
    pub async fn wait_for_output(&self, instance: &str, timeout: Duration) -> Result<String, EngineError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Ok(output),
            OrchestrationStatus::Failed { error } => Err(EngineError::from_failure(error)),
            OrchestrationStatus::Terminated { reason } => Err(EngineError::Terminated(reason)),
            OrchestrationStatus::Pending | OrchestrationStatus::Running => {
                Err(EngineError::NotTerminal(instance.to_string()))
            }
        }
    }

    /// Full recorded history, for audit.
    pub async fn read_history(&self, instance: &str) -> Result<History, EngineError> {
        Ok(self.runtime.store().read(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.runtime.store().list_instances().await?)
    }

    /// Delete a terminal instance and its history.
    pub async fn purge(&self, instance: &str) -> Result<(), EngineError> {
        if !self.get_status(instance).await?.status.is_terminal() {
            return Err(EngineError::NotTerminal(instance.to_string()));
        }
        self.runtime.store().purge_instance(instance).await?;
        info!(instance_id = %instance, "instance purged");
        Ok(())
    }
}

fn new_record(name: &str, input: String, dedup_key: Option<String>) -> InstanceRecord {
    InstanceRecord {
        instance_id: uuid::Uuid::new_v4().to_string(),
        orchestration: name.to_string(),
        input,
        created_at_ms: runtime::now_ms(),
        dedup_key,
    }
}
