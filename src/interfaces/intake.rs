use crate::application::engine::OrchestrationEngine;
use crate::domain::orchestration::{InstanceId, StatusReport, TransferRequest};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Entry point for room booking change requests.
///
/// Derives the instance key from the room pair, starts (or joins) the
/// instance and hands back a handle for polling its status.
#[derive(Clone)]
pub struct TransferIntake {
    engine: Arc<OrchestrationEngine>,
}

impl TransferIntake {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        Self { engine }
    }

    pub async fn submit(&self, request: TransferRequest) -> Result<StatusHandle> {
        info!(
            from_room = %request.from_room,
            to_room = %request.to_room,
            "Got room booking change request"
        );
        let key = InstanceId::for_transfer(&request);
        let instance_id = self.engine.start_or_create(key, request).await?;
        Ok(StatusHandle {
            instance_id,
            engine: Arc::clone(&self.engine),
        })
    }
}

/// Status-polling reference returned to the requester.
#[derive(Clone)]
pub struct StatusHandle {
    instance_id: InstanceId,
    engine: Arc<OrchestrationEngine>,
}

impl StatusHandle {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Current status; Pending/Running until the instance settles.
    pub async fn poll(&self) -> Result<StatusReport> {
        self.engine.get_status(&self.instance_id).await
    }

    /// Status as the JSON document a polling client receives.
    pub async fn poll_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.poll().await?)?)
    }

    pub async fn wait(&self, timeout: Duration) -> Result<StatusReport> {
        self.engine.wait_for(&self.instance_id, timeout).await
    }
}
