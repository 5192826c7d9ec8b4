use super::context::{Cancellation, ContextMode, Orchestration, OrchestrationContext, Services};
use super::entity_store::EntityStore;
use super::lock_manager::LockManager;
use crate::config::EngineConfig;
use crate::domain::orchestration::{
    HistoryEvent, HistoryEventKind, InstanceId, InstanceRecord, InstanceStatus, OrchestrationInstance,
    StatusReport, TransferRequest, TransferResult,
};
use crate::domain::ports::{EntityStateStoreRef, HistoryStoreRef, LockStoreRef};
use crate::error::{OrchestrationError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Drives orchestration instances to completion.
///
/// Each instance runs as a single tokio task at a time; many instances run in
/// parallel on the runtime's worker pool. An instance waiting on a lock or an
/// entity operation is a parked future and occupies no worker thread.
///
/// After a restart, [`OrchestrationEngine::resume_unfinished`] re-drives every
/// instance that never reached a terminal state. The procedure is replayed
/// against its recorded history, so completed side effects are not repeated.
pub struct OrchestrationEngine {
    history: HistoryStoreRef,
    entities: Arc<EntityStore>,
    locks: Arc<LockManager>,
    orchestration: Arc<dyn Orchestration>,
    config: EngineConfig,
    running: Mutex<HashMap<InstanceId, Arc<Cancellation>>>,
    settled: Notify,
}

impl OrchestrationEngine {
    /// Creates a new `OrchestrationEngine` over the given storage backends.
    ///
    /// # Arguments
    ///
    /// * `history` - Instance records and their histories.
    /// * `entity_states` - Durable entity state.
    /// * `lock_records` - Durable lock records.
    /// * `orchestration` - The procedure every instance executes.
    /// * `config` - Lease, retry and wait settings.
    pub fn new(
        history: HistoryStoreRef,
        entity_states: EntityStateStoreRef,
        lock_records: LockStoreRef,
        orchestration: Arc<dyn Orchestration>,
        config: EngineConfig,
    ) -> Self {
        let locks = LockManager::new(lock_records, config.lease(), config.lock_wait_timeout());
        Self {
            history,
            entities: Arc::new(EntityStore::new(entity_states)),
            locks: Arc::new(locks),
            orchestration,
            config,
            running: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates the instance unless it already exists, then schedules it.
    ///
    /// Concurrent duplicate requests for the same key converge on one instance.
    pub async fn start_or_create(
        self: &Arc<Self>,
        instance_key: InstanceId,
        input: TransferRequest,
    ) -> Result<InstanceId> {
        input.validate()?;

        let record = InstanceRecord::new(instance_key.clone(), input.clone());
        if self.history.create_instance(record).await? {
            info!(instance = %instance_key, orchestration = self.orchestration.name(), "Instance created");
        } else {
            let existing = self.record(&instance_key).await?;
            if existing.input != input {
                return Err(OrchestrationError::ValidationError(format!(
                    "Instance {instance_key} already exists for a different request"
                )));
            }
            debug!(instance = %instance_key, "Duplicate request joined existing instance");
        }

        self.schedule(instance_key.clone());
        Ok(instance_key)
    }

    pub async fn get_status(&self, id: &InstanceId) -> Result<StatusReport> {
        let record = self.record(id).await?;
        Ok(StatusReport::from(&record))
    }

    /// Record plus full history.
    pub async fn describe(&self, id: &InstanceId) -> Result<OrchestrationInstance> {
        let record = self.record(id).await?;
        let history = self.history.events(id).await?;
        Ok(OrchestrationInstance { record, history })
    }

    /// Waits until the instance is terminal or `timeout` elapses, then reports.
    pub async fn wait_for(&self, id: &InstanceId, timeout: Duration) -> Result<StatusReport> {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let report = self.get_status(id).await?;
            let now = Instant::now();
            if report.status.is_terminal() || now >= deadline {
                return Ok(report);
            }
            let _ = tokio::time::timeout(deadline - now, settled).await;
        }
    }

    /// Schedules every instance that has not reached a terminal state.
    pub async fn resume_unfinished(self: &Arc<Self>) -> Result<usize> {
        let unfinished = self.history.unfinished_instances().await?;
        let mut scheduled = 0;
        for record in unfinished {
            if self.schedule(record.id.clone()) {
                info!(instance = %record.id, status = %record.status, "Resuming unfinished instance");
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Marks an instance Failed from outside.
    ///
    /// A running driver is asked to stop: it finishes the step in flight,
    /// records it, releases its locks and writes the failure itself. With no
    /// driver running the failure is appended directly, and locks the
    /// instance may still hold are left to lease reclamation.
    pub async fn mark_failed(&self, id: &InstanceId, reason: &str) -> Result<StatusReport> {
        let record = self.record(id).await?;
        if record.status.is_terminal() {
            return Ok(StatusReport::from(&record));
        }

        let driver = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            match running.entry(id.clone()) {
                Entry::Occupied(driver) => Some(Arc::clone(driver.get())),
                // Claim the slot so no driver starts while the failure is written.
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Cancellation::default()));
                    None
                }
            }
        };

        if let Some(driver) = driver {
            info!(instance = %id, reason, "Cancellation handed to running driver");
            driver.cancel(reason);
            return self.wait_for(id, self.config.lock_wait_timeout()).await;
        }

        let outcome = self.fail_unattended(id, reason).await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.settled.notify_waiters();
        outcome
    }

    /// Re-runs the procedure purely from recorded history.
    ///
    /// Nothing is dispatched to the entity store or the lock manager. Fails
    /// if the history is incomplete, diverges from the procedure, or ends in
    /// a different result than the one recorded.
    pub async fn replay(&self, id: &InstanceId) -> Result<TransferResult> {
        let record = self.record(id).await?;
        let history = self.history.events(id).await?;
        let mut ctx = OrchestrationContext::new(
            id.clone(),
            history,
            self.services(),
            ContextMode::ReplayOnly,
            Arc::new(Cancellation::default()),
        );

        let result = self.orchestration.run(&mut ctx, &record.input).await?;
        match ctx.recorded_terminal() {
            Some(HistoryEventKind::OrchestrationCompleted { result: recorded }) if *recorded == result => {
                Ok(result)
            }
            Some(other) => Err(OrchestrationError::NonDeterministic {
                instance: id.clone(),
                sequence: ctx.replayed_steps() as u64 + 1,
                expected: "orchestration_completed".to_string(),
                recorded: other.describe(),
            }),
            None => Err(OrchestrationError::ReplayExhausted(id.clone())),
        }
    }

    /// Spawns a driver task unless one is already running for `id`.
    fn schedule(self: &Arc<Self>, id: InstanceId) -> bool {
        let cancellation = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            match running.entry(id.clone()) {
                Entry::Occupied(_) => return false,
                Entry::Vacant(slot) => Arc::clone(slot.insert(Arc::new(Cancellation::default()))),
            }
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.drive(&id, cancellation).await {
                Ok(status) => debug!(instance = %id, status = %status, "Instance settled"),
                Err(e) => error!(instance = %id, error = %e, "Instance driver stopped; will resume on recovery"),
            }
            engine
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            engine.settled.notify_waiters();
        });
        true
    }

    async fn drive(&self, id: &InstanceId, cancellation: Arc<Cancellation>) -> Result<InstanceStatus> {
        let mut record = self.record(id).await?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }

        let history = self.history.events(id).await?;
        if let Some(last) = history.last()
            && last.kind.is_terminal()
        {
            info!(instance = %id, "Terminal event already recorded; settling instance");
            return self.settle(id, &last.kind).await;
        }
        if !history.is_empty() {
            debug!(instance = %id, recorded = history.len(), "Replaying recorded history");
        }

        if record.status == InstanceStatus::Pending {
            record.status = InstanceStatus::Running;
            record.updated_at = Utc::now();
            self.history.put_instance(&record).await?;
        }

        let mut ctx = OrchestrationContext::new(
            id.clone(),
            history,
            self.services(),
            ContextMode::Live,
            cancellation,
        );
        let outcome = self.orchestration.run(&mut ctx, &record.input).await;

        let terminal = match outcome {
            Ok(result) => {
                info!(instance = %id, success = result.success, message = %result.message, "Orchestration completed");
                HistoryEventKind::OrchestrationCompleted { result }
            }
            Err(e) => {
                error!(instance = %id, error = %e, "Orchestration failed");
                ctx.release_held().await;
                let reason = match e {
                    OrchestrationError::Cancelled(reason) => reason,
                    other => other.to_string(),
                };
                HistoryEventKind::OrchestrationFailed { reason }
            }
        };
        match ctx.record_terminal(terminal.clone()).await {
            Ok(()) => self.settle(id, &terminal).await,
            // Someone else recorded the outcome first.
            Err(OrchestrationError::InstanceTerminated(_)) => self.settle_from_history(id).await,
            Err(e) => Err(e),
        }
    }

    /// Appends a failure for an instance no driver is working on.
    async fn fail_unattended(&self, id: &InstanceId, reason: &str) -> Result<StatusReport> {
        let history = self.history.events(id).await?;
        if history.last().is_some_and(|last| last.kind.is_terminal()) {
            self.settle_from_history(id).await?;
            return self.get_status(id).await;
        }

        let sequence = history.last().map_or(1, |last| last.sequence + 1);
        let failed = HistoryEventKind::OrchestrationFailed {
            reason: reason.to_string(),
        };
        match self
            .history
            .append_event(id, HistoryEvent::new(sequence, failed.clone()))
            .await
        {
            Ok(()) => {}
            Err(OrchestrationError::InstanceTerminated(_)) => {
                self.settle_from_history(id).await?;
                return self.get_status(id).await;
            }
            Err(e) => return Err(e),
        }

        let record = self.apply_terminal(id, &failed).await?;
        warn!(instance = %id, reason, "Instance marked failed externally");
        Ok(StatusReport::from(&record))
    }

    async fn settle_from_history(&self, id: &InstanceId) -> Result<InstanceStatus> {
        let history = self.history.events(id).await?;
        match history.last() {
            Some(last) if last.kind.is_terminal() => self.settle(id, &last.kind).await,
            _ => Ok(self.record(id).await?.status),
        }
    }

    /// Brings the instance record in line with a recorded terminal event.
    /// Nothing stays locked once the instance is terminal.
    async fn settle(&self, id: &InstanceId, terminal: &HistoryEventKind) -> Result<InstanceStatus> {
        self.locks.release_all(id).await?;
        Ok(self.apply_terminal(id, terminal).await?.status)
    }

    async fn apply_terminal(&self, id: &InstanceId, terminal: &HistoryEventKind) -> Result<InstanceRecord> {
        let mut record = self.record(id).await?;
        match terminal {
            HistoryEventKind::OrchestrationCompleted { result } => {
                record.status = InstanceStatus::Completed;
                record.result = Some(result.clone());
            }
            HistoryEventKind::OrchestrationFailed { reason } => {
                record.status = InstanceStatus::Failed;
                record.failure = Some(reason.clone());
            }
            _ => return Ok(record),
        }
        record.updated_at = Utc::now();
        self.history.put_instance(&record).await?;
        Ok(record)
    }

    async fn record(&self, id: &InstanceId) -> Result<InstanceRecord> {
        self.history
            .get_instance(id)
            .await?
            .ok_or_else(|| OrchestrationError::InstanceNotFound(id.clone()))
    }

    fn services(&self) -> Services {
        Services {
            history: HistoryStoreRef::clone(&self.history),
            entities: Arc::clone(&self.entities),
            locks: Arc::clone(&self.locks),
            retry: self.config.retry,
        }
    }
}
