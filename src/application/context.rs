//! Replay-aware execution context handed to an orchestration procedure.
//!
//! Each side-effecting step (lock, entity operation, release) first consults
//! the recorded history. If the next recorded event matches the requested
//! step, its recorded result is returned and nothing is dispatched. Once the
//! history is exhausted the step is dispatched for real, retried on transient
//! failures, and its result appended to the history before the procedure sees
//! it.

use super::entity_store::EntityStore;
use super::lock_manager::LockManager;
use super::retry::RetryPolicy;
use crate::domain::entity::{EntityId, EntityOperation, OperationResult};
use crate::domain::lock::{LockHandle, canonical_order};
use crate::domain::orchestration::{
    HistoryEvent, HistoryEventKind, InstanceId, TransferRequest, TransferResult,
};
use crate::domain::ports::HistoryStoreRef;
use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// A deterministic procedure driven by the orchestration engine.
///
/// Implementations must derive every decision from `input` and the values
/// returned by `ctx`; wall-clock time, randomness and outside state are off
/// limits because replay would diverge.
#[async_trait]
pub trait Orchestration: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        ctx: &mut OrchestrationContext,
        input: &TransferRequest,
    ) -> Result<TransferResult>;
}

/// Collaborators a context dispatches live steps to.
#[derive(Clone)]
pub struct Services {
    pub history: HistoryStoreRef,
    pub entities: Arc<EntityStore>,
    pub locks: Arc<LockManager>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Replay recorded steps, then dispatch new ones.
    Live,
    /// Replay recorded steps only; reaching the end of history is an error.
    ReplayOnly,
}

/// External request to stop one running instance.
///
/// The driver observes it before each new dispatch; a step already in flight
/// finishes and is recorded first.
#[derive(Debug, Default)]
pub struct Cancellation {
    reason: Mutex<Option<String>>,
    requested: Notify,
}

impl Cancellation {
    /// Records `reason` unless a cancellation was already requested.
    pub fn cancel(&self, reason: &str) {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        self.requested.notify_waiters();
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once a cancellation is requested.
    pub async fn requested(&self) -> String {
        loop {
            let requested = self.requested.notified();
            tokio::pin!(requested);
            requested.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            requested.await;
        }
    }
}

pub struct OrchestrationContext {
    instance_id: InstanceId,
    history: Vec<HistoryEvent>,
    cursor: usize,
    held: Vec<LockHandle>,
    services: Services,
    mode: ContextMode,
    cancellation: Arc<Cancellation>,
}

impl OrchestrationContext {
    pub fn new(
        instance_id: InstanceId,
        history: Vec<HistoryEvent>,
        services: Services,
        mode: ContextMode,
        cancellation: Arc<Cancellation>,
    ) -> Self {
        Self {
            instance_id,
            history,
            cursor: 0,
            held: Vec::new(),
            services,
            mode,
            cancellation,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// True while the procedure is re-walking steps that already happened.
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.history.len()
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Number of recorded steps consumed so far.
    pub fn replayed_steps(&self) -> usize {
        self.cursor.min(self.history.len())
    }

    /// Proxy exposing the entity contract (`is_currently_booked`, `book`, `unbook`).
    pub fn entity<'a>(&'a mut self, id: &'a EntityId) -> EntityProxy<'a> {
        EntityProxy { ctx: self, id }
    }

    /// Acquires an exclusive lock over `entities`.
    pub async fn lock(&mut self, entities: &[EntityId]) -> Result<LockHandle> {
        let order = canonical_order(entities);

        if let Some(event) = self.next_recorded() {
            return match event.kind {
                HistoryEventKind::LockAcquired { lock } if lock.entity_ids == order => {
                    let handle = LockHandle::from(lock);
                    self.held.push(handle.clone());
                    Ok(handle)
                }
                other => Err(self.diverged(event.sequence, format!("lock_acquired {order:?}"), &other)),
            };
        }
        self.ensure_live()?;
        self.ensure_not_cancelled()?;

        let locks = Arc::clone(&self.services.locks);
        let cancellation = Arc::clone(&self.cancellation);
        let holder = self.instance_id.clone();
        // A cancelled instance stops waiting; rows taken so far go with release_all.
        let acquired = tokio::select! {
            acquired = self.services.retry.run("lock acquisition", || locks.acquire(&order, &holder)) => acquired,
            reason = cancellation.requested() => Err(OrchestrationError::Cancelled(reason)),
        };
        let handle = acquired?;
        self.record(HistoryEventKind::LockAcquired {
            lock: handle.record().clone(),
        })
        .await?;
        self.held.push(handle.clone());
        Ok(handle)
    }

    /// Releases a lock obtained from [`OrchestrationContext::lock`].
    pub async fn release(&mut self, handle: LockHandle) -> Result<()> {
        let entity_ids = handle.entity_ids().to_vec();

        if let Some(event) = self.next_recorded() {
            return match event.kind {
                HistoryEventKind::LockReleased { entity_ids: recorded } if recorded == entity_ids => {
                    self.held.retain(|held| held.entity_ids() != entity_ids.as_slice());
                    Ok(())
                }
                other => Err(self.diverged(event.sequence, format!("lock_released {entity_ids:?}"), &other)),
            };
        }
        self.ensure_live()?;

        let locks = Arc::clone(&self.services.locks);
        self.services
            .retry
            .run("lock release", || locks.release(&handle))
            .await?;
        self.record(HistoryEventKind::LockReleased {
            entity_ids: entity_ids.clone(),
        })
        .await?;
        self.held.retain(|held| held.entity_ids() != entity_ids.as_slice());
        Ok(())
    }

    /// Dispatches `operation` to `entity` through the entity store.
    pub async fn call_entity(
        &mut self,
        entity: &EntityId,
        operation: EntityOperation,
    ) -> Result<OperationResult> {
        if let Some(event) = self.next_recorded() {
            return match event.kind {
                HistoryEventKind::EntityOpCompleted {
                    entity: recorded_entity,
                    operation: recorded_operation,
                    result,
                } if recorded_entity == *entity && recorded_operation == operation => Ok(result),
                other => Err(self.diverged(event.sequence, format!("{operation} on {entity}"), &other)),
            };
        }
        self.ensure_live()?;
        self.ensure_not_cancelled()?;

        if operation.is_mutation() {
            self.revalidate_locks(entity).await?;
        }

        let entities = Arc::clone(&self.services.entities);
        let result = self
            .services
            .retry
            .run("entity operation", || entities.apply(entity, operation))
            .await?;
        self.record(HistoryEventKind::EntityOpCompleted {
            entity: entity.clone(),
            operation,
            result,
        })
        .await?;
        Ok(result)
    }

    /// A hold may have been reclaimed while this instance was suspended or
    /// crashed; mutating under a lapsed lease is never allowed.
    async fn revalidate_locks(&self, entity: &EntityId) -> Result<()> {
        for handle in self.held.iter().filter(|handle| handle.covers(entity)) {
            self.services.locks.validate(handle).await?;
        }
        Ok(())
    }

    /// Releases and records every lock the procedure still holds. Used by the
    /// engine when a procedure stops with an error.
    pub(crate) async fn release_held(&mut self) {
        self.cursor = self.history.len();
        for handle in std::mem::take(&mut self.held) {
            let locks = Arc::clone(&self.services.locks);
            let released = self
                .services
                .retry
                .run("lock release", || locks.release(&handle))
                .await;
            let recorded = match released {
                Ok(()) => {
                    self.record(HistoryEventKind::LockReleased {
                        entity_ids: handle.entity_ids().to_vec(),
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = recorded {
                warn!(instance = %self.instance_id, error = %e, "Could not record lock release");
            }
        }
    }

    /// Appends a terminal event. Used by the engine, not by procedures.
    pub(crate) async fn record_terminal(&mut self, kind: HistoryEventKind) -> Result<()> {
        self.cursor = self.history.len();
        self.record(kind).await
    }

    /// The terminal event recorded after the consumed steps, if any.
    pub(crate) fn recorded_terminal(&self) -> Option<&HistoryEventKind> {
        self.history
            .get(self.cursor)
            .map(|event| &event.kind)
            .filter(|kind| kind.is_terminal())
    }

    fn next_recorded(&mut self) -> Option<HistoryEvent> {
        let event = self.history.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(event)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.mode {
            ContextMode::Live => Ok(()),
            ContextMode::ReplayOnly => Err(OrchestrationError::ReplayExhausted(
                self.instance_id.clone(),
            )),
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        match self.cancellation.reason() {
            Some(reason) => Err(OrchestrationError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    async fn record(&mut self, kind: HistoryEventKind) -> Result<()> {
        let sequence = self.history.last().map_or(1, |last| last.sequence + 1);
        let event = HistoryEvent::new(sequence, kind);
        let history = HistoryStoreRef::clone(&self.services.history);
        let instance_id = &self.instance_id;
        self.services
            .retry
            .run("history append", || history.append_event(instance_id, event.clone()))
            .await?;
        self.history.push(event);
        self.cursor = self.history.len();
        Ok(())
    }

    fn diverged(&self, sequence: u64, expected: String, recorded: &HistoryEventKind) -> OrchestrationError {
        OrchestrationError::NonDeterministic {
            instance: self.instance_id.clone(),
            sequence,
            expected,
            recorded: recorded.describe(),
        }
    }
}

/// Typed view of one entity inside an orchestration.
pub struct EntityProxy<'a> {
    ctx: &'a mut OrchestrationContext,
    id: &'a EntityId,
}

impl EntityProxy<'_> {
    pub async fn is_currently_booked(self) -> Result<bool> {
        let result = self.ctx.call_entity(self.id, EntityOperation::CheckState).await?;
        Ok(result.booked)
    }

    pub async fn book(self) -> Result<()> {
        self.ctx.call_entity(self.id, EntityOperation::book()).await?;
        Ok(())
    }

    pub async fn unbook(self) -> Result<()> {
        self.ctx.call_entity(self.id, EntityOperation::unbook()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_cancellation_reason_wins() {
        let cancellation = Cancellation::default();
        assert_eq!(cancellation.reason(), None);

        cancellation.cancel("cancelled by operator");
        cancellation.cancel("second request");
        assert_eq!(cancellation.reason().as_deref(), Some("cancelled by operator"));
        assert_eq!(cancellation.requested().await, "cancelled by operator");
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_cancel() {
        let cancellation = Arc::new(Cancellation::default());
        let waiter = tokio::spawn({
            let cancellation = Arc::clone(&cancellation);
            async move { cancellation.requested().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cancellation.cancel("shutdown");

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "shutdown");
    }
}
