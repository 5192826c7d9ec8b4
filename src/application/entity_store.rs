//! Single-writer dispatch of entity operations.
//!
//! Every entity id gets its own mailbox and worker task. Operations for one id
//! are applied strictly in arrival order by that worker; operations for
//! different ids run on different workers and proceed in parallel.

use crate::domain::entity::{Entity, EntityId, EntityOperation, OperationResult, RoomState};
use crate::domain::ports::EntityStateStoreRef;
use crate::error::{OrchestrationError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const MAILBOX_CAPACITY: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Envelope {
    operation: EntityOperation,
    reply: oneshot::Sender<Result<OperationResult>>,
}

struct Mailbox {
    generation: u64,
    sender: mpsc::Sender<Envelope>,
}

type Mailboxes = Arc<Mutex<HashMap<EntityId, Mailbox>>>;

pub struct EntityStore {
    states: EntityStateStoreRef,
    mailboxes: Mailboxes,
    next_generation: AtomicU64,
    idle_timeout: Duration,
}

impl EntityStore {
    pub fn new(states: EntityStateStoreRef) -> Self {
        Self::with_idle_timeout(states, IDLE_TIMEOUT)
    }

    /// Workers that receive nothing for `idle_timeout` retire; the next
    /// operation for their entity starts a fresh one.
    pub fn with_idle_timeout(states: EntityStateStoreRef, idle_timeout: Duration) -> Self {
        Self {
            states,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            idle_timeout,
        }
    }

    /// Applies `operation` to `entity`, returning once the new state is durable.
    ///
    /// A failed call leaves the stored state untouched.
    pub async fn apply(
        &self,
        entity: &EntityId,
        operation: EntityOperation,
    ) -> Result<OperationResult> {
        let (reply, response) = oneshot::channel();
        let mut envelope = Envelope { operation, reply };
        loop {
            let mailbox = self.mailbox(entity);
            match mailbox.send(envelope).await {
                Ok(()) => break,
                // The worker retired between lookup and send.
                Err(mpsc::error::SendError(returned)) => envelope = returned,
            }
        }
        response.await.map_err(|_| worker_gone(entity))?
    }

    /// Reads the current state through the entity's queue.
    pub async fn entity(&self, id: &EntityId) -> Result<Entity> {
        let result = self.apply(id, EntityOperation::CheckState).await?;
        Ok(Entity {
            id: id.clone(),
            state: RoomState {
                booked: result.booked,
            },
        })
    }

    /// Number of entities that currently have a live worker.
    pub fn active_workers(&self) -> usize {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|mailbox| !mailbox.sender.is_closed())
            .count()
    }

    fn mailbox(&self, entity: &EntityId) -> mpsc::Sender<Envelope> {
        let mut mailboxes = self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mailbox) = mailboxes.get(entity)
            && !mailbox.sender.is_closed()
        {
            return mailbox.sender.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run_entity_worker(
            entity.clone(),
            generation,
            EntityStateStoreRef::clone(&self.states),
            Arc::clone(&self.mailboxes),
            self.idle_timeout,
            inbox,
        ));
        mailboxes.insert(
            entity.clone(),
            Mailbox {
                generation,
                sender: sender.clone(),
            },
        );
        sender
    }
}

fn worker_gone(entity: &EntityId) -> OrchestrationError {
    OrchestrationError::EntityUnavailable(entity.clone(), "entity worker stopped".to_string())
}

async fn run_entity_worker(
    entity: EntityId,
    generation: u64,
    states: EntityStateStoreRef,
    mailboxes: Mailboxes,
    idle_timeout: Duration,
    mut inbox: mpsc::Receiver<Envelope>,
) {
    debug!(entity = %entity, "Entity worker started");
    while let Ok(Some(envelope)) = tokio::time::timeout(idle_timeout, inbox.recv()).await {
        handle(&entity, &states, envelope).await;
    }

    // Refuse new sends, then finish whatever was already queued.
    inbox.close();
    while let Ok(envelope) = inbox.try_recv() {
        handle(&entity, &states, envelope).await;
    }

    let mut mailboxes = mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
    if mailboxes
        .get(&entity)
        .is_some_and(|mailbox| mailbox.generation == generation)
    {
        mailboxes.remove(&entity);
    }
    debug!(entity = %entity, "Entity worker retired");
}

async fn handle(entity: &EntityId, states: &EntityStateStoreRef, envelope: Envelope) {
    let Envelope { operation, reply } = envelope;
    let outcome = apply_operation(entity, states, operation).await;
    if let Err(e) = &outcome {
        warn!(entity = %entity, operation = %operation, error = %e, "Entity operation failed");
    }
    // The caller may have given up waiting; nothing to do then.
    let _ = reply.send(outcome);
}

async fn apply_operation(
    entity: &EntityId,
    states: &EntityStateStoreRef,
    operation: EntityOperation,
) -> Result<OperationResult> {
    let mut state = states
        .load(entity)
        .await
        .map_err(|e| unavailable(entity, e))?
        .unwrap_or_default();

    let result = operation.apply(&mut state);

    if operation.is_mutation() {
        states
            .store(entity, &state)
            .await
            .map_err(|e| unavailable(entity, e))?;
        debug!(entity = %entity, operation = %operation, booked = result.booked, "Entity state persisted");
    }

    Ok(result)
}

fn unavailable(entity: &EntityId, e: OrchestrationError) -> OrchestrationError {
    if e.is_transient() {
        OrchestrationError::EntityUnavailable(entity.clone(), e.to_string())
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::EntityStateStore;
    use crate::infrastructure::in_memory::InMemoryEntityStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Fails writes while `broken` is set; flags overlapping calls per store.
    #[derive(Default)]
    struct WatchedStore {
        inner: InMemoryEntityStore,
        broken: AtomicBool,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl EntityStateStore for WatchedStore {
        async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
            self.inner.load(entity).await
        }

        async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(OrchestrationError::StorageError("disk unavailable".into()));
            }
            self.inner.store(entity, state).await
        }
    }

    #[tokio::test]
    async fn test_apply_persists_state() {
        let states = Arc::new(InMemoryEntityStore::new());
        let store = EntityStore::new(states.clone());
        let room = EntityId::room("101");

        let result = store.apply(&room, EntityOperation::book()).await.unwrap();
        assert!(result.booked);
        assert_eq!(states.load(&room).await.unwrap(), Some(RoomState { booked: true }));

        let checked = store.apply(&room, EntityOperation::CheckState).await.unwrap();
        assert!(checked.booked);
        assert!(store.entity(&room).await.unwrap().state.booked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_operations_on_one_entity_never_overlap() {
        let watched = Arc::new(WatchedStore::default());
        let store = Arc::new(EntityStore::new(watched.clone()));
        let room = EntityId::room("101");

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let room = room.clone();
            let operation = if i % 2 == 0 {
                EntityOperation::book()
            } else {
                EntityOperation::unbook()
            };
            handles.push(tokio::spawn(
                async move { store.apply(&room, operation).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(!watched.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_state() {
        let watched = Arc::new(WatchedStore::default());
        let store = EntityStore::new(watched.clone());
        let room = EntityId::room("7");

        watched.broken.store(true, Ordering::SeqCst);
        let err = store.apply(&room, EntityOperation::book()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::EntityUnavailable(..)));
        assert!(err.is_transient());

        watched.broken.store(false, Ordering::SeqCst);
        let checked = store.apply(&room, EntityOperation::CheckState).await.unwrap();
        assert!(!checked.booked);
    }

    #[tokio::test]
    async fn test_idle_workers_retire_and_restart_on_demand() {
        let states = Arc::new(InMemoryEntityStore::new());
        let store = EntityStore::with_idle_timeout(states.clone(), Duration::from_millis(20));
        let room = EntityId::room("12");

        store.apply(&room, EntityOperation::book()).await.unwrap();
        assert_eq!(store.active_workers(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.active_workers(), 0);
        assert!(store.mailboxes.lock().unwrap().is_empty());

        let checked = store.apply(&room, EntityOperation::CheckState).await.unwrap();
        assert!(checked.booked);
        assert_eq!(store.active_workers(), 1);
    }
}
