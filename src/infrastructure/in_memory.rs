use crate::domain::entity::{EntityId, RoomState};
use crate::domain::lock::LockRecord;
use crate::domain::orchestration::{HistoryEvent, InstanceId, InstanceRecord};
use crate::domain::ports::{EntityStateStore, HistoryStore, LockStore};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for entity state.
///
/// Uses `Arc<RwLock<HashMap<EntityId, RoomState>>>` to allow shared concurrent access.
/// Ideal for testing or single-run usage where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryEntityStore {
    states: Arc<RwLock<HashMap<EntityId, RoomState>>>,
}

impl InMemoryEntityStore {
    /// Creates a new, empty in-memory entity store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStateStore for InMemoryEntityStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        let states = self.states.read().await;
        Ok(states.get(entity).cloned())
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        let mut states = self.states.write().await;
        states.insert(entity.clone(), state.clone());
        Ok(())
    }
}

/// A thread-safe in-memory store for lock records.
#[derive(Default, Clone)]
pub struct InMemoryLockStore {
    locks: Arc<RwLock<HashMap<EntityId, LockRecord>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn get(&self, entity: &EntityId) -> Result<Option<LockRecord>> {
        let locks = self.locks.read().await;
        Ok(locks.get(entity).cloned())
    }

    async fn put(&self, entity: &EntityId, record: &LockRecord) -> Result<()> {
        let mut locks = self.locks.write().await;
        locks.insert(entity.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, entity: &EntityId) -> Result<()> {
        let mut locks = self.locks.write().await;
        locks.remove(entity);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<(EntityId, LockRecord)>> {
        let locks = self.locks.read().await;
        let mut all: Vec<_> = locks
            .iter()
            .map(|(entity, record)| (entity.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}

#[derive(Default)]
struct HistoryState {
    instances: HashMap<InstanceId, InstanceRecord>,
    events: HashMap<InstanceId, Vec<HistoryEvent>>,
}

/// A thread-safe in-memory instance and history store.
///
/// Instance records and events share one lock so create-if-absent and
/// sequence checks are atomic.
#[derive(Default, Clone)]
pub struct InMemoryHistoryStore {
    state: Arc<RwLock<HistoryState>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.instances.contains_key(&record.id) {
            return Ok(false);
        }
        state.instances.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<InstanceRecord>> {
        let state = self.state.read().await;
        Ok(state.instances.get(id).cloned())
    }

    async fn put_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.instances.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn append_event(&self, id: &InstanceId, event: HistoryEvent) -> Result<()> {
        let mut state = self.state.write().await;
        let events = state.events.entry(id.clone()).or_default();
        event.check_follows(id, events.last())?;
        events.push(event);
        Ok(())
    }

    async fn events(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>> {
        let state = self.state.read().await;
        Ok(state.events.get(id).cloned().unwrap_or_default())
    }

    async fn unfinished_instances(&self) -> Result<Vec<InstanceRecord>> {
        let state = self.state.read().await;
        let mut unfinished: Vec<_> = state
            .instances
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(unfinished)
    }
}
