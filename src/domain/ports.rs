use super::entity::{EntityId, RoomState};
use super::lock::LockRecord;
use super::orchestration::{HistoryEvent, InstanceId, InstanceRecord};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Durable entity state, keyed by entity id.
#[async_trait]
pub trait EntityStateStore: Send + Sync {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>>;
    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()>;
}

/// Durable lock records, one per held entity id.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn get(&self, entity: &EntityId) -> Result<Option<LockRecord>>;
    async fn put(&self, entity: &EntityId, record: &LockRecord) -> Result<()>;
    async fn remove(&self, entity: &EntityId) -> Result<()>;
    async fn all(&self) -> Result<Vec<(EntityId, LockRecord)>>;
}

/// Instance records and their append-only histories.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Creates the instance unless one with the same id exists.
    /// Returns `false` when the id was already taken.
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool>;
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<InstanceRecord>>;
    async fn put_instance(&self, record: &InstanceRecord) -> Result<()>;
    /// Appends `event`, rejecting sequence gaps and appends after a terminal event.
    async fn append_event(&self, id: &InstanceId, event: HistoryEvent) -> Result<()>;
    async fn events(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>>;
    async fn unfinished_instances(&self) -> Result<Vec<InstanceRecord>>;
}

pub type EntityStateStoreRef = Arc<dyn EntityStateStore>;
pub type LockStoreRef = Arc<dyn LockStore>;
pub type HistoryStoreRef = Arc<dyn HistoryStore>;
