#![allow(dead_code)]

use async_trait::async_trait;
use roomflow::application::engine::OrchestrationEngine;
use roomflow::application::retry::RetryPolicy;
use roomflow::application::transfer::TransferOrchestration;
use roomflow::config::EngineConfig;
use roomflow::domain::entity::{EntityId, RoomState};
use roomflow::domain::orchestration::{InstanceId, StatusReport, TransferRequest};
use roomflow::domain::ports::{EntityStateStore, EntityStateStoreRef};
use roomflow::error::{OrchestrationError, Result};
use roomflow::infrastructure::in_memory::{
    InMemoryEntityStore, InMemoryHistoryStore, InMemoryLockStore,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const WAIT: Duration = Duration::from_secs(10);

/// Short backoff so retry paths finish quickly.
pub fn quick_config() -> EngineConfig {
    EngineConfig {
        lock_wait_timeout_ms: 10_000,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<OrchestrationEngine>,
    pub history: Arc<InMemoryHistoryStore>,
    pub locks: Arc<InMemoryLockStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_states(Arc::new(InMemoryEntityStore::new()))
    }

    pub fn with_states(states: EntityStateStoreRef) -> Self {
        Self::with_config(states, quick_config())
    }

    pub fn with_config(states: EntityStateStoreRef, config: EngineConfig) -> Self {
        let history = Arc::new(InMemoryHistoryStore::new());
        let locks = Arc::new(InMemoryLockStore::new());
        let engine = Arc::new(OrchestrationEngine::new(
            history.clone(),
            states,
            locks.clone(),
            Arc::new(TransferOrchestration),
            config,
        ));
        Self {
            engine,
            history,
            locks,
        }
    }

    pub async fn start(&self, from: &str, to: &str) -> InstanceId {
        let request = TransferRequest::new(from, to);
        self.engine
            .start_or_create(InstanceId::for_transfer(&request), request)
            .await
            .unwrap()
    }

    pub async fn transfer(&self, from: &str, to: &str) -> StatusReport {
        let id = self.start(from, to).await;
        self.engine.wait_for(&id, WAIT).await.unwrap()
    }

    pub async fn is_booked(&self, room: &str) -> bool {
        self.engine
            .entities()
            .entity(&EntityId::room(room))
            .await
            .unwrap()
            .state
            .booked
    }
}

pub async fn seed(states: &dyn EntityStateStore, room: &str, booked: bool) {
    states
        .store(&EntityId::room(room), &RoomState { booked })
        .await
        .unwrap();
}

/// Counts durable writes per entity.
#[derive(Default)]
pub struct CountingEntityStateStore {
    inner: InMemoryEntityStore,
    writes: Mutex<HashMap<EntityId, usize>>,
}

impl CountingEntityStateStore {
    pub fn writes(&self, room: &str) -> usize {
        let writes = self.writes.lock().unwrap();
        writes.get(&EntityId::room(room)).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EntityStateStore for CountingEntityStateStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        self.inner.load(entity).await
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        *self.writes.lock().unwrap().entry(entity.clone()).or_default() += 1;
        self.inner.store(entity, state).await
    }
}

/// Fails the first `failures` writes with a storage error, then recovers.
pub struct FlakyEntityStateStore {
    inner: InMemoryEntityStore,
    remaining_failures: AtomicUsize,
}

impl FlakyEntityStateStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryEntityStore::new(),
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl EntityStateStore for FlakyEntityStateStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        self.inner.load(entity).await
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OrchestrationError::StorageError("disk hiccup".into()));
        }
        self.inner.store(entity, state).await
    }
}

/// Never persists writes for one room.
pub struct FailingEntityStateStore {
    inner: InMemoryEntityStore,
    broken: EntityId,
}

impl FailingEntityStateStore {
    pub fn new(broken_room: &str) -> Self {
        Self {
            inner: InMemoryEntityStore::new(),
            broken: EntityId::room(broken_room),
        }
    }
}

#[async_trait]
impl EntityStateStore for FailingEntityStateStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        self.inner.load(entity).await
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        if *entity == self.broken {
            return Err(OrchestrationError::StorageError(format!(
                "{entity} volume is read-only"
            )));
        }
        self.inner.store(entity, state).await
    }
}

/// Holds every write to one room for `delay`.
pub struct SlowEntityStateStore {
    inner: InMemoryEntityStore,
    slow: EntityId,
    delay: Duration,
    writing: Notify,
}

impl SlowEntityStateStore {
    pub fn new(slow_room: &str, delay: Duration) -> Self {
        Self {
            inner: InMemoryEntityStore::new(),
            slow: EntityId::room(slow_room),
            delay,
            writing: Notify::new(),
        }
    }

    /// Resolves once a write to the slow room has started.
    pub async fn writing(&self) {
        self.writing.notified().await;
    }
}

#[async_trait]
impl EntityStateStore for SlowEntityStateStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        self.inner.load(entity).await
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        if *entity == self.slow {
            self.writing.notify_one();
            tokio::time::sleep(self.delay).await;
        }
        self.inner.store(entity, state).await
    }
}

pub fn write_requests(path: &Path, rows: &[(&str, &str)]) -> std::result::Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["from_room", "to_room"])?;
    for (from, to) in rows {
        wtr.write_record([from, to])?;
    }

    wtr.flush()?;
    Ok(())
}
