use crate::domain::entity::{EntityId, RoomState};
use crate::domain::lock::LockRecord;
use crate::domain::orchestration::{HistoryEvent, InstanceId, InstanceRecord};
use crate::domain::ports::{EntityStateStore, HistoryStore, LockStore};
use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Column Family for storing entity states.
pub const CF_ENTITIES: &str = "entities";
/// Column Family for storing lock records.
pub const CF_LOCKS: &str = "locks";
/// Column Family for storing orchestration instance records.
pub const CF_INSTANCES: &str = "instances";
/// Column Family for storing orchestration history events.
pub const CF_HISTORY: &str = "history";

/// A persistent store implementation using RocksDB.
///
/// Implements every storage port on one database, with a separate Column
/// Family per concern. Writes are synced before returning so that a
/// successful call survives a process crash.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    // Serializes read-check-write sequences (create-if-absent, appends).
    write_gate: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that all required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_ENTITIES, CF_LOCKS, CF_INSTANCES, CF_HISTORY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            OrchestrationError::StorageError(format!("{name} column family not found"))
        })
    }

    fn sync_writes() -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        write_opts
    }

    fn put_json<T: Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(family)?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf_opt(cf, key, bytes, &Self::sync_writes())?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Iterates a column family from `prefix`, stopping at the first key outside it.
    fn scan_json<T: DeserializeOwned>(&self, family: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf(family)?;
        let mut items = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key.to_vec(), serde_json::from_slice(&value)?));
        }

        Ok(items)
    }

    fn history_prefix(id: &InstanceId) -> Vec<u8> {
        let mut prefix = id.as_str().as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn history_key(id: &InstanceId, sequence: u64) -> Vec<u8> {
        let mut key = Self::history_prefix(id);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

#[async_trait]
impl EntityStateStore for RocksDBStore {
    async fn load(&self, entity: &EntityId) -> Result<Option<RoomState>> {
        self.get_json(CF_ENTITIES, entity.storage_key().as_bytes())
    }

    async fn store(&self, entity: &EntityId, state: &RoomState) -> Result<()> {
        self.put_json(CF_ENTITIES, entity.storage_key().as_bytes(), state)
    }
}

#[async_trait]
impl LockStore for RocksDBStore {
    async fn get(&self, entity: &EntityId) -> Result<Option<LockRecord>> {
        self.get_json(CF_LOCKS, entity.storage_key().as_bytes())
    }

    async fn put(&self, entity: &EntityId, record: &LockRecord) -> Result<()> {
        self.put_json(CF_LOCKS, entity.storage_key().as_bytes(), record)
    }

    async fn remove(&self, entity: &EntityId) -> Result<()> {
        let cf = self.cf(CF_LOCKS)?;
        self.db
            .delete_cf_opt(cf, entity.storage_key().as_bytes(), &Self::sync_writes())?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<(EntityId, LockRecord)>> {
        // Every record lists the ids it covers; the key tells which one this row is for.
        let rows: Vec<(Vec<u8>, LockRecord)> = self.scan_json(CF_LOCKS, &[])?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, record)| {
                let entity = record
                    .entity_ids
                    .iter()
                    .find(|id| id.storage_key().as_bytes() == key.as_slice())
                    .cloned()?;
                Some((entity, record))
            })
            .collect())
    }
}

#[async_trait]
impl HistoryStore for RocksDBStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<bool> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let key = record.id.as_str().as_bytes();
        if self.get_json::<InstanceRecord>(CF_INSTANCES, key)?.is_some() {
            return Ok(false);
        }
        self.put_json(CF_INSTANCES, key, &record)?;
        Ok(true)
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<InstanceRecord>> {
        self.get_json(CF_INSTANCES, id.as_str().as_bytes())
    }

    async fn put_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.put_json(CF_INSTANCES, record.id.as_str().as_bytes(), record)
    }

    async fn append_event(&self, id: &InstanceId, event: HistoryEvent) -> Result<()> {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let existing: Vec<(Vec<u8>, HistoryEvent)> =
            self.scan_json(CF_HISTORY, &Self::history_prefix(id))?;
        event.check_follows(id, existing.last().map(|(_, last)| last))?;
        self.put_json(CF_HISTORY, &Self::history_key(id, event.sequence), &event)
    }

    async fn events(&self, id: &InstanceId) -> Result<Vec<HistoryEvent>> {
        let rows: Vec<(Vec<u8>, HistoryEvent)> =
            self.scan_json(CF_HISTORY, &Self::history_prefix(id))?;
        Ok(rows.into_iter().map(|(_, event)| event).collect())
    }

    async fn unfinished_instances(&self) -> Result<Vec<InstanceRecord>> {
        let rows: Vec<(Vec<u8>, InstanceRecord)> = self.scan_json(CF_INSTANCES, &[])?;
        let mut unfinished: Vec<_> = rows
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| !record.status.is_terminal())
            .collect();
        unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(unfinished)
    }
}
