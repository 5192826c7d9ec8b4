use super::entity::EntityId;
use super::orchestration::InstanceId;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sorts and de-duplicates entity ids into the global acquisition order.
pub fn canonical_order(entity_ids: &[EntityId]) -> Vec<EntityId> {
    let mut order = entity_ids.to_vec();
    order.sort();
    order.dedup();
    order
}

/// A durable exclusive hold over a set of entities.
///
/// The same record is persisted under every entity id it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Covered entities, in canonical order.
    pub entity_ids: Vec<EntityId>,
    pub holder: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(
        entity_ids: &[EntityId],
        holder: InstanceId,
        acquired_at: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        let lease = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
        Self {
            entity_ids: canonical_order(entity_ids),
            holder,
            acquired_at,
            lease_expires_at: acquired_at
                .checked_add_signed(lease)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }

    pub fn covers(&self, entity: &EntityId) -> bool {
        self.entity_ids.binary_search(entity).is_ok()
    }

    /// Time left on the lease, zero once lapsed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.lease_expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Proof of a granted lock, handed to the requesting orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    record: LockRecord,
}

impl LockHandle {
    pub fn entity_ids(&self) -> &[EntityId] {
        &self.record.entity_ids
    }

    pub fn holder(&self) -> &InstanceId {
        &self.record.holder
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn covers(&self, entity: &EntityId) -> bool {
        self.record.covers(entity)
    }
}

impl From<LockRecord> for LockHandle {
    fn from(record: LockRecord) -> Self {
        Self { record }
    }
}
