//! Exclusive holds over sets of entities.
//!
//! Entity ids are acquired one at a time in canonical (sorted) order. When an
//! id is held by another instance, everything taken so far in the attempt is
//! given back and the requester sleeps until some lock is released (or the
//! blocking lease lapses), then retries the whole set from the start. Every
//! requester walks the same total order, so no wait cycle can form.

use crate::domain::entity::EntityId;
use crate::domain::lock::{LockHandle, LockRecord, canonical_order};
use crate::domain::orchestration::InstanceId;
use crate::domain::ports::LockStoreRef;
use crate::error::{OrchestrationError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

enum Attempt {
    Granted(LockHandle),
    Contended {
        entity: EntityId,
        blocker: LockRecord,
    },
}

pub struct LockManager {
    store: LockStoreRef,
    lease: Duration,
    wait_timeout: Duration,
    // Makes each check-and-take pass atomic with respect to other passes.
    gate: Mutex<()>,
    released: Notify,
}

impl LockManager {
    pub fn new(store: LockStoreRef, lease: Duration, wait_timeout: Duration) -> Self {
        Self {
            store,
            lease,
            wait_timeout,
            gate: Mutex::new(()),
            released: Notify::new(),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Acquires every id in `entity_ids` for `holder`.
    ///
    /// Suspends (without spinning) while any id is held elsewhere. Gives up
    /// with `LockWaitTimeout` once the configured wait timeout elapses.
    pub async fn acquire(&self, entity_ids: &[EntityId], holder: &InstanceId) -> Result<LockHandle> {
        let order = canonical_order(entity_ids);
        if order.is_empty() {
            return Err(OrchestrationError::ValidationError(
                "Lock request names no entities".to_string(),
            ));
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            // Register interest before trying so a release in between is not lost.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire(&order, holder).await? {
                Attempt::Granted(handle) => return Ok(handle),
                Attempt::Contended { entity, blocker } => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(holder = %holder, entity = %entity, blocker = %blocker.holder, "Gave up waiting for lock");
                        return Err(OrchestrationError::LockWaitTimeout {
                            entity,
                            blocker: blocker.holder,
                        });
                    }
                    debug!(holder = %holder, entity = %entity, blocker = %blocker.holder, "Lock contended, waiting for release");
                    let until_lapse = blocker.remaining(Utc::now()).max(Duration::from_millis(1));
                    let wait = until_lapse.min(deadline - now);
                    let _ = tokio::time::timeout(wait, released).await;
                }
            }
        }
    }

    async fn try_acquire(&self, order: &[EntityId], holder: &InstanceId) -> Result<Attempt> {
        let _gate = self.gate.lock().await;
        let now = Utc::now();
        let record = LockRecord::new(order, holder.clone(), now, self.lease);
        let mut taken: Vec<&EntityId> = Vec::with_capacity(order.len());

        for entity in order {
            if let Some(existing) = self.store.get(entity).await?
                && existing.holder != *holder
            {
                if existing.is_expired(now) {
                    self.reclaim(&existing).await?;
                } else {
                    for id in taken {
                        self.store.remove(id).await?;
                    }
                    return Ok(Attempt::Contended {
                        entity: entity.clone(),
                        blocker: existing,
                    });
                }
            }
            self.store.put(entity, &record).await?;
            taken.push(entity);
        }

        info!(
            holder = %holder,
            entities = ?order.iter().map(EntityId::to_string).collect::<Vec<_>>(),
            lease_expires_at = %record.lease_expires_at,
            "Lock acquired"
        );
        Ok(Attempt::Granted(LockHandle::from(record)))
    }

    /// Removes every row of `expired` still attributed to its holder.
    async fn reclaim(&self, expired: &LockRecord) -> Result<()> {
        warn!(
            holder = %expired.holder,
            acquired_at = %expired.acquired_at,
            "Lock lease expired, reclaiming"
        );
        for id in &expired.entity_ids {
            if let Some(current) = self.store.get(id).await?
                && current.holder == expired.holder
            {
                self.store.remove(id).await?;
            }
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Releases the hold described by `handle`. Idempotent.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let _gate = self.gate.lock().await;
        for id in handle.entity_ids() {
            if let Some(current) = self.store.get(id).await?
                && current.holder == *handle.holder()
            {
                self.store.remove(id).await?;
            }
        }
        self.released.notify_waiters();
        info!(holder = %handle.holder(), "Lock released");
        Ok(())
    }

    /// Releases everything held by `holder`. Returns the number of ids freed.
    pub async fn release_all(&self, holder: &InstanceId) -> Result<usize> {
        let _gate = self.gate.lock().await;
        let mut freed = 0;
        for (id, record) in self.store.all().await? {
            if record.holder == *holder {
                self.store.remove(&id).await?;
                freed += 1;
            }
        }
        if freed > 0 {
            self.released.notify_waiters();
            info!(holder = %holder, freed, "Released remaining locks");
        }
        Ok(freed)
    }

    /// Confirms `handle` still holds every id it covers under a live lease.
    pub async fn validate(&self, handle: &LockHandle) -> Result<()> {
        self.validate_at(handle, Utc::now()).await
    }

    async fn validate_at(&self, handle: &LockHandle, now: DateTime<Utc>) -> Result<()> {
        for id in handle.entity_ids() {
            let still_held = match self.store.get(id).await? {
                Some(current) => current.holder == *handle.holder() && !current.is_expired(now),
                None => false,
            };
            if !still_held {
                return Err(OrchestrationError::LockLeaseExpired {
                    holder: handle.holder().clone(),
                    entity: id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Force-releases every lock whose lease has lapsed.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let _gate = self.gate.lock().await;
        let now = Utc::now();
        let mut reclaimed = 0;
        for (id, record) in self.store.all().await? {
            if record.is_expired(now) {
                warn!(holder = %record.holder, entity = %id, "Reclaiming expired lock");
                self.store.remove(&id).await?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.released.notify_waiters();
        }
        Ok(reclaimed)
    }

    /// Entity ids currently recorded as held by `holder`.
    pub async fn held_by(&self, holder: &InstanceId) -> Result<Vec<EntityId>> {
        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|(_, record)| record.holder == *holder)
            .map(|(id, _)| id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::LockStore;
    use crate::infrastructure::in_memory::InMemoryLockStore;
    use std::sync::Arc;

    fn manager(lease: Duration) -> (Arc<LockManager>, Arc<InMemoryLockStore>) {
        let store = Arc::new(InMemoryLockStore::new());
        let manager = LockManager::new(store.clone(), lease, Duration::from_secs(5));
        (Arc::new(manager), store)
    }

    fn rooms(keys: &[&str]) -> Vec<EntityId> {
        keys.iter().map(|key| EntityId::room(*key)).collect()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (locks, store) = manager(Duration::from_secs(30));
        let holder = InstanceId::new("orch.b.a");

        let handle = locks.acquire(&rooms(&["b", "a"]), &holder).await.unwrap();
        assert_eq!(handle.entity_ids(), rooms(&["a", "b"]).as_slice());
        assert_eq!(locks.held_by(&holder).await.unwrap(), rooms(&["a", "b"]));
        assert_eq!(store.get(&EntityId::room("a")).await.unwrap().unwrap().holder, holder);

        locks.release(&handle).await.unwrap();
        assert!(locks.held_by(&holder).await.unwrap().is_empty());
        // Releasing twice is harmless.
        locks.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_holder_reacquires() {
        let (locks, _) = manager(Duration::from_secs(30));
        let holder = InstanceId::new("orch.1.2");

        let first = locks.acquire(&rooms(&["1", "2"]), &holder).await.unwrap();
        let second = locks.acquire(&rooms(&["1", "2"]), &holder).await.unwrap();
        assert!(second.record().lease_expires_at >= first.record().lease_expires_at);
        locks.validate(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_request_waits_for_release() {
        let (locks, _) = manager(Duration::from_secs(30));
        let first = InstanceId::new("orch.a.b");
        let second = InstanceId::new("orch.b.c");

        let handle = locks.acquire(&rooms(&["a", "b"]), &first).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let second = second.clone();
            tokio::spawn(async move { locks.acquire(&rooms(&["b", "c"]), &second).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        // The waiter gave back "c" when it found "b" taken.
        assert!(locks.held_by(&second).await.unwrap().is_empty());

        locks.release(&handle).await.unwrap();
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.holder(), &second);
        assert_eq!(locks.held_by(&second).await.unwrap(), rooms(&["b", "c"]));
    }

    #[tokio::test]
    async fn test_opposite_request_orders_do_not_deadlock() {
        let (locks, _) = manager(Duration::from_secs(30));
        let mut handles = Vec::new();
        for i in 0..10 {
            let locks = locks.clone();
            let keys = if i % 2 == 0 { ["x", "y"] } else { ["y", "x"] };
            handles.push(tokio::spawn(async move {
                let holder = InstanceId::new(format!("orch.{i}"));
                let handle = locks.acquire(&rooms(&keys), &holder).await?;
                tokio::time::sleep(Duration::from_millis(2)).await;
                locks.release(&handle).await
            }));
        }

        let all = async {
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("lock requests deadlocked");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_by_next_requester() {
        let (locks, _) = manager(Duration::from_millis(30));
        let crashed = InstanceId::new("orch.crashed");
        let next = InstanceId::new("orch.next");

        let stale = locks.acquire(&rooms(&["1"]), &crashed).await.unwrap();

        let granted = tokio::time::timeout(
            Duration::from_secs(2),
            locks.acquire(&rooms(&["1", "2"]), &next),
        )
        .await
        .expect("lease never lapsed")
        .unwrap();

        assert_eq!(granted.holder(), &next);
        let err = locks.validate(&stale).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::LockLeaseExpired { .. }));
    }

    #[tokio::test]
    async fn test_validate_detects_expiry_without_contention() {
        let (locks, _) = manager(Duration::from_millis(10));
        let holder = InstanceId::new("orch.1.2");
        let handle = locks.acquire(&rooms(&["1", "2"]), &holder).await.unwrap();

        locks.validate(&handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.validate(&handle).await.is_err());

        assert_eq!(locks.reclaim_expired().await.unwrap(), 2);
        assert!(locks.held_by(&holder).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_timeout_rejects_request() {
        let store = Arc::new(InMemoryLockStore::new());
        let locks = LockManager::new(store, Duration::from_secs(30), Duration::from_millis(20));

        locks
            .acquire(&rooms(&["1"]), &InstanceId::new("orch.owner"))
            .await
            .unwrap();
        let err = locks
            .acquire(&rooms(&["1"]), &InstanceId::new("orch.other"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::LockWaitTimeout { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_release_all() {
        let (locks, _) = manager(Duration::from_secs(30));
        let holder = InstanceId::new("orch.1.2");
        locks.acquire(&rooms(&["1", "2"]), &holder).await.unwrap();

        assert_eq!(locks.release_all(&holder).await.unwrap(), 2);
        assert_eq!(locks.release_all(&holder).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected() {
        let (locks, _) = manager(Duration::from_secs(30));
        let err = locks
            .acquire(&[], &InstanceId::new("orch.none"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ValidationError(_)));
    }
}
