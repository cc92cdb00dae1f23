//! Sticky-record coordinator.
//!
//! Sole arbiter of destructive actions on a (file, pool) pair. A transient
//! pin is first reserved locally through a conditional insert, so two tasks
//! of this engine can never both believe they hold it, and only then written
//! to the pool.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use galleon_common::error::{GalleonError, Result};
use galleon_common::{FileId, PoolName, StickyRecord, TRANSIENT_STICKY_OWNER};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::executors::with_timeout;
use crate::provider::PoolClient;

type PinKey = (FileId, PoolName);

#[derive(Debug, Clone, Copy)]
struct PinHolder {
    operation: Uuid,
    expires_at: Instant,
}

/// Places and releases the engine's pins
pub struct StickyCoordinator {
    client: Arc<dyn PoolClient>,
    pins: DashMap<PinKey, PinHolder>,
    ttl: Duration,
    request_timeout: Duration,
}

impl StickyCoordinator {
    pub fn new(client: Arc<dyn PoolClient>, ttl: Duration, request_timeout: Duration) -> Self {
        Self {
            client,
            pins: DashMap::new(),
            ttl,
            request_timeout,
        }
    }

    /// Sets the transient pin on behalf of `operation`. Re-pinning by the
    /// same operation refreshes it; a live pin of any other operation, local
    /// or found on the pool, fails with `PinConflict`.
    pub async fn pin(&self, file_id: &FileId, pool: &PoolName, operation: Uuid) -> Result<()> {
        let key = (file_id.clone(), pool.clone());
        let fresh = self.reserve(&key, operation)?;

        if fresh {
            match self.remote_transient_pin(file_id, pool).await {
                Ok(false) => {}
                Ok(true) => {
                    self.release(&key, operation);
                    return Err(GalleonError::PinConflict {
                        file_id: file_id.clone(),
                        pool: pool.clone(),
                    });
                }
                Err(e) => {
                    self.release(&key, operation);
                    return Err(e);
                }
            }
        }

        let record = StickyRecord::transient(self.ttl);
        let set = with_timeout(self.request_timeout, || format!("pool {}", pool), {
            self.client.set_sticky(file_id, pool, record)
        })
        .await;
        if let Err(e) = set {
            self.release(&key, operation);
            return Err(e);
        }
        debug!(file = %file_id, pool = %pool, %operation, "pinned");
        Ok(())
    }

    /// Removes the transient pin if `operation` holds it. Returns whether a
    /// pin was released.
    pub async fn unpin(&self, file_id: &FileId, pool: &PoolName, operation: Uuid) -> Result<bool> {
        let key = (file_id.clone(), pool.clone());
        if !self.release(&key, operation) {
            return Ok(false);
        }
        with_timeout(self.request_timeout, || format!("pool {}", pool), {
            self.client.clear_sticky(file_id, pool, TRANSIENT_STICKY_OWNER)
        })
        .await?;
        debug!(file = %file_id, pool = %pool, %operation, "unpinned");
        Ok(true)
    }

    /// Fails with `PinConflict` if a transient pin not held by `operation`
    /// protects the replica.
    pub async fn assert_unpinned(
        &self,
        file_id: &FileId,
        pool: &PoolName,
        operation: Option<Uuid>,
    ) -> Result<()> {
        let key = (file_id.clone(), pool.clone());
        let held_by_caller = match self.pins.get(&key) {
            Some(holder) if holder.expires_at > Instant::now() => {
                if Some(holder.operation) != operation {
                    return Err(GalleonError::PinConflict {
                        file_id: file_id.clone(),
                        pool: pool.clone(),
                    });
                }
                true
            }
            _ => false,
        };
        if !held_by_caller && self.remote_transient_pin(file_id, pool).await? {
            return Err(GalleonError::PinConflict {
                file_id: file_id.clone(),
                pool: pool.clone(),
            });
        }
        Ok(())
    }

    /// Sets the permanent system pin. Returns `false` when it was already
    /// present, in which case nothing is written.
    pub async fn pin_system(&self, file_id: &FileId, pool: &PoolName) -> Result<bool> {
        let records = with_timeout(self.request_timeout, || format!("pool {}", pool), {
            self.client.sticky_records(file_id, pool)
        })
        .await?;
        if records.iter().any(StickyRecord::is_system) {
            return Ok(false);
        }
        with_timeout(self.request_timeout, || format!("pool {}", pool), {
            self.client.set_sticky(file_id, pool, StickyRecord::system())
        })
        .await?;
        debug!(file = %file_id, pool = %pool, "system pin set");
        Ok(true)
    }

    /// Clears every pin still held by `operation`, e.g. after it was cancelled
    pub async fn release_operation(&self, operation: Uuid) {
        let held: Vec<PinKey> = self
            .pins
            .iter()
            .filter(|entry| entry.value().operation == operation)
            .map(|entry| entry.key().clone())
            .collect();
        for (file_id, pool) in held {
            if let Err(e) = self.unpin(&file_id, &pool, operation).await {
                warn!(file = %file_id, pool = %pool, error = %e, "failed to release pin");
            }
        }
    }

    pub fn is_pinned(&self, file_id: &FileId, pool: &PoolName) -> bool {
        self.pins
            .get(&(file_id.clone(), pool.clone()))
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.len()
    }

    /// Returns whether the reservation is new (as opposed to a refresh)
    fn reserve(&self, key: &PinKey, operation: Uuid) -> Result<bool> {
        let now = Instant::now();
        let holder = PinHolder {
            operation,
            expires_at: now + self.ttl,
        };
        match self.pins.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(holder);
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                if current.operation == operation {
                    slot.insert(holder);
                    Ok(false)
                } else if current.expires_at <= now {
                    slot.insert(holder);
                    Ok(true)
                } else {
                    Err(GalleonError::PinConflict {
                        file_id: key.0.clone(),
                        pool: key.1.clone(),
                    })
                }
            }
        }
    }

    fn release(&self, key: &PinKey, operation: Uuid) -> bool {
        self.pins
            .remove_if(key, |_, holder| holder.operation == operation)
            .is_some()
    }

    async fn remote_transient_pin(&self, file_id: &FileId, pool: &PoolName) -> Result<bool> {
        let records = with_timeout(self.request_timeout, || format!("pool {}", pool), {
            self.client.sticky_records(file_id, pool)
        })
        .await?;
        let now = Utc::now();
        Ok(records.iter().any(|r| r.is_transient() && r.is_active(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCluster, IssuedCommand};

    fn coordinator() -> (Arc<InMemoryCluster>, StickyCoordinator) {
        let cluster = Arc::new(InMemoryCluster::new());
        let sticky = StickyCoordinator::new(
            cluster.clone(),
            Duration::from_secs(7200),
            Duration::from_secs(5),
        );
        (cluster, sticky)
    }

    #[tokio::test]
    async fn test_pin_unpin_restores_records() {
        let (cluster, sticky) = coordinator();
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");
        cluster.put_sticky(&file, &pool, StickyRecord::system());
        let before = cluster.sticky_of(&file, &pool);

        let op = Uuid::new_v4();
        sticky.pin(&file, &pool, op).await.unwrap();
        assert_eq!(cluster.sticky_of(&file, &pool).len(), 2);
        assert!(sticky.unpin(&file, &pool, op).await.unwrap());

        assert_eq!(cluster.sticky_of(&file, &pool), before);
        assert!(!sticky.is_pinned(&file, &pool));
    }

    #[tokio::test]
    async fn test_foreign_pin_conflicts() {
        let (_cluster, sticky) = coordinator();
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");
        let owner = Uuid::new_v4();
        sticky.pin(&file, &pool, owner).await.unwrap();

        let other = Uuid::new_v4();
        assert!(matches!(
            sticky.pin(&file, &pool, other).await,
            Err(GalleonError::PinConflict { .. })
        ));
        assert!(sticky.assert_unpinned(&file, &pool, Some(other)).await.is_err());
        assert!(sticky.assert_unpinned(&file, &pool, Some(owner)).await.is_ok());
        assert!(!sticky.unpin(&file, &pool, other).await.unwrap());
    }

    #[tokio::test]
    async fn test_pin_found_on_pool_conflicts() {
        let (cluster, sticky) = coordinator();
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");
        cluster.put_sticky(&file, &pool, StickyRecord::transient(Duration::from_secs(60)));

        assert!(sticky.pin(&file, &pool, Uuid::new_v4()).await.is_err());
        assert!(!sticky.is_pinned(&file, &pool));
        assert!(sticky.assert_unpinned(&file, &pool, None).await.is_err());
    }

    #[tokio::test]
    async fn test_system_pin_is_idempotent() {
        let (cluster, sticky) = coordinator();
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");

        assert!(sticky.pin_system(&file, &pool).await.unwrap());
        let once = cluster.sticky_of(&file, &pool);
        assert!(!sticky.pin_system(&file, &pool).await.unwrap());
        assert_eq!(cluster.sticky_of(&file, &pool), once);

        let writes = cluster
            .commands()
            .into_iter()
            .filter(|c| matches!(c, IssuedCommand::SetSticky { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_local_pin_can_be_taken_over() {
        let cluster = Arc::new(InMemoryCluster::new());
        let sticky = StickyCoordinator::new(
            cluster.clone(),
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");
        sticky.pin(&file, &pool, Uuid::new_v4()).await.unwrap();
        // the crashed owner's remote record expires on its own; drop it here
        cluster
            .clear_sticky(&file, &pool, TRANSIENT_STICKY_OWNER)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(sticky.pin(&file, &pool, Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_operation_clears_all_its_pins() {
        let (cluster, sticky) = coordinator();
        let file = FileId::from("0000A1");
        let op = Uuid::new_v4();
        for pool in ["pool-a", "pool-b"] {
            sticky.pin(&file, &PoolName::from(pool), op).await.unwrap();
        }
        sticky.release_operation(op).await;
        assert_eq!(sticky.pinned_count(), 0);
        assert!(cluster.sticky_of(&file, &PoolName::from("pool-a")).is_empty());
    }
}
