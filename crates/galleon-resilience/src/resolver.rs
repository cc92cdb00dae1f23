//! Builds the per-file replica picture that replication and reduction decide on.

use dashmap::DashSet;
use galleon_common::error::Result;
use galleon_common::{FileId, FileReplicaInfo, PoolGroupInfo, PoolInfo, PoolName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use crate::cache::{FileAttributeCache, PoolGroupCache};
use crate::executors::RetryPolicy;
use crate::provider::PoolManager;

/// Replicas reported corrupt, excluded from counts and source selection
#[derive(Default)]
pub struct CorruptReplicas {
    replicas: DashSet<(FileId, PoolName)>,
}

impl CorruptReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the replica was newly marked
    pub fn mark(&self, file_id: &FileId, pool: &PoolName) -> bool {
        self.replicas.insert((file_id.clone(), pool.clone()))
    }

    pub fn contains(&self, file_id: &FileId, pool: &PoolName) -> bool {
        self.replicas.contains(&(file_id.clone(), pool.clone()))
    }

    /// Forgets the replica once it has been removed
    pub fn clear(&self, file_id: &FileId, pool: &PoolName) {
        self.replicas.remove(&(file_id.clone(), pool.clone()));
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// A file's replica picture plus the member pools it was computed from
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub info: FileReplicaInfo,
    pub group: PoolGroupInfo,
    pub pools: BTreeMap<PoolName, PoolInfo>,
    pub size: u64,
}

pub struct ReplicaResolver {
    pool_groups: Arc<PoolGroupCache>,
    files: Arc<FileAttributeCache>,
    pool_manager: Arc<dyn PoolManager>,
    corrupt: Arc<CorruptReplicas>,
    retry: RetryPolicy,
}

impl ReplicaResolver {
    pub fn new(
        pool_groups: Arc<PoolGroupCache>,
        files: Arc<FileAttributeCache>,
        pool_manager: Arc<dyn PoolManager>,
        corrupt: Arc<CorruptReplicas>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool_groups,
            files,
            pool_manager,
            corrupt,
            retry,
        }
    }

    /// Resolves the file against the resilient group of `hint` or, failing
    /// that, of the first location that has one. `None` means no location
    /// of the file is in a resilient group.
    pub async fn resolve(&self, file_id: &FileId, hint: Option<&PoolName>) -> Result<Option<ResolvedFile>> {
        let attributes = self.files.get(file_id).await?;

        let mut group = None;
        for pool in hint.into_iter().chain(attributes.locations.iter()) {
            if let Some(found) = self.pool_groups.get(pool).await? {
                group = Some(found);
                break;
            }
        }
        let Some(group) = group else {
            trace!(file = %file_id, "no location in a resilient group");
            return Ok(None);
        };

        let unit = attributes.storage_unit();
        let constraints = group.constraints_for(Some(&unit))?;
        let members: Vec<PoolName> = group.pools.iter().cloned().collect();
        let pools: BTreeMap<PoolName, PoolInfo> = self
            .retry
            .run("pool info lookup", || self.pool_manager.pool_infos(&members))
            .await?
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        let mut locations = Vec::new();
        let mut inaccessible = Vec::new();
        let mut corrupt = Vec::new();
        for pool in attributes.locations.iter().filter(|p| group.contains(p)) {
            if self.corrupt.contains(file_id, pool) {
                corrupt.push(pool.clone());
            } else if pools.get(pool).is_some_and(|info| info.mode.is_readable()) {
                locations.push(pool.clone());
            } else {
                inaccessible.push(pool.clone());
            }
        }
        let free_members = members
            .iter()
            .filter(|p| !attributes.locations.contains(p))
            .cloned()
            .collect();

        Ok(Some(ResolvedFile {
            info: FileReplicaInfo {
                file_id: file_id.clone(),
                group: group.name.clone(),
                access_latency: attributes.access_latency,
                constraints,
                locations,
                inaccessible,
                corrupt,
                free_members,
            },
            group,
            pools,
            size: attributes.size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCluster;
    use galleon_common::{
        AccessLatency, FileAttributes, PoolMode, ReplicaConstraints, StorageUnitConstraint,
    };
    use std::time::Duration;

    fn resolver(cluster: &Arc<InMemoryCluster>, corrupt: Arc<CorruptReplicas>) -> ReplicaResolver {
        let retry = RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        };
        ReplicaResolver::new(
            Arc::new(PoolGroupCache::new(cluster.clone(), Duration::from_secs(60), retry)),
            Arc::new(FileAttributeCache::new(cluster.clone(), Duration::from_secs(30), retry)),
            cluster.clone(),
            corrupt,
            retry,
        )
    }

    fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut unit = StorageUnitConstraint::new("raw@osm");
        unit.min_replicas = Some(3);
        cluster
            .add_group(
                PoolGroupInfo::new(
                    "resilient",
                    ReplicaConstraints::new(2, 3).unwrap(),
                    ["pool-a", "pool-b", "pool-c", "pool-d"].into_iter().map(PoolName::from),
                )
                .unwrap()
                .with_storage_unit(unit)
                .unwrap(),
            )
            .unwrap();
        cluster.add_pool(PoolInfo::new("outside"));
        cluster.add_file(FileAttributes {
            file_id: FileId::from("0000A1"),
            access_latency: AccessLatency::Online,
            storage_class: "raw".into(),
            hsm: Some("osm".into()),
            locations: ["outside", "pool-a", "pool-b", "pool-c"]
                .into_iter()
                .map(PoolName::from)
                .collect(),
            size: 4096,
        });
        cluster
    }

    #[tokio::test]
    async fn test_locations_are_classified() {
        let cluster = cluster();
        cluster.set_pool_mode(&PoolName::from("pool-b"), PoolMode::DISABLED);
        let corrupt = Arc::new(CorruptReplicas::new());
        corrupt.mark(&FileId::from("0000A1"), &PoolName::from("pool-c"));

        let resolved = resolver(&cluster, corrupt)
            .resolve(&FileId::from("0000A1"), None)
            .await
            .unwrap()
            .unwrap();
        let info = resolved.info;
        assert_eq!(info.locations, vec![PoolName::from("pool-a")]);
        assert_eq!(info.inaccessible, vec![PoolName::from("pool-b")]);
        assert_eq!(info.corrupt, vec![PoolName::from("pool-c")]);
        assert_eq!(info.free_members, vec![PoolName::from("pool-d")]);
        // storage unit override applies
        assert_eq!(info.constraints.min_replicas, 3);
        assert_eq!(info.copies_needed(), 2);
    }

    #[tokio::test]
    async fn test_file_outside_resilient_groups_is_unmanaged() {
        let cluster = cluster();
        cluster.add_file(FileAttributes {
            file_id: FileId::from("0000B2"),
            access_latency: AccessLatency::Online,
            storage_class: "raw".into(),
            hsm: None,
            locations: vec![PoolName::from("outside")],
            size: 1,
        });
        let resolved = resolver(&cluster, Arc::new(CorruptReplicas::new()))
            .resolve(&FileId::from("0000B2"), None)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }
}
