//! In-memory cluster: pool manager, namespace and pools in one process.
//!
//! Used by the daemon for standalone runs from a cluster description file and
//! by the test-suite, which inspects the commands it received.

use async_trait::async_trait;
use chrono::Utc;
use galleon_common::error::{GalleonError, Result};
use galleon_common::{
    Alarm, CopyCommand, EventEnvelope, FileAttributes, FileId, PoolGroupInfo, PoolInfo, PoolMode,
    PoolName, RemoveCommand, ReplicaConstraints, ReplicaCountFilter, ResilienceEvent,
    StickyRecord, StorageUnitConstraint,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{AlarmSink, Namespace, PoolClient, PoolManager};

/// A command as received by the in-memory pools
#[derive(Debug, Clone, PartialEq)]
pub enum IssuedCommand {
    Copy(CopyCommand),
    Remove(RemoveCommand),
    SetSticky {
        file_id: FileId,
        pool: PoolName,
        record: StickyRecord,
    },
    ClearSticky {
        file_id: FileId,
        pool: PoolName,
        owner: String,
    },
}

#[derive(Default)]
struct ClusterState {
    groups: BTreeMap<String, PoolGroupInfo>,
    pools: BTreeMap<PoolName, PoolInfo>,
    files: BTreeMap<FileId, FileAttributes>,
    sticky: HashMap<(FileId, PoolName), Vec<StickyRecord>>,
}

/// Pool manager, namespace, pools and alarm sink over shared in-process state
#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    commands: Mutex<Vec<IssuedCommand>>,
    alarms: Mutex<Vec<Alarm>>,
    failing_sources: Mutex<HashMap<PoolName, GalleonError>>,
    /// Remaining removal failures per pool
    failing_removals: Mutex<HashMap<PoolName, u32>>,
    /// Number of upcoming metadata calls that fail as unavailable
    upstream_outage: AtomicU32,
    upstream_calls: AtomicU64,
    copy_delay_ms: AtomicU64,
    echo: Mutex<Option<mpsc::UnboundedSender<EventEnvelope>>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group. A pool may belong to at most one resilient group.
    pub fn add_group(&self, group: PoolGroupInfo) -> Result<()> {
        group.validate()?;
        let mut state = self.state.write();
        if group.is_resilient() {
            for other in state.groups.values().filter(|g| g.is_resilient() && g.name != group.name) {
                if let Some(pool) = group.pools.iter().find(|p| other.contains(p)) {
                    return Err(GalleonError::ConstraintViolation(format!(
                        "pool {} already belongs to resilient group {}",
                        pool, other.name
                    )));
                }
            }
        }
        for pool in &group.pools {
            state
                .pools
                .entry(pool.clone())
                .or_insert_with(|| PoolInfo::new(pool.clone()));
        }
        state.groups.insert(group.name.clone(), group);
        Ok(())
    }

    pub fn remove_group(&self, name: &str) {
        self.state.write().groups.remove(name);
    }

    pub fn add_pool(&self, info: PoolInfo) {
        self.state.write().pools.insert(info.name.clone(), info);
    }

    pub fn add_pool_to_group(&self, pool: &PoolName, group: &str) -> Result<()> {
        let mut state = self.state.write();
        let group = state
            .groups
            .get_mut(group)
            .ok_or_else(|| GalleonError::NotFound(format!("pool group {}", group)))?;
        group.pools.insert(pool.clone());
        state
            .pools
            .entry(pool.clone())
            .or_insert_with(|| PoolInfo::new(pool.clone()));
        Ok(())
    }

    pub fn remove_pool_from_group(&self, pool: &PoolName, group: &str) {
        if let Some(group) = self.state.write().groups.get_mut(group) {
            group.pools.remove(pool);
        }
    }

    pub fn set_storage_unit(&self, group: &str, unit: StorageUnitConstraint) -> Result<()> {
        let mut state = self.state.write();
        let group = state
            .groups
            .get_mut(group)
            .ok_or_else(|| GalleonError::NotFound(format!("pool group {}", group)))?;
        unit.apply(&group.constraints)?;
        group.storage_units.insert(unit.unit.clone(), unit);
        Ok(())
    }

    pub fn set_pool_mode(&self, pool: &PoolName, mode: PoolMode) {
        if let Some(info) = self.state.write().pools.get_mut(pool) {
            info.mode = mode;
        }
    }

    pub fn add_file(&self, attributes: FileAttributes) {
        self.state
            .write()
            .files
            .insert(attributes.file_id.clone(), attributes);
    }

    pub fn pool_count(&self) -> usize {
        self.state.read().pools.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.read().groups.len()
    }

    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    pub fn locations(&self, file_id: &FileId) -> Vec<PoolName> {
        self.state
            .read()
            .files
            .get(file_id)
            .map(|f| f.locations.clone())
            .unwrap_or_default()
    }

    pub fn sticky_of(&self, file_id: &FileId, pool: &PoolName) -> Vec<StickyRecord> {
        self.state
            .read()
            .sticky
            .get(&(file_id.clone(), pool.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Places a sticky record directly, as the storage engine or an admin would
    pub fn put_sticky(&self, file_id: &FileId, pool: &PoolName, record: StickyRecord) {
        let mut state = self.state.write();
        let records = state
            .sticky
            .entry((file_id.clone(), pool.clone()))
            .or_default();
        records.retain(|r| r.owner != record.owner);
        records.push(record);
    }

    /// Copies whose source is `pool` fail from now on
    pub fn fail_copies_from(&self, pool: &PoolName) {
        self.fail_copies_from_with(pool, GalleonError::pool_error(pool, "transfer failed"));
    }

    /// Copies whose source is `pool` fail with `error` from now on
    pub fn fail_copies_from_with(&self, pool: &PoolName, error: GalleonError) {
        self.failing_sources.lock().insert(pool.clone(), error);
    }

    /// The next `times` removals on `pool` fail
    pub fn fail_removals_on(&self, pool: &PoolName, times: u32) {
        self.failing_removals.lock().insert(pool.clone(), times);
    }

    /// The next `calls` metadata lookups fail as unavailable
    pub fn fail_upstream(&self, calls: u32) {
        self.upstream_outage.store(calls, Ordering::SeqCst);
    }

    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::SeqCst)
    }

    pub fn set_copy_delay(&self, delay: Duration) {
        self.copy_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Location changes caused by commands are sent back on the returned
    /// channel, tagged with the command's correlation id.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.echo.lock() = Some(tx);
        rx
    }

    pub fn commands(&self) -> Vec<IssuedCommand> {
        self.commands.lock().clone()
    }

    pub fn copies(&self) -> Vec<CopyCommand> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                IssuedCommand::Copy(copy) => Some(copy.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removals(&self) -> Vec<RemoveCommand> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                IssuedCommand::Remove(remove) => Some(remove.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().clone()
    }

    fn record(&self, command: IssuedCommand) {
        self.commands.lock().push(command);
    }

    fn upstream_call(&self) -> Result<()> {
        self.upstream_calls.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .upstream_outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match outage {
            Ok(_) => Err(GalleonError::UpstreamUnavailable(
                "metadata service unavailable".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    fn echo(&self, envelope: EventEnvelope) {
        if let Some(tx) = self.echo.lock().as_ref() {
            let _ = tx.send(envelope);
        }
    }

    fn pool_mode(state: &ClusterState, pool: &PoolName) -> Result<PoolMode> {
        state
            .pools
            .get(pool)
            .map(|p| p.mode)
            .ok_or_else(|| GalleonError::pool_error(pool, "unknown pool"))
    }

    /// Builds a cluster from a description file
    pub fn from_spec(spec: ClusterSpec) -> Result<Self> {
        let cluster = Self::new();
        for pool in spec.pools {
            cluster.add_pool(pool);
        }
        for group in spec.groups {
            let constraints = ReplicaConstraints::new(group.min_replicas, group.max_replicas)?
                .with_tags(group.only_one_copy_per);
            let mut info = PoolGroupInfo::new(group.name, constraints, group.pools)?;
            for unit in group.storage_units {
                info = info.with_storage_unit(unit)?;
            }
            cluster.add_group(info)?;
        }
        for file in spec.files {
            cluster.add_file(file);
        }
        Ok(cluster)
    }
}

#[async_trait]
impl PoolManager for InMemoryCluster {
    async fn resilient_group_of(&self, pool: &PoolName) -> Result<Option<PoolGroupInfo>> {
        self.upstream_call()?;
        let state = self.state.read();
        Ok(state
            .groups
            .values()
            .find(|g| g.is_resilient() && g.contains(pool))
            .cloned())
    }

    async fn resilient_groups(&self) -> Result<Vec<PoolGroupInfo>> {
        self.upstream_call()?;
        let state = self.state.read();
        Ok(state
            .groups
            .values()
            .filter(|g| g.is_resilient())
            .cloned()
            .collect())
    }

    async fn pool_infos(&self, pools: &[PoolName]) -> Result<Vec<PoolInfo>> {
        let state = self.state.read();
        Ok(pools
            .iter()
            .filter_map(|p| state.pools.get(p).cloned())
            .collect())
    }
}

#[async_trait]
impl Namespace for InMemoryCluster {
    async fn file_attributes(&self, file_id: &FileId) -> Result<FileAttributes> {
        self.upstream_call()?;
        self.state
            .read()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| GalleonError::NotFound(format!("file {}", file_id)))
    }

    async fn files_on_pool(
        &self,
        pool: &PoolName,
        filter: Option<ReplicaCountFilter>,
    ) -> Result<Vec<FileId>> {
        self.upstream_call()?;
        let state = self.state.read();
        Ok(state
            .files
            .values()
            .filter(|f| f.locations.contains(pool))
            .filter(|f| filter.map_or(true, |flt| flt.matches(f.locations.len())))
            .map(|f| f.file_id.clone())
            .collect())
    }
}

#[async_trait]
impl PoolClient for InMemoryCluster {
    async fn copy(&self, command: CopyCommand) -> Result<()> {
        self.record(IssuedCommand::Copy(command.clone()));

        let delay = self.copy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(error) = self.failing_sources.lock().get(&command.source) {
            return Err(error.clone());
        }

        {
            let mut state = self.state.write();
            if !Self::pool_mode(&state, &command.source)?.is_readable() {
                return Err(GalleonError::pool_error(&command.source, "pool is not readable"));
            }
            if !Self::pool_mode(&state, &command.target)?.is_writable() {
                return Err(GalleonError::pool_error(&command.target, "pool is not writable"));
            }
            let file = state.files.get_mut(&command.file_id).ok_or_else(|| {
                GalleonError::pool_error(&command.source, format!("no replica of {}", command.file_id))
            })?;
            if !file.locations.contains(&command.source) {
                return Err(GalleonError::pool_error(
                    &command.source,
                    format!("no replica of {}", command.file_id),
                ));
            }
            if !file.locations.contains(&command.target) {
                file.locations.push(command.target.clone());
            }
            let records = state
                .sticky
                .entry((command.file_id.clone(), command.target.clone()))
                .or_default();
            records.retain(|r| r.owner != command.target_sticky_owner);
            records.push(StickyRecord {
                owner: command.target_sticky_owner.clone(),
                expires_at: None,
            });
        }

        debug!(file = %command.file_id, source = %command.source, target = %command.target, "copied");
        self.echo(EventEnvelope::correlated(
            ResilienceEvent::LocationAdded {
                file_id: command.file_id.clone(),
                pool: command.target.clone(),
            },
            command.correlation_id,
        ));
        Ok(())
    }

    async fn remove(&self, command: RemoveCommand) -> Result<()> {
        self.record(IssuedCommand::Remove(command.clone()));
        if let Some(left) = self.failing_removals.lock().get_mut(&command.pool) {
            if *left > 0 {
                *left -= 1;
                return Err(GalleonError::pool_error(&command.pool, "removal failed"));
            }
        }
        let now = Utc::now();
        {
            let mut state = self.state.write();
            let key = (command.file_id.clone(), command.pool.clone());
            let pinned = state
                .sticky
                .get(&key)
                .is_some_and(|records| records.iter().any(|r| r.is_transient() && r.is_active(now)));
            if pinned && !command.forced {
                return Err(GalleonError::PinConflict {
                    file_id: command.file_id.clone(),
                    pool: command.pool.clone(),
                });
            }
            if let Some(file) = state.files.get_mut(&command.file_id) {
                file.locations.retain(|p| p != &command.pool);
            }
            state.sticky.remove(&key);
        }

        debug!(file = %command.file_id, pool = %command.pool, "removed");
        self.echo(EventEnvelope::correlated(
            ResilienceEvent::LocationCleared {
                file_id: command.file_id.clone(),
                pool: command.pool.clone(),
            },
            command.correlation_id,
        ));
        Ok(())
    }

    async fn set_sticky(
        &self,
        file_id: &FileId,
        pool: &PoolName,
        record: StickyRecord,
    ) -> Result<()> {
        self.record(IssuedCommand::SetSticky {
            file_id: file_id.clone(),
            pool: pool.clone(),
            record: record.clone(),
        });
        self.put_sticky(file_id, pool, record);
        Ok(())
    }

    async fn clear_sticky(&self, file_id: &FileId, pool: &PoolName, owner: &str) -> Result<()> {
        self.record(IssuedCommand::ClearSticky {
            file_id: file_id.clone(),
            pool: pool.clone(),
            owner: owner.to_string(),
        });
        let mut state = self.state.write();
        let key = (file_id.clone(), pool.clone());
        if let Some(records) = state.sticky.get_mut(&key) {
            records.retain(|r| r.owner != owner);
            if records.is_empty() {
                state.sticky.remove(&key);
            }
        }
        Ok(())
    }

    async fn sticky_records(&self, file_id: &FileId, pool: &PoolName) -> Result<Vec<StickyRecord>> {
        Ok(self.sticky_of(file_id, pool))
    }
}

impl AlarmSink for InMemoryCluster {
    fn raise(&self, alarm: Alarm) {
        self.alarms.lock().push(alarm);
    }
}

/// Pool group entry of a cluster description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default)]
    pub only_one_copy_per: Vec<String>,
    pub pools: Vec<PoolName>,
    #[serde(default)]
    pub storage_units: Vec<StorageUnitConstraint>,
}

/// TOML description of an in-memory cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub files: Vec<FileAttributes>,
}

impl ClusterSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleon_common::AccessLatency;
    use uuid::Uuid;

    fn cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        cluster
            .add_group(
                PoolGroupInfo::new(
                    "resilient",
                    ReplicaConstraints::new(2, 3).unwrap(),
                    ["pool-a", "pool-b"].into_iter().map(PoolName::from),
                )
                .unwrap(),
            )
            .unwrap();
        cluster.add_file(FileAttributes {
            file_id: FileId::from("0000A1"),
            access_latency: AccessLatency::Online,
            storage_class: "raw".into(),
            hsm: Some("osm".into()),
            locations: vec![PoolName::from("pool-a")],
            size: 1024,
        });
        cluster
    }

    #[test]
    fn test_pool_in_two_resilient_groups_rejected() {
        let cluster = cluster();
        let overlapping = PoolGroupInfo::new(
            "other",
            ReplicaConstraints::new(2, 2).unwrap(),
            [PoolName::from("pool-b")],
        )
        .unwrap();
        assert!(matches!(
            cluster.add_group(overlapping),
            Err(GalleonError::ConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_adds_location_and_system_pin() {
        let cluster = cluster();
        let file = FileId::from("0000A1");
        cluster
            .copy(CopyCommand {
                correlation_id: Uuid::new_v4(),
                file_id: file.clone(),
                source: "pool-a".into(),
                target: "pool-b".into(),
                target_sticky_owner: "system".into(),
            })
            .await
            .unwrap();
        assert_eq!(cluster.locations(&file).len(), 2);
        assert!(cluster
            .sticky_of(&file, &PoolName::from("pool-b"))
            .iter()
            .any(|r| r.is_system()));
    }

    #[tokio::test]
    async fn test_unforced_remove_refused_while_pinned() {
        let cluster = cluster();
        let file = FileId::from("0000A1");
        let pool = PoolName::from("pool-a");
        cluster.put_sticky(&file, &pool, StickyRecord::transient(Duration::from_secs(60)));

        let mut command = RemoveCommand {
            correlation_id: Uuid::new_v4(),
            file_id: file.clone(),
            pool: pool.clone(),
            forced: false,
        };
        assert!(matches!(
            cluster.remove(command.clone()).await,
            Err(GalleonError::PinConflict { .. })
        ));

        command.forced = true;
        cluster.remove(command).await.unwrap();
        assert!(cluster.locations(&file).is_empty());
    }

    #[tokio::test]
    async fn test_upstream_outage_is_bounded() {
        let cluster = cluster();
        cluster.fail_upstream(2);
        let file = FileId::from("0000A1");
        assert!(cluster.file_attributes(&file).await.is_err());
        assert!(cluster.file_attributes(&file).await.is_err());
        assert!(cluster.file_attributes(&file).await.is_ok());
    }

    #[test]
    fn test_cluster_spec_from_toml() {
        let spec: ClusterSpec = toml::from_str(
            r#"
            [[pools]]
            name = "pool-a"
            tags = { hostname = "host-1" }

            [[groups]]
            name = "resilient"
            min_replicas = 2
            max_replicas = 3
            only_one_copy_per = ["hostname"]
            pools = ["pool-a", "pool-b"]

            [[groups.storage_units]]
            unit = "raw@osm"
            min_replicas = 3

            [[files]]
            file_id = "0000A1"
            access_latency = "online"
            storage_class = "raw"
            hsm = "osm"
            locations = ["pool-a"]
            "#,
        )
        .unwrap();
        let cluster = InMemoryCluster::from_spec(spec).unwrap();
        assert_eq!(cluster.locations(&FileId::from("0000A1")).len(), 1);
    }
}
