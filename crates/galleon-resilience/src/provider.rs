//! Contracts of the external collaborators the engine drives.
//!
//! Transport, the namespace database and the per-pool storage engine live
//! behind these traits; the engine only sees their control-plane surface.

use async_trait::async_trait;
use galleon_common::{
    error::Result, Alarm, CopyCommand, FileAttributes, FileId, PoolGroupInfo, PoolInfo, PoolName,
    RemoveCommand, ReplicaCountFilter, StickyRecord,
};

/// Pool and pool group topology
#[async_trait]
pub trait PoolManager: Send + Sync {
    /// The resilient group (`min_replicas > 1`) the pool belongs to, if any.
    /// A pool belongs to at most one resilient group.
    async fn resilient_group_of(&self, pool: &PoolName) -> Result<Option<PoolGroupInfo>>;

    /// All groups with `min_replicas > 1`
    async fn resilient_groups(&self) -> Result<Vec<PoolGroupInfo>>;

    /// Current mode, tags and cost of the given pools. Unknown pools are omitted.
    async fn pool_infos(&self, pools: &[PoolName]) -> Result<Vec<PoolInfo>>;
}

/// Namespace (file metadata) queries
#[async_trait]
pub trait Namespace: Send + Sync {
    async fn file_attributes(&self, file_id: &FileId) -> Result<FileAttributes>;

    /// Files with a location on `pool`, optionally restricted by total replica count
    async fn files_on_pool(
        &self,
        pool: &PoolName,
        filter: Option<ReplicaCountFilter>,
    ) -> Result<Vec<FileId>>;
}

/// Commands sent to pools
#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn copy(&self, command: CopyCommand) -> Result<()>;

    async fn remove(&self, command: RemoveCommand) -> Result<()>;

    async fn set_sticky(&self, file_id: &FileId, pool: &PoolName, record: StickyRecord)
        -> Result<()>;

    async fn clear_sticky(&self, file_id: &FileId, pool: &PoolName, owner: &str) -> Result<()>;

    async fn sticky_records(&self, file_id: &FileId, pool: &PoolName) -> Result<Vec<StickyRecord>>;
}

/// Operator-visible alarm delivery
pub trait AlarmSink: Send + Sync {
    fn raise(&self, alarm: Alarm);
}

/// Alarm sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlarmSink;

impl AlarmSink for LoggingAlarmSink {
    fn raise(&self, alarm: Alarm) {
        tracing::error!(
            kind = ?alarm.kind,
            file = ?alarm.file_id,
            pool = ?alarm.pool,
            "ALARM: {}",
            alarm.message
        );
    }
}
