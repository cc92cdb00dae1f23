//! Inbound events and outbound commands exchanged with pools and metadata services

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{FileId, PoolMode, PoolName, StorageUnitConstraint};

/// Raw status reported by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawPoolStatus {
    Down,
    Restart,
    Up,
}

/// A pool status message with its mode bits and replication switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPoolEvent {
    pub pool: PoolName,
    pub status: RawPoolStatus,
    pub mode: PoolMode,
    pub replication_enabled: bool,
}

impl RawPoolEvent {
    pub fn new(pool: impl Into<PoolName>, status: RawPoolStatus) -> Self {
        let mode = match status {
            RawPoolStatus::Down => PoolMode::DISABLED,
            RawPoolStatus::Restart | RawPoolStatus::Up => PoolMode::ENABLED,
        };
        Self {
            pool: pool.into(),
            status,
            mode,
            replication_enabled: true,
        }
    }

    pub fn with_mode(mut self, mode: PoolMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_replication(mut self, enabled: bool) -> Self {
        self.replication_enabled = enabled;
        self
    }
}

/// Pool group / storage unit topology changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyChange {
    PoolAddedToGroup { pool: PoolName, group: String },
    PoolRemovedFromGroup { pool: PoolName, group: String },
    StorageUnitAdded { group: String, unit: StorageUnitConstraint },
    StorageUnitRemoved { group: String, unit: String },
    StorageUnitModified { group: String, unit: StorageUnitConstraint },
    PoolGroupRemoved { group: String },
}

/// Events consumed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResilienceEvent {
    LocationAdded { file_id: FileId, pool: PoolName },
    LocationCleared { file_id: FileId, pool: PoolName },
    PoolStatusChanged(RawPoolEvent),
    TopologyChanged(TopologyChange),
    CorruptFileReported { file_id: FileId, pool: PoolName },
}

impl ResilienceEvent {
    pub fn kind(&self) -> MessageKind {
        match self {
            ResilienceEvent::LocationAdded { .. } => MessageKind::LocationAdded,
            ResilienceEvent::LocationCleared { .. } => MessageKind::LocationCleared,
            ResilienceEvent::PoolStatusChanged(_) => MessageKind::PoolStatusChanged,
            ResilienceEvent::TopologyChanged(_) => MessageKind::TopologyChanged,
            ResilienceEvent::CorruptFileReported { .. } => MessageKind::CorruptFile,
        }
    }
}

/// Message kinds, used for per-kind counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    LocationAdded,
    LocationCleared,
    PoolStatusChanged,
    TopologyChanged,
    CorruptFile,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::LocationAdded,
        MessageKind::LocationCleared,
        MessageKind::PoolStatusChanged,
        MessageKind::TopologyChanged,
        MessageKind::CorruptFile,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::LocationAdded => "LOCATION_ADDED",
            MessageKind::LocationCleared => "LOCATION_CLEARED",
            MessageKind::PoolStatusChanged => "POOL_STATUS",
            MessageKind::TopologyChanged => "TOPOLOGY",
            MessageKind::CorruptFile => "CORRUPT_FILE",
        };
        f.write_str(name)
    }
}

/// An inbound event plus the correlation id of the command that caused it,
/// when the sender propagated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub correlation_id: Option<Uuid>,
    pub event: ResilienceEvent,
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: ResilienceEvent) -> Self {
        Self {
            correlation_id: None,
            event,
            received_at: Utc::now(),
        }
    }

    pub fn correlated(event: ResilienceEvent, correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            event,
            received_at: Utc::now(),
        }
    }
}

/// Copy a replica between two pools; the new replica is pinned by `target_sticky_owner`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCommand {
    pub correlation_id: Uuid,
    pub file_id: FileId,
    pub source: PoolName,
    pub target: PoolName,
    pub target_sticky_owner: String,
}

/// Remove a replica from a pool. `forced` bypasses the engine's own pins only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveCommand {
    pub correlation_id: Uuid,
    pub file_id: FileId,
    pub pool: PoolName,
    pub forced: bool,
}

/// Operator-visible alarm categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmKind {
    /// Replication exhausted every source location
    ReplicationFailed,
    /// No pool could take a required copy
    NoTargetPool,
    /// Removal of an excess replica failed after retries
    ReductionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub kind: AlarmKind,
    pub file_id: Option<FileId>,
    pub pool: Option<PoolName>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alarm {
    pub fn new(kind: AlarmKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: None,
            pool: None,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn for_file(mut self, file_id: &FileId) -> Self {
        self.file_id = Some(file_id.clone());
        self
    }

    pub fn on_pool(mut self, pool: &PoolName) -> Self {
        self.pool = Some(pool.clone());
        self
    }
}
