//! Activity registry: what the engine is doing right now, and running totals.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use galleon_common::utils::TimeUtils;
use galleon_common::{FileId, MessageKind, PoolName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::operations::{OperationKind, OperationState};

/// Snapshot taken when an operation starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub pool: Option<PoolName>,
    pub file_id: Option<FileId>,
    pub started_at: DateTime<Utc>,
    /// Registration order, breaks ties between equal start times
    pub sequence: u64,
}

impl fmt::Display for ActivityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let age = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        write!(
            f,
            "{} {:>8} {:<12} {} pool={} file={}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            TimeUtils::format_duration(age),
            self.kind.to_string(),
            self.id,
            self.pool.as_ref().map_or("-", PoolName::as_str),
            self.file_id.as_ref().map_or("-", FileId::as_str),
        )
    }
}

/// Selects the operations to cancel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelSelector {
    Pool(PoolName),
    File(FileId),
    Operation(Uuid),
}

impl CancelSelector {
    fn matches(&self, record: &ActivityRecord) -> bool {
        match self {
            CancelSelector::Pool(pool) => record.pool.as_ref() == Some(pool),
            CancelSelector::File(file) => record.file_id.as_ref() == Some(file),
            CancelSelector::Operation(id) => record.id == *id,
        }
    }
}

/// Listing filter; empty lists match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFilter {
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pools: Vec<PoolName>,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    #[serde(default)]
    pub kinds: Vec<OperationKind>,
}

impl ActivityFilter {
    pub fn matches(&self, record: &ActivityRecord) -> bool {
        if self.before.is_some_and(|before| record.started_at >= before) {
            return false;
        }
        if self.after.is_some_and(|after| record.started_at <= after) {
            return false;
        }
        if !self.pools.is_empty()
            && !record.pool.as_ref().is_some_and(|p| self.pools.contains(p))
        {
            return false;
        }
        if !self.file_ids.is_empty()
            && !record.file_id.as_ref().is_some_and(|f| self.file_ids.contains(f))
        {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&record.kind)
    }
}

/// Result of a listing: total matches plus the newest `limit` of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub matched: usize,
    pub records: Vec<ActivityRecord>,
}

impl fmt::Display for ActivityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        write!(f, "{} matching operations ({} shown)", self.matched, self.records.len())
    }
}

#[derive(Default)]
struct OperationCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Default)]
struct MessageCounters {
    received: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounterSnapshot {
    pub kind: MessageKind,
    pub received: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounterSnapshot {
    pub kind: OperationKind,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Aggregate counters, printable as a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub messages: Vec<MessageCounterSnapshot>,
    pub operations: Vec<OperationCounterSnapshot>,
    pub in_flight: usize,
}

impl CounterSnapshot {
    pub fn message(&self, kind: MessageKind) -> Option<&MessageCounterSnapshot> {
        self.messages.iter().find(|m| m.kind == kind)
    }

    pub fn operation(&self, kind: OperationKind) -> Option<&OperationCounterSnapshot> {
        self.operations.iter().find(|o| o.kind == kind)
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<18} {:>10} {:>10}", "MESSAGE", "RECEIVED", "DROPPED")?;
        for m in &self.messages {
            writeln!(f, "{:<18} {:>10} {:>10}", m.kind.to_string(), m.received, m.dropped)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:<18} {:>10} {:>10} {:>10} {:>10}",
            "OPERATION", "STARTED", "COMPLETED", "FAILED", "CANCELLED"
        )?;
        for o in &self.operations {
            writeln!(
                f,
                "{:<18} {:>10} {:>10} {:>10} {:>10}",
                o.kind.to_string(),
                o.started,
                o.completed,
                o.failed,
                o.cancelled
            )?;
        }
        write!(f, "in flight: {}", self.in_flight)
    }
}

struct ActivityEntry {
    record: ActivityRecord,
    abort: Option<AbortHandle>,
    /// Aborted, waiting for its completion handler to unregister it
    cancelled: bool,
}

pub struct ActivityRegistry {
    entries: DashMap<Uuid, ActivityEntry>,
    sequence: AtomicU64,
    messages: [MessageCounters; 5],
    operations: [OperationCounters; 4],
    idle: Notify,
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            messages: Default::default(),
            operations: Default::default(),
            idle: Notify::new(),
        }
    }

    pub fn register(
        &self,
        kind: OperationKind,
        pool: Option<PoolName>,
        file_id: Option<FileId>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let record = ActivityRecord {
            id,
            kind,
            pool,
            file_id,
            started_at: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.entries.insert(
            id,
            ActivityEntry {
                record,
                abort: None,
                cancelled: false,
            },
        );
        self.operations[kind.index()]
            .started
            .fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Associates the running task so `cancel` can abort it. If the record
    /// was cancelled before the task existed, the task is aborted right away.
    pub fn attach_abort(&self, id: Uuid, abort: AbortHandle) {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.cancelled => abort.abort(),
            Some(mut entry) => entry.abort = Some(abort),
            None => abort.abort(),
        }
    }

    /// Removes the record and counts the terminal state
    pub fn unregister(&self, id: Uuid, kind: OperationKind, state: OperationState) -> Option<ActivityRecord> {
        let counters = &self.operations[kind.index()];
        match state {
            OperationState::Done => counters.completed.fetch_add(1, Ordering::Relaxed),
            OperationState::Failed => counters.failed.fetch_add(1, Ordering::Relaxed),
            OperationState::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
            OperationState::Queued | OperationState::Running => 0,
        };
        let removed = self.entries.remove(&id).map(|(_, entry)| entry.record);
        self.notify_if_idle();
        removed
    }

    /// Aborts every in-flight operation the selector matches. The records
    /// stay in flight until their completion handlers have run the
    /// cancelled path and unregistered them.
    pub fn cancel(&self, selector: &CancelSelector) -> usize {
        let mut cancelled = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.cancelled || !selector.matches(&entry.record) {
                continue;
            }
            entry.cancelled = true;
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
            debug!(operation = %entry.record.id, kind = %entry.record.kind, "cancelled");
            cancelled += 1;
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .map(|id| self.cancel(&CancelSelector::Operation(id)))
            .sum()
    }

    /// Newest first, at most `limit` records; never fails on an empty result
    pub fn list(&self, filter: &ActivityFilter, limit: usize) -> ActivityReport {
        let mut records: Vec<ActivityRecord> = self
            .entries
            .iter()
            .filter(|entry| !entry.cancelled && filter.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        let matched = records.len();
        records.truncate(limit);
        ActivityReport { matched, records }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    pub fn message_received(&self, kind: MessageKind) {
        self.messages[kind.index()]
            .received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self, kind: MessageKind) {
        self.messages[kind.index()]
            .dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages: MessageKind::ALL
                .iter()
                .map(|&kind| {
                    let c = &self.messages[kind.index()];
                    MessageCounterSnapshot {
                        kind,
                        received: c.received.load(Ordering::Relaxed),
                        dropped: c.dropped.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            operations: OperationKind::ALL
                .iter()
                .map(|&kind| {
                    let c = &self.operations[kind.index()];
                    OperationCounterSnapshot {
                        kind,
                        started: c.started.load(Ordering::Relaxed),
                        completed: c.completed.load(Ordering::Relaxed),
                        failed: c.failed.load(Ordering::Relaxed),
                        cancelled: c.cancelled.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            in_flight: self.in_flight(),
        }
    }

    /// Resolves once no operation is in flight, or fails after `limit`
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            loop {
                let notified = self.idle.notified();
                if self.entries.is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn notify_if_idle(&self) {
        if self.entries.is_empty() {
            self.idle.notify_waiters();
        }
    }
}
