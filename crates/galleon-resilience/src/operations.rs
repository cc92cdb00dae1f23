//! Operation maps and task outcomes.
//!
//! An operation map owns the in-flight operations of one kind, keyed by
//! file id or pool name. A second request for a key that is already in
//! flight is coalesced into the existing operation instead of duplicating it.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use galleon_common::error::{GalleonError, Result};
use galleon_common::PoolName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::task::JoinError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Done | OperationState::Failed | OperationState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Replication,
    Reduction,
    PoolScan,
    FileCheck,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Replication,
        OperationKind::Reduction,
        OperationKind::PoolScan,
        OperationKind::FileCheck,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Replication => "REPLICATION",
            OperationKind::Reduction => "REDUCTION",
            OperationKind::PoolScan => "POOL_SCAN",
            OperationKind::FileCheck => "FILE_CHECK",
        };
        f.write_str(name)
    }
}

/// One in-flight operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation<K> {
    pub id: Uuid,
    pub key: K,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Attempts after the first
    pub retries: u32,
    /// Requests coalesced into this operation since it was admitted
    pub interest: u32,
    /// Source pools already attempted, in order
    pub tried_sources: Vec<PoolName>,
    pub pool: Option<PoolName>,
    pub created_at: DateTime<Utc>,
}

/// Result of submitting a key to an operation map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new operation was created
    New(Uuid),
    /// The key was already in flight; the existing operation absorbed the request
    Coalesced(Uuid),
}

impl Admission {
    pub fn id(&self) -> Uuid {
        match self {
            Admission::New(id) | Admission::Coalesced(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Admission::New(_))
    }
}

pub struct OperationMap<K> {
    kind: OperationKind,
    operations: DashMap<K, Operation<K>>,
}

impl<K> OperationMap<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            operations: DashMap::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Admits `key` or coalesces into its in-flight operation. `register`
    /// runs only for a new operation and yields its id. With
    /// `raise_interest`, a coalesced request bumps the interest counter so
    /// the owner can re-run once the current pass ends.
    pub fn submit(
        &self,
        key: K,
        pool: Option<PoolName>,
        raise_interest: bool,
        register: impl FnOnce() -> Uuid,
    ) -> Admission {
        match self.operations.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let op = slot.get_mut();
                if raise_interest {
                    op.interest += 1;
                }
                Admission::Coalesced(op.id)
            }
            Entry::Vacant(slot) => {
                let id = register();
                slot.insert(Operation {
                    id,
                    key,
                    kind: self.kind,
                    state: OperationState::Queued,
                    retries: 0,
                    interest: 0,
                    tried_sources: Vec::new(),
                    pool,
                    created_at: Utc::now(),
                });
                Admission::New(id)
            }
        }
    }

    pub fn mark_running(&self, key: &K, id: Uuid) {
        if let Some(mut op) = self.operations.get_mut(key) {
            if op.id == id {
                op.state = OperationState::Running;
            }
        }
    }

    /// Notes that `source` is about to be attempted
    pub fn record_attempt(&self, key: &K, id: Uuid, source: &PoolName) {
        if let Some(mut op) = self.operations.get_mut(key) {
            if op.id == id && !op.tried_sources.contains(source) {
                op.tried_sources.push(source.clone());
            }
        }
    }

    pub fn tried_sources(&self, key: &K) -> Vec<PoolName> {
        self.operations
            .get(key)
            .map(|op| op.tried_sources.clone())
            .unwrap_or_default()
    }

    /// Puts the operation back in the queue for another attempt. Fails if
    /// the operation is gone (completed or cancelled meanwhile).
    pub fn requeue(&self, key: &K, id: Uuid) -> Result<u32> {
        match self.operations.get_mut(key) {
            Some(mut op) if op.id == id => {
                op.state = OperationState::Queued;
                op.retries += 1;
                Ok(op.retries)
            }
            _ => Err(GalleonError::Cancelled(format!("operation {} no longer tracked", id))),
        }
    }

    /// Removes the operation in its terminal state and hands it back
    pub fn complete(&self, key: &K, id: Uuid, state: OperationState) -> Option<Operation<K>> {
        debug_assert!(state.is_terminal());
        self.operations
            .remove_if(key, |_, op| op.id == id)
            .map(|(_, mut op)| {
                op.state = state;
                op
            })
    }

    pub fn get(&self, key: &K) -> Option<Operation<K>> {
        self.operations.get(key).map(|op| op.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.operations.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Operation<K>> {
        self.operations.iter().map(|op| op.clone()).collect()
    }
}

/// How a task ended
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(GalleonError),
    Cancelled(String),
}

impl<T> TaskOutcome<T> {
    /// Flattens the join result of a task spawned on a worker pool
    pub fn from_join(joined: std::result::Result<Result<Result<T>>, JoinError>) -> Self {
        match joined {
            Ok(Ok(Ok(value))) => TaskOutcome::Completed(value),
            Ok(Ok(Err(GalleonError::Cancelled(reason)))) | Ok(Err(GalleonError::Cancelled(reason))) => {
                TaskOutcome::Cancelled(reason)
            }
            Ok(Ok(Err(e))) | Ok(Err(e)) => TaskOutcome::Failed(e),
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled("task aborted".to_string()),
            Err(e) => TaskOutcome::Failed(GalleonError::InternalError(format!("task panicked: {}", e))),
        }
    }

    pub fn state(&self) -> OperationState {
        match self {
            TaskOutcome::Completed(_) => OperationState::Done,
            TaskOutcome::Failed(_) => OperationState::Failed,
            TaskOutcome::Cancelled(_) => OperationState::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleon_common::FileId;

    #[test]
    fn test_second_submit_is_coalesced() {
        let map = OperationMap::<FileId>::new(OperationKind::Replication);
        let file = FileId::from("0000A1");
        let first = map.submit(file.clone(), None, true, Uuid::new_v4);
        let second = map.submit(file.clone(), None, true, || panic!("must not register twice"));

        assert!(first.is_new());
        assert_eq!(second, Admission::Coalesced(first.id()));
        assert_eq!(map.get(&file).unwrap().interest, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_quiet_coalescing_keeps_interest() {
        let map = OperationMap::<PoolName>::new(OperationKind::PoolScan);
        let pool = PoolName::from("pool-a");
        map.submit(pool.clone(), Some(pool.clone()), false, Uuid::new_v4);
        map.submit(pool.clone(), Some(pool.clone()), false, Uuid::new_v4);
        assert_eq!(map.get(&pool).unwrap().interest, 0);
    }

    #[test]
    fn test_complete_removes_only_matching_operation() {
        let map = OperationMap::<FileId>::new(OperationKind::Reduction);
        let file = FileId::from("0000A1");
        let id = map.submit(file.clone(), None, true, Uuid::new_v4).id();

        assert!(map.complete(&file, Uuid::new_v4(), OperationState::Done).is_none());
        let done = map.complete(&file, id, OperationState::Done).unwrap();
        assert_eq!(done.state, OperationState::Done);
        assert!(map.is_empty());
    }

    #[test]
    fn test_attempts_and_requeue() {
        let map = OperationMap::<FileId>::new(OperationKind::Replication);
        let file = FileId::from("0000A1");
        let id = map.submit(file.clone(), None, true, Uuid::new_v4).id();
        map.mark_running(&file, id);
        map.record_attempt(&file, id, &PoolName::from("pool-a"));
        map.record_attempt(&file, id, &PoolName::from("pool-a"));

        assert_eq!(map.tried_sources(&file), vec![PoolName::from("pool-a")]);
        assert_eq!(map.requeue(&file, id).unwrap(), 1);
        assert_eq!(map.get(&file).unwrap().state, OperationState::Queued);
        assert!(map.requeue(&file, Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn test_outcome_of_aborted_task_is_cancelled() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok::<_, GalleonError>(Ok::<_, GalleonError>(()))
        });
        handle.abort();
        let outcome = TaskOutcome::from_join(handle.await);
        assert!(matches!(outcome, TaskOutcome::Cancelled(_)));
    }

    #[test]
    fn test_outcome_flattening() {
        let failed: TaskOutcome<()> =
            TaskOutcome::from_join(Ok(Ok(Err(GalleonError::Timeout("pool-a".into())))));
        assert_eq!(failed.state(), OperationState::Failed);

        let cancelled: TaskOutcome<()> =
            TaskOutcome::from_join(Ok(Err(GalleonError::Cancelled("shutdown".into()))));
        assert_eq!(cancelled.state(), OperationState::Cancelled);
    }
}
