//! Reduction task orchestrator: removes excess and corrupt replicas.
//!
//! Before anything is removed the replicas that stay are given the system
//! pin, and every victim is pinned for the duration of its removal so no
//! other operation of this engine can copy from it meanwhile.

use galleon_common::error::{GalleonError, Result};
use galleon_common::{Alarm, AlarmKind, FileId, FileReplicaInfo, PoolName, RemoveCommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::executors::with_timeout;
use crate::operations::{Admission, OperationKind, OperationMap, OperationState, TaskOutcome};
use crate::selection::ReductionStrategy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionRequest {
    /// Trim to the maximum replica count and drop corrupt copies once the
    /// minimum is met by valid ones
    Excess,
    /// Remove every group location outside the confirmed set
    Confirmed(BTreeSet<PoolName>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionResult {
    pub removed: Vec<PoolName>,
    /// Candidates passed over because another operation holds their pin
    pub skipped: Vec<PoolName>,
}

pub struct ReductionOrchestrator {
    ctx: Arc<EngineContext>,
    operations: OperationMap<FileId>,
    strategy: Arc<dyn ReductionStrategy>,
}

impl ReductionOrchestrator {
    pub fn new(ctx: Arc<EngineContext>, strategy: Arc<dyn ReductionStrategy>) -> Self {
        Self {
            ctx,
            operations: OperationMap::new(OperationKind::Reduction),
            strategy,
        }
    }

    pub fn operations(&self) -> &OperationMap<FileId> {
        &self.operations
    }

    pub fn submit(self: &Arc<Self>, file_id: FileId, request: ReductionRequest, pool: Option<PoolName>) -> Admission {
        let admission = self.operations.submit(file_id.clone(), pool.clone(), true, || {
            self.ctx
                .activity
                .register(OperationKind::Reduction, pool.clone(), Some(file_id.clone()))
        });
        match admission {
            Admission::New(id) => {
                debug!(file = %file_id, operation = %id, "reduction queued");
                self.launch(file_id, id, request, pool);
            }
            Admission::Coalesced(id) => {
                debug!(file = %file_id, operation = %id, "reduction already in flight");
            }
        }
        admission
    }

    /// Submits an `Excess` reduction if the picture calls for one
    pub fn reconcile(self: &Arc<Self>, info: &FileReplicaInfo, pool: Option<PoolName>) -> Option<Admission> {
        let corrupt_removable = !info.corrupt.is_empty() && info.copies_needed() == 0;
        if info.copies_excess() > 0 || corrupt_removable {
            Some(self.submit(info.file_id.clone(), ReductionRequest::Excess, pool))
        } else {
            None
        }
    }

    fn launch(self: &Arc<Self>, file_id: FileId, id: Uuid, request: ReductionRequest, pool: Option<PoolName>) {
        let task = {
            let this = self.clone();
            let file_id = file_id.clone();
            self.ctx
                .executors
                .remove
                .spawn(async move { this.reduce(&file_id, id, &request).await })
        };
        self.ctx.activity.attach_abort(id, task.abort_handle());

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = TaskOutcome::from_join(task.await);
            this.handle_completion(file_id, id, pool, outcome).await;
        });
    }

    async fn reduce(&self, file_id: &FileId, id: Uuid, request: &ReductionRequest) -> Result<ReductionResult> {
        self.operations.mark_running(file_id, id);
        let mut result = ReductionResult::default();

        let Some(resolved) = self.ctx.resolver.resolve(file_id, None).await? else {
            return Ok(result);
        };
        let info = &resolved.info;
        if !info.is_managed() {
            return Ok(result);
        }

        let mut victims = Vec::new();
        match request {
            ReductionRequest::Excess => {
                if info.copies_needed() == 0 {
                    victims.extend(info.corrupt.iter().cloned());
                }
                let excess = info.copies_excess();
                let mut chosen = 0;
                for candidate in self.strategy.rank_victims(info, &resolved.pools) {
                    if chosen >= excess {
                        break;
                    }
                    match self.ctx.sticky.assert_unpinned(file_id, &candidate, Some(id)).await {
                        Ok(()) => {
                            victims.push(candidate);
                            chosen += 1;
                        }
                        Err(GalleonError::PinConflict { .. }) => result.skipped.push(candidate),
                        Err(e) => return Err(e),
                    }
                }
            }
            ReductionRequest::Confirmed(keep) => {
                galleon_common::ensure!(
                    info.locations.iter().any(|p| keep.contains(p)),
                    InvalidInput,
                    "none of the confirmed replicas of {} is readable",
                    file_id
                );
                for candidate in info.locations.iter().chain(info.corrupt.iter()) {
                    if keep.contains(candidate) {
                        continue;
                    }
                    match self.ctx.sticky.assert_unpinned(file_id, candidate, Some(id)).await {
                        Ok(()) => victims.push(candidate.clone()),
                        Err(GalleonError::PinConflict { .. }) => result.skipped.push(candidate.clone()),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        if victims.is_empty() {
            return Ok(result);
        }

        for keeper in info.locations.iter().filter(|p| !victims.contains(p)) {
            self.ctx.sticky.pin_system(file_id, keeper).await?;
        }

        for victim in victims {
            self.remove_replica(file_id, &victim, id).await?;
            self.ctx.corrupt.clear(file_id, &victim);
            result.removed.push(victim);
        }
        Ok(result)
    }

    /// Pins, removes with bounded retries, unpins
    async fn remove_replica(&self, file_id: &FileId, pool: &PoolName, id: Uuid) -> Result<()> {
        self.ctx.sticky.pin(file_id, pool, id).await?;

        let attempts = self.ctx.config.reduction.max_retries + 1;
        let timeout = self.ctx.config.replication.request_timeout();
        let mut attempt = 1;
        let removed = loop {
            let command = RemoveCommand {
                correlation_id: self.ctx.ledger.issue(),
                file_id: file_id.clone(),
                pool: pool.clone(),
                forced: true,
            };
            let sent = with_timeout(timeout, || format!("removal on {}", pool), {
                self.ctx.pool_client().remove(command)
            })
            .await;
            match sent {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(file = %file_id, pool = %pool, attempt, error = %e, "removal failed, retrying");
                    attempt += 1;
                }
                other => break other,
            }
        };

        if let Err(e) = self.ctx.sticky.unpin(file_id, pool, id).await {
            warn!(file = %file_id, pool = %pool, error = %e, "failed to clear pin after removal");
        }
        removed
    }

    async fn handle_completion(
        self: &Arc<Self>,
        file_id: FileId,
        id: Uuid,
        pool: Option<PoolName>,
        outcome: TaskOutcome<ReductionResult>,
    ) {
        let state = outcome.state();
        let operation = self.operations.complete(&file_id, id, state);

        match outcome {
            TaskOutcome::Completed(result) => {
                if !result.removed.is_empty() {
                    self.ctx.files.invalidate(&file_id);
                    info!(file = %file_id, removed = ?result.removed, "excess replicas removed");
                }
                if !result.skipped.is_empty() {
                    debug!(file = %file_id, skipped = ?result.skipped, "protected replicas left for a later pass");
                }
            }
            TaskOutcome::Failed(GalleonError::PinConflict { pool, .. }) => {
                warn!(file = %file_id, pool = %pool, "removal refused, replica is protected by another operation");
            }
            TaskOutcome::Failed(e) => {
                error!(file = %file_id, error = %e, "reduction failed");
                let mut alarm = Alarm::new(AlarmKind::ReductionFailed, e.to_string()).for_file(&file_id);
                if let GalleonError::PoolError { pool, .. } = &e {
                    alarm = alarm.on_pool(pool);
                }
                self.ctx.alarms().raise(alarm);
                self.ctx.files.invalidate(&file_id);
            }
            TaskOutcome::Cancelled(reason) => {
                debug!(file = %file_id, operation = %id, %reason, "reduction cancelled");
                self.ctx.sticky.release_operation(id).await;
            }
        }

        let interested = operation.is_some_and(|op| op.interest > 0);
        if interested && state != OperationState::Cancelled {
            self.submit(file_id, ReductionRequest::Excess, pool);
        }
        self.ctx
            .activity
            .unregister(id, OperationKind::Reduction, state);
    }
}
