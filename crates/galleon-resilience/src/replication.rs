//! Replication task orchestrator.
//!
//! One task makes at most one copy. After a successful copy the file is
//! re-evaluated by a fresh task, so a file missing several copies converges
//! one replica at a time and finally hands over to reduction. A copy that
//! fails is retried from another source until every known location has
//! been tried.

use galleon_common::error::{GalleonError, Result};
use galleon_common::{Alarm, AlarmKind, CopyCommand, FileId, PoolName, SYSTEM_STICKY_OWNER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::executors::with_timeout;
use crate::operations::{Admission, OperationKind, OperationMap, OperationState, TaskOutcome};
use crate::reduction::{ReductionOrchestrator, ReductionRequest};
use crate::selection::PoolSelectionStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationResult {
    Copied {
        source: PoolName,
        target: PoolName,
    },
    /// The copy from `source` failed; another source may succeed
    CopyFailed {
        source: PoolName,
        reason: String,
    },
    /// Enough valid replicas exist; carries what is left for reduction
    Satisfied { excess: usize, corrupt: usize },
    /// Not online, or not located in any resilient group
    Unmanaged,
}

pub struct ReplicationOrchestrator {
    ctx: Arc<EngineContext>,
    operations: OperationMap<FileId>,
    selection: Arc<dyn PoolSelectionStrategy>,
    reduction: Arc<ReductionOrchestrator>,
}

impl ReplicationOrchestrator {
    pub fn new(
        ctx: Arc<EngineContext>,
        selection: Arc<dyn PoolSelectionStrategy>,
        reduction: Arc<ReductionOrchestrator>,
    ) -> Self {
        Self {
            ctx,
            operations: OperationMap::new(OperationKind::Replication),
            selection,
            reduction,
        }
    }

    pub fn operations(&self) -> &OperationMap<FileId> {
        &self.operations
    }

    /// Queues a replication check for the file. `pool` is the pool whose
    /// event or scan triggered it, used to resolve the group and to cancel.
    pub fn submit(self: &Arc<Self>, file_id: FileId, pool: Option<PoolName>) -> Admission {
        let admission = self.operations.submit(file_id.clone(), pool.clone(), true, || {
            self.ctx
                .activity
                .register(OperationKind::Replication, pool.clone(), Some(file_id.clone()))
        });
        if let Admission::New(id) = admission {
            debug!(file = %file_id, operation = %id, "replication queued");
            self.launch(file_id, id, pool);
        }
        admission
    }

    fn launch(self: &Arc<Self>, file_id: FileId, id: Uuid, pool: Option<PoolName>) {
        let task = {
            let this = self.clone();
            let file_id = file_id.clone();
            let pool = pool.clone();
            self.ctx
                .executors
                .copy
                .spawn(async move { this.replicate(&file_id, id, pool.as_ref()).await })
        };
        self.ctx.activity.attach_abort(id, task.abort_handle());

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = TaskOutcome::from_join(task.await);
            this.handle_completion(file_id, id, pool, outcome).await;
        });
    }

    async fn replicate(&self, file_id: &FileId, id: Uuid, pool: Option<&PoolName>) -> Result<ReplicationResult> {
        self.operations.mark_running(file_id, id);

        let Some(resolved) = self.ctx.resolver.resolve(file_id, pool).await? else {
            return Ok(ReplicationResult::Unmanaged);
        };
        let info = &resolved.info;
        if !info.is_managed() {
            debug!(file = %file_id, latency = ?info.access_latency, "not online, skipped");
            return Ok(ReplicationResult::Unmanaged);
        }

        if info.copies_needed() == 0 {
            for location in &info.locations {
                self.ctx.sticky.pin_system(file_id, location).await?;
            }
            return Ok(ReplicationResult::Satisfied {
                excess: info.copies_excess(),
                corrupt: info.corrupt.len(),
            });
        }

        let tried = self.operations.tried_sources(file_id);
        let source = info
            .locations
            .iter()
            .find(|p| !tried.contains(p))
            .cloned()
            .ok_or_else(|| GalleonError::NoViableSource(file_id.clone()))?;
        let target = self
            .selection
            .select_target(info, &resolved.pools, resolved.size)
            .ok_or_else(|| GalleonError::NoTargetPool(file_id.clone()))?;

        self.operations.record_attempt(file_id, id, &source);
        self.ctx.sticky.pin(file_id, &source, id).await?;

        let command = CopyCommand {
            correlation_id: self.ctx.ledger.issue(),
            file_id: file_id.clone(),
            source: source.clone(),
            target: target.clone(),
            target_sticky_owner: SYSTEM_STICKY_OWNER.to_string(),
        };
        debug!(file = %file_id, source = %source, target = %target, "copying");
        let copied = with_timeout(
            self.ctx.config.replication.request_timeout(),
            || format!("copy {} -> {}", source, target),
            self.ctx.pool_client().copy(command),
        )
        .await;

        if let Err(e) = self.ctx.sticky.unpin(file_id, &source, id).await {
            warn!(file = %file_id, pool = %source, error = %e, "failed to clear pin after copy");
        }

        // Any other failure counts against the source; the next attempt
        // picks an untried location.
        match copied {
            Ok(()) => Ok(ReplicationResult::Copied { source, target }),
            Err(e @ (GalleonError::Cancelled(_) | GalleonError::PinConflict { .. })) => Err(e),
            Err(e) => Ok(ReplicationResult::CopyFailed {
                source,
                reason: e.to_string(),
            }),
        }
    }

    async fn handle_completion(
        self: &Arc<Self>,
        file_id: FileId,
        id: Uuid,
        pool: Option<PoolName>,
        outcome: TaskOutcome<ReplicationResult>,
    ) {
        if let TaskOutcome::Completed(ReplicationResult::CopyFailed { source, reason }) = &outcome {
            match self.operations.requeue(&file_id, id) {
                Ok(retries) => {
                    warn!(file = %file_id, source = %source, retries, %reason, "copy failed, trying another source");
                    self.launch(file_id, id, pool);
                    return;
                }
                Err(_) => debug!(file = %file_id, "copy failed after the operation was dropped"),
            }
        }

        let state = match &outcome {
            TaskOutcome::Completed(ReplicationResult::CopyFailed { .. }) => OperationState::Failed,
            other => other.state(),
        };
        let operation = self.operations.complete(&file_id, id, state);
        let mut follow_up = operation.as_ref().is_some_and(|op| op.interest > 0);
        let tried = operation.map(|op| op.tried_sources).unwrap_or_default();

        match outcome {
            TaskOutcome::Completed(ReplicationResult::Copied { source, target }) => {
                info!(file = %file_id, source = %source, target = %target, "replica created");
                self.ctx.files.invalidate(&file_id);
                follow_up = true;
            }
            TaskOutcome::Completed(ReplicationResult::Satisfied { excess, corrupt }) => {
                if excess > 0 || corrupt > 0 {
                    self.reduction
                        .submit(file_id.clone(), ReductionRequest::Excess, pool.clone());
                }
            }
            TaskOutcome::Completed(ReplicationResult::Unmanaged) => {}
            TaskOutcome::Completed(ReplicationResult::CopyFailed { .. }) => {
                follow_up = false;
            }
            TaskOutcome::Failed(GalleonError::NoViableSource(_)) => {
                error!(file = %file_id, tried = ?tried, "replication failed, no viable source left");
                self.ctx.alarms().raise(
                    Alarm::new(AlarmKind::ReplicationFailed, format!("every source of {} failed", file_id))
                        .for_file(&file_id),
                );
                follow_up = false;
            }
            TaskOutcome::Failed(GalleonError::NoTargetPool(_)) => {
                error!(file = %file_id, "no pool can take another copy");
                self.ctx.alarms().raise(
                    Alarm::new(AlarmKind::NoTargetPool, format!("no target pool for {}", file_id))
                        .for_file(&file_id),
                );
                follow_up = false;
            }
            TaskOutcome::Failed(GalleonError::PinConflict { pool: pinned, .. }) => {
                warn!(file = %file_id, pool = %pinned, "copy refused, source is protected by another operation");
                follow_up = false;
            }
            TaskOutcome::Failed(e) => {
                warn!(file = %file_id, error = %e, "replication failed");
                follow_up = false;
            }
            TaskOutcome::Cancelled(reason) => {
                debug!(file = %file_id, operation = %id, %reason, "replication cancelled");
                self.ctx.sticky.release_operation(id).await;
                follow_up = false;
            }
        }

        if follow_up {
            self.submit(file_id, pool);
        }
        self.ctx
            .activity
            .unregister(id, OperationKind::Replication, state);
    }
}
