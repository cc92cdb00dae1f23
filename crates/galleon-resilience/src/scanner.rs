//! Scan dispatcher.
//!
//! Turns events, status transitions and the periodic timer into file checks
//! and pool scans, and each checked file into a replication or reduction.

use galleon_common::error::Result;
use galleon_common::{FileId, PoolName, RawPoolEvent, ReplicaCountFilter, TopologyChange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::CancelSelector;
use crate::context::EngineContext;
use crate::operations::{Admission, OperationKind, OperationMap, OperationState, TaskOutcome};
use crate::pool_status::{PoolStatus, PoolStatusTracker};
use crate::reduction::ReductionOrchestrator;
use crate::replication::ReplicationOrchestrator;

/// Who asked for a pool scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOrigin {
    Periodic,
    Event,
    Admin,
}

impl ScanOrigin {
    /// Periodic passes never queue a rescan of a pool that is mid-scan
    fn raises_interest(self) -> bool {
        !matches!(self, ScanOrigin::Periodic)
    }
}

/// What a file check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    Unmanaged,
    Satisfied,
    Replicate(Admission),
    Reduce(Admission),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub files: usize,
    pub replications: usize,
    pub reductions: usize,
    pub errors: usize,
}

pub struct ScanDispatcher {
    ctx: Arc<EngineContext>,
    replication: Arc<ReplicationOrchestrator>,
    reduction: Arc<ReductionOrchestrator>,
    scans: OperationMap<PoolName>,
    checks: OperationMap<FileId>,
    statuses: PoolStatusTracker,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl ScanDispatcher {
    pub fn new(
        ctx: Arc<EngineContext>,
        replication: Arc<ReplicationOrchestrator>,
        reduction: Arc<ReductionOrchestrator>,
    ) -> Self {
        Self {
            ctx,
            replication,
            reduction,
            scans: OperationMap::new(OperationKind::PoolScan),
            checks: OperationMap::new(OperationKind::FileCheck),
            statuses: PoolStatusTracker::new(),
            periodic: Mutex::new(None),
        }
    }

    pub fn statuses(&self) -> &PoolStatusTracker {
        &self.statuses
    }

    pub fn scans(&self) -> &OperationMap<PoolName> {
        &self.scans
    }

    /// Queues a check of a single file on the pool-info executor
    pub fn check_file(self: &Arc<Self>, file_id: FileId, pool: Option<PoolName>) -> Admission {
        let admission = self.checks.submit(file_id.clone(), pool.clone(), true, || {
            self.ctx
                .activity
                .register(OperationKind::FileCheck, pool.clone(), Some(file_id.clone()))
        });
        let Admission::New(id) = admission else {
            return admission;
        };

        let task = {
            let this = self.clone();
            let file_id = file_id.clone();
            let pool = pool.clone();
            self.ctx.executors.pool_info.spawn(async move {
                this.checks.mark_running(&file_id, id);
                this.evaluate(&file_id, pool.as_ref()).await
            })
        };
        self.ctx.activity.attach_abort(id, task.abort_handle());

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = TaskOutcome::from_join(task.await);
            let state = outcome.state();
            let operation = this.checks.complete(&file_id, id, state);
            match outcome {
                TaskOutcome::Completed(decision) => {
                    debug!(file = %file_id, ?decision, "file checked");
                }
                TaskOutcome::Failed(e) => warn!(file = %file_id, error = %e, "file check failed"),
                TaskOutcome::Cancelled(reason) => debug!(file = %file_id, %reason, "file check cancelled"),
            }
            if state != OperationState::Cancelled && operation.is_some_and(|op| op.interest > 0) {
                this.check_file(file_id, pool);
            }
            this.ctx
                .activity
                .unregister(id, OperationKind::FileCheck, state);
        });
        admission
    }

    /// Resolves the file and hands it to replication or reduction
    pub async fn evaluate(&self, file_id: &FileId, pool: Option<&PoolName>) -> Result<FileDecision> {
        let Some(resolved) = self.ctx.resolver.resolve(file_id, pool).await? else {
            return Ok(FileDecision::Unmanaged);
        };
        let info = &resolved.info;
        if !info.is_managed() {
            return Ok(FileDecision::Unmanaged);
        }
        if info.copies_needed() > 0 {
            let admission = self.replication.submit(file_id.clone(), pool.cloned());
            return Ok(FileDecision::Replicate(admission));
        }
        match self.reduction.reconcile(info, pool.cloned()) {
            Some(admission) => Ok(FileDecision::Reduce(admission)),
            None => Ok(FileDecision::Satisfied),
        }
    }

    /// Queues a scan of every file on `pool`, starting after `delay`
    pub fn scan_pool(
        self: &Arc<Self>,
        pool: PoolName,
        filter: Option<ReplicaCountFilter>,
        delay: Duration,
        origin: ScanOrigin,
    ) -> Admission {
        let admission = self
            .scans
            .submit(pool.clone(), Some(pool.clone()), origin.raises_interest(), || {
                self.ctx
                    .activity
                    .register(OperationKind::PoolScan, Some(pool.clone()), None)
            });
        let Admission::New(id) = admission else {
            debug!(pool = %pool, ?origin, "pool already being scanned");
            return admission;
        };
        debug!(pool = %pool, ?origin, ?delay, filter = ?filter.map(|f| f.to_string()), "pool scan queued");

        let task = {
            let this = self.clone();
            let pool = pool.clone();
            // The grace period elapses before a namespace permit is taken
            self.ctx.executors.namespace.spawn_after(delay, async move {
                this.scans.mark_running(&pool, id);
                this.scan_files(&pool, filter).await
            })
        };
        self.ctx.activity.attach_abort(id, task.abort_handle());

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = TaskOutcome::from_join(task.await);
            this.handle_scan_completion(pool, id, outcome);
        });
        admission
    }

    async fn scan_files(&self, pool: &PoolName, filter: Option<ReplicaCountFilter>) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        if self.ctx.pool_groups.get(pool).await?.is_none() {
            debug!(pool = %pool, "not in a resilient group, nothing to scan");
            return Ok(summary);
        }

        let files = self
            .ctx
            .retry
            .run("pool file listing", || self.ctx.namespace().files_on_pool(pool, filter))
            .await?;
        info!(pool = %pool, files = files.len(), "scanning pool");

        for file_id in files {
            summary.files += 1;
            match self.evaluate(&file_id, Some(pool)).await {
                Ok(FileDecision::Replicate(_)) => summary.replications += 1,
                Ok(FileDecision::Reduce(_)) => summary.reductions += 1,
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    summary.errors += 1;
                    warn!(pool = %pool, file = %file_id, error = %e, "file check failed during scan");
                }
            }
        }
        Ok(summary)
    }

    fn handle_scan_completion(self: &Arc<Self>, pool: PoolName, id: Uuid, outcome: TaskOutcome<ScanSummary>) {
        let state = outcome.state();
        let operation = self.scans.complete(&pool, id, state);
        match outcome {
            TaskOutcome::Completed(summary) => info!(
                pool = %pool,
                files = summary.files,
                replications = summary.replications,
                reductions = summary.reductions,
                errors = summary.errors,
                "pool scan finished"
            ),
            TaskOutcome::Failed(e) => error!(pool = %pool, error = %e, "pool scan failed"),
            TaskOutcome::Cancelled(reason) => debug!(pool = %pool, %reason, "pool scan cancelled"),
        }
        if state != OperationState::Cancelled && operation.is_some_and(|op| op.interest > 0) {
            debug!(pool = %pool, "rescanning after coalesced requests");
            self.scan_pool(pool, None, Duration::ZERO, ScanOrigin::Event);
        }
        self.ctx
            .activity
            .unregister(id, OperationKind::PoolScan, state);
    }

    /// Feeds a raw status message through the state machine and acts on
    /// the resulting transition
    pub fn on_pool_status(self: &Arc<Self>, event: &RawPoolEvent) -> PoolStatus {
        let status = self.statuses.apply(event);
        let scan = &self.ctx.config.scan;
        match status {
            PoolStatus::Down => {
                info!(pool = %event.pool, grace = ?scan.down_grace_period(), "pool down, scan scheduled");
                self.scan_pool(event.pool.clone(), None, scan.down_grace_period(), ScanOrigin::Event);
            }
            PoolStatus::Restart => {
                info!(pool = %event.pool, grace = ?scan.restart_grace_period(), "pool restarted, scan scheduled");
                self.scan_pool(event.pool.clone(), None, scan.restart_grace_period(), ScanOrigin::Event);
            }
            PoolStatus::Cancel => {
                let cancelled = self
                    .ctx
                    .activity
                    .cancel(&CancelSelector::Pool(event.pool.clone()));
                info!(pool = %event.pool, cancelled, "pool back up, pending operations cancelled");
            }
            PoolStatus::Up
            | PoolStatus::UpIgnore
            | PoolStatus::DownIgnore
            | PoolStatus::Nop => {}
        }
        status
    }

    pub async fn on_topology(self: &Arc<Self>, change: &TopologyChange) -> Result<()> {
        let pool_groups = &self.ctx.pool_groups;
        match change {
            TopologyChange::PoolAddedToGroup { pool, group } => {
                pool_groups.invalidate_group(group);
                pool_groups.invalidate(pool);
                self.scan_pool(pool.clone(), None, Duration::ZERO, ScanOrigin::Event);
            }
            TopologyChange::PoolRemovedFromGroup { pool, group } => {
                pool_groups.invalidate_group(group);
                pool_groups.invalidate(pool);
                let cancelled = self
                    .ctx
                    .activity
                    .cancel(&CancelSelector::Pool(pool.clone()));
                debug!(pool = %pool, group = %group, cancelled, "pool left group");
                self.scan_group(group).await?;
            }
            TopologyChange::StorageUnitAdded { group, .. }
            | TopologyChange::StorageUnitModified { group, .. }
            | TopologyChange::StorageUnitRemoved { group, .. } => {
                pool_groups.invalidate_all();
                self.scan_group(group).await?;
            }
            TopologyChange::PoolGroupRemoved { group } => {
                pool_groups.invalidate_group(group);
                info!(group = %group, "pool group removed");
            }
        }
        Ok(())
    }

    pub fn on_location(self: &Arc<Self>, file_id: &FileId, pool: &PoolName) -> Admission {
        self.ctx.files.invalidate(file_id);
        self.check_file(file_id.clone(), Some(pool.clone()))
    }

    /// Marks the replica unusable and schedules its replacement
    pub fn on_corrupt(self: &Arc<Self>, file_id: &FileId, pool: &PoolName) -> Admission {
        if self.ctx.corrupt.mark(file_id, pool) {
            warn!(file = %file_id, pool = %pool, "replica reported corrupt");
        }
        self.ctx.files.invalidate(file_id);
        self.check_file(file_id.clone(), Some(pool.clone()))
    }

    /// Scans every readable member of one resilient group
    pub async fn scan_group(self: &Arc<Self>, group: &str) -> Result<usize> {
        let groups = self
            .ctx
            .retry
            .run("resilient group listing", || self.ctx.pool_manager().resilient_groups())
            .await?;
        let Some(group) = groups.into_iter().find(|g| g.name == group) else {
            debug!(group = %group, "group is not resilient, nothing to scan");
            return Ok(0);
        };
        self.scan_members(&group.pools.into_iter().collect::<Vec<_>>(), ScanOrigin::Event)
            .await
    }

    /// One periodic pass: every readable member of every resilient group.
    /// Returns the number of scans started.
    pub async fn run_periodic_pass(self: &Arc<Self>) -> Result<usize> {
        let groups = self
            .ctx
            .retry
            .run("resilient group listing", || self.ctx.pool_manager().resilient_groups())
            .await?;
        let mut started = 0;
        for group in groups {
            let members: Vec<PoolName> = group.pools.into_iter().collect();
            started += self.scan_members(&members, ScanOrigin::Periodic).await?;
        }
        info!(started, "periodic scan pass dispatched");
        Ok(started)
    }

    async fn scan_members(self: &Arc<Self>, members: &[PoolName], origin: ScanOrigin) -> Result<usize> {
        let infos = self
            .ctx
            .retry
            .run("pool info lookup", || self.ctx.pool_manager().pool_infos(members))
            .await?;
        let started = infos
            .into_iter()
            .filter(|info| info.mode.is_readable())
            .map(|info| self.scan_pool(info.name, None, Duration::ZERO, origin))
            .filter(Admission::is_new)
            .count();
        Ok(started)
    }

    /// Starts the periodic scanner; the first pass runs one period from now
    pub fn start_periodic(self: &Arc<Self>) {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            return;
        }
        let period = self.ctx.config.scan.period();
        let this = self.clone();
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_periodic_pass().await {
                    error!(error = %e, "periodic scan pass failed");
                }
            }
        }));
        info!(period = ?period, "periodic scanner started");
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
    }
}
