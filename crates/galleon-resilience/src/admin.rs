//! Operator surface: listing, cancellation, rescans and counters

use galleon_common::{FileId, PoolName, ReplicaCountFilter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::activity::{ActivityFilter, ActivityReport, CancelSelector, CounterSnapshot};
use crate::cache::CacheStats;
use crate::context::EngineContext;
use crate::executors::WorkerPoolStats;
use crate::guard::MessageGuard;
use crate::operations::Admission;
use crate::pool_status::PoolStatus;
use crate::scanner::{ScanDispatcher, ScanOrigin};

/// Internal state summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub guard_enabled: bool,
    pub guard_ready: bool,
    pub executors: Vec<WorkerPoolStats>,
    pub caches: Vec<CacheStats>,
    pub pinned_replicas: usize,
    pub corrupt_replicas: usize,
    pub issued_correlations: usize,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "message guard: {}{}",
            if self.guard_enabled { "enabled" } else { "disabled" },
            if self.guard_ready { "" } else { " (cold start)" }
        )?;
        for pool in &self.executors {
            writeln!(
                f,
                "executor {:<10} size {:>3}  running {:>3}  queued {:>5}",
                pool.name, pool.size, pool.running, pool.queued
            )?;
        }
        for cache in &self.caches {
            writeln!(
                f,
                "cache {:<16} entries {:>6}  hits {:>8}  loads {:>8}",
                cache.name, cache.entries, cache.hits, cache.loads
            )?;
        }
        write!(
            f,
            "pinned {}  corrupt {}  correlations {}",
            self.pinned_replicas, self.corrupt_replicas, self.issued_correlations
        )
    }
}

#[derive(Clone)]
pub struct AdminApi {
    ctx: Arc<EngineContext>,
    scanner: Arc<ScanDispatcher>,
    guard: Arc<MessageGuard>,
}

impl AdminApi {
    pub fn new(ctx: Arc<EngineContext>, scanner: Arc<ScanDispatcher>, guard: Arc<MessageGuard>) -> Self {
        Self { ctx, scanner, guard }
    }

    /// In-flight operations, newest first. `limit` defaults to the configured one.
    pub fn list(&self, filter: &ActivityFilter, limit: Option<usize>) -> ActivityReport {
        let limit = limit.unwrap_or(self.ctx.config.activity.default_list_limit);
        self.ctx.activity.list(filter, limit)
    }

    pub fn cancel(&self, selector: &CancelSelector) -> usize {
        let cancelled = self.ctx.activity.cancel(selector);
        info!(?selector, cancelled, "operations cancelled by administrator");
        cancelled
    }

    pub fn rescan_pool(&self, pool: &PoolName, filter: Option<ReplicaCountFilter>) -> Admission {
        info!(pool = %pool, filter = ?filter.map(|f| f.to_string()), "rescan requested");
        self.scanner
            .scan_pool(pool.clone(), filter, Duration::ZERO, ScanOrigin::Admin)
    }

    pub fn check_file(&self, file_id: &FileId) -> Admission {
        self.ctx.files.invalidate(file_id);
        self.scanner.check_file(file_id.clone(), None)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.ctx.activity.counters()
    }

    pub fn pool_status(&self, pool: &PoolName) -> Option<PoolStatus> {
        self.scanner.statuses().status(pool)
    }

    pub fn enable_guard(&self) {
        self.guard.enable();
    }

    pub fn disable_guard(&self) {
        self.guard.disable();
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            guard_enabled: self.guard.is_enabled(),
            guard_ready: self.guard.is_ready(),
            executors: self.ctx.executors.stats(),
            caches: vec![self.ctx.pool_groups.stats(), self.ctx.files.stats()],
            pinned_replicas: self.ctx.sticky.pinned_count(),
            corrupt_replicas: self.ctx.corrupt.len(),
            issued_correlations: self.ctx.ledger.len(),
        }
    }
}
