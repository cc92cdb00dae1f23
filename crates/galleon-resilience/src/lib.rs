//! GalleonFS Resilience - keeps file replica counts within pool group bounds
//!
//! The engine is responsible for:
//! - Filtering inbound events (cold start, self-originated loops)
//! - Reducing pool status bursts to semantic transitions
//! - Dispatching file checks, pool scans and periodic passes
//! - Copying under-replicated files and pruning over-replicated ones
//! - Pinning replicas so no two operations race on the same copy
//! - Tracking in-flight activity for operators

use galleon_common::{config::ResilienceConfig, error::Result, EventEnvelope, ResilienceEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod activity;
pub mod admin;
pub mod cache;
pub mod context;
pub mod executors;
pub mod guard;
pub mod memory;
pub mod operations;
pub mod pool_status;
pub mod provider;
pub mod reduction;
pub mod replication;
pub mod resolver;
pub mod scanner;
pub mod selection;
pub mod sticky;

pub use activity::{ActivityFilter, ActivityRecord, ActivityReport, CancelSelector, CounterSnapshot};
pub use admin::{AdminApi, EngineStatus};
pub use context::{Collaborators, EngineContext};
pub use guard::GuardVerdict;
pub use memory::{ClusterSpec, InMemoryCluster, IssuedCommand};
pub use operations::{Admission, OperationKind, OperationState};
pub use pool_status::PoolStatus;
pub use provider::{AlarmSink, LoggingAlarmSink, Namespace, PoolClient, PoolManager};
pub use reduction::{ReductionOrchestrator, ReductionRequest};
pub use replication::ReplicationOrchestrator;
pub use scanner::{ScanDispatcher, ScanOrigin};
pub use selection::{DeterministicReduction, PoolSelectionStrategy, ProportionalSelection, ReductionStrategy};

use crate::guard::MessageGuard;

/// Main resilience service
pub struct ResilienceEngine {
    /// Shared services
    ctx: Arc<EngineContext>,
    /// Event and timer driven scans
    scanner: Arc<ScanDispatcher>,
    /// Copy orchestration
    replication: Arc<ReplicationOrchestrator>,
    /// Removal orchestration
    reduction: Arc<ReductionOrchestrator>,
    /// Inbound event filter
    guard: Arc<MessageGuard>,
    /// Event listeners spawned for subscribed channels
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ResilienceEngine {
    /// Create an engine with the default selection and reduction strategies
    pub fn new(config: ResilienceConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_strategies(
            config,
            collaborators,
            Arc::new(ProportionalSelection),
            Arc::new(DeterministicReduction),
        )
    }

    pub fn with_strategies(
        config: ResilienceConfig,
        collaborators: Collaborators,
        selection: Arc<dyn PoolSelectionStrategy>,
        reduction_strategy: Arc<dyn ReductionStrategy>,
    ) -> Result<Self> {
        info!("Initializing GalleonFS resilience engine");

        let ctx = Arc::new(EngineContext::new(config, collaborators)?);
        let reduction = Arc::new(ReductionOrchestrator::new(ctx.clone(), reduction_strategy));
        let replication = Arc::new(ReplicationOrchestrator::new(
            ctx.clone(),
            selection,
            reduction.clone(),
        ));
        let scanner = Arc::new(ScanDispatcher::new(
            ctx.clone(),
            replication.clone(),
            reduction.clone(),
        ));
        let guard = Arc::new(MessageGuard::new(ctx.ledger.clone(), ctx.activity.clone()));

        Ok(Self {
            ctx,
            scanner,
            replication,
            reduction,
            guard,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Start the engine: arm the cold-start window and the periodic scanner
    pub fn start(&self) {
        let scan = &self.ctx.config.scan;
        self.guard.start(scan.startup_delay());
        if scan.periodic_enabled {
            self.scanner.start_periodic();
        }
        info!("GalleonFS resilience engine started");
    }

    /// Routes one inbound event. Returns what the guard decided.
    pub async fn handle(&self, envelope: EventEnvelope) -> GuardVerdict {
        let verdict = self.guard.accept(&envelope);
        if !verdict.is_accepted() {
            return verdict;
        }

        match &envelope.event {
            ResilienceEvent::LocationAdded { file_id, pool }
            | ResilienceEvent::LocationCleared { file_id, pool } => {
                self.scanner.on_location(file_id, pool);
            }
            ResilienceEvent::PoolStatusChanged(raw) => {
                self.scanner.on_pool_status(raw);
            }
            ResilienceEvent::TopologyChanged(change) => {
                if let Err(e) = self.scanner.on_topology(change).await {
                    warn!(?change, error = %e, "failed to process topology change");
                }
            }
            ResilienceEvent::CorruptFileReported { file_id, pool } => {
                self.scanner.on_corrupt(file_id, pool);
            }
        }
        verdict
    }

    /// Feeds every event of `events` to `handle` until the sender goes away
    pub fn spawn_listener(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<EventEnvelope>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = events.recv().await {
                engine.handle(envelope).await;
            }
            debug!("event channel closed");
        });
        self.listeners.lock().push(handle);
    }

    /// Runs one periodic pass right away
    pub async fn scan_all(&self) -> Result<usize> {
        self.scanner.run_periodic_pass().await
    }

    pub fn admin(&self) -> AdminApi {
        AdminApi::new(self.ctx.clone(), self.scanner.clone(), self.guard.clone())
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn replication(&self) -> &Arc<ReplicationOrchestrator> {
        &self.replication
    }

    pub fn reduction(&self) -> &Arc<ReductionOrchestrator> {
        &self.reduction
    }

    /// Resolves once nothing is in flight; `false` if `limit` passed first
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        self.ctx.activity.wait_idle(limit).await
    }

    /// Stop timers and listeners, cancel in-flight work, close the executors
    pub async fn shutdown(&self) {
        info!("Shutting down GalleonFS resilience engine");
        self.scanner.shutdown();
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        let cancelled = self.ctx.activity.cancel_all();
        self.ctx.executors.shutdown();
        self.ctx.ledger.prune();
        info!(cancelled, "GalleonFS resilience engine stopped");
    }
}
