//! Shared services handed to every orchestrator

use galleon_common::config::ResilienceConfig;
use galleon_common::error::Result;
use std::sync::Arc;

use crate::activity::ActivityRegistry;
use crate::cache::{FileAttributeCache, PoolGroupCache};
use crate::executors::{Executors, RetryPolicy};
use crate::guard::CorrelationLedger;
use crate::provider::{AlarmSink, Namespace, PoolClient, PoolManager};
use crate::resolver::{CorruptReplicas, ReplicaResolver};
use crate::sticky::StickyCoordinator;

/// The external services the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub pool_manager: Arc<dyn PoolManager>,
    pub namespace: Arc<dyn Namespace>,
    pub pool_client: Arc<dyn PoolClient>,
    pub alarms: Arc<dyn AlarmSink>,
}

impl Collaborators {
    /// One object serving every role, such as the in-memory cluster
    pub fn from_single<T>(all: Arc<T>) -> Self
    where
        T: PoolManager + Namespace + PoolClient + AlarmSink + 'static,
    {
        Self {
            pool_manager: all.clone(),
            namespace: all.clone(),
            pool_client: all.clone(),
            alarms: all,
        }
    }
}

pub struct EngineContext {
    pub config: ResilienceConfig,
    pub collaborators: Collaborators,
    pub pool_groups: Arc<PoolGroupCache>,
    pub files: Arc<FileAttributeCache>,
    pub corrupt: Arc<CorruptReplicas>,
    pub resolver: ReplicaResolver,
    pub sticky: StickyCoordinator,
    pub activity: Arc<ActivityRegistry>,
    pub executors: Executors,
    pub ledger: Arc<CorrelationLedger>,
    pub retry: RetryPolicy,
}

impl EngineContext {
    pub fn new(config: ResilienceConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.cache);
        let pool_groups = Arc::new(PoolGroupCache::new(
            collaborators.pool_manager.clone(),
            config.cache.pool_info_ttl(),
            retry,
        ));
        let files = Arc::new(FileAttributeCache::new(
            collaborators.namespace.clone(),
            config.cache.file_info_ttl(),
            retry,
        ));
        let corrupt = Arc::new(CorruptReplicas::new());
        let resolver = ReplicaResolver::new(
            pool_groups.clone(),
            files.clone(),
            collaborators.pool_manager.clone(),
            corrupt.clone(),
            retry,
        );
        let sticky = StickyCoordinator::new(
            collaborators.pool_client.clone(),
            config.replication.sticky_ttl(),
            config.replication.request_timeout(),
        );

        Ok(Self {
            executors: Executors::new(&config.executors),
            ledger: Arc::new(CorrelationLedger::new(config.activity.correlation_retention())),
            activity: Arc::new(ActivityRegistry::new()),
            config,
            collaborators,
            pool_groups,
            files,
            corrupt,
            resolver,
            sticky,
            retry,
        })
    }

    pub fn pool_manager(&self) -> &Arc<dyn PoolManager> {
        &self.collaborators.pool_manager
    }

    pub fn namespace(&self) -> &Arc<dyn Namespace> {
        &self.collaborators.namespace
    }

    pub fn pool_client(&self) -> &Arc<dyn PoolClient> {
        &self.collaborators.pool_client
    }

    pub fn alarms(&self) -> &Arc<dyn AlarmSink> {
        &self.collaborators.alarms
    }
}
