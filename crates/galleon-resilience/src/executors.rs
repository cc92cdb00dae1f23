//! Bounded worker pools segregated by blocking-risk class.
//!
//! Every pool caps how many of its tasks run at once; surplus work waits for
//! a permit instead of spawning more concurrency.

use galleon_common::config::{CacheConfig, ExecutorConfig};
use galleon_common::error::{GalleonError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Increments on creation, decrements on drop (including on abort)
struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    fn new(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time occupancy of a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub name: String,
    pub size: usize,
    pub running: usize,
    pub queued: usize,
}

/// Fixed-size pool of tokio tasks
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues `task`; it starts once a permit frees up. Resolves to
    /// `Cancelled` if the pool shuts down before the task got a permit.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = self.name;
        let permits = self.permits.clone();
        let running = self.running.clone();
        let queued = GaugeGuard::new(&self.queued);

        tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            drop(queued);
            let _permit = permit
                .map_err(|_| GalleonError::Cancelled(format!("{} executor shut down", name)))?;
            let _running = GaugeGuard::new(&running);
            Ok(task.await)
        })
    }

    /// Like `spawn`, but waits `delay` before asking for a permit. The task
    /// counts as neither queued nor running while it waits, and aborting the
    /// handle covers both the wait and the work.
    pub fn spawn_after<F, T>(&self, delay: Duration, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if delay.is_zero() {
            return self.spawn(task);
        }
        let name = self.name;
        let permits = self.permits.clone();
        let running = self.running.clone();
        let queued = self.queued.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let waiting = GaugeGuard::new(&queued);
            let permit = permits.acquire_owned().await;
            drop(waiting);
            let _permit = permit
                .map_err(|_| GalleonError::Cancelled(format!("{} executor shut down", name)))?;
            let _running = GaugeGuard::new(&running);
            Ok(task.await)
        })
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            name: self.name.to_string(),
            size: self.size,
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Stops handing out permits; queued tasks resolve to `Cancelled`
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

/// The engine's worker pools
#[derive(Clone)]
pub struct Executors {
    /// Event-driven single-file checks (cache-bound)
    pub pool_info: WorkerPool,
    /// Pool scans and other namespace-heavy queries
    pub namespace: WorkerPool,
    /// Copy operations
    pub copy: WorkerPool,
    /// Removal operations
    pub remove: WorkerPool,
}

impl Executors {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            pool_info: WorkerPool::new("pool-info", config.pool_info_workers),
            namespace: WorkerPool::new("namespace", config.namespace_workers),
            copy: WorkerPool::new("copy", config.copy_workers),
            remove: WorkerPool::new("remove", config.remove_workers),
        }
    }

    pub fn stats(&self) -> Vec<WorkerPoolStats> {
        vec![
            self.pool_info.stats(),
            self.namespace.stats(),
            self.copy.stats(),
            self.remove.stats(),
        ]
    }

    pub fn shutdown(&self) {
        self.pool_info.shutdown();
        self.namespace.shutdown();
        self.copy.shutdown();
        self.remove.shutdown();
    }
}

/// Bounded retry of upstream (metadata service) calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            attempts: config.upstream_retries.max(1),
            delay: config.upstream_retry_delay(),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Waits `delay` between attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    debug!(attempt, error = %e, "{} failed, retrying", what);
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bounds a remote request; an elapsed deadline becomes a retryable `Timeout`
pub async fn with_timeout<T, Fut>(limit: Duration, what: impl FnOnce() -> String, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GalleonError::Timeout(format!(
            "{} did not answer within {:?}",
            what(),
            limit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new("test", 2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let peak = peak.clone();
                let current = current.clone();
                pool.spawn(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().queued, 0);
        assert_eq!(pool.stats().running, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_work() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();
        let result = pool.spawn(async { 42 }).await.unwrap();
        assert!(matches!(result, Err(GalleonError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_holds_no_permit_while_waiting() {
        let pool = WorkerPool::new("test", 1);
        let delayed = pool.spawn_after(Duration::from_secs(60), async { "late" });

        tokio::task::yield_now().await;
        assert_eq!(pool.stats().running, 0);
        assert_eq!(pool.stats().queued, 0);

        // The only permit is free, so immediate work is not starved
        let started = Instant::now();
        let quick = pool.spawn(async { "now" }).await.unwrap().unwrap();
        assert_eq!(quick, "now");
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(delayed.await.unwrap().unwrap(), "late");
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborting_delayed_task_during_wait() {
        let pool = WorkerPool::new("test", 1);
        let ran = Arc::new(AtomicU32::new(0));
        let delayed = {
            let ran = ran.clone();
            pool.spawn_after(Duration::from_secs(60), async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        delayed.abort();
        assert!(delayed.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_stops_after_budget() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(100),
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("namespace lookup", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GalleonError::UpstreamUnavailable("db down".into())) }
            })
            .await;
        assert!(matches!(result, Err(GalleonError::UpstreamUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_to_retryable_error() {
        let result: Result<()> = with_timeout(
            Duration::from_secs(1),
            || "pool-a".to_string(),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, GalleonError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_retry_policy_does_not_retry_permanent_errors() {
        let policy = RetryPolicy {
            attempts: 5,
            delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("namespace lookup", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GalleonError::NotFound("0000A1".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
