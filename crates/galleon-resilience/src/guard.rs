//! Message guard: the engine's front door.
//!
//! Drops everything during cold start, and drops events that were caused
//! by commands this engine issued itself (recognised by correlation id).

use dashmap::DashMap;
use galleon_common::EventEnvelope;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::activity::ActivityRegistry;

/// Remembers the correlation ids of issued commands for a bounded time
pub struct CorrelationLedger {
    issued: DashMap<Uuid, Instant>,
    retention: Duration,
    issued_total: AtomicU64,
}

impl CorrelationLedger {
    const PRUNE_EVERY: u64 = 256;

    pub fn new(retention: Duration) -> Self {
        Self {
            issued: DashMap::new(),
            retention,
            issued_total: AtomicU64::new(0),
        }
    }

    /// A fresh id for an outbound command
    pub fn issue(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.issued.insert(id, Instant::now());
        if self.issued_total.fetch_add(1, Ordering::Relaxed) % Self::PRUNE_EVERY == 0 {
            self.prune();
        }
        id
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.issued
            .get(id)
            .is_some_and(|at| at.elapsed() < self.retention)
    }

    pub fn prune(&self) {
        let retention = self.retention;
        self.issued.retain(|_, at| at.elapsed() < retention);
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardVerdict {
    Accepted,
    DroppedColdStart,
    DroppedSelfOriginated,
    Disabled,
}

impl GuardVerdict {
    pub fn is_accepted(self) -> bool {
        self == GuardVerdict::Accepted
    }
}

pub struct MessageGuard {
    enabled: AtomicBool,
    /// `None` until started
    ready_at: Mutex<Option<Instant>>,
    ledger: Arc<CorrelationLedger>,
    activity: Arc<ActivityRegistry>,
}

impl MessageGuard {
    pub fn new(ledger: Arc<CorrelationLedger>, activity: Arc<ActivityRegistry>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            ready_at: Mutex::new(None),
            ledger,
            activity,
        }
    }

    /// Starts the cold-start window; events are accepted once it elapses
    pub fn start(&self, startup_delay: Duration) {
        *self.ready_at.lock() = Some(Instant::now() + startup_delay);
        info!(delay = ?startup_delay, "message guard armed");
    }

    /// Accepts events immediately, ending any cold-start window
    pub fn enable(&self) {
        *self.ready_at.lock() = Some(Instant::now());
        self.enabled.store(true, Ordering::SeqCst);
        info!("message guard enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("message guard disabled, dropping all events");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_at
            .lock()
            .is_some_and(|ready_at| Instant::now() >= ready_at)
    }

    pub fn accept(&self, envelope: &EventEnvelope) -> GuardVerdict {
        let kind = envelope.event.kind();
        self.activity.message_received(kind);

        let verdict = if !self.is_enabled() {
            GuardVerdict::Disabled
        } else if !self.is_ready() {
            GuardVerdict::DroppedColdStart
        } else if envelope
            .correlation_id
            .is_some_and(|id| self.ledger.contains(&id))
        {
            GuardVerdict::DroppedSelfOriginated
        } else {
            GuardVerdict::Accepted
        };

        if verdict.is_accepted() {
            trace!(%kind, "accepted");
        } else {
            self.activity.message_dropped(kind);
            debug!(%kind, ?verdict, "event dropped");
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleon_common::{FileId, MessageKind, PoolName, ResilienceEvent};

    fn guard() -> (Arc<CorrelationLedger>, Arc<ActivityRegistry>, MessageGuard) {
        let ledger = Arc::new(CorrelationLedger::new(Duration::from_secs(600)));
        let activity = Arc::new(ActivityRegistry::new());
        let guard = MessageGuard::new(ledger.clone(), activity.clone());
        (ledger, activity, guard)
    }

    fn location_added() -> ResilienceEvent {
        ResilienceEvent::LocationAdded {
            file_id: FileId::from("0000A1"),
            pool: PoolName::from("pool-a"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_window() {
        let (_, activity, guard) = guard();
        let envelope = EventEnvelope::new(location_added());
        assert_eq!(guard.accept(&envelope), GuardVerdict::DroppedColdStart);

        guard.start(Duration::from_secs(30));
        assert_eq!(guard.accept(&envelope), GuardVerdict::DroppedColdStart);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(guard.accept(&envelope), GuardVerdict::Accepted);

        let counters = activity.counters();
        let added = counters.message(MessageKind::LocationAdded).unwrap();
        assert_eq!((added.received, added.dropped), (3, 2));
    }

    #[tokio::test]
    async fn test_self_originated_events_dropped() {
        let (ledger, _, guard) = guard();
        guard.enable();
        let ours = ledger.issue();
        assert_eq!(
            guard.accept(&EventEnvelope::correlated(location_added(), ours)),
            GuardVerdict::DroppedSelfOriginated
        );
        assert_eq!(
            guard.accept(&EventEnvelope::correlated(location_added(), Uuid::new_v4())),
            GuardVerdict::Accepted
        );
    }

    #[tokio::test]
    async fn test_disabled_guard_drops_everything() {
        let (_, _, guard) = guard();
        guard.enable();
        guard.disable();
        assert_eq!(
            guard.accept(&EventEnvelope::new(location_added())),
            GuardVerdict::Disabled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_forgets_after_retention() {
        let ledger = CorrelationLedger::new(Duration::from_secs(10));
        let id = ledger.issue();
        assert!(ledger.contains(&id));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!ledger.contains(&id));
        ledger.prune();
        assert!(ledger.is_empty());
    }
}
