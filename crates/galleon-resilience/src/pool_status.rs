//! Pool status state machine.
//!
//! Reduces bursts of raw pool status messages to one semantic transition
//! per pool. `next` is pure; `PoolStatusTracker` remembers the last
//! non-`Nop` status of every pool.

use dashmap::DashMap;
use galleon_common::{PoolName, RawPoolEvent, RawPoolStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolStatus {
    Up,
    Down,
    Restart,
    UpIgnore,
    DownIgnore,
    Cancel,
    Nop,
}

impl PoolStatus {
    /// Whether this transition schedules a scan of the pool
    pub fn triggers_scan(self) -> bool {
        matches!(self, PoolStatus::Down | PoolStatus::Restart)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolStatus::Up => "UP",
            PoolStatus::Down => "DOWN",
            PoolStatus::Restart => "RESTART",
            PoolStatus::UpIgnore => "UP_IGNORE",
            PoolStatus::DownIgnore => "DOWN_IGNORE",
            PoolStatus::Cancel => "CANCEL",
            PoolStatus::Nop => "NOP",
        };
        f.write_str(name)
    }
}

/// Raw status after folding in the mode bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effective {
    Down,
    Restart,
    Up,
    UpUnreadable,
}

impl Effective {
    fn of(raw: &RawPoolEvent) -> Self {
        match raw.status {
            RawPoolStatus::Down => Effective::Down,
            RawPoolStatus::Restart => Effective::Restart,
            RawPoolStatus::Up if raw.mode.is_readable() => Effective::Up,
            RawPoolStatus::Up => Effective::UpUnreadable,
        }
    }

    fn is_down_like(self) -> bool {
        matches!(self, Effective::Down | Effective::UpUnreadable)
    }
}

/// The transition for `raw` given the pool's remembered status
pub fn next(previous: Option<PoolStatus>, raw: &RawPoolEvent) -> PoolStatus {
    use Effective as E;
    use PoolStatus as S;

    let effective = Effective::of(raw);

    if !raw.replication_enabled {
        return match (previous, effective.is_down_like()) {
            (Some(S::DownIgnore), true) | (Some(S::UpIgnore), false) => S::Nop,
            (_, true) => S::DownIgnore,
            (_, false) => S::UpIgnore,
        };
    }

    match (previous, effective) {
        (Some(S::Down), E::Up | E::UpUnreadable) => S::Cancel,
        (Some(S::Down), E::Restart) => S::Restart,
        (Some(S::Down), E::Down) => S::Nop,

        (Some(S::DownIgnore), E::Up) => S::UpIgnore,
        (Some(S::DownIgnore), _) => S::Nop,

        (Some(S::UpIgnore), E::Down | E::UpUnreadable) => S::Down,
        (Some(S::UpIgnore), _) => S::Nop,

        (Some(S::Restart), E::Down) => S::Down,
        (Some(S::Restart), _) => S::Nop,

        (_, E::Down | E::UpUnreadable) => S::Down,
        (_, E::Restart | E::Up) => S::Nop,
    }
}

#[derive(Default)]
pub struct PoolStatusTracker {
    statuses: DashMap<PoolName, PoolStatus>,
}

impl PoolStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the event and returns the transition. The per-pool entry is
    /// locked for the read-decide-write sequence.
    pub fn apply(&self, raw: &RawPoolEvent) -> PoolStatus {
        let mut entry = self.statuses.entry(raw.pool.clone()).or_insert(PoolStatus::Up);
        let previous = *entry;
        let status = next(Some(previous), raw);
        if status != PoolStatus::Nop {
            *entry = status;
        }
        debug!(pool = %raw.pool, raw = ?raw.status, %previous, %status, "pool status");
        status
    }

    pub fn status(&self, pool: &PoolName) -> Option<PoolStatus> {
        self.statuses.get(pool).map(|s| *s)
    }

    pub fn forget(&self, pool: &PoolName) {
        self.statuses.remove(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galleon_common::PoolMode;

    fn raw(status: RawPoolStatus) -> RawPoolEvent {
        RawPoolEvent::new("pool-a", status)
    }

    fn unreadable_up() -> RawPoolEvent {
        raw(RawPoolStatus::Up).with_mode(PoolMode {
            enabled: true,
            readable: false,
            writable: true,
        })
    }

    #[test]
    fn test_transition_table() {
        use PoolStatus::*;
        let down = raw(RawPoolStatus::Down);
        let restart = raw(RawPoolStatus::Restart);
        let up = raw(RawPoolStatus::Up);
        let unreadable = unreadable_up();

        let cases = [
            (None, &down, Down),
            (None, &restart, Nop),
            (None, &unreadable, Down),
            (Some(Up), &down, Down),
            (Some(Up), &restart, Nop),
            (Some(Up), &unreadable, Down),
            (Some(Down), &down, Nop),
            (Some(Down), &restart, Restart),
            (Some(Down), &unreadable, Cancel),
            (Some(Down), &up, Cancel),
            (Some(DownIgnore), &down, Nop),
            (Some(DownIgnore), &restart, Nop),
            (Some(DownIgnore), &unreadable, Nop),
            (Some(Restart), &down, Down),
            (Some(Restart), &restart, Nop),
            (Some(Restart), &unreadable, Nop),
            (Some(UpIgnore), &restart, Nop),
            (Some(UpIgnore), &down, Down),
            (Some(Cancel), &down, Down),
        ];
        for (previous, event, expected) in cases {
            assert_eq!(
                next(previous, event),
                expected,
                "{:?} x {:?}/{:?}",
                previous,
                event.status,
                event.mode
            );
        }
    }

    #[test]
    fn test_replication_disabled_collapses_to_ignore() {
        let down = raw(RawPoolStatus::Down).with_replication(false);
        let restart = raw(RawPoolStatus::Restart).with_replication(false);
        let up = raw(RawPoolStatus::Up).with_replication(false);

        assert_eq!(next(None, &down), PoolStatus::DownIgnore);
        assert_eq!(next(Some(PoolStatus::Down), &restart), PoolStatus::UpIgnore);
        assert_eq!(next(Some(PoolStatus::DownIgnore), &down), PoolStatus::Nop);
        assert_eq!(next(Some(PoolStatus::UpIgnore), &up), PoolStatus::Nop);
    }

    #[test]
    fn test_tracker_keeps_status_across_nop() {
        let tracker = PoolStatusTracker::new();
        let pool = PoolName::from("pool-a");
        assert_eq!(tracker.apply(&raw(RawPoolStatus::Down)), PoolStatus::Down);
        assert_eq!(tracker.apply(&raw(RawPoolStatus::Down)), PoolStatus::Nop);
        assert_eq!(tracker.status(&pool), Some(PoolStatus::Down));
        assert_eq!(tracker.apply(&raw(RawPoolStatus::Up)), PoolStatus::Cancel);
        assert_eq!(tracker.apply(&raw(RawPoolStatus::Up)), PoolStatus::Nop);
    }
}
