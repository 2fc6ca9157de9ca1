//! Pure per-iteration scheduling decision, factored out of the control loop so the cadence and
//! stuck-lock logic in spec section 4.2 can be unit tested without a live store.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

pub const STUCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Absent,
    /// Present; elapsed time since acquisition exceeds [`STUCK_TIMEOUT`].
    Stuck,
    /// Present and within [`STUCK_TIMEOUT`] of acquisition.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// `now < next_check`: sleep until this instant and re-evaluate.
    WaitUntil(DateTime<Utc>),
    /// Enqueue a job now. `clear_stuck_lock` tells the caller to delete the lock key first.
    Enqueue { clear_stuck_lock: bool },
    /// A job is already in flight; skip this cycle and push `next_check` forward by
    /// `check_interval` so the loop doesn't immediately re-evaluate the same instant.
    SkipAndAdvance { advance_to: DateTime<Utc> },
}

/// Computes the next action for a reloaded, active task row. Assumes the caller has already
/// handled "row missing" / "row inactive" termination.
pub fn tick(
    now: DateTime<Utc>,
    next_check: Option<DateTime<Utc>>,
    check_interval: Duration,
    lock: LockState,
) -> Tick {
    if let Some(next_check) = next_check {
        if now < next_check {
            let cap = now + ChronoDuration::seconds(60);
            return Tick::WaitUntil(next_check.min(cap));
        }
    }

    match lock {
        LockState::Absent => Tick::Enqueue {
            clear_stuck_lock: false,
        },
        LockState::Stuck => Tick::Enqueue {
            clear_stuck_lock: true,
        },
        LockState::Active => {
            let interval = ChronoDuration::from_std(check_interval).unwrap_or_default();
            Tick::SkipAndAdvance {
                advance_to: now + interval,
            }
        }
    }
}

/// Classifies a lock's acquisition timestamp as stuck or active.
pub fn classify_lock(acquired_at: DateTime<Utc>, now: DateTime<Utc>) -> LockState {
    let elapsed = now - acquired_at;
    let stuck_timeout = ChronoDuration::from_std(STUCK_TIMEOUT).unwrap_or_default();
    if elapsed > stuck_timeout {
        LockState::Stuck
    } else {
        LockState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn waits_until_next_check_capped_at_60s() {
        let now = at(0);
        let far_next_check = at(600);
        let action = tick(now, Some(far_next_check), Duration::from_secs(60), LockState::Absent);
        assert_eq!(action, Tick::WaitUntil(at(60)));
    }

    #[test]
    fn waits_until_next_check_when_sooner_than_60s() {
        let now = at(0);
        let soon = at(30);
        let action = tick(now, Some(soon), Duration::from_secs(60), LockState::Absent);
        assert_eq!(action, Tick::WaitUntil(at(30)));
    }

    #[test]
    fn enqueues_when_due_and_lock_absent() {
        let now = at(100);
        let action = tick(now, Some(at(100)), Duration::from_secs(60), LockState::Absent);
        assert_eq!(
            action,
            Tick::Enqueue {
                clear_stuck_lock: false
            }
        );
    }

    #[test]
    fn clears_stuck_lock_then_enqueues() {
        let now = at(100);
        let action = tick(now, Some(at(100)), Duration::from_secs(60), LockState::Stuck);
        assert_eq!(
            action,
            Tick::Enqueue {
                clear_stuck_lock: true
            }
        );
    }

    #[test]
    fn skips_and_advances_when_job_still_active() {
        let now = at(100);
        let action = tick(now, Some(at(100)), Duration::from_secs(60), LockState::Active);
        assert_eq!(
            action,
            Tick::SkipAndAdvance {
                advance_to: at(160)
            }
        );
    }

    #[test]
    fn enqueues_immediately_when_next_check_unset() {
        let now = at(0);
        let action = tick(now, None, Duration::from_secs(60), LockState::Absent);
        assert_eq!(
            action,
            Tick::Enqueue {
                clear_stuck_lock: false
            }
        );
    }

    #[test]
    fn classify_lock_stuck_after_timeout() {
        let acquired = at(0);
        assert_eq!(classify_lock(acquired, at(599)), LockState::Active);
        assert_eq!(classify_lock(acquired, at(601)), LockState::Stuck);
    }
}
