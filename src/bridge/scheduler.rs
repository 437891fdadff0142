//! Per-key flush scheduling.
//!
//! Each key moves `Idle -> Due -> Flushing -> Idle`. The fixed tick drives
//! `Idle -> Due`; hints only ever pull `next_due` earlier, and never below
//! `last_flush + min_period`. All methods take the current instant explicitly.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Effective timing policy shared by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Hard lower bound between two publishes of one key.
    pub min_period: Duration,
    /// Regular publish period, `>= min_period`.
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPhase {
    Idle,
    Due,
    Flushing,
}

/// Result of applying a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintEffect {
    /// `next_due` moved earlier.
    Advanced { from: Instant, to: Instant },
    /// `next_due` was already at or before the target.
    Unchanged,
    /// A flush is in flight; the hint applies when it completes.
    Deferred,
}

impl HintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Unchanged => "unchanged",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    phase: FlushPhase,
    last_flush: Instant,
    next_due: Instant,
    pending_hint: Option<Instant>,
}

impl Schedule {
    /// A fresh schedule: `last_flush = now`, first flush one interval later.
    pub fn new(now: Instant, policy: SchedulePolicy) -> Self {
        Self {
            phase: FlushPhase::Idle,
            last_flush: now,
            next_due: now + policy.flush_interval,
            pending_hint: None,
        }
    }

    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn has_pending_hint(&self) -> bool {
        self.pending_hint.is_some()
    }

    /// `Idle -> Due` when `now >= next_due`. Returns true if the key is due
    /// after the call.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.phase == FlushPhase::Idle && now >= self.next_due {
            self.phase = FlushPhase::Due;
        }
        self.phase == FlushPhase::Due
    }

    /// `Due -> Flushing`. Returns false if the key was not due.
    pub fn begin(&mut self) -> bool {
        if self.phase != FlushPhase::Due {
            return false;
        }
        self.phase = FlushPhase::Flushing;
        true
    }

    /// `Flushing -> Idle` after a sink attempt, whatever its outcome.
    ///
    /// `last_flush` becomes the flush start and `next_due` one interval
    /// later; a hint received during the flush is then applied.
    pub fn complete(&mut self, started_at: Instant, policy: SchedulePolicy) {
        assert_eq!(
            self.phase,
            FlushPhase::Flushing,
            "complete() called on a schedule that is not flushing"
        );
        assert!(
            started_at >= self.last_flush,
            "flush start precedes the previous flush"
        );

        self.phase = FlushPhase::Idle;
        self.last_flush = started_at;
        self.next_due = started_at + policy.flush_interval;

        if let Some(at) = self.pending_hint.take() {
            self.lower_towards(at, policy);
        }

        self.check(policy);
    }

    /// Returns to `Idle` without a sink attempt (no credentials). `last_flush`
    /// is kept; the next attempt is one interval from `now`.
    pub fn defer(&mut self, now: Instant, policy: SchedulePolicy) {
        self.phase = FlushPhase::Idle;
        self.pending_hint = None;
        self.next_due = (now + policy.flush_interval).max(self.last_flush + policy.min_period);
        self.check(policy);
    }

    /// Applies a scheduling hint received at `now`.
    pub fn hint(&mut self, now: Instant, policy: SchedulePolicy) -> HintEffect {
        match self.phase {
            FlushPhase::Flushing => {
                self.pending_hint = Some(now);
                HintEffect::Deferred
            }
            FlushPhase::Idle | FlushPhase::Due => {
                let from = self.next_due;
                if self.lower_towards(now, policy) {
                    HintEffect::Advanced {
                        from,
                        to: self.next_due,
                    }
                } else {
                    HintEffect::Unchanged
                }
            }
        }
    }

    fn lower_towards(&mut self, at: Instant, policy: SchedulePolicy) -> bool {
        let target = at.max(self.last_flush + policy.min_period);
        if target < self.next_due {
            self.next_due = target;
            return true;
        }
        false
    }

    fn check(&self, policy: SchedulePolicy) {
        assert!(
            self.next_due >= self.last_flush + policy.min_period,
            "next_due earlier than last_flush + min_period"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: u64, interval: u64) -> SchedulePolicy {
        SchedulePolicy {
            min_period: Duration::from_secs(min),
            flush_interval: Duration::from_secs(interval),
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_new_schedule_due_after_interval() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);

        assert_eq!(s.phase(), FlushPhase::Idle);
        assert_eq!(s.next_due(), t0 + secs(15));
        assert!(!s.poll(t0 + secs(14)));
        assert!(s.poll(t0 + secs(15)));
        assert_eq!(s.phase(), FlushPhase::Due);
    }

    #[test]
    fn test_full_cycle() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);

        assert!(!s.begin());
        assert!(s.poll(t0 + secs(15)));
        assert!(s.begin());
        assert_eq!(s.phase(), FlushPhase::Flushing);
        assert!(!s.poll(t0 + secs(100)));

        s.complete(t0 + secs(15), p);
        assert_eq!(s.phase(), FlushPhase::Idle);
        assert_eq!(s.last_flush(), t0 + secs(15));
        assert_eq!(s.next_due(), t0 + secs(30));
    }

    #[test]
    fn test_hint_lowers_to_min_period() {
        let t0 = Instant::now();
        let p = policy(15, 60);
        let mut s = Schedule::new(t0, p);

        // Hint at t=5: target = max(5, 0 + 15) = 15 < 60.
        let effect = s.hint(t0 + secs(5), p);
        assert_eq!(
            effect,
            HintEffect::Advanced {
                from: t0 + secs(60),
                to: t0 + secs(15)
            }
        );
        assert!(!s.poll(t0 + secs(5)));
        assert!(s.poll(t0 + secs(15)));
    }

    #[test]
    fn test_hint_after_min_period_uses_hint_time() {
        let t0 = Instant::now();
        let p = policy(15, 60);
        let mut s = Schedule::new(t0, p);

        s.hint(t0 + secs(20), p);
        assert_eq!(s.next_due(), t0 + secs(20));
    }

    #[test]
    fn test_hint_never_raises_next_due() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);

        assert_eq!(s.hint(t0 + secs(3), p), HintEffect::Unchanged);
        assert_eq!(s.next_due(), t0 + secs(15));
    }

    #[test]
    fn test_hint_does_not_make_due() {
        let t0 = Instant::now();
        let p = policy(15, 60);
        let mut s = Schedule::new(t0, p);

        s.hint(t0 + secs(30), p);
        assert_eq!(s.phase(), FlushPhase::Idle);
    }

    #[test]
    fn test_hint_during_flush_applied_on_complete() {
        let t0 = Instant::now();
        let p = policy(15, 60);
        let mut s = Schedule::new(t0, p);

        assert!(s.poll(t0 + secs(60)));
        assert!(s.begin());
        assert_eq!(s.hint(t0 + secs(61), p), HintEffect::Deferred);
        assert!(s.has_pending_hint());

        s.complete(t0 + secs(60), p);
        // target = max(61, 60 + 15) = 75 < 120
        assert_eq!(s.next_due(), t0 + secs(75));
        assert!(!s.has_pending_hint());
    }

    #[test]
    fn test_defer_keeps_last_flush() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);

        assert!(s.poll(t0 + secs(15)));
        assert!(s.begin());
        s.defer(t0 + secs(16), p);

        assert_eq!(s.phase(), FlushPhase::Idle);
        assert_eq!(s.last_flush(), t0);
        assert_eq!(s.next_due(), t0 + secs(31));
    }

    #[test]
    fn test_consecutive_flushes_respect_min_period() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);
        let mut starts = Vec::new();

        for tick in 0..120u64 {
            let now = t0 + secs(tick);
            if tick % 7 == 0 {
                s.hint(now, p);
            }
            if s.poll(now) && s.begin() {
                starts.push(now);
                s.complete(now, p);
            }
        }

        assert!(starts.len() >= 2);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= p.min_period);
        }
    }

    #[test]
    #[should_panic(expected = "not flushing")]
    fn test_complete_requires_flushing() {
        let t0 = Instant::now();
        let p = policy(15, 15);
        let mut s = Schedule::new(t0, p);
        s.complete(t0, p);
    }
}
