//! Admission control for outbound requests.
//!
//! # Overview
//! An `AdmissionPolicy` answers two questions: may a request go out right
//! now, and if not, when. Both implementations enforce the same pair of caps
//! (requests per second and per minute) over the timestamps handed to
//! `record_request`; they differ only in how the timestamps are stored.
//!
//! - [`TokenBucket`] keeps a bounded deque and prunes it eagerly.
//! - [`AveragingLimiter`] keeps a [`TtlCollection`](crate::ttl::TtlCollection)
//!   and derives its counts by scanning it.
//!
//! Policies never fail. They only compute counts and instants.

mod averaging;
mod bucket;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::clock::SharedClock;

pub use averaging::AveragingLimiter;
pub use bucket::TokenBucket;

/// Width of the short admission window. A timestamp counts against it while
/// `now - timestamp <= SECOND_WINDOW`.
pub(crate) const SECOND_WINDOW: Duration = Duration::from_millis(1000);

/// Lifetime of a recorded timestamp.
pub(crate) const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Fixed request caps shared by both policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub per_second: u32,
    pub per_minute: u32,
}

impl Limits {
    /// Caps below one would never admit anything and are raised to one.
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        Self {
            per_second: per_second.max(1),
            per_minute: per_minute.max(1),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            per_second: 2,
            per_minute: 80,
        }
    }
}

/// Decides whether and when the next outbound request may be issued.
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    /// True if a request could be issued without delay.
    fn can_proceed_now(&self) -> bool;

    /// The earliest instant at which a request may be issued. Returns the
    /// current instant when admission is already open.
    fn next_eligible_instant(&self) -> Instant;

    /// Notes that a request is going out now.
    fn record_request(&self);

    fn clock(&self) -> &SharedClock;

    fn time_until_eligible(&self) -> Duration {
        self.next_eligible_instant()
            .saturating_duration_since(self.clock().now())
    }

    /// Suspends the calling thread until admission opens.
    fn block_until_eligible(&self) {
        loop {
            let wait = self.time_until_eligible();
            if wait.is_zero() {
                return;
            }
            tracing::trace!(wait_ms = wait.as_millis() as u64, "waiting for admission");
            self.clock().sleep(wait);
        }
    }
}

/// Which policy implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterStrategy {
    #[default]
    Bucket,
    Averaging,
}

impl LimiterStrategy {
    pub fn build(self, limits: Limits, clock: SharedClock) -> Arc<dyn AdmissionPolicy> {
        match self {
            LimiterStrategy::Bucket => Arc::new(TokenBucket::with_clock(limits, clock)),
            LimiterStrategy::Averaging => Arc::new(AveragingLimiter::with_clock(limits, clock)),
        }
    }
}

/// Counts derived from the live timestamps at one instant.
#[derive(Debug, Default)]
struct WindowStats {
    in_minute: usize,
    in_second: usize,
    oldest: Option<Instant>,
    oldest_in_second: Option<Instant>,
}

impl WindowStats {
    /// `timestamps` must be live (younger than a minute) and oldest first.
    fn scan(timestamps: impl IntoIterator<Item = Instant>, now: Instant) -> Self {
        let mut stats = WindowStats::default();
        for at in timestamps {
            stats.in_minute += 1;
            stats.oldest.get_or_insert(at);
            if now.saturating_duration_since(at) <= SECOND_WINDOW {
                stats.in_second += 1;
                stats.oldest_in_second.get_or_insert(at);
            }
        }
        stats
    }

    fn admits(&self, limits: &Limits) -> bool {
        self.in_minute < limits.per_minute as usize && self.in_second < limits.per_second as usize
    }

    /// The second cap is checked first: when it binds, its opening is the
    /// sooner of the two.
    fn next_eligible(&self, limits: &Limits, now: Instant) -> Instant {
        if self.admits(limits) {
            return now;
        }
        let one_ms = Duration::from_millis(1);
        let opens_at = if self.in_second >= limits.per_second as usize {
            self.oldest_in_second.map(|at| at + SECOND_WINDOW + one_ms)
        } else {
            self.oldest.map(|at| at + MINUTE_WINDOW + one_ms)
        };
        opens_at.map_or(now, |at| at.max(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use proptest::prelude::*;

    fn policies(limits: Limits, clock: &Arc<ManualClock>) -> Vec<Arc<dyn AdmissionPolicy>> {
        vec![
            LimiterStrategy::Bucket.build(limits, clock.clone()),
            LimiterStrategy::Averaging.build(limits, clock.clone()),
        ]
    }

    #[test]
    fn two_requests_close_the_second_window() {
        let clock = ManualClock::shared();
        for policy in policies(Limits::default(), &clock) {
            let start = clock.now();
            policy.record_request();
            policy.record_request();

            clock.advance_millis(10);
            assert!(!policy.can_proceed_now(), "{policy:?} admitted at 10ms");
            assert_eq!(policy.next_eligible_instant(), start + Duration::from_millis(1001));

            clock.advance_millis(991);
            assert!(policy.can_proceed_now(), "{policy:?} refused at 1001ms");

            clock.advance(Duration::from_secs(120));
        }
    }

    #[test]
    fn minute_cap_waits_for_oldest_to_age_out() {
        let clock = ManualClock::shared();
        let limits = Limits::new(10, 3);
        for policy in policies(limits, &clock) {
            let start = clock.now();
            for _ in 0..3 {
                policy.record_request();
                clock.advance_millis(2000);
            }

            assert!(!policy.can_proceed_now());
            assert_eq!(policy.next_eligible_instant(), start + Duration::from_millis(60_001));

            clock.advance(Duration::from_secs(120));
            assert!(policy.can_proceed_now());
        }
    }

    #[test]
    fn open_policy_is_eligible_now() {
        let clock = ManualClock::shared();
        for policy in policies(Limits::default(), &clock) {
            assert!(policy.can_proceed_now());
            assert_eq!(policy.next_eligible_instant(), clock.now());
            assert_eq!(policy.time_until_eligible(), Duration::ZERO);
        }
    }

    #[test]
    fn block_until_eligible_sleeps_on_the_clock() {
        let clock = ManualClock::shared();
        for policy in policies(Limits::new(1, 80), &clock) {
            policy.record_request();
            let before = clock.now();

            policy.block_until_eligible();

            assert_eq!(clock.now() - before, Duration::from_millis(1001));
            assert!(policy.can_proceed_now());
        }
    }

    #[test]
    fn zero_caps_are_raised_to_one() {
        assert_eq!(Limits::new(0, 0), Limits::new(1, 1));
    }

    #[test]
    fn strategy_deserializes_lowercase() {
        let strategy: LimiterStrategy = serde_yaml::from_str("averaging").unwrap();
        assert_eq!(strategy, LimiterStrategy::Averaging);
    }

    proptest! {
        #[test]
        fn caps_hold_when_requests_wait_for_admission(
            per_second in 1u32..5,
            per_minute in 1u32..40,
            gaps in prop::collection::vec(0u64..1500, 1..200),
            averaging in any::<bool>(),
        ) {
            let clock = ManualClock::shared();
            let limits = Limits::new(per_second, per_minute);
            let strategy = if averaging { LimiterStrategy::Averaging } else { LimiterStrategy::Bucket };
            let policy = strategy.build(limits, clock.clone());
            let mut issued: Vec<Instant> = Vec::new();

            for gap in gaps {
                clock.advance_millis(gap);
                if !policy.can_proceed_now() {
                    continue;
                }
                policy.record_request();
                let now = clock.now();
                issued.push(now);

                let in_second = issued.iter().filter(|at| now - **at <= SECOND_WINDOW).count();
                let in_minute = issued.iter().filter(|at| now - **at < MINUTE_WINDOW).count();
                prop_assert!(in_second <= per_second as usize);
                prop_assert!(in_minute <= per_minute as usize);
            }
        }
    }
}
