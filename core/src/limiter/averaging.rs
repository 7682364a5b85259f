use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use super::{AdmissionPolicy, Limits, WindowStats, MINUTE_WINDOW};
use crate::clock::{system_clock, SharedClock};
use crate::ttl::TtlCollection;

/// Sliding-window admission.
///
/// Every request timestamp lives in a one-minute `TtlCollection`; the
/// per-second and per-minute counts are recomputed by scanning it on every
/// query.
#[derive(Debug)]
pub struct AveragingLimiter {
    limits: Limits,
    requests: Mutex<TtlCollection<Instant>>,
    clock: SharedClock,
}

impl AveragingLimiter {
    pub fn new(limits: Limits) -> Self {
        Self::with_clock(limits, system_clock())
    }

    pub fn with_clock(limits: Limits, clock: SharedClock) -> Self {
        Self {
            limits,
            requests: Mutex::new(TtlCollection::with_clock(MINUTE_WINDOW, clock.clone())),
            clock,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn stats(&self, now: Instant) -> WindowStats {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        WindowStats::scan(requests.iter().copied(), now)
    }
}

impl Default for AveragingLimiter {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl AdmissionPolicy for AveragingLimiter {
    fn can_proceed_now(&self) -> bool {
        let now = self.clock.now();
        self.stats(now).admits(&self.limits)
    }

    fn next_eligible_instant(&self) -> Instant {
        let now = self.clock.now();
        self.stats(now).next_eligible(&self.limits, now)
    }

    fn record_request(&self) {
        let now = self.clock.now();
        tracing::trace!(limits = ?self.limits, "request recorded");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(now);
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }
}
