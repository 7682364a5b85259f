use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use super::{AdmissionPolicy, Limits, WindowStats, MINUTE_WINDOW};
use crate::clock::{system_clock, SharedClock};

/// Token-bucket admission: every recorded request holds one of
/// `per_minute` tokens for a minute, and at most `per_second` tokens may be
/// taken within any one second.
#[derive(Debug)]
pub struct TokenBucket {
    limits: Limits,
    /// Issue instants younger than a minute, oldest first.
    issued: Mutex<VecDeque<Instant>>,
    clock: SharedClock,
}

impl TokenBucket {
    pub fn new(limits: Limits) -> Self {
        Self::with_clock(limits, system_clock())
    }

    pub fn with_clock(limits: Limits, clock: SharedClock) -> Self {
        Self {
            limits,
            issued: Mutex::new(VecDeque::with_capacity(limits.per_minute as usize)),
            clock,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn stats(&self, now: Instant) -> WindowStats {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut issued, now);
        WindowStats::scan(issued.iter().copied(), now)
    }
}

fn prune(issued: &mut VecDeque<Instant>, now: Instant) {
    while let Some(at) = issued.front() {
        if now.saturating_duration_since(*at) < MINUTE_WINDOW {
            break;
        }
        issued.pop_front();
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl AdmissionPolicy for TokenBucket {
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
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        prune(&mut issued, now);
        issued.push_back(now);
        tracing::trace!(in_minute = issued.len(), "request recorded");
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }
}
