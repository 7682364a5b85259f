//! A single value with an absolute expiry.
//!
//! Once the expiry instant has passed the value is treated as absent by every
//! accessor except `get_anyway`. The value is never mutated in place; it is
//! replaced wholesale (a renewed session) or cleared with `destroy`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};

/// Returned by `ExpiringValue::get` once the value has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value has expired")]
pub struct Expired;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// The lifespan did not fit in an `Instant`.
    Never,
    At(Instant),
    /// Expired since the beginning of time.
    Expired,
}

pub struct ExpiringValue<T> {
    value: Option<T>,
    expiry: Expiry,
    clock: SharedClock,
}

impl<T> ExpiringValue<T> {
    /// A value that stays alive for `lifespan` from now.
    pub fn expire_in(value: T, lifespan: Duration) -> Self {
        Self::expire_in_with_clock(value, lifespan, system_clock())
    }

    pub fn expire_in_with_clock(value: T, lifespan: Duration, clock: SharedClock) -> Self {
        let expiry = match clock.now().checked_add(lifespan) {
            Some(at) => Expiry::At(at),
            None => Expiry::Never,
        };
        Self {
            value: Some(value),
            expiry,
            clock,
        }
    }

    /// A value that stays alive up to and including `at`.
    pub fn expire_at(value: T, at: Instant) -> Self {
        Self::expire_at_with_clock(value, at, system_clock())
    }

    pub fn expire_at_with_clock(value: T, at: Instant, clock: SharedClock) -> Self {
        Self {
            value: Some(value),
            expiry: Expiry::At(at),
            clock,
        }
    }

    /// An empty value that is already expired.
    pub fn expired() -> Self {
        Self::expired_with_clock(system_clock())
    }

    pub fn expired_with_clock(clock: SharedClock) -> Self {
        Self {
            value: None,
            expiry: Expiry::Expired,
            clock,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self.expiry {
            Expiry::Never => true,
            Expiry::At(at) => self.clock.now() <= at,
            Expiry::Expired => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        !self.is_alive()
    }

    /// The value, or `Expired` once the expiry has passed.
    pub fn get(&self) -> Result<&T, Expired> {
        self.poll().ok_or(Expired)
    }

    /// The value while alive.
    pub fn poll(&self) -> Option<&T> {
        if self.is_alive() {
            self.value.as_ref()
        } else {
            None
        }
    }

    pub fn or<'a>(&'a self, other: &'a T) -> &'a T {
        self.poll().unwrap_or(other)
    }

    pub fn or_else<F>(&self, other: F) -> T
    where
        T: Clone,
        F: FnOnce() -> T,
    {
        self.poll().cloned().unwrap_or_else(other)
    }

    /// Applies `f` to the value only while it is alive.
    pub fn if_alive<F>(&self, f: F)
    where
        F: FnOnce(&T),
    {
        if let Some(value) = self.poll() {
            f(value);
        }
    }

    /// The stored value regardless of expiry.
    pub fn get_anyway(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The expiry instant; `None` for a value that never expires or was
    /// expired from the start.
    pub fn expires_at(&self) -> Option<Instant> {
        match self.expiry {
            Expiry::At(at) => Some(at),
            Expiry::Never | Expiry::Expired => None,
        }
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining_lifespan(&self) -> Duration {
        match self.expiry {
            Expiry::Never => Duration::MAX,
            Expiry::At(at) => at.saturating_duration_since(self.clock.now()),
            Expiry::Expired => Duration::ZERO,
        }
    }

    pub fn destroy(&mut self) {
        self.value = None;
        self.expiry = Expiry::Expired;
    }
}

impl<T: Clone> Clone for ExpiringValue<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            expiry: self.expiry,
            clock: self.clock.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ExpiringValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringValue")
            .field("value", &self.value)
            .field("alive", &self.is_alive())
            .field("remaining", &self.remaining_lifespan())
            .finish()
    }
}
