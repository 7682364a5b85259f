//! Insertion-ordered collection whose elements expire a fixed time after
//! insertion.
//!
//! # Design
//! Expired elements are not removed when they expire but on the next query:
//! `len`, `is_empty`, `iter` and `find` sweep first. Calling `len` is therefore
//! also how owners trigger maintenance. Because elements are appended in time
//! order, a sweep only ever pops from the front.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};

pub struct TtlCollection<T> {
    entries: VecDeque<(T, Instant)>,
    ttl: Duration,
    clock: SharedClock,
}

impl<T> TtlCollection<T> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: VecDeque::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn add(&mut self, element: T) {
        let now = self.clock.now();
        self.entries.push_back((element, now));
    }

    /// Drops every element whose age reached the TTL. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        while let Some((_, inserted_at)) = self.entries.front() {
            if now.saturating_duration_since(*inserted_at) < self.ttl {
                break;
            }
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn len(&mut self) -> usize {
        self.sweep();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Live elements, oldest first.
    pub fn iter(&mut self) -> impl Iterator<Item = &T> {
        self.sweep();
        self.entries.iter().map(|(element, _)| element)
    }

    /// Live elements paired with their insertion instant, oldest first.
    pub fn iter_timestamped(&mut self) -> impl Iterator<Item = (&T, Instant)> {
        self.sweep();
        self.entries.iter().map(|(element, at)| (element, *at))
    }

    pub fn find<P>(&mut self, mut predicate: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().find(|element| predicate(*element))
    }

    /// Removes every element matching `predicate`, live or not.
    pub fn remove_if<P>(&mut self, mut predicate: P) -> usize
    where
        P: FnMut(&T) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|(element, _)| !predicate(element));
        before - self.entries.len()
    }
}

impl<T: fmt::Debug> fmt::Debug for TtlCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCollection")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}
