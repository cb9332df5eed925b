//! A bounded, expiring cache of sealed block traces, keyed by block number.
//!
//! The cache is a plain value owned by whoever serves trace requests; time is
//! read through a [`Clock`] so that expiry can be driven by hand in tests.

use std::num::NonZero;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

/// Source of the current time.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Least-recently-used cache whose entries also expire `ttl` after insertion.
#[derive(Debug)]
pub struct TraceCache<V, C: Clock = SystemClock> {
    entries: LruCache<u64, Entry<V>>,
    ttl: Duration,
    clock: C,
}

impl<V> TraceCache<V> {
    pub fn new(capacity: NonZero<usize>, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, SystemClock)
    }
}

impl<V, C: Clock> TraceCache<V, C> {
    pub fn with_clock(capacity: NonZero<usize>, ttl: Duration, clock: C) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
            clock,
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.ttl
    }

    /// The trace of `block_number`, unless it was evicted or expired.
    pub fn get(&mut self, block_number: u64) -> Option<&V> {
        let now = self.clock.now();
        let expired = self
            .entries
            .peek(&block_number)
            .is_some_and(|e| self.is_expired(e, now));
        if expired {
            debug!("trace of block {} expired", block_number);
            self.entries.pop(&block_number);
            return None;
        }
        self.entries.get(&block_number).map(|e| &e.value)
    }

    /// Caches `value`, returning the previous value for the same block.
    pub fn insert(&mut self, block_number: u64, value: V) -> Option<V> {
        let entry = Entry {
            value,
            inserted_at: self.clock.now(),
        };
        self.entries.put(block_number, entry).map(|e| e.value)
    }

    pub fn remove(&mut self, block_number: u64) -> Option<V> {
        self.entries.pop(&block_number).map(|e| e.value)
    }

    /// Drops every expired entry.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(k, _)| *k)
            .collect();
        for k in &expired {
            self.entries.pop(k);
        }
        expired.len()
    }

    /// Number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> NonZero<usize> {
        self.entries.cap()
    }
}
