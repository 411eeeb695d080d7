//! Time-to-live memoization for derived attributes.
//!
//! An owner attaches one [`ExpiringCache`] per derived attribute (or an
//! [`AttributeCache`] keyed by attribute name) as a plain field, so two owner
//! instances never share an entry. None of these types are thread-safe: the
//! `&mut self` receivers make the owner serialise access, and an owner that
//! shares itself across threads accepts that concurrent first accesses may each
//! compute with the last write winning.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

/// TTL used by owners that do not pick their own.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Wall-clock source for cache timestamps.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/// A single memoized value with its computation timestamp.
///
/// A `ttl` of zero means "compute once, never expire". Otherwise the value is
/// recomputed on the first access after more than `ttl` of wall-clock time has
/// passed since it was stored.
#[derive(Debug)]
pub struct ExpiringCache<T, C: Clock = SystemClock> {
    ttl: Duration,
    entry: Option<(T, SystemTime)>,
    clock: C,
}

impl<T> ExpiringCache<T, SystemClock> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock)
    }
}

impl<T, C: Clock> ExpiringCache<T, C> {
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            ttl,
            entry: None,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value, computing and storing it if absent or expired.
    pub fn get_or_compute<F>(&mut self, compute: F) -> &T
    where
        F: FnOnce() -> T,
    {
        let now = self.clock.now();
        let entry = match self.entry.take() {
            Some(entry) if !self.is_expired(entry.1, now) => entry,
            _ => (compute(), now),
        };
        &self.entry.insert(entry).0
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for fallible computations.
    ///
    /// A failed computation stores nothing; a previously cached but expired
    /// value is discarded either way.
    pub fn get_or_try_compute<F, E>(&mut self, compute: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let now = self.clock.now();
        let entry = match self.entry.take() {
            Some(entry) if !self.is_expired(entry.1, now) => entry,
            _ => (compute()?, now),
        };
        Ok(&self.entry.insert(entry).0)
    }

    /// The stored value, if any and not expired. Never computes.
    pub fn peek(&self) -> Option<&T> {
        let now = self.clock.now();
        self.entry
            .as_ref()
            .filter(|(_, at)| !self.is_expired(*at, now))
            .map(|(value, _)| value)
    }

    /// When the stored value was computed.
    pub fn computed_at(&self) -> Option<SystemTime> {
        self.entry.as_ref().map(|(_, at)| *at)
    }

    /// Discard the stored value so the next access recomputes.
    pub fn invalidate(&mut self) -> Option<T> {
        self.entry.take().map(|(value, _)| value)
    }

    fn is_expired(&self, computed_at: SystemTime, now: SystemTime) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        // A clock that went backwards counts as no time elapsed.
        now.duration_since(computed_at)
            .map(|elapsed| elapsed > self.ttl)
            .unwrap_or(false)
    }
}

/// Per-instance memoization of several attributes of one value type, keyed by
/// attribute name.
#[derive(Debug)]
pub struct AttributeCache<V, C: Clock + Clone = SystemClock> {
    entries: HashMap<&'static str, ExpiringCache<V, C>>,
    clock: C,
}

impl<V> AttributeCache<V, SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<V> Default for AttributeCache<V, SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C: Clock + Clone> AttributeCache<V, C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Cached value of attribute `name`, computed with `compute` when absent or
    /// older than `ttl`. The ttl is fixed by the first access to `name`.
    pub fn get_or_compute<F>(&mut self, name: &'static str, ttl: Duration, compute: F) -> &V
    where
        F: FnOnce() -> V,
    {
        let clock = &self.clock;
        self.entries
            .entry(name)
            .or_insert_with(|| ExpiringCache::with_clock(ttl, clock.clone()))
            .get_or_compute(compute)
    }

    pub fn peek(&self, name: &str) -> Option<&V> {
        self.entries.get(name).and_then(ExpiringCache::peek)
    }

    /// Drop the stored value of attribute `name`.
    pub fn invalidate(&mut self, name: &str) -> Option<V> {
        self.entries.remove(name).and_then(|mut cache| cache.invalidate())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
