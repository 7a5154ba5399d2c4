//! Keyed limiter registries.
//!
//! An admission adapter maps each request to an opaque key (a URL path,
//! a tenant id) and asks the registry for the limiter bound to that key.
//! The limiter is built lazily on first use with the registry's
//! configured parameters; concurrent first queries for one key resolve to
//! exactly one instance. Entries live for the lifetime of the registry —
//! there is no eviction, so the key domain should be bounded.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::pacer::{Pacer, PacerConfig};
use crate::token_bucket::TokenBucket;

/// Lazily builds one [`TokenBucket`] per key.
#[derive(Debug)]
pub struct TokenBucketMap<C = SystemClock> {
    fill_interval: Duration,
    capacity: i64,
    quantum: i64,
    clock: C,
    buckets: DashMap<String, Arc<TokenBucket<C>>>,
}

impl TokenBucketMap<SystemClock> {
    /// Creates a registry whose buckets deposit `quantum` tokens every
    /// `fill_interval`, up to `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `fill_interval` is zero, or `capacity` or `quantum` is
    /// not positive.
    pub fn new(fill_interval: Duration, capacity: i64, quantum: i64) -> Self {
        Self::with_clock(fill_interval, capacity, quantum, SystemClock)
    }
}

impl<C: Clock + Clone> TokenBucketMap<C> {
    /// Creates a registry whose buckets read time from `clock`.
    ///
    /// # Panics
    ///
    /// Panics if `fill_interval` is zero, or `capacity` or `quantum` is
    /// not positive.
    pub fn with_clock(fill_interval: Duration, capacity: i64, quantum: i64, clock: C) -> Self {
        assert!(
            !fill_interval.is_zero(),
            "token bucket fill interval must be greater than 0"
        );
        assert!(capacity > 0, "token bucket capacity must be greater than 0");
        assert!(quantum > 0, "token bucket quantum must be greater than 0");
        Self {
            fill_interval,
            capacity,
            quantum,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Returns the bucket bound to `key`, building it on first use.
    ///
    /// The constructor runs at most once per key; callers that lose the
    /// creation race receive the winner's instance.
    pub fn get_bucket(&self, key: &str) -> Arc<TokenBucket<C>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            log::debug!("creating token bucket for key {key:?}");
            Arc::new(TokenBucket::with_clock(
                self.fill_interval,
                self.capacity,
                self.quantum,
                self.clock.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Number of keys with a live bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key has been queried yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Lazily builds one pacing limiter per key.
pub struct PacerMap<C = SystemClock> {
    rate: u64,
    per: Duration,
    slack: u64,
    clock: C,
    pacers: DashMap<String, Arc<dyn Pacer>>,
}

impl<C: std::fmt::Debug> std::fmt::Debug for PacerMap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacerMap")
            .field("rate", &self.rate)
            .field("per", &self.per)
            .field("slack", &self.slack)
            .field("clock", &self.clock)
            .field("keys", &self.pacers.len())
            .finish()
    }
}

impl PacerMap<SystemClock> {
    /// Creates a registry whose pacers admit `rate` calls per second with
    /// the default slack of 10.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn new(rate: u64) -> Self {
        Self::with_clock(rate, Duration::from_secs(1), 10, SystemClock)
    }
}

impl<C: Clock + Clone> PacerMap<C> {
    /// Creates a registry whose pacers spread `rate` admissions over each
    /// `per` window, banking at most `slack` admissions while idle, and
    /// read time from `clock`.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero or `per` is zero.
    pub fn with_clock(rate: u64, per: Duration, slack: u64, clock: C) -> Self {
        assert!(rate > 0, "pacer rate must be greater than 0");
        assert!(!per.is_zero(), "pacer per-window must be greater than 0");
        Self {
            rate,
            per,
            slack,
            clock,
            pacers: DashMap::new(),
        }
    }

    /// Returns the pacer bound to `key`, building it on first use.
    ///
    /// The constructor runs at most once per key; callers that lose the
    /// creation race receive the winner's instance.
    pub fn get_pacer(&self, key: &str) -> Arc<dyn Pacer> {
        if let Some(pacer) = self.pacers.get(key) {
            return Arc::clone(pacer.value());
        }
        let entry = self.pacers.entry(key.to_owned()).or_insert_with(|| {
            log::debug!("creating pacer for key {key:?}");
            Arc::new(
                PacerConfig::new(self.rate)
                    .per(self.per)
                    .slack(self.slack)
                    .clock(self.clock.clone())
                    .build_atomic(),
            )
        });
        Arc::clone(entry.value())
    }

    /// Number of keys with a live pacer.
    pub fn len(&self) -> usize {
        self.pacers.len()
    }

    /// Whether no key has been queried yet.
    pub fn is_empty(&self) -> bool {
        self.pacers.is_empty()
    }
}
