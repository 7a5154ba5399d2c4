//! Pacing (leaky-bucket) rate limiters.
//!
//! A pacer spaces successive admissions at least `per / rate` apart,
//! optionally forgiving a bounded burst ("slack") accumulated while idle.
//! Two lock-free implementations share the [`Pacer`] contract: a
//! single-word variant that stores the next permission instant in one
//! atomic integer, and a variant that swaps an immutable state record and
//! stores slack as a signed debit. They are observably equivalent within
//! one `per_request` of precision.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;

use crate::clock::{Clock, SystemClock};

/// A blocking pacing limiter.
///
/// `take` blocks the caller until its permission instant and returns that
/// instant in nanoseconds since the clock's epoch. It never fails. For two
/// calls where one completes before the other begins, the returned
/// instants are non-decreasing; concurrent callers receive instants from
/// the pacing schedule in no particular order.
pub trait Pacer: Send + Sync + 'static {
    /// Blocks until the caller may proceed and returns the permission
    /// instant.
    fn take(&self) -> u64;
}

/// A pacer that admits everything immediately.
///
/// The null object of the [`Pacer`] contract: `take` returns the current
/// instant without blocking.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited<C = SystemClock> {
    clock: C,
}

impl Unlimited<SystemClock> {
    /// Creates a pacer that never limits.
    pub fn new() -> Self {
        Self { clock: SystemClock }
    }
}

impl<C: Clock> Unlimited<C> {
    /// Creates an unlimited pacer reading time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> Pacer for Unlimited<C> {
    fn take(&self) -> u64 {
        self.clock.now()
    }
}

/// Configuration shared by the pacer variants.
///
/// `rate` admissions are spread over each `per` window, so the minimum
/// spacing between admissions is `per / rate`. `slack` bounds how many
/// admissions' worth of credit an idle pacer may bank; `0` disables
/// bursting entirely.
#[derive(Debug, Clone, Copy)]
pub struct PacerConfig<C = SystemClock> {
    rate: u64,
    per: Duration,
    slack: u64,
    clock: C,
}

impl PacerConfig<SystemClock> {
    /// Starts a configuration for `rate` admissions per second with the
    /// default slack of 10 and the system clock.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn new(rate: u64) -> Self {
        assert!(rate > 0, "pacer rate must be greater than 0");
        Self {
            rate,
            per: Duration::from_secs(1),
            slack: 10,
            clock: SystemClock,
        }
    }
}

impl<C: Clock> PacerConfig<C> {
    /// Sets the window that `rate` admissions are spread over.
    ///
    /// # Panics
    ///
    /// Panics if `per` is zero.
    pub fn per(mut self, per: Duration) -> Self {
        assert!(!per.is_zero(), "pacer per-window must be greater than 0");
        self.per = per;
        self
    }

    /// Sets the maximum number of admissions an idle pacer may bank.
    pub fn slack(mut self, slack: u64) -> Self {
        self.slack = slack;
        self
    }

    /// Replaces the time source.
    pub fn clock<D: Clock>(self, clock: D) -> PacerConfig<D> {
        PacerConfig {
            rate: self.rate,
            per: self.per,
            slack: self.slack,
            clock,
        }
    }

    /// Builds the single-word atomic pacer.
    pub fn build_atomic(self) -> AtomicPacer<C> {
        let per_request = self.per_request();
        AtomicPacer {
            state: CachePadded::new(AtomicI64::new(0)),
            per_request,
            max_slack: self.max_slack(per_request),
            clock: self.clock,
        }
    }

    /// Builds the state-swapping pacer.
    pub fn build_swap(self) -> SwapPacer<C> {
        let per_request = self.per_request();
        SwapPacer {
            state: ArcSwap::from_pointee(TakeState {
                last: 0,
                sleep_for: 0,
            }),
            per_request,
            max_slack: -self.max_slack(per_request),
            clock: self.clock,
        }
    }

    fn per_request(&self) -> i64 {
        let per = u64::try_from(self.per.as_nanos()).unwrap_or(u64::MAX);
        i64::try_from(per / self.rate).unwrap_or(i64::MAX)
    }

    fn max_slack(&self, per_request: i64) -> i64 {
        i64::try_from(self.slack)
            .unwrap_or(i64::MAX)
            .saturating_mul(per_request)
    }
}

/// A pacer whose entire mutable state is one atomic word.
///
/// The word holds the instant at which the next permission is to be
/// issued, in nanoseconds since the clock's epoch; `0` means no permission
/// has been issued yet. Each `take` computes the successor instant as a
/// pure function of `(state, now)` and publishes it with a compare-and-
/// swap, so contended callers simply retry on a stale read.
///
/// Instants are signed 64-bit nanosecond counts, which puts the overflow
/// horizon in the year 2262 for a Unix-epoch clock.
#[derive(Debug)]
pub struct AtomicPacer<C = SystemClock> {
    // Padding keeps the hot CAS word off its neighbours' cache lines.
    state: CachePadded<AtomicI64>,
    per_request: i64,
    max_slack: i64,
    clock: C,
}

impl AtomicPacer<SystemClock> {
    /// Creates a pacer admitting `rate` calls per second with the default
    /// slack of 10.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn new(rate: u64) -> Self {
        PacerConfig::new(rate).build_atomic()
    }
}

impl<C: Clock> Pacer for AtomicPacer<C> {
    fn take(&self) -> u64 {
        let mut new_next;
        let mut now;
        loop {
            now = instant(self.clock.now());
            let next = self.state.load(Ordering::Acquire);

            new_next = if next == 0 || (self.max_slack == 0 && now - next > self.per_request) {
                // First call, or a slack-free pacer whose caller is late:
                // excess idle time is discarded.
                now
            } else if self.max_slack > 0 && now - next > self.max_slack {
                // The caller is very late; banked credit is capped.
                now - self.max_slack
            } else {
                // Covers early arrivals and backward clock jumps alike:
                // the schedule advances by one interval regardless.
                next + self.per_request
            };

            if self
                .state
                .compare_exchange(next, new_next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if new_next > now {
            self.clock
                .sleep(Duration::from_nanos(unsigned(new_next - now)));
        }
        unsigned(new_next)
    }
}

/// Published state of a [`SwapPacer`].
#[derive(Debug, Clone, Copy)]
struct TakeState {
    /// Instant of the most recent take; `0` means no take yet.
    last: u64,
    /// Signed pacing debt. Negative values are banked credit, bounded
    /// below by `-max_slack`.
    sleep_for: i64,
}

/// A pacer that atomically swaps an immutable state record.
///
/// Equivalent to [`AtomicPacer`] but encodes slack as a signed debit
/// against the last admission instant instead of shifting the next-issue
/// instant. The record is published through an [`ArcSwap`], so readers
/// never observe a partially written state.
#[derive(Debug)]
pub struct SwapPacer<C = SystemClock> {
    state: ArcSwap<TakeState>,
    per_request: i64,
    /// Held as a negative duration; the lower bound for `sleep_for`.
    max_slack: i64,
    clock: C,
}

impl SwapPacer<SystemClock> {
    /// Creates a pacer admitting `rate` calls per second with the default
    /// slack of 10.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero.
    pub fn new(rate: u64) -> Self {
        PacerConfig::new(rate).build_swap()
    }
}

impl<C: Clock> Pacer for SwapPacer<C> {
    fn take(&self) -> u64 {
        loop {
            let now = self.clock.now();
            let prev = self.state.load_full();

            let mut next = TakeState {
                last: now,
                sleep_for: prev.sleep_for,
            };
            let mut interval = 0_i64;

            if prev.last != 0 {
                next.sleep_for += self.per_request - (instant(now) - instant(prev.last));
                if next.sleep_for < self.max_slack {
                    next.sleep_for = self.max_slack;
                }
                if next.sleep_for > 0 {
                    // The caller owes time: fold the debt into the
                    // admission instant and sleep it off.
                    next.last = next.last.saturating_add(unsigned(next.sleep_for));
                    interval = next.sleep_for;
                    next.sleep_for = 0;
                }
            }

            let published = next.last;
            let old = self.state.compare_and_swap(&prev, Arc::new(next));
            if Arc::ptr_eq(&*old, &prev) {
                if interval > 0 {
                    self.clock.sleep(Duration::from_nanos(unsigned(interval)));
                }
                return published;
            }
        }
    }
}

fn instant(nanos: u64) -> i64 {
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn unsigned(nanos: i64) -> u64 {
    u64::try_from(nanos).unwrap_or(0)
}
