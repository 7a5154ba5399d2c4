//! Token-bucket credit limiter.
//!
//! The bucket accumulates `quantum` tokens every `fill_interval`, up to
//! `capacity`. Callers may grab whatever is available without blocking,
//! reserve tokens that have not arrived yet and be told how long to wait,
//! or bound that wait and be refused without side effects. All operations
//! are serialized under a mutex whose critical section is short and free
//! of blocking calls.

use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

/// Relative error tolerated when deriving `(quantum, fill_interval)` from
/// a floating-point rate.
const RATE_MARGIN: f64 = 0.01;

/// Fields guarded by the bucket mutex.
#[derive(Debug)]
struct BucketLevel {
    /// Tokens available as of `latest_tick`. Negative while callers have
    /// reserved tokens that are still being refilled.
    available: i64,
    /// The highest tick for which `available` has been refilled.
    latest_tick: i64,
}

/// A thread-safe token-bucket rate limiter.
///
/// Refill is quantized: time since creation is divided into ticks of
/// `fill_interval`, and each elapsed tick deposits `quantum` tokens,
/// clamped to `capacity`. A full bucket earns nothing extra no matter how
/// long it idles.
#[derive(Debug)]
pub struct TokenBucket<C = SystemClock> {
    clock: C,
    /// Creation instant; the origin of tick numbering.
    start_time: u64,
    capacity: i64,
    quantum: i64,
    fill_interval: Duration,
    level: Mutex<BucketLevel>,
}

impl TokenBucket<SystemClock> {
    /// Creates a bucket that deposits one token every `fill_interval`, up
    /// to `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `fill_interval` is zero or `capacity` is not positive.
    pub fn new(fill_interval: Duration, capacity: i64) -> Self {
        Self::with_clock(fill_interval, capacity, 1, SystemClock)
    }

    /// Creates a bucket that deposits `quantum` tokens every
    /// `fill_interval`, up to `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `fill_interval` is zero, or `capacity` or `quantum` is
    /// not positive.
    pub fn with_quantum(fill_interval: Duration, capacity: i64, quantum: i64) -> Self {
        Self::with_clock(fill_interval, capacity, quantum, SystemClock)
    }

    /// Creates a bucket refilling at approximately `rate` tokens per
    /// second.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not positive or `capacity` is not positive.
    pub fn with_rate(rate: f64, capacity: i64) -> Self {
        Self::with_rate_and_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Creates a bucket reading time from `clock`.
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

        let start_time = clock.now();
        Self {
            clock,
            start_time,
            capacity,
            quantum,
            fill_interval,
            level: Mutex::new(BucketLevel {
                available: capacity,
                latest_tick: 0,
            }),
        }
    }

    /// Creates a bucket refilling at approximately `rate` tokens per
    /// second, reading time from `clock`.
    ///
    /// Integer tick arithmetic cannot hit an arbitrary floating rate
    /// exactly, so the constructor searches for a `(quantum,
    /// fill_interval)` pair whose realized rate is within 1% of the
    /// target, growing the candidate quantum geometrically. If no pair
    /// within the margin exists below `2^50` the closest candidate is
    /// used and the residual error is logged; [`rate`](Self::rate)
    /// reports what was actually achieved.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not positive or `capacity` is not positive.
    pub fn with_rate_and_clock(rate: f64, capacity: i64, clock: C) -> Self {
        assert!(rate > 0.0, "token bucket rate must be positive");
        assert!(capacity > 0, "token bucket capacity must be greater than 0");

        let mut candidate: Option<(Duration, i64)> = None;
        let mut quantum = 1_i64;
        while quantum < 1 << 50 {
            let fill = (1e9 * quantum as f64 / rate).round();
            if fill >= 1.0 && fill < i64::MAX as f64 {
                let fill_interval = Duration::from_nanos(fill as u64);
                candidate = Some((fill_interval, quantum));
                let realized = 1e9 * quantum as f64 / fill;
                if ((realized - rate) / rate).abs() <= RATE_MARGIN {
                    return Self::with_clock(fill_interval, capacity, quantum, clock);
                }
            }
            quantum = next_quantum(quantum);
        }

        let (fill_interval, quantum) = candidate.unwrap_or((Duration::from_nanos(1), 1));
        let bucket = Self::with_clock(fill_interval, capacity, quantum, clock);
        log::warn!(
            "no quantum within {:.0}% of rate {rate}; using quantum {quantum} every {fill_interval:?} (realized rate {})",
            RATE_MARGIN * 100.0,
            bucket.rate(),
        );
        bucket
    }

    /// Takes `count` tokens, reserving ones that have not been refilled
    /// yet, and returns how long the caller must wait before using them.
    ///
    /// `count <= 0` returns a zero wait without touching the bucket.
    pub fn take(&self, count: i64) -> Duration {
        let (wait, _) = self.take_at(self.clock.now(), count, Duration::MAX);
        wait
    }

    /// Like [`take`](Self::take), but refuses instead of reserving when
    /// the wait would exceed `max_wait`.
    ///
    /// On refusal the result is `(Duration::ZERO, false)` and the bucket
    /// is left exactly as it was, so callers can retry without penalty.
    pub fn take_max_duration(&self, count: i64, max_wait: Duration) -> (Duration, bool) {
        self.take_at(self.clock.now(), count, max_wait)
    }

    /// Takes up to `count` of the tokens currently available and returns
    /// how many were taken. Never reserves future tokens.
    pub fn take_available(&self, count: i64) -> i64 {
        self.take_available_at(self.clock.now(), count)
    }

    /// Takes `count` tokens and blocks until they may be used.
    pub fn wait(&self, count: i64) {
        let wait = self.take(count);
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
    }

    /// Takes `count` tokens only if the required wait is at most
    /// `max_wait`, blocking for that wait. Returns whether the tokens
    /// were taken.
    pub fn wait_max_duration(&self, count: i64, max_wait: Duration) -> bool {
        let (wait, ok) = self.take_max_duration(count, max_wait);
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
        ok
    }

    /// Current token count. Negative while reservations are outstanding.
    pub fn available(&self) -> i64 {
        self.available_at(self.clock.now())
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// The refill rate actually realized, in tokens per second.
    pub fn rate(&self) -> f64 {
        1e9 * self.quantum as f64 / self.fill_nanos() as f64
    }

    /// Duration of one refill tick.
    pub fn fill_interval(&self) -> Duration {
        self.fill_interval
    }

    fn take_at(&self, now: u64, count: i64, max_wait: Duration) -> (Duration, bool) {
        if count <= 0 {
            return (Duration::ZERO, true);
        }

        let mut level = self.level.lock();
        let tick = self.tick_at(now);
        self.refill(&mut level, tick);

        let avail = level.available - count;
        if avail >= 0 {
            level.available = avail;
            return (Duration::ZERO, true);
        }

        // The tick at which enough tokens will have arrived, rounded up.
        let end_tick = tick + (-avail + self.quantum - 1) / self.quantum;
        let end_time = self
            .start_time
            .saturating_add(unsigned(end_tick).saturating_mul(self.fill_nanos()));
        let wait = Duration::from_nanos(end_time.saturating_sub(now));
        if wait > max_wait {
            return (Duration::ZERO, false);
        }
        level.available = avail;
        (wait, true)
    }

    fn take_available_at(&self, now: u64, count: i64) -> i64 {
        if count <= 0 {
            return 0;
        }

        let mut level = self.level.lock();
        self.refill(&mut level, self.tick_at(now));
        if level.available <= 0 {
            return 0;
        }
        let taken = count.min(level.available);
        level.available -= taken;
        taken
    }

    fn available_at(&self, now: u64) -> i64 {
        let mut level = self.level.lock();
        self.refill(&mut level, self.tick_at(now));
        level.available
    }

    fn tick_at(&self, now: u64) -> i64 {
        let elapsed = now.saturating_sub(self.start_time);
        i64::try_from(elapsed / self.fill_nanos()).unwrap_or(i64::MAX)
    }

    /// Deposits the tokens earned between `latest_tick` and `tick`.
    /// A bucket at or above capacity earns nothing.
    fn refill(&self, level: &mut BucketLevel, tick: i64) {
        let last = level.latest_tick;
        level.latest_tick = tick;
        if level.available >= self.capacity {
            return;
        }
        level.available = level
            .available
            .saturating_add((tick - last).saturating_mul(self.quantum));
        if level.available > self.capacity {
            level.available = self.capacity;
        }
    }

    fn fill_nanos(&self) -> u64 {
        u64::try_from(self.fill_interval.as_nanos()).unwrap_or(u64::MAX)
    }
}

fn next_quantum(q: i64) -> i64 {
    let grown = q * 11 / 10;
    if grown == q {
        q + 1
    } else {
        grown
    }
}

fn unsigned(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[test]
    fn available_follows_the_tick_schedule() {
        struct Case {
            about: &'static str,
            capacity: i64,
            fill_interval: Duration,
            take: i64,
            sleep: Duration,
            after_take: i64,
            after_sleep: i64,
        }
        let cases = [
            Case {
                about: "fills one token after the interval",
                capacity: 5,
                fill_interval: Duration::from_secs(1),
                take: 5,
                sleep: Duration::from_secs(1),
                after_take: 0,
                after_sleep: 1,
            },
            Case {
                about: "fills on top of the existing count",
                capacity: 2,
                fill_interval: Duration::from_secs(1),
                take: 1,
                sleep: Duration::from_secs(1),
                after_take: 1,
                after_sleep: 2,
            },
            Case {
                about: "does not fill before the interval",
                capacity: 2,
                fill_interval: Duration::from_secs(2),
                take: 1,
                sleep: Duration::from_secs(1),
                after_take: 1,
                after_sleep: 1,
            },
            Case {
                about: "fills once between 1x and 2x the interval",
                capacity: 2,
                fill_interval: Duration::from_secs(2),
                take: 1,
                sleep: Duration::from_secs(3),
                after_take: 1,
                after_sleep: 2,
            },
        ];

        for case in cases {
            let clock = MockClock::new(0);
            let bucket = TokenBucket::with_clock(case.fill_interval, case.capacity, 1, clock);
            assert_eq!(
                bucket.take_available_at(bucket.start_time, case.take),
                case.take,
                "{}",
                case.about
            );
            assert_eq!(
                bucket.available_at(bucket.start_time),
                case.after_take,
                "{}: available after take",
                case.about
            );
            let nanos = u64::try_from(case.sleep.as_nanos()).unwrap();
            assert_eq!(
                bucket.available_at(bucket.start_time + nanos),
                case.after_sleep,
                "{}: available after sleep",
                case.about
            );
        }
    }

    #[test]
    fn full_bucket_earns_no_bonus_tokens() {
        let clock = MockClock::new(0);
        let bucket =
            TokenBucket::with_clock(Duration::from_secs(1), 100, 20, clock.clone());

        assert_eq!(bucket.available(), 100);

        clock.advance(Duration::from_secs(5));
        assert_eq!(bucket.available(), 100);

        assert_eq!(bucket.take_available(100), 100);
        assert_eq!(bucket.available(), 0);

        // Once below capacity, refill resumes at quantum per tick.
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.available(), 20);
    }

    #[test]
    fn take_reserves_future_tokens() {
        let clock = MockClock::new(0);
        let bucket = TokenBucket::with_clock(Duration::from_secs(1), 1, 1, clock.clone());

        assert_eq!(bucket.take(1), Duration::ZERO);
        // The bucket is empty; the next token arrives at tick 1.
        assert_eq!(bucket.take(1), Duration::from_secs(1));
        assert_eq!(bucket.available(), -1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.available(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.available(), 1);
    }

    #[test]
    fn refused_take_leaves_the_bucket_untouched() {
        let clock = MockClock::new(0);
        let bucket = TokenBucket::with_clock(Duration::from_secs(1), 1, 1, clock.clone());

        assert_eq!(bucket.take(1), Duration::ZERO);

        let (wait, ok) = bucket.take_max_duration(1, Duration::from_millis(100));
        assert_eq!((wait, ok), (Duration::ZERO, false));
        assert_eq!(bucket.available(), 0);

        let (wait, ok) = bucket.take_max_duration(1, Duration::from_secs(1));
        assert_eq!((wait, ok), (Duration::from_secs(1), true));
        assert_eq!(bucket.available(), -1);
    }

    #[test]
    fn non_positive_counts_are_no_ops() {
        let clock = MockClock::new(0);
        let bucket = TokenBucket::with_clock(Duration::from_secs(1), 5, 1, clock);

        assert_eq!(bucket.take(0), Duration::ZERO);
        assert_eq!(bucket.take(-3), Duration::ZERO);
        assert_eq!(bucket.take_available(0), 0);
        assert_eq!(bucket.take_available(-3), 0);
        assert_eq!(bucket.take_max_duration(-1, Duration::ZERO), (Duration::ZERO, true));
        assert_eq!(bucket.available(), 5);
    }

    #[test]
    fn multi_quantum_wait_rounds_up_to_whole_ticks() {
        let clock = MockClock::new(0);
        let bucket = TokenBucket::with_clock(Duration::from_secs(1), 10, 3, clock.clone());

        assert_eq!(bucket.take(10), Duration::ZERO);
        // Seven tokens short; ceil(7 / 3) = 3 ticks.
        assert_eq!(bucket.take(7), Duration::from_secs(3));
    }

    #[test]
    fn rate_construction_stays_within_margin() {
        for rate in [0.5, 7.0, 50.0, 1234.56, 1e6] {
            let clock = MockClock::new(0);
            let bucket = TokenBucket::with_rate_and_clock(rate, 100, clock);
            let relative = ((bucket.rate() - rate) / rate).abs();
            assert!(
                relative <= RATE_MARGIN,
                "rate {rate}: realized {} off by {relative}",
                bucket.rate()
            );
        }
    }

    #[test]
    fn next_quantum_always_grows() {
        let mut q = 1_i64;
        while q < 1 << 20 {
            let next = next_quantum(q);
            assert!(next > q);
            q = next;
        }
    }

    #[test]
    #[should_panic(expected = "fill interval must be greater than 0")]
    fn zero_fill_interval_panics() {
        let _ = TokenBucket::new(Duration::ZERO, 1);
    }

    #[test]
    #[should_panic(expected = "capacity must be greater than 0")]
    fn zero_capacity_panics() {
        let _ = TokenBucket::new(Duration::from_secs(1), 0);
    }

    #[test]
    #[should_panic(expected = "quantum must be greater than 0")]
    fn zero_quantum_panics() {
        let _ = TokenBucket::with_quantum(Duration::from_secs(1), 1, 0);
    }

    #[test]
    #[should_panic(expected = "rate must be positive")]
    fn negative_rate_panics() {
        let _ = TokenBucket::with_rate(-1.0, 1);
    }
}
