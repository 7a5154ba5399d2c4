//! Clock abstraction for time-based operations.
//!
//! Provides a trait-based clock interface so the limiters can be driven by
//! virtual time in tests and by the OS clock in production.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A source of time for rate limiters.
///
/// Instants are expressed as nanoseconds since the clock's own epoch. The
/// epoch may be the Unix epoch, process start, or any other fixed point, as
/// long as it is consistent for the lifetime of the clock. Subsequent calls
/// to `now()` should never return a smaller value than a previous call.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time in nanoseconds since the clock's epoch.
    fn now(&self) -> u64;

    /// Blocks the calling thread for at least `d` of this clock's time.
    ///
    /// A zero duration returns immediately. Under a virtual clock the call
    /// blocks until external advancement crosses the duration.
    fn sleep(&self, d: Duration);
}

/// A clock backed by the system wall clock.
///
/// This is the default production clock. Instants are nanoseconds since
/// `UNIX_EPOCH`, which keeps them meaningful across processes; signed
/// arithmetic on them overflows in the year 2262.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => u64::try_from(since.as_nanos()).unwrap_or(u64::MAX),
            // A wall clock before 1970 is indistinguishable from epoch here.
            Err(_) => 0,
        }
    }

    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            std::thread::sleep(d);
        }
    }
}

#[derive(Debug)]
struct MockState {
    now: u64,
    /// Wake deadlines of the threads currently blocked in `sleep`.
    sleepers: Vec<u64>,
}

#[derive(Debug)]
struct MockInner {
    state: Mutex<MockState>,
    wake: Condvar,
}

/// A virtual clock for deterministic tests.
///
/// Time only moves when `advance` or `set` is called. Threads blocked in
/// [`Clock::sleep`] are parked on a condvar and released once the clock
/// crosses their deadline. `parked` and `next_wake` let a test driver
/// confirm that every worker is asleep before advancing, which is what
/// makes multi-threaded scenarios reproducible.
///
/// The pacing limiters treat instant `0` as "never taken", so tests should
/// start a `MockClock` at a non-zero origin.
#[derive(Debug)]
pub struct MockClock {
    inner: Arc<MockInner>,
}

impl Clone for MockClock {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MockClock {
    /// Creates a new `MockClock` at `origin` nanoseconds.
    pub fn new(origin: u64) -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    now: origin,
                    sleepers: Vec::new(),
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Advances the clock by `d`, releasing any sleeper whose deadline is
    /// crossed.
    pub fn advance(&self, d: Duration) {
        let mut state = self.inner.state.lock();
        state.now = state.now.saturating_add(nanos(d));
        let _ = self.inner.wake.notify_all();
    }

    /// Moves the clock to the absolute instant `now` (nanoseconds).
    ///
    /// Setting the clock backwards is allowed; sleepers keep their original
    /// deadlines.
    pub fn set(&self, now: u64) {
        let mut state = self.inner.state.lock();
        state.now = now;
        let _ = self.inner.wake.notify_all();
    }

    /// Number of threads currently blocked in `sleep`.
    pub fn parked(&self) -> usize {
        self.inner.state.lock().sleepers.len()
    }

    /// Earliest wake deadline among parked threads, if any.
    pub fn next_wake(&self) -> Option<u64> {
        self.inner.state.lock().sleepers.iter().min().copied()
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        self.inner.state.lock().now
    }

    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        let mut state = self.inner.state.lock();
        let deadline = state.now.saturating_add(nanos(d));
        state.sleepers.push(deadline);
        while state.now < deadline {
            self.inner.wake.wait(&mut state);
        }
        if let Some(pos) = state.sleepers.iter().position(|&s| s == deadline) {
            let _ = state.sleepers.swap_remove(pos);
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
