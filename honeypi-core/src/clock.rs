//! Time management for the weight pipeline
//!
//! Blocking points of the pipeline (initialisation backoff, lock polling,
//! the maintenance watchdog) go through a [`Clock`] so they can be driven
//! instantly in tests:
//! - [`SystemClock`] uses wall-clock time and real sleeps
//! - [`ManualClock`] only moves when told to, and `sleep` advances it

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Source of time and blocking sleeps
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> SystemTime;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);

    /// Time elapsed since `earlier`, zero if the clock went backwards
    fn elapsed_since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or_default()
    }
}

/// Real time source backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests and simulations
///
/// `sleep` never blocks; it advances the clock by the requested duration and
/// records it, so a test can assert how long the code *would* have waited.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: SystemTime,
    slept: Duration,
    sleeps: usize,
}

impl ManualClock {
    /// Clock frozen at `start`
    pub fn new(start: SystemTime) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                slept: Duration::ZERO,
                sleeps: 0,
            }),
        }
    }

    /// Clock frozen at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(SystemTime::now())
    }

    /// Jump forward without counting it as a sleep
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += duration;
    }

    /// Total time spent in `sleep`
    pub fn total_slept(&self) -> Duration {
        self.lock().slept
    }

    /// Number of `sleep` calls
    pub fn sleep_count(&self) -> usize {
        self.lock().sleeps
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A panicking test thread must not hide the clock from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += duration;
        state.slept += duration;
        state.sleeps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(1));
        clock.sleep(Duration::from_secs(1));
        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now(), start + Duration::from_secs(12));
        assert_eq!(clock.total_slept(), Duration::from_secs(2));
        assert_eq!(clock.sleep_count(), 2);
    }

    #[test]
    fn elapsed_never_negative() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(5));
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(50);
        assert_eq!(clock.elapsed_since(later), Duration::ZERO);
        assert_eq!(
            clock.elapsed_since(SystemTime::UNIX_EPOCH),
            Duration::from_secs(5)
        );
    }
}
