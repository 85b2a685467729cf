//! Time sources for the poller and the controller state machines.
//!
//! Production code runs on [`SystemClock`]; tests drive [`ManualClock`] so that
//! cooldown deadlines, purge timeouts and loop pacing advance deterministically.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Wall clock time used to stamp published readings.
    fn wall_time(&self) -> SystemTime;

    /// Pause the caller; returns early once `stop` is raised.
    fn sleep(&self, duration: Duration, stop: &StopSignal);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) {
        stop.wait_timeout(duration);
    }
}

/// Virtual clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    epoch: SystemTime,
    elapsed: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            epoch: SystemTime::UNIX_EPOCH,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        *elapsed += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall_time(&self) -> SystemTime {
        self.epoch + self.elapsed()
    }

    fn sleep(&self, duration: Duration, _stop: &StopSignal) {
        self.advance(duration);
    }
}

/// Cooperative stop request shared between the poller and its owner.
#[derive(Debug, Default)]
pub struct StopSignal {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for up to `timeout`; returns whether the stop was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let (raised, _) = self
            .wake
            .wait_timeout_while(raised, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *raised
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Clock, ManualClock, StopSignal};

    #[test]
    fn manual_clock_moves_only_on_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        clock.sleep(Duration::from_secs(1), &StopSignal::new());
        assert_eq!(clock.elapsed(), Duration::from_millis(1_250));
    }

    #[test]
    fn raised_stop_wakes_sleepers_early() {
        let stop = Arc::new(StopSignal::new());
        let waiter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = stop.wait_timeout(Duration::from_secs(10));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        stop.raise();
        let (stopped, waited) = waiter.join().expect("waiter should finish");
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
        assert!(stop.is_raised());
    }

    #[test]
    fn unraised_wait_times_out() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(5)));
    }
}
