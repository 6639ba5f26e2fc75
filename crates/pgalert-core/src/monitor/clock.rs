use chrono::NaiveDateTime;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Slice length for interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Time source for the monitor loop.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for log file names and alert stamps.
    fn wall(&self) -> NaiveDateTime;

    fn sleep(&self, duration: Duration);
}

/// Real time. With an interrupt flag, sleeps wake up within
/// [`SLEEP_SLICE`] of the flag being set.
#[derive(Debug, Default, Clone)]
pub struct SystemClock {
    interrupt: Option<Arc<AtomicBool>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interruptible(flag: Arc<AtomicBool>) -> Self {
        Self {
            interrupt: Some(flag),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        let Some(flag) = &self.interrupt else {
            std::thread::sleep(duration);
            return;
        };
        let mut remaining = duration;
        while remaining > Duration::ZERO && !flag.load(Ordering::SeqCst) {
            let step = remaining.min(SLEEP_SLICE);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

/// Clock that only moves when slept on. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    wall_start: NaiveDateTime,
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new(wall_start: NaiveDateTime) -> Self {
        Self {
            start: Instant::now(),
            wall_start,
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn wall(&self) -> NaiveDateTime {
        let elapsed = chrono::TimeDelta::from_std(self.elapsed.get()).unwrap_or(chrono::TimeDelta::zero());
        self.wall_start + elapsed
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_on_sleep() {
        let wall = NaiveDateTime::parse_from_str("2024-03-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let clock = ManualClock::new(wall);
        let shared = clock.clone();
        let t0 = clock.now();

        shared.sleep(Duration::from_secs(90));
        assert_eq!(clock.now() - t0, Duration::from_secs(90));
        assert_eq!(clock.wall().to_string(), "2024-03-01 10:01:30");
    }

    #[test]
    fn test_system_clock_sleep_cut_short_by_interrupt() {
        let flag = Arc::new(AtomicBool::new(true));
        let clock = SystemClock::interruptible(flag);
        let started = Instant::now();
        clock.sleep(Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
