use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const BURST_THRESHOLD: usize = 20;
pub const BURST_WINDOW: Duration = Duration::from_secs(60);
pub const BURST_COOLDOWN: Duration = Duration::from_secs(600);

/// Pauses log alerting after more than `threshold` alerts inside `window`.
#[derive(Debug)]
pub struct BurstGuard {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    recent: VecDeque<Instant>,
    paused_until: Option<Instant>,
}

impl Default for BurstGuard {
    fn default() -> Self {
        Self::new(BURST_THRESHOLD, BURST_WINDOW, BURST_COOLDOWN)
    }
}

impl BurstGuard {
    pub fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold,
            window,
            cooldown,
            recent: VecDeque::new(),
            paused_until: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Records one alert. Returns the number of alerts in the window when
    /// this alert trips the guard, `None` otherwise.
    pub fn record(&mut self, now: Instant) -> Option<usize> {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);

        if self.paused_until.is_some() || self.recent.len() <= self.threshold {
            return None;
        }
        let count = self.recent.len();
        self.recent.clear();
        self.paused_until = Some(now + self.cooldown);
        Some(count)
    }

    /// True while the cooldown runs; the pause lifts itself once it has passed.
    pub fn is_paused(&mut self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.paused_until = None;
                false
            }
            None => false,
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.paused_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}
