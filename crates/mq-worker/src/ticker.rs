use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Spaces loop iterations at least `period` apart, measured from the start
/// of the previous iteration, so a long build does not add an idle period
/// on top of itself.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time left until the next tick may start.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn mark_at(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Sleeps until the next tick is due. Returns false when `shutdown` was
    /// raised while waiting.
    pub fn wait(&mut self, shutdown: &AtomicBool) -> bool {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let remaining = self.remaining_at(Instant::now());
            if remaining.is_zero() {
                self.mark_at(Instant::now());
                return true;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_immediate_and_later_ones_are_spaced() {
        let mut ticker = Ticker::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(ticker.remaining_at(start), Duration::ZERO);

        ticker.mark_at(start);
        assert_eq!(ticker.remaining_at(start + Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(ticker.remaining_at(start + Duration::from_secs(25)), Duration::ZERO);
    }

    #[test]
    fn wait_stops_on_shutdown() {
        let mut ticker = Ticker::new(Duration::from_secs(60));
        let shutdown = AtomicBool::new(false);
        assert!(ticker.wait(&shutdown));

        shutdown.store(true, Ordering::Relaxed);
        let started = Instant::now();
        assert!(!ticker.wait(&shutdown));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
