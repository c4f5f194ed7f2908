//! Event rate over fixed ticks

use std::time::Instant;

/// Shortest interval a tick divides by, in seconds
const MIN_ELAPSED_S: f64 = 1e-3;

/// Events per second between consecutive ticks
#[derive(Debug, Clone)]
pub struct RateMeter {
    baseline: Instant,
    last_count: u64,
    rate: f64,
    ticks: u64,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            baseline: now,
            last_count: 0,
            rate: 0.0,
            ticks: 0,
        }
    }

    /// Close the current window at `now` with `count` total events
    pub fn tick(&mut self, now: Instant, count: u64) -> f64 {
        let elapsed = now
            .saturating_duration_since(self.baseline)
            .as_secs_f64()
            .max(MIN_ELAPSED_S);
        self.rate = count.saturating_sub(self.last_count) as f64 / elapsed;
        self.baseline = now;
        self.last_count = count;
        self.ticks += 1;
        self.rate
    }

    /// Start a fresh window without publishing a rate
    pub fn restart(&mut self, now: Instant, count: u64) {
        self.baseline = now;
        self.last_count = count;
    }

    /// Clear everything, including the tick count
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    /// Rate published by the last tick
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Ticks since creation or reset
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    #[test]
    fn test_rate_over_one_second() {
        let t0 = Instant::now();
        let mut meter = RateMeter::new(t0);
        let rate = meter.tick(t0 + Duration::from_secs(1), 4);
        assert_abs_diff_eq!(rate, 4.0, epsilon = 1e-9);
        assert_eq!(meter.ticks(), 1);

        // Only the delta counts
        let rate = meter.tick(t0 + Duration::from_secs(3), 10);
        assert_abs_diff_eq!(rate, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_elapsed_is_guarded() {
        let t0 = Instant::now();
        let mut meter = RateMeter::new(t0);
        let rate = meter.tick(t0, 1);
        assert_abs_diff_eq!(rate, 1000.0, epsilon = 1e-6);
    }

    #[test]
    fn test_restart_moves_baseline() {
        let t0 = Instant::now();
        let mut meter = RateMeter::new(t0);
        meter.restart(t0 + Duration::from_secs(5), 100);
        let rate = meter.tick(t0 + Duration::from_secs(6), 102);
        assert_abs_diff_eq!(rate, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_count_going_backwards_reads_zero() {
        let t0 = Instant::now();
        let mut meter = RateMeter::new(t0);
        meter.tick(t0 + Duration::from_secs(1), 50);
        let rate = meter.tick(t0 + Duration::from_secs(2), 0);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_reset() {
        let t0 = Instant::now();
        let mut meter = RateMeter::new(t0);
        meter.tick(t0 + Duration::from_secs(1), 5);
        meter.reset(t0 + Duration::from_secs(1));
        assert_eq!(meter.rate(), 0.0);
        assert_eq!(meter.ticks(), 0);
    }
}
