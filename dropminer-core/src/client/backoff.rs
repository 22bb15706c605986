//! Exponential backoff with jitter, shared by the request client and the
//! shard reconnect loop.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    maximum: Duration,
    base: f64,
    /// Fractional spread applied around each step, e.g. 0.1 for ±10%.
    variance: f64,
    steps: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, maximum: Duration) -> Self {
        Self {
            initial,
            maximum,
            base: 2.0,
            variance: 0.1,
            steps: 0,
        }
    }

    pub fn with_variance(mut self, variance: f64) -> Self {
        self.variance = variance.clamp(0.0, 1.0);
        self
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn reset(&mut self) {
        self.steps = 0;
    }

    /// Un-jittered delay for a given step, capped at the maximum.
    pub fn delay_for(&self, step: u32) -> Duration {
        let factor = self.base.powi(step.min(30) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.maximum.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.delay_for(self.steps);
        self.steps = self.steps.saturating_add(1);
        if self.variance == 0.0 {
            return nominal;
        }
        let spread = rand::rng().random_range(-self.variance..=self.variance);
        let secs = (nominal.as_secs_f64() * (1.0 + spread)).min(self.maximum.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10)).with_variance(0.0);
        let delays: Vec<_> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_variance() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(100));
        for _ in 0..50 {
            b.reset();
            let d = b.next_delay().as_secs_f64();
            assert!((3.59..=4.41).contains(&d), "delay {d} out of range");
        }
    }
}
