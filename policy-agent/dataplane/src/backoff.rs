use rand::Rng;
use std::time::Duration;

/// Exponential backoff between failed applies.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,

    /// The fraction of each delay that is randomized.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// The delay before the given retry, starting at 1.
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .min
            .saturating_mul(1u32 << exp)
            .min(self.max);
        if self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0) * rng.gen_range(-1.0..=1.0);
        base.mul_f64(1.0 + jitter).min(self.max)
    }
}
