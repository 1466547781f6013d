use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay, as a fraction of the base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);

/// Applies +/- `RANDOM_FACTOR` jitter to `base`, never going below zero.
pub fn jittered_delay<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let base_millis = base.as_millis() as f64;
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    let value = (base_millis + jitter).round().max(0.0);
    Duration::from_millis(value as u64)
}

/// Exponential backoff with jitter.
///
/// The first attempt after a reset happens immediately. Every following
/// attempt waits for the current base delay (jittered), then the base grows by
/// `factor` up to `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    factor: f64,
    max_delay: Duration,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            factor,
            max_delay,
            current_base: Duration::ZERO,
        }
    }

    /// Resets the delay so the next attempt runs without waiting.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait for the maximum delay. Used when the
    /// backend reports that it is overloaded.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered_delay(self.current_base, rng);
        let grown = self.current_base.mul_f64(self.factor);
        self.current_base = grown.clamp(self.initial_delay, self.max_delay);
        delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn delays_grow_and_stay_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1_000),
        );
        backoff.next_delay_with_rng(&mut rng);
        let mut expected_base = 100u64;
        for _ in 0..6 {
            let delay = backoff.next_delay_with_rng(&mut rng).as_millis() as u64;
            assert!(delay >= expected_base / 2, "{delay} below {expected_base}/2");
            assert!(delay <= expected_base + expected_base / 2);
            expected_base = (expected_base * 2).min(1_000);
        }
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
    }

    #[test]
    fn reset_and_reset_to_max() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay_with_rng(&mut rng);
        backoff.next_delay_with_rng(&mut rng);
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);

        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= DEFAULT_MAX_DELAY / 2);
        assert!(delay <= DEFAULT_MAX_DELAY.mul_f64(1.5));
    }
}
