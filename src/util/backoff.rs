use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::firestore::settings::BackoffSettings;

/// Exponential backoff with jitter for reconnect attempts.
///
/// The first delay after a reset is zero; afterwards the base grows by
/// `backoff_factor` from `initial_delay` up to `max_delay`, and each delay is
/// jittered by up to `jitter_factor * base` in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_rng(settings: BackoffSettings, rng: StdRng) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            rng,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next delay use the maximum base, as after a quota error.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Returns the delay to wait before the next attempt and grows the base.
    pub fn next_delay(&mut self) -> Duration {
        let base_millis = self.current_base.as_millis() as f64;
        let jitter = if base_millis > 0.0 {
            base_millis * self.settings.jitter_factor * self.rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay = Duration::from_millis((base_millis + jitter).round().max(0.0) as u64);

        let grown = self.current_base.mul_f64(self.settings.backoff_factor);
        self.current_base = grown
            .max(self.settings.initial_delay)
            .min(self.settings.max_delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(seed: u64) -> ExponentialBackoff {
        ExponentialBackoff::with_rng(BackoffSettings::default(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = backoff(7);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn delays_grow_and_stay_within_jittered_cap() {
        let settings = BackoffSettings::default();
        let ceiling = settings.max_delay.mul_f64(1.0 + settings.jitter_factor);
        let mut backoff = backoff(42);
        let mut bases = Vec::new();
        for _ in 0..40 {
            bases.push(backoff.current_base());
            assert!(backoff.next_delay() <= ceiling);
        }
        assert!(bases.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(backoff.current_base(), settings.max_delay);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let mut backoff = backoff(3);
        backoff.next_delay();
        for _ in 0..5 {
            let base = backoff.current_base().as_millis() as f64;
            let delay = backoff.next_delay().as_millis() as f64;
            assert!(delay >= base * 0.5 - 1.0 && delay <= base * 1.5 + 1.0);
        }
    }

    #[test]
    fn reset_to_max_jumps_to_cap() {
        let mut backoff = backoff(1);
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
