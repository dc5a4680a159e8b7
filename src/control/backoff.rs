//! Exponential reconnect backoff for the control-stream and changes loops
//! (§4.G/§4.H). Distinct formula from `runner::backoff`'s linear+jitter: this
//! one grows multiplicatively and resets on a clean reconnect, the same
//! `current_backoff = current_backoff * factor` step `retry::RetryExecutor`
//! uses for step retries, generalized into a reusable `BackoffState`.

use std::time::Duration;

use crate::model::BackoffState;

pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }
}

impl BackoffState for ExponentialBackoff {
    fn next(&mut self) -> Duration {
        let wait = self.current;
        let scaled = self.current.as_secs_f64() * self.factor;
        self.current = Duration::from_secs_f64(scaled).min(self.max);
        wait
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_multiplicatively_and_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2), 2.0);
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(2));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2), 2.0);
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }
}
