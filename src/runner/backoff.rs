//! Linear-with-jitter backoff for the HTTP script runner (§4.C): same
//! sleep-then-retry structure as `control::backoff::ExponentialBackoff`,
//! different formula.

use std::time::Duration;

use rand::Rng;

/// `wait_n = n * base + U[0, base)`, per §4.C. `attempt` is 1-based (the
/// wait computed *before* attempt `attempt + 1`).
pub fn linear_jitter(attempt: u32, base: Duration) -> Duration {
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let jitter = base.mul_f64(jitter_fraction);
    base.saturating_mul(attempt) + jitter
}

/// Reduces a computed wait by time already spent inside the attempt that
/// just failed, since attempts typically time out near `scriptTimeout`
/// rather than failing instantly.
pub fn reduced_by_elapsed(wait: Duration, elapsed_in_attempt: Duration) -> Duration {
    wait.saturating_sub(elapsed_in_attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_grows_linearly_with_attempt() {
        let base = Duration::from_millis(100);
        for attempt in 1..=5 {
            let wait = linear_jitter(attempt, base);
            let floor = base.saturating_mul(attempt);
            let ceiling = floor + base;
            assert!(wait >= floor && wait < ceiling, "attempt {attempt}: {wait:?} not in [{floor:?}, {ceiling:?})");
        }
    }

    #[test]
    fn elapsed_time_reduces_wait() {
        let wait = Duration::from_millis(500);
        let reduced = reduced_by_elapsed(wait, Duration::from_millis(300));
        assert_eq!(reduced, Duration::from_millis(200));
    }

    #[test]
    fn elapsed_time_cannot_make_wait_negative() {
        let wait = Duration::from_millis(100);
        let reduced = reduced_by_elapsed(wait, Duration::from_millis(300));
        assert_eq!(reduced, Duration::ZERO);
    }
}
