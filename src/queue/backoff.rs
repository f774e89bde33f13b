//! Exponential backoff with jitter for group-queue retries.
//!
//! Doubling pattern grounded on
//! `examples/other_examples/22d51a37_kojira-localgpt__src-discord-mod.rs.rs`'s
//! `backoff_secs = (backoff_secs * 2).min(max_backoff)` reconnect loop,
//! adapted to a fixed `MAX_RETRIES` ceiling (no open-ended cap) and explicit
//! `±20%` jitter.

use rand::Rng as _;
use std::time::Duration;

/// Nominal delay for `attempt` (1-indexed): `base * 2^(attempt-1)`.
pub fn nominal_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
}

/// Nominal delay with jitter in `[0.8x, 1.2x]`.
pub fn jittered_delay(attempt: u32, base: Duration) -> Duration {
    let nominal = nominal_delay(attempt, base);
    let factor = rand::rng().random_range(0.8..=1.2);
    Duration::from_secs_f64(nominal.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_delay_doubles_each_attempt() {
        let base = Duration::from_secs(5);
        assert_eq!(nominal_delay(1, base), Duration::from_secs(5));
        assert_eq!(nominal_delay(2, base), Duration::from_secs(10));
        assert_eq!(nominal_delay(3, base), Duration::from_secs(20));
        assert_eq!(nominal_delay(4, base), Duration::from_secs(40));
        assert_eq!(nominal_delay(5, base), Duration::from_secs(80));
    }

    #[test]
    fn jittered_delay_stays_within_20_percent() {
        let base = Duration::from_secs(5);
        for attempt in 1..=5 {
            let nominal = nominal_delay(attempt, base).as_secs_f64();
            for _ in 0..50 {
                let delay = jittered_delay(attempt, base).as_secs_f64();
                assert!(delay >= nominal * 0.8 - 1e-6);
                assert!(delay <= nominal * 1.2 + 1e-6);
            }
        }
    }
}
