//! Capped exponential backoff shared by block retries and transient
//! backend failures.

use std::time::Duration;

/// Delay before retry number `n` (1-based): `base * 2^(n-1)`, capped at `max`.
///
/// `n == 0` yields zero.
pub fn exponential_delay(base: Duration, max: Duration, n: u32) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(n - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// [`exponential_delay`] in whole seconds, rounded up so a sub-second base
/// still defers to the next second.
pub fn exponential_delay_secs(base: Duration, max: Duration, n: u32) -> u64 {
    let delay = exponential_delay(base, max, n);
    delay.as_secs() + u64::from(delay.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (1..=5).map(|n| exponential_delay(base, max, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn huge_exponent_saturates() {
        let max = Duration::from_secs(300);
        assert_eq!(exponential_delay(Duration::from_secs(1), max, 200), max);
        assert_eq!(exponential_delay(Duration::from_secs(1), max, 0), Duration::ZERO);
    }

    #[test]
    fn secs_round_up() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(60);
        assert_eq!(exponential_delay_secs(base, max, 1), 1);
        assert_eq!(exponential_delay_secs(base, max, 2), 1);
        assert_eq!(exponential_delay_secs(base, max, 3), 2);
    }
}
