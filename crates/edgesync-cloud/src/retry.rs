use std::time::Duration;

use rand::Rng;

/// Attempts beyond this no longer grow the exponent; callers cap their
/// error counters here to bound the delay.
pub const MAX_BACKOFF_ATTEMPT: u32 = 10;

/// Backoff parameters used by the poll and report loops.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            multiplier: 2.0,
            cap: Duration::from_secs(15 * 60),
            jitter_ratio: 0.3,
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_with_jitter(attempt, self.base, self.multiplier, self.cap, self.jitter_ratio)
    }
}

/// Jittered exponential backoff: `min(cap, base * multiplier^(attempt-1))`
/// scaled by a uniform factor in `[1-jitter, 1+jitter]`.
pub fn backoff_with_jitter(
    attempt: u32, base: Duration, multiplier: f64, cap: Duration, jitter_ratio: f64,
) -> Duration {
    let attempt = attempt.clamp(1, MAX_BACKOFF_ATTEMPT);
    let exponent = (attempt - 1) as i32;
    let raw = base.as_secs_f64() * multiplier.powi(exponent);
    let capped = raw.min(cap.as_secs_f64());

    let jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
    let factor = if jitter_ratio > 0.0 {
        rand::thread_rng().gen_range(1.0 - jitter_ratio..=1.0 + jitter_ratio)
    } else {
        1.0
    };

    Duration::from_secs_f64(capped * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_jitter_is_deterministic() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(900);

        assert_eq!(
            backoff_with_jitter(1, base, 2.0, cap, 0.0),
            Duration::from_secs(15)
        );
        assert_eq!(
            backoff_with_jitter(3, base, 2.0, cap, 0.0),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_cap_bounds_growth() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(900);

        assert_eq!(
            backoff_with_jitter(10, base, 2.0, cap, 0.0),
            cap,
            "15s * 2^9 exceeds the cap and must clamp to it"
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(900);

        for attempt in 1..=10 {
            let expected = (base.as_secs_f64() * 2.0_f64.powi(attempt as i32 - 1))
                .min(cap.as_secs_f64());
            for _ in 0..50 {
                let delay = backoff_with_jitter(attempt, base, 2.0, cap, 0.3).as_secs_f64();
                assert!(
                    delay >= expected * 0.7 - 1e-6 && delay <= expected * 1.3 + 1e-6,
                    "attempt {attempt}: delay {delay} outside [{}, {}]",
                    expected * 0.7,
                    expected * 1.3
                );
            }
        }
    }

    #[test]
    fn test_attempt_is_clamped() {
        let base = Duration::from_secs(15);
        let cap = Duration::from_secs(900);

        assert_eq!(
            backoff_with_jitter(0, base, 2.0, cap, 0.0),
            Duration::from_secs(15),
            "attempt 0 behaves like attempt 1"
        );
        assert_eq!(
            backoff_with_jitter(100, base, 2.0, cap, 0.0),
            backoff_with_jitter(MAX_BACKOFF_ATTEMPT, base, 2.0, cap, 0.0)
        );
    }
}
