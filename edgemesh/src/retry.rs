use serde::{Deserialize, Serialize};

/// Backoff tuning for failed attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds for exponential backoff. Floor 1.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds. Floored to the base delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Proportional jitter added on top of the exponential delay,
    /// clamped to [0, 0.5].
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Outcome of the retry decision for a failed or timed-out attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
    pub to_dlq: bool,
}

/// Decide whether a failed attempt is retried or dead-lettered.
///
/// Exponential backoff: `min(max_delay, base * 2^(attempt-1))` plus a
/// proportional jitter term. Once `attempt` reaches `max_attempts` the
/// task goes to the dead-letter queue instead.
pub fn compute_retry_decision(attempt: u32, max_attempts: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= max_attempts {
        return RetryDecision {
            retry: false,
            delay_ms: 0,
            to_dlq: true,
        };
    }

    let base = config.base_delay_ms.max(1);
    let ceiling = config.max_delay_ms.max(base);
    let exp_pow = attempt.saturating_sub(1).min(32) as i32;
    let scaled = (base as f64) * 2f64.powi(exp_pow);
    let exp = scaled.min(ceiling as f64);

    let jitter_ratio = config.jitter_ratio.clamp(0.0, 0.5);
    let jitter = (exp * jitter_ratio).round();

    RetryDecision {
        retry: true,
        delay_ms: (exp + jitter) as u64,
        to_dlq: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base: u64, ceiling: u64) -> RetryConfig {
        RetryConfig {
            base_delay_ms: base,
            max_delay_ms: ceiling,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = no_jitter(250, 10_000);

        assert_eq!(compute_retry_decision(1, 5, &config).delay_ms, 250);
        assert_eq!(compute_retry_decision(2, 5, &config).delay_ms, 500);
        assert_eq!(compute_retry_decision(3, 5, &config).delay_ms, 1000);
        assert_eq!(compute_retry_decision(4, 5, &config).delay_ms, 2000);
    }

    #[test]
    fn delay_is_capped_at_ceiling() {
        let config = no_jitter(1000, 5000);
        let decision = compute_retry_decision(10, 20, &config);
        assert!(decision.retry);
        assert_eq!(decision.delay_ms, 5000);
    }

    #[test]
    fn exhausted_attempts_go_to_dlq() {
        let config = RetryConfig::default();

        let decision = compute_retry_decision(3, 3, &config);
        assert_eq!(
            decision,
            RetryDecision {
                retry: false,
                delay_ms: 0,
                to_dlq: true
            }
        );

        let decision = compute_retry_decision(4, 3, &config);
        assert!(decision.to_dlq);
    }

    #[test]
    fn delay_is_monotone_without_jitter() {
        let config = no_jitter(250, 10_000);
        let max_attempts = 12;
        let mut prev = 0;
        for attempt in 1..max_attempts {
            let decision = compute_retry_decision(attempt, max_attempts, &config);
            assert!(decision.retry);
            assert!(decision.delay_ms >= prev, "attempt {attempt} regressed");
            prev = decision.delay_ms;
        }
    }

    #[test]
    fn jitter_is_proportional_and_clamped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_ratio: 0.1,
        };
        assert_eq!(compute_retry_decision(1, 3, &config).delay_ms, 1100);

        // Out-of-range ratios clamp to 0.5.
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_ratio: 3.0,
        };
        assert_eq!(compute_retry_decision(1, 3, &config).delay_ms, 1500);
    }

    #[test]
    fn zero_base_is_floored() {
        let config = no_jitter(0, 0);
        let decision = compute_retry_decision(1, 3, &config);
        assert_eq!(decision.delay_ms, 1);
    }
}
