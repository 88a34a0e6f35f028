//! Retry delay calculation.

use crate::config::RetryConfig;
use crate::job::JobKind;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Fraction of the delay that jitter may add or remove.
pub const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff policy.
///
/// `delay(attempt) = min(base_delay_ms * backoff_multiplier^attempt, max_delay_ms)`
/// with a zero-based `attempt`: attempt 0 is the delay after the first failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub backoff_multiplier: f64,

    /// Add uniform jitter of ±10%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a policy from the global retry settings.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay for `attempt` before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt`, jittered when enabled.
    ///
    /// The jittered value is clamped to `max_delay_ms` again, so a capped
    /// delay only ever jitters downwards.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        let jittered = (delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}

/// Retry policies resolved per job kind.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    default: RetryPolicy,
    per_kind: HashMap<JobKind, RetryPolicy>,
}

impl RetryPolicies {
    /// Resolves the global policy and any per-kind overrides.
    ///
    /// Override entries naming unknown kinds are ignored; config validation reports them.
    pub fn from_config(config: &RetryConfig) -> Self {
        let default = RetryPolicy::from_config(config);
        let per_kind = config
            .kinds
            .iter()
            .filter_map(|(name, overrides)| {
                let kind = name.parse::<JobKind>().ok()?;
                let policy = RetryPolicy {
                    base_delay_ms: overrides.base_delay_ms.unwrap_or(default.base_delay_ms),
                    max_delay_ms: overrides.max_delay_ms.unwrap_or(default.max_delay_ms),
                    backoff_multiplier: overrides
                        .backoff_multiplier
                        .unwrap_or(default.backoff_multiplier),
                    jitter: overrides.jitter.unwrap_or(default.jitter),
                };
                Some((kind, policy))
            })
            .collect();

        Self { default, per_kind }
    }

    /// Returns the policy for `kind`.
    pub fn for_kind(&self, kind: JobKind) -> &RetryPolicy {
        self.per_kind.get(&kind).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryOverride;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_deterministic_without_jitter() {
        let policy = policy();
        for attempt in 0..20 {
            let first = policy.delay_for_attempt(attempt);
            for _ in 0..5 {
                assert_eq!(policy.delay_for_attempt(attempt), first);
            }
        }
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy {
            max_delay_ms: 10_000,
            ..policy()
        };

        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };

        let samples: Vec<u128> = (0..200).map(|_| policy.delay_for_attempt(2).as_millis()).collect();
        assert!(samples.iter().all(|d| (3600..=4400).contains(d)));

        let first = samples[0];
        assert!(samples.iter().any(|d| *d != first));
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy {
            max_delay_ms: 10_000,
            jitter: true,
            ..policy()
        };

        let samples: Vec<u128> = (0..200).map(|_| policy.delay_for_attempt(10).as_millis()).collect();
        assert!(samples.iter().all(|d| (9000..=10_000).contains(d)));
        assert!(samples.iter().any(|d| *d < 10_000));
    }

    #[test]
    fn test_per_kind_override() {
        let mut config = RetryConfig::default();
        config.jitter = false;
        config.kinds.insert(
            JobKind::ReminderProcessing.as_str().to_string(),
            RetryOverride {
                base_delay_ms: Some(250),
                ..Default::default()
            },
        );
        let policies = RetryPolicies::from_config(&config);

        assert_eq!(
            policies.for_kind(JobKind::ReminderProcessing).delay_for_attempt(1),
            Duration::from_millis(500)
        );
        assert_eq!(
            policies.for_kind(JobKind::WebhookProcessing).delay_for_attempt(1),
            Duration::from_millis(2000)
        );
    }
}
