// =============================================================================
// Reconnect policy and backoff delays
// =============================================================================
//
//   linear:      delay = min(base * (attempt + 1), max)
//   exponential: delay = min(base * 2^attempt, max)
//
// `attempt` counts scheduled reconnects since the last successful open.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum reconnect attempts; `None` retries forever.
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_enabled() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            attempts: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before reconnect number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt).saturating_add(1)),
            Backoff::Exponential => {
                let multiplier = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(multiplier)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Whether another reconnect may be scheduled after `attempt` tries.
    pub fn permits(&self, attempt: u32) -> bool {
        self.enabled && self.attempts.map_or(true, |max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(policy: &ReconnectPolicy, attempts: u32) -> Vec<u64> {
        (0..attempts).map(|n| policy.delay(n).as_millis() as u64).collect()
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
            ..ReconnectPolicy::default()
        };
        assert_eq!(
            ms(&policy, 7),
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert_eq!(policy.delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn linear_grows_by_base() {
        let policy = ReconnectPolicy {
            base_delay_ms: 500,
            max_delay_ms: 1_800,
            backoff: Backoff::Linear,
            ..ReconnectPolicy::default()
        };
        assert_eq!(ms(&policy, 5), vec![500, 1_000, 1_500, 1_800, 1_800]);
    }

    #[test]
    fn attempt_budget() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.permits(10_000));

        let limited = ReconnectPolicy {
            attempts: Some(2),
            ..ReconnectPolicy::default()
        };
        assert!(limited.permits(0));
        assert!(limited.permits(1));
        assert!(!limited.permits(2));

        assert!(!ReconnectPolicy::disabled().permits(0));
    }

    #[test]
    fn deserialises_with_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"backoff":"linear"}"#).unwrap();
        assert_eq!(policy.backoff, Backoff::Linear);
        assert_eq!(policy.base_delay_ms, 1_000);
        assert!(policy.enabled);
    }
}
