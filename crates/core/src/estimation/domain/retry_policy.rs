use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for transient estimation failures.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 250,
            multiplier: 2.0,
            max_backoff_ms: 4000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 250)]
    #[case(1, 500)]
    #[case(2, 1000)]
    #[case(4, 4000)]
    #[case(10, 4000)]
    fn test_default_backoff(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(
            RetryPolicy::default().backoff(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_backoff_ms, 250);
    }
}
