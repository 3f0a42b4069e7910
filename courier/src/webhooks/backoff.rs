//! Exponential backoff between delivery attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay before the next attempt: `base * factor^attempts`, capped at `max`.
///
/// The defaults give `2^attempts` minutes with a one hour ceiling:
/// 2m, 4m, 8m, 16m, 32m, then 60m from the sixth attempt on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffPolicy {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    pub factor: u32,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            factor: 2,
            max: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the attempt numbered `attempts` (1-based) has failed.
    pub fn delay(&self, attempts: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let exponential = base_ms.saturating_mul(u64::from(self.factor).saturating_pow(attempts));
        Duration::from_millis(exponential.min(max_ms))
    }
}

/// Delay with the default policy.
pub fn backoff(attempts: u32) -> Duration {
    BackoffPolicy::default().delay(attempts)
}
