//! Retry backoff policies for step execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay between retry attempts.
pub const DEFAULT_BASE_DELAY_MS: i64 = 1_000;

/// Delay schedule applied between execution attempts of a single task
/// delivery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// No delay between retries (immediate retry)
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: i64 },
    /// Quadratic backoff: delay = base_delay_ms * attempt_number^2
    Quadratic { base_delay_ms: i64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Quadratic {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffPolicy::None => "none",
            BackoffPolicy::Linear { .. } => "linear",
            BackoffPolicy::Quadratic { .. } => "quadratic",
        }
    }

    pub fn base_delay_ms(&self) -> i64 {
        match self {
            BackoffPolicy::None => 0,
            BackoffPolicy::Linear { base_delay_ms } => *base_delay_ms,
            BackoffPolicy::Quadratic { base_delay_ms } => *base_delay_ms,
        }
    }

    /// Delay in milliseconds before the retry following `attempt_number`.
    pub fn delay_ms(&self, attempt_number: i32) -> i64 {
        if attempt_number <= 0 {
            return 0;
        }
        match self {
            BackoffPolicy::None => 0,
            BackoffPolicy::Linear { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                base_delay_ms.saturating_mul(attempt_number as i64)
            }
            BackoffPolicy::Quadratic { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                let attempt = attempt_number as i64;
                base_delay_ms.saturating_mul(attempt.saturating_mul(attempt))
            }
        }
    }

    pub fn delay(&self, attempt_number: i32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt_number).max(0) as u64)
    }
}
