use serde::{Deserialize, Serialize};

/// Retry, timeout, and retention settings for the message router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Total delivery attempts per message, including the first.
    pub retry_max_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub retry_base_delay_ms: u64,
    /// Cap for exponential backoff.
    pub retry_max_delay_ms: u64,
    /// Overall deadline for one message, covering attempts and backoff.
    pub message_timeout_ms: u64,
    /// Audit records kept; the oldest is evicted first.
    pub audit_capacity: usize,
    pub dead_letter_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5000,
            message_timeout_ms: 30_000,
            audit_capacity: 10_000,
            dead_letter_capacity: 10_000,
        }
    }
}

impl RouterConfig {
    /// Backoff to wait after `failed_attempts` failures: `base * 2^(n-1)`, capped.
    pub fn backoff_delay_ms(&self, failed_attempts: u32) -> u64 {
        let exp = failed_attempts.saturating_sub(1).min(32);
        self.retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.retry_max_delay_ms)
    }
}
