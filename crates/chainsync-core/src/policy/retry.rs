//! Fixed-delay retry budget for the request at the head of a queue.

use std::time::Duration;

/// Configuration for the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of transmissions of one request, the first included.
    pub max_transmissions: u32,
    /// Delay before a request is sent again.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transmissions: 10,
            delay: Duration::from_millis(1_000),
        }
    }
}

/// Counts physical transmissions of the current head request.
///
/// The counter resets whenever the head is answered, so the budget applies
/// to one logical request at a time.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    transmissions: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            transmissions: 0,
        }
    }

    /// Record a transmission. Returns `false`, leaving the counter untouched,
    /// if it would exceed the budget.
    pub fn try_transmit(&mut self) -> bool {
        if self.transmissions >= self.config.max_transmissions {
            return false;
        }
        self.transmissions += 1;
        true
    }

    /// Transmissions made so far for the current head.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    /// `true` once the current head has been sent more than once.
    pub fn is_retry(&self) -> bool {
        self.transmissions > 1
    }

    pub fn reset(&mut self) {
        self.transmissions = 0;
    }

    pub fn delay(&self) -> Duration {
        self.config.delay
    }
}
