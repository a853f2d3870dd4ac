// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Tunables of the node and the state manager.

use std::time::Duration;

/// Exponential backoff between retries, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// # Panics
    ///
    /// If `multiplier` is below 1 or not finite.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        assert!(
            multiplier.is_finite() && multiplier >= 1.0,
            "backoff multiplier must be at least 1"
        );
        self.multiplier = multiplier;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_delay.min(self.max_delay),
        }
    }
}

/// The delays of one run of retries under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    /// The delay to wait before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        // Float to int casts saturate.
        let next = Duration::from_nanos((delay.as_nanos() as f64 * self.policy.multiplier) as u64);
        self.current = next.min(self.policy.max_delay);
        delay
    }

    /// Starts over from the initial delay, typically after a success.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay.min(self.policy.max_delay);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Configuration of an [`OtNodeImpl`](crate::OtNodeImpl).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NodeConfig {
    /// Backoff between long-poll checks that see no new heads.
    pub poll_retry: RetryPolicy,
}

impl NodeConfig {
    pub fn with_poll_retry(mut self, policy: RetryPolicy) -> Self {
        self.poll_retry = policy;
        self
    }
}

/// Configuration of a [`StateManager`](crate::StateManager).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StateManagerConfig {
    /// Backoff of the polling loop after a failed poll.
    pub poll_error_retry: RetryPolicy,
}

impl StateManagerConfig {
    pub fn with_poll_error_retry(mut self, policy: RetryPolicy) -> Self {
        self.poll_error_retry = policy;
        self
    }
}
