//! Reconnection policy for monitored devices.
//!
//! A device that loses its link while enabled is re-enabled after a fixed
//! delay. By default there is no attempt cap: a gateway keeps chasing a
//! sensor that wandered out of range until the sensor is disabled.

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay between a link loss and the next enable attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(600);

/// Options for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Maximum number of consecutive attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before each attempt.
    pub delay: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that never reconnect.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Set maximum number of consecutive attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the delay before each attempt.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.delay.is_zero() {
            return Err(Error::InvalidConfig(
                "reconnect delay must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
