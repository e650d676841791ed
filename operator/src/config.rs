use std::time::Duration;

use crate::{error::Result, Error};

/// Tunables of the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of keys reconciled in parallel.
    pub workers: usize,
    /// First retry delay of a failing key.
    pub backoff_base: Duration,
    /// Upper bound of the retry delay.
    pub backoff_max: Duration,
    /// Notifications buffered between the informers and the event handler.
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            event_buffer: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::InvalidConfig("backoff base must be positive".into()));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::InvalidConfig(
                "backoff max must not be below backoff base".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig("event buffer must hold at least one event".into()));
        }
        Ok(())
    }
}
