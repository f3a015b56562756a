//! Bus configuration
//!
//! Passed explicitly to each transport; there is no process-wide default.

use std::time::Duration;

use crate::error::{BusError, Result};

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Topic exchange events are published to
    pub exchange: String,

    /// How long a delivery stays invisible to other consumers before it is
    /// redelivered if neither acked nor nacked
    pub visibility_timeout: Duration,

    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
}

impl BusConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Self::default()
        }
    }

    /// Name of the durable queue declared for a consumer id
    ///
    /// An empty id gets a random, effectively private queue.
    pub fn queue_name(&self, consumer_id: &str) -> String {
        if consumer_id.is_empty() {
            format!("{}.{}", uuid::Uuid::new_v4(), self.exchange)
        } else {
            format!("{}.{}", consumer_id, self.exchange)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            return Err(BusError::Unavailable("exchange cannot be empty".to_string()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(BusError::Unavailable(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(BusError::Unavailable(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: "rototiller".to_string(),
            visibility_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name() {
        let config = BusConfig::new("rototiller");
        assert_eq!(config.queue_name("worker"), "worker.rototiller");

        let anonymous = config.queue_name("");
        assert!(anonymous.ends_with(".rototiller"));
        assert_ne!(anonymous, config.queue_name(""));
    }

    #[test]
    fn test_validate() {
        assert!(BusConfig::default().validate().is_ok());

        let mut config = BusConfig::default();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let config = BusConfig::new("  ");
        assert!(config.validate().is_err());
    }
}
