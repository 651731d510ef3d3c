//! Configuration for the jobs client

use crate::transport::QoS;
use std::time::Duration;

/// Configuration for a [`JobsClient`](crate::JobsClient)
#[derive(Debug, Clone)]
pub struct JobsClientConfig {
    /// Timeout for request/response operations, measured from publish
    /// completion
    pub operation_timeout: Duration,

    /// QoS used for request publishes and subscriptions
    pub qos: QoS,
}

impl JobsClientConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            qos: QoS::AtLeastOnce,
        }
    }

    /// Set the operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the QoS for publishes and subscriptions
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

impl Default for JobsClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = JobsClientConfig::new();

        assert_eq!(config.operation_timeout, Duration::from_secs(60));
        assert_eq!(config.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_config_builder_chain() {
        let config = JobsClientConfig::new()
            .operation_timeout(Duration::from_secs(5))
            .qos(QoS::AtMostOnce);

        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.qos, QoS::AtMostOnce);
    }
}
