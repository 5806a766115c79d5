//! # Configuration Module
//!
//! Top-level configuration for one load balancer, embedding the component
//! configs that live next to their components (`CircuitBreakerConfig` in
//! `core::circuit_breaker`, `HealthCheckConfig` in `health::checker`,
//! `AutoScalerConfig` in `discovery::autoscaler`).
//!
//! Configs deserialize from YAML with `humantime` durations ("30s", "5m") and
//! are validated before a balancer is constructed from them.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::balancer::strategies::Algorithm;
use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::health::checker::HealthCheckConfig;

/// Configuration for a single load balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Logical service name this balancer fronts
    pub service_name: String,

    /// Selection algorithm, fixed at construction
    pub algorithm: Algorithm,

    /// Health probing configuration
    pub health_check: HealthCheckConfig,

    /// Per-instance circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,

    /// Capacity of the bounded request history ring (diagnostics only)
    pub request_history_size: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            algorithm: Algorithm::HealthAware,
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            request_history_size: 1024,
        }
    }
}

impl BalancerConfig {
    /// Config for a named service with everything else at defaults
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Load and validate a config from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> BalancerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BalancerResult<()> {
        if self.service_name.is_empty() {
            return Err(BalancerError::config("service_name must not be empty"));
        }
        if self.request_history_size == 0 {
            return Err(BalancerError::config(
                "request_history_size must be at least 1",
            ));
        }
        self.health_check.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = BalancerConfig::default();
        assert_eq!(config.algorithm, Algorithm::HealthAware);
        assert_eq!(config.request_history_size, 1024);
        assert_eq!(config.health_check.interval, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
service_name: transcode
algorithm: round_robin
health_check:
  endpoint: /healthz
  interval: 10s
  timeout: 2s
circuit_breaker:
  failure_threshold: 3
  recovery_timeout: 15s
"#;
        let config: BalancerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.service_name, "transcode");
        assert_eq!(config.algorithm, Algorithm::RoundRobin);
        assert_eq!(config.health_check.endpoint, "/healthz");
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(
            config.circuit_breaker.recovery_timeout,
            Duration::from_secs(15)
        );
        // Unspecified sections keep their defaults
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_algorithm_rejected() {
        let yaml = "service_name: transcode\nalgorithm: best_effort\n";
        assert!(serde_yaml::from_str::<BalancerConfig>(yaml).is_err());
    }

    #[test]
    fn test_empty_service_name_rejected() {
        let config = BalancerConfig {
            service_name: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
