//! # Error Handling Module
//!
//! This module provides error handling for the balancer using the `thiserror` crate.
//! It defines all error conditions that can occur while registering instances,
//! routing requests and probing backends.
//!
//! Probe errors (`ProbeTimeout`, `ProbeConnection`) are internal to the health
//! checker: they are converted into circuit-breaker failures and status flips and
//! never surface to callers. The only error a routing caller must handle is
//! `NoHealthyInstances`, which is an operational condition, not a crash.

use thiserror::Error;

/// Main result type used throughout the balancer
///
/// This is a type alias that makes error handling more ergonomic.
/// Instead of writing `Result<T, BalancerError>` everywhere, we can use `BalancerResult<T>`.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Comprehensive error types for the load-balancing layer
///
/// Each variant represents a different category of error that can occur.
/// The `#[error("...")]` attribute from `thiserror` automatically implements
/// the `Display` trait with the specified error message.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Registration with an instance id that already exists in the registry
    #[error("Instance already registered: {instance_id}")]
    DuplicateInstance { instance_id: String },

    /// Routing attempted while the eligible set is empty
    #[error("No healthy instances available for service: {service}")]
    NoHealthyInstances { service: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Health probe exceeded its timeout budget
    #[error("Health probe for {instance_id} timed out after {timeout_ms}ms")]
    ProbeTimeout { instance_id: String, timeout_ms: u64 },

    /// Health probe could not reach the instance or got an unexpected answer
    #[error("Health probe for {instance_id} failed: {message}")]
    ProbeConnection { instance_id: String, message: String },

    /// I/O errors (config file operations, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors while probing backends
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl BalancerError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a duplicate-instance error
    pub fn duplicate<S: Into<String>>(instance_id: S) -> Self {
        Self::DuplicateInstance {
            instance_id: instance_id.into(),
        }
    }

    /// Create a no-healthy-instances error for a service
    pub fn no_healthy<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstances {
            service: service.into(),
        }
    }

    /// Check if this error should be retried
    ///
    /// Routing against an empty eligible set is transient: instances recover,
    /// breakers re-close and the auto-scaler adds capacity. Registration and
    /// configuration errors are permanent until the caller changes its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstances { .. }
                | Self::ProbeTimeout { .. }
                | Self::ProbeConnection { .. }
                | Self::HttpClient { .. }
                | Self::Io { .. }
        )
    }

    /// Check if this error should be reported to the instance's circuit breaker
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::ProbeTimeout { .. } | Self::ProbeConnection { .. } | Self::HttpClient { .. }
        )
    }

    /// Get a string representation of the error type for stats and logs
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::DuplicateInstance { .. } => "duplicate_instance",
            Self::NoHealthyInstances { .. } => "no_healthy_instances",
            Self::Configuration { .. } => "configuration_error",
            Self::ProbeTimeout { .. } => "probe_timeout",
            Self::ProbeConnection { .. } => "probe_connection_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for BalancerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for BalancerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from reqwest::Error
impl From<reqwest::Error> for BalancerError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}
