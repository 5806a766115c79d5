//! # Core Types Module
//!
//! This module defines the foundational data structures used throughout the
//! load-balancing layer: the service instance value object with its live
//! counters, the status enum, the routing hint and the event types other
//! components can subscribe to.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - `ServiceInstance` is owned exclusively by the `LoadBalancer` that
//!   registered it; callers only ever see cloned snapshots
//! - `Clone` on the instance is cheap enough for snapshotting the candidate
//!   set on every routing decision
//! - Event channels use `tokio::sync::broadcast` for multi-subscriber fan-out

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Lifecycle status of a service instance
///
/// Only `Healthy` instances are candidates for routing. `Draining` marks an
/// instance scheduled for removal: it finishes in-flight work but receives no
/// new traffic. `Maintenance` is the operator-driven equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Instance is healthy and ready to receive traffic
    Healthy,
    /// Instance is unhealthy and should not receive traffic
    Unhealthy,
    /// Instance is finishing in-flight work before removal
    Draining,
    /// Instance is administratively withheld from traffic
    Maintenance,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Healthy => write!(f, "healthy"),
            InstanceStatus::Unhealthy => write!(f, "unhealthy"),
            InstanceStatus::Draining => write!(f, "draining"),
            InstanceStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// One backend endpoint of a logical service, with its live counters
///
/// The balancer is agnostic to what the instance actually does (video
/// processing, AI inference, ...) — it only needs an address to probe and the
/// counters that feed the selection policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique, stable instance identifier
    pub id: String,

    /// Logical service this instance belongs to
    pub service: String,

    /// Host name or address
    pub host: String,

    /// Port the instance listens on
    pub port: u16,

    /// Relative weight for weighted selection (positive, default 1)
    pub weight: u32,

    /// Current lifecycle status
    pub status: InstanceStatus,

    /// Requests currently in flight against this instance
    pub current_connections: u32,

    /// Completed successful requests (monotonic)
    pub total_requests: u64,

    /// Completed failed requests (monotonic)
    pub total_failures: u64,

    /// Exponential moving average of response time, in milliseconds
    pub avg_response_time: f64,

    /// When the health checker last probed this instance
    pub last_health_check: Option<DateTime<Utc>>,

    /// Open key/value bag (e.g. `cpu_percent`) reported by the instance
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServiceInstance {
    /// Create a new instance with default weight and empty metadata
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            host: host.into(),
            port,
            weight: 1,
            status: InstanceStatus::Healthy,
            current_connections: 0,
            total_requests: 0,
            total_failures: 0,
            avg_response_time: 0.0,
            last_health_check: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the selection weight (clamped to at least 1)
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Attach metadata to the instance
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if the instance is in a routable status
    pub fn is_healthy(&self) -> bool {
        matches!(self.status, InstanceStatus::Healthy)
    }

    /// Base URL used for health probes
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Failure rate as a percentage of completed requests
    ///
    /// `total_requests` counts successes and `total_failures` counts failures,
    /// so the two together are the number of completed requests.
    pub fn failure_rate(&self) -> f64 {
        let completed = self.total_requests + self.total_failures;
        if completed == 0 {
            return 0.0;
        }
        self.total_failures as f64 / completed as f64 * 100.0
    }

    /// Composite load score combining connections, latency and failure history
    ///
    /// Lower is better. This is the scalar the health-aware policy minimizes
    /// and the auto-scaler uses to pick a drain victim.
    pub fn load_score(&self) -> f64 {
        self.current_connections as f64 * 10.0
            + self.avg_response_time / 100.0
            + self.failure_rate() * 2.0
    }

    /// Read `metadata["cpu_percent"]` as a float, if present
    pub fn cpu_percent(&self) -> Option<f64> {
        self.metadata.get("cpu_percent").and_then(|v| v.as_f64())
    }
}

/// Per-request routing hint supplied by the caller
///
/// Only the ip-hash policy consults the hint today; the struct keeps the seam
/// open for affinity keys without changing the routing signature.
#[derive(Debug, Clone, Default)]
pub struct RequestHint {
    /// Client address for affinity-based selection
    pub client_ip: Option<IpAddr>,
}

impl RequestHint {
    /// Hint carrying a client address
    pub fn from_client_ip(ip: IpAddr) -> Self {
        Self {
            client_ip: Some(ip),
        }
    }
}

/// One routed request, kept in the balancer's bounded diagnostic history
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    /// When the request was routed
    pub timestamp: DateTime<Utc>,
    /// Instance the request was routed to
    pub instance_id: String,
}

/// Events emitted by a balancer as its registry and instances change
///
/// Components can subscribe to these for monitoring or custom logic; sending
/// never blocks and lagging subscribers simply miss events.
#[derive(Debug, Clone)]
pub enum BalancerEvent {
    /// A new instance joined the registry
    InstanceRegistered { instance_id: String },

    /// An instance left the registry (its breaker is gone too)
    InstanceUnregistered { instance_id: String },

    /// The health checker or an operator changed an instance's status
    InstanceStatusChanged {
        instance_id: String,
        old_status: InstanceStatus,
        new_status: InstanceStatus,
    },

    /// The auto-scaler acted on this service
    ScalingAction {
        service: String,
        action: ScalingAction,
        instance_id: String,
    },
}

/// Scale action taken by the auto-scaler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// A new instance was registered
    ScaleUp,
    /// An instance was marked draining for later removal
    ScaleDown,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
        }
    }
}

/// Event publisher for balancer events
pub type EventPublisher = tokio::sync::broadcast::Sender<BalancerEvent>;

/// Event subscriber for receiving balancer events
pub type EventSubscriber = tokio::sync::broadcast::Receiver<BalancerEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_defaults() {
        let instance = ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080);
        assert_eq!(instance.weight, 1);
        assert_eq!(instance.status, InstanceStatus::Healthy);
        assert_eq!(instance.url(), "http://10.0.0.5:8080");
        assert_eq!(instance.current_connections, 0);
    }

    #[test]
    fn test_failure_rate_with_no_samples() {
        let instance = ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080);
        assert_eq!(instance.failure_rate(), 0.0);
    }

    #[test]
    fn test_failure_rate() {
        let mut instance = ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080);
        instance.total_requests = 75;
        instance.total_failures = 25;
        assert_eq!(instance.failure_rate(), 25.0);
    }

    #[test]
    fn test_load_score() {
        let mut instance = ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080);
        instance.current_connections = 3;
        instance.avg_response_time = 200.0;
        instance.total_requests = 90;
        instance.total_failures = 10;
        // 3*10 + 200/100 + 10%*2 = 30 + 2 + 20
        assert_eq!(instance.load_score(), 52.0);
    }

    #[test]
    fn test_cpu_percent_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("cpu_percent".to_string(), serde_json::json!(85.5));
        let instance =
            ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080).with_metadata(metadata);
        assert_eq!(instance.cpu_percent(), Some(85.5));

        let bare = ServiceInstance::new("worker-2", "transcode", "10.0.0.6", 8080);
        assert_eq!(bare.cpu_percent(), None);
    }

    #[test]
    fn test_weight_clamped_to_one() {
        let instance = ServiceInstance::new("worker-1", "transcode", "10.0.0.5", 8080).with_weight(0);
        assert_eq!(instance.weight, 1);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(InstanceStatus::Draining.to_string(), "draining");
        assert_eq!(InstanceStatus::Healthy.to_string(), "healthy");
    }
}
