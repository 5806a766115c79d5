//! # Service Balancer Library
//!
//! A service load-balancing and resilience layer: register interchangeable
//! backend instances of a logical service, route each request under a
//! pluggable selection policy, isolate failing instances behind per-instance
//! circuit breakers, probe instance health in the background and drive
//! scale-up/scale-down of the pool.
//!
//! The balancer is agnostic to what an instance actually does. Callers ask
//! [`LoadBalancer::route_request`] for an instance, perform the real work
//! out-of-band and report the outcome back via
//! [`LoadBalancer::record_response`]; everything else (probing, breaker
//! transitions, scaling) happens in background tasks with an explicit
//! start/stop lifecycle.
//!
//! ```no_run
//! use service_balancer::{BalancerConfig, LoadBalancer, RequestHint};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> service_balancer::BalancerResult<()> {
//! let lb = Arc::new(LoadBalancer::new(BalancerConfig::for_service("transcode"))?);
//! lb.register_service("worker-0", "10.0.0.5", 8080, 1, HashMap::new())?;
//! lb.start();
//!
//! let instance = lb.route_request(&RequestHint::default())?;
//! // ... perform the proxied request against instance.url() ...
//! lb.record_response(&instance.id, 42.0, true);
//!
//! lb.stop().await;
//! # Ok(())
//! # }
//! ```

/// Core building blocks: errors, instance types, config, circuit breaker
pub mod core;

/// Load balancer orchestration and the selection policies
pub mod balancer;

/// Background health probing
pub mod health;

/// Cross-service registry and auto-scaling
pub mod discovery;

/// Logging initialization helpers
pub mod observability;

// Re-export the types that make up the public API surface, so users don't
// need to know the module tree.

pub use crate::balancer::balancer::{
    BalancerStats, InstanceSnapshot, LoadBalancer, MetricsSnapshot,
};
pub use crate::balancer::strategies::{Algorithm, SelectionPolicy};
pub use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use crate::core::config::BalancerConfig;
pub use crate::core::error::{BalancerError, BalancerResult};
pub use crate::core::types::{
    BalancerEvent, InstanceStatus, RequestHint, ScalingAction, ServiceInstance,
};
pub use crate::discovery::autoscaler::{AutoScalerConfig, ServiceDiscovery};
pub use crate::health::checker::{HealthCheckConfig, HealthChecker};
pub use crate::observability::{init_logging, LogConfig, LogFormat};
