pub mod autoscaler;

pub use autoscaler::{AutoScalerConfig, ServiceDiscovery};
