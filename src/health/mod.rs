pub mod checker;

pub use checker::{HealthCheckConfig, HealthChecker, HttpHealthProbe};
