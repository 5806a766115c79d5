pub mod balancer;
pub mod strategies;

pub use balancer::{BalancerStats, LoadBalancer, MetricsSnapshot};
pub use strategies::{Algorithm, SelectionPolicy};
