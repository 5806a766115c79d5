//! # Selection Policies
//!
//! Pluggable algorithms that pick one instance from the eligible candidate
//! set. Policies are pure over the snapshot they are handed: they never mutate
//! instance state (all mutation happens in the balancer) and, apart from the
//! round-robin cursors, carry no state at all.
//!
//! The algorithm is chosen at balancer construction time from the `Algorithm`
//! enum; there is no runtime string dispatch.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::core::types::{RequestHint, ServiceInstance};

/// Available selection algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    Random,
    /// Minimizes the composite load score; the only policy that reacts to
    /// failure history rather than just instantaneous load. The default.
    #[default]
    HealthAware,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::LeastResponseTime => "least_response_time",
            Algorithm::IpHash => "ip_hash",
            Algorithm::Random => "random",
            Algorithm::HealthAware => "health_aware",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "least_response_time" => Ok(Algorithm::LeastResponseTime),
            "ip_hash" => Ok(Algorithm::IpHash),
            "random" => Ok(Algorithm::Random),
            "health_aware" => Ok(Algorithm::HealthAware),
            other => Err(format!("Unknown selection algorithm: {}", other)),
        }
    }
}

/// Core trait for selection policies
///
/// # Arguments
/// * `candidates` - The eligible set: healthy instances whose breakers permit
///   execution. Never empty when called by the balancer.
/// * `hint` - Per-request routing hint (client ip for affinity).
///
/// # Returns
/// * `Some(index)` - Index of the selected instance in the candidates slice
/// * `None` - Only when the candidate slice is empty
pub trait SelectionPolicy: Send + Sync {
    fn select(&self, candidates: &[ServiceInstance], hint: &RequestHint) -> Option<usize>;

    /// Algorithm name for logging and stats
    fn name(&self) -> &'static str;
}

/// Construct the policy implementation for an algorithm
pub fn policy_for(algorithm: Algorithm) -> Box<dyn SelectionPolicy> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobinPolicy::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobinPolicy::new()),
        Algorithm::LeastConnections => Box::new(LeastConnectionsPolicy),
        Algorithm::LeastResponseTime => Box::new(LeastResponseTimePolicy),
        Algorithm::IpHash => Box::new(IpHashPolicy),
        Algorithm::Random => Box::new(RandomPolicy),
        Algorithm::HealthAware => Box::new(HealthAwarePolicy),
    }
}

/// Round-robin with an atomic cursor
///
/// The cursor is owned by the policy object the balancer holds, increments
/// monotonically on every call and is shared across all candidate-set sizes,
/// so shrinking or growing the pool does not bias the rotation.
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RoundRobinPolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(index)
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Round-robin over the weight-expanded virtual candidate list
///
/// An instance with weight 3 occupies three consecutive virtual slots, so it
/// receives three times the traffic of a weight-1 peer over a full rotation.
pub struct WeightedRoundRobinPolicy {
    cursor: AtomicUsize,
}

impl WeightedRoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for WeightedRoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for WeightedRoundRobinPolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: u64 = candidates.iter().map(|i| i.weight as u64).sum();
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) as u64;

        if total_weight == 0 {
            // All-zero weights: degrade to plain round-robin.
            return Some((slot as usize) % candidates.len());
        }

        let mut remaining = slot % total_weight;
        for (index, instance) in candidates.iter().enumerate() {
            if remaining < instance.weight as u64 {
                return Some(index);
            }
            remaining -= instance.weight as u64;
        }

        debug!("Weighted rotation walked past the virtual list; falling back to first candidate");
        Some(0)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Route to the instance with the fewest in-flight connections
pub struct LeastConnectionsPolicy;

impl SelectionPolicy for LeastConnectionsPolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        // Strict comparison keeps the first candidate on ties.
        candidates
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, u32)>, (index, instance)| {
                match best {
                    Some((_, min)) if instance.current_connections >= min => best,
                    _ => Some((index, instance.current_connections)),
                }
            })
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Route to the instance with the lowest response-time EMA
pub struct LeastResponseTimePolicy;

impl SelectionPolicy for LeastResponseTimePolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (index, instance)| {
                match best {
                    Some((_, min)) if instance.avg_response_time >= min => best,
                    _ => Some((index, instance.avg_response_time)),
                }
            })
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "least_response_time"
    }
}

/// Deterministic selection keyed on the client address
///
/// The same client ip always lands on the same candidate index for a given
/// pool size. A request without a client ip falls back to a uniform random
/// pick rather than pinning all anonymous traffic to one instance.
pub struct IpHashPolicy;

impl IpHashPolicy {
    /// Hash a key to u64 via sha256 (first 8 bytes, big-endian)
    fn hash_key(key: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        u64::from_be_bytes(bytes)
    }
}

impl SelectionPolicy for IpHashPolicy {
    fn select(&self, candidates: &[ServiceInstance], hint: &RequestHint) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match hint.client_ip {
            Some(ip) => {
                let hash = Self::hash_key(&ip.to_string());
                Some((hash % candidates.len() as u64) as usize)
            }
            None => Some(rand::thread_rng().gen_range(0..candidates.len())),
        }
    }

    fn name(&self) -> &'static str {
        "ip_hash"
    }
}

/// Uniform random selection
pub struct RandomPolicy;

impl SelectionPolicy for RandomPolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Route to the instance with the lowest composite load score
pub struct HealthAwarePolicy;

impl SelectionPolicy for HealthAwarePolicy {
    fn select(&self, candidates: &[ServiceInstance], _hint: &RequestHint) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (index, instance)| {
                let score = instance.load_score();
                match best {
                    Some((_, min)) if score >= min => best,
                    _ => Some((index, score)),
                }
            })
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "health_aware"
    }
}
