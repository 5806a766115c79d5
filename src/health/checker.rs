//! # Health Checking System
//!
//! Background prober for registered instances. Each cycle probes every
//! instance concurrently (fan-out/fan-in), so one slow backend never delays
//! the others, and reports outcomes back into the balancer: status flips,
//! latency blending and circuit-breaker failures.
//!
//! Probe errors never escape this module — a timeout or connection error is
//! converted into a breaker `record_failure` and (once the configured
//! threshold of consecutive failures is reached) an Unhealthy status.
//!
//! ## Rust Concepts Used
//! - `tokio::time::interval` for the fixed probing cadence
//! - `tokio::select!` against a `CancellationToken` for prompt shutdown
//! - `futures::future::join_all` for the per-cycle fan-out

use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::balancer::balancer::LoadBalancer;
use crate::core::error::{BalancerError, BalancerResult};

/// Configuration for instance health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Whether the background loop runs at all
    pub enabled: bool,

    /// Path probed on each instance, appended to the instance URL
    pub endpoint: String,

    /// Probing cadence
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout budget
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Status code that counts as healthy
    pub expected_status: u16,

    /// Consecutive successful probes required to lift Unhealthy status
    pub healthy_threshold: u32,

    /// Consecutive failed probes required to drop Healthy status
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        // Thresholds of 1 flip status on a single probe; raise them to damp
        // flapping backends.
        Self {
            enabled: true,
            endpoint: "/health".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            expected_status: 200,
            healthy_threshold: 1,
            unhealthy_threshold: 1,
        }
    }
}

impl HealthCheckConfig {
    /// Validate the configuration
    pub fn validate(&self) -> BalancerResult<()> {
        if self.interval.is_zero() {
            return Err(BalancerError::config("health check interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(BalancerError::config("health check timeout must be positive"));
        }
        if !self.endpoint.starts_with('/') {
            return Err(BalancerError::config(
                "health check endpoint must start with '/'",
            ));
        }
        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return Err(BalancerError::config(
                "health check thresholds must be at least 1",
            ));
        }
        Ok(())
    }
}

/// HTTP health check probe
///
/// One GET against `{instance_url}{endpoint}`, bounded by the configured
/// timeout. Anything other than the expected status within budget is a
/// failure.
pub struct HttpHealthProbe {
    client: HttpClient,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        let client = HttpClient::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Probe one instance; returns the observed latency in milliseconds
    pub async fn check(
        &self,
        instance_id: &str,
        base_url: &str,
        config: &HealthCheckConfig,
    ) -> BalancerResult<f64> {
        let url = format!("{}{}", base_url, config.endpoint);
        let start = Instant::now();

        match timeout(config.timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                if response.status().as_u16() == config.expected_status {
                    Ok(latency_ms)
                } else {
                    Err(BalancerError::ProbeConnection {
                        instance_id: instance_id.to_string(),
                        message: format!("unexpected status code: {}", response.status().as_u16()),
                    })
                }
            }
            Ok(Err(err)) => Err(BalancerError::ProbeConnection {
                instance_id: instance_id.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(BalancerError::ProbeTimeout {
                instance_id: instance_id.to_string(),
                timeout_ms: config.timeout.as_millis() as u64,
            }),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive probe outcomes for one instance (hysteresis bookkeeping)
#[derive(Debug, Default, Clone, Copy)]
struct ProbeHistory {
    consecutive_successes: u32,
    consecutive_failures: u32,
}

/// Background health checker for one balancer
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: HttpHealthProbe,
    history: DashMap<String, ProbeHistory>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            probe: HttpHealthProbe::new(),
            history: DashMap::new(),
        }
    }

    /// Spawn the probing loop; it stops promptly when the token is cancelled
    pub fn spawn(self, balancer: Arc<LoadBalancer>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(service = balancer.service_name(), "Health checker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_cycle(&balancer).await;
                    }
                }
            }
        })
    }

    /// Probe every registered instance once, concurrently
    pub(crate) async fn run_cycle(&self, balancer: &LoadBalancer) {
        let targets = balancer.probe_targets();

        // Forget hysteresis state for instances that left the registry.
        self.history
            .retain(|id, _| targets.iter().any(|(target_id, _)| target_id == id));

        let probes = targets.into_iter().map(|(instance_id, base_url)| {
            let probe = &self.probe;
            let config = &self.config;
            async move {
                let result = probe.check(&instance_id, &base_url, config).await;
                (instance_id, result)
            }
        });

        for (instance_id, result) in join_all(probes).await {
            counter!("health_probes_total").increment(1);
            match result {
                Ok(latency_ms) => {
                    let flip = {
                        let mut history = self.history.entry(instance_id.clone()).or_default();
                        history.consecutive_successes += 1;
                        history.consecutive_failures = 0;
                        history.consecutive_successes >= self.config.healthy_threshold
                    };
                    balancer.record_probe_success(&instance_id, latency_ms, flip);
                }
                Err(err) => {
                    counter!("health_probe_failures").increment(1);
                    debug!(
                        instance_id = %instance_id,
                        error = %err,
                        "Health probe failed"
                    );
                    let flip = {
                        let mut history = self.history.entry(instance_id.clone()).or_default();
                        history.consecutive_failures += 1;
                        history.consecutive_successes = 0;
                        history.consecutive_failures >= self.config.unhealthy_threshold
                    };
                    balancer.record_probe_failure(&instance_id, flip);
                }
            }
        }
    }
}
