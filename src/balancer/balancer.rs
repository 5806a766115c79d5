//! # Load Balancer Module
//!
//! The orchestrator of the resilience layer: owns the instance registry, the
//! per-instance circuit breakers, the selection policy and the public
//! routing/response API. One `LoadBalancer` fronts one logical service.
//!
//! ## Rust Concepts Explained
//!
//! - `DashMap` gives per-entry locking, so a probe racing an in-flight
//!   `record_response` for the same instance still sees consistent counters
//! - `Arc<CircuitBreaker>` lets breaker outcomes be recorded without holding
//!   any registry lock
//! - The health-checking loop is a spawned task tied to a
//!   `CancellationToken`; `stop()` cancels it and awaits completion so no
//!   orphaned probe mutates state after shutdown

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::strategies::{policy_for, SelectionPolicy};
use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::core::config::BalancerConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{
    BalancerEvent, EventPublisher, EventSubscriber, InstanceStatus, RequestHint, RequestRecord,
    ServiceInstance,
};
use crate::health::checker::HealthChecker;

/// Smoothing factor for the per-request response-time EMA
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// How many one-minute buckets the request-rate ring keeps
const RPM_WINDOW_MINUTES: usize = 60;

/// Aggregate counters for one balancer
///
/// Atomics keep the routing hot path lock-free; only the response-time EMA
/// and the per-minute ring take a short mutex.
#[derive(Debug, Default)]
struct BalancerMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    response_samples: AtomicU64,
    avg_response_time: Mutex<f64>,
    rpm_buckets: Mutex<VecDeque<(i64, u64)>>,
}

impl BalancerMetrics {
    fn record_routed(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let minute = chrono::Utc::now().timestamp() / 60;
        let mut buckets = self.rpm_buckets.lock();
        match buckets.back_mut() {
            Some((bucket_minute, count)) if *bucket_minute == minute => *count += 1,
            _ => {
                buckets.push_back((minute, 1));
                while buckets.len() > RPM_WINDOW_MINUTES {
                    buckets.pop_front();
                }
            }
        }
    }

    fn record_outcome(&self, response_time_ms: f64, success: bool) {
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let samples = self.response_samples.fetch_add(1, Ordering::Relaxed);
        let mut avg = self.avg_response_time.lock();
        *avg = if samples == 0 {
            response_time_ms
        } else {
            RESPONSE_TIME_ALPHA * response_time_ms + (1.0 - RESPONSE_TIME_ALPHA) * *avg
        };
    }

    fn requests_last_minute(&self) -> u64 {
        let minute = chrono::Utc::now().timestamp() / 60;
        let buckets = self.rpm_buckets.lock();
        buckets
            .iter()
            .rev()
            .take_while(|(bucket_minute, _)| minute - bucket_minute <= 1)
            .map(|(_, count)| count)
            .sum()
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            avg_response_time: *self.avg_response_time.lock(),
            requests_last_minute: self.requests_last_minute(),
        }
    }
}

/// Serializable aggregate metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: f64,
    pub requests_last_minute: u64,
}

/// Per-instance view in `BalancerStats`, with the derived scores materialized
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    #[serde(flatten)]
    pub instance: ServiceInstance,
    pub failure_rate: f64,
    pub load_score: f64,
}

/// Full diagnostic snapshot of one balancer
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub service_name: String,
    pub algorithm: String,
    pub instances: Vec<InstanceSnapshot>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub metrics: MetricsSnapshot,
}

/// Load balancer for one logical service
///
/// Instances and their breakers are created and destroyed together; every key
/// in one map has a matching key in the other. All instance mutation flows
/// through methods on this type — callers only ever receive snapshots.
pub struct LoadBalancer {
    config: BalancerConfig,
    policy: Box<dyn SelectionPolicy>,
    instances: DashMap<String, ServiceInstance>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    history: Mutex<VecDeque<RequestRecord>>,
    metrics: BalancerMetrics,
    events: EventPublisher,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    /// Create a balancer from a validated configuration
    pub fn new(config: BalancerConfig) -> BalancerResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            policy: policy_for(config.algorithm),
            config,
            instances: DashMap::new(),
            breakers: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            metrics: BalancerMetrics::default(),
            events,
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Balancer with default config for a named service
    pub fn for_service(service_name: impl Into<String>) -> Self {
        // Default config always validates.
        Self::new(BalancerConfig::for_service(service_name)).expect("default config is valid")
    }

    /// Logical service this balancer fronts
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Name of the selection algorithm fixed at construction
    pub fn algorithm_name(&self) -> &'static str {
        self.policy.name()
    }

    /// The balancer's configuration
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Registry
    // ---------------------------------------------------------------------

    /// Register an instance and create its circuit breaker
    ///
    /// Fails with `DuplicateInstance` when the id is already registered.
    pub fn register(&self, instance: ServiceInstance) -> BalancerResult<()> {
        let instance_id = instance.id.clone();
        match self.instances.entry(instance_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BalancerError::duplicate(instance_id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                // Breaker first: a concurrently observed instance always has one.
                self.breakers.insert(
                    instance_id.clone(),
                    Arc::new(CircuitBreaker::new(
                        instance_id.clone(),
                        self.config.circuit_breaker.clone(),
                    )),
                );
                entry.insert(instance);

                gauge!("balancer_registered_instances").set(self.instances.len() as f64);
                info!(
                    service = %self.config.service_name,
                    instance_id = %instance_id,
                    "Registered service instance"
                );
                let _ = self
                    .events
                    .send(BalancerEvent::InstanceRegistered { instance_id });
                Ok(())
            }
        }
    }

    /// Convenience registration from endpoint coordinates
    pub fn register_service(
        &self,
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        weight: u32,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> BalancerResult<ServiceInstance> {
        let instance = ServiceInstance::new(id, self.config.service_name.clone(), host, port)
            .with_weight(weight)
            .with_metadata(metadata);
        let snapshot = instance.clone();
        self.register(instance)?;
        Ok(snapshot)
    }

    /// Remove an instance and its breaker; false when the id is unknown
    pub fn unregister(&self, instance_id: &str) -> bool {
        // Instance first so routing can no longer select it, then the breaker.
        let removed = self.instances.remove(instance_id).is_some();
        self.breakers.remove(instance_id);

        if removed {
            gauge!("balancer_registered_instances").set(self.instances.len() as f64);
            info!(
                service = %self.config.service_name,
                instance_id,
                "Unregistered service instance"
            );
            let _ = self.events.send(BalancerEvent::InstanceUnregistered {
                instance_id: instance_id.to_string(),
            });
        }
        removed
    }

    /// Snapshot of one instance
    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered instance
    pub fn instances_snapshot(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered instances
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Set an instance's lifecycle status (drain/maintenance entry point)
    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) -> bool {
        let Some(mut entry) = self.instances.get_mut(instance_id) else {
            return false;
        };
        let old_status = entry.status;
        if old_status == status {
            return true;
        }
        entry.status = status;
        drop(entry);

        info!(
            service = %self.config.service_name,
            instance_id,
            %old_status,
            new_status = %status,
            "Instance status changed"
        );
        let _ = self.events.send(BalancerEvent::InstanceStatusChanged {
            instance_id: instance_id.to_string(),
            old_status,
            new_status: status,
        });
        true
    }

    /// The candidate set every routing decision starts from
    ///
    /// Healthy instances whose breaker currently permits execution. Asking an
    /// open breaker past its recovery timeout moves it to half-open here, so
    /// recovery trials start from routing pressure, not from a timer.
    pub fn eligible_instances(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .filter(|entry| entry.is_healthy())
            .filter(|entry| {
                self.breakers
                    .get(entry.key())
                    .map(|breaker| breaker.can_execute())
                    .unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Routing
    // ---------------------------------------------------------------------

    /// Route one request: pick an instance and account for the new connection
    ///
    /// The caller performs the real work out-of-band and reports the outcome
    /// back via [`record_response`](Self::record_response). An empty eligible
    /// set surfaces as `NoHealthyInstances` — an operational condition the
    /// caller handles with retry/backoff, not a crash.
    pub fn route_request(&self, hint: &RequestHint) -> BalancerResult<ServiceInstance> {
        let candidates = self.eligible_instances();
        let Some(index) = self.policy.select(&candidates, hint) else {
            counter!("balancer_routing_failures").increment(1);
            warn!(
                service = %self.config.service_name,
                "Routing failed: no healthy instances"
            );
            return Err(BalancerError::no_healthy(self.config.service_name.clone()));
        };
        let instance_id = candidates[index].id.clone();

        let snapshot = {
            let Some(mut entry) = self.instances.get_mut(&instance_id) else {
                // Unregistered between snapshot and selection; treat like an
                // empty pool and let the caller retry.
                counter!("balancer_routing_failures").increment(1);
                return Err(BalancerError::no_healthy(self.config.service_name.clone()));
            };
            entry.current_connections += 1;
            entry.value().clone()
        };

        {
            let mut history = self.history.lock();
            history.push_back(RequestRecord {
                timestamp: chrono::Utc::now(),
                instance_id: instance_id.clone(),
            });
            while history.len() > self.config.request_history_size {
                history.pop_front();
            }
        }

        self.metrics.record_routed();
        counter!("balancer_requests_total").increment(1);
        debug!(
            service = %self.config.service_name,
            instance_id = %instance_id,
            algorithm = self.policy.name(),
            "Routed request"
        );
        Ok(snapshot)
    }

    /// Report the outcome of a routed request
    ///
    /// Unknown ids are a no-op (the instance may have been unregistered while
    /// the request was in flight). Success and failure partition the
    /// per-instance counters, feed the response-time EMA and are forwarded to
    /// the instance's circuit breaker.
    pub fn record_response(&self, instance_id: &str, response_time_ms: f64, success: bool) {
        let Some(mut entry) = self.instances.get_mut(instance_id) else {
            debug!(
                service = %self.config.service_name,
                instance_id,
                "Dropping response report for unknown instance"
            );
            return;
        };

        entry.current_connections = entry.current_connections.saturating_sub(1);

        let first_sample = entry.total_requests + entry.total_failures == 0;
        entry.avg_response_time = if first_sample {
            response_time_ms
        } else {
            RESPONSE_TIME_ALPHA * response_time_ms
                + (1.0 - RESPONSE_TIME_ALPHA) * entry.avg_response_time
        };

        if success {
            entry.total_requests += 1;
        } else {
            entry.total_failures += 1;
        }
        drop(entry);

        if let Some(breaker) = self.breakers.get(instance_id).map(|b| Arc::clone(&b)) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }

        self.metrics.record_outcome(response_time_ms, success);
        histogram!("balancer_response_time_ms").record(response_time_ms);
        if !success {
            counter!("balancer_failed_responses").increment(1);
        }
    }

    // ---------------------------------------------------------------------
    // Health-checker callbacks (instance mutation stays in this type)
    // ---------------------------------------------------------------------

    /// Probe targets for one health-check cycle: (id, url) pairs
    pub(crate) fn probe_targets(&self) -> Vec<(String, String)> {
        self.instances
            .iter()
            .map(|entry| (entry.id.clone(), entry.url()))
            .collect()
    }

    /// Breaker handle for an instance, if it is still registered
    pub(crate) fn breaker(&self, instance_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(instance_id)
            .map(|entry| Arc::clone(&entry))
    }

    /// Apply a successful probe: blend latency (α=0.5), stamp the check time
    /// and, when the checker says thresholds are met, lift Unhealthy status.
    ///
    /// Draining and Maintenance are administrative states — probe outcomes
    /// never overwrite them.
    pub(crate) fn record_probe_success(
        &self,
        instance_id: &str,
        latency_ms: f64,
        flip_to_healthy: bool,
    ) {
        let Some(mut entry) = self.instances.get_mut(instance_id) else {
            return;
        };
        entry.last_health_check = Some(chrono::Utc::now());
        entry.avg_response_time = if entry.avg_response_time == 0.0 {
            latency_ms
        } else {
            0.5 * latency_ms + 0.5 * entry.avg_response_time
        };
        let flip = flip_to_healthy && entry.status == InstanceStatus::Unhealthy;
        drop(entry);

        if flip {
            self.set_status(instance_id, InstanceStatus::Healthy);
        }
    }

    /// Apply a failed probe: stamp the check time, feed the breaker (probe and
    /// request failures share one counter) and, when thresholds are met, drop
    /// Healthy status.
    pub(crate) fn record_probe_failure(&self, instance_id: &str, flip_to_unhealthy: bool) {
        let Some(mut entry) = self.instances.get_mut(instance_id) else {
            return;
        };
        entry.last_health_check = Some(chrono::Utc::now());
        let flip = flip_to_unhealthy && entry.status == InstanceStatus::Healthy;
        drop(entry);

        if let Some(breaker) = self.breaker(instance_id) {
            breaker.record_failure();
        }
        if flip {
            self.set_status(instance_id, InstanceStatus::Unhealthy);
        }
    }

    // ---------------------------------------------------------------------
    // Scaling predicates (consumed by the auto-scaler)
    // ---------------------------------------------------------------------

    /// True when the pool needs more capacity
    ///
    /// Either nothing is routable at all, or at least 70% of the eligible
    /// instances sit over a soft threshold (connections > 10 OR average
    /// response time > 1000ms OR reported cpu > 80%).
    pub fn should_scale_up(&self) -> bool {
        let eligible = self.eligible_instances();
        if eligible.is_empty() {
            return true;
        }
        let overloaded = eligible
            .iter()
            .filter(|instance| {
                instance.current_connections > 10
                    || instance.avg_response_time > 1000.0
                    || instance.cpu_percent().unwrap_or(0.0) > 80.0
            })
            .count();
        overloaded as f64 / eligible.len() as f64 >= 0.7
    }

    /// True when the pool can give capacity back
    ///
    /// Requires more than one eligible instance (never scale below one) and at
    /// least 80% of them simultaneously idle (connections < 2 AND average
    /// response time < 100ms AND reported cpu < 20%).
    pub fn should_scale_down(&self) -> bool {
        let eligible = self.eligible_instances();
        if eligible.len() <= 1 {
            return false;
        }
        let idle = eligible
            .iter()
            .filter(|instance| {
                instance.current_connections < 2
                    && instance.avg_response_time < 100.0
                    && instance.cpu_percent().unwrap_or(0.0) < 20.0
            })
            .count();
        idle as f64 / eligible.len() as f64 >= 0.8
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// Full diagnostic snapshot: instances, breaker states, aggregate metrics
    pub fn get_stats(&self) -> BalancerStats {
        let instances = self
            .instances
            .iter()
            .map(|entry| InstanceSnapshot {
                failure_rate: entry.failure_rate(),
                load_score: entry.load_score(),
                instance: entry.value().clone(),
            })
            .collect();
        let circuit_breakers = self
            .breakers
            .iter()
            .map(|entry| entry.snapshot())
            .collect();

        BalancerStats {
            service_name: self.config.service_name.clone(),
            algorithm: self.policy.name().to_string(),
            instances,
            circuit_breakers,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Recent routing decisions (bounded ring, diagnostics only)
    pub fn request_history(&self) -> Vec<RequestRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Subscribe to registry and status-change events
    pub fn subscribe_to_events(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    /// Publish an event on this balancer's channel (scaling actions originate
    /// in the auto-scaler but are observed per service)
    pub(crate) fn publish_event(&self, event: BalancerEvent) {
        let _ = self.events.send(event);
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start the background health-checking loop
    pub fn start(self: &Arc<Self>) {
        if !self.config.health_check.enabled {
            debug!(
                service = %self.config.service_name,
                "Health checking disabled; not starting probe loop"
            );
            return;
        }
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            warn!(
                service = %self.config.service_name,
                "Health checker already running"
            );
            return;
        }
        let checker = HealthChecker::new(self.config.health_check.clone());
        *slot = Some(checker.spawn(Arc::clone(self), self.shutdown.clone()));
        info!(service = %self.config.service_name, "Started health checker");
    }

    /// Stop the balancer: cancel the health loop and await its completion
    ///
    /// After this returns no probe task remains to mutate state.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(
                    service = %self.config.service_name,
                    error = %err,
                    "Health checker task ended abnormally"
                );
            }
        }
        info!(service = %self.config.service_name, "Load balancer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::strategies::Algorithm;
    use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::collections::HashMap;
    use std::time::Duration;

    fn balancer_with(algorithm: Algorithm) -> LoadBalancer {
        let config = BalancerConfig {
            algorithm,
            ..BalancerConfig::for_service("transcode")
        };
        LoadBalancer::new(config).unwrap()
    }

    fn register_workers(lb: &LoadBalancer, n: usize) {
        for i in 0..n {
            lb.register_service(format!("worker-{}", i), "10.0.0.1", 8080 + i as u16, 1, HashMap::new())
                .unwrap();
        }
    }

    #[test]
    fn test_register_rejects_duplicate_ids() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);

        let err = lb
            .register_service("worker-0", "10.0.0.2", 9090, 1, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, BalancerError::DuplicateInstance { .. }));
        assert_eq!(lb.instance_count(), 1);
    }

    #[test]
    fn test_register_creates_breaker_and_unregister_removes_both() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);
        assert!(lb.breaker("worker-0").is_some());

        assert!(lb.unregister("worker-0"));
        assert!(lb.instance("worker-0").is_none());
        assert!(lb.breaker("worker-0").is_none());
        assert!(!lb.unregister("worker-0"));
    }

    #[test]
    fn test_route_with_empty_registry_fails() {
        let lb = balancer_with(Algorithm::HealthAware);
        let err = lb.route_request(&RequestHint::default()).unwrap_err();
        assert!(matches!(err, BalancerError::NoHealthyInstances { .. }));
    }

    #[test]
    fn test_route_never_selects_unregistered_instance() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 2);
        lb.unregister("worker-0");

        for _ in 0..10 {
            let chosen = lb.route_request(&RequestHint::default()).unwrap();
            assert_eq!(chosen.id, "worker-1");
        }
    }

    #[test]
    fn test_route_increments_connections_and_history() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);

        let chosen = lb.route_request(&RequestHint::default()).unwrap();
        assert_eq!(chosen.current_connections, 1);
        assert_eq!(lb.instance("worker-0").unwrap().current_connections, 1);

        let history = lb.request_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].instance_id, "worker-0");

        let stats = lb.get_stats();
        assert_eq!(stats.metrics.total_requests, 1);
        assert_eq!(stats.metrics.requests_last_minute, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = BalancerConfig {
            algorithm: Algorithm::RoundRobin,
            request_history_size: 5,
            ..BalancerConfig::for_service("transcode")
        };
        let lb = LoadBalancer::new(config).unwrap();
        register_workers(&lb, 1);

        for _ in 0..20 {
            lb.route_request(&RequestHint::default()).unwrap();
        }
        assert_eq!(lb.request_history().len(), 5);
    }

    #[test]
    fn test_round_robin_distribution_through_balancer() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 3);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let chosen = lb.route_request(&RequestHint::default()).unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 3);
        }
    }

    #[test]
    fn test_record_response_updates_counters_and_ema() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);
        lb.route_request(&RequestHint::default()).unwrap();

        lb.record_response("worker-0", 200.0, true);
        let instance = lb.instance("worker-0").unwrap();
        assert_eq!(instance.current_connections, 0);
        assert_eq!(instance.total_requests, 1);
        assert_eq!(instance.total_failures, 0);
        // First sample is taken as-is.
        assert_eq!(instance.avg_response_time, 200.0);

        lb.route_request(&RequestHint::default()).unwrap();
        lb.record_response("worker-0", 100.0, false);
        let instance = lb.instance("worker-0").unwrap();
        assert_eq!(instance.total_failures, 1);
        // 0.1 * 100 + 0.9 * 200
        assert!((instance.avg_response_time - 190.0).abs() < 1e-9);

        let stats = lb.get_stats();
        assert_eq!(stats.metrics.successful_requests, 1);
        assert_eq!(stats.metrics.failed_requests, 1);
    }

    #[test]
    fn test_connections_never_go_negative() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);

        // Duplicate and out-of-order reports must not underflow.
        lb.record_response("worker-0", 50.0, true);
        lb.record_response("worker-0", 50.0, true);
        assert_eq!(lb.instance("worker-0").unwrap().current_connections, 0);
    }

    #[test]
    fn test_record_response_unknown_id_is_noop() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 1);
        lb.record_response("ghost", 50.0, false);
        assert_eq!(lb.get_stats().metrics.failed_requests, 0);
    }

    #[test]
    fn test_draining_instances_are_not_routable() {
        let lb = balancer_with(Algorithm::RoundRobin);
        register_workers(&lb, 2);
        lb.set_status("worker-0", InstanceStatus::Draining);

        for _ in 0..10 {
            let chosen = lb.route_request(&RequestHint::default()).unwrap();
            assert_eq!(chosen.id, "worker-1");
        }
    }

    #[test]
    fn test_breaker_opens_and_isolates_single_instance() {
        let config = BalancerConfig {
            algorithm: Algorithm::HealthAware,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_millis(200),
                half_open_max_calls: 1,
            },
            ..BalancerConfig::for_service("transcode")
        };
        let lb = LoadBalancer::new(config).unwrap();
        register_workers(&lb, 3);

        // Inject five failures on worker-0, tripping its breaker.
        for _ in 0..5 {
            lb.record_response("worker-0", 1000.0, false);
        }
        assert_eq!(
            lb.breaker("worker-0").unwrap().state(),
            CircuitState::Open
        );

        // Only the other two are routable; the healthy breakers are untouched.
        for _ in 0..20 {
            let chosen = lb.route_request(&RequestHint::default()).unwrap();
            assert_ne!(chosen.id, "worker-0");
            lb.record_response(&chosen.id, 10.0, true);
        }
        assert_eq!(
            lb.breaker("worker-1").unwrap().state(),
            CircuitState::Closed
        );

        // After the recovery timeout the instance gets exactly one trial.
        std::thread::sleep(Duration::from_millis(250));
        let eligible: Vec<String> = lb
            .eligible_instances()
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        assert!(eligible.contains(&"worker-0".to_string()));
        assert_eq!(
            lb.breaker("worker-0").unwrap().state(),
            CircuitState::HalfOpen
        );

        // A failed trial reopens immediately.
        lb.record_response("worker-0", 1000.0, false);
        assert_eq!(lb.breaker("worker-0").unwrap().state(), CircuitState::Open);
        for _ in 0..10 {
            let chosen = lb.route_request(&RequestHint::default()).unwrap();
            assert_ne!(chosen.id, "worker-0");
            lb.record_response(&chosen.id, 10.0, true);
        }
    }

    #[test]
    fn test_all_breakers_open_yields_no_healthy() {
        let config = BalancerConfig {
            algorithm: Algorithm::RoundRobin,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
            ..BalancerConfig::for_service("transcode")
        };
        let lb = LoadBalancer::new(config).unwrap();
        register_workers(&lb, 2);
        lb.record_response("worker-0", 10.0, false);
        lb.record_response("worker-1", 10.0, false);

        let err = lb.route_request(&RequestHint::default()).unwrap_err();
        assert!(matches!(err, BalancerError::NoHealthyInstances { .. }));
    }

    #[test]
    fn test_should_scale_up_when_nothing_is_eligible() {
        let lb = balancer_with(Algorithm::HealthAware);
        assert!(lb.should_scale_up());

        register_workers(&lb, 1);
        lb.set_status("worker-0", InstanceStatus::Unhealthy);
        assert!(lb.should_scale_up());
    }

    #[test]
    fn test_should_scale_up_on_broad_overload() {
        let lb = balancer_with(Algorithm::HealthAware);
        register_workers(&lb, 3);

        // Two of three overloaded: 66% is below the 70% bar.
        for id in ["worker-0", "worker-1"] {
            let mut entry = lb.instances.get_mut(id).unwrap();
            entry.current_connections = 15;
        }
        assert!(!lb.should_scale_up());

        lb.instances.get_mut("worker-2").unwrap().avg_response_time = 1500.0;
        assert!(lb.should_scale_up());
    }

    #[test]
    fn test_should_scale_down_requires_more_than_one_instance() {
        let lb = balancer_with(Algorithm::HealthAware);
        register_workers(&lb, 1);
        // A single idle instance is never scaled away.
        assert!(!lb.should_scale_down());
    }

    #[test]
    fn test_should_scale_down_on_broad_idleness() {
        let lb = balancer_with(Algorithm::HealthAware);
        register_workers(&lb, 2);
        assert!(lb.should_scale_down());

        // One busy instance drops idle share to 50%.
        lb.instances.get_mut("worker-0").unwrap().current_connections = 5;
        assert!(!lb.should_scale_down());
    }

    #[test]
    fn test_stats_include_breaker_snapshots() {
        let lb = balancer_with(Algorithm::HealthAware);
        register_workers(&lb, 2);
        let stats = lb.get_stats();
        assert_eq!(stats.instances.len(), 2);
        assert_eq!(stats.circuit_breakers.len(), 2);
        assert_eq!(stats.algorithm, "health_aware");
        assert!(stats
            .circuit_breakers
            .iter()
            .all(|snapshot| snapshot.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_clean() {
        let lb = Arc::new(balancer_with(Algorithm::RoundRobin));
        lb.stop().await;
    }
}
