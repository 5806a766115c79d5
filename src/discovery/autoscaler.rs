//! # Service Discovery & Auto-Scaling Module
//!
//! Cross-service coordinator: holds one `LoadBalancer` per logical service,
//! watches each pool's aggregate load on a fixed cadence and drives
//! scale-up/scale-down decisions with a per-service cooldown.
//!
//! Scaling here is modeled purely as registry mutation — the actual
//! process/container lifecycle is an external responsibility. Scale-up clones
//! the least-loaded registered instance under a fresh id; scale-down marks the
//! cheapest instance Draining and unregisters it only after the drain window,
//! never synchronously, so in-flight work finishes first.
//!
//! There is no hidden global registry: a `ServiceDiscovery` is explicitly
//! constructed, passed around and stopped, and its background tasks die with
//! it.

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::balancer::{BalancerStats, LoadBalancer};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{BalancerEvent, InstanceStatus, ScalingAction, ServiceInstance};

/// Configuration for the auto-scaling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    /// How often every service is evaluated
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,

    /// Minimum time between two scaling actions on the same service
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// How long a draining instance keeps finishing in-flight work before it
    /// is unregistered
    #[serde(with = "humantime_serde")]
    pub drain_window: Duration,

    /// Upper bound on instances per service
    pub max_instances: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(300),
            drain_window: Duration::from_secs(30),
            max_instances: 10,
        }
    }
}

impl AutoScalerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> BalancerResult<()> {
        if self.evaluation_interval.is_zero() {
            return Err(BalancerError::config("evaluation_interval must be positive"));
        }
        if self.max_instances == 0 {
            return Err(BalancerError::config("max_instances must be at least 1"));
        }
        Ok(())
    }
}

/// Registry of balancers plus the auto-scaling loop
pub struct ServiceDiscovery {
    balancers: DashMap<String, Arc<LoadBalancer>>,
    config: AutoScalerConfig,
    last_scaling_action: DashMap<String, Instant>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    scaler_running: Mutex<bool>,
}

impl ServiceDiscovery {
    /// Create a discovery registry from a validated configuration
    pub fn new(config: AutoScalerConfig) -> BalancerResult<Self> {
        config.validate()?;
        Ok(Self {
            balancers: DashMap::new(),
            config,
            last_scaling_action: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            scaler_running: Mutex::new(false),
        })
    }

    /// Discovery registry with default configuration
    pub fn with_defaults() -> Self {
        // Default config always validates.
        Self::new(AutoScalerConfig::default()).expect("default config is valid")
    }

    /// Add a balancer to the registry (replaces an existing entry by name)
    pub fn add_service(&self, balancer: Arc<LoadBalancer>) {
        let name = balancer.service_name().to_string();
        info!(service = %name, "Added service to discovery registry");
        self.balancers.insert(name, balancer);
    }

    /// Look up the balancer for a service
    pub fn service(&self, name: &str) -> Option<Arc<LoadBalancer>> {
        self.balancers.get(name).map(|entry| Arc::clone(&entry))
    }

    /// Remove a service from the registry; false when absent
    pub fn remove_service(&self, name: &str) -> bool {
        let removed = self.balancers.remove(name).is_some();
        if removed {
            self.last_scaling_action.remove(name);
            info!(service = name, "Removed service from discovery registry");
        }
        removed
    }

    /// Names of all registered services
    pub fn service_names(&self) -> Vec<String> {
        self.balancers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Diagnostic snapshot of every registered balancer
    pub fn get_stats(&self) -> HashMap<String, BalancerStats> {
        self.balancers
            .iter()
            .map(|entry| (entry.key().clone(), entry.get_stats()))
            .collect()
    }

    /// Evaluate every service once and act where thresholds and cooldowns allow
    pub fn evaluate_once(&self) {
        let balancers: Vec<Arc<LoadBalancer>> = self
            .balancers
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        for balancer in balancers {
            self.evaluate_service(&balancer);
        }
    }

    fn evaluate_service(&self, balancer: &Arc<LoadBalancer>) {
        let service = balancer.service_name().to_string();

        if let Some(last) = self.last_scaling_action.get(&service) {
            let since_last = last.elapsed();
            if since_last < self.config.cooldown {
                debug!(
                    service = %service,
                    remaining_secs = (self.config.cooldown - since_last).as_secs(),
                    "Scaling cooldown active"
                );
                return;
            }
        }

        if balancer.should_scale_up() {
            if self.scale_up(balancer) {
                self.last_scaling_action.insert(service, Instant::now());
            }
        } else if balancer.should_scale_down() {
            if self.scale_down(balancer) {
                self.last_scaling_action.insert(service, Instant::now());
            }
        }
    }

    /// Register a new instance cloned from the least-loaded existing one
    ///
    /// Returns false when nothing was registered (pool at capacity, or no
    /// template instance to model the clone from).
    fn scale_up(&self, balancer: &Arc<LoadBalancer>) -> bool {
        let service = balancer.service_name().to_string();

        if balancer.instance_count() >= self.config.max_instances {
            warn!(
                service = %service,
                max_instances = self.config.max_instances,
                "Scale-up wanted but the pool is at capacity"
            );
            return false;
        }

        let snapshot = balancer.instances_snapshot();
        let Some(template) = snapshot
            .iter()
            .min_by(|a, b| a.load_score().total_cmp(&b.load_score()))
        else {
            warn!(
                service = %service,
                "Scale-up wanted but there is no instance to model a clone from"
            );
            return false;
        };

        let new_id = format!("{}-{}", service, &Uuid::new_v4().to_string()[..8]);
        let instance = ServiceInstance::new(
            new_id.clone(),
            service.clone(),
            template.host.clone(),
            template.port,
        )
        .with_weight(template.weight)
        .with_metadata(template.metadata.clone());

        match balancer.register(instance) {
            Ok(()) => {
                counter!("autoscaler_scale_ups").increment(1);
                info!(service = %service, instance_id = %new_id, "Scaled up");
                balancer.publish_event(BalancerEvent::ScalingAction {
                    service,
                    action: ScalingAction::ScaleUp,
                    instance_id: new_id,
                });
                true
            }
            Err(err) => {
                warn!(service = %service, error = %err, "Scale-up registration failed");
                false
            }
        }
    }

    /// Drain the cheapest eligible instance and unregister it after the window
    ///
    /// Returns false when the pool is already at its one-instance floor.
    fn scale_down(&self, balancer: &Arc<LoadBalancer>) -> bool {
        let service = balancer.service_name().to_string();

        let eligible = balancer.eligible_instances();
        if eligible.len() <= 1 {
            return false;
        }
        let Some(victim) = eligible
            .iter()
            .min_by(|a, b| a.load_score().total_cmp(&b.load_score()))
        else {
            return false;
        };
        let victim_id = victim.id.clone();

        if !balancer.set_status(&victim_id, InstanceStatus::Draining) {
            return false;
        }
        counter!("autoscaler_scale_downs").increment(1);
        info!(
            service = %service,
            instance_id = %victim_id,
            drain_window_secs = self.config.drain_window.as_secs(),
            "Scaling down: draining instance"
        );
        balancer.publish_event(BalancerEvent::ScalingAction {
            service,
            action: ScalingAction::ScaleDown,
            instance_id: victim_id.clone(),
        });

        // In-flight work gets the drain window; only then does the instance
        // leave the registry. Shutdown abandons the removal rather than
        // cutting the window short.
        let balancer = Arc::clone(balancer);
        let drain_window = self.config.drain_window;
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(instance_id = %victim_id, "Shutdown during drain; leaving instance draining");
                }
                _ = sleep(drain_window) => {
                    balancer.unregister(&victim_id);
                }
            }
        });
        true
    }

    /// Start the background evaluation loop
    pub fn start(self: &Arc<Self>) {
        let mut running = self.scaler_running.lock();
        if *running {
            warn!("Auto-scaler already running");
            return;
        }
        *running = true;

        let discovery = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut ticker = interval(discovery.config.evaluation_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = discovery.shutdown.cancelled() => {
                        debug!("Auto-scaler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        discovery.evaluate_once();
                    }
                }
            }
        });
        info!(
            interval_secs = self.config.evaluation_interval.as_secs(),
            "Started auto-scaler"
        );
    }

    /// Stop the evaluation loop and any pending drain tasks, awaiting them all
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        *self.scaler_running.lock() = false;
        info!("Auto-scaler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BalancerConfig;
    use std::collections::HashMap as StdHashMap;

    fn discovery_with(config: AutoScalerConfig) -> Arc<ServiceDiscovery> {
        Arc::new(ServiceDiscovery::new(config).unwrap())
    }

    fn idle_pool(n: usize) -> Arc<LoadBalancer> {
        let lb = Arc::new(
            LoadBalancer::new(BalancerConfig::for_service("transcode")).unwrap(),
        );
        for i in 0..n {
            lb.register_service(
                format!("worker-{}", i),
                "10.0.0.1",
                8080 + i as u16,
                1,
                StdHashMap::new(),
            )
            .unwrap();
        }
        lb
    }

    #[test]
    fn test_registry_add_get_remove() {
        let discovery = ServiceDiscovery::with_defaults();
        let lb = idle_pool(1);
        discovery.add_service(Arc::clone(&lb));

        assert!(discovery.service("transcode").is_some());
        assert_eq!(discovery.service_names(), vec!["transcode".to_string()]);
        assert!(discovery.remove_service("transcode"));
        assert!(discovery.service("transcode").is_none());
        assert!(!discovery.remove_service("transcode"));
    }

    #[tokio::test]
    async fn test_scale_up_clones_a_template_instance() {
        let discovery = discovery_with(AutoScalerConfig::default());
        let lb = idle_pool(1);
        // Force the scale-up predicate: the only instance is out of rotation.
        lb.set_status("worker-0", InstanceStatus::Unhealthy);
        discovery.add_service(Arc::clone(&lb));

        discovery.evaluate_once();

        assert_eq!(lb.instance_count(), 2);
        let cloned = lb
            .instances_snapshot()
            .into_iter()
            .find(|instance| instance.id != "worker-0")
            .unwrap();
        assert!(cloned.id.starts_with("transcode-"));
        assert_eq!(cloned.host, "10.0.0.1");
        assert_eq!(cloned.total_requests, 0);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_back_to_back_actions() {
        let discovery = discovery_with(AutoScalerConfig {
            cooldown: Duration::from_secs(300),
            ..Default::default()
        });
        let lb = idle_pool(1);
        lb.set_status("worker-0", InstanceStatus::Unhealthy);
        discovery.add_service(Arc::clone(&lb));

        discovery.evaluate_once();
        assert_eq!(lb.instance_count(), 2);

        // The new clone inherits nothing that would stop another scale-up —
        // only the cooldown holds the line.
        lb.set_status(
            &lb.instances_snapshot()
                .into_iter()
                .find(|i| i.id != "worker-0")
                .unwrap()
                .id,
            InstanceStatus::Unhealthy,
        );
        discovery.evaluate_once();
        assert_eq!(lb.instance_count(), 2);
    }

    #[tokio::test]
    async fn test_scale_up_without_any_template_skips_and_keeps_trying() {
        let discovery = discovery_with(AutoScalerConfig::default());
        let lb = Arc::new(LoadBalancer::new(BalancerConfig::for_service("transcode")).unwrap());
        discovery.add_service(Arc::clone(&lb));

        discovery.evaluate_once();
        assert_eq!(lb.instance_count(), 0);
        // No action happened, so no cooldown was stamped either.
        assert!(discovery.last_scaling_action.get("transcode").is_none());
    }

    #[tokio::test]
    async fn test_scale_up_respects_max_instances() {
        let discovery = discovery_with(AutoScalerConfig {
            max_instances: 2,
            ..Default::default()
        });
        let lb = idle_pool(2);
        for instance in lb.instances_snapshot() {
            lb.set_status(&instance.id, InstanceStatus::Unhealthy);
        }
        discovery.add_service(Arc::clone(&lb));

        discovery.evaluate_once();
        assert_eq!(lb.instance_count(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_drains_then_unregisters() {
        let discovery = discovery_with(AutoScalerConfig {
            drain_window: Duration::from_millis(50),
            ..Default::default()
        });
        let lb = idle_pool(2);
        discovery.add_service(Arc::clone(&lb));
        assert!(lb.should_scale_down());

        discovery.evaluate_once();

        // Draining immediately: out of rotation but still registered.
        let draining: Vec<_> = lb
            .instances_snapshot()
            .into_iter()
            .filter(|instance| instance.status == InstanceStatus::Draining)
            .collect();
        assert_eq!(draining.len(), 1);
        assert_eq!(lb.instance_count(), 2);
        assert_eq!(lb.eligible_instances().len(), 1);

        // After the drain window the instance leaves the registry.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(lb.instance_count(), 1);
        assert!(lb.instance(&draining[0].id).is_none());
    }

    #[tokio::test]
    async fn test_scale_down_never_goes_below_one_instance() {
        let discovery = discovery_with(AutoScalerConfig {
            drain_window: Duration::from_millis(10),
            ..Default::default()
        });
        let lb = idle_pool(1);
        discovery.add_service(Arc::clone(&lb));

        discovery.evaluate_once();
        assert_eq!(lb.instance_count(), 1);
        assert_eq!(
            lb.instance("worker-0").unwrap().status,
            InstanceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_scale_down_picks_the_lowest_load_score() {
        let discovery = discovery_with(AutoScalerConfig {
            drain_window: Duration::from_secs(60),
            ..Default::default()
        });
        let lb = idle_pool(3);
        // worker-1 is the cheapest; the others carry some latency history.
        lb.record_response("worker-0", 80.0, true);
        lb.record_response("worker-2", 90.0, true);
        discovery.add_service(Arc::clone(&lb));
        assert!(lb.should_scale_down());

        discovery.evaluate_once();
        assert_eq!(
            lb.instance("worker-1").unwrap().status,
            InstanceStatus::Draining
        );
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let discovery = discovery_with(AutoScalerConfig {
            evaluation_interval: Duration::from_millis(20),
            drain_window: Duration::from_millis(20),
            ..Default::default()
        });
        let lb = idle_pool(2);
        discovery.add_service(Arc::clone(&lb));

        discovery.start();
        sleep(Duration::from_millis(100)).await;
        discovery.stop().await;

        // The loop ran at least once: the idle pool shrank toward the floor.
        assert!(lb.instance_count() <= 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(AutoScalerConfig::default().validate().is_ok());
        let bad = AutoScalerConfig {
            max_instances: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
