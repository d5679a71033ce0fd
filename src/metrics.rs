//! Prometheus metrics for action execution
//!
//! # Available Metrics
//!
//! - `deploy_actions_total{action_type, status}` - Counter of finished actions
//! - `deploy_check_items_total{protocol, status}` - Counter of finished connectivity check items
//! - `deploy_action_duration_seconds{action_type}` - Histogram of action durations
//! - `deploy_active_actions` - Gauge of actions currently executing
//!
//! The CLI renders the registry in text format at the end of a run.
//!
//! # Example
//!
//! ```
//! use deploy_core::metrics::DeployMetrics;
//!
//! let metrics = DeployMetrics::new().unwrap();
//! metrics.record_action("ConnectivityCheck", "done", 2.5);
//! metrics.record_check_item("TCP", "failed");
//! assert!(metrics.render().unwrap().contains("deploy_actions_total"));
//! ```

use crate::error::Result;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Histogram bucket boundaries for action duration metrics (in seconds)
const ACTION_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Prometheus registry with the deployment core's metrics
#[derive(Clone)]
pub struct DeployMetrics {
    registry: Arc<Registry>,
    actions: CounterVec,
    check_items: CounterVec,
    action_duration: HistogramVec,
    active_actions: Gauge,
}

impl DeployMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let actions = CounterVec::new(
            Opts::new("deploy_actions_total", "Total number of finished actions"),
            &["action_type", "status"],
        )?;

        let check_items = CounterVec::new(
            Opts::new(
                "deploy_check_items_total",
                "Total number of finished connectivity check items",
            ),
            &["protocol", "status"],
        )?;

        let action_duration = HistogramVec::new(
            HistogramOpts::new(
                "deploy_action_duration_seconds",
                "Action execution duration in seconds",
            )
            .buckets(ACTION_DURATION_BUCKETS.to_vec()),
            &["action_type"],
        )?;

        let active_actions =
            Gauge::with_opts(Opts::new("deploy_active_actions", "Actions currently executing"))?;

        registry.register(Box::new(actions.clone()))?;
        registry.register(Box::new(check_items.clone()))?;
        registry.register(Box::new(action_duration.clone()))?;
        registry.register(Box::new(active_actions.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            actions,
            check_items,
            action_duration,
            active_actions,
        })
    }

    /// Record a finished action
    pub fn record_action(&self, action_type: &str, status: &str, duration_secs: f64) {
        self.actions
            .with_label_values(&[action_type, status])
            .inc();
        self.action_duration
            .with_label_values(&[action_type])
            .observe(duration_secs);
    }

    /// Record a finished connectivity check item
    pub fn record_check_item(&self, protocol: &str, status: &str) {
        self.check_items
            .with_label_values(&[protocol, status])
            .inc();
    }

    pub fn inc_active_actions(&self) {
        self.active_actions.inc();
    }

    pub fn dec_active_actions(&self) {
        self.active_actions.dec();
    }

    /// Prometheus text exposition of all metrics
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
