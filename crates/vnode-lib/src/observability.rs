//! Observability infrastructure for the module controller
//!
//! Provides:
//! - Prometheus metrics (biz messages, commands, transport and heartbeat failures,
//!   reconcile latency, managed pods, node readiness)
//! - Structured lifecycle events with a stable `event` field

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Reconcile pass latency buckets (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    biz_messages: IntCounter,
    malformed_messages: IntCounter,
    commands_published: IntCounterVec,
    transport_failures: IntCounterVec,
    heartbeat_failures: IntCounter,
    reconcile_latency_seconds: Histogram,
    pods_managed: IntGauge,
    node_ready: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            biz_messages: register_int_counter!(
                "module_controller_biz_messages_total",
                "Biz state records received from the base"
            )
            .expect("Failed to register biz_messages"),

            malformed_messages: register_int_counter!(
                "module_controller_malformed_messages_total",
                "Inbound messages dropped because they could not be decoded"
            )
            .expect("Failed to register malformed_messages"),

            commands_published: register_int_counter_vec!(
                "module_controller_commands_published_total",
                "Install and uninstall commands acknowledged by the broker",
                &["command"]
            )
            .expect("Failed to register commands_published"),

            transport_failures: register_int_counter_vec!(
                "module_controller_transport_failures_total",
                "Failed or timed out transport operations",
                &["operation"]
            )
            .expect("Failed to register transport_failures"),

            heartbeat_failures: register_int_counter!(
                "module_controller_heartbeat_failures_total",
                "Liveness probes that were not acknowledged"
            )
            .expect("Failed to register heartbeat_failures"),

            reconcile_latency_seconds: register_histogram!(
                "module_controller_reconcile_latency_seconds",
                "Time spent in one reconciliation pass",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),

            pods_managed: register_int_gauge!(
                "module_controller_pods_managed",
                "Pods currently bound to the virtual node"
            )
            .expect("Failed to register pods_managed"),

            node_ready: register_int_gauge!(
                "module_controller_node_ready",
                "1 when the virtual node is Ready"
            )
            .expect("Failed to register node_ready"),
        }
    }
}

/// Lightweight handle to the process-wide metrics; clones share them
#[derive(Clone)]
pub struct ControllerMetrics {
    inner: &'static ControllerMetricsInner,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new),
        }
    }

    pub fn inc_biz_messages(&self, records: usize) {
        self.inner.biz_messages.inc_by(records as u64);
    }

    pub fn inc_malformed_messages(&self) {
        self.inner.malformed_messages.inc();
    }

    /// `command` is `install` or `uninstall`
    pub fn inc_command_published(&self, command: &str) {
        self.inner
            .commands_published
            .with_label_values(&[command])
            .inc();
    }

    pub fn inc_transport_failure(&self, operation: &str) {
        self.inner
            .transport_failures
            .with_label_values(&[operation])
            .inc();
    }

    pub fn inc_heartbeat_failures(&self) {
        self.inner.heartbeat_failures.inc();
    }

    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner.reconcile_latency_seconds.observe(duration_secs);
    }

    pub fn set_pods_managed(&self, count: i64) {
        self.inner.pods_managed.set(count);
    }

    pub fn set_node_ready(&self, ready: bool) {
        self.inner.node_ready.set(i64::from(ready));
    }
}

/// Structured logger for controller lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, broker: &str) {
        info!(
            event = "controller_started",
            node = %self.node_name,
            controller_version = %version,
            broker = %broker,
            "Module controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Module controller shutting down"
        );
    }

    pub fn log_node_registered(&self, node_ip: &str) {
        info!(
            event = "node_registered",
            node = %self.node_name,
            node_ip = %node_ip,
            "Virtual node registered"
        );
    }

    pub fn log_node_deregistered(&self, success: bool) {
        if success {
            info!(
                event = "node_deregistered",
                node = %self.node_name,
                "Virtual node removed from the cluster"
            );
        } else {
            warn!(
                event = "node_deregistered",
                node = %self.node_name,
                "Failed to remove virtual node from the cluster"
            );
        }
    }

    pub fn log_node_readiness(&self, ready: bool, reason: &str) {
        if ready {
            info!(
                event = "node_readiness_changed",
                node = %self.node_name,
                ready = true,
                reason = %reason,
                "Virtual node is ready"
            );
        } else {
            warn!(
                event = "node_readiness_changed",
                node = %self.node_name,
                ready = false,
                reason = %reason,
                "Virtual node is not ready"
            );
        }
    }

    pub fn log_command(&self, command: &str, pod: &str, biz: &str) {
        info!(
            event = "biz_command_published",
            node = %self.node_name,
            command = %command,
            pod = %pod,
            biz = %biz,
            "Published biz command"
        );
    }

    pub fn log_biz_state(&self, biz: &str, previous: Option<&str>, state: &str) {
        info!(
            event = "biz_state_changed",
            node = %self.node_name,
            biz = %biz,
            previous = ?previous,
            state = %state,
            "Biz state changed"
        );
    }

    pub fn log_malformed(&self, topic: &str, reason: &str) {
        warn!(
            event = "malformed_message_dropped",
            node = %self.node_name,
            topic = %topic,
            reason = %reason,
            "Dropped malformed message"
        );
    }
}
