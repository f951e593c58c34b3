use crate::error::{Error, Result};
use crate::models::BuildVirtualNodeConfig;
use crate::translate::virtual_node_name;
use crate::transport::{ClientConfig, QoS, Topics};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the register controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Broker connection settings
    pub mqtt: ClientConfig,
    /// Kubeconfig to use; `None` infers in-cluster or default config
    pub kube_config_path: Option<PathBuf>,
    /// Virtual node identity and labels
    pub node: BuildVirtualNodeConfig,
    /// Period of the pod reconciliation pass
    pub reconcile_interval: Duration,
    /// Period of the liveness probe
    pub heartbeat_interval: Duration,
    /// Deadline for individual publish/subscribe/unsubscribe calls
    pub operation_timeout: Duration,
    /// A base heartbeat older than this marks the node not ready
    pub base_heartbeat_timeout: Duration,
    /// Consecutive failed probes before the controller gives up
    pub max_heartbeat_failures: u32,
    /// Consecutive failed pod listings before the controller gives up
    pub max_cluster_failures: u32,
    /// QoS for install/uninstall commands
    pub command_qos: QoS,
    /// Bound on node deregistration during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mqtt: ClientConfig::default(),
            kube_config_path: None,
            node: BuildVirtualNodeConfig::default(),
            reconcile_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(3),
            base_heartbeat_timeout: Duration::from_secs(30),
            max_heartbeat_failures: 3,
            max_cluster_failures: 5,
            command_qos: QoS::AtLeastOnce,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    pub fn topics(&self) -> Topics {
        Topics::new(self.node.node_id.clone())
    }

    pub fn node_name(&self) -> String {
        virtual_node_name(&self.node.node_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(Error::config("node id must not be empty"));
        }
        if self.node.node_id.contains(['/', '+', '#']) {
            return Err(Error::config(format!(
                "node id {:?} contains MQTT topic separators or wildcards",
                self.node.node_id
            )));
        }
        for (name, value) in [
            ("reconcile_interval", self.reconcile_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("operation_timeout", self.operation_timeout),
            ("base_heartbeat_timeout", self.base_heartbeat_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.max_heartbeat_failures == 0 || self.max_cluster_failures == 0 {
            return Err(Error::config("failure thresholds must be at least 1"));
        }
        Ok(())
    }
}
