//! Agent configuration

use crate::RunArgs;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vnode_lib::{BuildVirtualNodeConfig, ClientConfig, ControllerConfig, QoS};

/// Tunables read from `MODULE_CONTROLLER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Deadline for a single publish or subscribe
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Base heartbeats older than this mark the node not ready
    #[serde(default = "default_base_heartbeat_timeout")]
    pub base_heartbeat_timeout_secs: u64,

    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,

    #[serde(default = "default_max_cluster_failures")]
    pub max_cluster_failures: u32,

    /// QoS level (0, 1 or 2) for install/uninstall commands
    #[serde(default = "default_command_qos")]
    pub command_qos: u8,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    3
}

fn default_base_heartbeat_timeout() -> u64 {
    30
}

fn default_max_heartbeat_failures() -> u32 {
    3
}

fn default_max_cluster_failures() -> u32 {
    5
}

fn default_command_qos() -> u8 {
    1
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            reconcile_interval_secs: default_reconcile_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            operation_timeout_secs: default_operation_timeout(),
            base_heartbeat_timeout_secs: default_base_heartbeat_timeout(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            max_cluster_failures: default_max_cluster_failures(),
            command_qos: default_command_qos(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from an optional `module-controller` config file,
    /// then the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("module-controller").required(false))
            .add_source(config::Environment::with_prefix("MODULE_CONTROLLER"))
            .build()?;

        config
            .try_deserialize()
            .context("Invalid MODULE_CONTROLLER_* configuration")
    }

    /// Combine command-line flags with these tunables.
    ///
    /// `instance_id` names the MQTT client and, when no node id is given, the node.
    pub fn controller_config(&self, args: &RunArgs, instance_id: &str) -> Result<ControllerConfig> {
        let command_qos = QoS::from_level(self.command_qos)
            .with_context(|| format!("Invalid command QoS {}", self.command_qos))?;

        let reconcile_interval = args
            .reconcile_interval_secs
            .unwrap_or(self.reconcile_interval_secs);
        let heartbeat_interval = args
            .heartbeat_interval_secs
            .unwrap_or(self.heartbeat_interval_secs);

        Ok(ControllerConfig {
            mqtt: ClientConfig {
                broker: args.mqtt_broker.clone(),
                port: args.mqtt_port,
                client_id: args
                    .mqtt_client_id
                    .clone()
                    .unwrap_or_else(|| format!("module-controller@@@{}", instance_id)),
                username: args.mqtt_username.clone(),
                password: args.mqtt_password.clone(),
                ca_path: args.mqtt_ca_path.clone(),
                client_crt_path: args.mqtt_client_crt_path.clone(),
                client_key_path: args.mqtt_client_key_path.clone(),
                clean_session: args.clean_session,
                keep_alive: Duration::from_secs(args.keep_alive_secs),
                ..Default::default()
            },
            kube_config_path: kubeconfig_path(args.kubeconfig.as_deref()),
            node: BuildVirtualNodeConfig {
                node_id: args
                    .node_id
                    .clone()
                    .unwrap_or_else(|| instance_id.to_string()),
                node_ip: args.node_ip.clone().unwrap_or_default(),
                biz_name: args.biz_name.clone(),
                tech_stack: args.tech_stack.clone(),
                version: args.version.clone(),
            },
            reconcile_interval: Duration::from_secs(reconcile_interval),
            heartbeat_interval: Duration::from_secs(heartbeat_interval),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            base_heartbeat_timeout: Duration::from_secs(self.base_heartbeat_timeout_secs),
            max_heartbeat_failures: self.max_heartbeat_failures,
            max_cluster_failures: self.max_cluster_failures,
            command_qos,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        })
    }
}

/// Kubeconfig to load: the flag, then `$KUBECONFIG`, then `~/.kube/config`
/// if it exists. `None` falls back to in-cluster configuration.
pub fn kubeconfig_path(override_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = override_path.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs_next::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .filter(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["module-controller", "--mqtt-broker", "broker.local"];
        argv.extend_from_slice(extra);
        RunArgs::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.max_heartbeat_failures, 3);
        assert_eq!(config.command_qos, 1);
    }

    #[test]
    fn test_controller_config_from_flags() {
        let args = run_args(&[
            "--node-id",
            "base-1",
            "--node-ip",
            "10.0.0.7",
            "--reconcile-interval-secs",
            "2",
        ]);
        let config = AgentConfig::default()
            .controller_config(&args, "4f1c")
            .unwrap();

        assert_eq!(config.mqtt.broker, "broker.local");
        assert_eq!(config.mqtt.client_id, "module-controller@@@4f1c");
        assert_eq!(config.node.node_id, "base-1");
        assert_eq!(config.node.node_ip, "10.0.0.7");
        assert_eq!(config.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_id_defaults_to_instance_id() {
        let config = AgentConfig::default()
            .controller_config(&run_args(&[]), "4f1c")
            .unwrap();
        assert_eq!(config.node.node_id, "4f1c");
        assert_eq!(config.node_name(), "vnode-4f1c");
    }

    #[test]
    fn test_explicit_client_id() {
        let config = AgentConfig::default()
            .controller_config(&run_args(&["--mqtt-client-id", "controller-a"]), "4f1c")
            .unwrap();
        assert_eq!(config.mqtt.client_id, "controller-a");
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let config = AgentConfig {
            command_qos: 3,
            ..Default::default()
        };
        assert!(config.controller_config(&run_args(&[]), "id").is_err());
    }

    #[test]
    fn test_kubeconfig_flag_wins() {
        assert_eq!(
            kubeconfig_path(Some("/tmp/kubeconfig")),
            Some(PathBuf::from("/tmp/kubeconfig"))
        );
    }
}
