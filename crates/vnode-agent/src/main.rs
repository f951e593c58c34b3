//! Module Controller - virtual node for remotely hosted biz modules
//!
//! This binary registers a virtual node in the cluster, installs the biz
//! modules of pods scheduled onto it over MQTT, and reports their state back
//! as pod status.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vnode_lib::RegisterController;

mod api;
mod config;

/// Virtual node module controller
#[derive(Parser)]
#[command(name = "module-controller")]
#[command(author, version, about = "Virtual node for remotely hosted biz modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the virtual node and run until interrupted
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Defaults to module-controller@@@<random id>
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    #[arg(long, env = "MQTT_USERNAME", default_value = "")]
    pub mqtt_username: String,

    #[arg(long, env = "MQTT_PASSWORD", default_value = "", hide_env_values = true)]
    pub mqtt_password: String,

    /// CA bundle; enables TLS
    #[arg(long, env = "MQTT_CA_PATH")]
    pub mqtt_ca_path: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[arg(long, env = "MQTT_CLIENT_CRT_PATH", requires = "mqtt_client_key_path")]
    pub mqtt_client_crt_path: Option<PathBuf>,

    /// Client private key for mutual TLS
    #[arg(long, env = "MQTT_CLIENT_KEY_PATH", requires = "mqtt_client_crt_path")]
    pub mqtt_client_key_path: Option<PathBuf>,

    #[arg(long, env = "MQTT_CLEAN_SESSION", default_value_t = true, action = clap::ArgAction::Set)]
    pub clean_session: bool,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 60)]
    pub keep_alive_secs: u64,

    /// Path to kubeconfig file (in-cluster config if none is found)
    #[arg(long, env = "KUBE_CONFIG_PATH")]
    pub kubeconfig: Option<String>,

    /// Node identity used in topic names; a random id when unset
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "NODE_IP")]
    pub node_ip: Option<String>,

    /// Name of the base runtime hosting the modules
    #[arg(long, env = "BIZ_NAME", default_value = "base")]
    pub biz_name: String,

    #[arg(long, env = "TECH_STACK", default_value = "java")]
    pub tech_stack: String,

    /// Base version reported on the node
    #[arg(long, env = "BASE_VERSION", default_value = "1.0.0")]
    pub version: String,

    /// Overrides MODULE_CONTROLLER_API_PORT
    #[arg(long)]
    pub api_port: Option<u16>,

    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    #[arg(long)]
    pub heartbeat_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let instance_id = uuid::Uuid::new_v4().to_string();
    let agent_config = config::AgentConfig::load()?;
    let controller_config = agent_config.controller_config(&args, &instance_id)?;
    info!(
        instance_id = %instance_id,
        node_id = %controller_config.node.node_id,
        broker = %controller_config.mqtt.broker,
        "Starting module-controller"
    );

    let controller = RegisterController::new(controller_config)
        .await
        .context("Failed to start register controller")?;

    let app_state = Arc::new(api::AppState::new(controller.health()));
    let ctx = CancellationToken::new();
    let api_port = args.api_port.unwrap_or(agent_config.api_port);
    let api_handle = tokio::spawn(api::serve(api_port, app_state, ctx.clone()));

    controller.run(ctx.clone())?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        _ = controller.done() => {}
    }

    ctx.cancel();
    controller.done().await;

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    if let Some(err) = controller.err() {
        return Err(err).context("Register controller stopped");
    }
    info!("Shutdown complete");
    Ok(())
}
