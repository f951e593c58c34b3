//! Register controller: the virtual node's lifecycle driver
//!
//! This module provides:
//! - Node registration and deregistration
//! - A heartbeat loop that keeps node readiness in line with base liveness
//! - A reconciliation loop that installs/uninstalls biz modules and pushes pod status
//! - Run/done/err completion semantics for the owning process

mod completion;
mod config;
mod heartbeat;
mod inbound;
mod reconcile;
mod store;


pub use config::ControllerConfig;
pub use store::{BizRecord, BizStateStore, StateChange};

use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::error::{Error, Result};
use crate::health::{components, HealthRegistry};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::translate::build_virtual_node;
use crate::transport::{MqttClient, Topics, Transport};
use completion::Completion;
use inbound::{BaseLiveness, Inbound};
use k8s_openapi::api::core::v1::Node;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state of one controller instance
pub(crate) struct Inner {
    config: ControllerConfig,
    node_name: String,
    topics: Topics,
    transport: Arc<dyn Transport>,
    cluster: Arc<dyn ClusterClient>,
    inbound: Inbound,
    subscribed: AtomicBool,
    health: HealthRegistry,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    completion: Completion,
}

/// Drives one virtual node from registration to teardown
pub struct RegisterController {
    inner: Arc<Inner>,
    started: AtomicBool,
}

impl RegisterController {
    /// Connect the transport and load cluster credentials.
    ///
    /// Fails with `Connection` when the broker cannot be reached and with
    /// `ClusterAccess` when the cluster configuration cannot be loaded. Nothing
    /// is registered until [`run`](Self::run).
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let transport = MqttClient::connect(config.mqtt.clone()).await?;
        let cluster = KubeClusterClient::from_kubeconfig(config.kube_config_path.as_deref()).await?;
        Ok(Self::with_parts(config, Arc::new(transport), Arc::new(cluster)))
    }

    /// Assemble a controller from already constructed collaborators
    pub fn with_parts(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let node_name = config.node_name();
        let logger = StructuredLogger::new(node_name.clone());
        let metrics = ControllerMetrics::new();
        let inbound = Inbound {
            store: BizStateStore::new(),
            liveness: Arc::new(BaseLiveness::default()),
            dirty: Arc::new(Notify::new()),
            metrics: metrics.clone(),
            logger: logger.clone(),
        };

        Self {
            inner: Arc::new(Inner {
                topics: config.topics(),
                node_name,
                config,
                transport,
                cluster,
                inbound,
                subscribed: AtomicBool::new(false),
                health: HealthRegistry::for_controller(),
                metrics,
                logger,
                completion: Completion::default(),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Start the controller in the background and return immediately.
    ///
    /// Cancelling `ctx` shuts the controller down; [`done`](Self::done) resolves
    /// once teardown has finished. A controller runs at most once.
    pub fn run(&self, ctx: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        tokio::spawn(self.inner.clone().run(ctx));
        Ok(())
    }

    /// Resolves once the run loop has fully exited; safe to await from many tasks
    pub async fn done(&self) {
        self.inner.completion.wait().await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.completion.is_done()
    }

    /// The error that ended the run loop, available after `done`
    pub fn err(&self) -> Option<Error> {
        self.inner.completion.err()
    }

    pub fn health(&self) -> HealthRegistry {
        self.inner.health.clone()
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    /// Snapshot of observed biz state
    pub fn biz_states(&self) -> BizStateStore {
        self.inner.inbound.store.clone()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, ctx: CancellationToken) {
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &self.config.mqtt.broker);

        let stop = ctx.child_token();
        let mut node = Node::default();
        build_virtual_node(&self.config.node, &mut node);
        node.metadata.name = Some(self.node_name.clone());

        if let Err(e) = self
            .bounded("register node", self.cluster.register_node(&node))
            .await
        {
            warn!(node = %self.node_name, error = %e, "Failed to register virtual node");
            self.health
                .set_unhealthy(components::CLUSTER, e.to_string())
                .await;
            self.completion.record(Some(e));
            self.transport.disconnect().await;
            self.logger.log_shutdown("registration failed");
            self.completion.finish();
            return;
        }
        self.logger.log_node_registered(&self.config.node.node_ip);
        self.health.set_node_registered(true).await;

        self.ensure_subscribed().await;

        let tasks = vec![
            tokio::spawn(heartbeat::run(self.clone(), node, stop.clone())),
            tokio::spawn(reconcile::run(self.clone(), stop.clone())),
            tokio::spawn(self.clone().resubscribe_on_reconnect(stop.clone())),
        ];

        stop.cancelled().await;
        if ctx.is_cancelled() {
            self.completion.record(None);
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Controller task ended abnormally");
            }
        }

        self.teardown().await;
        self.completion.finish();
    }

    /// Record a fatal error and stop every loop
    fn fail(&self, err: Error, stop: &CancellationToken) {
        if self.completion.record(Some(err.clone())) {
            warn!(node = %self.node_name, error = %err, "Controller stopping on fatal error");
        }
        stop.cancel();
    }

    /// Run a cluster call with the operation deadline; a timeout is a
    /// `ClusterAccess` failure like any other
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.operation_timeout;
        tokio::time::timeout(timeout, call).await.map_err(|_| {
            Error::cluster_access(format!("{} timed out after {:?}", what, timeout))
        })?
    }

    /// Subscribe to the base topics unless already subscribed
    async fn ensure_subscribed(&self) -> bool {
        if self.subscribed.load(Ordering::SeqCst) {
            return true;
        }
        let ok = self.subscribe_all().await;
        self.subscribed.store(ok, Ordering::SeqCst);
        ok
    }

    async fn subscribe_all(&self) -> bool {
        let subscriptions = [
            (self.topics.biz_state(), self.inbound.biz_handler()),
            (self.topics.base_heart(), self.inbound.heartbeat_handler()),
        ];

        let mut all_ok = true;
        for (topic, handler) in subscriptions {
            let result = self
                .transport
                .subscribe_with_timeout(
                    &topic,
                    self.config.command_qos,
                    handler,
                    self.config.operation_timeout,
                )
                .await;
            self.health.record(components::TRANSPORT, &result).await;
            match result {
                Ok(()) => debug!(topic = %topic, "Subscribed"),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscribe failed, retrying next tick");
                    self.metrics.inc_transport_failure("subscribe");
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Re-issue subscriptions after every reconnect
    async fn resubscribe_on_reconnect(self: Arc<Self>, stop: CancellationToken) {
        let mut sessions = self.transport.sessions();
        sessions.borrow_and_update();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = *sessions.borrow_and_update();
                    info!(session, "Transport reconnected, re-subscribing");
                    self.subscribed.store(false, Ordering::SeqCst);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = self.ensure_subscribed() => {}
                    }
                }
            }
        }
    }

    async fn teardown(&self) {
        let timeout = self.config.operation_timeout;
        for topic in [self.topics.biz_state(), self.topics.base_heart()] {
            match tokio::time::timeout(timeout, self.transport.unsubscribe(&topic)).await {
                Ok(Ok(())) => debug!(topic = %topic, "Unsubscribed"),
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "Unsubscribe failed"),
                Err(_) => warn!(topic = %topic, "Unsubscribe timed out"),
            }
        }

        let deleted = matches!(
            tokio::time::timeout(
                self.config.shutdown_timeout,
                self.cluster.delete_node(&self.node_name)
            )
            .await,
            Ok(Ok(()))
        );
        self.logger.log_node_deregistered(deleted);

        self.health.set_node_registered(false).await;
        self.metrics.set_node_ready(false);
        self.transport.disconnect().await;

        let reason = if self.completion.err_recorded() {
            "fatal error"
        } else {
            "cancelled"
        };
        self.logger.log_shutdown(reason);
    }
}
