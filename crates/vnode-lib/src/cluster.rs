//! Cluster API boundary
//!
//! The controller only needs node registration, pod listing for its node and
//! status writes. `ClusterClient` is the seam; `KubeClusterClient` backs it
//! with the kube client.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodStatus};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const FIELD_MANAGER: &str = "module-controller";

/// Cluster operations the controller depends on
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the node, or replace it when one with the same name exists
    async fn register_node(&self, node: &Node) -> Result<()>;

    /// Write the node's status subresource
    async fn update_node_status(&self, node: &Node) -> Result<()>;

    /// Delete the node; a missing node is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Pods bound to the node, across namespaces
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    async fn update_pod_status(&self, namespace: &str, name: &str, status: &PodStatus)
        -> Result<()>;

    /// Delete immediately, without a grace period; a missing pod is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// kube-backed [`ClusterClient`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from a kubeconfig file, or infer (in-cluster, then default
    /// kubeconfig) when no path is given
    pub async fn from_kubeconfig(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::cluster_access(format!("failed to read kubeconfig {:?}: {}", path, e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::cluster_access(format!("invalid kubeconfig {:?}: {}", path, e))
                    })?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::cluster_access(format!("failed to infer config: {}", e)))?,
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        info!(cluster_url = %config.cluster_url, "Using cluster API");
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn register_node(&self, node: &Node) -> Result<()> {
        let api = self.nodes();
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::config("node has no name"))?;

        match api.get_opt(&name).await? {
            Some(existing) => {
                let mut replacement = node.clone();
                replacement.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &replacement)
                    .await?;
                debug!(node = %name, "Replaced existing node");
            }
            None => {
                api.create(&PostParams::default(), node).await?;
                debug!(node = %name, "Created node");
            }
        }

        // Status is ignored on create/replace; write it through the subresource
        self.update_node_status(node).await
    }

    async fn update_node_status(&self, node: &Node) -> Result<()> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::config("node has no name"))?;
        let patch = json!({ "status": node.status });
        self.nodes()
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = Api::<Pod>::all(self.client.clone()).list(&params).await?;
        Ok(pods.items)
    }

    async fn update_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        self.pods(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
