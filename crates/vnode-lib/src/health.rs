//! Health tracking for the module controller
//!
//! The controller reports on three components (transport, cluster, heartbeat);
//! the binary serves the aggregate on its liveness and readiness endpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing but retried; the controller is still making progress
    Degraded,
    /// Given up
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of the liveness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status wins
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max_by_key(|status| match status {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of the readiness endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const TRANSPORT: &str = "transport";
    pub const CLUSTER: &str = "cluster";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Shared, cloneable health state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    registered: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every controller component starting healthy
    pub fn for_controller() -> Self {
        let components = [
            components::TRANSPORT,
            components::CLUSTER,
            components::HEARTBEAT,
        ]
        .into_iter()
        .map(|name| (name.to_string(), ComponentHealth::healthy()))
        .collect();

        Self {
            components: Arc::new(RwLock::new(components)),
            registered: Arc::default(),
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Healthy on success, degraded with the error text on failure
    pub async fn record<E: Display>(&self, name: &str, outcome: &Result<(), E>) {
        match outcome {
            Ok(()) => self.set_healthy(name).await,
            Err(e) => self.set_degraded(name, e.to_string()).await,
        }
    }

    /// Whether the virtual node is registered and served by a running controller
    pub async fn set_node_registered(&self, registered: bool) {
        *self.registered.write().await = registered;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let registered = *self.registered.read().await;
        let status = self.health().await.status;

        let reason = if !registered {
            Some("virtual node not registered")
        } else if status == ComponentStatus::Unhealthy {
            Some("controller component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_controller_components_registered() {
        let registry = HealthRegistry::for_controller();
        let health = registry.health().await;

        assert_eq!(health.components.len(), 3);
        assert_eq!(
            health.components[components::HEARTBEAT].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_record_transport_failure_degrades() {
        let registry = HealthRegistry::for_controller();
        let failed: Result<(), TransportError> = Err(TransportError::Disconnected);
        registry.record(components::TRANSPORT, &failed).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.components[components::TRANSPORT]
            .message
            .as_deref()
            .unwrap()
            .contains("connection lost"));

        registry.record::<TransportError>(components::TRANSPORT, &Ok(())).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_wins_over_degraded() {
        let registry = HealthRegistry::for_controller();
        registry.set_degraded(components::TRANSPORT, "probe timed out").await;
        registry.set_unhealthy(components::CLUSTER, "forbidden").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_not_ready_until_node_registered() {
        let registry = HealthRegistry::for_controller();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("virtual node not registered"));

        registry.set_node_registered(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_component_unhealthy() {
        let registry = HealthRegistry::for_controller();
        registry.set_node_registered(true).await;
        registry.set_unhealthy(components::HEARTBEAT, "heartbeat lost").await;

        assert!(!registry.readiness().await.ready);
    }
}
