//! Virtual node library for remotely hosted biz modules
//!
//! This crate provides the core functionality for:
//! - MQTT transport with acknowledged publish/subscribe
//! - Translation between cluster objects and biz module descriptors
//! - The register controller that drives the virtual node's lifecycle
//! - Health checks and observability

pub mod cluster;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod translate;
pub mod transport;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use controller::{BizStateStore, ControllerConfig, RegisterController};
pub use error::{Error, Result, TransportError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use transport::{ClientConfig, Handlers, Message, MqttClient, MqttClientBuilder, QoS, Transport};
