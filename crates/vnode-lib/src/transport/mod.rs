//! Pub/sub transport used by the controller
//!
//! This module provides:
//! - The `Transport` trait the controller depends on
//! - An MQTT implementation over rumqttc with TCP or verified TLS
//! - Message handler types with logging-only defaults
//! - Topic layout and MQTT topic-filter matching

mod acks;
mod client;
mod tls;
mod topic;

pub use client::{ClientConfig, MqttClient, MqttClientBuilder};
pub use topic::{topic_matches, Topics};

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Delivery guarantee for a single publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Delivered, duplicates possible
    #[default]
    AtLeastOnce,
    /// Delivered once
    ExactlyOnce,
}

impl QoS {
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type OnConnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type ConnectionLostHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks invoked by the transport.
///
/// Every handler has a logging-only default, so a caller only overrides what it
/// cares about.
#[derive(Clone)]
pub struct Handlers {
    /// Messages on topics without a subscription handler
    pub default_message: MessageHandler,
    /// Every successful connect, including reconnects
    pub on_connect: OnConnectHandler,
    /// Every connection loss, with the cause
    pub connection_lost: ConnectionLostHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            default_message: Arc::new(|msg: &Message| {
                info!(
                    topic = %msg.topic,
                    bytes = msg.payload.len(),
                    "Received message without subscription handler"
                );
            }),
            on_connect: Arc::new(|| info!("Connected to MQTT broker")),
            connection_lost: Arc::new(|cause: &str| {
                warn!(cause = %cause, "Lost connection to MQTT broker")
            }),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Client contract the controller depends on.
///
/// `Ok(())` means the broker acknowledged the operation (or, for QoS 0, that it
/// was written out).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish and wait for the result without a deadline
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Publish, failing with `Timeout` if the result is not known in time
    async fn publish_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Subscribe and route matching messages to `handler`
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError>;

    async fn subscribe_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Count of successful connects; changes on every reconnect
    fn sessions(&self) -> watch::Receiver<u64>;

    /// Close the connection; later operations fail
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        for level in 0..=2 {
            let qos = QoS::from_level(level).unwrap();
            assert_eq!(qos.level(), level);
            assert_eq!(QoS::from(rumqttc::QoS::from(qos)), qos);
        }
        assert!(QoS::from_level(3).is_none());
        assert_eq!(QoS::default(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_default_handlers_do_not_panic() {
        let handlers = Handlers::default();
        (handlers.default_message)(&Message {
            topic: "koupleless/n1/base/biz".to_string(),
            payload: b"{}".to_vec(),
            qos: QoS::AtMostOnce,
            retained: false,
        });
        (handlers.on_connect)();
        (handlers.connection_lost)("reset by peer");
    }
}
