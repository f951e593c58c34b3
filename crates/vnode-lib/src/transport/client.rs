//! MQTT client over rumqttc
//!
//! A single event-loop task owns the connection. It:
//! - Reconnects automatically after a connection loss
//! - Resolves publish/subscribe/unsubscribe waiters from broker acks
//! - Fails every in-flight operation when the connection drops
//! - Dispatches inbound messages to subscription handlers in arrival order

use super::acks::{AckKind, AckTracker};
use super::tls::load_tls_config;
use super::topic::topic_matches;
use super::{Handlers, Message, MessageHandler, QoS, Transport};
use crate::error::{Error, Result, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Transport as MqttTransport};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;

/// Configuration for the MQTT client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host; a `tcp://` or `ssl://` prefix is accepted and ignored
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// CA bundle; when set the connection uses TLS verified against it
    pub ca_path: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub client_crt_path: Option<PathBuf>,
    /// Client private key for mutual TLS
    pub client_key_path: Option<PathBuf>,
    pub clean_session: bool,
    /// Zero falls back to one minute
    pub keep_alive: Duration,
    /// Bound on establishing the first connection
    pub connect_timeout: Duration,
    /// Pause before reconnecting after a connection loss
    pub reconnect_delay: Duration,
    pub handlers: Handlers,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "module-controller".to_string(),
            username: String::new(),
            password: String::new(),
            ca_path: None,
            client_crt_path: None,
            client_key_path: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            handlers: Handlers::default(),
        }
    }
}

impl ClientConfig {
    fn host(&self) -> &str {
        self.broker
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.broker)
    }

    fn effective_keep_alive(&self) -> Duration {
        if self.keep_alive.is_zero() {
            DEFAULT_KEEP_ALIVE
        } else {
            // rumqttc rejects sub-second keep-alive
            self.keep_alive.max(Duration::from_secs(1))
        }
    }

    fn uses_tls(&self) -> bool {
        self.ca_path.is_some()
    }

    async fn mqtt_options(&self) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host(), self.port);
        options
            .set_keep_alive(self.effective_keep_alive())
            .set_clean_session(self.clean_session);

        if let Some(ca_path) = &self.ca_path {
            let client_pair = match (&self.client_crt_path, &self.client_key_path) {
                (Some(crt), Some(key)) => Some((crt.as_path(), key.as_path())),
                (None, None) => None,
                _ => {
                    return Err(Error::connection(
                        "client certificate and key must be supplied together",
                    ))
                }
            };
            let tls = load_tls_config(ca_path, client_pair).await?;
            options.set_transport(MqttTransport::tls_with_config(tls));
        }

        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }

        Ok(options)
    }
}

struct Shared {
    client: AsyncClient,
    tracker: Mutex<AckTracker>,
    subscriptions: RwLock<Vec<(String, MessageHandler)>>,
    handlers: Handlers,
    sessions: watch::Sender<u64>,
}

impl Shared {
    fn tracker(&self) -> std::sync::MutexGuard<'_, AckTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, message: &Message) {
        let handler = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, handler)| handler.clone());

        match handler {
            Some(handler) => handler(message),
            None => (self.handlers.default_message)(message),
        }
    }

    fn set_handler(&self, topic: &str, handler: MessageHandler) {
        let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        match subs.iter_mut().find(|(filter, _)| filter == topic) {
            Some(entry) => entry.1 = handler,
            None => subs.push((topic.to_string(), handler)),
        }
    }

    fn remove_handler(&self, topic: &str) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(filter, _)| filter != topic);
    }
}

/// MQTT implementation of [`Transport`]
pub struct MqttClient {
    shared: Arc<Shared>,
    broker: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Connect to the broker.
    ///
    /// Blocks until the broker accepts the session; fails with
    /// `Error::Connection` on refusal, TLS or network failure, or timeout.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let options = config.mqtt_options().await?;
        let broker = format!(
            "{}://{}:{}",
            if config.uses_tls() { "ssl" } else { "tcp" },
            config.host(),
            config.port
        );

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(config.connect_timeout.as_secs().max(1));

        info!(broker = %broker, client_id = %config.client_id, "Connecting to MQTT broker");

        wait_for_connack(&mut eventloop, config.connect_timeout)
            .await
            .map_err(|e| Error::connection(format!("{}: {}", broker, e)))?;

        let (sessions, _) = watch::channel(1);
        let shared = Arc::new(Shared {
            client,
            tracker: Mutex::new(AckTracker::default()),
            subscriptions: RwLock::new(Vec::new()),
            handlers: config.handlers.clone(),
            sessions,
        });
        (shared.handlers.on_connect)();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            shared.clone(),
            cancel.clone(),
            config.reconnect_delay,
        ));

        Ok(Self {
            shared,
            broker,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Broker url in `scheme://host:port` form
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Hand a request to the event loop and return the receiver for its ack.
    ///
    /// The tracker lock is held across queueing so waiter order always matches
    /// request order.
    fn submit<F>(
        &self,
        kind: AckKind,
        send: F,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        let (tx, rx) = oneshot::channel();
        let mut tracker = self.shared.tracker();
        tracker.enqueue(kind, tx);
        if let Err(e) = send(&self.shared.client) {
            tracker.cancel_last();
            return Err(TransportError::Client(e.to_string()));
        }
        Ok(rx)
    }

    async fn wait(
        rx: oneshot::Receiver<Result<(), TransportError>>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result.unwrap_or(Err(TransportError::Disconnected)),
                Err(_) => Err(TransportError::Timeout(limit)),
            },
            None => rx.await.unwrap_or(Err(TransportError::Disconnected)),
        }
    }

    async fn do_publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let rx = self.submit(AckKind::Publish, |client| {
            client.try_publish(topic, qos.into(), retained, payload)
        })?;
        let result = Self::wait(rx, timeout).await;
        if let Err(e) = &result {
            debug!(topic = %topic, error = %e, "Publish failed");
        }
        result
    }

    async fn do_subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.shared.set_handler(topic, handler);
        let rx = self.submit(AckKind::Subscribe, |client| {
            client.try_subscribe(topic, qos.into())
        })?;
        let result = Self::wait(rx, timeout).await;
        if let Err(TransportError::Rejected(_)) = &result {
            self.shared.remove_handler(topic);
        }
        result
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.do_publish(topic, qos, retained, payload, None).await
    }

    async fn publish_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.do_publish(topic, qos, retained, payload, Some(timeout))
            .await
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError> {
        self.do_subscribe(topic, qos, handler, None).await
    }

    async fn subscribe_with_timeout(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.do_subscribe(topic, qos, handler, Some(timeout)).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.shared.remove_handler(topic);
        let rx = self.submit(AckKind::Unsubscribe, |client| client.try_unsubscribe(topic))?;
        Self::wait(rx, None).await
    }

    fn sessions(&self) -> watch::Receiver<u64> {
        self.shared.sessions.subscribe()
    }

    async fn disconnect(&self) {
        if let Err(e) = self.shared.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
        }

        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                self.cancel.cancel();
                let _ = task.await;
            }
        }
        self.shared.tracker().fail_all(TransportError::Disconnected);
        info!(broker = %self.broker, "Disconnected from MQTT broker");
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for MqttClient configuration
pub struct MqttClientBuilder {
    config: ClientConfig,
}

impl Default for MqttClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn broker(mut self, broker: impl Into<String>) -> Self {
        self.config.broker = broker.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, crt: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.client_crt_path = Some(crt.into());
        self.config.client_key_path = Some(key.into());
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.config.clean_session = clean;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.config.handlers = handlers;
        self
    }

    pub fn config(self) -> ClientConfig {
        self.config
    }

    pub async fn connect(self) -> Result<MqttClient> {
        MqttClient::connect(self.config).await
    }
}

async fn wait_for_connack(
    eventloop: &mut EventLoop,
    timeout: Duration,
) -> Result<(), String> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(format!("no CONNACK within {:?}", timeout)),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.sessions.send_modify(|n| *n += 1);
                (shared.handlers.on_connect)();
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    qos: publish.qos.into(),
                    retained: publish.retain,
                };
                shared.dispatch(&message);
            }
            Ok(Event::Incoming(packet)) => shared.tracker().on_incoming(&packet),
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(Event::Outgoing(outgoing)) => shared.tracker().on_outgoing(&outgoing),
            Err(e) => {
                (shared.handlers.connection_lost)(&e.to_string());
                {
                    // Nothing is replayed after a reconnect; callers retry
                    let mut tracker = shared.tracker();
                    eventloop.clean();
                    eventloop.pending.clear();
                    tracker.fail_all(TransportError::Disconnected);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    let mut tracker = shared.tracker();
    if tracker.outstanding() > 0 {
        warn!(outstanding = tracker.outstanding(), "Event loop stopped with unresolved operations");
    }
    tracker.fail_all(TransportError::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert!(config.clean_session);
        assert!(!config.uses_tls());
    }

    #[test]
    fn test_zero_keep_alive_falls_back_to_one_minute() {
        let config = MqttClientBuilder::new()
            .keep_alive(Duration::ZERO)
            .config();
        assert_eq!(config.effective_keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_broker_scheme_is_stripped() {
        let config = MqttClientBuilder::new().broker("ssl://broker.local").config();
        assert_eq!(config.host(), "broker.local");

        let config = MqttClientBuilder::new().broker("broker.local").config();
        assert_eq!(config.host(), "broker.local");
    }

    #[test]
    fn test_builder() {
        let config = MqttClientBuilder::new()
            .broker("mqtt.example")
            .port(8883)
            .client_id("module-controller@@@abc")
            .credentials("user", "secret")
            .ca_path("/etc/certs/ca.crt")
            .client_cert("/etc/certs/tls.crt", "/etc/certs/tls.key")
            .clean_session(false)
            .config();

        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "module-controller@@@abc");
        assert_eq!(config.username, "user");
        assert!(config.uses_tls());
        assert!(!config.clean_session);
    }

    #[tokio::test]
    async fn test_plaintext_options_carry_credentials() {
        let config = MqttClientBuilder::new()
            .broker("tcp://broker.local")
            .port(1883)
            .client_id("c1")
            .credentials("user", "secret")
            .config();
        let options = config.mqtt_options().await.unwrap();

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_half_client_pair_is_rejected() {
        let mut config = MqttClientBuilder::new().ca_path("/etc/certs/ca.crt").config();
        config.client_crt_path = Some(PathBuf::from("/etc/certs/tls.crt"));

        let err = config.mqtt_options().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        let config = MqttClientBuilder::new()
            .broker("127.0.0.1")
            .port(1)
            .connect_timeout(Duration::from_secs(2))
            .config();

        let err = MqttClient::connect(config).await.err().unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }
}
