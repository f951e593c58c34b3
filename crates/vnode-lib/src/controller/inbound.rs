//! Handlers for messages published by the base

use super::store::{BizStateStore, StateChange};
use crate::error::Error;
use crate::models::BizInfoPayload;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::translate::identity_of;
use crate::transport::{Message, MessageHandler};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// When the base last said it was alive
#[derive(Debug, Default)]
pub(crate) struct BaseLiveness {
    last_seen: Mutex<Option<Instant>>,
}

impl BaseLiveness {
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|seen| seen.elapsed() <= max_age)
    }
}

/// State the subscription handlers write to.
///
/// Handlers are stored inside the transport, so this holds only the pieces it
/// needs rather than the controller itself.
#[derive(Clone)]
pub(crate) struct Inbound {
    pub store: BizStateStore,
    pub liveness: Arc<BaseLiveness>,
    pub dirty: Arc<Notify>,
    pub metrics: ControllerMetrics,
    pub logger: StructuredLogger,
}

impl Inbound {
    /// Decode a biz state report, update the store and wake the status pass
    pub fn handle_biz_message(&self, message: &Message) -> Result<usize, Error> {
        let infos = BizInfoPayload::decode(&message.payload).map_err(|e| {
            self.metrics.inc_malformed_messages();
            self.logger.log_malformed(&message.topic, &e.to_string());
            Error::malformed(message.topic.clone(), e.to_string())
        })?;

        self.metrics.inc_biz_messages(infos.len());
        // A report also proves the base is alive
        self.liveness.touch();

        let now = Utc::now();
        let mut changed = 0;
        for info in infos {
            let key = identity_of(&info);
            let state = info.state.clone();
            if let StateChange::Changed { previous } = self.store.apply(info, now) {
                self.logger.log_biz_state(
                    &key,
                    previous.as_ref().map(|s| s.as_str()),
                    state.as_str(),
                );
                changed += 1;
            }
        }

        if changed > 0 {
            self.dirty.notify_one();
        }
        Ok(changed)
    }

    pub fn handle_heartbeat(&self, _message: &Message) {
        self.liveness.touch();
    }

    pub fn biz_handler(&self) -> MessageHandler {
        let inbound = self.clone();
        Arc::new(move |message: &Message| {
            // Malformed payloads are already logged and counted
            let _ = inbound.handle_biz_message(message);
        })
    }

    pub fn heartbeat_handler(&self) -> MessageHandler {
        let inbound = self.clone();
        Arc::new(move |message: &Message| inbound.handle_heartbeat(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BizState;
    use crate::transport::QoS;

    fn inbound() -> Inbound {
        Inbound {
            store: BizStateStore::new(),
            liveness: Arc::new(BaseLiveness::default()),
            dirty: Arc::new(Notify::new()),
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("vnode-test"),
        }
    }

    fn message(payload: &str) -> Message {
        Message {
            topic: "koupleless/test/base/biz".to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    #[tokio::test]
    async fn test_biz_message_updates_store_and_notifies() {
        let inbound = inbound();
        let changed = inbound
            .handle_biz_message(&message(
                r#"{"bizName":"biz","bizVersion":"1.0.0","bizState":"ACTIVATED"}"#,
            ))
            .unwrap();

        assert_eq!(changed, 1);
        assert_eq!(
            inbound.store.get("biz:1.0.0").unwrap().info.state,
            BizState::Activated
        );
        tokio::time::timeout(Duration::from_secs(1), inbound.dirty.notified())
            .await
            .unwrap();
        assert!(inbound.liveness.is_fresh(Duration::from_secs(5)));
    }

    #[test]
    fn test_repeated_state_is_not_a_change() {
        let inbound = inbound();
        let payload = r#"[{"bizName":"biz","bizVersion":"1.0.0","bizState":"RESOLVED"}]"#;
        assert_eq!(inbound.handle_biz_message(&message(payload)).unwrap(), 1);
        assert_eq!(inbound.handle_biz_message(&message(payload)).unwrap(), 0);
    }

    #[test]
    fn test_malformed_message_leaves_store_untouched() {
        let inbound = inbound();
        inbound
            .handle_biz_message(&message(
                r#"{"bizName":"biz","bizVersion":"1.0.0","bizState":"ACTIVATED"}"#,
            ))
            .unwrap();

        let err = inbound.handle_biz_message(&message("{not json")).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage { .. }));
        assert!(!err.is_fatal());
        assert_eq!(inbound.store.len(), 1);
    }

    #[test]
    fn test_liveness_staleness() {
        let liveness = BaseLiveness::default();
        assert!(!liveness.is_fresh(Duration::from_secs(30)));

        liveness.touch();
        assert!(liveness.is_fresh(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_expires() {
        let liveness = BaseLiveness::default();
        liveness.touch();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!liveness.is_fresh(Duration::from_secs(30)));
    }
}
