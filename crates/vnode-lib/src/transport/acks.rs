//! Matches broker acknowledgements back to waiting callers
//!
//! rumqttc only assigns packet ids once a request reaches the event loop, so
//! waiters are queued in request order and bound to a packet id when the
//! corresponding `Outgoing` event is observed.

use crate::error::TransportError;
use rumqttc::{Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) type Waiter = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    queued: VecDeque<(AckKind, Waiter)>,
    inflight: HashMap<(AckKind, u16), VecDeque<Waiter>>,
    collision: Option<(u16, Waiter)>,
}

impl AckTracker {
    /// Register a waiter for a request that was just handed to the client
    pub fn enqueue(&mut self, kind: AckKind, waiter: Waiter) {
        self.queued.push_back((kind, waiter));
    }

    /// Drop the most recent waiter when its request could not be queued
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    pub fn on_outgoing(&mut self, event: &Outgoing) {
        match *event {
            Outgoing::Publish(pkid) => {
                let waiter = match self.collision.take() {
                    Some((held, waiter)) if held == pkid => Some(waiter),
                    other => {
                        self.collision = other;
                        self.pop_queued(AckKind::Publish)
                    }
                };
                match waiter {
                    // QoS 0 has no acknowledgement; written out is done
                    Some(waiter) if pkid == 0 => {
                        let _ = waiter.send(Ok(()));
                    }
                    Some(waiter) => self.bind(AckKind::Publish, pkid, waiter),
                    None => {}
                }
            }
            Outgoing::Subscribe(pkid) => {
                if let Some(waiter) = self.pop_queued(AckKind::Subscribe) {
                    self.bind(AckKind::Subscribe, pkid, waiter);
                }
            }
            Outgoing::Unsubscribe(pkid) => {
                if let Some(waiter) = self.pop_queued(AckKind::Unsubscribe) {
                    self.bind(AckKind::Unsubscribe, pkid, waiter);
                }
            }
            Outgoing::AwaitAck(pkid) => {
                debug!(pkid, "Publish held back on packet id collision");
                if let Some(waiter) = self.pop_queued(AckKind::Publish) {
                    self.collision = Some((pkid, waiter));
                }
            }
            _ => {}
        }
    }

    pub fn on_incoming(&mut self, packet: &Packet) {
        match packet {
            Packet::PubAck(ack) => self.resolve(AckKind::Publish, ack.pkid, Ok(())),
            Packet::PubComp(ack) => self.resolve(AckKind::Publish, ack.pkid, Ok(())),
            Packet::SubAck(ack) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err(TransportError::Rejected("subscription refused".to_string()))
                } else {
                    Ok(())
                };
                self.resolve(AckKind::Subscribe, ack.pkid, result);
            }
            Packet::UnsubAck(ack) => self.resolve(AckKind::Unsubscribe, ack.pkid, Ok(())),
            _ => {}
        }
    }

    /// Resolve every outstanding waiter with `err`
    pub fn fail_all(&mut self, err: TransportError) {
        let queued = self.queued.drain(..).map(|(_, waiter)| waiter);
        let inflight = self.inflight.drain().flat_map(|(_, waiters)| waiters);
        let collision = self.collision.take().map(|(_, waiter)| waiter);

        for waiter in queued.chain(inflight).chain(collision) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.queued.len()
            + self.inflight.values().map(VecDeque::len).sum::<usize>()
            + usize::from(self.collision.is_some())
    }

    fn pop_queued(&mut self, kind: AckKind) -> Option<Waiter> {
        match self.queued.front() {
            Some((front, _)) if *front == kind => self.queued.pop_front().map(|(_, w)| w),
            Some((front, _)) => {
                warn!(expected = ?kind, queued = ?front, "Outgoing event does not match queued request");
                None
            }
            None => None,
        }
    }

    fn bind(&mut self, kind: AckKind, pkid: u16, waiter: Waiter) {
        self.inflight.entry((kind, pkid)).or_default().push_back(waiter);
    }

    fn resolve(&mut self, kind: AckKind, pkid: u16, result: Result<(), TransportError>) {
        let Some(waiters) = self.inflight.get_mut(&(kind, pkid)) else {
            return;
        };
        if let Some(waiter) = waiters.pop_front() {
            let _ = waiter.send(result);
        }
        if waiters.is_empty() {
            self.inflight.remove(&(kind, pkid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{PubAck, PubComp, SubAck, UnsubAck};

    fn waiter() -> (Waiter, oneshot::Receiver<Result<(), TransportError>>) {
        oneshot::channel()
    }

    #[test]
    fn test_qos0_publish_resolves_when_written() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = waiter();
        tracker.enqueue(AckKind::Publish, tx);

        tracker.on_outgoing(&Outgoing::Publish(0));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_qos1_publish_waits_for_puback() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = waiter();
        tracker.enqueue(AckKind::Publish, tx);

        tracker.on_outgoing(&Outgoing::Publish(7));
        assert!(rx.try_recv().is_err());

        tracker.on_incoming(&Packet::PubAck(PubAck::new(8)));
        assert!(rx.try_recv().is_err());

        tracker.on_incoming(&Packet::PubAck(PubAck::new(7)));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_qos2_publish_waits_for_pubcomp() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = waiter();
        tracker.enqueue(AckKind::Publish, tx);

        tracker.on_outgoing(&Outgoing::Publish(3));
        tracker.on_incoming(&Packet::PubComp(PubComp::new(3)));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_suback_failure_is_rejected() {
        let mut tracker = AckTracker::default();
        let (ok_tx, mut ok_rx) = waiter();
        let (bad_tx, mut bad_rx) = waiter();
        tracker.enqueue(AckKind::Subscribe, ok_tx);
        tracker.enqueue(AckKind::Subscribe, bad_tx);

        tracker.on_outgoing(&Outgoing::Subscribe(1));
        tracker.on_outgoing(&Outgoing::Subscribe(2));
        tracker.on_incoming(&Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)],
        )));
        tracker.on_incoming(&Packet::SubAck(SubAck::new(
            2,
            vec![SubscribeReasonCode::Failure],
        )));

        assert_eq!(ok_rx.try_recv().unwrap(), Ok(()));
        assert!(matches!(
            bad_rx.try_recv().unwrap(),
            Err(TransportError::Rejected(_))
        ));
    }

    #[test]
    fn test_mixed_requests_bind_in_order() {
        let mut tracker = AckTracker::default();
        let (pub_tx, mut pub_rx) = waiter();
        let (unsub_tx, mut unsub_rx) = waiter();
        tracker.enqueue(AckKind::Publish, pub_tx);
        tracker.enqueue(AckKind::Unsubscribe, unsub_tx);

        tracker.on_outgoing(&Outgoing::Publish(1));
        tracker.on_outgoing(&Outgoing::Unsubscribe(2));
        tracker.on_incoming(&Packet::UnsubAck(UnsubAck::new(2)));
        assert_eq!(unsub_rx.try_recv().unwrap(), Ok(()));
        assert!(pub_rx.try_recv().is_err());

        tracker.on_incoming(&Packet::PubAck(PubAck::new(1)));
        assert_eq!(pub_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_collision_resolves_after_original() {
        let mut tracker = AckTracker::default();
        let (first_tx, mut first_rx) = waiter();
        let (second_tx, mut second_rx) = waiter();
        tracker.enqueue(AckKind::Publish, first_tx);
        tracker.enqueue(AckKind::Publish, second_tx);

        tracker.on_outgoing(&Outgoing::Publish(5));
        tracker.on_outgoing(&Outgoing::AwaitAck(5));
        // The held publish goes out before the ack that freed its id is reported
        tracker.on_outgoing(&Outgoing::Publish(5));
        tracker.on_incoming(&Packet::PubAck(PubAck::new(5)));

        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
        assert!(second_rx.try_recv().is_err());

        tracker.on_incoming(&Packet::PubAck(PubAck::new(5)));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_fail_all_on_disconnect() {
        let mut tracker = AckTracker::default();
        let (queued_tx, mut queued_rx) = waiter();
        let (inflight_tx, mut inflight_rx) = waiter();
        tracker.enqueue(AckKind::Publish, inflight_tx);
        tracker.on_outgoing(&Outgoing::Publish(1));
        tracker.enqueue(AckKind::Subscribe, queued_tx);

        tracker.fail_all(TransportError::Disconnected);

        assert_eq!(
            queued_rx.try_recv().unwrap(),
            Err(TransportError::Disconnected)
        );
        assert_eq!(
            inflight_rx.try_recv().unwrap(),
            Err(TransportError::Disconnected)
        );
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = waiter();
        tracker.enqueue(AckKind::Subscribe, tx);

        tracker.on_outgoing(&Outgoing::PingReq);
        tracker.on_outgoing(&Outgoing::PubAck(4));
        tracker.on_incoming(&Packet::PingResp);
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.outstanding(), 1);
    }
}
