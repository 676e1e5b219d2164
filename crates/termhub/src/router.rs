//! Per-session event routing.
//!
//! The router delivers adapter events to whichever consumer is currently
//! subscribed for an exact (session id, event kind) pair. Each channel has
//! at most one subscriber: subscribing again replaces the previous
//! delivery path instead of adding a second one, and unsubscribing is
//! idempotent. Events published with no live subscriber are dropped
//! silently; the consumer side may legitimately be gone.

use dashmap::DashMap;
use tokio::sync::mpsc;

use termhub_protocol::{Event, EventKind, SessionId};

/// Bounded capacity of one subscriber channel.
const CHANNEL_CAPACITY: usize = 256;

/// Routes events from backend adapters to subscribed consumers.
///
/// Delivery for a single session preserves production order. A slow
/// consumer loses the newest events (`try_send`) rather than stalling the
/// adapter that produced them; a disconnected consumer is pruned on the
/// next publish.
#[derive(Default)]
pub struct ChannelRouter {
    channels: DashMap<(SessionId, EventKind), mpsc::Sender<Event>>,
}

impl ChannelRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribes to one (session, kind) channel.
    ///
    /// Any previous subscriber for the same channel is detached: its
    /// receiver ends and every event from now on flows only to the
    /// returned receiver.
    pub fn subscribe(&self, id: &SessionId, kind: EventKind) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if self.channels.insert((id.clone(), kind), tx).is_some() {
            tracing::debug!(session_id = %id, kind = ?kind, "Replaced existing subscriber");
        }
        rx
    }

    /// Detaches the subscriber of one (session, kind) channel, if any.
    pub fn unsubscribe_all(&self, id: &SessionId, kind: EventKind) {
        self.channels.remove(&(id.clone(), kind));
    }

    /// Detaches every subscriber of the given session.
    pub fn unsubscribe_session(&self, id: &SessionId) {
        self.channels.retain(|(sid, _), _| sid != id);
    }

    /// Delivers an event to the subscriber of its (session, kind) channel.
    ///
    /// Returns `true` if the event was handed to a live subscriber. A full
    /// buffer drops the event with a warning; a closed receiver prunes the
    /// subscription without complaint.
    pub fn publish(&self, id: &SessionId, event: Event) -> bool {
        let key = (id.clone(), event.kind());
        let Some(tx) = self.channels.get(&key).map(|entry| entry.value().clone()) else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    session_id = %id,
                    kind = ?event.kind(),
                    "Subscriber buffer full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.channels.remove_if(&key, |_, tx| tx.is_closed());
                tracing::debug!(session_id = %id, "Pruned closed subscriber");
                false
            }
        }
    }

    /// Number of live subscriptions, across all sessions and kinds.
    pub fn subscription_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn output(data: &[u8]) -> Event {
        Event::Output {
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn delivers_to_exact_channel_only() {
        let router = ChannelRouter::new();
        let mut out_rx = router.subscribe(&"a".to_string(), EventKind::Output);
        let mut err_rx = router.subscribe(&"a".to_string(), EventKind::Error);
        let mut other_rx = router.subscribe(&"b".to_string(), EventKind::Output);

        assert!(router.publish(&"a".to_string(), output(b"hello")));

        let received = timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .expect("timeout")
            .expect("no event");
        assert_eq!(received, output(b"hello"));

        // Neither the other kind nor the other session sees it.
        assert!(timeout(Duration::from_millis(50), err_rx.recv())
            .await
            .is_err());
        assert!(timeout(Duration::from_millis(50), other_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_silent() {
        let router = ChannelRouter::new();
        assert!(!router.publish(&"ghost".to_string(), output(b"data")));
    }

    #[tokio::test]
    async fn resubscribe_replaces_prior_delivery_path() {
        let router = ChannelRouter::new();
        let id = "a".to_string();

        let mut first = router.subscribe(&id, EventKind::Output);
        let mut second = router.subscribe(&id, EventKind::Output);

        // The first receiver was detached by the second subscribe.
        assert!(timeout(Duration::from_millis(50), first.recv())
            .await
            .expect("first receiver should end")
            .is_none());

        router.publish(&id, output(b"once"));
        let received = timeout(Duration::from_millis(100), second.recv())
            .await
            .expect("timeout")
            .expect("no event");
        assert_eq!(received, output(b"once"));

        // Exactly one delivery: nothing further queued.
        assert!(timeout(Duration::from_millis(50), second.recv())
            .await
            .is_err());
        assert_eq!(router.subscription_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let router = ChannelRouter::new();
        let id = "a".to_string();

        let _rx = router.subscribe(&id, EventKind::Output);
        router.unsubscribe_all(&id, EventKind::Output);
        router.unsubscribe_all(&id, EventKind::Output);

        assert!(!router.publish(&id, output(b"gone")));
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_session_detaches_every_kind() {
        let router = ChannelRouter::new();
        let id = "a".to_string();

        let _out = router.subscribe(&id, EventKind::Output);
        let _err = router.subscribe(&id, EventKind::Error);
        let _keep = router.subscribe(&"b".to_string(), EventKind::Output);

        router.unsubscribe_session(&id);
        assert_eq!(router.subscription_count(), 1);
        assert!(!router.publish(&id, output(b"x")));
        assert!(router.publish(&"b".to_string(), output(b"y")));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_silently() {
        let router = ChannelRouter::new();
        let id = "a".to_string();

        let rx = router.subscribe(&id, EventKind::Output);
        drop(rx);

        assert!(!router.publish(&id, output(b"late")));
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn per_session_order_is_preserved() {
        let router = ChannelRouter::new();
        let id = "a".to_string();
        let mut rx = router.subscribe(&id, EventKind::Output);

        for i in 0..20u8 {
            router.publish(&id, output(&[i]));
        }
        for i in 0..20u8 {
            let received = timeout(Duration::from_millis(100), rx.recv())
                .await
                .expect("timeout")
                .expect("no event");
            assert_eq!(received, output(&[i]), "out of order at {i}");
        }
    }
}
