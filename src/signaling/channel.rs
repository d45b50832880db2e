use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use super::message::{generate_message_id, now_millis, SignalKind, SignalingMessage};
use super::store::{MessageStore, DEFAULT_MESSAGE_MAX_AGE};

/// Delivery handle registered for a channel member. Messages addressed to
/// the peer (or broadcast) are pushed here by `poll_messages`.
pub type DeliveryHandler = mpsc::UnboundedSender<SignalingMessage>;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_id: String,
    pub peer_count: usize,
    pub message_count: usize,
    pub last_activity: Option<u64>,
}

/// Channel membership and polling-based message delivery on top of the
/// message store.
///
/// Delivery is at-most-once per (peer, message id). This is a hard
/// invariant: duplicate delivery would double-trigger offer/answer/ICE
/// handling downstream. Delivered ids are remembered for the lifetime of
/// the peer's registration.
pub struct ChannelManager {
    store: Arc<MessageStore>,
    members: RwLock<HashMap<String, HashMap<String, DeliveryHandler>>>,
    delivered: RwLock<HashMap<(String, String), HashSet<String>>>,
}

impl ChannelManager {
    pub fn new(store: Arc<MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            members: RwLock::new(HashMap::new()),
            delivered: RwLock::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Register a peer's delivery handler under a channel, creating the
    /// channel implicitly. Re-joining replaces the handler without creating
    /// a duplicate registration; delivered-id tracking carries over so
    /// re-registration never causes redelivery.
    pub async fn join_channel(&self, channel_id: &str, peer_id: &str, handler: DeliveryHandler) {
        let mut members = self.members.write().await;
        let channel = members.entry(channel_id.to_string()).or_default();

        let replaced = channel
            .insert(peer_id.to_string(), handler)
            .is_some();

        if replaced {
            tracing::debug!(channel_id = %channel_id, peer_id = %peer_id, "Peer re-registered in channel");
        } else {
            tracing::info!(channel_id = %channel_id, peer_id = %peer_id, "Peer joined channel");
        }
    }

    /// Remove a peer's registration. When the last member leaves, the
    /// channel entry itself is removed. The peer's delivered-id tracking is
    /// dropped with the registration.
    pub async fn leave_channel(&self, channel_id: &str, peer_id: &str) {
        let mut members = self.members.write().await;

        if let Some(channel) = members.get_mut(channel_id) {
            if channel.remove(peer_id).is_some() {
                tracing::info!(channel_id = %channel_id, peer_id = %peer_id, "Peer left channel");
            }
            if channel.is_empty() {
                members.remove(channel_id);
                tracing::info!(channel_id = %channel_id, "Last member left, removing channel");
            }
        }
        drop(members);

        let mut delivered = self.delivered.write().await;
        delivered.remove(&(channel_id.to_string(), peer_id.to_string()));
    }

    /// Construct a signaling message (generating id and timestamp) and
    /// append it to the channel's log. `target` of `None` means broadcast.
    pub async fn send_message(
        &self,
        channel_id: &str,
        from: &str,
        target: Option<&str>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> SignalingMessage {
        let message = SignalingMessage {
            id: generate_message_id(),
            channel_id: channel_id.to_string(),
            from: from.to_string(),
            to: target.map(str::to_string),
            kind,
            payload,
            timestamp: now_millis(),
        };

        tracing::debug!(
            channel_id = %channel_id,
            message_id = %message.id,
            from = %from,
            to = ?message.to,
            kind = ?message.kind,
            "Appending signaling message"
        );

        self.store.append(channel_id, message.clone()).await;
        message
    }

    /// Deliver undelivered messages addressed to `peer_id` (or broadcast),
    /// in log order, at most once each. Returns the number delivered.
    pub async fn poll_messages(&self, channel_id: &str, peer_id: &str) -> usize {
        let handler = {
            let members = self.members.read().await;
            members
                .get(channel_id)
                .and_then(|channel| channel.get(peer_id))
                .cloned()
        };

        let Some(handler) = handler else {
            return 0;
        };

        let log = self.store.read(channel_id).await;
        if log.is_empty() {
            return 0;
        }

        let key = (channel_id.to_string(), peer_id.to_string());
        let mut delivered = self.delivered.write().await;
        let seen = delivered.entry(key).or_default();

        let mut count = 0;
        for message in log {
            if !message.is_for(peer_id) || seen.contains(&message.id) {
                continue;
            }
            // Mark before handing off so a failing handler can never cause
            // a redelivery on the next poll.
            seen.insert(message.id.clone());

            if handler.send(message).is_err() {
                tracing::debug!(
                    channel_id = %channel_id,
                    peer_id = %peer_id,
                    "Delivery handler closed, dropping message"
                );
                continue;
            }
            count += 1;
        }

        count
    }

    /// Current membership size, stored log length, and last activity for a
    /// channel. Pure read.
    pub async fn channel_stats(&self, channel_id: &str) -> ChannelStats {
        let peer_count = {
            let members = self.members.read().await;
            members.get(channel_id).map_or(0, HashMap::len)
        };

        ChannelStats {
            channel_id: channel_id.to_string(),
            peer_count,
            message_count: self.store.message_count(channel_id).await,
            last_activity: self.store.last_activity(channel_id).await,
        }
    }

    /// Whether a peer is currently registered in a channel
    pub async fn is_member(&self, channel_id: &str, peer_id: &str) -> bool {
        let members = self.members.read().await;
        members
            .get(channel_id)
            .is_some_and(|channel| channel.contains_key(peer_id))
    }

    /// Purge stale messages, then clear all membership, delivery tracking,
    /// and stored logs. Used by teardown.
    pub async fn cleanup(&self) {
        self.store.purge_expired(DEFAULT_MESSAGE_MAX_AGE).await;

        {
            let mut members = self.members.write().await;
            members.clear();
        }
        {
            let mut delivered = self.delivered.write().await;
            delivered.clear();
        }
        self.store.clear_all().await;

        tracing::info!("Channel manager cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ChannelManager> {
        ChannelManager::new(MessageStore::new())
    }

    #[tokio::test]
    async fn test_join_and_leave_removes_channel() {
        let channels = manager();
        let (tx, _rx) = mpsc::unbounded_channel();

        channels.join_channel("exam-1", "student_1", tx).await;
        assert!(channels.is_member("exam-1", "student_1").await);

        channels.leave_channel("exam-1", "student_1").await;
        assert!(!channels.is_member("exam-1", "student_1").await);

        // Channel itself is gone once the last member leaves
        let members = channels.members.read().await;
        assert!(!members.contains_key("exam-1"));
    }

    #[tokio::test]
    async fn test_rejoin_does_not_duplicate_handlers() {
        let channels = manager();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        channels.join_channel("exam-1", "student_1", tx1).await;
        channels.join_channel("exam-1", "student_1", tx2).await;

        channels
            .send_message("exam-1", "instructor", Some("student_1"), SignalKind::Offer, serde_json::json!({}))
            .await;
        let count = channels.poll_messages("exam-1", "student_1").await;

        assert_eq!(count, 1);
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_delivers_at_most_once() {
        let channels = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channels.join_channel("exam-1", "student_1", tx).await;

        channels
            .send_message("exam-1", "instructor", Some("student_1"), SignalKind::Offer, serde_json::json!({}))
            .await;

        assert_eq!(channels.poll_messages("exam-1", "student_1").await, 1);
        assert_eq!(channels.poll_messages("exam-1", "student_1").await, 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_filters_by_target() {
        let channels = manager();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        channels.join_channel("exam-1", "student_1", tx1).await;
        channels.join_channel("exam-1", "student_2", tx2).await;

        channels
            .send_message("exam-1", "instructor", Some("student_1"), SignalKind::Offer, serde_json::json!({}))
            .await;
        channels
            .send_message("exam-1", "instructor", None, SignalKind::Other, serde_json::json!({}))
            .await;

        assert_eq!(channels.poll_messages("exam-1", "student_1").await, 2);
        assert_eq!(channels.poll_messages("exam-1", "student_2").await, 1);

        let first = rx1.recv().await.unwrap();
        assert_eq!(first.to.as_deref(), Some("student_1"));
        let second = rx1.recv().await.unwrap();
        assert_eq!(second.to, None);

        let only = rx2.recv().await.unwrap();
        assert_eq!(only.to, None);
    }

    #[tokio::test]
    async fn test_poll_preserves_log_order() {
        let channels = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channels.join_channel("exam-1", "student_1", tx).await;

        for seq in 0..10 {
            channels
                .send_message(
                    "exam-1",
                    "instructor",
                    Some("student_1"),
                    SignalKind::IceCandidate,
                    serde_json::json!({ "seq": seq }),
                )
                .await;
        }

        assert_eq!(channels.poll_messages("exam-1", "student_1").await, 10);
        for seq in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload["seq"], seq);
        }
    }

    #[tokio::test]
    async fn test_poll_unregistered_peer_is_noop() {
        let channels = manager();
        channels
            .send_message("exam-1", "instructor", None, SignalKind::Offer, serde_json::json!({}))
            .await;

        assert_eq!(channels.poll_messages("exam-1", "stranger").await, 0);
    }

    #[tokio::test]
    async fn test_channel_stats() {
        let channels = manager();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        channels.join_channel("exam-1", "student_1", tx1).await;
        channels.join_channel("exam-1", "instructor", tx2).await;

        channels
            .send_message("exam-1", "student_1", Some("instructor"), SignalKind::Offer, serde_json::json!({}))
            .await;

        let stats = channels.channel_stats("exam-1").await;
        assert_eq!(stats.peer_count, 2);
        assert_eq!(stats.message_count, 1);
        assert!(stats.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_clears_everything() {
        let channels = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        channels.join_channel("exam-1", "student_1", tx).await;
        channels
            .send_message("exam-1", "student_1", None, SignalKind::Offer, serde_json::json!({}))
            .await;

        channels.cleanup().await;

        assert!(!channels.is_member("exam-1", "student_1").await);
        let stats = channels.channel_stats("exam-1").await;
        assert_eq!(stats.peer_count, 0);
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.last_activity, None);
    }
}
