use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::message::{now_millis, SignalingMessage};

/// Maximum number of messages retained per channel. Appends beyond this
/// evict oldest-first, so a channel always keeps the most recent 100.
pub const MAX_CHANNEL_MESSAGES: usize = 100;

/// Default retention used by the periodic purge
pub const DEFAULT_MESSAGE_MAX_AGE: Duration = Duration::from_secs(3600);

/// Append-only per-channel log of signaling messages with bounded retention.
///
/// This is the one resource shared across independent execution contexts
/// (every poll loop and API handler reads the same store). The 100-message
/// cap and the timestamp purge are its only consistency mechanisms; message
/// loss beyond 100 outstanding writes on one channel is an accepted,
/// documented limitation.
pub struct MessageStore {
    channels: RwLock<HashMap<String, VecDeque<SignalingMessage>>>,
}

impl MessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Append a message to a channel's log, creating the channel implicitly.
    /// Evicts oldest entries past the retention cap.
    pub async fn append(&self, channel_id: &str, message: SignalingMessage) {
        let mut channels = self.channels.write().await;
        let log = channels.entry(channel_id.to_string()).or_default();

        log.push_back(message);
        while log.len() > MAX_CHANNEL_MESSAGES {
            log.pop_front();
        }
    }

    /// Snapshot of a channel's log, oldest first. Empty if the channel has
    /// no entries.
    pub async fn read(&self, channel_id: &str) -> Vec<SignalingMessage> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages currently stored for a channel
    pub async fn message_count(&self, channel_id: &str) -> usize {
        let channels = self.channels.read().await;
        channels.get(channel_id).map_or(0, VecDeque::len)
    }

    /// Timestamp of the most recent stored message for a channel
    pub async fn last_activity(&self, channel_id: &str) -> Option<u64> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .and_then(|log| log.back())
            .map(|m| m.timestamp)
    }

    /// Remove entries older than `max_age` across all channels, dropping
    /// channels whose logs empty out.
    pub async fn purge_expired(&self, max_age: Duration) {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let mut channels = self.channels.write().await;

        let mut purged = 0usize;
        for log in channels.values_mut() {
            let before = log.len();
            log.retain(|m| m.timestamp >= cutoff);
            purged += before - log.len();
        }
        channels.retain(|_, log| !log.is_empty());

        if purged > 0 {
            tracing::debug!(purged = purged, "Purged expired signaling messages");
        }
    }

    /// Wipe every channel's stored log
    pub async fn clear_all(&self) {
        let mut channels = self.channels.write().await;
        channels.clear();
    }
}
