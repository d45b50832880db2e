use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The three message kinds of the session-negotiation handshake.
/// Kept open-ended so application-level messages can ride the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    #[serde(other)]
    Other,
}

/// One entry in a channel's signaling log.
///
/// `to == None` means broadcast to every member of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub id: String,
    pub channel_id: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    /// Creation time, epoch milliseconds
    pub timestamp: u64,
}

impl SignalingMessage {
    /// Whether this message should be delivered to `peer_id`
    pub fn is_for(&self, peer_id: &str) -> bool {
        match &self.to {
            Some(target) => target == peer_id,
            None => true,
        }
    }
}

/// Generate a message identifier unique with very high probability within a
/// channel's 100-message retention window. Uniqueness, not ordering, is the
/// contract.
pub fn generate_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("msg-{}-{}", now_millis(), suffix)
}

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
