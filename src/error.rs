use thiserror::Error;

use crate::session::media::MediaAccessError;

/// Custom error types for the proctoring server
#[derive(Debug, Error)]
pub enum ProctorError {
    /// Local capture errors (fatal to that party's session only)
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),

    /// WebRTC negotiation errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP format: {0}")]
    InvalidSdp(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescriptionFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    /// Channel and peer management errors
    #[error("Channel {0} not found")]
    ChannelNotFound(String),

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Invalid peer role: {0}")]
    InvalidRole(String),

    #[error("Peer id {0} is reserved")]
    PeerIdReserved(String),

    #[error("Session not initialized for this role")]
    SessionNotInitialized,

    /// Signaling errors
    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    /// Generic errors
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience type alias for Results using ProctorError
pub type Result<T> = std::result::Result<T, ProctorError>;

impl ProctorError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        ProctorError::Internal(msg.into())
    }

    /// Helper to create WebRTC API errors
    pub fn webrtc_api(msg: impl Into<String>) -> Self {
        ProctorError::WebRtcApi(msg.into())
    }

    /// Helper to create signaling errors
    pub fn signaling(msg: impl Into<String>) -> Self {
        ProctorError::InvalidSignalingMessage(msg.into())
    }
}

/// Convert webrtc::Error to ProctorError
impl From<webrtc::Error> for ProctorError {
    fn from(err: webrtc::Error) -> Self {
        ProctorError::WebRtcApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProctorError::ChannelNotFound("exam-42".to_string());
        assert_eq!(err.to_string(), "Channel exam-42 not found");
    }

    #[test]
    fn test_error_helpers() {
        let err = ProctorError::internal("Something went wrong");
        assert!(matches!(err, ProctorError::Internal(_)));
    }

    #[test]
    fn test_media_access_error_wraps() {
        let err: ProctorError =
            MediaAccessError::PermissionDenied("camera access was denied".to_string()).into();
        assert!(matches!(err, ProctorError::MediaAccess(_)));
    }
}
