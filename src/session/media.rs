use std::sync::Arc;
use thiserror::Error;
use webrtc::track::track_local::TrackLocal;

/// Local capture unavailable. Fatal to the peer session for that party;
/// messages are written to be actionable for the person at the keyboard.
#[derive(Debug, Error)]
pub enum MediaAccessError {
    #[error("Camera access denied: {0}. Grant camera permission and retry.")]
    PermissionDenied(String),

    #[error("No camera found: {0}. Connect a camera and retry.")]
    NotFound(String),

    #[error("Camera is busy: {0}. Close other applications using the camera and retry.")]
    DeviceBusy(String),
}

/// Resolution/framerate hints passed to the capture collaborator
#[derive(Debug, Clone, Copy)]
pub struct CaptureHints {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for CaptureHints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 15,
        }
    }
}

/// Camera/media collaborator interface. The core only consumes this seam;
/// frame production is outside its scope.
pub trait CaptureSource: Send + Sync {
    /// Acquire a live video-only source as local tracks
    fn acquire(
        &self,
        hints: CaptureHints,
    ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, MediaAccessError>;

    /// Stop and release the constituent tracks
    fn stop(&self);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    /// Capture source double producing one VP8 video track
    pub struct FakeCamera {
        stopped: AtomicBool,
    }

    impl FakeCamera {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                stopped: AtomicBool::new(false),
            })
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    impl CaptureSource for FakeCamera {
        fn acquire(
            &self,
            _hints: CaptureHints,
        ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, MediaAccessError> {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                "webcam".to_string(),
            ));
            Ok(vec![track])
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Capture source double that always fails
    pub struct DeniedCamera;

    impl CaptureSource for DeniedCamera {
        fn acquire(
            &self,
            _hints: CaptureHints,
        ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, MediaAccessError> {
            Err(MediaAccessError::PermissionDenied(
                "user dismissed the permission prompt".to_string(),
            ))
        }

        fn stop(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_actionable() {
        let err = MediaAccessError::PermissionDenied("prompt dismissed".to_string());
        assert!(err.to_string().contains("Grant camera permission"));

        let err = MediaAccessError::NotFound("no video input devices".to_string());
        assert!(err.to_string().contains("Connect a camera"));

        let err = MediaAccessError::DeviceBusy("already in use".to_string());
        assert!(err.to_string().contains("Close other applications"));
    }
}
