use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::{CaptureHints, CaptureSource};
use super::webrtc_utils::{create_webrtc_api, get_ice_servers, IceConfig};
use crate::error::{ProctorError, Result};
use crate::signaling::{ChannelManager, SignalKind, SignalingMessage};

/// Well-known peer id of the instructor side of an exam channel
pub const INSTRUCTOR_PEER_ID: &str = "instructor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerRole {
    /// Receives every student feed, sends nothing
    Instructor,
    /// Sends its capture feed, receives nothing
    Student,
}

#[derive(Clone)]
struct Identity {
    role: PeerRole,
    peer_id: String,
    channel_id: String,
}

/// Notifications emitted to the application layer
pub enum SessionEvent {
    StreamReceived {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    PeerDisconnected {
        peer_id: String,
    },
}

/// Introspection snapshot for one peer connection. Read-only.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connection_state: String,
    pub ice_connection_state: String,
    pub ice_gathering_state: String,
    pub signaling_state: String,
}

/// One media-capable connection per remote peer id, with offer/answer/ICE
/// choreography mapped onto the channel manager's send/poll primitives.
///
/// Negotiation failures are isolated per peer: the failing peer is torn
/// down and a disconnection event fires, other peers are untouched. Stray
/// or duplicate messages are ignored, never fatal.
pub struct PeerSessionManager {
    api: Arc<API>,
    channels: Arc<ChannelManager>,
    poll_interval: Duration,
    identity: RwLock<Option<Identity>>,
    connections: Arc<RwLock<HashMap<String, Arc<RTCPeerConnection>>>>,
    /// ICE candidates that arrived before a remote description existed
    pending_candidates: Arc<RwLock<HashMap<String, Vec<RTCIceCandidateInit>>>>,
    local_tracks: RwLock<Vec<Arc<dyn TrackLocal + Send + Sync>>>,
    capture: RwLock<Option<Arc<dyn CaptureSource>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSessionManager {
    pub fn new(channels: Arc<ChannelManager>, poll_interval: Duration) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            api: create_webrtc_api(),
            channels,
            poll_interval,
            identity: RwLock::new(None),
            connections: Arc::new(RwLock::new(HashMap::new())),
            pending_candidates: Arc::new(RwLock::new(HashMap::new())),
            local_tracks: RwLock::new(Vec::new()),
            capture: RwLock::new(None),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            poll_task: Mutex::new(None),
        })
    }

    /// Take the event stream. Single consumer; subsequent calls return None.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Acquire the local capture and record the student identity. Fails
    /// with a typed media-access error when the capture source is
    /// unavailable or denied.
    pub async fn initialize_as_student(
        &self,
        student_id: &str,
        exam_code: &str,
        capture: Arc<dyn CaptureSource>,
    ) -> Result<()> {
        let tracks = capture.acquire(CaptureHints::default())?;
        tracing::info!(
            student_id = %student_id,
            exam_code = %exam_code,
            track_count = tracks.len(),
            "Local capture acquired"
        );

        *self.local_tracks.write().await = tracks;
        *self.capture.write().await = Some(capture);
        *self.identity.write().await = Some(Identity {
            role: PeerRole::Student,
            peer_id: student_id.to_string(),
            channel_id: exam_code.to_string(),
        });
        Ok(())
    }

    /// Record the instructor identity. No local capture required.
    pub async fn initialize_as_instructor(&self, exam_code: &str) {
        tracing::info!(exam_code = %exam_code, "Initializing instructor session");
        *self.identity.write().await = Some(Identity {
            role: PeerRole::Instructor,
            peer_id: INSTRUCTOR_PEER_ID.to_string(),
            channel_id: exam_code.to_string(),
        });
    }

    async fn identity(&self) -> Result<Identity> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or(ProctorError::SessionNotInitialized)
    }

    /// Instantiate a connection for `peer_id`, wiring candidate gathering,
    /// remote tracks, and terminal-state teardown. Creating for an existing
    /// peer id replaces the prior entry, closing it first.
    pub async fn create_peer_connection(&self, peer_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let identity = self.identity().await?;

        let config = RTCConfiguration {
            ice_servers: get_ice_servers(&IceConfig::default()),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| ProctorError::PeerConnectionCreation(e.to_string()))?,
        );

        // Gathered candidates go out as targeted ice-candidate messages
        {
            let channels = Arc::clone(&self.channels);
            let channel_id = identity.channel_id.clone();
            let own_id = identity.peer_id.clone();
            let remote = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let channels = Arc::clone(&channels);
                let channel_id = channel_id.clone();
                let own_id = own_id.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let payload = serde_json::json!({
                                "candidate": init.candidate,
                                "sdp_mid": init.sdp_mid,
                                "sdp_mline_index": init.sdp_mline_index,
                            });
                            channels
                                .send_message(
                                    &channel_id,
                                    &own_id,
                                    Some(&remote),
                                    SignalKind::IceCandidate,
                                    payload,
                                )
                                .await;
                        }
                        Err(e) => {
                            tracing::error!(
                                peer_id = %remote,
                                error = %e,
                                "Failed to serialize ICE candidate"
                            );
                        }
                    }
                })
            }));
        }

        // Remote tracks surface as stream-received notifications
        {
            let events = self.events.clone();
            let remote = peer_id.to_string();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    tracing::info!(
                        peer_id = %remote,
                        track_id = %track.id(),
                        "Remote track received"
                    );
                    let _ = events.send(SessionEvent::StreamReceived {
                        peer_id: remote,
                        track,
                    });
                })
            }));
        }

        // Terminal states tear the peer down and notify collaborators
        {
            let connections = Arc::clone(&self.connections);
            let pending = Arc::clone(&self.pending_candidates);
            let events = self.events.clone();
            let remote = peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let connections = Arc::clone(&connections);
                let pending = Arc::clone(&pending);
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    tracing::debug!(peer_id = %remote, state = %state, "Connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                    ) && drop_connection(&connections, &pending, &events, &remote).await
                    {
                        tracing::info!(peer_id = %remote, "Peer torn down after terminal state");
                    }
                })
            }));
        }

        match identity.role {
            PeerRole::Student => {
                let tracks = self.local_tracks.read().await;
                for track in tracks.iter() {
                    pc.add_track(Arc::clone(track)).await?;
                }
            }
            PeerRole::Instructor => {
                pc.add_transceiver_from_kind(RTPCodecType::Video, None).await?;
            }
        }

        let replaced = {
            let mut connections = self.connections.write().await;
            connections.insert(peer_id.to_string(), Arc::clone(&pc))
        };
        if let Some(old) = replaced {
            tracing::warn!(peer_id = %peer_id, "Replacing existing connection");
            // Candidates buffered for the old connection must not flush into
            // the new one.
            self.pending_candidates.write().await.remove(peer_id);
            if let Err(e) = old.close().await {
                tracing::error!(peer_id = %peer_id, error = %e, "Error closing replaced connection");
            }
        }

        tracing::info!(peer_id = %peer_id, role = ?identity.role, "Peer connection created");
        Ok(pc)
    }

    async fn connection(&self, peer_id: &str) -> Option<Arc<RTCPeerConnection>> {
        let connections = self.connections.read().await;
        connections.get(peer_id).cloned()
    }

    async fn connection_or_create(&self, peer_id: &str) -> Result<Arc<RTCPeerConnection>> {
        match self.connection(peer_id).await {
            Some(pc) => Ok(pc),
            None => self.create_peer_connection(peer_id).await,
        }
    }

    /// Generate a local offer for `remote_peer_id` and send it addressed to
    /// that peer.
    pub async fn create_offer(&self, remote_peer_id: &str) -> Result<()> {
        let identity = self.identity().await?;
        let pc = self.connection_or_create(remote_peer_id).await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| ProctorError::CreateOfferFailed(e.to_string()))?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(|e| ProctorError::SetLocalDescriptionFailed(e.to_string()))?;

        self.channels
            .send_message(
                &identity.channel_id,
                &identity.peer_id,
                Some(remote_peer_id),
                SignalKind::Offer,
                serde_json::json!({ "sdp": sdp }),
            )
            .await;

        tracing::info!(peer_id = %remote_peer_id, "Offer sent");
        Ok(())
    }

    /// Apply a remote offer, answer it, and send the answer back
    pub async fn handle_offer(&self, sdp: &str, from_peer_id: &str) -> Result<()> {
        let identity = self.identity().await?;
        let pc = self.connection_or_create(from_peer_id).await?;

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| ProctorError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))?;
        self.flush_pending_candidates(from_peer_id, &pc).await;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| ProctorError::CreateAnswerFailed(e.to_string()))?;
        let answer_sdp = answer.sdp.clone();
        pc.set_local_description(answer)
            .await
            .map_err(|e| ProctorError::SetLocalDescriptionFailed(e.to_string()))?;

        self.channels
            .send_message(
                &identity.channel_id,
                &identity.peer_id,
                Some(from_peer_id),
                SignalKind::Answer,
                serde_json::json!({ "sdp": answer_sdp }),
            )
            .await;

        tracing::info!(peer_id = %from_peer_id, "Offer answered");
        Ok(())
    }

    /// Apply a remote answer. A late or stray answer for an unknown peer is
    /// a no-op.
    pub async fn handle_answer(&self, sdp: &str, from_peer_id: &str) -> Result<()> {
        let Some(pc) = self.connection(from_peer_id).await else {
            tracing::debug!(peer_id = %from_peer_id, "Stray answer for unknown peer, ignoring");
            return Ok(());
        };

        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| ProctorError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| ProctorError::SetRemoteDescriptionFailed(e.to_string()))?;
        self.flush_pending_candidates(from_peer_id, &pc).await;

        tracing::info!(peer_id = %from_peer_id, "Answer applied");
        Ok(())
    }

    /// Apply an ICE candidate, buffering it when no remote description
    /// exists yet for that peer.
    pub async fn handle_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
        from_peer_id: &str,
    ) -> Result<()> {
        let pc = self.connection(from_peer_id).await;

        let ready = match &pc {
            Some(pc) => pc.remote_description().await.is_some(),
            None => false,
        };

        if !ready {
            tracing::debug!(peer_id = %from_peer_id, "Buffering early ICE candidate");
            let mut pending = self.pending_candidates.write().await;
            pending
                .entry(from_peer_id.to_string())
                .or_default()
                .push(candidate);
            return Ok(());
        }

        if let Some(pc) = pc {
            pc.add_ice_candidate(candidate)
                .await
                .map_err(|e| ProctorError::AddIceCandidateFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Apply candidates buffered before the remote description was set
    async fn flush_pending_candidates(&self, peer_id: &str, pc: &Arc<RTCPeerConnection>) {
        let candidates = {
            let mut pending = self.pending_candidates.write().await;
            pending.remove(peer_id)
        };

        if let Some(candidates) = candidates {
            tracing::debug!(
                peer_id = %peer_id,
                count = candidates.len(),
                "Flushing buffered ICE candidates"
            );
            for candidate in candidates {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    tracing::error!(
                        peer_id = %peer_id,
                        error = %e,
                        "Failed to add buffered ICE candidate"
                    );
                }
            }
        }
    }

    /// Begin the recurring poll against the channel manager for this
    /// party's own identifier, dispatching delivered messages by kind.
    /// Dispatch is sequential, so operations on one peer never race.
    pub async fn start_signaling_polling(self: &Arc<Self>) -> Result<()> {
        let identity = self.identity().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.channels
            .join_channel(&identity.channel_id, &identity.peer_id, tx)
            .await;

        let manager = Arc::clone(self);
        let channels = Arc::clone(&self.channels);
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                channels
                    .poll_messages(&identity.channel_id, &identity.peer_id)
                    .await;
                while let Ok(message) = rx.try_recv() {
                    manager.dispatch(message).await;
                }
            }
        });

        let mut poll_task = self.poll_task.lock().await;
        if let Some(old) = poll_task.replace(handle) {
            old.abort();
        }

        tracing::info!("Signaling polling started");
        Ok(())
    }

    async fn dispatch(&self, message: SignalingMessage) {
        let from = message.from.clone();

        let result = match message.kind {
            SignalKind::Offer => match message.payload["sdp"].as_str() {
                Some(sdp) => self.handle_offer(sdp, &from).await,
                None => {
                    tracing::warn!(peer_id = %from, "Offer without sdp payload, dropping");
                    return;
                }
            },
            SignalKind::Answer => match message.payload["sdp"].as_str() {
                Some(sdp) => self.handle_answer(sdp, &from).await,
                None => {
                    tracing::warn!(peer_id = %from, "Answer without sdp payload, dropping");
                    return;
                }
            },
            SignalKind::IceCandidate => match message.payload["candidate"].as_str() {
                Some(candidate) => {
                    let init = RTCIceCandidateInit {
                        candidate: candidate.to_string(),
                        sdp_mid: message.payload["sdp_mid"].as_str().map(str::to_string),
                        sdp_mline_index: message.payload["sdp_mline_index"]
                            .as_u64()
                            .map(|i| i as u16),
                        username_fragment: None,
                    };
                    self.handle_ice_candidate(init, &from).await
                }
                None => {
                    tracing::warn!(peer_id = %from, "ICE message without candidate, dropping");
                    return;
                }
            },
            SignalKind::Other => {
                tracing::debug!(peer_id = %from, "Ignoring non-negotiation message");
                return;
            }
        };

        // A failure for one peer must not affect other peers' connections
        if let Err(e) = result {
            tracing::error!(
                peer_id = %from,
                error = %e,
                "Negotiation failed, tearing down peer"
            );
            self.teardown_peer(&from).await;
        }
    }

    /// Close and remove one peer, firing a disconnection event if it existed
    pub async fn teardown_peer(&self, peer_id: &str) {
        drop_connection(
            &self.connections,
            &self.pending_candidates,
            &self.events,
            peer_id,
        )
        .await;
    }

    /// Introspection only, no side effects
    pub async fn connection_stats(&self) -> HashMap<String, ConnectionStats> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(peer_id, pc)| {
                (
                    peer_id.clone(),
                    ConnectionStats {
                        connection_state: pc.connection_state().to_string(),
                        ice_connection_state: pc.ice_connection_state().to_string(),
                        ice_gathering_state: pc.ice_gathering_state().to_string(),
                        signaling_state: pc.signaling_state().to_string(),
                    },
                )
            })
            .collect()
    }

    /// Number of live peer connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Stop polling, close and clear all peer connections, release the
    /// local capture.
    pub async fn cleanup(&self) {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }

        if let Some(identity) = self.identity.read().await.clone() {
            self.channels
                .leave_channel(&identity.channel_id, &identity.peer_id)
                .await;
        }

        let connections = {
            let mut connections = self.connections.write().await;
            std::mem::take(&mut *connections)
        };
        for (peer_id, pc) in connections {
            if let Err(e) = pc.close().await {
                tracing::error!(peer_id = %peer_id, error = %e, "Error closing connection during cleanup");
            }
        }
        self.pending_candidates.write().await.clear();

        if let Some(capture) = self.capture.write().await.take() {
            capture.stop();
        }
        self.local_tracks.write().await.clear();

        tracing::info!("Peer session manager cleaned up");
    }
}

/// Remove one peer's connection, close it, discard its buffered candidates
/// and fire a disconnection event. Returns false when the peer had no
/// connection. Shared by `teardown_peer` and the terminal-state callback.
async fn drop_connection(
    connections: &RwLock<HashMap<String, Arc<RTCPeerConnection>>>,
    pending_candidates: &RwLock<HashMap<String, Vec<RTCIceCandidateInit>>>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    peer_id: &str,
) -> bool {
    let removed = {
        let mut connections = connections.write().await;
        connections.remove(peer_id)
    };

    match removed {
        Some(pc) => {
            if let Err(e) = pc.close().await {
                tracing::error!(peer_id = %peer_id, error = %e, "Error closing connection");
            }
            pending_candidates.write().await.remove(peer_id);
            let _ = events.send(SessionEvent::PeerDisconnected {
                peer_id: peer_id.to_string(),
            });
            true
        }
        None => false,
    }
}
