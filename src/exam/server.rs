use std::collections::HashMap;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::config::SignalingConfig;
use crate::error::{ProctorError, Result};
use crate::signaling::{ChannelManager, ChannelStats, MessageStore, SignalKind, SignalingMessage};
use crate::session::{PeerSessionManager, SessionEvent, INSTRUCTOR_PEER_ID};
use crate::violation::{
    CountdownEvent, CountdownStatus, ViolationCountdown, COUNTDOWN_SECONDS,
};

/// Server-wide event feed consumed by the event WebSocket and logged for
/// the record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExamEvent {
    CountdownStarted {
        exam_code: String,
        student_id: String,
        seconds_remaining: u8,
    },
    CountdownTick {
        exam_code: String,
        student_id: String,
        seconds_remaining: u8,
        final_warning: bool,
    },
    CountdownCleared {
        exam_code: String,
        student_id: String,
    },
    ExamSubmitted {
        exam_code: String,
        student_id: String,
        violations: Vec<String>,
    },
    StreamReceived {
        exam_code: String,
        peer_id: String,
        track_id: String,
    },
    PeerDisconnected {
        exam_code: String,
        peer_id: String,
    },
}

impl ExamEvent {
    pub fn exam_code(&self) -> &str {
        match self {
            ExamEvent::CountdownStarted { exam_code, .. }
            | ExamEvent::CountdownTick { exam_code, .. }
            | ExamEvent::CountdownCleared { exam_code, .. }
            | ExamEvent::ExamSubmitted { exam_code, .. }
            | ExamEvent::StreamReceived { exam_code, .. }
            | ExamEvent::PeerDisconnected { exam_code, .. } => exam_code,
        }
    }
}

type Mailbox = Arc<Mutex<mpsc::UnboundedReceiver<SignalingMessage>>>;

/// Application aggregate: channel manager, per-(exam, student) violation
/// countdowns, and an optional server-side instructor media endpoint per
/// exam channel.
///
/// The countdown and signaling subsystems are independent state machines
/// composed only here: a violation may end an exam, signaling delivers the
/// video evidence instructors watch.
pub struct ExamServer {
    signaling: SignalingConfig,
    channels: Arc<ChannelManager>,
    countdowns: RwLock<HashMap<(String, String), Arc<ViolationCountdown>>>,
    instructors: RwLock<HashMap<String, Arc<PeerSessionManager>>>,
    /// Drainable delivery buffers for HTTP-polled peers
    mailboxes: RwLock<HashMap<(String, String), Mailbox>>,
    events: broadcast::Sender<ExamEvent>,
}

impl ExamServer {
    pub fn new(signaling: SignalingConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            signaling,
            channels: ChannelManager::new(MessageStore::new()),
            countdowns: RwLock::new(HashMap::new()),
            instructors: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        self.signaling.poll_interval
    }

    /// Periodic age-based purge of the message store
    pub fn start_maintenance(self: Arc<Self>) {
        let server = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                server
                    .channels
                    .store()
                    .purge_expired(server.signaling.message_max_age)
                    .await;
            }
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExamEvent> {
        self.events.subscribe()
    }

    /// While the server-side instructor endpoint is enabled, its peer id
    /// cannot be claimed by clients: a client registration would replace
    /// the endpoint's delivery handler and starve its poll loop.
    pub fn reserved_peer(&self, peer_id: &str) -> bool {
        self.signaling.instructor_endpoint && peer_id == INSTRUCTOR_PEER_ID
    }

    /// Register a peer for HTTP polling: messages delivered by
    /// `poll_messages` land in a mailbox drained by [`Self::poll`].
    pub async fn join_channel(self: &Arc<Self>, channel_id: &str, peer_id: &str) -> Result<()> {
        if self.reserved_peer(peer_id) {
            return Err(ProctorError::PeerIdReserved(peer_id.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.join_channel(channel_id, peer_id, tx).await;

        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.insert(
            (channel_id.to_string(), peer_id.to_string()),
            Arc::new(Mutex::new(rx)),
        );
        drop(mailboxes);

        if self.signaling.instructor_endpoint {
            self.ensure_instructor(channel_id).await;
        }
        Ok(())
    }

    pub async fn leave_channel(&self, channel_id: &str, peer_id: &str) {
        self.channels.leave_channel(channel_id, peer_id).await;
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.remove(&(channel_id.to_string(), peer_id.to_string()));
    }

    pub async fn send(
        &self,
        channel_id: &str,
        from: &str,
        target: Option<&str>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> SignalingMessage {
        self.channels
            .send_message(channel_id, from, target, kind, payload)
            .await
    }

    /// Poll for, then drain, this peer's undelivered messages
    pub async fn poll(&self, channel_id: &str, peer_id: &str) -> Vec<SignalingMessage> {
        let mailbox = {
            let mailboxes = self.mailboxes.read().await;
            mailboxes
                .get(&(channel_id.to_string(), peer_id.to_string()))
                .cloned()
        };

        let Some(mailbox) = mailbox else {
            return Vec::new();
        };

        self.channels.poll_messages(channel_id, peer_id).await;

        let mut rx = mailbox.lock().await;
        let mut delivered = Vec::new();
        while let Ok(message) = rx.try_recv() {
            delivered.push(message);
        }
        delivered
    }

    pub async fn stats(&self, channel_id: &str) -> ChannelStats {
        self.channels.channel_stats(channel_id).await
    }

    /// Get or create the countdown engine for one student's exam session
    async fn countdown_for(&self, exam_code: &str, student_id: &str) -> Arc<ViolationCountdown> {
        let key = (exam_code.to_string(), student_id.to_string());

        {
            let countdowns = self.countdowns.read().await;
            if let Some(countdown) = countdowns.get(&key) {
                return Arc::clone(countdown);
            }
        }

        let mut countdowns = self.countdowns.write().await;
        if let Some(countdown) = countdowns.get(&key) {
            return Arc::clone(countdown);
        }

        let exam = exam_code.to_string();
        let student = student_id.to_string();
        let countdown = ViolationCountdown::new(Arc::new(move |violations| {
            // The auto-submit of record. Loud on purpose: a silently missed
            // submission is a security-relevant failure.
            tracing::warn!(
                exam_code = %exam,
                student_id = %student,
                violations = ?violations.iter().map(|v| v.composite()).collect::<Vec<_>>(),
                "EXAM AUTO-SUBMITTED"
            );
        }));

        self.forward_countdown_events(exam_code, student_id, &countdown);
        countdowns.insert(key, Arc::clone(&countdown));
        tracing::info!(exam_code = %exam_code, student_id = %student_id, "Countdown engine created");
        countdown
    }

    fn forward_countdown_events(
        &self,
        exam_code: &str,
        student_id: &str,
        countdown: &Arc<ViolationCountdown>,
    ) {
        let mut source = countdown.subscribe();
        let sink = self.events.clone();
        let exam_code = exam_code.to_string();
        let student_id = student_id.to_string();

        tokio::spawn(async move {
            while let Ok(event) = source.recv().await {
                let mapped = match event {
                    CountdownEvent::Started { seconds_remaining } => ExamEvent::CountdownStarted {
                        exam_code: exam_code.clone(),
                        student_id: student_id.clone(),
                        seconds_remaining,
                    },
                    CountdownEvent::Tick {
                        seconds_remaining,
                        final_warning,
                    } => ExamEvent::CountdownTick {
                        exam_code: exam_code.clone(),
                        student_id: student_id.clone(),
                        seconds_remaining,
                        final_warning,
                    },
                    CountdownEvent::Cleared => ExamEvent::CountdownCleared {
                        exam_code: exam_code.clone(),
                        student_id: student_id.clone(),
                    },
                    CountdownEvent::Submitted { violations } => ExamEvent::ExamSubmitted {
                        exam_code: exam_code.clone(),
                        student_id: student_id.clone(),
                        violations,
                    },
                };
                let _ = sink.send(mapped);
            }
        });
    }

    pub async fn report_violation(
        &self,
        exam_code: &str,
        student_id: &str,
        kind: &str,
        description: &str,
    ) {
        let countdown = self.countdown_for(exam_code, student_id).await;
        countdown.add_violation(kind, description).await;
    }

    pub async fn resolve_violation(
        &self,
        exam_code: &str,
        student_id: &str,
        kind: &str,
        description: &str,
    ) {
        let countdown = {
            let countdowns = self.countdowns.read().await;
            countdowns
                .get(&(exam_code.to_string(), student_id.to_string()))
                .cloned()
        };
        if let Some(countdown) = countdown {
            countdown.remove_violation(kind, description).await;
        }
    }

    pub async fn clear_violations(&self, exam_code: &str, student_id: &str) {
        let countdown = {
            let countdowns = self.countdowns.read().await;
            countdowns
                .get(&(exam_code.to_string(), student_id.to_string()))
                .cloned()
        };
        if let Some(countdown) = countdown {
            countdown.clear_all_violations().await;
        }
    }

    pub async fn violation_status(&self, exam_code: &str, student_id: &str) -> CountdownStatus {
        let countdown = {
            let countdowns = self.countdowns.read().await;
            countdowns
                .get(&(exam_code.to_string(), student_id.to_string()))
                .cloned()
        };

        match countdown {
            Some(countdown) => countdown.status().await,
            None => CountdownStatus {
                is_countdown_active: false,
                remaining_seconds: COUNTDOWN_SECONDS,
                violation_count: 0,
                violations: Vec::new(),
                final_warning: false,
            },
        }
    }

    /// Stand up the server-side instructor media endpoint for an exam
    /// channel: student offers posted through the signaling API get
    /// answered here and their streams terminate at this endpoint.
    async fn ensure_instructor(self: &Arc<Self>, exam_code: &str) {
        {
            let instructors = self.instructors.read().await;
            if instructors.contains_key(exam_code) {
                return;
            }
        }

        let mut instructors = self.instructors.write().await;
        if instructors.contains_key(exam_code) {
            return;
        }

        let sessions = PeerSessionManager::new(
            Arc::clone(&self.channels),
            self.signaling.poll_interval,
        );
        sessions.initialize_as_instructor(exam_code).await;

        if let Some(mut session_events) = sessions.take_event_receiver().await {
            let sink = self.events.clone();
            let exam = exam_code.to_string();
            tokio::spawn(async move {
                while let Some(event) = session_events.recv().await {
                    let mapped = match event {
                        SessionEvent::StreamReceived { peer_id, track } => {
                            ExamEvent::StreamReceived {
                                exam_code: exam.clone(),
                                peer_id,
                                track_id: track.id(),
                            }
                        }
                        SessionEvent::PeerDisconnected { peer_id } => {
                            ExamEvent::PeerDisconnected {
                                exam_code: exam.clone(),
                                peer_id,
                            }
                        }
                    };
                    let _ = sink.send(mapped);
                }
            });
        }

        if let Err(e) = sessions.start_signaling_polling().await {
            tracing::error!(exam_code = %exam_code, error = %e, "Failed to start instructor polling");
            return;
        }

        instructors.insert(exam_code.to_string(), sessions);
        tracing::info!(exam_code = %exam_code, "Instructor endpoint ready");
    }

    /// Connection introspection for an exam's instructor endpoint
    pub async fn instructor_stats(
        &self,
        exam_code: &str,
    ) -> HashMap<String, crate::session::ConnectionStats> {
        let instructors = self.instructors.read().await;
        match instructors.get(exam_code) {
            Some(sessions) => sessions.connection_stats().await,
            None => HashMap::new(),
        }
    }

    /// Tear down every subsystem: instructor endpoints, countdown engines,
    /// channel state, mailboxes.
    pub async fn cleanup(&self) {
        let instructors = {
            let mut instructors = self.instructors.write().await;
            std::mem::take(&mut *instructors)
        };
        for (_, sessions) in instructors {
            sessions.cleanup().await;
        }

        let countdowns = {
            let mut countdowns = self.countdowns.write().await;
            std::mem::take(&mut *countdowns)
        };
        for (_, countdown) in countdowns {
            countdown.cleanup().await;
        }

        self.mailboxes.write().await.clear();
        self.channels.cleanup().await;

        tracing::info!("Exam server cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server() -> Arc<ExamServer> {
        // Instructor endpoint off: these tests exercise the aggregate, the
        // media path has its own suite.
        ExamServer::new(SignalingConfig {
            poll_interval: Duration::from_millis(50),
            message_max_age: Duration::from_secs(3600),
            instructor_endpoint: false,
        })
    }

    #[tokio::test]
    async fn test_join_send_poll_roundtrip() {
        let server = server();
        server.join_channel("exam-1", "student_1").await.unwrap();

        server
            .send(
                "exam-1",
                "instructor",
                Some("student_1"),
                SignalKind::Offer,
                serde_json::json!({"sdp": "v=0"}),
            )
            .await;

        let first = server.poll("exam-1", "student_1").await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, SignalKind::Offer);

        // Second poll redelivers nothing
        let second = server.poll("exam-1", "student_1").await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_instructor_peer_id_rejected_while_endpoint_enabled() {
        let server = ExamServer::new(SignalingConfig {
            poll_interval: Duration::from_millis(50),
            message_max_age: Duration::from_secs(3600),
            instructor_endpoint: true,
        });

        let result = server.join_channel("exam-1", INSTRUCTOR_PEER_ID).await;
        assert!(matches!(result, Err(ProctorError::PeerIdReserved(_))));
        assert!(!server.channels().is_member("exam-1", INSTRUCTOR_PEER_ID).await);
    }

    #[tokio::test]
    async fn test_instructor_peer_id_allowed_while_endpoint_disabled() {
        let server = server();

        server.join_channel("exam-1", INSTRUCTOR_PEER_ID).await.unwrap();
        assert!(server.channels().is_member("exam-1", INSTRUCTOR_PEER_ID).await);
    }

    #[tokio::test]
    async fn test_poll_without_join_is_empty() {
        let server = server();
        server
            .send("exam-1", "instructor", None, SignalKind::Offer, serde_json::json!({}))
            .await;

        assert!(server.poll("exam-1", "stranger").await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_after_joins_and_send() {
        let server = server();
        server.join_channel("exam-1", "student_1").await.unwrap();
        server.join_channel("exam-1", "student_2").await.unwrap();
        server
            .send("exam-1", "student_1", None, SignalKind::Offer, serde_json::json!({}))
            .await;

        let stats = server.stats("exam-1").await;
        assert_eq!(stats.peer_count, 2);
        assert_eq!(stats.message_count, 1);
        assert!(stats.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_violation_status_lifecycle() {
        let server = server();

        let idle = server.violation_status("exam-1", "student_1").await;
        assert!(!idle.is_countdown_active);
        assert_eq!(idle.remaining_seconds, COUNTDOWN_SECONDS);

        server
            .report_violation("exam-1", "student_1", "no-face", "Face not visible")
            .await;
        let active = server.violation_status("exam-1", "student_1").await;
        assert!(active.is_countdown_active);
        assert_eq!(active.violation_count, 1);

        server
            .resolve_violation("exam-1", "student_1", "no-face", "Face not visible")
            .await;
        let resolved = server.violation_status("exam-1", "student_1").await;
        assert!(!resolved.is_countdown_active);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let server = server();

        server
            .report_violation("exam-1", "student_1", "no-face", "Face not visible")
            .await;

        assert!(server.violation_status("exam-1", "student_1").await.is_countdown_active);
        assert!(!server.violation_status("exam-1", "student_2").await.is_countdown_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_publishes_submitted_event() {
        let server = server();
        let mut events = server.subscribe_events();

        server
            .report_violation("exam-1", "student_1", "no-face", "Face not visible")
            .await;

        // Let the timer task register its first sleep before advancing
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(1)).await;
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }

        let mut submitted = None;
        while let Ok(event) = events.try_recv() {
            if let ExamEvent::ExamSubmitted { student_id, violations, .. } = event {
                submitted = Some((student_id, violations));
            }
        }

        let (student_id, violations) = submitted.expect("Expected a submitted event");
        assert_eq!(student_id, "student_1");
        assert_eq!(violations, vec!["no-face:Face not visible".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_resets_state() {
        let server = server();
        server.join_channel("exam-1", "student_1").await.unwrap();
        server
            .report_violation("exam-1", "student_1", "no-face", "Face not visible")
            .await;

        server.cleanup().await;

        assert!(!server.violation_status("exam-1", "student_1").await.is_countdown_active);
        let stats = server.stats("exam-1").await;
        assert_eq!(stats.peer_count, 0);
        assert_eq!(stats.message_count, 0);
    }
}
