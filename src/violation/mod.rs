use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Seconds on the shared countdown when it starts
pub const COUNTDOWN_SECONDS: u8 = 7;

/// At or below this many remaining seconds the engine reports a final
/// warning so presentation layers can react. No effect on timing.
pub const FINAL_WARNING_SECONDS: u8 = 3;

/// Identity of one active violation. Duplicates (same kind + description)
/// collapse to one logical entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ViolationKey {
    pub kind: String,
    pub description: String,
}

impl ViolationKey {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }

    /// Composite key combining kind and description
    pub fn composite(&self) -> String {
        format!("{}:{}", self.kind, self.description)
    }
}

/// Discrete state transitions, published so UI layers can subscribe rather
/// than poll internal fields.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CountdownEvent {
    Started { seconds_remaining: u8 },
    Tick { seconds_remaining: u8, final_warning: bool },
    Cleared,
    Submitted { violations: Vec<String> },
}

/// Invoked exactly once when the countdown expires, with the violations
/// active at that moment (most recent last).
pub type SubmissionHandler = Arc<dyn Fn(Vec<ViolationKey>) + Send + Sync>;

/// Snapshot returned by [`ViolationCountdown::status`]
#[derive(Debug, Clone, Serialize)]
pub struct CountdownStatus {
    pub is_countdown_active: bool,
    pub remaining_seconds: u8,
    pub violation_count: usize,
    /// Composite keys, most recent first
    pub violations: Vec<String>,
    pub final_warning: bool,
}

struct CountdownInner {
    /// Insertion order retained for most-recent-first presentation
    violations: Vec<ViolationKey>,
    seconds_remaining: u8,
    timer: Option<JoinHandle<()>>,
}

impl CountdownInner {
    /// Cancel the timer and reset to the idle baseline. Every exit path
    /// (set emptied, expiry, cleanup) goes through here so a dangling timer
    /// can never fire a submission after the session ended.
    fn stop_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.seconds_remaining = COUNTDOWN_SECONDS;
    }
}

/// Single shared countdown gating automatic exam submission, driven by the
/// set of concurrently active violations.
///
/// The countdown is active if and only if the violation set is non-empty;
/// this holds after every add/remove/clear. A violation arriving while the
/// countdown is already running does NOT reset the clock: the clock
/// reflects time since the first unresolved violation.
///
/// The submission handler is a required constructor dependency, so a missing
/// handler is unrepresentable at expiry.
pub struct ViolationCountdown {
    inner: Arc<Mutex<CountdownInner>>,
    events: broadcast::Sender<CountdownEvent>,
    on_submit: SubmissionHandler,
}

impl ViolationCountdown {
    pub fn new(on_submit: SubmissionHandler) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: Arc::new(Mutex::new(CountdownInner {
                violations: Vec::new(),
                seconds_remaining: COUNTDOWN_SECONDS,
                timer: None,
            })),
            events,
            on_submit,
        })
    }

    /// Subscribe to countdown state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CountdownEvent> {
        self.events.subscribe()
    }

    /// Record a violation. Idempotent for an already-present (kind,
    /// description) pair. Starts the countdown on the empty→non-empty
    /// transition; leaves a running countdown untouched otherwise.
    pub async fn add_violation(&self, kind: &str, description: &str) {
        let key = ViolationKey::new(kind, description);
        let mut inner = self.inner.lock().await;

        if inner.violations.contains(&key) {
            return;
        }
        inner.violations.push(key);
        tracing::warn!(kind = %kind, description = %description, "Violation recorded");

        if inner.timer.is_none() {
            inner.seconds_remaining = COUNTDOWN_SECONDS;
            inner.timer = Some(self.spawn_timer());
            let _ = self.events.send(CountdownEvent::Started {
                seconds_remaining: COUNTDOWN_SECONDS,
            });
            tracing::warn!("Auto-submit countdown started");
        }
    }

    /// Resolve a violation. When the last one clears, the countdown stops
    /// and resets to the idle baseline.
    pub async fn remove_violation(&self, kind: &str, description: &str) {
        let key = ViolationKey::new(kind, description);
        let mut inner = self.inner.lock().await;

        let before = inner.violations.len();
        inner.violations.retain(|v| v != &key);
        if inner.violations.len() == before {
            return;
        }
        tracing::info!(kind = %kind, description = %description, "Violation resolved");

        if inner.violations.is_empty() {
            inner.stop_timer();
            let _ = self.events.send(CountdownEvent::Cleared);
            tracing::info!("All violations resolved, countdown cancelled");
        }
    }

    /// Empty the violation set unconditionally and stop the countdown
    pub async fn clear_all_violations(&self) {
        let mut inner = self.inner.lock().await;
        let was_active = inner.timer.is_some();

        inner.violations.clear();
        inner.stop_timer();

        if was_active {
            let _ = self.events.send(CountdownEvent::Cleared);
            tracing::info!("Violations cleared, countdown cancelled");
        }
    }

    /// Pure read of the current countdown state
    pub async fn status(&self) -> CountdownStatus {
        let inner = self.inner.lock().await;
        let is_active = inner.timer.is_some();

        CountdownStatus {
            is_countdown_active: is_active,
            remaining_seconds: inner.seconds_remaining,
            violation_count: inner.violations.len(),
            violations: inner
                .violations
                .iter()
                .rev()
                .map(ViolationKey::composite)
                .collect(),
            final_warning: is_active && inner.seconds_remaining <= FINAL_WARNING_SECONDS,
        }
    }

    /// Cancel the timer, empty the set, and reset to the idle baseline
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        inner.violations.clear();
        inner.stop_timer();
        tracing::debug!("Violation countdown cleaned up");
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let on_submit = Arc::clone(&self.on_submit);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;

                let expired = {
                    let mut inner = inner.lock().await;
                    inner.seconds_remaining = inner.seconds_remaining.saturating_sub(1);

                    if inner.seconds_remaining == 0 {
                        let violations = std::mem::take(&mut inner.violations);
                        // The timer handle is this task; drop it without
                        // abort so the submission below still runs.
                        inner.timer = None;
                        inner.seconds_remaining = COUNTDOWN_SECONDS;
                        Some(violations)
                    } else {
                        let seconds = inner.seconds_remaining;
                        let _ = events.send(CountdownEvent::Tick {
                            seconds_remaining: seconds,
                            final_warning: seconds <= FINAL_WARNING_SECONDS,
                        });
                        None
                    }
                };

                if let Some(violations) = expired {
                    tracing::warn!(
                        violation_count = violations.len(),
                        "Countdown expired, invoking submission handler"
                    );
                    let _ = events.send(CountdownEvent::Submitted {
                        violations: violations.iter().map(ViolationKey::composite).collect(),
                    });
                    (on_submit)(violations);
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> (Arc<ViolationCountdown>, Arc<AtomicUsize>) {
        let submissions = Arc::new(AtomicUsize::new(0));
        let counter = submissions.clone();
        let countdown = ViolationCountdown::new(Arc::new(move |_violations| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (countdown, submissions)
    }

    /// Let the spawned timer task observe advanced virtual time
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Advance paused time one second at a time so each tick's follow-up
    /// sleep is scheduled before the next advance.
    async fn tick_seconds(n: u64) {
        // Let the timer task register its first sleep before advancing
        settle().await;
        for _ in 0..n {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
    }

    #[tokio::test]
    async fn test_active_iff_violations_nonempty() {
        let (countdown, _) = engine();

        assert!(!countdown.status().await.is_countdown_active);

        countdown.add_violation("no-face", "Face not visible").await;
        assert!(countdown.status().await.is_countdown_active);

        countdown.add_violation("tab-switch", "Left the exam tab").await;
        assert!(countdown.status().await.is_countdown_active);

        countdown.remove_violation("no-face", "Face not visible").await;
        assert!(countdown.status().await.is_countdown_active);

        countdown.remove_violation("tab-switch", "Left the exam tab").await;
        assert!(!countdown.status().await.is_countdown_active);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_idempotent() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        countdown.add_violation("no-face", "Face not visible").await;

        let status = countdown.status().await;
        assert_eq!(status.violation_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_does_not_reset_timer() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(3).await;
        assert_eq!(countdown.status().await.remaining_seconds, 4);

        countdown.add_violation("no-face", "Face not visible").await;
        assert_eq!(countdown.status().await.remaining_seconds, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_violation_mid_countdown_does_not_reset() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(3).await;
        assert_eq!(countdown.status().await.remaining_seconds, 4);

        // The clock reflects time since the first unresolved violation
        countdown.add_violation("multiple-people", "Second person detected").await;
        let status = countdown.status().await;
        assert_eq!(status.remaining_seconds, 4);
        assert_eq!(status.violation_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_decrements_once_per_second() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        assert_eq!(countdown.status().await.remaining_seconds, 7);

        tick_seconds(1).await;
        assert_eq!(countdown.status().await.remaining_seconds, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_submits_exactly_once() {
        let (countdown, submissions) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(7).await;

        assert_eq!(submissions.load(Ordering::SeqCst), 1);
        let status = countdown.status().await;
        assert!(!status.is_countdown_active);
        assert_eq!(status.remaining_seconds, COUNTDOWN_SECONDS);
        assert_eq!(status.violation_count, 0);

        // More elapsed time fires nothing further
        tick_seconds(30).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_before_expiry_cancels_submission() {
        let (countdown, submissions) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(5).await;

        countdown.remove_violation("no-face", "Face not visible").await;
        assert_eq!(countdown.status().await.remaining_seconds, COUNTDOWN_SECONDS);

        tick_seconds(30).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_warning_at_three_seconds() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(3).await;
        assert!(!countdown.status().await.final_warning);

        tick_seconds(1).await;
        let status = countdown.status().await;
        assert_eq!(status.remaining_seconds, 3);
        assert!(status.final_warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_cancels_countdown() {
        let (countdown, submissions) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        countdown.add_violation("tab-switch", "Left the exam tab").await;
        tick_seconds(4).await;

        countdown.clear_all_violations().await;
        let status = countdown.status().await;
        assert!(!status.is_countdown_active);
        assert_eq!(status.violation_count, 0);
        assert_eq!(status.remaining_seconds, COUNTDOWN_SECONDS);

        tick_seconds(30).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_after_expiry() {
        let (countdown, submissions) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(7).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 1);

        countdown.add_violation("no-face", "Face not visible").await;
        assert!(countdown.status().await.is_countdown_active);
        tick_seconds(7).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_violations_listed_most_recent_first() {
        let (countdown, _) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        countdown.add_violation("tab-switch", "Left the exam tab").await;

        let status = countdown.status().await;
        assert_eq!(
            status.violations,
            vec![
                "tab-switch:Left the exam tab".to_string(),
                "no-face:Face not visible".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_cancels_dangling_timer() {
        let (countdown, submissions) = engine();

        countdown.add_violation("no-face", "Face not visible").await;
        countdown.cleanup().await;

        tick_seconds(30).await;
        assert_eq!(submissions.load(Ordering::SeqCst), 0);
        assert!(!countdown.status().await.is_countdown_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_track_transitions() {
        let (countdown, _) = engine();
        let mut events = countdown.subscribe();

        countdown.add_violation("no-face", "Face not visible").await;
        tick_seconds(1).await;
        countdown.remove_violation("no-face", "Face not visible").await;

        assert!(matches!(
            events.try_recv().unwrap(),
            CountdownEvent::Started { seconds_remaining: 7 }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            CountdownEvent::Tick { seconds_remaining: 6, final_warning: false }
        ));
        assert!(matches!(events.try_recv().unwrap(), CountdownEvent::Cleared));
    }
}
