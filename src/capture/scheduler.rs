//! Periodic frame capture and analysis.
//!
//! One timer task ticks at the configured interval. Each tick re-reads the
//! live session, decides whether a frame may be analyzed, and at most one
//! analysis task is in flight at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::provider::GuidanceBackend;
use crate::backend::types::{GuidanceRequest, GuidanceResponse};
use crate::capture::retry::{FailureVerdict, RetryController};
use crate::capture::traits::{Camera, CapturedFrame, SpeechStatus};
use crate::config::SchedulerConfig;
use crate::errors::GuidedFixError;
use crate::guided_fix::event_bus::SessionNotice;
use crate::guided_fix::interpreter::interpret;
use crate::guided_fix::session::{SessionHandle, SessionSnapshot};
use crate::guided_fix::state::{GuidedFixEvent, GuidedFixState, RequestId, StateKind};

/// Why a tick did not start an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotCapturable,
    Busy,
    Speaking,
    TooSoon,
    CameraNotReady,
}

#[derive(Debug)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Issued {
        request_id: RequestId,
        task: JoinHandle<()>,
    },
}

/// What a request was bound to when it was issued.
#[derive(Debug, Clone, Copy)]
struct IssuedRequest {
    request_id: RequestId,
    step: usize,
    kind: StateKind,
}

/// Where an analysis attempt stopped.
#[derive(Debug)]
enum AnalysisError {
    /// No frame was taken. Skipped without touching the retry budget.
    Capture(GuidedFixError),
    Request(GuidedFixError),
}

/// Everything one tick needs. Shared between the timer and analysis tasks.
pub struct FrameWorker {
    camera: Arc<dyn Camera>,
    session: SessionHandle,
    speech: Arc<dyn SpeechStatus>,
    backend: Arc<dyn GuidanceBackend>,
    frame_quality: f32,
    retry: Mutex<RetryController>,
    last_issued: Mutex<Option<Instant>>,
}

impl FrameWorker {
    pub fn new(
        camera: Arc<dyn Camera>,
        session: SessionHandle,
        speech: Arc<dyn SpeechStatus>,
        backend: Arc<dyn GuidanceBackend>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            camera,
            session,
            speech,
            backend,
            frame_quality: config.frame_quality.clamp(0.0, 1.0),
            retry: Mutex::new(RetryController::new(config)),
            last_issued: Mutex::new(None),
        })
    }

    /// Run the gating checks and, if they all pass, spawn one analysis.
    pub fn tick(self: &Arc<Self>) -> TickOutcome {
        let snap = self.session.snapshot();
        if !snap.state.is_capturable() {
            return TickOutcome::Skipped(SkipReason::NotCapturable);
        }
        if snap.context.analysis.is_analyzing {
            return TickOutcome::Skipped(SkipReason::Busy);
        }
        if self.speech.is_speaking() {
            return TickOutcome::Skipped(SkipReason::Speaking);
        }
        if self.too_soon() {
            return TickOutcome::Skipped(SkipReason::TooSoon);
        }
        if !self.camera.is_ready() {
            return TickOutcome::Skipped(SkipReason::CameraNotReady);
        }
        let Some(request_id) = snap.state.active_request() else {
            return TickOutcome::Skipped(SkipReason::NotCapturable);
        };
        if !self.session.begin_analysis(request_id) {
            return TickOutcome::Skipped(SkipReason::Busy);
        }
        if let Ok(mut last) = self.last_issued.lock() {
            *last = Some(Instant::now());
        }

        let issued = IssuedRequest {
            request_id,
            step: snap.context.current_step_index,
            kind: snap.state.kind(),
        };
        tracing::debug!(%request_id, step = issued.step, kind = ?issued.kind, "frame analysis issued");

        let worker = Arc::clone(self);
        let task = tokio::spawn(async move { worker.run_analysis(issued).await });
        self.session.attach_abort(request_id, task.abort_handle());
        TickOutcome::Issued { request_id, task }
    }

    fn too_soon(&self) -> bool {
        let spacing = match self.retry.lock() {
            Ok(r) => r.effective_spacing(),
            Err(_) => return false,
        };
        match self.last_issued.lock() {
            Ok(last) => last.map(|t| t.elapsed() < spacing).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn run_analysis(self: Arc<Self>, issued: IssuedRequest) {
        let result = self.analyze().await;
        self.settle(issued, result);
        // Held until the outcome is applied.
        self.session.finish_analysis(issued.request_id);
    }

    /// Capture a frame against the live session and send it off.
    async fn analyze(&self) -> Result<GuidanceResponse, AnalysisError> {
        let frame = self
            .camera
            .take_picture(self.frame_quality)
            .await
            .map_err(AnalysisError::Capture)?;
        let snap = self.session.snapshot();
        let request = build_request(&snap, frame);
        self.backend
            .analyze_frame(request)
            .await
            .map_err(AnalysisError::Request)
    }

    fn settle(&self, issued: IssuedRequest, result: Result<GuidanceResponse, AnalysisError>) {
        match result {
            Ok(response) => {
                if let Ok(mut r) = self.retry.lock() {
                    r.record_success();
                }
                self.deliver(issued, response);
            }
            Err(AnalysisError::Capture(GuidedFixError::CameraNotReady)) => {
                tracing::debug!(request_id = %issued.request_id, "camera not ready, frame skipped");
            }
            Err(AnalysisError::Capture(e)) => {
                tracing::warn!(error = %e, request_id = %issued.request_id, "frame capture failed, skipped");
            }
            Err(AnalysisError::Request(GuidedFixError::Aborted)) => {}
            Err(AnalysisError::Request(e)) => self.on_failure(issued, e),
        }
    }

    fn deliver(&self, issued: IssuedRequest, response: GuidanceResponse) {
        // The session may have moved on while the request was in flight.
        let snap = self.session.snapshot();
        let active = snap.state.active_request();
        if active != Some(issued.request_id)
            || snap.context.current_step_index != issued.step
            || snap.state.kind() != issued.kind
        {
            tracing::debug!(
                received = %issued.request_id,
                ?active,
                "discarding stale analysis"
            );
            self.session.bus().publish(SessionNotice::StaleResponseDiscarded {
                received: issued.request_id,
                active,
            });
            return;
        }

        let interpreted = interpret(
            &response,
            &snap.state,
            &snap.context,
            issued.request_id,
            self.session.policy(),
        );
        if let Some(text) = interpreted.safety_warning {
            tracing::warn!(warning = %text, "safety warning from analysis");
            self.session.bus().publish(SessionNotice::SafetyWarning { text });
        }
        self.session.dispatch_all(interpreted.interpretation.into_events());
    }

    fn on_failure(&self, issued: IssuedRequest, err: GuidedFixError) {
        let verdict = match self.retry.lock() {
            Ok(mut r) => r.record_failure(&err),
            Err(_) => FailureVerdict::Fatal,
        };
        match verdict {
            FailureVerdict::Retry => {
                tracing::warn!(error = %err, request_id = %issued.request_id, "frame analysis failed, will retry");
            }
            FailureVerdict::Exhausted { failures } => {
                tracing::error!(error = %err, failures, "frame analysis retry budget exhausted");
                self.session.dispatch(GuidedFixEvent::AnalysisFailed {
                    message: "I'm having trouble seeing clearly. Check your connection and try again."
                        .into(),
                    recoverable: true,
                    request_id: issued.request_id,
                });
            }
            FailureVerdict::Fatal => {
                tracing::error!(error = %err, "frame analysis failed");
                self.session.dispatch(GuidedFixEvent::AnalysisFailed {
                    message: err.to_string(),
                    recoverable: false,
                    request_id: issued.request_id,
                });
            }
        }
    }
}

/// Build the analysis request for the session as it is right now.
fn build_request(snap: &SessionSnapshot, frame: CapturedFrame) -> GuidanceRequest {
    let ctx = &snap.context;
    let step = ctx.current_step();
    let verifying = matches!(snap.state, GuidedFixState::VerifyingIdentity { .. });
    let banned = ctx.banned_items();

    GuidanceRequest {
        image_base64: frame.base64,
        category: ctx.problem.category.clone(),
        problem_description: ctx.problem.description().to_string(),
        current_step: ctx.current_step_index as u32 + 1,
        total_steps: ctx.total_steps() as u32,
        current_step_instruction: step.map(|s| s.instruction.clone()).unwrap_or_default(),
        step_context: step
            .map(|s| s.looking_for.clone())
            .filter(|s| !s.trim().is_empty()),
        completion_criteria: step.and_then(|s| s.completion_criteria.clone()),
        visual_anchors: step
            .filter(|s| !s.visual_anchors.is_empty())
            .map(|s| s.visual_anchors.iter().cloned().collect()),
        expected_item: if verifying { ctx.expected_item.clone() } else { None },
        banned_items: (!banned.is_empty()).then_some(banned),
        confirmed_substitutes: (!ctx.confirmed_substitutes.is_empty())
            .then(|| ctx.confirmed_substitutes.clone()),
    }
}

struct Running {
    timer: JoinHandle<()>,
    worker: Arc<FrameWorker>,
}

/// Owns the timer task. `stop` is idempotent.
pub struct FrameScheduler {
    config: SchedulerConfig,
    running: Option<Running>,
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config, running: None }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start ticking. The first tick fires immediately.
    pub fn start(
        &mut self,
        camera: Arc<dyn Camera>,
        session: SessionHandle,
        speech: Arc<dyn SpeechStatus>,
        backend: Arc<dyn GuidanceBackend>,
    ) {
        self.stop();
        let worker = FrameWorker::new(camera, session, speech, backend, &self.config);
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        let ticking = Arc::clone(&worker);

        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let TickOutcome::Skipped(reason) = ticking.tick() {
                    tracing::trace!(?reason, "capture tick skipped");
                }
            }
        });
        tracing::info!(interval_ms = self.config.interval_ms, "frame scheduler started");
        self.running = Some(Running { timer, worker });
    }

    /// Cancel the timer and abort the in-flight analysis, if any.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.timer.abort();
            running.worker.session.abort_analysis();
            tracing::info!("frame scheduler stopped");
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::SpeechFlag;
    use crate::errors::GuidedFixResult;
    use crate::guided_fix::state::PauseReason;
    use crate::testing::{self, FakeBackend, FakeCamera};

    fn quick() -> SchedulerConfig {
        SchedulerConfig { min_spacing_ms: 0, ..SchedulerConfig::default() }
    }

    struct Rig {
        camera: Arc<FakeCamera>,
        backend: Arc<FakeBackend>,
        speech: Arc<SpeechFlag>,
        session: SessionHandle,
        worker: Arc<FrameWorker>,
    }

    fn rig(backend: FakeBackend, config: SchedulerConfig) -> Rig {
        let camera = Arc::new(FakeCamera::new());
        let backend = Arc::new(backend);
        let speech = Arc::new(SpeechFlag::new());
        let session = testing::active_session(testing::plan(3));
        let worker = FrameWorker::new(
            camera.clone(),
            session.clone(),
            speech.clone(),
            backend.clone(),
            &config,
        );
        Rig { camera, backend, speech, session, worker }
    }

    async fn run(worker: &Arc<FrameWorker>) -> RequestId {
        match worker.tick() {
            TickOutcome::Issued { request_id, task } => {
                task.await.unwrap();
                request_id
            }
            TickOutcome::Skipped(reason) => panic!("tick skipped: {reason:?}"),
        }
    }

    #[tokio::test]
    async fn test_gating() {
        let r = rig(FakeBackend::new(), quick());

        r.speech.set_speaking(true);
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::Speaking)));
        r.speech.set_speaking(false);

        r.camera.set_ready(false);
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::CameraNotReady)));
        r.camera.set_ready(true);

        r.session.dispatch(GuidedFixEvent::UserPaused);
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::NotCapturable)));
        assert_eq!(r.camera.captures.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_request_in_flight() {
        let r = rig(FakeBackend::with_delay(Duration::from_millis(50)), quick());
        let first = r.worker.tick();
        assert!(r.session.is_analyzing());
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::Busy)));
        if let TickOutcome::Issued { task, .. } = first {
            task.await.unwrap();
        }
        assert!(!r.session.is_analyzing());
        assert_eq!(r.backend.guidance_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_minimum_spacing() {
        let r = rig(FakeBackend::new(), SchedulerConfig::default());
        run(&r.worker).await;
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::TooSoon)));
    }

    #[tokio::test]
    async fn test_completion_response_is_applied() {
        let backend = FakeBackend::new();
        backend.push_guidance(Ok(testing::guidance(0.85, true, "")));
        let r = rig(backend, quick());
        run(&r.worker).await;
        assert_eq!(r.session.state().kind(), StateKind::StepCompletionSuggested);
        assert!(r.session.snapshot().context.current_guidance.is_some());
    }

    #[tokio::test]
    async fn test_request_carries_session_context() {
        let r = rig(FakeBackend::new(), quick());
        r.session.dispatch(GuidedFixEvent::UserMarkedComplete);
        r.session.dispatch(GuidedFixEvent::UserConfirmedStep);
        r.session.dispatch(GuidedFixEvent::UserItemUnavailable { item: "wrench".into() });
        // Back to the step without a substitute.
        r.session.dispatch(GuidedFixEvent::UserRejectedSubstitute);
        r.session.dispatch(GuidedFixEvent::UserResumed);
        assert_eq!(r.session.state().step(), Some(1));

        run(&r.worker).await;
        let sent = r.backend.guidance_requests.lock().unwrap().pop().unwrap();
        assert_eq!(sent.current_step, 2);
        assert_eq!(sent.total_steps, 3);
        assert_eq!(sent.current_step_instruction, "Step 2 instruction");
        assert_eq!(sent.image_base64, "ZmFrZQ==");
        assert_eq!(sent.banned_items, Some(vec!["wrench".to_string()]));
        assert!(sent.expected_item.is_none());
        assert!(sent.confirmed_substitutes.is_none());
        assert_eq!(sent.visual_anchors, Some(vec!["valve".to_string()]));
    }

    #[tokio::test]
    async fn test_response_after_state_change_is_discarded() {
        let backend = FakeBackend::with_delay(Duration::from_millis(50));
        backend.push_guidance(Ok(testing::guidance(0.95, true, "")));
        let r = rig(backend, quick());
        let mut notices = r.session.bus().subscribe();

        let TickOutcome::Issued { request_id, task } = r.worker.tick() else {
            panic!("expected an issued request");
        };
        r.session.dispatch(GuidedFixEvent::UserPaused);
        r.session.dispatch(GuidedFixEvent::UserResumed);
        task.await.unwrap();

        let snap = r.session.snapshot();
        assert_eq!(snap.state.kind(), StateKind::StepActive);
        assert_ne!(snap.state.active_request(), Some(request_id));
        assert!(snap.context.current_guidance.is_none());

        loop {
            if let SessionNotice::StaleResponseDiscarded { received, .. } = notices.recv().await.unwrap() {
                assert_eq!(received, request_id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_recoverable() {
        let backend = FakeBackend::new();
        for _ in 0..3 {
            backend.push_guidance(Err(GuidedFixError::Backend("503".into())));
        }
        let r = rig(backend, quick());
        run(&r.worker).await;
        run(&r.worker).await;
        assert_eq!(r.session.state().kind(), StateKind::StepActive);
        run(&r.worker).await;
        assert!(matches!(
            r.session.state(),
            GuidedFixState::Error { recoverable: true, .. }
        ));
    }

    fn failing_worker(r: &Rig, fail: fn() -> GuidedFixError) -> Arc<FrameWorker> {
        FrameWorker::new(
            Arc::new(FailingCamera(fail)),
            r.session.clone(),
            r.speech.clone(),
            r.backend.clone(),
            &quick(),
        )
    }

    fn undecodable_frame() -> GuidedFixError {
        GuidedFixError::Image(image::ImageError::Unsupported(
            image::error::UnsupportedError::from(image::error::ImageFormatHint::Unknown),
        ))
    }

    fn malformed_reply() -> GuidedFixError {
        GuidedFixError::Json(serde_json::from_str::<serde_json::Value>("{1}").unwrap_err())
    }

    #[tokio::test]
    async fn test_camera_not_ready_is_skipped_silently() {
        let r = rig(FakeBackend::new(), quick());
        let worker = failing_worker(&r, || GuidedFixError::CameraNotReady);
        run(&worker).await;
        assert_eq!(r.session.state().kind(), StateKind::StepActive);
        assert!(r.backend.guidance_requests.lock().unwrap().is_empty());
        assert!(!r.session.is_analyzing());
    }

    #[tokio::test]
    async fn test_capture_failures_never_end_the_session() {
        let r = rig(FakeBackend::new(), quick());
        let fails: [fn() -> GuidedFixError; 2] =
            [undecodable_frame, || GuidedFixError::Camera("join: cancelled".into())];
        for fail in fails {
            let worker = failing_worker(&r, fail);
            for _ in 0..5 {
                run(&worker).await;
            }
        }
        assert_eq!(r.session.state().kind(), StateKind::StepActive);
        assert!(r.backend.guidance_requests.lock().unwrap().is_empty());
        assert!(!r.session.is_analyzing());

        // The budget was never touched: a healthy frame still goes through.
        r.backend.push_guidance(Ok(testing::guidance(0.9, true, "")));
        run(&r.worker).await;
        assert_eq!(r.session.state().kind(), StateKind::StepCompletionSuggested);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried_then_recoverable() {
        let backend = FakeBackend::new();
        for _ in 0..3 {
            backend.push_guidance(Err(malformed_reply()));
        }
        let r = rig(backend, quick());
        run(&r.worker).await;
        assert_eq!(r.session.state().kind(), StateKind::StepActive);
        run(&r.worker).await;
        run(&r.worker).await;
        assert!(matches!(
            r.session.state(),
            GuidedFixState::Error { recoverable: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_configuration_failure_is_terminal() {
        let backend = FakeBackend::new();
        backend.push_guidance(Err(GuidedFixError::Config("no api base".into())));
        let r = rig(backend, quick());
        run(&r.worker).await;
        let state = r.session.state();
        assert!(matches!(state, GuidedFixState::Error { recoverable: false, .. }));
        assert!(state.is_terminal());
    }

    #[tokio::test]
    async fn test_slot_is_held_until_the_outcome_is_applied() {
        let r = rig(FakeBackend::new(), quick());
        let request_id = r.session.state().active_request().unwrap();
        assert!(r.session.begin_analysis(request_id));
        let issued = IssuedRequest { request_id, step: 0, kind: StateKind::StepActive };

        r.worker.settle(issued, Ok(testing::guidance(0.5, false, "Keep going")));
        assert_eq!(r.session.state().kind(), StateKind::StepActive);
        assert!(r.session.is_analyzing());
        assert!(matches!(r.worker.tick(), TickOutcome::Skipped(SkipReason::Busy)));

        r.session.finish_analysis(request_id);
        run(&r.worker).await;
        assert_eq!(r.backend.guidance_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_streak_forces_manual_pause() {
        let backend = FakeBackend::new();
        for _ in 0..4 {
            backend.push_guidance(Ok(testing::guidance(0.1, false, "Move closer")));
        }
        let r = rig(backend, quick());
        for _ in 0..3 {
            run(&r.worker).await;
        }
        assert_eq!(r.session.snapshot().context.low_confidence_count, 3);
        run(&r.worker).await;
        assert!(matches!(
            r.session.state(),
            GuidedFixState::Paused { reason: PauseReason::Manual { .. } }
        ));
        assert_eq!(r.session.snapshot().context.low_confidence_count, 0);
    }

    #[tokio::test]
    async fn test_stop_aborts_in_flight_and_is_idempotent() {
        let backend = Arc::new(FakeBackend::with_delay(Duration::from_secs(5)));
        let session = testing::active_session(testing::plan(2));
        let mut scheduler = FrameScheduler::new(quick());
        scheduler.start(
            Arc::new(FakeCamera::new()),
            session.clone(),
            Arc::new(SpeechFlag::new()),
            backend.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.is_analyzing());

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(!session.is_analyzing());
        assert_eq!(session.state().kind(), StateKind::StepActive);
    }

    struct FailingCamera(fn() -> GuidedFixError);

    #[async_trait::async_trait]
    impl Camera for FailingCamera {
        fn is_ready(&self) -> bool {
            true
        }
        async fn request_permission(&self) -> GuidedFixResult<bool> {
            Ok(true)
        }
        async fn take_picture(&self, _quality: f32) -> GuidedFixResult<CapturedFrame> {
            Err((self.0)())
        }
        async fn release(&self) {}
    }
}
