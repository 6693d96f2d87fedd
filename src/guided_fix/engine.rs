use std::sync::Arc;

use tokio::task::JoinSet;

use crate::backend::provider::GuidanceBackend;
use crate::capture::scheduler::FrameScheduler;
use crate::capture::traits::{Camera, SpeechStatus};
use crate::config::SchedulerConfig;
use crate::guided_fix::event_bus::SessionNotice;
use crate::guided_fix::jobs;
use crate::guided_fix::session::SessionHandle;
use crate::guided_fix::state::{GuidedFixEvent, GuidedFixState, RequestId, StateKind};

/// Drives one session: runs the frame scheduler and starts the one-shot
/// backend job each awaiting state needs, until the session ends.
pub struct GuidedFixEngine {
    session: SessionHandle,
    camera: Arc<dyn Camera>,
    speech: Arc<dyn SpeechStatus>,
    backend: Arc<dyn GuidanceBackend>,
    scheduler: FrameScheduler,
    frame_quality: f32,
    jobs: JoinSet<()>,
    /// Request id of the last job started; each awaiting entry gets one job.
    last_job: Option<RequestId>,
}

impl GuidedFixEngine {
    pub fn new(
        session: SessionHandle,
        camera: Arc<dyn Camera>,
        speech: Arc<dyn SpeechStatus>,
        backend: Arc<dyn GuidanceBackend>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            session,
            camera,
            speech,
            backend,
            frame_quality: scheduler_config.frame_quality.clamp(0.0, 1.0),
            scheduler: FrameScheduler::new(scheduler_config),
            jobs: JoinSet::new(),
            last_job: None,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Run until the session reaches a terminal state. Returns that state.
    pub async fn run_loop(&mut self) -> GuidedFixState {
        let mut rx = self.session.subscribe();
        self.scheduler.start(
            Arc::clone(&self.camera),
            self.session.clone(),
            Arc::clone(&self.speech),
            Arc::clone(&self.backend),
        );

        let final_state = loop {
            let state = rx.borrow_and_update().state.clone();
            if state.is_terminal() {
                tracing::info!(state = ?state.kind(), "session reached a terminal state");
                break state;
            }
            self.start_job_for(&state);

            // Reap finished jobs so the set does not grow.
            while let Some(done) = self.jobs.try_join_next() {
                if let Err(e) = done {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "session job panicked");
                    }
                }
            }

            if rx.changed().await.is_err() {
                break self.session.state();
            }
        };

        self.shutdown().await;
        final_state
    }

    fn start_job_for(&mut self, state: &GuidedFixState) {
        let kind = state.kind();
        let Some(request_id) = state.active_request() else {
            return;
        };
        if self.last_job == Some(request_id) {
            return;
        }

        let session = self.session.clone();
        let backend = Arc::clone(&self.backend);
        let camera = Arc::clone(&self.camera);
        let quality = self.frame_quality;

        match state {
            GuidedFixState::RequestingPermissions { .. } => self.spawn_permission_request(),
            GuidedFixState::LoadingPlan { .. } => {
                self.jobs.spawn(async move {
                    jobs::load_plan(&session, backend.as_ref(), request_id).await
                });
            }
            GuidedFixState::RegeneratingPlan { .. } => {
                self.jobs.spawn(async move {
                    jobs::regenerate_plan(&session, backend.as_ref(), request_id).await
                });
            }
            GuidedFixState::SearchingSubstitute { .. } => {
                self.jobs.spawn(async move {
                    jobs::search_substitute(&session, backend.as_ref(), camera.as_ref(), quality, request_id)
                        .await
                });
            }
            GuidedFixState::ProcessingQuestion { .. } => {
                self.jobs.spawn(async move {
                    jobs::answer_question(&session, backend.as_ref(), camera.as_ref(), quality, request_id)
                        .await
                });
            }
            // Frame analysis belongs to the scheduler.
            _ => return,
        }
        tracing::debug!(%request_id, ?kind, "session job started");
        self.last_job = Some(request_id);
    }

    fn spawn_permission_request(&mut self) {
        let session = self.session.clone();
        let camera = Arc::clone(&self.camera);
        self.jobs.spawn(async move {
            let event = match camera.request_permission().await {
                Ok(true) => GuidedFixEvent::PermissionsGranted,
                Ok(false) => GuidedFixEvent::PermissionsDenied,
                Err(e) => {
                    tracing::error!(error = %e, "camera permission request failed");
                    GuidedFixEvent::PermissionsDenied
                }
            };
            session.dispatch(event);
        });
    }

    /// Stop capturing, cancel outstanding work and release the camera.
    pub async fn shutdown(&mut self) {
        self.scheduler.stop();
        self.jobs.abort_all();
        while self.jobs.join_next().await.is_some() {}
        self.camera.release().await;

        let final_state = self.session.state().kind();
        tracing::info!(?final_state, "guided-fix session ended");
        self.session
            .bus()
            .publish(SessionNotice::SessionEnded { final_state });
    }
}
