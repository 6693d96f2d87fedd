//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::provider::GuidanceBackend;
use crate::backend::types::{
    GuidanceRequest, GuidanceResponse, PlanRequest, QuestionRequest, RepairStep,
    SubstituteOutcome, SubstituteRequest,
};
use crate::capture::traits::{Camera, CapturedFrame};
use crate::config::PolicyConfig;
use crate::errors::{GuidedFixError, GuidedFixResult};
use crate::guided_fix::context::RepairProblem;
use crate::guided_fix::session::SessionHandle;
use crate::guided_fix::state::GuidedFixEvent;

pub fn problem() -> RepairProblem {
    RepairProblem {
        category: "plumbing".into(),
        diagnosis_summary: "Leaking shutoff valve".into(),
        likely_cause: Some("Worn washer".into()),
        problem_description: None,
    }
}

pub fn step(n: u32, instruction: &str, tools: &[&str]) -> RepairStep {
    RepairStep {
        step_number: n,
        instruction: instruction.into(),
        safety_note: None,
        looking_for: "valve".into(),
        completion_criteria: Some("valve is closed".into()),
        visual_anchors: ["valve".to_string()].into_iter().collect(),
        tools_needed: tools.iter().map(|t| t.to_string()).collect(),
        materials_needed: Vec::new(),
    }
}

pub fn plan(len: u32) -> Vec<RepairStep> {
    (1..=len).map(|n| step(n, &format!("Step {n} instruction"), &[])).collect()
}

pub fn guidance(confidence: f32, step_complete: bool, instruction: &str) -> GuidanceResponse {
    GuidanceResponse {
        instruction: instruction.into(),
        detected_object: None,
        confidence,
        step_complete,
        suggest_completion: None,
        completion_evidence: Some("looks done".into()),
        safety_warning: None,
        highlights: Vec::new(),
    }
}

/// A session that already has camera permission and `steps` loaded, sitting
/// on the first step.
pub fn active_session(steps: Vec<RepairStep>) -> SessionHandle {
    let session = SessionHandle::new(problem(), None, PolicyConfig::default(), None);
    session.dispatch(GuidedFixEvent::PermissionsGranted);
    if let Some(request_id) = session.state().active_request() {
        session.dispatch(GuidedFixEvent::PlanReceived { steps, request_id });
    }
    session
}

pub struct FakeCamera {
    ready: AtomicBool,
    grant: bool,
    pub captures: AtomicUsize,
    pub released: AtomicBool,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            grant: true,
            captures: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn denying() -> Self {
        Self { grant: false, ready: AtomicBool::new(false), ..Self::new() }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl Camera for FakeCamera {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn request_permission(&self) -> GuidedFixResult<bool> {
        self.ready.store(self.grant, Ordering::SeqCst);
        Ok(self.grant)
    }

    async fn take_picture(&self, _quality: f32) -> GuidedFixResult<CapturedFrame> {
        if !self.is_ready() {
            return Err(GuidedFixError::CameraNotReady);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(CapturedFrame {
            base64: "ZmFrZQ==".into(),
            width: 640,
            height: 480,
            captured_at: chrono::Utc::now(),
        })
    }

    async fn release(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Backend with scripted replies. An empty script answers with a neutral
/// default; `delay` holds every call so tests can race the session.
#[derive(Default)]
pub struct FakeBackend {
    pub delay: Option<Duration>,
    pub guidance: Mutex<VecDeque<GuidedFixResult<GuidanceResponse>>>,
    pub plans: Mutex<VecDeque<GuidedFixResult<Vec<RepairStep>>>>,
    pub substitutes: Mutex<VecDeque<GuidedFixResult<SubstituteOutcome>>>,
    pub answers: Mutex<VecDeque<GuidedFixResult<String>>>,
    pub guidance_requests: Mutex<Vec<GuidanceRequest>>,
    pub plan_requests: Mutex<Vec<PlanRequest>>,
    pub substitute_requests: Mutex<Vec<SubstituteRequest>>,
    pub question_requests: Mutex<Vec<QuestionRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub fn push_guidance(&self, reply: GuidedFixResult<GuidanceResponse>) {
        self.guidance.lock().unwrap().push_back(reply);
    }

    pub fn push_plan(&self, reply: GuidedFixResult<Vec<RepairStep>>) {
        self.plans.lock().unwrap().push_back(reply);
    }

    pub fn push_substitute(&self, reply: GuidedFixResult<SubstituteOutcome>) {
        self.substitutes.lock().unwrap().push_back(reply);
    }

    pub fn push_answer(&self, reply: GuidedFixResult<String>) {
        self.answers.lock().unwrap().push_back(reply);
    }

    async fn pause(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl GuidanceBackend for FakeBackend {
    async fn analyze_frame(&self, request: GuidanceRequest) -> GuidedFixResult<GuidanceResponse> {
        self.guidance_requests.lock().unwrap().push(request);
        self.pause().await;
        let next = self.guidance.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(guidance(0.5, false, "")))
    }

    async fn generate_plan(&self, request: PlanRequest) -> GuidedFixResult<Vec<RepairStep>> {
        self.plan_requests.lock().unwrap().push(request);
        self.pause().await;
        let next = self.plans.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(plan(3)))
    }

    async fn find_substitute(&self, request: SubstituteRequest) -> GuidedFixResult<SubstituteOutcome> {
        self.substitute_requests.lock().unwrap().push(request);
        self.pause().await;
        let next = self.substitutes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(SubstituteOutcome::NotFound {
                reason: "nothing suitable in view".into(),
                instruction: "Look in a drawer".into(),
                other_options: Vec::new(),
            })
        })
    }

    async fn answer_question(&self, request: QuestionRequest) -> GuidedFixResult<String> {
        self.question_requests.lock().unwrap().push(request);
        self.pause().await;
        let next = self.answers.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok("Keep going.".into()))
    }
}
