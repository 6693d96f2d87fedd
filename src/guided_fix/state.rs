use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::types::{GuidanceResponse, RepairStep};

/// Monotonic id minted each time the session enters a state that awaits an
/// asynchronous result. Responses carrying any other id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

/// Lifecycle states of a guided-fix session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuidedFixState {
    LoadingPlan { request_id: RequestId },
    RequestingPermissions { request_id: RequestId },
    VerifyingIdentity { request_id: RequestId },
    StepActive { step: usize, request_id: RequestId },
    StepCompletionSuggested { step: usize, evidence: Option<String>, confidence: f32 },
    Paused { reason: PauseReason },
    ListeningForQuestion { resume: ResumeTarget },
    ProcessingQuestion { question: String, resume: ResumeTarget, request_id: RequestId },
    ShowingAnswer { answer: String, resume: ResumeTarget },
    SearchingSubstitute { item: String, request_id: RequestId },
    SubstituteFound { item: String, substitute: String, confidence: f32, reason: String },
    RegeneratingPlan { request_id: RequestId },
    ShowingNewPlan { revision: u32 },
    SessionComplete,
    Error { message: String, recoverable: bool },
}

/// Discriminant of [`GuidedFixState`], used to detect that the session moved
/// on while a request was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    LoadingPlan,
    RequestingPermissions,
    VerifyingIdentity,
    StepActive,
    StepCompletionSuggested,
    Paused,
    ListeningForQuestion,
    ProcessingQuestion,
    ShowingAnswer,
    SearchingSubstitute,
    SubstituteFound,
    RegeneratingPlan,
    ShowingNewPlan,
    SessionComplete,
    Error,
}

impl GuidedFixState {
    pub fn kind(&self) -> StateKind {
        match self {
            GuidedFixState::LoadingPlan { .. } => StateKind::LoadingPlan,
            GuidedFixState::RequestingPermissions { .. } => StateKind::RequestingPermissions,
            GuidedFixState::VerifyingIdentity { .. } => StateKind::VerifyingIdentity,
            GuidedFixState::StepActive { .. } => StateKind::StepActive,
            GuidedFixState::StepCompletionSuggested { .. } => StateKind::StepCompletionSuggested,
            GuidedFixState::Paused { .. } => StateKind::Paused,
            GuidedFixState::ListeningForQuestion { .. } => StateKind::ListeningForQuestion,
            GuidedFixState::ProcessingQuestion { .. } => StateKind::ProcessingQuestion,
            GuidedFixState::ShowingAnswer { .. } => StateKind::ShowingAnswer,
            GuidedFixState::SearchingSubstitute { .. } => StateKind::SearchingSubstitute,
            GuidedFixState::SubstituteFound { .. } => StateKind::SubstituteFound,
            GuidedFixState::RegeneratingPlan { .. } => StateKind::RegeneratingPlan,
            GuidedFixState::ShowingNewPlan { .. } => StateKind::ShowingNewPlan,
            GuidedFixState::SessionComplete => StateKind::SessionComplete,
            GuidedFixState::Error { .. } => StateKind::Error,
        }
    }

    /// The request id this state accepts results for, if it awaits one.
    pub fn active_request(&self) -> Option<RequestId> {
        match self {
            GuidedFixState::LoadingPlan { request_id }
            | GuidedFixState::RequestingPermissions { request_id }
            | GuidedFixState::VerifyingIdentity { request_id }
            | GuidedFixState::StepActive { request_id, .. }
            | GuidedFixState::ProcessingQuestion { request_id, .. }
            | GuidedFixState::SearchingSubstitute { request_id, .. }
            | GuidedFixState::RegeneratingPlan { request_id } => Some(*request_id),
            _ => None,
        }
    }

    pub fn step(&self) -> Option<usize> {
        match self {
            GuidedFixState::StepActive { step, .. }
            | GuidedFixState::StepCompletionSuggested { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Frames are only captured while the camera view drives the session.
    pub fn is_capturable(&self) -> bool {
        matches!(
            self,
            GuidedFixState::StepActive { .. } | GuidedFixState::VerifyingIdentity { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GuidedFixState::SessionComplete | GuidedFixState::Error { recoverable: false, .. }
        )
    }
}

/// Why the session stopped to wait for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    User,
    Task { instruction: String },
    GetItem { item: String },
    Manual { message: String },
    IdentityMismatch { expected: String, detected: String },
}

impl PauseReason {
    /// An instruction that asks the user to fetch something pauses as `GetItem`.
    pub fn for_instruction(instruction: &str) -> Self {
        match requested_item(instruction) {
            Some(item) => PauseReason::GetItem { item },
            None => PauseReason::Task { instruction: instruction.trim().to_string() },
        }
    }

    /// Text the voice layer reads out when the pause begins.
    pub fn narration(&self) -> String {
        match self {
            PauseReason::User => "Paused. Say resume when you're ready.".to_string(),
            PauseReason::Task { instruction } => instruction.clone(),
            PauseReason::GetItem { item } => {
                format!("Please get the {item}. Let me know if you don't have one.")
            }
            PauseReason::Manual { message } => message.clone(),
            PauseReason::IdentityMismatch { expected, detected } => format!(
                "This looks like a {detected}, but the plan is for a {expected}. \
                 Check the part or override to continue."
            ),
        }
    }
}

fn requested_item(instruction: &str) -> Option<String> {
    static GET_ITEM: OnceLock<Option<Regex>> = OnceLock::new();
    let re = GET_ITEM
        .get_or_init(|| {
            Regex::new(
                r"(?i)^\s*(?:please\s+)?(?:go\s+)?(?:get|grab|fetch|bring)\s+(?:me\s+)?(?:(?:a|an|the|some|your)\s+)?(?P<item>[^.,;!]+?)\s*(?:(?:\s(?:and|then|to|from|for|so)\s|[.,;!]).*)?$",
            )
            .ok()
        })
        .as_ref()?;
    let caps = re.captures(instruction)?;
    let item = caps.name("item")?.as_str().trim();
    if item.is_empty() {
        None
    } else {
        Some(item.to_string())
    }
}

/// Where a voice interaction returns to once it is finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum ResumeTarget {
    Step,
    Identity,
    Paused { reason: PauseReason },
}

/// Everything that can change a session. AI-derived events carry the request
/// id of the state they were computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuidedFixEvent {
    // ── Plan fetch and permissions ────────────────────────────────────────
    PlanReceived { steps: Vec<RepairStep>, request_id: RequestId },
    PlanFetchFailed { message: String, request_id: RequestId },
    PermissionsGranted,
    PermissionsDenied,

    // ── Frame analysis ────────────────────────────────────────────────────
    IdentityDetected { item: String, expected: Option<String>, request_id: RequestId },
    FrameAnalyzed { guidance: GuidanceResponse, request_id: RequestId },
    LowConfidenceFrame { request_id: RequestId },
    StepCompletionDetected { evidence: Option<String>, confidence: f32, request_id: RequestId },
    PauseForTask { instruction: String, request_id: RequestId },
    AnalysisFailed { message: String, recoverable: bool, request_id: RequestId },

    // ── User interaction ──────────────────────────────────────────────────
    UserPaused,
    UserResumed,
    UserConfirmedStep,
    UserRejectedCompletion,
    UserMarkedComplete,
    UserOverride,
    UserItemUnavailable { item: String },
    UserConfirmedSubstitute,
    UserRejectedSubstitute,
    UserAcceptedPlan,
    UserRetry,

    // ── Voice questions ───────────────────────────────────────────────────
    UserStartedQuestion,
    QuestionCaptured { question: String },
    QuestionCancelled,
    AnswerReceived { answer: String, request_id: RequestId },
    AnswerFailed { message: String, request_id: RequestId },
    UserDismissedAnswer,

    // ── Substitutes and regeneration ──────────────────────────────────────
    SubstituteFound {
        item: String,
        substitute: String,
        confidence: f32,
        reason: String,
        request_id: RequestId,
    },
    SubstituteNotFound { item: String, reason: String, instruction: String, request_id: RequestId },
    PlanRegenerated { steps: Vec<RepairStep>, request_id: RequestId },
    PlanRegenerationFailed { message: String, request_id: RequestId },

    // ── Lifecycle ─────────────────────────────────────────────────────────
    SessionStopped,
    SessionReset,
    FatalError { message: String },
}

impl GuidedFixEvent {
    /// The request id an asynchronous result was issued under.
    pub fn request_id(&self) -> Option<RequestId> {
        use GuidedFixEvent::*;
        match self {
            PlanReceived { request_id, .. }
            | PlanFetchFailed { request_id, .. }
            | IdentityDetected { request_id, .. }
            | FrameAnalyzed { request_id, .. }
            | LowConfidenceFrame { request_id }
            | StepCompletionDetected { request_id, .. }
            | PauseForTask { request_id, .. }
            | AnalysisFailed { request_id, .. }
            | AnswerReceived { request_id, .. }
            | AnswerFailed { request_id, .. }
            | SubstituteFound { request_id, .. }
            | SubstituteNotFound { request_id, .. }
            | PlanRegenerated { request_id, .. }
            | PlanRegenerationFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Short name for logs and history.
    pub fn name(&self) -> &'static str {
        use GuidedFixEvent::*;
        match self {
            PlanReceived { .. } => "PLAN_RECEIVED",
            PlanFetchFailed { .. } => "PLAN_FETCH_FAILED",
            PermissionsGranted => "PERMISSIONS_GRANTED",
            PermissionsDenied => "PERMISSIONS_DENIED",
            IdentityDetected { .. } => "IDENTITY_DETECTED",
            FrameAnalyzed { .. } => "FRAME_ANALYZED",
            LowConfidenceFrame { .. } => "LOW_CONFIDENCE_FRAME",
            StepCompletionDetected { .. } => "STEP_COMPLETION_DETECTED",
            PauseForTask { .. } => "PAUSE_FOR_TASK",
            AnalysisFailed { .. } => "ANALYSIS_FAILED",
            UserPaused => "USER_PAUSED",
            UserResumed => "USER_RESUMED",
            UserConfirmedStep => "USER_CONFIRMED_STEP",
            UserRejectedCompletion => "USER_REJECTED_COMPLETION",
            UserMarkedComplete => "USER_MARKED_COMPLETE",
            UserOverride => "USER_OVERRIDE",
            UserItemUnavailable { .. } => "USER_ITEM_UNAVAILABLE",
            UserConfirmedSubstitute => "USER_CONFIRMED_SUBSTITUTE",
            UserRejectedSubstitute => "USER_REJECTED_SUBSTITUTE",
            UserAcceptedPlan => "USER_ACCEPTED_PLAN",
            UserRetry => "USER_RETRY",
            UserStartedQuestion => "USER_STARTED_QUESTION",
            QuestionCaptured { .. } => "QUESTION_CAPTURED",
            QuestionCancelled => "QUESTION_CANCELLED",
            AnswerReceived { .. } => "ANSWER_RECEIVED",
            AnswerFailed { .. } => "ANSWER_FAILED",
            UserDismissedAnswer => "USER_DISMISSED_ANSWER",
            SubstituteFound { .. } => "SUBSTITUTE_FOUND",
            SubstituteNotFound { .. } => "SUBSTITUTE_NOT_FOUND",
            PlanRegenerated { .. } => "PLAN_REGENERATED",
            PlanRegenerationFailed { .. } => "PLAN_REGENERATION_FAILED",
            SessionStopped => "SESSION_STOPPED",
            SessionReset => "SESSION_RESET",
            FatalError { .. } => "FATAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId(7).to_string(), "req_7");
    }

    #[test]
    fn test_fetch_instructions_become_get_item() {
        assert_eq!(
            PauseReason::for_instruction("Grab a bucket and place it under the valve."),
            PauseReason::GetItem { item: "bucket".into() }
        );
        assert_eq!(
            PauseReason::for_instruction("Please get the aluminum foil"),
            PauseReason::GetItem { item: "aluminum foil".into() }
        );
    }

    #[test]
    fn test_other_instructions_become_task() {
        assert_eq!(
            PauseReason::for_instruction("  Move the camera closer to the valve "),
            PauseReason::Task { instruction: "Move the camera closer to the valve".into() }
        );
        // "get" in the middle of a sentence is not a fetch request.
        assert!(matches!(
            PauseReason::for_instruction("Turn it until you get resistance"),
            PauseReason::Task { .. }
        ));
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let state = GuidedFixState::StepActive { step: 2, request_id: RequestId(7) };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state"], "STEP_ACTIVE");
        assert_eq!(value["request_id"], 7);
    }

    #[test]
    fn test_capturable_states() {
        assert!(GuidedFixState::StepActive { step: 0, request_id: RequestId(1) }.is_capturable());
        assert!(GuidedFixState::VerifyingIdentity { request_id: RequestId(1) }.is_capturable());
        assert!(!GuidedFixState::Paused { reason: PauseReason::User }.is_capturable());
        assert!(!GuidedFixState::SessionComplete.is_capturable());
    }
}
