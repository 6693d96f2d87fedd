//! Guided-fix reducer.
//!
//! `StateMachine::reduce` is a total function over (state, event). It never
//! performs I/O and never panics; pairs without a meaningful transition come
//! back as [`Transition::Ignored`] and leave state and context untouched.

use crate::backend::types::RepairStep;
use crate::config::PolicyConfig;
use crate::guided_fix::context::GuidedFixContext;
use crate::guided_fix::state::{
    GuidedFixEvent, GuidedFixState, PauseReason, RequestId, ResumeTarget,
};

/// Result of applying one event.
#[derive(Debug, Clone)]
pub enum Transition {
    Next {
        state: GuidedFixState,
        context: GuidedFixContext,
    },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event answers a request the current state no longer waits for.
    StaleRequest {
        active: Option<RequestId>,
        received: RequestId,
    },
    /// The event has no meaning in the current state.
    NotApplicable,
}

impl Transition {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Transition::Ignored(_))
    }
}

pub struct StateMachine {
    policy: PolicyConfig,
}

impl StateMachine {
    pub fn new(policy: PolicyConfig) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn reduce(
        &self,
        state: &GuidedFixState,
        ctx: &GuidedFixContext,
        event: &GuidedFixEvent,
    ) -> Transition {
        use GuidedFixEvent as E;
        use GuidedFixState as S;

        // Lifecycle events apply everywhere.
        match event {
            E::SessionStopped => {
                return match state {
                    S::SessionComplete => Transition::Ignored(IgnoreReason::NotApplicable),
                    _ => next(S::SessionComplete, ctx.clone()),
                };
            }
            E::SessionReset => {
                let mut c = ctx.reset();
                let request_id = c.mint_request_id();
                return next(S::LoadingPlan { request_id }, c);
            }
            E::FatalError { message } => {
                return if state.is_terminal() {
                    Transition::Ignored(IgnoreReason::NotApplicable)
                } else {
                    next(
                        S::Error { message: message.clone(), recoverable: false },
                        ctx.clone(),
                    )
                };
            }
            _ => {}
        }

        if let Some(received) = event.request_id() {
            let active = state.active_request();
            if active != Some(received) {
                return Transition::Ignored(IgnoreReason::StaleRequest { active, received });
            }
        }

        let mut c = ctx.clone();
        let new_state = match (state, event) {
            // ── Plan fetch ────────────────────────────────────────────────
            (S::LoadingPlan { .. }, E::PlanReceived { steps, .. }) => {
                if steps.is_empty() {
                    Some(S::Error {
                        message: "The repair plan came back without any steps.".into(),
                        recoverable: true,
                    })
                } else {
                    c.repair_steps = steps.clone();
                    c.current_step_index = 0;
                    Some(self.after_plan_ready(&mut c))
                }
            }
            (S::LoadingPlan { .. }, E::PlanFetchFailed { message, .. }) => Some(S::Error {
                message: message.clone(),
                recoverable: true,
            }),

            // ── Permissions ───────────────────────────────────────────────
            (S::RequestingPermissions { .. }, E::PermissionsGranted) => {
                c.camera_permission_granted = true;
                Some(self.enter_first_step(&mut c))
            }
            (S::RequestingPermissions { .. }, E::PermissionsDenied) => {
                c.camera_permission_granted = false;
                Some(S::Error {
                    message: "Camera access is needed to guide this repair.".into(),
                    recoverable: true,
                })
            }
            (s, E::PermissionsGranted) if !s.is_terminal() && !c.camera_permission_granted => {
                c.camera_permission_granted = true;
                Some(s.clone())
            }
            (s, E::PermissionsDenied) if !s.is_terminal() && c.camera_permission_granted => {
                c.camera_permission_granted = false;
                Some(s.clone())
            }

            // ── Identity verification ─────────────────────────────────────
            (S::VerifyingIdentity { .. }, E::IdentityDetected { item, expected, .. }) => {
                let expected = expected
                    .clone()
                    .or_else(|| c.expected_item.clone())
                    .unwrap_or_default();
                c.detected_item = Some(item.clone());
                if expected.is_empty() || items_match(item, &expected) {
                    tracing::info!(detected = %item, "identity confirmed");
                    c.identity_confirmed = true;
                    c.identity_mismatch_count = 0;
                    c.low_confidence_count = 0;
                    Some(self.enter_step(&mut c, 0))
                } else {
                    c.identity_mismatch_count += 1;
                    tracing::info!(
                        detected = %item,
                        expected = %expected,
                        mismatches = c.identity_mismatch_count,
                        "identity mismatch"
                    );
                    if c.identity_mismatch_count >= self.policy.identity_mismatch_tolerance {
                        Some(S::Paused {
                            reason: PauseReason::IdentityMismatch {
                                expected,
                                detected: item.clone(),
                            },
                        })
                    } else {
                        Some(state.clone())
                    }
                }
            }
            (S::VerifyingIdentity { .. }, E::UserOverride) => {
                c.identity_confirmed = true;
                c.identity_mismatch_count = 0;
                Some(self.enter_step(&mut c, 0))
            }

            // ── Frame guidance (step and identity) ────────────────────────
            (S::StepActive { .. } | S::VerifyingIdentity { .. }, E::FrameAnalyzed { guidance, .. }) => {
                if c.low_confidence_count >= self.policy.low_confidence_escalation {
                    tracing::warn!(
                        count = c.low_confidence_count,
                        "low-confidence ladder exhausted, escalating to manual pause"
                    );
                    c.low_confidence_count = 0;
                    c.current_highlights = guidance.highlights.clone();
                    c.current_guidance = Some(guidance.clone());
                    Some(S::Paused {
                        reason: PauseReason::Manual { message: manual_message(&c) },
                    })
                } else {
                    if guidance.confidence >= self.policy.low_confidence {
                        c.low_confidence_count = 0;
                    }
                    c.current_highlights = guidance.highlights.clone();
                    c.current_guidance = Some(guidance.clone());
                    Some(state.clone())
                }
            }
            (S::StepActive { .. } | S::VerifyingIdentity { .. }, E::LowConfidenceFrame { .. }) => {
                c.low_confidence_count += 1;
                Some(state.clone())
            }
            (S::StepActive { step, .. }, E::StepCompletionDetected { evidence, confidence, .. }) => {
                if *confidence >= self.policy.completion_confidence {
                    c.low_confidence_count = 0;
                    Some(S::StepCompletionSuggested {
                        step: *step,
                        evidence: evidence.clone(),
                        confidence: *confidence,
                    })
                } else {
                    None
                }
            }
            (S::StepActive { .. }, E::PauseForTask { instruction, .. }) => {
                if instruction.trim().is_empty() {
                    None
                } else {
                    Some(S::Paused { reason: PauseReason::for_instruction(instruction) })
                }
            }
            (
                S::StepActive { .. } | S::VerifyingIdentity { .. },
                E::AnalysisFailed { message, recoverable, .. },
            ) => Some(S::Error {
                message: message.clone(),
                recoverable: *recoverable,
            }),
            (S::StepActive { .. } | S::VerifyingIdentity { .. }, E::UserPaused) => {
                Some(S::Paused { reason: PauseReason::User })
            }
            (S::StepActive { step, .. }, E::UserMarkedComplete) => Some(S::StepCompletionSuggested {
                step: *step,
                evidence: Some("Marked done by you".into()),
                confidence: 1.0,
            }),

            // ── Completion confirmation ───────────────────────────────────
            (S::StepCompletionSuggested { step, .. }, E::UserConfirmedStep) => {
                let following = step + 1;
                if following < c.repair_steps.len() {
                    tracing::info!(from = step, to = following, "step confirmed, advancing");
                    c.current_guidance = None;
                    c.current_highlights.clear();
                    Some(self.enter_step(&mut c, following))
                } else {
                    tracing::info!(step, "final step confirmed, session complete");
                    Some(S::SessionComplete)
                }
            }
            (S::StepCompletionSuggested { step, .. }, E::UserRejectedCompletion) => {
                Some(self.enter_step(&mut c, *step))
            }

            // ── Pauses ────────────────────────────────────────────────────
            (S::Paused { reason: PauseReason::IdentityMismatch { .. } }, E::UserResumed) => {
                c.identity_mismatch_count = 0;
                c.low_confidence_count = 0;
                let request_id = c.mint_request_id();
                Some(S::VerifyingIdentity { request_id })
            }
            (S::Paused { reason: PauseReason::IdentityMismatch { .. } }, E::UserOverride) => {
                c.identity_confirmed = true;
                c.identity_mismatch_count = 0;
                let step = c.current_step_index;
                Some(self.enter_step(&mut c, step))
            }
            (S::Paused { .. }, E::UserResumed) => Some(self.resume_active(&mut c)),

            // ── Unavailable items and substitutes ─────────────────────────
            (S::StepActive { .. }, E::UserItemUnavailable { item }) => {
                self.start_substitute_search(&mut c, item)
            }
            (S::Paused { reason }, E::UserItemUnavailable { item })
                if !matches!(reason, PauseReason::IdentityMismatch { .. }) =>
            {
                let item = match (item.trim().is_empty(), reason) {
                    (true, PauseReason::GetItem { item: wanted }) => wanted.clone(),
                    _ => item.clone(),
                };
                self.start_substitute_search(&mut c, &item)
            }
            (S::SearchingSubstitute { item, .. }, E::SubstituteFound { substitute, confidence, reason, .. }) => {
                Some(S::SubstituteFound {
                    item: item.clone(),
                    substitute: substitute.clone(),
                    confidence: *confidence,
                    reason: reason.clone(),
                })
            }
            (S::SearchingSubstitute { item, .. }, E::SubstituteNotFound { reason, instruction, .. }) => {
                let mut message = format!("I couldn't find a substitute for the {item}.");
                for part in [reason, instruction] {
                    if !part.trim().is_empty() {
                        message.push(' ');
                        message.push_str(part.trim());
                    }
                }
                Some(S::Paused { reason: PauseReason::Manual { message } })
            }
            (S::SearchingSubstitute { item, .. }, E::UserRejectedSubstitute) => Some(S::Paused {
                reason: PauseReason::GetItem { item: item.clone() },
            }),
            (S::SubstituteFound { item, substitute, .. }, E::UserConfirmedSubstitute) => {
                tracing::info!(original = %item, substitute = %substitute, "substitute confirmed");
                c.confirmed_substitutes.insert(item.clone(), substitute.clone());
                let request_id = c.mint_request_id();
                Some(S::RegeneratingPlan { request_id })
            }
            (S::SubstituteFound { item, .. }, E::UserRejectedSubstitute) => Some(S::Paused {
                reason: PauseReason::GetItem { item: item.clone() },
            }),

            // ── Plan regeneration ─────────────────────────────────────────
            (S::RegeneratingPlan { .. }, E::PlanRegenerated { steps, .. }) => {
                match validate_regenerated_plan(steps, &c) {
                    Ok(()) => {
                        c.repair_steps = steps.clone();
                        c.plan_revision += 1;
                        c.current_step_index = 0;
                        c.low_confidence_count = 0;
                        c.current_guidance = None;
                        c.current_highlights.clear();
                        tracing::info!(
                            revision = c.plan_revision,
                            steps = c.repair_steps.len(),
                            "plan regenerated"
                        );
                        Some(S::ShowingNewPlan { revision: c.plan_revision })
                    }
                    Err(message) => Some(S::Error { message, recoverable: true }),
                }
            }
            (S::RegeneratingPlan { .. }, E::PlanRegenerationFailed { message, .. }) => {
                Some(S::Error { message: message.clone(), recoverable: true })
            }
            (S::ShowingNewPlan { .. }, E::UserAcceptedPlan) => Some(self.enter_step(&mut c, 0)),

            // ── Voice questions ───────────────────────────────────────────
            (S::StepActive { .. }, E::UserStartedQuestion) => {
                Some(S::ListeningForQuestion { resume: ResumeTarget::Step })
            }
            (S::VerifyingIdentity { .. }, E::UserStartedQuestion) => {
                Some(S::ListeningForQuestion { resume: ResumeTarget::Identity })
            }
            (S::Paused { reason }, E::UserStartedQuestion) => Some(S::ListeningForQuestion {
                resume: ResumeTarget::Paused { reason: reason.clone() },
            }),
            (S::ListeningForQuestion { resume }, E::QuestionCaptured { question }) => {
                if question.trim().is_empty() {
                    Some(self.resume(&mut c, resume))
                } else {
                    let request_id = c.mint_request_id();
                    Some(S::ProcessingQuestion {
                        question: question.trim().to_string(),
                        resume: resume.clone(),
                        request_id,
                    })
                }
            }
            (
                S::ListeningForQuestion { resume } | S::ProcessingQuestion { resume, .. },
                E::QuestionCancelled,
            ) => Some(self.resume(&mut c, resume)),
            (S::ProcessingQuestion { resume, .. }, E::AnswerReceived { answer, .. }) => {
                c.last_answer = Some(answer.clone());
                Some(S::ShowingAnswer { answer: answer.clone(), resume: resume.clone() })
            }
            (S::ProcessingQuestion { resume, .. }, E::AnswerFailed { message, .. }) => {
                tracing::warn!(error = %message, "voice answer failed");
                Some(S::ShowingAnswer {
                    answer: "Sorry, I couldn't answer that right now. Please try again.".into(),
                    resume: resume.clone(),
                })
            }
            (S::ShowingAnswer { resume, .. }, E::UserDismissedAnswer) => {
                Some(self.resume(&mut c, resume))
            }

            // ── Recovery ──────────────────────────────────────────────────
            (S::Error { recoverable: true, .. }, E::UserRetry) => Some(self.retry(&mut c)),

            _ => None,
        };

        match new_state {
            Some(state) => next(state, c),
            None => Transition::Ignored(IgnoreReason::NotApplicable),
        }
    }

    /// Where a freshly loaded plan starts.
    fn after_plan_ready(&self, c: &mut GuidedFixContext) -> GuidedFixState {
        if c.camera_permission_granted {
            self.enter_first_step(c)
        } else {
            let request_id = c.mint_request_id();
            GuidedFixState::RequestingPermissions { request_id }
        }
    }

    fn enter_first_step(&self, c: &mut GuidedFixContext) -> GuidedFixState {
        if c.needs_identity_check() {
            c.identity_mismatch_count = 0;
            let request_id = c.mint_request_id();
            GuidedFixState::VerifyingIdentity { request_id }
        } else {
            self.enter_step(c, 0)
        }
    }

    /// Enter `STEP_ACTIVE(step)` under a new request id. Clamps into the plan.
    fn enter_step(&self, c: &mut GuidedFixContext, step: usize) -> GuidedFixState {
        let step = step.min(c.repair_steps.len().saturating_sub(1));
        c.current_step_index = step;
        c.low_confidence_count = 0;
        let request_id = c.mint_request_id();
        GuidedFixState::StepActive { step, request_id }
    }

    /// The capturable state the session belongs in right now.
    fn resume_active(&self, c: &mut GuidedFixContext) -> GuidedFixState {
        if c.needs_identity_check() {
            let request_id = c.mint_request_id();
            GuidedFixState::VerifyingIdentity { request_id }
        } else {
            let step = c.current_step_index;
            self.enter_step(c, step)
        }
    }

    fn resume(&self, c: &mut GuidedFixContext, target: &ResumeTarget) -> GuidedFixState {
        match target {
            ResumeTarget::Step => {
                let step = c.current_step_index;
                self.enter_step(c, step)
            }
            ResumeTarget::Identity => {
                let request_id = c.mint_request_id();
                GuidedFixState::VerifyingIdentity { request_id }
            }
            ResumeTarget::Paused { reason } => GuidedFixState::Paused { reason: reason.clone() },
        }
    }

    fn retry(&self, c: &mut GuidedFixContext) -> GuidedFixState {
        if c.repair_steps.is_empty() {
            let request_id = c.mint_request_id();
            GuidedFixState::LoadingPlan { request_id }
        } else if !c.camera_permission_granted {
            let request_id = c.mint_request_id();
            GuidedFixState::RequestingPermissions { request_id }
        } else if c.plan_references_banned() {
            let request_id = c.mint_request_id();
            GuidedFixState::RegeneratingPlan { request_id }
        } else {
            self.resume_active(c)
        }
    }

    fn start_substitute_search(
        &self,
        c: &mut GuidedFixContext,
        item: &str,
    ) -> Option<GuidedFixState> {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        c.permanently_unavailable_items.insert(item.to_string());
        tracing::info!(item, "item unavailable, searching for a substitute");
        let request_id = c.mint_request_id();
        Some(GuidedFixState::SearchingSubstitute { item: item.to_string(), request_id })
    }
}

fn next(state: GuidedFixState, context: GuidedFixContext) -> Transition {
    Transition::Next { state, context }
}

fn manual_message(c: &GuidedFixContext) -> String {
    let target = c
        .current_step()
        .map(|s| s.looking_for.trim())
        .filter(|s| !s.is_empty())
        .or(c.expected_item.as_deref())
        .unwrap_or("work area");
    format!(
        "I can't see clearly enough to guide you. Move closer to the {target} with good light, \
         hold the camera steady, and say resume when ready."
    )
}

/// A regenerated plan must have steps and must not need any banned item.
pub fn validate_regenerated_plan(
    steps: &[RepairStep],
    c: &GuidedFixContext,
) -> Result<(), String> {
    if steps.is_empty() {
        return Err("The regenerated plan has no steps.".into());
    }
    for step in steps {
        if let Some(item) = c
            .permanently_unavailable_items
            .iter()
            .find(|item| step.references(item))
        {
            return Err(format!(
                "The regenerated plan still needs {item} in step {}.",
                step.step_number
            ));
        }
    }
    Ok(())
}

/// Loose item identity: equal after normalisation, or one name contains the
/// other as a whole-word sequence ("fill valve" vs "kohler fill valve").
pub fn items_match(detected: &str, expected: &str) -> bool {
    let d = normalize_item(detected);
    let e = normalize_item(expected);
    if d.is_empty() || e.is_empty() {
        return false;
    }
    let padded = |s: &str| format!(" {s} ");
    d == e || padded(&d).contains(&padded(&e)) || padded(&e).contains(&padded(&d))
}

fn normalize_item(s: &str) -> String {
    s.to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
