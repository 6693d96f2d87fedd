//! One-shot backend calls made on entry to a state that awaits a result.
//!
//! Each job reads the live session, calls the backend once, and dispatches a
//! single event tagged with the request id it was started for. The reducer
//! drops the event if the session has moved on.

use crate::backend::provider::GuidanceBackend;
use crate::backend::types::{PlanRequest, QuestionRequest, SubstituteOutcome, SubstituteRequest};
use crate::capture::traits::Camera;
use crate::guided_fix::context::GuidedFixContext;
use crate::guided_fix::session::SessionHandle;
use crate::guided_fix::state::{GuidedFixEvent, GuidedFixState, RequestId};

fn plan_request(ctx: &GuidedFixContext) -> PlanRequest {
    let banned = ctx.banned_items();
    PlanRequest {
        category: ctx.problem.category.clone(),
        diagnosis_summary: ctx.problem.diagnosis_summary.clone(),
        likely_cause: ctx.problem.likely_cause.clone(),
        banned_items: (!banned.is_empty()).then_some(banned),
        confirmed_substitutes: (!ctx.confirmed_substitutes.is_empty())
            .then(|| ctx.confirmed_substitutes.clone()),
    }
}

pub async fn load_plan(session: &SessionHandle, backend: &dyn GuidanceBackend, request_id: RequestId) {
    let snap = session.snapshot();
    if snap.state.active_request() != Some(request_id) {
        return;
    }
    tracing::info!(%request_id, category = %snap.context.problem.category, "fetching repair plan");

    let event = match backend.generate_plan(plan_request(&snap.context)).await {
        Ok(steps) => GuidedFixEvent::PlanReceived { steps, request_id },
        Err(e) => {
            tracing::error!(error = %e, "plan fetch failed");
            GuidedFixEvent::PlanFetchFailed {
                message: format!("Couldn't load the repair plan: {e}"),
                request_id,
            }
        }
    };
    session.dispatch(event);
}

pub async fn regenerate_plan(
    session: &SessionHandle,
    backend: &dyn GuidanceBackend,
    request_id: RequestId,
) {
    let snap = session.snapshot();
    if snap.state.active_request() != Some(request_id) {
        return;
    }
    let request = plan_request(&snap.context);
    tracing::info!(
        %request_id,
        banned = ?request.banned_items,
        substitutes = ?request.confirmed_substitutes,
        "regenerating plan"
    );

    let event = match backend.generate_plan(request).await {
        Ok(steps) => GuidedFixEvent::PlanRegenerated { steps, request_id },
        Err(e) => {
            tracing::error!(error = %e, "plan regeneration failed");
            GuidedFixEvent::PlanRegenerationFailed {
                message: format!("Couldn't update the plan: {e}"),
                request_id,
            }
        }
    };
    session.dispatch(event);
}

/// Ask the backend for something in view that can stand in for the missing item.
pub async fn search_substitute(
    session: &SessionHandle,
    backend: &dyn GuidanceBackend,
    camera: &dyn Camera,
    quality: f32,
    request_id: RequestId,
) {
    let snap = session.snapshot();
    let item = match &snap.state {
        GuidedFixState::SearchingSubstitute { item, request_id: active } if *active == request_id => {
            item.clone()
        }
        _ => return,
    };

    let frame = match camera.take_picture(quality).await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "no frame for substitute search");
            session.dispatch(GuidedFixEvent::SubstituteNotFound {
                item,
                reason: "I couldn't get a picture of your surroundings.".into(),
                instruction: "Point the camera at what you have on hand and try again.".into(),
                request_id,
            });
            return;
        }
    };

    // Re-read after the capture; only the live session decides what is banned.
    let snap = session.snapshot();
    let banned = snap.context.banned_items();
    let request = SubstituteRequest {
        image_base64: frame.base64,
        missing_item: item.clone(),
        category: snap.context.problem.category.clone(),
        step_instruction: snap
            .context
            .current_step()
            .map(|s| s.instruction.clone())
            .unwrap_or_default(),
        banned_items: (!banned.is_empty()).then_some(banned),
    };
    tracing::info!(%request_id, item = %item, "searching for a substitute");

    let event = match backend.find_substitute(request).await {
        Ok(SubstituteOutcome::Found { substitute, confidence, reason, .. }) => {
            GuidedFixEvent::SubstituteFound { item, substitute, confidence, reason, request_id }
        }
        Ok(SubstituteOutcome::NotFound { reason, instruction, .. }) => {
            GuidedFixEvent::SubstituteNotFound { item, reason, instruction, request_id }
        }
        Err(e) => {
            tracing::error!(error = %e, "substitute search failed");
            GuidedFixEvent::SubstituteNotFound {
                item,
                reason: "The substitute search didn't go through.".into(),
                instruction: String::new(),
                request_id,
            }
        }
    };
    session.dispatch(event);
}

pub async fn answer_question(
    session: &SessionHandle,
    backend: &dyn GuidanceBackend,
    camera: &dyn Camera,
    quality: f32,
    request_id: RequestId,
) {
    let snap = session.snapshot();
    let question = match &snap.state {
        GuidedFixState::ProcessingQuestion { question, request_id: active, .. }
            if *active == request_id =>
        {
            question.clone()
        }
        _ => return,
    };

    // A picture helps but is not required.
    let image_base64 = if camera.is_ready() {
        camera.take_picture(quality).await.ok().map(|f| f.base64)
    } else {
        None
    };

    let ctx = &snap.context;
    let constraints = ctx.user_constraints();
    let request = QuestionRequest {
        question,
        category: ctx.problem.category.clone(),
        diagnosis_summary: ctx.problem.diagnosis_summary.clone(),
        current_step_instruction: ctx
            .current_step()
            .map(|s| s.instruction.clone())
            .unwrap_or_default(),
        identity_status: ctx.identity_status(),
        image_base64,
        conversation_context: ctx.last_answer.as_ref().map(|a| format!("Previous answer: {a}")),
        user_constraints: (!constraints.is_empty()).then_some(constraints),
    };

    let event = match backend.answer_question(request).await {
        Ok(answer) if !answer.trim().is_empty() => {
            GuidedFixEvent::AnswerReceived { answer: answer.trim().to_string(), request_id }
        }
        Ok(_) => GuidedFixEvent::AnswerFailed { message: "empty answer".into(), request_id },
        Err(e) => GuidedFixEvent::AnswerFailed { message: e.to_string(), request_id },
    };
    session.dispatch(event);
}
