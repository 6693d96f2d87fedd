//! Maps one guidance response onto the event(s) the reducer should apply.

use crate::backend::types::GuidanceResponse;
use crate::config::PolicyConfig;
use crate::guided_fix::context::GuidedFixContext;
use crate::guided_fix::state::{GuidedFixEvent, GuidedFixState, RequestId};

/// The derived dispatch for one accepted response. Applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// Identity check: the detected object decides, nothing else is applied.
    Identity(GuidedFixEvent),
    /// Guidance refresh, optionally followed by a verdict event.
    Frame {
        analyzed: GuidedFixEvent,
        verdict: Option<GuidedFixEvent>,
    },
}

impl Interpretation {
    pub fn into_events(self) -> Vec<GuidedFixEvent> {
        match self {
            Interpretation::Identity(event) => vec![event],
            Interpretation::Frame { analyzed, verdict } => {
                let mut events = vec![analyzed];
                events.extend(verdict);
                events
            }
        }
    }
}

/// Interpreter output plus the side-channel safety notice.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpreted {
    pub interpretation: Interpretation,
    pub safety_warning: Option<String>,
}

pub fn interpret(
    response: &GuidanceResponse,
    state: &GuidedFixState,
    ctx: &GuidedFixContext,
    request_id: RequestId,
    policy: &PolicyConfig,
) -> Interpreted {
    let safety_warning = response.safety_warning.clone();

    if let (GuidedFixState::VerifyingIdentity { .. }, Some(item)) =
        (state, response.detected_object.as_ref())
    {
        return Interpreted {
            interpretation: Interpretation::Identity(GuidedFixEvent::IdentityDetected {
                item: item.clone(),
                expected: ctx.expected_item.clone(),
                request_id,
            }),
            safety_warning,
        };
    }

    let analyzed = GuidedFixEvent::FrameAnalyzed { guidance: response.clone(), request_id };

    let verdict = if response.confidence < policy.low_confidence {
        Some(GuidedFixEvent::LowConfidenceFrame { request_id })
    } else if response.step_complete && response.confidence >= policy.completion_confidence {
        Some(GuidedFixEvent::StepCompletionDetected {
            evidence: response.completion_evidence.clone(),
            confidence: response.confidence,
            request_id,
        })
    } else if !response.instruction.trim().is_empty() {
        Some(GuidedFixEvent::PauseForTask {
            instruction: response.instruction.trim().to_string(),
            request_id,
        })
    } else {
        None
    };

    Interpreted {
        interpretation: Interpretation::Frame { analyzed, verdict },
        safety_warning,
    }
}
