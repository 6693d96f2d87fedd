use async_trait::async_trait;

use crate::backend::types::{
    GuidanceRequest, GuidanceResponse, PlanRequest, QuestionRequest, RepairStep,
    SubstituteOutcome, SubstituteRequest,
};
use crate::errors::GuidedFixResult;

/// The remote collaborators a guided-fix session talks to.
/// Every call is an opaque request/response; failures are transport errors.
#[async_trait]
pub trait GuidanceBackend: Send + Sync {
    /// Analyze one camera frame against the current step's expectations.
    async fn analyze_frame(&self, request: GuidanceRequest) -> GuidedFixResult<GuidanceResponse>;

    /// Produce an ordered step plan, honoring banned items and confirmed substitutes.
    async fn generate_plan(&self, request: PlanRequest) -> GuidedFixResult<Vec<RepairStep>>;

    async fn find_substitute(&self, request: SubstituteRequest) -> GuidedFixResult<SubstituteOutcome>;

    async fn answer_question(&self, request: QuestionRequest) -> GuidedFixResult<String>;
}
