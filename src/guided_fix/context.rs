use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::types::{BoundingBox, GuidanceResponse, IdentityStatus, RepairStep};
use crate::config::SessionConfig;
use crate::guided_fix::state::RequestId;

/// What is being repaired, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairProblem {
    pub category: String,
    pub diagnosis_summary: String,
    pub likely_cause: Option<String>,
    pub problem_description: Option<String>,
}

impl From<&SessionConfig> for RepairProblem {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            category: cfg.category.clone(),
            diagnosis_summary: cfg.diagnosis_summary.clone(),
            likely_cause: cfg.likely_cause.clone(),
            problem_description: cfg.problem_description.clone(),
        }
    }
}

impl RepairProblem {
    pub fn description(&self) -> &str {
        self.problem_description
            .as_deref()
            .unwrap_or(&self.diagnosis_summary)
    }
}

/// Transient analysis bookkeeping. Written only by the frame scheduler.
#[derive(Debug, Clone, Default)]
pub struct AnalysisSlot {
    pub is_analyzing: bool,
    pub request_id: Option<RequestId>,
    pub abort: Option<Arc<tokio::task::AbortHandle>>,
}

/// Session-scoped data. The reducer owns every field except `analysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidedFixContext {
    pub problem: RepairProblem,
    pub repair_steps: Vec<RepairStep>,
    pub plan_revision: u32,
    pub current_step_index: usize,
    pub expected_item: Option<String>,
    pub detected_item: Option<String>,
    pub identity_confirmed: bool,
    pub identity_mismatch_count: u32,
    pub camera_permission_granted: bool,
    pub current_guidance: Option<GuidanceResponse>,
    pub current_highlights: Vec<BoundingBox>,
    pub permanently_unavailable_items: BTreeSet<String>,
    pub confirmed_substitutes: BTreeMap<String, String>,
    /// Last minted request id; never reset, not even by a full session reset.
    pub request_counter: u64,
    pub low_confidence_count: u32,
    pub last_answer: Option<String>,
    #[serde(skip)]
    pub analysis: AnalysisSlot,
}

impl GuidedFixContext {
    pub fn new(problem: RepairProblem, expected_item: Option<String>) -> Self {
        Self {
            problem,
            repair_steps: Vec::new(),
            plan_revision: 0,
            current_step_index: 0,
            expected_item: expected_item.filter(|s| !s.trim().is_empty()),
            detected_item: None,
            identity_confirmed: false,
            identity_mismatch_count: 0,
            camera_permission_granted: false,
            current_guidance: None,
            current_highlights: Vec::new(),
            permanently_unavailable_items: BTreeSet::new(),
            confirmed_substitutes: BTreeMap::new(),
            request_counter: 0,
            low_confidence_count: 0,
            last_answer: None,
            analysis: AnalysisSlot::default(),
        }
    }

    /// Fresh context for a full reset. Keeps what identifies the session and
    /// the request counter so pre-reset responses can never match again.
    pub fn reset(&self) -> Self {
        let mut fresh = Self::new(self.problem.clone(), self.expected_item.clone());
        fresh.request_counter = self.request_counter;
        fresh.camera_permission_granted = self.camera_permission_granted;
        fresh.analysis = self.analysis.clone();
        fresh
    }

    pub fn mint_request_id(&mut self) -> RequestId {
        self.request_counter += 1;
        RequestId(self.request_counter)
    }

    pub fn current_step(&self) -> Option<&RepairStep> {
        self.repair_steps.get(self.current_step_index)
    }

    pub fn total_steps(&self) -> usize {
        self.repair_steps.len()
    }

    /// Items the backend must never suggest again.
    pub fn banned_items(&self) -> Vec<String> {
        self.permanently_unavailable_items.iter().cloned().collect()
    }

    /// True if the active plan still needs an item the user said they lack.
    pub fn plan_references_banned(&self) -> bool {
        self.repair_steps.iter().any(|step| {
            self.permanently_unavailable_items
                .iter()
                .any(|item| step.references(item))
        })
    }

    pub fn needs_identity_check(&self) -> bool {
        self.expected_item.is_some() && !self.identity_confirmed
    }

    pub fn identity_status(&self) -> IdentityStatus {
        if self.identity_confirmed || self.expected_item.is_none() {
            IdentityStatus::Confirmed
        } else if self.identity_mismatch_count > 0 {
            IdentityStatus::Mismatch
        } else {
            IdentityStatus::Unverified
        }
    }

    /// Constraints a voice answer has to respect.
    pub fn user_constraints(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .permanently_unavailable_items
            .iter()
            .map(|item| format!("does not have {item}"))
            .collect();
        out.extend(
            self.confirmed_substitutes
                .iter()
                .map(|(orig, sub)| format!("using {sub} instead of {orig}")),
        );
        out
    }
}
