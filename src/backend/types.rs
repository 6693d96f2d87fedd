use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// ── Plan model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStep {
    pub step_number: u32,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_note: Option<String>,
    #[serde(default)]
    pub looking_for: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_criteria: Option<String>,
    #[serde(default)]
    pub visual_anchors: BTreeSet<String>,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub materials_needed: Vec<String>,
}

impl RepairStep {
    /// True if the step lists `item` among its tools or materials (case-insensitive).
    pub fn references(&self, item: &str) -> bool {
        let needle = item.trim().to_lowercase();
        self.tools_needed
            .iter()
            .chain(self.materials_needed.iter())
            .any(|t| t.trim().to_lowercase() == needle)
    }
}

/// Labeled rectangle in percent (0–100) of the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Convert to pixels for a frame of `frame_w`×`frame_h`, clamped to the frame.
    pub fn to_pixels(&self, frame_w: u32, frame_h: u32) -> PixelRect {
        let pct = |v: f32| v.clamp(0.0, 100.0) / 100.0;
        let x = (pct(self.x) * frame_w as f32).round() as u32;
        let y = (pct(self.y) * frame_h as f32).round() as u32;
        let right = (pct(self.x + self.width) * frame_w as f32).round() as u32;
        let bottom = (pct(self.y + self.height) * frame_h as f32).round() as u32;
        PixelRect {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }
}

// ── Frame guidance ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceRequest {
    pub image_base64: String,
    pub category: String,
    pub problem_description: String,
    /// 1-based, as shown to the user.
    pub current_step: u32,
    pub total_steps: u32,
    pub current_step_instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_criteria: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_anchors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_items: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_substitutes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceResponse {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub detected_object: Option<String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub step_complete: bool,
    #[serde(default)]
    pub suggest_completion: Option<bool>,
    #[serde(default)]
    pub completion_evidence: Option<String>,
    #[serde(default)]
    pub safety_warning: Option<String>,
    #[serde(default)]
    pub highlights: Vec<BoundingBox>,
}

impl GuidanceResponse {
    /// Clamp confidence into [0, 1] and drop blank optional strings.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self.detected_object = non_blank(self.detected_object);
        self.completion_evidence = non_blank(self.completion_evidence);
        self.safety_warning = non_blank(self.safety_warning);
        self
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ── Plan generation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub category: String,
    pub diagnosis_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likely_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_items: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_substitutes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanResponse {
    pub steps: Vec<RepairStep>,
}

// ── Substitute search ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteRequest {
    pub image_base64: String,
    pub missing_item: String,
    pub category: String,
    pub step_instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_items: Option<Vec<String>>,
}

/// Wire shape; only some fields are meaningful depending on `found_substitute`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteResponse {
    pub found_substitute: bool,
    #[serde(default)]
    pub suggested_substitute: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub other_options: Option<Vec<String>>,
    #[serde(default)]
    pub highlight: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubstituteOutcome {
    Found {
        substitute: String,
        confidence: f32,
        reason: String,
        instruction: String,
        other_options: Vec<String>,
        highlight: Option<BoundingBox>,
    },
    NotFound {
        reason: String,
        instruction: String,
        other_options: Vec<String>,
    },
}

impl SubstituteResponse {
    /// A "found" response without a named substitute is treated as not found.
    pub fn into_outcome(self) -> SubstituteOutcome {
        let other_options = self.other_options.unwrap_or_default();
        match (self.found_substitute, non_blank(self.suggested_substitute)) {
            (true, Some(substitute)) => SubstituteOutcome::Found {
                substitute,
                confidence: self.confidence.clamp(0.0, 1.0),
                reason: self.reason,
                instruction: self.instruction,
                other_options,
                highlight: self.highlight,
            },
            _ => SubstituteOutcome::NotFound {
                reason: self.reason,
                instruction: self.instruction,
                other_options,
            },
        }
    }
}

// ── Voice questions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Confirmed,
    Unverified,
    Mismatch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub question: String,
    pub category: String,
    pub diagnosis_summary: String,
    pub current_step_instruction: String,
    pub identity_status: IdentityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_constraints: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionResponse {
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guidance_response_decodes_sparse_payload() {
        let json = r#"{"instruction":"Turn the valve","confidence":1.4,"stepComplete":false,"detectedObject":"  "}"#;
        let resp: GuidanceResponse = serde_json::from_str::<GuidanceResponse>(json).unwrap().normalized();
        assert_eq!(resp.confidence, 1.0);
        assert!(resp.detected_object.is_none());
        assert!(resp.highlights.is_empty());
    }

    #[test]
    fn test_guidance_request_omits_absent_fields() {
        let req = GuidanceRequest {
            image_base64: "abc".into(),
            category: "plumbing".into(),
            problem_description: "leak".into(),
            current_step: 1,
            total_steps: 4,
            current_step_instruction: "Close the valve".into(),
            step_context: None,
            completion_criteria: None,
            visual_anchors: None,
            expected_item: None,
            banned_items: Some(vec!["aluminum foil".into()]),
            confirmed_substitutes: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["currentStepInstruction"], "Close the valve");
        assert_eq!(value["bannedItems"][0], "aluminum foil");
        assert!(value.get("expectedItem").is_none());
    }

    #[test]
    fn test_substitute_found_without_name_is_not_found() {
        let resp: SubstituteResponse = serde_json::from_str(
            r#"{"foundSubstitute":true,"reason":"nothing usable","confidence":0.4,"instruction":"Look around"}"#,
        )
        .unwrap();
        assert!(matches!(resp.into_outcome(), SubstituteOutcome::NotFound { .. }));
    }

    #[test]
    fn test_substitute_found() {
        let resp: SubstituteResponse = serde_json::from_str(
            r#"{"foundSubstitute":true,"suggestedSubstitute":"wax paper","reason":"same barrier","confidence":0.8,"instruction":"Use the roll on the counter","otherOptions":["parchment"]}"#,
        )
        .unwrap();
        match resp.into_outcome() {
            SubstituteOutcome::Found { substitute, confidence, other_options, .. } => {
                assert_eq!(substitute, "wax paper");
                assert_eq!(confidence, 0.8);
                assert_eq!(other_options, vec!["parchment".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_bounding_box_to_pixels_clamps() {
        let b = BoundingBox { label: "valve".into(), x: 90.0, y: 10.0, width: 20.0, height: 50.0 };
        let px = b.to_pixels(1000, 500);
        assert_eq!(px, PixelRect { x: 900, y: 50, width: 100, height: 250 });
    }

    #[test]
    fn test_step_references_is_case_insensitive() {
        let step: RepairStep = serde_json::from_str(
            r#"{"stepNumber":1,"instruction":"Wrap the joint","materialsNeeded":["Aluminum Foil"]}"#,
        )
        .unwrap();
        assert!(step.references("aluminum foil"));
        assert!(!step.references("wax paper"));
    }
}
