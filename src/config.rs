use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{GuidedFixError, GuidedFixResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL; endpoint paths below are joined onto it.
    pub api_base: String,
    /// Optional API key stored in config.toml (falls back to env var GUIDED_FIX_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_guidance_path")]
    pub guidance_path: String,
    #[serde(default = "default_plan_path")]
    pub plan_path: String,
    #[serde(default = "default_substitute_path")]
    pub substitute_path: String,
    #[serde(default = "default_question_path")]
    pub question_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_guidance_path() -> String {
    "guided-fix/analyze".into()
}

fn default_plan_path() -> String {
    "guided-fix/plan".into()
}

fn default_substitute_path() -> String {
    "guided-fix/substitute".into()
}

fn default_question_path() -> String {
    "guided-fix/question".into()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Frame capture cadence and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Minimum spacing between two analyses, measured from the last submission.
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
    /// JPEG quality in [0, 1].
    #[serde(default = "default_frame_quality")]
    pub frame_quality: f32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Upper bound for the rate-limit spacing multiplier.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_multiplier: u32,
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_min_spacing_ms() -> u64 {
    1500
}

fn default_frame_quality() -> f32 {
    0.5
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_backoff() -> u32 {
    8
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            min_spacing_ms: default_min_spacing_ms(),
            frame_quality: default_frame_quality(),
            max_consecutive_failures: default_max_failures(),
            max_backoff_multiplier: default_max_backoff(),
        }
    }
}

/// Thresholds used by the reducer and the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Consecutive low-confidence frames before guidance escalates to a manual pause.
    #[serde(default = "default_three")]
    pub low_confidence_escalation: u32,
    /// Mismatched identity readings tolerated before the session pauses.
    #[serde(default = "default_three")]
    pub identity_mismatch_tolerance: u32,
    #[serde(default = "default_completion_confidence")]
    pub completion_confidence: f32,
    #[serde(default = "default_low_confidence")]
    pub low_confidence: f32,
}

fn default_three() -> u32 {
    3
}

fn default_completion_confidence() -> f32 {
    0.7
}

fn default_low_confidence() -> f32 {
    0.3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            low_confidence_escalation: default_three(),
            identity_mismatch_tolerance: default_three(),
            completion_confidence: default_completion_confidence(),
            low_confidence: default_low_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CameraConfig {
    /// Directory of still frames served in filename order.
    #[serde(default)]
    pub frames_dir: Option<PathBuf>,
}

/// What is being repaired. Mirrors the diagnosis handed over by the app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub category: String,
    pub diagnosis_summary: String,
    #[serde(default)]
    pub likely_cause: Option<String>,
    #[serde(default)]
    pub problem_description: Option<String>,
    /// When set, the session verifies the camera sees this item before step 1.
    #[serde(default)]
    pub expected_item: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> GuidedFixResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(GuidedFixError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> GuidedFixResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    let quality = config.scheduler.frame_quality;
    if !(0.0..=1.0).contains(&quality) {
        return Err(GuidedFixError::Config(format!(
            "scheduler.frame_quality must be within [0, 1], got {quality}"
        )));
    }
    if config.scheduler.interval_ms == 0 {
        return Err(GuidedFixError::Config("scheduler.interval_ms must be positive".into()));
    }
    Ok(config)
}

pub fn load_config() -> GuidedFixResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), category = %config.session.category, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> GuidedFixResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
