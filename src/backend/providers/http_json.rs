use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::provider::GuidanceBackend;
use crate::backend::types::{
    GuidanceRequest, GuidanceResponse, PlanRequest, PlanResponse, QuestionRequest,
    QuestionResponse, RepairStep, SubstituteOutcome, SubstituteRequest, SubstituteResponse,
};
use crate::config::BackendConfig;
use crate::errors::{GuidedFixError, GuidedFixResult};

/// JSON-over-HTTP backend: every call is a POST of camelCase JSON to
/// `<api_base>/<endpoint>` with bearer auth.
pub struct HttpJsonBackend {
    api_base: String,
    api_key: String,
    guidance_path: String,
    plan_path: String,
    substitute_path: String,
    question_path: String,
    client: reqwest::Client,
}

impl HttpJsonBackend {
    pub fn new(config: &BackendConfig, api_key: String) -> GuidedFixResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            guidance_path: config.guidance_path.clone(),
            plan_path: config.plan_path.clone(),
            substitute_path: config.substitute_path.clone(),
            question_path: config.question_path.clone(),
            client,
        })
    }

    /// Build from config, reading the API key from `GUIDED_FIX_API_KEY` first.
    pub fn from_config(config: &BackendConfig) -> GuidedFixResult<Self> {
        let api_key = std::env::var("GUIDED_FIX_API_KEY")
            .unwrap_or_else(|_| config.api_key.clone().unwrap_or_default());
        Self::new(config, api_key)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> GuidedFixResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let body = serde_json::to_value(body)?;

        tracing::debug!(
            url = %url,
            body = %sanitized_for_log(&body),
            "sending backend request (base64 omitted)"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            tracing::warn!(url = %url, ?retry_after_secs, "backend rate limited");
            return Err(GuidedFixError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let err_body = response.text().await.unwrap_or_default();
            return Err(GuidedFixError::Backend(format!("{}: {}", status, err_body)));
        }

        let text = response.text().await?;
        let parsed = serde_json::from_str::<R>(&text)?;
        Ok(parsed)
    }
}

#[async_trait]
impl GuidanceBackend for HttpJsonBackend {
    async fn analyze_frame(&self, request: GuidanceRequest) -> GuidedFixResult<GuidanceResponse> {
        let resp: GuidanceResponse = self.post_json(&self.guidance_path, &request).await?;
        Ok(resp.normalized())
    }

    async fn generate_plan(&self, request: PlanRequest) -> GuidedFixResult<Vec<RepairStep>> {
        let resp: PlanResponse = self.post_json(&self.plan_path, &request).await?;
        if resp.steps.is_empty() {
            return Err(GuidedFixError::InvalidPlan("the backend returned no steps".into()));
        }
        tracing::info!(steps = resp.steps.len(), "plan received from backend");
        Ok(resp.steps)
    }

    async fn find_substitute(&self, request: SubstituteRequest) -> GuidedFixResult<SubstituteOutcome> {
        let resp: SubstituteResponse = self.post_json(&self.substitute_path, &request).await?;
        Ok(resp.into_outcome())
    }

    async fn answer_question(&self, request: QuestionRequest) -> GuidedFixResult<String> {
        let resp: QuestionResponse = self.post_json(&self.question_path, &request).await?;
        Ok(resp.answer)
    }
}

/// Clone the body and replace base64 image payloads so debug logs stay small.
fn sanitized_for_log(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(obj) = log_body.as_object_mut() {
        if let Some(image) = obj.get_mut("imageBase64") {
            if image.is_string() {
                *image = serde_json::Value::String("<omitted_base64_image>".to_string());
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}
