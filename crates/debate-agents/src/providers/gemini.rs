//! Gemini `generateContent` backend.

use async_trait::async_trait;
use coordination::{BackendError, BackendId, BackendResponse, InvocationRequest, ModelBackend};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{header_value, post_json, require_key};
use crate::config::ProviderConfig;
use crate::credentials::ApiKey;

#[derive(Debug, Clone)]
pub struct GeminiBackend {
    http: reqwest::Client,
    config: ProviderConfig,
    api_key: Option<ApiKey>,
}

impl GeminiBackend {
    pub fn new(http: reqwest::Client, config: ProviderConfig, api_key: Option<ApiKey>) -> Self {
        Self {
            http,
            config,
            api_key,
        }
    }

    fn generate_url(&self, model: &str) -> String {
        self.config.endpoint(&format!("models/{model}:generateContent"))
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn id(&self) -> BackendId {
        BackendId::Gemini
    }

    fn credentials_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn call(&self, request: &InvocationRequest) -> Result<BackendResponse, BackendError> {
        let key = require_key(BackendId::Gemini, self.api_key.as_ref())?;

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", header_value(key.expose())?);

        let model = self.config.models.for_tier(request.tier());
        let body = request_body(&self.config, request);
        tracing::debug!(model, grounding = request.auto_approve(), "gemini request");
        let reply: GenerateContentResponse =
            post_json(&self.http, &self.generate_url(model), headers, &body, request).await?;
        parse_response(reply)
    }
}

/// The model is part of the URL, not the body.
pub fn request_body(config: &ProviderConfig, request: &InvocationRequest) -> Value {
    let mut body = json!({
        "contents": [{"role": "user", "parts": [{"text": request.prompt()}]}],
        "generationConfig": {"maxOutputTokens": config.max_tokens},
    });
    if request.auto_approve() {
        body["tools"] = json!([{"google_search": {}}]);
    }
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

pub fn parse_response(reply: GenerateContentResponse) -> Result<BackendResponse, BackendError> {
    if let Some(reason) = reply.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(BackendError::Decode(format!("prompt blocked: {reason}")));
    }

    let candidate = reply
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::Decode("response contained no candidates".into()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "none".into());
        return Err(BackendError::Decode(if reason == "SAFETY" {
            "candidate blocked by safety filter".to_string()
        } else {
            format!("candidate contained no text (finish_reason: {reason})")
        }));
    }

    let response = BackendResponse::new(text);
    Ok(match reply.response_id {
        Some(id) => response.with_session_id(id),
        None => response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::{classify_backend_error, ErrorKind};
    use std::time::Duration;

    #[test]
    fn google_search_only_when_approved() {
        let config = ProviderConfig::defaults(BackendId::Gemini);
        let request = InvocationRequest::new(BackendId::Gemini, "research", Duration::from_secs(60));
        let body = request_body(&config, &request);
        assert!(body.get("tools").is_none());
        assert_eq!(body["contents"][0]["parts"][0]["text"], "research");

        let body = request_body(&config, &request.with_auto_approve(true));
        assert!(body["tools"][0]["google_search"].is_object());
    }

    #[test]
    fn parts_are_concatenated() {
        let reply: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "{\"core\""}, {"text": ": 1}"}]},
                "finishReason": "STOP"
            }],
            "responseId": "resp-9"
        }))
        .unwrap();
        let response = parse_response(reply).unwrap();
        assert_eq!(response.text, "{\"core\": 1}");
        assert_eq!(response.session_id.as_deref(), Some("resp-9"));
    }

    #[test]
    fn blocked_prompt_is_content_policy() {
        let reply: GenerateContentResponse =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        let err = parse_response(reply).unwrap_err();
        assert_eq!(classify_backend_error(&err), ErrorKind::ContentPolicy);
    }

    #[test]
    fn safety_finish_is_content_policy() {
        let reply: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }))
        .unwrap();
        let err = parse_response(reply).unwrap_err();
        assert_eq!(classify_backend_error(&err), ErrorKind::ContentPolicy);
    }
}
