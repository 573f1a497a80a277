//! OpenAI Chat Completions backend (`codex`, alias `gpt`).

use async_trait::async_trait;
use coordination::{BackendError, BackendId, BackendResponse, InvocationRequest, ModelBackend};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{header_value, post_json, require_key};
use crate::config::ProviderConfig;
use crate::credentials::ApiKey;

#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    http: reqwest::Client,
    config: ProviderConfig,
    api_key: Option<ApiKey>,
}

impl OpenAiBackend {
    pub fn new(http: reqwest::Client, config: ProviderConfig, api_key: Option<ApiKey>) -> Self {
        Self {
            http,
            config,
            api_key,
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn id(&self) -> BackendId {
        BackendId::Codex
    }

    fn credentials_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn call(&self, request: &InvocationRequest) -> Result<BackendResponse, BackendError> {
        let key = require_key(BackendId::Codex, self.api_key.as_ref())?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", key.expose()))?);

        let body = request_body(&self.config, request);
        tracing::debug!(model = %body["model"], search = request.auto_approve(), "openai request");
        let url = self.config.endpoint("chat/completions");
        let reply: ChatCompletion = post_json(&self.http, &url, headers, &body, request).await?;
        parse_response(reply)
    }
}

pub fn request_body(config: &ProviderConfig, request: &InvocationRequest) -> Value {
    let mut body = json!({
        "model": config.models.for_tier(request.tier()),
        "max_completion_tokens": config.max_tokens,
        "messages": [{"role": "user", "content": request.prompt()}],
    });
    if request.auto_approve() {
        body["web_search_options"] = json!({});
    }
    body
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    id: String,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

pub fn parse_response(reply: ChatCompletion) -> Result<BackendResponse, BackendError> {
    let choice = reply
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::Decode("response contained no choices".into()))?;

    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(BackendError::Decode(format!(
            "model refused (content policy): {refusal}"
        )));
    }

    match choice.message.content.filter(|c| !c.trim().is_empty()) {
        Some(text) => Ok(BackendResponse::new(text).with_session_id(reply.id)),
        None => Err(BackendError::Decode(format!(
            "choice contained no content (finish_reason: {})",
            choice.finish_reason.as_deref().unwrap_or("none")
        ))),
    }
}
