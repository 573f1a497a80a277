//! Anthropic Messages API backend (`claude`).

use async_trait::async_trait;
use coordination::{BackendError, BackendId, BackendResponse, InvocationRequest, ModelBackend};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{header_value, post_json, require_key};
use crate::config::ProviderConfig;
use crate::credentials::ApiKey;

const API_VERSION: &str = "2023-06-01";
const WEB_SEARCH_MAX_USES: u32 = 5;

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    http: reqwest::Client,
    config: ProviderConfig,
    api_key: Option<ApiKey>,
}

impl AnthropicBackend {
    pub fn new(http: reqwest::Client, config: ProviderConfig, api_key: Option<ApiKey>) -> Self {
        Self {
            http,
            config,
            api_key,
        }
    }

    fn messages_url(&self) -> String {
        self.config.endpoint("v1/messages")
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn id(&self) -> BackendId {
        BackendId::Claude
    }

    fn credentials_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn call(&self, request: &InvocationRequest) -> Result<BackendResponse, BackendError> {
        let key = require_key(BackendId::Claude, self.api_key.as_ref())?;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", header_value(key.expose())?);
        headers.insert("anthropic-version", header_value(API_VERSION)?);

        let body = request_body(&self.config, request);
        tracing::debug!(model = %body["model"], tools = request.auto_approve(), "anthropic request");
        let reply: MessagesResponse =
            post_json(&self.http, &self.messages_url(), headers, &body, request).await?;
        parse_response(reply)
    }
}

/// Messages API request body. The web search server tool is only offered
/// when side effects are approved.
pub fn request_body(config: &ProviderConfig, request: &InvocationRequest) -> Value {
    let mut body = json!({
        "model": config.models.for_tier(request.tier()),
        "max_tokens": config.max_tokens,
        "messages": [{"role": "user", "content": request.prompt()}],
    });
    if request.auto_approve() {
        body["tools"] = json!([{
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": WEB_SEARCH_MAX_USES,
        }]);
    }
    body
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    id: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Join every text block; tool-use blocks from web search are dropped.
pub fn parse_response(reply: MessagesResponse) -> Result<BackendResponse, BackendError> {
    let text: Vec<String> = reply
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.trim().is_empty() => Some(text),
            _ => None,
        })
        .collect();

    if text.is_empty() {
        return Err(BackendError::Decode(format!(
            "response contained no text content (stop_reason: {})",
            reply.stop_reason.as_deref().unwrap_or("none")
        )));
    }
    Ok(BackendResponse::new(text.join("\n")).with_session_id(reply.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(auto_approve: bool) -> InvocationRequest {
        InvocationRequest::new(BackendId::Claude, "argue", Duration::from_secs(30))
            .with_auto_approve(auto_approve)
    }

    #[test]
    fn body_uses_tier_model() {
        let config = ProviderConfig::defaults(BackendId::Claude);
        let body = request_body(&config, &request(false).with_tier(coordination::ModelTier::Low));
        assert_eq!(body["model"], "claude-3-5-haiku-latest");
        assert_eq!(body["messages"][0]["content"], "argue");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn web_search_only_when_approved() {
        let config = ProviderConfig::defaults(BackendId::Claude);
        let body = request_body(&config, &request(true));
        assert_eq!(body["tools"][0]["name"], "web_search");
    }

    #[test]
    fn text_blocks_are_joined() {
        let reply: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_01",
            "content": [
                {"type": "server_tool_use", "id": "srv", "name": "web_search", "input": {}},
                {"type": "text", "text": "{\"a\":"},
                {"type": "text", "text": "1}"}
            ],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        let response = parse_response(reply).unwrap();
        assert_eq!(response.text, "{\"a\":\n1}");
        assert_eq!(response.session_id.as_deref(), Some("msg_01"));
    }

    #[test]
    fn empty_content_is_decode_error() {
        let reply: MessagesResponse =
            serde_json::from_value(json!({"id": "msg_02", "content": [], "stop_reason": "max_tokens"}))
                .unwrap();
        let err = parse_response(reply).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }
}
