//! HTTP model backends.
//!
//! One [`coordination::ModelBackend`] per provider API. Request bodies and response parsing
//! are plain functions over `serde_json::Value`; the structs only own the HTTP
//! client, the provider settings and the resolved key.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use coordination::{BackendError, BackendId, BackendRegistry, InvocationRequest};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ProvidersConfig;
use crate::credentials::{self, ApiKey};

pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared client for every provider. Per-request timeouts come from the
/// [`InvocationRequest`].
pub fn http_client() -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("debate-agents/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Register one backend per provider, resolving keys through `lookup`.
pub fn build_registry(
    http: &reqwest::Client,
    providers: &ProvidersConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> BackendRegistry {
    let key = |id| credentials::resolve_with(id, &lookup);
    BackendRegistry::new()
        .register(Arc::new(AnthropicBackend::new(
            http.clone(),
            providers.claude.clone(),
            key(BackendId::Claude),
        )))
        .register(Arc::new(OpenAiBackend::new(
            http.clone(),
            providers.codex.clone(),
            key(BackendId::Codex),
        )))
        .register(Arc::new(GeminiBackend::new(
            http.clone(),
            providers.gemini.clone(),
            key(BackendId::Gemini),
        )))
}

fn require_key(backend: BackendId, key: Option<&ApiKey>) -> Result<&ApiKey, BackendError> {
    key.ok_or(BackendError::MissingCredentials(backend))
}

fn map_transport(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// POST `body` and decode a successful JSON reply into `T`.
///
/// Non-2xx replies keep their status and body verbatim for classification.
async fn post_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    request: &InvocationRequest,
) -> Result<T, BackendError> {
    let timeout = request.timeout();
    let response = http
        .post(url)
        .headers(headers)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| map_transport(e, timeout))?;

    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|e| map_transport(e, timeout))?;

    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: raw,
        });
    }

    serde_json::from_str(&raw).map_err(|e| BackendError::Decode(e.to_string()))
}

fn header_value(value: &str) -> Result<reqwest::header::HeaderValue, BackendError> {
    reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| BackendError::Transport(format!("invalid header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::ModelBackend;

    #[test]
    fn registry_holds_every_backend() {
        let http = http_client().unwrap();
        let registry = build_registry(&http, &ProvidersConfig::default(), |var| {
            (var == "OPENAI_API_KEY").then(|| "sk-test".to_string())
        });
        assert_eq!(registry.ids(), BackendId::ALL.to_vec());
        assert!(registry.get(BackendId::Codex).unwrap().credentials_configured());
        assert!(!registry.get(BackendId::Claude).unwrap().credentials_configured());
        assert!(!registry.get(BackendId::Gemini).unwrap().credentials_configured());
    }

    #[test]
    fn missing_key_is_typed_error() {
        let err = require_key(BackendId::Gemini, None).unwrap_err();
        assert_eq!(err, BackendError::MissingCredentials(BackendId::Gemini));
    }
}
