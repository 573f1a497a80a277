//! API key lookup per provider.
//!
//! Each backend has a short, ordered list of environment variables; the first
//! one holding a non-blank value wins. Lookup goes through a function so tests
//! never touch the process environment.

use coordination::BackendId;
use serde::Serialize;

/// Environment variables checked for `backend`, in priority order.
pub fn env_vars(backend: BackendId) -> &'static [&'static str] {
    match backend {
        BackendId::Claude => &["ANTHROPIC_API_KEY", "CLAUDE_API_KEY"],
        BackendId::Codex => &["OPENAI_API_KEY", "CODEX_API_KEY"],
        BackendId::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
    }
}

/// A resolved key and the variable it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub source: &'static str,
    value: String,
}

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("source", &self.source)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Resolve the key for `backend` through `lookup`.
pub fn resolve_with(
    backend: BackendId,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<ApiKey> {
    env_vars(backend).iter().find_map(|&var| {
        let value = lookup(var)?;
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| ApiKey {
            source: var,
            value: trimmed.to_string(),
        })
    })
}

/// Resolve the key for `backend` from the process environment.
pub fn resolve(backend: BackendId) -> Option<ApiKey> {
    resolve_with(backend, |var| std::env::var(var).ok())
}

/// Credential status of one backend. Never carries the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub backend: BackendId,
    pub configured: bool,
    pub checked: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_in: Option<&'static str>,
}

/// Credential status across backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialReport {
    pub backends: Vec<CredentialStatus>,
}

impl CredentialReport {
    pub fn build(backends: &[BackendId], lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backends = backends
            .iter()
            .map(|&backend| {
                let found = resolve_with(backend, &lookup);
                CredentialStatus {
                    backend,
                    configured: found.is_some(),
                    checked: env_vars(backend).to_vec(),
                    found_in: found.map(|k| k.source),
                }
            })
            .collect();
        Self { backends }
    }

    pub fn from_env(backends: &[BackendId]) -> Self {
        Self::build(backends, |var| std::env::var(var).ok())
    }

    pub fn is_configured(&self, backend: BackendId) -> bool {
        self.backends
            .iter()
            .any(|s| s.backend == backend && s.configured)
    }

    pub fn any_configured(&self) -> bool {
        self.backends.iter().any(|s| s.configured)
    }
}
