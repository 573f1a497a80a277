//! Model backend seam.
//!
//! Every remote provider is reached through [`ModelBackend`]. The
//! [`BackendRegistry`] guarantees each [`BackendId`] resolves to exactly one
//! implementation, so unknown identities are rejected before any call.
//!
//! ```text
//! "gpt" ──┐
//!         ├─► BackendId::Codex ──► registry ──► Arc<dyn ModelBackend>
//! "codex" ┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a remote model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// Anthropic Claude. The trusted backend and default fallback target.
    Claude,
    /// OpenAI models. Reached through both the `gpt` and `codex` tokens.
    Codex,
    /// Google Gemini.
    Gemini,
}

impl BackendId {
    /// All known identities, in registration order.
    pub const ALL: [BackendId; 3] = [BackendId::Claude, BackendId::Codex, BackendId::Gemini];

    /// Command-line tokens accepted by [`FromStr`].
    pub const TOKENS: [&'static str; 4] = ["claude", "gpt", "codex", "gemini"];

    /// Canonical token for this identity.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a provider token does not name a known backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider '{0}' (expected one of: claude, gpt, codex, gemini)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendId {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "gpt" | "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Coarse quality/cost selector passed through to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheapest model. Used for canary probes.
    Low,
    Medium,
    /// Strongest model. Default for debate turns.
    #[default]
    High,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A single call to a backend. Built fresh for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    backend: BackendId,
    prompt: String,
    timeout: Duration,
    tier: ModelTier,
    auto_approve: bool,
}

impl InvocationRequest {
    pub fn new(backend: BackendId, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            prompt: prompt.into(),
            timeout,
            tier: ModelTier::High,
            auto_approve: false,
        }
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    /// Allow the backend to run side-effecting tools (e.g. web search).
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }
}

/// Raw text returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub text: String,
    /// Opaque provider-side identifier for the exchange.
    pub session_id: Option<String>,
}

impl BackendResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Transport-level failure of a backend call.
///
/// [`crate::classifier::classify_backend_error`] reads the status and body,
/// so variants keep them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("unauthorized: no API key configured for {0}")]
    MissingCredentials(BackendId),
}

/// Uniform interface over every remote model provider.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Fast local check that credentials are present. Never touches the network.
    fn credentials_configured(&self) -> bool;

    /// Issue one request. Implementations must honor `request.timeout()`.
    async fn call(&self, request: &InvocationRequest) -> Result<BackendResponse, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no backend registered for {0}")]
    NotRegistered(BackendId),

    #[error("backend reports id {actual} but was registered as {expected}")]
    IdMismatch {
        expected: BackendId,
        actual: BackendId,
    },
}

/// Maps each [`BackendId`] to exactly one backend implementation.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id. Replaces any previous entry.
    pub fn register(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends.insert(backend.id(), backend);
        self
    }

    /// Register a backend under an explicit id, rejecting a mismatched one.
    pub fn register_as(
        mut self,
        id: BackendId,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self, RegistryError> {
        if backend.id() != id {
            return Err(RegistryError::IdMismatch {
                expected: id,
                actual: backend.id(),
            });
        }
        self.backends.insert(id, backend);
        Ok(self)
    }

    pub fn get(&self, id: BackendId) -> Result<Arc<dyn ModelBackend>, RegistryError> {
        self.backends
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotRegistered(id))
    }

    pub fn contains(&self, id: BackendId) -> bool {
        self.backends.contains_key(&id)
    }

    /// Registered identities in stable order.
    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}
