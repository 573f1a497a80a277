use std::path::{Path, PathBuf};

use coordination::{BackendId, HealthConfig, ModelTier, OrchestratorConfig, OrchestratorConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] OrchestratorConfigError),

    #[error("provider {backend}: {reason}")]
    Provider { backend: BackendId, reason: String },
}

/// Model name for each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierModels {
    pub low: String,
    pub medium: String,
    pub high: String,
}

impl TierModels {
    fn new(low: &str, medium: &str, high: &str) -> Self {
        Self {
            low: low.into(),
            medium: medium.into(),
            high: high.into(),
        }
    }

    pub fn for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Low => &self.low,
            ModelTier::Medium => &self.medium,
            ModelTier::High => &self.high,
        }
    }
}

/// Connection settings for one provider HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub models: TierModels,
    /// Upper bound on generated tokens per reply.
    pub max_tokens: u32,
}

impl ProviderConfig {
    pub fn defaults(backend: BackendId) -> Self {
        match backend {
            BackendId::Claude => Self {
                base_url: "https://api.anthropic.com".into(),
                models: TierModels::new(
                    "claude-3-5-haiku-latest",
                    "claude-sonnet-4-20250514",
                    "claude-opus-4-20250514",
                ),
                max_tokens: 8192,
            },
            BackendId::Codex => Self {
                base_url: "https://api.openai.com/v1".into(),
                models: TierModels::new("gpt-4o-mini", "gpt-4o", "gpt-4.1"),
                max_tokens: 8192,
            },
            BackendId::Gemini => Self {
                base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
                models: TierModels::new("gemini-2.0-flash-lite", "gemini-2.0-flash", "gemini-2.5-pro"),
                max_tokens: 8192,
            },
        }
    }

    /// Apply `DEBATE_<PROVIDER>_BASE_URL` and `DEBATE_<PROVIDER>_MODEL_<TIER>`.
    pub fn with_overrides(
        mut self,
        backend: BackendId,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Self {
        let prefix = format!("DEBATE_{}", backend.as_str().to_ascii_uppercase());
        let var = |suffix: &str| {
            lookup(&format!("{prefix}_{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = var("BASE_URL") {
            self.base_url = url;
        }
        if let Some(model) = var("MODEL_LOW") {
            self.models.low = model;
        }
        if let Some(model) = var("MODEL_MEDIUM") {
            self.models.medium = model;
        }
        if let Some(model) = var("MODEL_HIGH") {
            self.models.high = model;
        }
        if let Some(n) = var("MAX_TOKENS").and_then(|v| v.parse().ok()) {
            self.max_tokens = n;
        }
        self
    }

    /// Join `path` onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn validate(&self, backend: BackendId) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Provider {
            backend,
            reason: reason.to_string(),
        };
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(invalid("base_url must start with http:// or https://"));
        }
        if [&self.models.low, &self.models.medium, &self.models.high]
            .iter()
            .any(|m| m.trim().is_empty())
        {
            return Err(invalid("model names must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub claude: ProviderConfig,
    pub codex: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude: ProviderConfig::defaults(BackendId::Claude),
            codex: ProviderConfig::defaults(BackendId::Codex),
            gemini: ProviderConfig::defaults(BackendId::Gemini),
        }
    }
}

impl ProvidersConfig {
    pub fn for_backend(&self, backend: BackendId) -> &ProviderConfig {
        match backend {
            BackendId::Claude => &self.claude,
            BackendId::Codex => &self.codex,
            BackendId::Gemini => &self.gemini,
        }
    }

    fn with_overrides(self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            claude: self.claude.with_overrides(BackendId::Claude, lookup),
            codex: self.codex.with_overrides(BackendId::Codex, lookup),
            gemini: self.gemini.with_overrides(BackendId::Gemini, lookup),
        }
    }
}

/// Everything the debater binary needs, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub orchestrator: OrchestratorConfig,
    pub health: HealthConfig,
    pub providers: ProvidersConfig,
}

impl AgentConfig {
    /// Defaults overlaid with `DEBATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            orchestrator: OrchestratorConfig::from_lookup(&lookup),
            health: HealthConfig::from_lookup(&lookup),
            providers: ProvidersConfig::default().with_overrides(&lookup),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// TOML file when given, `DEBATE_*` variables read through `lookup` otherwise.
    pub fn load(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_lookup(lookup),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        for backend in BackendId::ALL {
            self.providers.for_backend(backend).validate(backend)?;
        }
        Ok(())
    }
}
