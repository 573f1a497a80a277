//! Backend health probing.
//!
//! Before a debate session commits to expensive calls, each backend gets a
//! cheap canary request (lowest tier, one-word reply). The trusted backend is
//! the ultimate fallback target and is never probed.
//!
//! ```text
//! probe(id)
//!   ├─ id == trusted           → available (not probed)
//!   ├─ credentials missing     → unavailable, kind = auth   (no network)
//!   ├─ canary within timeout   → available, latency
//!   ├─ canary error            → unavailable, kind = classify_backend_error(error)
//!   └─ canary exceeds timeout  → unavailable, kind = timeout
//! ```
//!
//! Results are recomputed per session and never cached across sessions.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{BackendId, BackendRegistry, InvocationRequest, ModelTier};
use crate::classifier::{classify_backend_error, ErrorKind};

/// Fixed canary prompt.
pub const CANARY_PROMPT: &str = "Health check. Reply with exactly one word: OK";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Availability of one backend at probe time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHealthStatus {
    pub backend: BackendId,
    pub available: bool,
    #[serde(
        rename = "latency_ms",
        with = "crate::retry::option_duration_millis",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub latency: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<ErrorKind>,
}

impl BackendHealthStatus {
    pub fn available(backend: BackendId, latency: Option<Duration>) -> Self {
        Self {
            backend,
            available: true,
            latency,
            error: None,
            error_kind: None,
        }
    }

    pub fn unavailable(backend: BackendId, error: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            backend,
            available: false,
            latency: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// Probe results for one debate session. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHealth {
    statuses: HashMap<BackendId, BackendHealthStatus>,
}

impl SessionHealth {
    pub fn from_statuses(statuses: impl IntoIterator<Item = BackendHealthStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().map(|s| (s.backend, s)).collect(),
        }
    }

    pub fn status(&self, backend: BackendId) -> Option<&BackendHealthStatus> {
        self.statuses.get(&backend)
    }

    /// Unprobed backends count as available.
    pub fn is_available(&self, backend: BackendId) -> bool {
        self.statuses
            .get(&backend)
            .map(|s| s.available)
            .unwrap_or(true)
    }

    /// Statuses in stable backend order.
    pub fn statuses(&self) -> Vec<&BackendHealthStatus> {
        let mut all: Vec<&BackendHealthStatus> = self.statuses.values().collect();
        all.sort_by_key(|s| s.backend);
        all
    }

    pub fn all_available(&self) -> bool {
        self.statuses.values().all(|s| s.available)
    }
}

/// Probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Backend exempt from probing; always reported available.
    pub trusted_backend: BackendId,
    #[serde(rename = "probe_timeout_secs", with = "crate::retry::duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            trusted_backend: BackendId::Claude,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl HealthConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `DEBATE_TRUSTED_BACKEND`: provider token (default: claude)
    /// - `DEBATE_PROBE_TIMEOUT_SECS`: canary timeout (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let trusted_backend = lookup("DEBATE_TRUSTED_BACKEND")
            .and_then(|v| v.parse::<BackendId>().ok())
            .unwrap_or(defaults.trusted_backend);

        let probe_timeout = lookup("DEBATE_PROBE_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.probe_timeout);

        Self {
            trusted_backend,
            probe_timeout,
        }
    }
}

/// Runs canary probes against registered backends.
#[derive(Debug, Clone)]
pub struct HealthProber {
    registry: BackendRegistry,
    config: HealthConfig,
}

impl HealthProber {
    pub fn new(registry: BackendRegistry, config: HealthConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe one backend with the configured timeout.
    pub async fn probe(&self, backend: BackendId) -> BackendHealthStatus {
        self.probe_with_timeout(backend, self.config.probe_timeout)
            .await
    }

    pub async fn probe_with_timeout(
        &self,
        backend: BackendId,
        timeout: Duration,
    ) -> BackendHealthStatus {
        if backend == self.config.trusted_backend {
            tracing::debug!(%backend, "trusted backend; skipping probe");
            return BackendHealthStatus::available(backend, None);
        }

        let client = match self.registry.get(backend) {
            Ok(client) => client,
            Err(e) => {
                return BackendHealthStatus::unavailable(
                    backend,
                    e.to_string(),
                    ErrorKind::InvalidInput,
                )
            }
        };

        if !client.credentials_configured() {
            tracing::warn!(%backend, "probe skipped: credentials not configured");
            return BackendHealthStatus::unavailable(
                backend,
                format!("no credentials configured for {backend}"),
                ErrorKind::Auth,
            );
        }

        let request = InvocationRequest::new(backend, CANARY_PROMPT, timeout)
            .with_tier(ModelTier::Low)
            .with_auto_approve(false);
        let started = Instant::now();

        let status = match tokio::time::timeout(timeout, client.call(&request)).await {
            Ok(Ok(_)) => BackendHealthStatus::available(backend, Some(started.elapsed())),
            Ok(Err(e)) => {
                let kind = classify_backend_error(&e);
                BackendHealthStatus::unavailable(backend, e.to_string(), kind)
            }
            Err(_) => BackendHealthStatus::unavailable(
                backend,
                format!("canary timed out after {timeout:?}"),
                ErrorKind::Timeout,
            ),
        };

        if status.available {
            tracing::info!(%backend, latency_ms = ?status.latency.map(|l| l.as_millis()), "backend healthy");
        } else {
            tracing::warn!(
                %backend,
                error = status.error.as_deref().unwrap_or_default(),
                kind = ?status.error_kind,
                "backend unhealthy"
            );
        }
        status
    }

    /// Probe several backends concurrently and gather every result.
    pub async fn probe_all(&self, backends: &[BackendId]) -> SessionHealth {
        let probes = backends.iter().map(|&b| self.probe(b));
        let statuses = futures::future::join_all(probes).await;
        SessionHealth::from_statuses(statuses)
    }

    /// Probe every registered backend.
    pub async fn probe_registered(&self) -> SessionHealth {
        self.probe_all(&self.registry.ids()).await
    }
}
