//! Invocation orchestrator: the resilient entry point every debate phase uses.
//!
//! Composes the retry executor, the error classifier, the response normalizer
//! and (optionally) a session health snapshot into a single call that always
//! returns an [`Invocation`].
//!
//! ```text
//! invoke(backend, phase, ctx)
//!   │
//!   ├─ primary marked unhealthy && route_around ──► fallback (trigger = preflight_unhealthy)
//!   │
//!   ├─ prompt = builder.build(phase, ctx)        ✗ → invalid_input, no attempts
//!   ├─ credentials_configured()                  ✗ → auth, no attempts
//!   ├─ timeout(phase + buffer,
//!   │     run_with_retry(timeout(phase, call)))  ✗ deadline → timeout
//!   ├─ ok  → normalize(text) → Success
//!   └─ err → should_fallback? ──► fallback once (trigger = failure)
//! ```
//!
//! Fallback happens at most once per invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::{BackendError, BackendId, BackendRegistry, BackendResponse, InvocationRequest};
use crate::classifier::{classify_backend_error, should_fallback, ErrorKind};
use crate::health::SessionHealth;
use crate::normalizer::normalize;
use crate::outcome::{AttemptRecord, FallbackEvent, FallbackTrigger, Invocation, InvocationOutcome};
use crate::prompt::{PromptBuilder, PromptContext};
use crate::retry::{run_with_retry, AttemptError, RetryAttempt, RetryPolicy, RetryPolicyError};

const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 300;
const RESEARCH_PHASE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DEADLINE_BUFFER_SECS: u64 = 60;

// ============================================================================
// Configuration
// ============================================================================

/// Per-phase time budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    /// Budget for any phase without an override.
    #[serde(rename = "default_secs", with = "crate::retry::duration_secs")]
    pub default_timeout: Duration,
    /// Added to the phase budget to form the overall deadline, covering backoff sleeps.
    #[serde(rename = "buffer_secs", with = "crate::retry::duration_secs")]
    pub deadline_buffer: Duration,
    /// Phase name → seconds.
    pub phases: BTreeMap<String, u64>,
    /// Phases allowed to run side-effecting tools such as web search.
    pub auto_approve_phases: BTreeSet<String>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS),
            deadline_buffer: Duration::from_secs(DEFAULT_DEADLINE_BUFFER_SECS),
            phases: BTreeMap::from([("research".to_string(), RESEARCH_PHASE_TIMEOUT_SECS)]),
            auto_approve_phases: BTreeSet::from(["research".to_string()]),
        }
    }
}

impl TimeoutTable {
    pub fn with_phase(mut self, phase: impl Into<String>, timeout: Duration) -> Self {
        self.phases.insert(phase.into(), timeout.as_secs().max(1));
        self
    }

    /// Per-attempt timeout for `phase`.
    pub fn for_phase(&self, phase: &str) -> Duration {
        self.phases
            .get(phase)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or(self.default_timeout)
    }

    /// Overall deadline for one backend's retry loop. Saturates at `Duration::MAX`.
    pub fn deadline_for(&self, phase: &str) -> Duration {
        self.for_phase(phase).saturating_add(self.deadline_buffer)
    }

    pub fn auto_approve(&self, phase: &str) -> bool {
        self.auto_approve_phases.contains(phase)
    }
}

/// Provider switching rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    pub enabled: bool,
    pub fallback_backend: BackendId,
    /// Skip a primary the session probe already marked unavailable.
    pub route_around_unhealthy_primary: bool,
    /// Refuse to fall back onto a backend the session probe marked unavailable.
    pub require_healthy_fallback: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_backend: BackendId::Claude,
            route_around_unhealthy_primary: false,
            require_healthy_fallback: false,
        }
    }
}

impl FallbackPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn targets(&self, primary: BackendId) -> Option<BackendId> {
        (self.enabled && self.fallback_backend != primary).then_some(self.fallback_backend)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorConfigError {
    #[error("invalid retry policy: {0}")]
    Retry(#[from] RetryPolicyError),

    #[error("default phase timeout must be > 0")]
    ZeroDefaultTimeout,

    #[error("timeout for phase '{0}' must be > 0")]
    ZeroPhaseTimeout(String),
}

/// Immutable configuration handed to [`InvocationOrchestrator::new`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub timeouts: TimeoutTable,
    pub fallback: FallbackPolicy,
}

impl OrchestratorConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// - `DEBATE_MAX_ATTEMPTS`
    /// - `DEBATE_BASE_DELAY_SECS` / `DEBATE_MAX_DELAY_SECS`
    /// - `DEBATE_DEFAULT_TIMEOUT_SECS` / `DEBATE_RESEARCH_TIMEOUT_SECS`
    /// - `DEBATE_DEADLINE_BUFFER_SECS`
    /// - `DEBATE_FALLBACK_ENABLED` (`true`/`false`)
    /// - `DEBATE_FALLBACK_BACKEND` (provider token)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`], reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        };

        if let Some(n) = lookup("DEBATE_MAX_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            config.retry.max_attempts = n;
        }
        if let Some(d) = secs("DEBATE_BASE_DELAY_SECS") {
            config.retry.base_delay = d;
        }
        if let Some(d) = secs("DEBATE_MAX_DELAY_SECS") {
            config.retry.max_delay = d;
        }
        if let Some(d) = secs("DEBATE_DEFAULT_TIMEOUT_SECS") {
            config.timeouts.default_timeout = d;
        }
        if let Some(d) = secs("DEBATE_RESEARCH_TIMEOUT_SECS") {
            config.timeouts = config.timeouts.with_phase("research", d);
        }
        if let Some(d) = secs("DEBATE_DEADLINE_BUFFER_SECS") {
            config.timeouts.deadline_buffer = d;
        }
        if let Some(enabled) = lookup("DEBATE_FALLBACK_ENABLED").and_then(|v| v.trim().parse().ok()) {
            config.fallback.enabled = enabled;
        }
        if let Some(id) = lookup("DEBATE_FALLBACK_BACKEND").and_then(|v| v.parse().ok()) {
            config.fallback.fallback_backend = id;
        }
        config
    }

    pub fn validate(&self) -> Result<(), OrchestratorConfigError> {
        self.retry.validate()?;
        if self.timeouts.default_timeout.is_zero() {
            return Err(OrchestratorConfigError::ZeroDefaultTimeout);
        }
        if let Some((phase, _)) = self.timeouts.phases.iter().find(|(_, secs)| **secs == 0) {
            return Err(OrchestratorConfigError::ZeroPhaseTimeout(phase.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Failure of a single attempt, already classified.
#[derive(Debug, Clone)]
struct CallError {
    message: String,
    kind: ErrorKind,
}

impl CallError {
    fn from_backend(err: &BackendError) -> Self {
        Self {
            message: err.to_string(),
            kind: classify_backend_error(err),
        }
    }

    fn into_attempt_error(self) -> AttemptError<Self> {
        if self.kind.is_fatal() {
            AttemptError::Fatal(self)
        } else {
            AttemptError::Retryable(self)
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Resilient invocation of model backends.
#[derive(Clone)]
pub struct InvocationOrchestrator {
    config: OrchestratorConfig,
    registry: BackendRegistry,
    prompts: Arc<dyn PromptBuilder>,
    session_health: Option<SessionHealth>,
}

impl fmt::Debug for InvocationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationOrchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("session_health", &self.session_health)
            .finish_non_exhaustive()
    }
}

impl InvocationOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: BackendRegistry,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Result<Self, OrchestratorConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            prompts,
            session_health: None,
        })
    }

    /// Attach the once-per-session probe results.
    pub fn with_session_health(mut self, health: SessionHealth) -> Self {
        self.session_health = Some(health);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn session_health(&self) -> Option<&SessionHealth> {
        self.session_health.as_ref()
    }

    /// Invoke with the configured fallback policy.
    pub async fn invoke(&self, backend: BackendId, phase: &str, ctx: &PromptContext) -> Invocation {
        self.invoke_with_policy(backend, phase, ctx, &self.config.fallback)
            .await
    }

    /// Invoke with an explicit fallback policy. Never panics, never errors.
    pub async fn invoke_with_policy(
        &self,
        backend: BackendId,
        phase: &str,
        ctx: &PromptContext,
        policy: &FallbackPolicy,
    ) -> Invocation {
        let invocation_id = Uuid::new_v4();
        let started = Instant::now();
        let mut history = Vec::new();
        let mut fallback_events = Vec::new();

        tracing::info!(%invocation_id, %backend, phase, "invocation started");

        let (served_by, outcome) = match self.preflight_reroute(backend, policy) {
            Some((fallback, kind, message)) => {
                tracing::warn!(
                    %invocation_id,
                    %backend,
                    %fallback,
                    phase,
                    "primary marked unhealthy; routing to fallback"
                );
                let switched = Instant::now();
                let outcome = self
                    .attempt_backend(fallback, phase, ctx, &mut history)
                    .await;
                fallback_events.push(FallbackEvent {
                    phase: phase.to_string(),
                    original_backend: backend,
                    fallback_backend: fallback,
                    trigger: FallbackTrigger::PreflightUnhealthy,
                    error_kind: kind,
                    error_message: message,
                    timestamp: Utc::now(),
                    recovery_latency: switched.elapsed(),
                });
                (fallback, outcome)
            }
            None => {
                let outcome = self.attempt_backend(backend, phase, ctx, &mut history).await;
                match self.fallback_after_failure(backend, &outcome, policy) {
                    Some(fallback) => {
                        let (kind, message) = match &outcome {
                            InvocationOutcome::Failure { kind, message } => (*kind, message.clone()),
                            InvocationOutcome::Success { .. } => (ErrorKind::Unknown, String::new()),
                        };
                        tracing::warn!(
                            %invocation_id,
                            %backend,
                            %fallback,
                            phase,
                            kind = %kind,
                            error = %message,
                            "falling back"
                        );
                        let switched = Instant::now();
                        let outcome = self
                            .attempt_backend(fallback, phase, ctx, &mut history)
                            .await;
                        fallback_events.push(FallbackEvent {
                            phase: phase.to_string(),
                            original_backend: backend,
                            fallback_backend: fallback,
                            trigger: FallbackTrigger::Failure,
                            error_kind: kind,
                            error_message: message,
                            timestamp: Utc::now(),
                            recovery_latency: switched.elapsed(),
                        });
                        (fallback, outcome)
                    }
                    None => (backend, outcome),
                }
            }
        };

        let invocation = Invocation {
            invocation_id,
            phase: phase.to_string(),
            requested_backend: backend,
            served_by,
            outcome,
            retry_history: history,
            fallback_events,
            elapsed: started.elapsed(),
        };

        match &invocation.outcome {
            InvocationOutcome::Success { payload, .. } => tracing::info!(
                %invocation_id,
                served_by = %invocation.served_by,
                phase,
                strategy = ?payload.strategy(),
                retries = invocation.retry_history.len(),
                fallbacks = invocation.fallback_events.len(),
                elapsed_ms = invocation.elapsed.as_millis() as u64,
                "invocation finished"
            ),
            InvocationOutcome::Failure { message, kind } => tracing::error!(
                %invocation_id,
                served_by = %invocation.served_by,
                phase,
                kind = %kind,
                error = %message,
                retries = invocation.retry_history.len(),
                fallbacks = invocation.fallback_events.len(),
                "invocation failed"
            ),
        }

        invocation
    }

    /// Reroute before touching a primary the session probe rejected.
    fn preflight_reroute(
        &self,
        primary: BackendId,
        policy: &FallbackPolicy,
    ) -> Option<(BackendId, ErrorKind, String)> {
        if !policy.route_around_unhealthy_primary {
            return None;
        }
        let health = self.session_health.as_ref()?;
        let fallback = policy.targets(primary)?;
        if health.is_available(primary) || !self.fallback_is_healthy(fallback, policy) {
            return None;
        }
        let status = health.status(primary);
        let kind = status
            .and_then(|s| s.error_kind)
            .unwrap_or(ErrorKind::Unknown);
        let message = status
            .and_then(|s| s.error.clone())
            .unwrap_or_else(|| format!("{primary} marked unavailable by session probe"));
        Some((fallback, kind, message))
    }

    /// Decide whether a finished primary attempt warrants one switch.
    fn fallback_after_failure(
        &self,
        primary: BackendId,
        outcome: &InvocationOutcome,
        policy: &FallbackPolicy,
    ) -> Option<BackendId> {
        if !should_fallback(outcome) {
            return None;
        }
        let fallback = policy.targets(primary)?;
        if !self.fallback_is_healthy(fallback, policy) {
            tracing::warn!(%fallback, "fallback backend marked unhealthy; not switching");
            return None;
        }
        Some(fallback)
    }

    fn fallback_is_healthy(&self, fallback: BackendId, policy: &FallbackPolicy) -> bool {
        !policy.require_healthy_fallback
            || self
                .session_health
                .as_ref()
                .map(|h| h.is_available(fallback))
                .unwrap_or(true)
    }

    /// Build, check credentials and retry against a single backend. Failed attempts land in `history`.
    async fn attempt_backend(
        &self,
        backend: BackendId,
        phase: &str,
        ctx: &PromptContext,
        history: &mut Vec<AttemptRecord>,
    ) -> InvocationOutcome {
        let prompt = match self.prompts.build(phase, ctx) {
            Ok(prompt) => prompt,
            Err(e) => return InvocationOutcome::failure(e.to_string(), ErrorKind::InvalidInput),
        };

        let client = match self.registry.get(backend) {
            Ok(client) => client,
            Err(e) => return InvocationOutcome::failure(e.to_string(), ErrorKind::InvalidInput),
        };

        if !client.credentials_configured() {
            tracing::warn!(%backend, "credentials not configured; skipping network call");
            return InvocationOutcome::failure(
                BackendError::MissingCredentials(backend).to_string(),
                ErrorKind::Auth,
            );
        }

        let timeouts = &self.config.timeouts;
        let timeout = timeouts.for_phase(phase);
        let deadline = timeouts.deadline_for(phase);
        let auto_approve = timeouts.auto_approve(phase);

        let mut observed: Vec<RetryAttempt> = Vec::new();
        let run = run_with_retry(
            &self.config.retry,
            |_attempt| {
                let client = Arc::clone(&client);
                let request = InvocationRequest::new(backend, prompt.as_str(), timeout)
                    .with_auto_approve(auto_approve);
                async move {
                    match tokio::time::timeout(request.timeout(), client.call(&request)).await {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => Err(CallError::from_backend(&e).into_attempt_error()),
                        Err(_) => Err(CallError::from_backend(&BackendError::Timeout(
                            request.timeout(),
                        ))
                        .into_attempt_error()),
                    }
                }
            },
            |record| {
                tracing::warn!(
                    %backend,
                    phase,
                    attempt = record.attempt,
                    delay_ms = record.delay.map(|d| d.as_millis() as u64),
                    error = %record.error,
                    "attempt failed; backing off"
                );
                observed.push(record.clone());
            },
        );
        let result = tokio::time::timeout(deadline, run).await;

        let tag = |attempts: Vec<RetryAttempt>| {
            attempts
                .into_iter()
                .map(|attempt| AttemptRecord { backend, attempt })
        };

        match result {
            Ok(Ok(retried)) => {
                history.extend(tag(retried.attempts));
                success(retried.value)
            }
            Ok(Err(failure)) => {
                history.extend(tag(failure.attempts));
                InvocationOutcome::failure(failure.error.message, failure.error.kind)
            }
            Err(_) => {
                history.extend(tag(observed));
                InvocationOutcome::failure(
                    format!("{backend} exceeded {phase} deadline of {deadline:?}; timed out"),
                    ErrorKind::Timeout,
                )
            }
        }
    }
}

fn success(response: BackendResponse) -> InvocationOutcome {
    let payload = normalize(&response.text);
    InvocationOutcome::Success {
        text: response.text,
        session_id: response.session_id,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::ModelBackend;
    use crate::health::BackendHealthStatus;
    use crate::normalizer::Strategy;
    use crate::prompt::PromptError;

    type Reply = Result<BackendResponse, BackendError>;

    struct ScriptedBackend {
        id: BackendId,
        credentials: bool,
        delay: Duration,
        script: Mutex<VecDeque<Reply>>,
        fallback_reply: Reply,
        calls: AtomicU32,
        seen: Mutex<Vec<InvocationRequest>>,
    }

    impl ScriptedBackend {
        fn always(id: BackendId, reply: Reply) -> Self {
            Self {
                id,
                credentials: true,
                delay: Duration::from_millis(10),
                script: Mutex::new(VecDeque::new()),
                fallback_reply: reply,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn scripted(id: BackendId, script: Vec<Reply>, then: Reply) -> Self {
            let backend = Self::always(id, then);
            *backend.script.lock().unwrap() = script.into();
            backend
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn id(&self) -> BackendId {
            self.id
        }

        fn credentials_configured(&self) -> bool {
            self.credentials
        }

        async fn call(&self, request: &InvocationRequest) -> Result<BackendResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback_reply.clone())
        }
    }

    struct PhasePrompts;

    impl PromptBuilder for PhasePrompts {
        fn build(&self, phase: &str, ctx: &PromptContext) -> Result<String, PromptError> {
            match phase {
                "research" | "debate" => Ok(format!("{phase}: {}", ctx.topic)),
                other => Err(PromptError::UnknownPhase(other.to_string())),
            }
        }

        fn phases(&self) -> &[&'static str] {
            &["research", "debate"]
        }
    }

    fn ok(text: &str) -> Reply {
        Ok(BackendResponse::new(text).with_session_id("sess-1"))
    }

    fn http(status: u16, body: &str) -> Reply {
        Err(BackendError::Http {
            status,
            body: body.to_string(),
        })
    }

    fn orchestrator(config: OrchestratorConfig, backends: &[&Arc<ScriptedBackend>]) -> InvocationOrchestrator {
        let registry = backends.iter().fold(BackendRegistry::new(), |r, b| {
            r.register(Arc::clone(b) as Arc<dyn ModelBackend>)
        });
        InvocationOrchestrator::new(config, registry, Arc::new(PhasePrompts)).unwrap()
    }

    fn ctx() -> PromptContext {
        PromptContext::new("A", "AI regulation", "pro")
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_normalized_without_history() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, ok("{\"claim\": 1}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex]);

        let inv = orch.invoke(BackendId::Codex, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(inv.served_by, BackendId::Codex);
        assert_eq!(inv.outcome.session_id(), Some("sess-1"));
        assert_eq!(inv.outcome.payload().unwrap().strategy(), Some(Strategy::Direct));
        assert!(inv.retry_history.is_empty());
        assert!(!inv.fell_back());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let gemini = Arc::new(ScriptedBackend::scripted(
            BackendId::Gemini,
            vec![http(503, "unavailable"), http(502, "bad gateway")],
            ok("[1, 2]"),
        ));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(gemini.calls(), 3);
        assert_eq!(inv.attempts_on(BackendId::Gemini), 2);
        assert_eq!(inv.retry_history[1].attempt.delay, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn eligible_failure_falls_back_once() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, http(429, "rate limit")));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{\"ok\": true}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex, &claude]);

        let inv = orch.invoke(BackendId::Codex, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(inv.requested_backend, BackendId::Codex);
        assert_eq!(inv.served_by, BackendId::Claude);
        assert_eq!(codex.calls(), 3);
        assert_eq!(inv.attempts_on(BackendId::Codex), 3);
        assert_eq!(inv.fallback_events.len(), 1);

        let event = &inv.fallback_events[0];
        assert_eq!(event.trigger, FallbackTrigger::Failure);
        assert_eq!(event.error_kind, ErrorKind::RateLimit);
        assert_eq!(event.original_backend, BackendId::Codex);
        assert_eq!(event.recovery_latency, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_fallback_is_not_chained() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, http(503, "down")));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, http(529, "overloaded")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex, &claude]);

        let inv = orch.invoke(BackendId::Codex, "debate", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Overloaded));
        assert_eq!(inv.served_by, BackendId::Claude);
        assert_eq!(inv.fallback_events.len(), 1);
        assert_eq!(claude.calls(), 3);
        assert_eq!(inv.retry_history.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_disabled_returns_primary_failure() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, http(503, "down")));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex, &claude]);

        let inv = orch
            .invoke_with_policy(BackendId::Codex, "debate", &ctx(), &FallbackPolicy::disabled())
            .await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::ServiceUnavailable));
        assert_eq!(claude.calls(), 0);
        assert!(!inv.fell_back());
    }

    #[tokio::test(start_paused = true)]
    async fn trusted_primary_never_falls_back_to_itself() {
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, http(503, "down")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&claude]);

        let inv = orch.invoke(BackendId::Claude, "debate", &ctx()).await;
        assert!(!inv.is_success());
        assert_eq!(claude.calls(), 3);
        assert!(!inv.fell_back());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_error_is_fatal() {
        let gemini = Arc::new(ScriptedBackend::always(BackendId::Gemini, http(401, "unauthorized")));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini, &claude]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Auth));
        assert_eq!(gemini.calls(), 1);
        assert_eq!(inv.retry_history.len(), 1);
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_errors_retry_but_do_not_fall_back() {
        let gemini = Arc::new(ScriptedBackend::always(
            BackendId::Gemini,
            Err(BackendError::Decode("unexpected shape".into())),
        ));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini, &claude]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Unknown));
        assert_eq!(gemini.calls(), 3);
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_status_with_digit_laden_body_falls_back() {
        let gemini = Arc::new(ScriptedBackend::always(
            BackendId::Gemini,
            http(503, "upstream error, request_id=req_7f4013ab"),
        ));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini, &claude]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(gemini.calls(), 3);
        assert_eq!(inv.served_by, BackendId::Claude);
        assert_eq!(inv.fallback_events[0].error_kind, ErrorKind::ServiceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_response_body_is_retried_not_fatal() {
        let gemini = Arc::new(ScriptedBackend::scripted(
            BackendId::Gemini,
            vec![Err(BackendError::Decode(
                "missing field `candidates` at line 1 column 401".into(),
            ))],
            ok("{\"ok\": true}"),
        ));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini, &claude]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(gemini.calls(), 2);
        assert_eq!(claude.calls(), 0);
        assert!(inv.retry_history[0].attempt.error.contains("column 401"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_skip_network() {
        let mut gemini = ScriptedBackend::always(BackendId::Gemini, ok("{}"));
        gemini.credentials = false;
        let gemini = Arc::new(gemini);
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&gemini, &claude]);

        let inv = orch.invoke(BackendId::Gemini, "research", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Auth));
        assert!(inv.retry_history.is_empty());
        assert_eq!(gemini.calls(), 0);
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_phase_is_invalid_input() {
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&claude]);

        let inv = orch.invoke(BackendId::Claude, "closing", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::InvalidInput));
        assert_eq!(inv.outcome.error_message(), Some("unknown phase: closing"));
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_backend_is_invalid_input() {
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&claude]);

        let inv = orch.invoke(BackendId::Gemini, "debate", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::InvalidInput));
        assert_eq!(claude.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_individually() {
        let mut codex = ScriptedBackend::always(BackendId::Codex, ok("{}"));
        codex.delay = Duration::from_secs(1_000);
        let codex = Arc::new(codex);
        let config = OrchestratorConfig {
            timeouts: TimeoutTable::default().with_phase("debate", Duration::from_secs(10)),
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(config, &[&codex]);

        let started = Instant::now();
        let inv = orch
            .invoke_with_policy(BackendId::Codex, "debate", &ctx(), &FallbackPolicy::disabled())
            .await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(inv.retry_history.len(), 3);
        // 3 × 10s attempts + 1s + 2s backoff
        assert_eq!(started.elapsed(), Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_overrun_keeps_history() {
        let mut codex = ScriptedBackend::always(BackendId::Codex, http(503, "down"));
        codex.delay = Duration::from_secs(9);
        let codex = Arc::new(codex);
        let mut timeouts = TimeoutTable::default().with_phase("debate", Duration::from_secs(10));
        timeouts.deadline_buffer = Duration::from_secs(5);
        let config = OrchestratorConfig {
            timeouts,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(config, &[&codex]);

        let started = Instant::now();
        let inv = orch
            .invoke_with_policy(BackendId::Codex, "debate", &ctx(), &FallbackPolicy::disabled())
            .await;
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(inv.retry_history.len(), 1);
        assert_eq!(inv.retry_history[0].attempt.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn research_phase_gets_long_budget_and_auto_approve() {
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let orch = orchestrator(OrchestratorConfig::default(), &[&claude]);

        orch.invoke(BackendId::Claude, "research", &ctx()).await;
        orch.invoke(BackendId::Claude, "debate", &ctx()).await;

        let seen = claude.seen.lock().unwrap();
        assert_eq!(seen[0].timeout(), Duration::from_secs(600));
        assert!(seen[0].auto_approve());
        assert_eq!(seen[1].timeout(), Duration::from_secs(300));
        assert!(!seen[1].auto_approve());
        assert_eq!(seen[1].prompt(), "debate: AI regulation");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_primary_is_routed_around() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, ok("{}")));
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{\"via\": \"claude\"}")));
        let health = SessionHealth::from_statuses([BackendHealthStatus::unavailable(
            BackendId::Codex,
            "HTTP 503",
            ErrorKind::ServiceUnavailable,
        )]);
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex, &claude])
            .with_session_health(health);
        let policy = FallbackPolicy {
            route_around_unhealthy_primary: true,
            ..FallbackPolicy::default()
        };

        let inv = orch
            .invoke_with_policy(BackendId::Codex, "debate", &ctx(), &policy)
            .await;
        assert!(inv.is_success());
        assert_eq!(codex.calls(), 0);
        assert_eq!(inv.served_by, BackendId::Claude);
        assert_eq!(inv.fallback_events[0].trigger, FallbackTrigger::PreflightUnhealthy);
        assert_eq!(inv.fallback_events[0].error_kind, ErrorKind::ServiceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_primary_is_still_tried_without_route_around() {
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, ok("{}")));
        let health = SessionHealth::from_statuses([BackendHealthStatus::unavailable(
            BackendId::Codex,
            "HTTP 503",
            ErrorKind::ServiceUnavailable,
        )]);
        let orch = orchestrator(OrchestratorConfig::default(), &[&codex]).with_session_health(health);

        let inv = orch.invoke(BackendId::Codex, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(codex.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_fallback_is_refused_when_required() {
        let mut config = OrchestratorConfig::default();
        config.fallback.fallback_backend = BackendId::Gemini;
        config.fallback.require_healthy_fallback = true;
        let codex = Arc::new(ScriptedBackend::always(BackendId::Codex, http(429, "slow down")));
        let gemini = Arc::new(ScriptedBackend::always(BackendId::Gemini, ok("{}")));
        let health = SessionHealth::from_statuses([BackendHealthStatus::unavailable(
            BackendId::Gemini,
            "quota",
            ErrorKind::Quota,
        )]);
        let orch = orchestrator(config, &[&codex, &gemini]).with_session_health(health);

        let inv = orch.invoke(BackendId::Codex, "debate", &ctx()).await;
        assert_eq!(inv.outcome.error_kind(), Some(ErrorKind::RateLimit));
        assert_eq!(gemini.calls(), 0);
        assert!(!inv.fell_back());
    }

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeouts.for_phase("research"), Duration::from_secs(600));
        assert_eq!(config.timeouts.for_phase("debate"), Duration::from_secs(300));
        assert_eq!(config.timeouts.deadline_for("debate"), Duration::from_secs(360));
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.fallback_backend, BackendId::Claude);
        assert!(!config.fallback.require_healthy_fallback);
    }

    #[test]
    fn huge_deadline_buffer_saturates() {
        let mut timeouts = TimeoutTable::default();
        timeouts.deadline_buffer = Duration::from_secs(u64::MAX - 10);
        assert_eq!(timeouts.deadline_for("debate"), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_with_saturated_deadline_completes() {
        let claude = Arc::new(ScriptedBackend::always(BackendId::Claude, ok("{}")));
        let mut config = OrchestratorConfig::default();
        config.timeouts.deadline_buffer = Duration::from_secs(u64::MAX - 10);
        let orch = orchestrator(config, &[&claude]);

        let inv = orch.invoke(BackendId::Claude, "debate", &ctx()).await;
        assert!(inv.is_success());
        assert_eq!(claude.calls(), 1);
    }

    #[test]
    fn config_from_lookup_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(|key| match key {
            "DEBATE_MAX_ATTEMPTS" => Some("5".into()),
            "DEBATE_RESEARCH_TIMEOUT_SECS" => Some("900".into()),
            "DEBATE_FALLBACK_ENABLED" => Some("false".into()),
            "DEBATE_FALLBACK_BACKEND" => Some("gpt".into()),
            "DEBATE_BASE_DELAY_SECS" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.timeouts.for_phase("research"), Duration::from_secs(900));
        assert!(!config.fallback.enabled);
        assert_eq!(config.fallback.fallback_backend, BackendId::Codex);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.timeouts.phases.insert("debate".into(), 0);
        assert_eq!(
            config.validate(),
            Err(OrchestratorConfigError::ZeroPhaseTimeout("debate".into()))
        );

        let mut config = OrchestratorConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(OrchestratorConfigError::Retry(RetryPolicyError::ZeroAttempts))
        ));

        let registry = BackendRegistry::new();
        assert!(InvocationOrchestrator::new(config, registry, Arc::new(PhasePrompts)).is_err());
    }

    #[test]
    fn config_deserializes_partial_json() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"timeouts": {"default_secs": 120, "phases": {"debate": 90}},
                "fallback": {"fallback_backend": "gemini"}}"#,
        )
        .unwrap();
        assert_eq!(config.timeouts.default_timeout, Duration::from_secs(120));
        assert_eq!(config.timeouts.for_phase("debate"), Duration::from_secs(90));
        assert_eq!(config.timeouts.deadline_buffer, Duration::from_secs(60));
        assert_eq!(config.fallback.fallback_backend, BackendId::Gemini);
        assert!(config.fallback.enabled);
    }
}
