//! Resilient provider invocation for multi-model debates.
//!
//! This library provides:
//! - A uniform [`ModelBackend`] seam and a [`BackendRegistry`] of providers
//! - Error classification into retryable, fallback-eligible and fatal kinds
//! - Bounded exponential-backoff retry with an explicit retryable/fatal split
//! - Canary health probes run once per debate session
//! - Defensive normalization of semi-structured model output
//! - The [`InvocationOrchestrator`], which composes all of the above and
//!   always returns a complete [`Invocation`]
//!
//! # Usage
//!
//! ```ignore
//! let orchestrator = InvocationOrchestrator::new(config, registry, prompts)?;
//! let invocation = orchestrator.invoke(BackendId::Codex, "research", &ctx).await;
//! match &invocation.outcome {
//!     InvocationOutcome::Success { payload, .. } => println!("{}", payload.to_value()),
//!     InvocationOutcome::Failure { kind, message } => eprintln!("{kind}: {message}"),
//! }
//! ```

pub mod backend;
pub mod classifier;
pub mod health;
pub mod normalizer;
pub mod orchestrator;
pub mod outcome;
pub mod prompt;
pub mod retry;

pub use backend::{
    BackendError, BackendId, BackendRegistry, BackendResponse, InvocationRequest, ModelBackend,
    ModelTier, RegistryError, UnknownBackend,
};
pub use classifier::{classify, classify_backend_error, should_fallback, ErrorKind};
pub use health::{BackendHealthStatus, HealthConfig, HealthProber, SessionHealth, CANARY_PROMPT};
pub use normalizer::{normalize, NormalizedPayload, Strategy};
pub use orchestrator::{
    FallbackPolicy, InvocationOrchestrator, OrchestratorConfig, OrchestratorConfigError,
    TimeoutTable,
};
pub use outcome::{AttemptRecord, FallbackEvent, FallbackTrigger, Invocation, InvocationOutcome};
pub use prompt::{PromptBuilder, PromptContext, PromptError};
pub use retry::{
    run_with_retry, AttemptError, Retried, RetryAttempt, RetryFailure, RetryPolicy,
    RetryPolicyError, StopReason,
};
