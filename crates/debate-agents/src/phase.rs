//! Phase executor: context in, report out.
//!
//! No retry or fallback logic lives here. The executor hands the phase and
//! its context to the [`InvocationOrchestrator`] and flattens the resulting
//! [`Invocation`] into the [`PhaseReport`] the CLI prints.

use coordination::{
    AttemptRecord, BackendId, ErrorKind, FallbackEvent, FallbackPolicy, Invocation,
    InvocationOrchestrator, InvocationOutcome, PromptContext, Strategy,
};
use serde::Serialize;
use serde_json::Value;

/// One debater turn to execute.
#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub backend: BackendId,
    pub phase: String,
    pub context: PromptContext,
    /// Overrides the orchestrator's configured policy when set.
    pub fallback: Option<FallbackPolicy>,
}

impl PhaseRequest {
    pub fn new(backend: BackendId, phase: impl Into<String>, context: PromptContext) -> Self {
        Self {
            backend,
            phase: phase.into(),
            context,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = Some(policy);
        self
    }
}

/// How the reply text became `result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Normalization {
    pub parsed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

/// Serializable summary of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub success: bool,
    pub provider: BackendId,
    pub served_by: BackendId,
    pub role: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<Normalization>,
    pub retries: Vec<AttemptRecord>,
    pub fallbacks: Vec<FallbackEvent>,
    pub invocation_id: String,
    pub elapsed_ms: u64,
}

impl PhaseReport {
    pub fn from_invocation(role: &str, invocation: Invocation) -> Self {
        let Invocation {
            invocation_id,
            phase,
            requested_backend,
            served_by,
            outcome,
            retry_history,
            fallback_events,
            elapsed,
        } = invocation;

        let mut report = Self {
            success: outcome.is_success(),
            provider: requested_backend,
            served_by,
            role: role.to_string(),
            stage: phase,
            result: None,
            error: None,
            error_kind: None,
            session_id: None,
            normalization: None,
            retries: retry_history,
            fallbacks: fallback_events,
            invocation_id: invocation_id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        };

        match outcome {
            InvocationOutcome::Success {
                session_id,
                payload,
                ..
            } => {
                report.result = Some(payload.to_value());
                report.session_id = session_id;
                report.normalization = Some(Normalization {
                    parsed: payload.is_parsed(),
                    strategy: payload.strategy(),
                });
            }
            InvocationOutcome::Failure { message, kind } => {
                report.error = Some(message);
                report.error_kind = Some(kind);
            }
        }
        report
    }
}

/// Runs debate phases through the orchestrator.
#[derive(Debug, Clone)]
pub struct PhaseExecutor {
    orchestrator: InvocationOrchestrator,
}

impl PhaseExecutor {
    pub fn new(orchestrator: InvocationOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &InvocationOrchestrator {
        &self.orchestrator
    }

    pub async fn execute(&self, request: &PhaseRequest) -> PhaseReport {
        let ctx = &request.context;
        let invocation = match &request.fallback {
            Some(policy) => {
                self.orchestrator
                    .invoke_with_policy(request.backend, &request.phase, ctx, policy)
                    .await
            }
            None => {
                self.orchestrator
                    .invoke(request.backend, &request.phase, ctx)
                    .await
            }
        };
        PhaseReport::from_invocation(&ctx.role, invocation)
    }
}
