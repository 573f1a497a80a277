//! Invocation results and the history attached to them.
//!
//! An [`Invocation`] is the value every call path of the orchestrator ends
//! in. It never carries a raised error: failure is the
//! [`InvocationOutcome::Failure`] variant, and the retry and fallback
//! history explain how the final result was reached.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendId;
use crate::classifier::ErrorKind;
use crate::normalizer::NormalizedPayload;
use crate::retry::{duration_millis, RetryAttempt};

/// Tagged result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The backend answered. `payload` is the normalized form of `text`.
    Success {
        text: String,
        session_id: Option<String>,
        payload: NormalizedPayload,
    },
    Failure { message: String, kind: ErrorKind },
}

impl InvocationOutcome {
    pub fn failure(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self::Failure {
            message: message.into(),
            kind,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message, .. } => Some(message),
        }
    }

    pub fn payload(&self) -> Option<&NormalizedPayload> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Success { session_id, .. } => session_id.as_deref(),
            Self::Failure { .. } => None,
        }
    }
}

/// What caused the orchestrator to switch backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTrigger {
    /// The primary failed with a fallback-eligible error.
    Failure,
    /// The session health probe already marked the primary unavailable.
    PreflightUnhealthy,
}

/// Append-only record of a backend switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub phase: String,
    pub original_backend: BackendId,
    pub fallback_backend: BackendId,
    pub trigger: FallbackTrigger,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    /// Time spent obtaining the fallback backend's result.
    #[serde(rename = "recovery_latency_ms", with = "duration_millis")]
    pub recovery_latency: Duration,
}

/// A [`RetryAttempt`] tagged with the backend it was made against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend: BackendId,
    #[serde(flatten)]
    pub attempt: RetryAttempt,
}

/// Complete, self-explaining result of `InvocationOrchestrator::invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: Uuid,
    pub phase: String,
    /// Backend the caller asked for.
    pub requested_backend: BackendId,
    /// Backend that produced `outcome`.
    pub served_by: BackendId,
    pub outcome: InvocationOutcome,
    pub retry_history: Vec<AttemptRecord>,
    pub fallback_events: Vec<FallbackEvent>,
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
}

impl Invocation {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn fell_back(&self) -> bool {
        !self.fallback_events.is_empty()
    }

    /// Failed attempts made against `backend`.
    pub fn attempts_on(&self, backend: BackendId) -> usize {
        self.retry_history
            .iter()
            .filter(|r| r.backend == backend)
            .count()
    }
}
