//! Error classification for backend failures.
//!
//! Maps a raw provider error message onto [`ErrorKind`] by case-insensitive
//! matching against ordered pattern groups. The first group that matches
//! wins. Status-code markers only match as whole numbers, so `401` inside a
//! request id or a serde column number is ignored.
//!
//! Typed [`BackendError`]s go through [`classify_backend_error`] instead: an
//! HTTP status decides the kind before the body is inspected, and decode
//! failures are `unknown` unless the provider reported a refusal.
//!
//! ## Kinds
//!
//! | Kind                  | Retried | Triggers fallback |
//! |-----------------------|---------|-------------------|
//! | `rate_limit`          | yes     | yes               |
//! | `quota`               | yes     | yes               |
//! | `timeout`             | yes     | yes               |
//! | `service_unavailable` | yes     | yes               |
//! | `overloaded`          | yes     | yes               |
//! | `unknown`             | yes     | no                |
//! | `auth`                | no      | no                |
//! | `invalid_input`       | no      | no                |
//! | `content_policy`      | no      | no                |

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::outcome::InvocationOutcome;

/// Taxonomy of invocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Quota,
    Timeout,
    ServiceUnavailable,
    Overloaded,
    Auth,
    InvalidInput,
    ContentPolicy,
    Unknown,
}

impl ErrorKind {
    /// Kinds that justify switching to another backend.
    pub fn is_fallback_eligible(self) -> bool {
        matches!(
            self,
            Self::RateLimit
                | Self::Quota
                | Self::Timeout
                | Self::ServiceUnavailable
                | Self::Overloaded
        )
    }

    /// Kinds that no retry or fallback can fix.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Auth | Self::InvalidInput | Self::ContentPolicy)
    }

    /// Whether the retry executor may try again after this kind.
    pub fn is_retryable(self) -> bool {
        !self.is_fatal()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Quota => write!(f, "quota"),
            Self::Timeout => write!(f, "timeout"),
            Self::ServiceUnavailable => write!(f, "service_unavailable"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Auth => write!(f, "auth"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::ContentPolicy => write!(f, "content_policy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// Credential markers are unambiguous, so they are checked ahead of the
// fallback-eligible groups. Generic words like "invalid" are not.
const AUTH_PATTERNS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "invalid key",
    "invalid api key",
    "invalid_api_key",
    "invalid x-api-key",
    "api key not valid",
    "authentication",
    "permission denied",
    "permission_denied",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "rate-limit",
    "429",
    "too many requests",
];

const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "insufficient_quota",
    "resource_exhausted",
    "resource exhausted",
    "billing",
    "credit balance",
    "usage limit",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "time out",
    "deadline exceeded",
    "deadline_exceeded",
    "504",
];

const SERVICE_UNAVAILABLE_PATTERNS: &[&str] = &[
    "service unavailable",
    "service_unavailable",
    "unavailable",
    "503",
    "502",
    "bad gateway",
    "connection refused",
    "connection reset",
    "connection closed",
    "error sending request",
];

const OVERLOADED_PATTERNS: &[&str] = &[
    "overloaded",
    "overload",
    "529",
    "over capacity",
    "at capacity",
    "server busy",
];

const INVALID_INPUT_PATTERNS: &[&str] = &[
    "400",
    "bad request",
    "invalid request",
    "invalid_request",
    "invalid argument",
    "invalid_argument",
    "unknown phase",
    "malformed",
    "invalid",
    "too long",
    "context length",
];

const CONTENT_POLICY_PATTERNS: &[&str] = &[
    "content policy",
    "content_policy",
    "content filter",
    "content_filter",
    "safety",
    "moderation",
    "flagged",
    "blocked",
];

/// Ordered pattern groups. The first group with a matching substring wins.
const PATTERN_GROUPS: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Auth, AUTH_PATTERNS),
    (ErrorKind::RateLimit, RATE_LIMIT_PATTERNS),
    (ErrorKind::Quota, QUOTA_PATTERNS),
    (ErrorKind::Timeout, TIMEOUT_PATTERNS),
    (ErrorKind::ServiceUnavailable, SERVICE_UNAVAILABLE_PATTERNS),
    (ErrorKind::Overloaded, OVERLOADED_PATTERNS),
    (ErrorKind::InvalidInput, INVALID_INPUT_PATTERNS),
    (ErrorKind::ContentPolicy, CONTENT_POLICY_PATTERNS),
];

/// One compiled alternation per group, in `PATTERN_GROUPS` order.
static GROUP_MATCHERS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    PATTERN_GROUPS
        .iter()
        .map(|(kind, patterns)| {
            let alternation = patterns
                .iter()
                .map(|p| {
                    let escaped = regex::escape(p);
                    if p.bytes().all(|b| b.is_ascii_digit()) {
                        format!(r"\b{escaped}\b")
                    } else {
                        escaped
                    }
                })
                .collect::<Vec<_>>()
                .join("|");
            let matcher = Regex::new(&format!("(?i){alternation}"))
                .expect("classifier patterns are valid regex");
            (*kind, matcher)
        })
        .collect()
});

fn matches_group(kind: ErrorKind, message: &str) -> bool {
    GROUP_MATCHERS
        .iter()
        .any(|(k, matcher)| *k == kind && matcher.is_match(message))
}

/// Classify a raw error message.
pub fn classify(message: &str) -> ErrorKind {
    GROUP_MATCHERS
        .iter()
        .find(|(_, matcher)| matcher.is_match(message))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Kind implied by an HTTP status alone, for statuses that are unambiguous.
fn status_kind(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Auth),
        429 => Some(ErrorKind::RateLimit),
        408 | 504 => Some(ErrorKind::Timeout),
        502 | 503 => Some(ErrorKind::ServiceUnavailable),
        529 => Some(ErrorKind::Overloaded),
        _ => None,
    }
}

/// Classify a typed backend failure.
///
/// - `Http`: the status wins; other statuses fall back to the body text, and
///   an unrecognized 400/404/413/422 is `invalid_input`.
/// - `Decode`: `content_policy` for refusals and safety blocks, else `unknown`.
/// - `Transport`: the message text.
pub fn classify_backend_error(err: &BackendError) -> ErrorKind {
    match err {
        BackendError::Timeout(_) => ErrorKind::Timeout,
        BackendError::MissingCredentials(_) => ErrorKind::Auth,
        BackendError::Http { status, body } => {
            status_kind(*status).unwrap_or_else(|| match classify(body) {
                ErrorKind::Unknown if matches!(*status, 400 | 404 | 413 | 422) => {
                    ErrorKind::InvalidInput
                }
                kind => kind,
            })
        }
        BackendError::Transport(message) => classify(message),
        BackendError::Decode(message) if matches_group(ErrorKind::ContentPolicy, message) => {
            ErrorKind::ContentPolicy
        }
        BackendError::Decode(_) => ErrorKind::Unknown,
    }
}

/// Whether an outcome should trigger a switch to the fallback backend.
///
/// Only a `Failure` whose kind is fallback-eligible qualifies. The kind was
/// fixed when the failure was classified, so the message is not re-read.
pub fn should_fallback(outcome: &InvocationOutcome) -> bool {
    match outcome {
        InvocationOutcome::Success { .. } => false,
        InvocationOutcome::Failure { kind, .. } => kind.is_fallback_eligible(),
    }
}
