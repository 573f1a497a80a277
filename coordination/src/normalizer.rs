//! Response normalization.
//!
//! Model output is not guaranteed to be well-formed JSON. [`normalize`] runs
//! a cascade of transform-then-parse strategies and stops at the first one
//! that yields a JSON object or array:
//!
//! ```text
//! direct                   parse the trimmed text as-is
//! extract                  ```json blocks → other ``` blocks → balanced {...} spans
//! extract_trailing_commas  extract + drop `,` before `}` / `]`
//! extract_quoted_keys      extract + drop trailing commas + quote bare keys
//! ```
//!
//! Extraction strategies try every candidate span in that order; the first
//! one that parses wins. Repairs never touch the inside of string literals.
//!
//! When every strategy fails the caller still gets a payload: the raw text,
//! the last parse error and the ordered list of strategies tried.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("trailing comma pattern"));

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_\-]*)(\s*):"#).expect("bare key pattern")
});

/// Recovery strategy, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    Extract,
    ExtractTrailingCommas,
    ExtractQuotedKeys,
}

impl Strategy {
    pub const CASCADE: [Strategy; 4] = [
        Strategy::Direct,
        Strategy::Extract,
        Strategy::ExtractTrailingCommas,
        Strategy::ExtractQuotedKeys,
    ];

    /// Whether this strategy works on an extracted span rather than the full text.
    pub fn is_extraction(self) -> bool {
        !matches!(self, Self::Direct)
    }

    fn repair(self, candidate: &str) -> String {
        match self {
            Self::Direct => candidate.trim().to_string(),
            Self::Extract => candidate.to_string(),
            Self::ExtractTrailingCommas => strip_trailing_commas(candidate),
            Self::ExtractQuotedKeys => quote_bare_keys(&strip_trailing_commas(candidate)),
        }
    }

    /// Parse the full text, or each extracted candidate in turn.
    fn attempt(self, text: &str, candidates: &[&str]) -> Result<Value, String> {
        if !self.is_extraction() {
            return parse_structured(&self.repair(text));
        }
        let mut last_error = "no fenced block or balanced braces found".to_string();
        for candidate in candidates {
            match parse_structured(&self.repair(candidate)) {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Extract => write!(f, "extract"),
            Self::ExtractTrailingCommas => write!(f, "extract_trailing_commas"),
            Self::ExtractQuotedKeys => write!(f, "extract_quoted_keys"),
        }
    }
}

/// Result of normalizing one model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NormalizedPayload {
    /// A strategy produced a JSON object or array.
    Parsed { value: Value, strategy: Strategy },
    /// Every strategy failed; the raw text is preserved.
    Raw {
        raw_response: String,
        parse_error: String,
        strategies_attempted: Vec<Strategy>,
    },
}

impl NormalizedPayload {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed { .. })
    }

    /// Strategy that succeeded, if any.
    pub fn strategy(&self) -> Option<Strategy> {
        match self {
            Self::Parsed { strategy, .. } => Some(*strategy),
            Self::Raw { .. } => None,
        }
    }

    /// The value handed to callers: the parsed structure, or the raw wrapper
    /// object `{raw_response, parse_error, strategies_attempted}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Parsed { value, .. } => value.clone(),
            Self::Raw {
                raw_response,
                parse_error,
                strategies_attempted,
            } => serde_json::json!({
                "raw_response": raw_response,
                "parse_error": parse_error,
                "strategies_attempted": strategies_attempted,
            }),
        }
    }
}

/// Recover structured data from free-form model output. Never fails.
pub fn normalize(text: &str) -> NormalizedPayload {
    let mut attempted = Vec::with_capacity(Strategy::CASCADE.len());
    let mut last_error = String::new();
    let candidates = extraction_candidates(text);

    for strategy in Strategy::CASCADE {
        attempted.push(strategy);
        match strategy.attempt(text, &candidates) {
            Ok(value) => {
                tracing::debug!(%strategy, "response normalized");
                return NormalizedPayload::Parsed { value, strategy };
            }
            Err(e) => {
                tracing::debug!(%strategy, error = %e, "normalization strategy failed");
                last_error = format!("{strategy}: {e}");
            }
        }
    }

    tracing::warn!(
        strategies = attempted.len(),
        error = %last_error,
        "response could not be normalized; returning raw text"
    );
    NormalizedPayload::Raw {
        raw_response: text.to_string(),
        parse_error: last_error,
        strategies_attempted: attempted,
    }
}

fn parse_structured(candidate: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Ok(value),
        Ok(_) => Err("parsed value is not an object or array".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Candidate JSON spans in preference order: ```json blocks, other fenced
/// blocks, then top-level balanced `{...}` spans. Duplicates are dropped.
fn extraction_candidates(text: &str) -> Vec<&str> {
    let blocks = fenced_blocks(text);
    let labeled = blocks
        .iter()
        .filter(|(info, _)| info.eq_ignore_ascii_case("json"))
        .map(|(_, body)| *body);
    let unlabeled = blocks
        .iter()
        .filter(|(info, _)| !info.eq_ignore_ascii_case("json"))
        .map(|(_, body)| *body);

    let mut candidates: Vec<&str> = Vec::new();
    for candidate in labeled.chain(unlabeled).chain(balanced_spans(text)) {
        if !candidate.is_empty() && !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Every closed fence as `(info string, trimmed body)`. Scanning stops at
/// an unterminated fence.
fn fenced_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let line_end = after_fence.find('\n').unwrap_or(after_fence.len());
        let info = after_fence[..line_end].trim();
        let body_start = (line_end + 1).min(after_fence.len());
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push((info, body[..close].trim()));
        rest = &body[close + 3..];
    }
    blocks
}

fn balanced_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some((start, end)) = balanced_braces(&text[offset..]) {
        spans.push(&text[offset + start..offset + end]);
        offset += end;
    }
    spans
}

/// Depth-counted scan for the first balanced `{...}` span, as a byte range.
/// Braces inside string literals are ignored.
fn balanced_braces(text: &str) -> Option<(usize, usize)> {
    let mut start = None;
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if start.is_some() => in_string = true,
            '{' => {
                if start.is_none() {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| (s, idx + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Apply `pattern` only to the text between JSON string literals.
fn replace_outside_strings(candidate: &str, pattern: &Regex, replacement: &str) -> String {
    let mut out = String::with_capacity(candidate.len());
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in candidate.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => {
                    in_string = false;
                    out.push_str(&candidate[segment_start..=idx]);
                    segment_start = idx + 1;
                }
                _ => {}
            }
        } else if ch == '"' {
            out.push_str(&pattern.replace_all(&candidate[segment_start..idx], replacement));
            in_string = true;
            segment_start = idx;
        }
    }

    let tail = &candidate[segment_start..];
    if in_string {
        out.push_str(tail);
    } else {
        out.push_str(&pattern.replace_all(tail, replacement));
    }
    out
}

fn strip_trailing_commas(candidate: &str) -> String {
    replace_outside_strings(candidate, &TRAILING_COMMA, "$1")
}

fn quote_bare_keys(candidate: &str) -> String {
    replace_outside_strings(candidate, &BARE_KEY, r#"$1"$2"$3:"#)
}
