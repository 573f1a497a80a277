//! Prompt builder seam.
//!
//! The orchestrator never knows what a phase's prompt says. It hands the
//! phase name and a [`PromptContext`] to a [`PromptBuilder`] and treats any
//! error as fatal: retrying cannot fix a bad phase name.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque per-phase context, filled in by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptContext {
    pub role: String,
    pub topic: String,
    pub viewpoint: String,
    pub round: u32,
    pub is_final: bool,
    /// Position of this debater in the speaking order (1-indexed).
    pub speaker_order: Option<u32>,
    pub own_research: String,
    pub opponent_research: String,
    pub preparation: String,
    pub debate_history: String,
    pub constraints: String,
}

impl PromptContext {
    pub fn new(
        role: impl Into<String>,
        topic: impl Into<String>,
        viewpoint: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            topic: topic.into(),
            viewpoint: viewpoint.into(),
            round: 1,
            ..Self::default()
        }
    }

    pub fn with_round(mut self, round: u32, is_final: bool) -> Self {
        self.round = round;
        self.is_final = is_final;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("invalid prompt context: {0}")]
    InvalidContext(String),
}

/// Turns a phase name plus context into prompt text.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, phase: &str, ctx: &PromptContext) -> Result<String, PromptError>;

    /// Phase names this builder accepts.
    fn phases(&self) -> &[&'static str];
}
