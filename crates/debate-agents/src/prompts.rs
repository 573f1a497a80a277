//! Debate prompt templates.
//!
//! Three phases, each asking for a JSON reply:
//! - `research`: thesis, evidence, weaknesses
//! - `preparation`: attacks, supports and defenses against opponents
//! - `debate`: one round of actions, with a final-round notice when needed

use coordination::{PromptBuilder, PromptContext, PromptError};

pub const RESEARCH: &str = "research";
pub const PREPARATION: &str = "preparation";
pub const DEBATE: &str = "debate";

pub const PHASES: [&str; 3] = [RESEARCH, PREPARATION, DEBATE];

/// Used when the caller leaves `constraints` empty.
pub const DEFAULT_CONSTRAINTS: &str = "attack, support, defend all allowed";

const FINAL_ROUND_NOTICE: &str =
    "\nTHIS IS THE FINAL ROUND. Make your strongest case and propose consensus points.\n";

#[derive(Debug, Clone, Copy, Default)]
pub struct DebatePromptBuilder;

impl DebatePromptBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl PromptBuilder for DebatePromptBuilder {
    fn build(&self, phase: &str, ctx: &PromptContext) -> Result<String, PromptError> {
        if ctx.topic.trim().is_empty() {
            return Err(PromptError::InvalidContext("topic must not be empty".into()));
        }
        match phase {
            RESEARCH => Ok(research(ctx)),
            PREPARATION => Ok(preparation(ctx)),
            DEBATE => Ok(debate(ctx)),
            other => Err(PromptError::UnknownPhase(other.to_string())),
        }
    }

    fn phases(&self) -> &[&'static str] {
        &PHASES
    }
}

fn header(ctx: &PromptContext) -> String {
    let mut header = format!(
        "You are Debater {role} with viewpoint: {viewpoint}\n\nTopic: {topic}\n",
        role = ctx.role,
        viewpoint = ctx.viewpoint,
        topic = ctx.topic,
    );
    if let Some(order) = ctx.speaker_order {
        header.push_str(&format!("Speaking order: you speak in position {order}.\n"));
    }
    header
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        "(none)"
    } else {
        text
    }
}

fn research(ctx: &PromptContext) -> String {
    format!(
        r#"{header}
STAGE: RESEARCH

Your task:
1. Gather evidence supporting your viewpoint
2. Identify key arguments and counterarguments
3. Note potential weaknesses in your position

Output your findings in JSON format:
{{
    "viewpoint": "{viewpoint}",
    "core_thesis": "Your main argument in one sentence",
    "evidence": [
        {{"type": "research|statistics|expert|logic", "content": "...", "source": "..."}}
    ],
    "potential_weaknesses": ["weakness1", "weakness2"]
}}

Be thorough but concise. Focus on quality arguments over quantity."#,
        header = header(ctx),
        viewpoint = ctx.viewpoint,
    )
}

fn preparation(ctx: &PromptContext) -> String {
    format!(
        r#"{header}
STAGE: PREPARATION

Your research: {own}

Opponent research:
{opponents}

Your task:
1. Analyze opponents' arguments for weaknesses
2. Prepare attack points against each opponent
3. Identify potential allies for support
4. Prepare defenses against expected attacks

Output in JSON format:
{{
    "attacks": [
        {{"target": "A|B|C", "point": "...", "strategy": "logical_flaw|weak_evidence|counterexample"}}
    ],
    "supports": [
        {{"target": "A|B|C", "point": "...", "reason": "..."}}
    ],
    "defense_prep": [
        {{"anticipated_attack": "...", "defense": "..."}}
    ]
}}"#,
        header = header(ctx),
        own = or_none(&ctx.own_research),
        opponents = or_none(&ctx.opponent_research),
    )
}

fn debate(ctx: &PromptContext) -> String {
    let constraints = if ctx.constraints.trim().is_empty() {
        DEFAULT_CONSTRAINTS
    } else {
        ctx.constraints.as_str()
    };
    format!(
        r#"{header}
STAGE: DEBATE - Round {round}
{notice}
Your preparation: {preparation}

Debate history so far:
{history}

Constraints: {constraints}

Your task:
1. Analyze the current debate state
2. Choose your action (attack/support/defend)
3. Make your argument clearly and persuasively

Output in JSON format:
{{
    "round": {round},
    "speaker": "{role}",
    "actions": [
        {{
            "type": "attack|support|defend",
            "target": "A|B|C",
            "content": "Your argument in markdown format",
            "key_point": "One-sentence summary"
        }}
    ],
    "stance_summary": "Your current position after this round",
    "consensus_proposal": "If final round, propose what you can agree on"
}}

Be assertive but respectful. Attack ideas, not personalities."#,
        header = header(ctx),
        round = ctx.round,
        notice = if ctx.is_final { FINAL_ROUND_NOTICE } else { "" },
        preparation = or_none(&ctx.preparation),
        history = or_none(&ctx.debate_history),
        role = ctx.role,
    )
}
