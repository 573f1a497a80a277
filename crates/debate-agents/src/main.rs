use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::{
    BackendId, ErrorKind, HealthProber, InvocationOrchestrator, PromptContext,
};
use debate_agents::config::AgentConfig;
use debate_agents::credentials;
use debate_agents::diagnostics;
use debate_agents::prompts::{DebatePromptBuilder, DEFAULT_CONSTRAINTS};
use debate_agents::providers;
use debate_agents::{PhaseExecutor, PhaseRequest};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

/// Run one debater turn against an LLM provider, with retry and automatic fallback.
#[derive(Parser, Debug)]
#[command(name = "debate-agents", version)]
struct Cli {
    /// LLM provider: claude, gpt, codex or gemini
    #[arg(long)]
    provider: Option<String>,

    /// Debater role: A, B or C
    #[arg(long)]
    role: Option<String>,

    /// Debate stage: research, preparation or debate
    #[arg(long, alias = "phase")]
    stage: Option<String>,

    /// Debate topic
    #[arg(long)]
    topic: Option<String>,

    /// Debater's viewpoint
    #[arg(long)]
    viewpoint: Option<String>,

    /// Round number (debate stage)
    #[arg(long, default_value = "1")]
    round: String,

    /// Is this the final round?
    #[arg(long)]
    is_final: bool,

    /// Position in the speaking order (1-indexed)
    #[arg(long)]
    speaker_order: Option<String>,

    /// Own research results (JSON)
    #[arg(long, default_value = "")]
    own_research: String,

    /// Opponent research (JSON)
    #[arg(long, default_value = "")]
    opponent_research: String,

    /// Preparation results (JSON)
    #[arg(long, default_value = "")]
    preparation: String,

    /// Previous debate history
    #[arg(long, default_value = "")]
    debate_history: String,

    /// Action constraints
    #[arg(long, default_value = DEFAULT_CONSTRAINTS)]
    constraints: String,

    /// Enable fallback to the configured fallback provider
    #[arg(long, overrides_with = "no_fallback")]
    fallback: bool,

    /// Disable provider fallback
    #[arg(long, overrides_with = "fallback")]
    no_fallback: bool,

    /// Probe provider health first and route around an unhealthy provider
    #[arg(long)]
    probe: bool,

    /// TOML configuration file (defaults + DEBATE_* env vars otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Check runtime, HTTP client and backend registration, then exit
    #[arg(long)]
    validate_deps: bool,

    /// Report which providers have API keys configured, then exit
    #[arg(long)]
    validate_api_key: bool,
}

const ROLES: [&str; 3] = ["A", "B", "C"];

/// Validation failure detected before any provider call.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct PreflightError {
    message: String,
    kind: ErrorKind,
}

impl PreflightError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

#[derive(Serialize)]
struct ErrorReport {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
}

/// What the process prints on stdout and the code it exits with.
#[derive(Debug)]
struct RunOutput {
    report: Value,
    exit_code: u8,
}

impl RunOutput {
    fn new<T: Serialize>(report: &T, ok: bool) -> Self {
        let report = serde_json::to_value(report).unwrap_or_else(|e| {
            json!({"success": false, "error": format!("failed to serialize output: {e}")})
        });
        Self {
            report,
            exit_code: if ok { 0 } else { 1 },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let output = run(Cli::parse(), |var| std::env::var(var).ok()).await;
    match serde_json::to_string_pretty(&output.report) {
        Ok(json) => println!("{json}"),
        Err(e) => println!("{{\"success\": false, \"error\": \"failed to serialize output: {e}\"}}"),
    }
    ExitCode::from(output.exit_code)
}

/// Pre-flight failures exit 1 with an error object; any produced phase
/// report exits 0, whether or not the phase succeeded.
async fn run(cli: Cli, lookup: impl Fn(&str) -> Option<String> + Copy) -> RunOutput {
    match execute(cli, lookup).await {
        Ok(output) => output,
        Err(e) => {
            let kind = e.downcast_ref::<PreflightError>().map(|p| p.kind);
            tracing::error!(error = %format!("{e:#}"), "pre-flight validation failed");
            RunOutput::new(
                &ErrorReport {
                    success: false,
                    error: format!("{e:#}"),
                    error_kind: kind,
                },
                false,
            )
        }
    }
}

fn parse_provider(token: Option<&str>) -> Result<Option<BackendId>, PreflightError> {
    token
        .map(|t| {
            t.parse::<BackendId>()
                .map_err(|e| PreflightError::new(ErrorKind::InvalidInput, e.to_string()))
        })
        .transpose()
}

fn parse_role(token: Option<&str>) -> Result<String, PreflightError> {
    let token = require(token, "role")?;
    let role = token.trim().to_ascii_uppercase();
    if ROLES.contains(&role.as_str()) {
        Ok(role)
    } else {
        Err(PreflightError::new(
            ErrorKind::InvalidInput,
            format!("invalid --role {token:?}: expected one of {}", ROLES.join(", ")),
        ))
    }
}

/// 1-based counters such as `--round` and `--speaker-order`.
fn parse_ordinal(value: &str, flag: &str) -> Result<u32, PreflightError> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| {
            PreflightError::new(
                ErrorKind::InvalidInput,
                format!("--{flag} must be a positive integer, got {value:?}"),
            )
        })
}

fn require<'a>(value: Option<&'a str>, flag: &str) -> Result<&'a str, PreflightError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PreflightError::new(ErrorKind::InvalidInput, format!("missing required argument --{flag}")))
}

/// Context blobs documented as JSON must parse as JSON when present.
fn check_json_blob(value: &str, flag: &str) -> Result<(), PreflightError> {
    if value.trim().is_empty() {
        return Ok(());
    }
    serde_json::from_str::<serde_json::Value>(value)
        .map(|_| ())
        .map_err(|e| PreflightError::new(ErrorKind::InvalidInput, format!("--{flag} is not valid JSON: {e}")))
}

async fn execute(cli: Cli, lookup: impl Fn(&str) -> Option<String> + Copy) -> Result<RunOutput> {
    let provider = parse_provider(cli.provider.as_deref())?;

    if cli.validate_api_key {
        let report = diagnostics::validate_api_keys(provider, lookup);
        return Ok(RunOutput::new(&report, report.ok));
    }

    let config = AgentConfig::load(cli.config.as_deref(), lookup)
        .context("failed to load configuration")?;

    if cli.validate_deps {
        let report = diagnostics::validate_dependencies(&config);
        return Ok(RunOutput::new(&report, report.ok));
    }

    let backend = provider.ok_or_else(|| {
        PreflightError::new(ErrorKind::InvalidInput, "missing required argument --provider")
    })?;
    let role = parse_role(cli.role.as_deref())?;
    let round = parse_ordinal(&cli.round, "round")?;
    let speaker_order = cli
        .speaker_order
        .as_deref()
        .map(|v| parse_ordinal(v, "speaker-order"))
        .transpose()?;
    let stage = require(cli.stage.as_deref(), "stage")?;
    let topic = require(cli.topic.as_deref(), "topic")?;
    let viewpoint = require(cli.viewpoint.as_deref(), "viewpoint")?;
    check_json_blob(&cli.own_research, "own-research")?;
    check_json_blob(&cli.opponent_research, "opponent-research")?;
    check_json_blob(&cli.preparation, "preparation")?;

    if credentials::resolve_with(backend, lookup).is_none() {
        return Err(PreflightError::new(
            ErrorKind::Auth,
            format!(
                "no API key configured for {backend} (checked: {})",
                credentials::env_vars(backend).join(", ")
            ),
        )
        .into());
    }

    let http = providers::http_client().context("failed to build HTTP client")?;
    let registry = providers::build_registry(&http, &config.providers, lookup);

    let mut policy = config.orchestrator.fallback.clone();
    if cli.fallback {
        policy.enabled = true;
    }
    if cli.no_fallback {
        policy.enabled = false;
    }

    let mut orchestrator = InvocationOrchestrator::new(
        config.orchestrator.clone(),
        registry.clone(),
        Arc::new(DebatePromptBuilder::new()),
    )
    .context("invalid orchestrator configuration")?;

    if cli.probe {
        let prober = HealthProber::new(registry, config.health.clone());
        let mut targets = vec![backend];
        if policy.enabled && policy.fallback_backend != backend {
            targets.push(policy.fallback_backend);
        }
        let health = prober.probe_all(&targets).await;
        for status in health.statuses() {
            info!(backend = %status.backend, available = status.available, "probe result");
        }
        orchestrator = orchestrator.with_session_health(health);
        policy.route_around_unhealthy_primary = true;
    }

    let context = PromptContext {
        round,
        is_final: cli.is_final,
        speaker_order,
        own_research: cli.own_research,
        opponent_research: cli.opponent_research,
        preparation: cli.preparation,
        debate_history: cli.debate_history,
        constraints: cli.constraints,
        ..PromptContext::new(role.as_str(), topic, viewpoint)
    };

    info!(provider = %backend, role = %role, stage, "debater starting");
    let executor = PhaseExecutor::new(orchestrator);
    let request = PhaseRequest::new(backend, stage, context).with_fallback(policy);
    let report = executor.execute(&request).await;

    Ok(RunOutput::new(&report, true))
}
