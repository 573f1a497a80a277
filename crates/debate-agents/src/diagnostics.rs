//! `--validate-deps` and `--validate-api-key` checks.
//!
//! Both print a structured object and map to exit code 0 (pass) or 1 (fail).

use coordination::{BackendId, PromptBuilder};
use serde::Serialize;

use crate::config::AgentConfig;
use crate::credentials::CredentialReport;
use crate::prompts::DebatePromptBuilder;
use crate::providers;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, result: Result<String, String>) -> Self {
        match result {
            Ok(detail) => Self {
                name,
                ok: true,
                detail,
            },
            Err(detail) => Self {
                name,
                ok: false,
                detail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub ok: bool,
    pub checks: Vec<Check>,
}

/// Check that everything needed to run a phase can be constructed.
pub fn validate_dependencies(config: &AgentConfig) -> DependencyReport {
    let mut checks = vec![Check::new(
        "tokio_runtime",
        tokio::runtime::Handle::try_current()
            .map(|h| format!("{:?} runtime available", h.runtime_flavor()))
            .map_err(|e| e.to_string()),
    )];

    checks.push(Check::new(
        "config",
        config
            .validate()
            .map(|_| "configuration valid".to_string())
            .map_err(|e| e.to_string()),
    ));

    match providers::http_client() {
        Ok(http) => {
            checks.push(Check::new("http_client", Ok("reqwest client built".into())));
            let registry = providers::build_registry(&http, &config.providers, |_| None);
            let missing: Vec<String> = BackendId::ALL
                .iter()
                .filter(|id| !registry.contains(**id))
                .map(|id| id.to_string())
                .collect();
            checks.push(Check::new(
                "backends",
                if missing.is_empty() {
                    Ok(format!("{} backends registered", BackendId::ALL.len()))
                } else {
                    Err(format!("unregistered: {}", missing.join(", ")))
                },
            ));
        }
        Err(e) => checks.push(Check::new("http_client", Err(e.to_string()))),
    }

    let prompts = DebatePromptBuilder::new();
    checks.push(Check::new(
        "prompt_builder",
        Ok(format!("phases: {}", prompts.phases().join(", "))),
    ));

    DependencyReport {
        ok: checks.iter().all(|c| c.ok),
        checks,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<BackendId>,
    #[serde(flatten)]
    pub credentials: CredentialReport,
}

/// Pass iff `provider` has a key, or, without one, any backend does.
pub fn validate_api_keys(
    provider: Option<BackendId>,
    lookup: impl Fn(&str) -> Option<String>,
) -> ApiKeyReport {
    let credentials = CredentialReport::build(&BackendId::ALL, lookup);
    let ok = match provider {
        Some(id) => credentials.is_configured(id),
        None => credentials.any_configured(),
    };
    ApiKeyReport {
        ok,
        provider,
        credentials,
    }
}
