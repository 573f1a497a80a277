//! Debater agents backed by interchangeable LLM providers.
//!
//! Wires the provider HTTP clients, credential lookup and debate prompt
//! templates into the resilient invocation layer from `coordination`.
//!
//! # Modules
//!
//! - [`providers`]: Anthropic, OpenAI and Gemini backends
//! - [`credentials`]: ordered API key lookup per provider
//! - [`prompts`]: `research` / `preparation` / `debate` templates
//! - [`phase`]: runs one phase and builds the printed report
//! - [`diagnostics`]: dependency and credential checks
//! - [`config`]: TOML and environment configuration

pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod phase;
pub mod prompts;
pub mod providers;

pub use config::{AgentConfig, ConfigError, ProviderConfig, ProvidersConfig};
pub use phase::{PhaseExecutor, PhaseReport, PhaseRequest};
pub use prompts::DebatePromptBuilder;
