//! Agent command resolution and optional configuration file.
//!
//! The CLI names an agent (`gemini`, `opencode`, …) or spells out a
//! literal command after `--`. Known names resolve through a registry of
//! ACP invocations; unknown names are treated as the command itself, which
//! keeps new agents usable without a release.
//!
//! An optional TOML file adds registry entries and overrides the transport
//! timeouts. Everything has a default; the file is never required.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::acp::spawner::AgentCommand;
use crate::transport::ConfiguredTransport;
use crate::{AppError, Result};

/// How the user selected the agent on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSelection {
    /// `acp-runner <name> [args...]` — resolve through the registry.
    Named {
        /// Registry key or bare command name.
        name: String,
        /// Extra arguments appended to the resolved invocation.
        passthrough: Vec<String>,
    },
    /// `acp-runner -- <cmd> [args...]` — spawn exactly this.
    Literal {
        /// Full argv, program first.
        argv: Vec<String>,
    },
}

/// Built-in registry of known ACP agent invocations.
#[must_use]
pub fn builtin_agents() -> HashMap<String, Vec<String>> {
    HashMap::from([
        (
            "gemini".to_owned(),
            vec!["gemini".to_owned(), "--experimental-acp".to_owned()],
        ),
        (
            "opencode".to_owned(),
            vec!["opencode".to_owned(), "acp".to_owned()],
        ),
    ])
}

/// Resolve an agent selection into a spawnable command.
///
/// Registry entries from the configuration file shadow the built-ins.
/// `opencode` historically took an `--acp` flag that the `acp` subcommand
/// replaced; it is stripped from pass-through arguments.
///
/// # Errors
///
/// [`AppError::Config`] for an empty literal command or an empty registry
/// entry.
pub fn resolve_selection(
    selection: &AgentSelection,
    extra_agents: &HashMap<String, Vec<String>>,
) -> Result<AgentCommand> {
    match selection {
        AgentSelection::Literal { argv } => {
            let Some((program, args)) = argv.split_first() else {
                return Err(AppError::Config("missing command after '--'".into()));
            };
            Ok(AgentCommand::new(program.clone(), args.to_vec()))
        }
        AgentSelection::Named { name, passthrough } => {
            let mut registry = builtin_agents();
            registry.extend(extra_agents.clone());

            let mut passthrough = passthrough.clone();
            if name == "opencode" {
                passthrough.retain(|arg| arg != "--acp");
            }

            match registry.get(name) {
                Some(entry) => {
                    let Some((program, args)) = entry.split_first() else {
                        return Err(AppError::Config(format!(
                            "registry entry for '{name}' is empty"
                        )));
                    };
                    let mut args = args.to_vec();
                    args.extend(passthrough);
                    Ok(AgentCommand::new(program.clone(), args))
                }
                // Unknown names are the command itself.
                None => Ok(AgentCommand::new(name.clone(), passthrough)),
            }
        }
    }
}

// ── Configuration file ───────────────────────────────────────────────────────

/// Transport timeout overrides (all optional).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Handshake timeout per attempt.
    #[serde(default = "default_init_seconds")]
    pub init_seconds: u64,
    /// Quiet interval before `idle` is emitted.
    #[serde(default = "default_idle_millis")]
    pub idle_millis: u64,
    /// Maximum lifetime of one tool call.
    #[serde(default = "default_tool_call_seconds")]
    pub tool_call_seconds: u64,
}

fn default_init_seconds() -> u64 {
    60
}

fn default_idle_millis() -> u64 {
    500
}

fn default_tool_call_seconds() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_seconds: default_init_seconds(),
            idle_millis: default_idle_millis(),
            tool_call_seconds: default_tool_call_seconds(),
        }
    }
}

/// Optional runner configuration parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfigFile {
    /// Timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Extra agent registry entries: name → argv (program first).
    #[serde(default)]
    pub agents: HashMap<String, Vec<String>>,
}

impl RunnerConfigFile {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] when the TOML is malformed.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Transport hooks carrying the configured timeouts.
    #[must_use]
    pub fn transport(&self) -> ConfiguredTransport {
        ConfiguredTransport::new(
            Duration::from_secs(self.timeouts.init_seconds),
            Duration::from_millis(self.timeouts.idle_millis),
            Duration::from_secs(self.timeouts.tool_call_seconds),
        )
    }
}
