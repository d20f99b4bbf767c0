#![forbid(unsafe_code)]

//! `acp-runner` — run an ACP coding agent and stream its session.
//!
//! Resolves the agent invocation (registry name or literal command after
//! `--`), boots the tracing stack, and drives the runner with a stdout
//! relay. Exit codes: 0 on clean shutdown, 1 on startup failure, the
//! child's exit code when the agent process died underneath the session.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use acp_runner::acp::rpc::ServiceFuture;
use acp_runner::config::{resolve_selection, AgentSelection, RunnerConfigFile};
use acp_runner::metadata::SessionMetadata;
use acp_runner::runner::{
    self, ControlCommand, InboundUserMessage, MetadataUpdate, RelaySession, RunnerConfig,
    RunnerEndpoints,
};
use acp_runner::session::SessionEnvelope;
use acp_runner::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "acp-runner",
    about = "Run an ACP coding agent and stream its session",
    version,
    long_about = None
)]
struct Cli {
    /// Log raw agent-messages and print every envelope to stdout.
    #[arg(long)]
    verbose: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Optional TOML configuration file (timeouts, extra agents).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initial prompt dispatched right after the session starts.
    #[arg(long)]
    prompt: Option<String>,

    /// Agent name followed by pass-through arguments. Use
    /// `acp-runner -- <cmd> [args...]` to spawn a literal command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    agent: Vec<String>,
}

fn main() {
    let (cli, selection) = match parse_cli() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: acp-runner [flags] <agent> [args...] | acp-runner [flags] -- <cmd> [args...]");
            std::process::exit(2);
        }
    };

    if let Err(err) = init_tracing(cli.log_format, cli.verbose) {
        eprintln!("{err}");
        std::process::exit(2);
    }

    let code = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => match runtime.block_on(run(cli, selection)) {
            Ok(code) => code,
            Err(err) => {
                error!(%err, "runner failed");
                1
            }
        },
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            1
        }
    };
    std::process::exit(code);
}

/// Parse flags and the agent selection.
///
/// A standalone `--` switches to the literal form, bypassing the agent
/// registry; the pre-scan keeps that distinction visible even though the
/// flag parser would otherwise swallow the separator.
fn parse_cli() -> Result<(Cli, AgentSelection)> {
    let raw: Vec<String> = std::env::args().collect();
    let tail = &raw[1..];

    if let Some(pos) = tail.iter().position(|arg| arg == "--") {
        let mut head: Vec<String> = Vec::with_capacity(pos + 1);
        head.push(raw[0].clone());
        head.extend_from_slice(&tail[..pos]);

        let cli =
            Cli::try_parse_from(&head).map_err(|err| AppError::Config(err.to_string()))?;
        if !cli.agent.is_empty() {
            return Err(AppError::Config(
                "unexpected agent name before '--'; pick either form".into(),
            ));
        }
        let argv = tail[pos + 1..].to_vec();
        if argv.is_empty() {
            return Err(AppError::Config("missing command after '--'".into()));
        }
        return Ok((cli, AgentSelection::Literal { argv }));
    }

    // No separator: plain clap parse, then split name from pass-through.
    // Let --help/--version behave normally.
    let cli = Cli::parse();
    let Some((name, passthrough)) = cli.agent.split_first() else {
        return Err(AppError::Config("no agent specified".into()));
    };
    let selection = AgentSelection::Named {
        name: name.clone(),
        passthrough: passthrough.to_vec(),
    };
    Ok((cli, selection))
}

async fn run(cli: Cli, selection: AgentSelection) -> Result<i32> {
    let config_file = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|err| {
                AppError::Config(format!("cannot read config file '{}': {err}", path.display()))
            })?;
            RunnerConfigFile::from_toml_str(&text)?
        }
        None => RunnerConfigFile::default(),
    };

    let command = resolve_selection(&selection, &config_file.agents)?;
    info!(command = %command.display(), "starting agent");

    let cwd = std::env::current_dir().map_err(|err| AppError::Io(err.to_string()))?;

    let relay: Arc<dyn RelaySession> = Arc::new(StdoutRelay::new(cli.verbose));
    let (_inbound_tx, inbound_rx) = mpsc::channel::<InboundUserMessage>(16);
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(4);

    // First signal asks for a clean teardown; a second one force-exits.
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, killing session");
        let _ = control_tx.send(ControlCommand::Kill).await;
        shutdown_signal().await;
        error!("second shutdown signal received, forcing exit");
        std::process::exit(1);
    });

    let config = RunnerConfig {
        command,
        cwd,
        hooks: Arc::new(config_file.transport()),
        permission_handler: None,
        initial_prompt: cli.prompt,
    };
    let endpoints = RunnerEndpoints {
        relay,
        bridge: None,
        inbound: inbound_rx,
        control: control_rx,
    };

    runner::run(config, endpoints).await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

// ── Stdout relay ─────────────────────────────────────────────────────────────

/// Minimal relay implementation: envelopes go to stdout as JSON lines when
/// verbose, metadata lives in memory and is logged on change.
struct StdoutRelay {
    verbose: bool,
    metadata: Mutex<SessionMetadata>,
}

impl StdoutRelay {
    fn new(verbose: bool) -> Self {
        Self {
            verbose,
            metadata: Mutex::new(SessionMetadata::default()),
        }
    }
}

impl RelaySession for StdoutRelay {
    fn send_envelope(&self, envelope: SessionEnvelope) -> ServiceFuture<'_, Result<()>> {
        let verbose = self.verbose;
        Box::pin(async move {
            if verbose {
                match serde_json::to_string(&envelope) {
                    Ok(line) => println!("{line}"),
                    Err(err) => debug!(%err, "envelope did not serialize"),
                }
            }
            Ok(())
        })
    }

    fn update_metadata(&self, update: MetadataUpdate) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            let mut metadata = self.metadata.lock().await;
            let next = update(metadata.clone());
            if *metadata != next {
                debug!(metadata = ?next, "session metadata updated");
                *metadata = next;
            }
        })
    }

    fn close(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async {})
    }
}
