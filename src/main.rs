//! agent-worker - drives coding-agent CLI sessions for a central control plane
//!
//! `serve` runs the worker. `hook` and `plan` are the session-scoped helpers
//! agents invoke; they report back to the worker that launched them.

use agent_worker::{
    config::WorkerConfig,
    helper::{extract_plan, CtlClient, HelperEnv},
    worker::WorkerBuilder,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-worker")]
#[command(version)]
#[command(about = "Drives coding-agent CLI sessions for a central control plane")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENT_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker
    Serve {
        /// Host for the public listener
        #[arg(long)]
        host: Option<String>,

        /// Port for the public listener
        #[arg(long)]
        port: Option<u16>,

        /// Shared secret the control plane authenticates with
        #[arg(long, env = "AGENT_WORKER_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Report an agent hook to the owning worker (reads the payload from stdin)
    Hook {
        /// Hook event name, e.g. PreToolUse
        name: String,
    },

    /// Submit a plan to the owning worker (reads the plan from stdin)
    Plan,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => WorkerConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port, secret } => run_serve(config, host, port, secret).await,
        Commands::Hook { name } => run_hook(&config, &name).await,
        Commands::Plan => run_plan(&config).await,
        Commands::Config { default } => show_config(if default { None } else { Some(&config) }),
    }
}

/// Logs go to stderr; agents read helper stdout
fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agent_worker={},tower_http={}", log_level, log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn run_serve(
    config: WorkerConfig,
    host: Option<String>,
    port: Option<u16>,
    secret: Option<String>,
) -> Result<()> {
    let secret = secret.context("a public secret is required (--secret or AGENT_WORKER_SECRET)")?;

    let mut builder = WorkerBuilder::new().config(config).public_secret(secret);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    let worker = builder.build().await?;

    worker.start().await?;
    tracing::info!("Agent worker is running. Press Ctrl+C to stop.");

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    worker.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn read_stdin() -> Result<Vec<u8>> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("failed to read stdin")?;
    Ok(input)
}

fn ctl_client(config: &WorkerConfig) -> Result<CtlClient> {
    let env = HelperEnv::from_env().context("not running inside an agent-worker session")?;
    let timeout = Duration::from_secs(config.ctl.request_timeout_secs);
    Ok(CtlClient::new(env, timeout)?)
}

async fn run_hook(config: &WorkerConfig, name: &str) -> Result<()> {
    let client = ctl_client(config)?;
    let payload = read_stdin().await?;
    client
        .report_hook(name, &payload)
        .await
        .with_context(|| format!("failed to report hook {}", name))?;
    Ok(())
}

async fn run_plan(config: &WorkerConfig) -> Result<()> {
    let client = ctl_client(config)?;
    let input = read_stdin().await?;
    let plan = extract_plan(&String::from_utf8_lossy(&input));
    client
        .submit_plan(&plan)
        .await
        .context("failed to submit plan")?;
    Ok(())
}

fn show_config(config: Option<&WorkerConfig>) -> Result<()> {
    let toml = match config {
        Some(config) => config.to_toml()?,
        None => WorkerConfig::default().to_toml()?,
    };
    println!("{}", toml);
    Ok(())
}
