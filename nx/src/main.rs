//! nxcd - pull-based NixOS deployer
//!
//! CLI entry point: `run` (default), `head` and `check`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use nxcd::cli::{Cli, Command};
use nxcd::config::{Config, DeployConfig};
use nxcd::engine::{Engine, EngineSettings};
use nxcd::notifier::{LogSink, MatrixSink, Notifier, NotifySink};
use nxcd::poller::fetch_head;
use nxcd::repo::RepositoryIdentity;
use nxcd::transport::{OpenSshTransport, Transport, usable_identities};

/// How long shutdown waits for queued notifications
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn parse_level(s: &str) -> tracing::Level {
    match s.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = cli_log_level
        .or(config_log_level)
        .map(parse_level)
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install subscriber: {e}"))?;

    debug!(?level, "Logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Run) | None => cmd_run(&config).await,
        Some(Command::Head { repo, branch }) => cmd_head(&config, repo, branch).await,
        Some(Command::Check) => cmd_check(&config),
    }
}

/// Watch the repository until SIGINT or SIGTERM
async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let deploy = config.validate().context("Invalid configuration")?;
    let transport = OpenSshTransport::new(deploy.ssh.clone()).context("Invalid configuration")?;

    let sink = notify_sink(&deploy).await;
    let (notifier, notify_handle) = Notifier::spawn(sink, deploy.notify_buffer);

    let engine = Engine::new(
        EngineSettings::from(&deploy),
        Arc::new(transport),
        Arc::new(deploy.rebuild_command()),
        notifier.clone(),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                // Dropping the sender would stop the poll loop, so hold it.
                warn!(error = %e, "Failed to listen for signals");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    info!(repo = %deploy.repo, target = %deploy.flake.target, "nxcd starting");
    let report = engine.run(shutdown_rx).await.context("Failed to read the remote head")?;

    drop(engine);
    drop(notifier);
    if tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, notify_handle).await.is_err() {
        warn!("Gave up delivering queued notifications");
    }

    if !report.settled {
        warn!("Exiting with a rebuild still in progress");
    }
    info!(baseline = %report.baseline, detected = report.detected, "nxcd stopped");
    Ok(())
}

/// Print the remote head hash once
async fn cmd_head(config: &Config, repo: Option<String>, branch: Option<String>) -> Result<()> {
    debug!(?repo, ?branch, "cmd_head: called");
    let repo = repo.unwrap_or_else(|| config.git.repo.clone());
    let branch = branch.unwrap_or_else(|| config.git.branch.clone());
    let identity = RepositoryIdentity::new(repo.trim(), branch.trim()).context("Invalid repository")?;

    let transport = OpenSshTransport::new(config.git.ssh_options()).context("Invalid configuration")?;
    let hash = fetch_head(&transport, &identity)
        .await
        .context(format!("Failed to read head of {} from {}", identity, transport.host()))?;

    println!("{}", hash);
    Ok(())
}

/// Validate configuration and print what would be used
fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    let deploy = config.validate().context("Invalid configuration")?;
    let keys = usable_identities(&deploy.ssh.identities).context("Invalid configuration")?;

    println!("{} Configuration is valid", "✓".green());
    println!("  {:<14} {}", "repository".bold(), deploy.repo.path().cyan());
    println!("  {:<14} {}", "branch".bold(), deploy.repo.branch().cyan());
    println!("  {:<14} {}", "target".bold(), deploy.flake.target.cyan());
    println!("  {:<14} {}@{}:{}", "ssh".bold(), deploy.ssh.user, deploy.ssh.host, deploy.ssh.port);
    for key in &keys {
        println!("  {:<14} {}", "key".bold(), key.display());
    }
    let skipped = deploy.ssh.identities.len() - keys.len();
    if skipped > 0 {
        println!("  {:<14} {}", "unusable keys".bold(), skipped.to_string().yellow());
    }
    println!("  {:<14} {:?}", "poll interval".bold(), deploy.poll_interval);
    println!(
        "  {:<14} {} {}",
        "rebuild".bold(),
        deploy.rebuild_program,
        deploy.rebuild_args.join(" ")
    );
    let matrix = match &deploy.matrix {
        Some(m) => format!("{} ({})", m.room_id, m.home_server).normal(),
        None => "disabled".dimmed(),
    };
    println!("  {:<14} {}", "matrix".bold(), matrix);
    Ok(())
}

async fn notify_sink(deploy: &DeployConfig) -> Arc<dyn NotifySink> {
    let Some(matrix) = &deploy.matrix else {
        return Arc::new(LogSink);
    };
    match MatrixSink::login(matrix).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!(error = %e, "Matrix login failed, notifications will only be logged");
            Arc::new(LogSink)
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl-C received");
    }

    Ok(())
}
