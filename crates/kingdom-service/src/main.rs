//! kingdom-service: Kingdom Agent Service main binary
//!
//! Hosts the agent supervisor with the built-in agent types until Ctrl-C
//! or SIGTERM.
//!
//! Usage:
//!   kingdom-service                   - Start with ./kingdom.toml or environment config
//!   kingdom-service --config <path>   - Start with the given TOML file
//!   kingdom-service --help            - Show help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kingdom_core::agents::{EchoHandler, LoggingMessageHandler, RecordingMessageHandler, RelayHandler};
use kingdom_core::{AgentSpec, ServiceConfig, Supervisor, TaskPayload};
use tracing_subscriber::EnvFilter;

/// Run mode
enum RunMode {
    /// Run the service
    Serve { config_path: Option<PathBuf> },
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match parse_args()? {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("kingdom-service {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Serve { config_path } => config_path,
    };

    // Load .env file
    dotenvy::dotenv().ok();

    let config = match config_path {
        Some(path) => ServiceConfig::from_toml_file(&path),
        None => ServiceConfig::load(),
    }
    .map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting {}...", config.service_name);
    tracing::info!(
        "Agent types: {:?} ({} per type, {:?} dispatch)",
        config.agent_types,
        config.agents_per_type,
        config.dispatch_mode
    );

    let task_timeout = config.timing.task_timeout();
    let mut supervisor = Supervisor::new(config)?;
    supervisor.register_agent_type(
        "echo",
        AgentSpec::new(Arc::new(EchoHandler), Arc::new(LoggingMessageHandler)),
    );
    supervisor.register_agent_type(
        "tester2",
        AgentSpec::new(Arc::new(RelayHandler), Arc::new(RecordingMessageHandler::new())),
    );

    let shutdown = shutdown_signal()?;
    supervisor.start().await?;

    if let Err(e) = self_check(&supervisor, task_timeout.min(Duration::from_secs(5))).await {
        tracing::warn!("Self check failed: {}", e);
    }

    let snapshot = serde_json::to_string_pretty(&supervisor.status())?;
    tracing::info!("Service status:\n{}", snapshot);

    // Wait for shutdown signal
    let signal = shutdown.await;
    tracing::info!("Shutdown signal received ({})", signal);

    supervisor.stop().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Round-trip an echo task through the running service
async fn self_check(supervisor: &Supervisor, timeout: Duration) -> anyhow::Result<()> {
    let task_id = supervisor.submit_task(TaskPayload::echo("ping"), None, None)?;
    let result = supervisor.wait_for_result(&task_id, timeout).await?;
    tracing::info!("Self check passed: {}", result);
    Ok(())
}

/// Register the shutdown signal handlers
///
/// Handlers are installed before this returns; the future resolves with
/// the name of the first signal received.
fn shutdown_signal() -> anyhow::Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        Ok(async move {
            tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        })
    }

    #[cfg(not(unix))]
    {
        Ok(async {
            tokio::signal::ctrl_c().await.ok();
            "Ctrl-C"
        })
    }
}

/// Parse command line arguments
fn parse_args() -> anyhow::Result<RunMode> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-v" => return Ok(RunMode::Version),
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    Ok(RunMode::Serve { config_path })
}

/// Print help message
fn print_help() {
    println!("kingdom-service - Kingdom Agent Service");
    println!();
    println!("Usage:");
    println!("  kingdom-service                  Start with ./kingdom.toml or environment config");
    println!("  kingdom-service --config <path>  Start with the given TOML file");
    println!("  kingdom-service --help           Show this help message");
    println!("  kingdom-service --version        Show version");
    println!();
    println!("Environment Variables:");
    println!("  KINGDOM_CONFIG               Path to TOML config file");
    println!("  KINGDOM_AGENT_TYPES          Comma-separated agent types (default: echo,tester2)");
    println!("  KINGDOM_AGENTS_PER_TYPE      Workers per agent type (default: 2)");
    println!("  KINGDOM_DISPATCH_MODE        shared or direct (default: shared)");
    println!("  KINGDOM_DB_PATH              SQLite database path (default: data/kingdom.db)");
    println!("  KINGDOM_DB_POOL_SIZE         Connection pool size (default: 10)");
    println!("  KINGDOM_TASK_TIMEOUT_SECS    Task wait timeout (default: 300)");
    println!("  KINGDOM_LOG_LEVEL            Log level when RUST_LOG is unset (default: info)");
}
