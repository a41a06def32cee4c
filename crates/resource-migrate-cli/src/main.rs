//! resource-migrate CLI - resumable migration between two service instances.

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use resource_migrate::{
    Config, FileStateBackend, MigrateError, MigrationReport, Orchestrator, ResourceKind,
    SessionStore, SessionSummary, StateBackend,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "resource-migrate")]
#[command(about = "Resumable migration of projects, datasets and rules between service instances")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory holding session state files [default: ~/.resource-migrate/state]
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration session
    Run {
        /// Resource kinds to migrate, comma separated (default: all but experiments)
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,

        /// Also migrate experiments, their runs and feedback
        #[arg(long)]
        include_experiments: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override page size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Dry run: list and transform everything without creating anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume an interrupted migration session
    Resume {
        /// Session to resume
        #[arg(required_unless_present = "latest", conflicts_with = "latest")]
        session_id: Option<String>,

        /// Resume the most recently updated session for these endpoints
        #[arg(long)]
        latest: bool,

        /// Reprocess items that failed in earlier attempts
        #[arg(long)]
        retry_failed: bool,

        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List stored sessions
    Sessions {
        /// Include completed sessions
        #[arg(long)]
        all: bool,
    },

    /// Test connections to both instances
    HealthCheck,

    /// Delete stored sessions
    Clean {
        /// Session to delete
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        session_id: Option<String>,

        /// Delete every stored session
        #[arg(long)]
        all: bool,

        /// Do not ask for confirmation
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(state_dir(&cli)));

    // Session management does not need a configuration file
    match &cli.command {
        Commands::Sessions { all } => return list_sessions(backend.as_ref(), *all, cli.output_json).await,
        Commands::Clean {
            session_id,
            all,
            force,
        } => return clean_sessions(backend.as_ref(), session_id.as_deref(), *all, *force).await,
        _ => {}
    }

    // Load configuration with auto-tuned worker count
    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Sessions { .. } | Commands::Clean { .. } => unreachable!(), // Handled above

        Commands::Run {
            kinds,
            workers,
            batch_size,
            dry_run,
            include_experiments,
        } => {
            // Apply overrides
            if !kinds.is_empty() {
                config.migration.resource_kinds = kinds
                    .iter()
                    .map(|k| k.parse::<ResourceKind>())
                    .collect::<Result<_, _>>()?;
            }
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if let Some(size) = batch_size {
                config.migration.batch_size = size;
            }
            config.migration.dry_run |= dry_run;
            config.migration.include_experiments |= include_experiments;
            let dry_run = config.migration.dry_run;

            let orchestrator = Orchestrator::new(config, backend)?;
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            let result = with_shutdown_timeout(
                orchestrator.run(&cancel_token),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await;

            let status_msg = if dry_run { "Dry run completed!" } else { "Migration completed!" };
            show_result(result, status_msg, cli.output_json)?;
        }

        Commands::Resume {
            session_id,
            latest,
            retry_failed,
            workers,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            config.migration.retry_failed = retry_failed;
            // Resumed sessions always write
            config.migration.dry_run = false;

            let session_id = match session_id {
                Some(id) => id,
                None if latest => SessionStore::latest_resumable(backend.as_ref(), &config)
                    .await?
                    .ok_or_else(|| {
                        MigrateError::State(
                            "No resumable session found for these endpoints".to_string(),
                        )
                    })?,
                None => {
                    return Err(MigrateError::Config(
                        "Either SESSION_ID or --latest is required".to_string(),
                    ))
                }
            };

            let orchestrator = Orchestrator::new(config, backend)?;
            let cancel_token = setup_signal_handler(cli.shutdown_timeout).await?;
            info!("Resuming session {}", session_id);
            let result = with_shutdown_timeout(
                orchestrator.resume(&session_id, &cancel_token),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await;

            show_result(result, "Migration resumed and completed!", cli.output_json)?;
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config, backend)?;
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for (label, endpoint) in [("Source", &result.source), ("Destination", &result.destination)] {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        label,
                        endpoint.api_url,
                        if endpoint.connected { "OK" } else { "FAILED" },
                        endpoint.latency_ms
                    );
                    if let Some(ref err) = endpoint.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Network("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

/// `--state-dir`, or `~/.resource-migrate/state`.
fn state_dir(cli: &Cli) -> PathBuf {
    cli.state_dir.clone().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".resource-migrate")
            .join("state")
    })
}

/// Print the report, including the partial report of a stopped run, then
/// hand the error back for the exit code.
fn show_result(
    result: Result<MigrationReport, MigrateError>,
    headline: &str,
    output_json: bool,
) -> Result<(), MigrateError> {
    let report = match &result {
        Ok(report) => Some(report),
        Err(e) => e.report(),
    };
    if let Some(report) = report {
        if output_json {
            println!("{}", report.to_json()?);
        } else if result.is_ok() {
            print_report(headline, report);
        } else {
            print_report("Migration stopped before completion.", report);
        }
    }
    result.map(|_| ())
}

fn print_report(headline: &str, report: &MigrationReport) {
    println!("\n{}", headline);
    println!("  Session: {}", report.session_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    for kind in &report.kinds {
        println!(
            "  {:<17} {:>6} succeeded {:>6} failed {:>6} skipped  ({})",
            kind.kind.to_string(),
            kind.succeeded,
            kind.failed,
            kind.skipped,
            kind.status
        );
        for failure in kind.failures.iter().take(5) {
            println!("      {}: {}", failure.source_id, failure.message);
        }
        if kind.failures.len() > 5 {
            println!("      ... and {} more", kind.failures.len() - 5);
        }
    }
    println!(
        "  Requests: source {} ({} errors), destination {} ({} errors)",
        report.source_requests.requests,
        report.source_requests.errors,
        report.destination_requests.requests,
        report.destination_requests.errors
    );
}

async fn list_sessions(
    backend: &dyn StateBackend,
    all: bool,
    output_json: bool,
) -> Result<(), MigrateError> {
    let sessions: Vec<SessionSummary> = if all {
        SessionStore::list_sessions(backend).await?
    } else {
        SessionStore::list_resumable_sessions(backend).await?
    };

    if output_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    for session in &sessions {
        println!(
            "{}  {}  updated {}{}",
            session.session_id,
            session.status,
            session.updated_at.format("%Y-%m-%d %H:%M:%S"),
            if session.can_resume { "  (resumable)" } else { "" }
        );
        for kind in &session.kinds {
            println!(
                "    {:<17} {:<12} {} processed, {} succeeded, {} failed",
                kind.kind.to_string(),
                kind.status.to_string(),
                kind.processed,
                kind.succeeded,
                kind.failed
            );
        }
    }
    Ok(())
}

async fn clean_sessions(
    backend: &dyn StateBackend,
    session_id: Option<&str>,
    all: bool,
    force: bool,
) -> Result<(), MigrateError> {
    let targets: Vec<String> = match session_id {
        Some(id) => vec![id.to_string()],
        None if all => backend.list().await?.into_iter().map(|s| s.session_id).collect(),
        None => {
            return Err(MigrateError::Config(
                "Either SESSION_ID or --all is required".to_string(),
            ))
        }
    };
    if targets.is_empty() {
        println!("No sessions to delete.");
        return Ok(());
    }

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete {} session(s)?", targets.len()))
            .default(false)
            .interact()
            .map_err(|e| MigrateError::Config(format!("Confirmation failed: {}", e)))?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut deleted = 0;
    for id in &targets {
        if backend.delete(id).await? {
            deleted += 1;
        } else {
            warn!("Session {} not found", id);
        }
    }
    println!("Deleted {} session(s).", deleted);
    Ok(())
}

/// Await `work`; once `cancel` fires, give it `timeout_secs` to wind down.
async fn with_shutdown_timeout<F>(
    work: F,
    cancel: &CancellationToken,
    timeout_secs: u64,
) -> Result<MigrationReport, MigrateError>
where
    F: std::future::Future<Output = Result<MigrationReport, MigrateError>>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Shutdown timeout of {}s exceeded", timeout_secs);
                    Err(MigrateError::Cancelled)
                }
            }
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Finishing in-flight items (timeout: {}s); the session stays resumable...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
