//! Railyard: a lifecycle manager for locally running service processes.
//!
//! This is the entry point. The visible subcommands (`start`, `stop`,
//! `restart`, `status`) act as the controller: they expand the requested
//! services and groups, drive per-service jobs through a worker pool, and
//! spawn one detached supervisor per launched service. The hidden `run`
//! subcommand is that supervisor.

mod backend;
mod config;
mod home;
mod instance;
mod logfile;
mod logging;
mod orchestrate;
mod pool;
mod procinfo;
mod ready;
mod status;
mod supervisor;
mod task;
mod watch;

#[cfg(not(unix))]
compile_error!("railyard relies on Unix process groups and signals");

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};

use crate::home::Home;
use crate::orchestrate::{OperationConfig, Orchestrator, StatusRow, DEFAULT_WORKERS};
use crate::supervisor::SupervisorArgs;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "railyard",
    version,
    about = "Manage locally running service processes",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the railyard.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// State directory override (defaults to $RAILYARD_HOME or ~/.railyard).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Enable debug logging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and launch services or groups.
    Start(OperationArgs),
    /// Stop running services or groups.
    Stop(OperationArgs),
    /// Stop, rebuild, and relaunch services or groups.
    Restart(OperationArgs),
    /// Show the status of configured services.
    Status {
        /// Services or groups to report on; defaults to every service.
        names: Vec<String>,
    },
    /// Supervise a single service. Spawned internally by `start`.
    #[command(hide = true)]
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
struct OperationArgs {
    /// Services or groups to operate on; defaults to every service.
    names: Vec<String>,
    /// Skip build steps and go straight to launching.
    #[arg(long)]
    skip_build: bool,
    /// Disable file watching in launched supervisors.
    #[arg(long)]
    no_watch: bool,
    /// Exclude a service or group from the expansion. Repeatable.
    #[arg(long = "exclude", value_name = "NAME")]
    exclusions: Vec<String>,
    /// Tag forwarded to launched supervisors. Repeatable.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Log file override for launched supervisors.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Run per-service jobs one at a time instead of concurrently.
    #[arg(long)]
    serial: bool,
    /// Worker pool size for per-service jobs.
    #[arg(long)]
    workers: Option<usize>,
    /// Readiness timeout override in seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Name of the service to supervise.
    #[arg(long)]
    service: String,
    /// Working directory override.
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Do not watch for file changes.
    #[arg(long)]
    no_watch: bool,
    /// Tags this supervisor was launched with. Repeatable.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Log file override.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Environment override (KEY=VALUE). Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from("railyard.toml"));

    match cli.command {
        Commands::Run(args) => {
            logging::init_logging(cli.verbose, tracing::Level::INFO);
            supervisor::run(SupervisorArgs {
                service: args.service,
                config: config_path,
                home: cli.home,
                directory: args.directory,
                no_watch: args.no_watch,
                tags: args.tags,
                log_file: args.log_file,
                env: args.env,
            })
            .await
        }
        command => run_controller(command, config_path, cli.home, cli.verbose).await,
    }
}

async fn run_controller(
    command: Commands,
    config_path: PathBuf,
    home_override: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    logging::init_logging(verbose, tracing::Level::WARN);

    // Supervisors inherit this path and may outlive the shell session, so it
    // has to survive directory changes.
    let config_path = config_path.canonicalize().unwrap_or(config_path);
    let home = Home::resolve(home_override)?;
    home.ensure()?;

    let file = config::load_config(&config_path)?;
    let configured_workers = file.workers;
    let graph = config::resolve(file)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }
    let orchestrator = Orchestrator::new(home, graph, config_path, cancel);

    match command {
        Commands::Start(args) => {
            let op = operation_config(&args, configured_workers);
            run_blocking(move || orchestrator.start(&args.names, &op)).await
        }
        Commands::Stop(args) => {
            let op = operation_config(&args, configured_workers);
            run_blocking(move || orchestrator.stop(&args.names, &op)).await
        }
        Commands::Restart(args) => {
            let op = operation_config(&args, configured_workers);
            run_blocking(move || orchestrator.restart(&args.names, &op)).await
        }
        Commands::Status { names } => {
            let rows = run_blocking(move || {
                orchestrator.status(&names, &OperationConfig::default())
            })
            .await?;
            print_status(&rows);
            Ok(())
        }
        Commands::Run(_) => unreachable!("handled in main"),
    }
}

/// Controller operations block on process spawning and readiness polling, so
/// they run off the async runtime's core threads.
async fn run_blocking<T, F>(operation: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .context("operation thread panicked")?
}

fn operation_config(args: &OperationArgs, configured_workers: Option<usize>) -> OperationConfig {
    let workers = if args.serial {
        0
    } else {
        args.workers
            .or(configured_workers)
            .unwrap_or(DEFAULT_WORKERS)
    };
    OperationConfig {
        skip_build: args.skip_build,
        no_watch: args.no_watch,
        exclusions: args.exclusions.iter().cloned().collect::<HashSet<_>>(),
        tags: args.tags.clone(),
        log_file: args.log_file.clone(),
        workers,
        ready_timeout: args.timeout.map(Duration::from_secs),
    }
}

fn print_status(rows: &[StatusRow]) {
    println!(
        "{:<20} {:<10} {:>8} {:>8} {:>10} {:<20} {:>8} {:>8}",
        "SERVICE", "STATE", "PID", "UPTIME", "MEMORY", "PORTS", "STDOUT", "STDERR"
    );
    for row in rows {
        let state = match row.state {
            Some(state) => format!("{:?}", state).to_lowercase(),
            None if row.pid != 0 => "unknown".to_string(),
            None => "stopped".to_string(),
        };
        let ports = if row.ports.is_empty() {
            "-".to_string()
        } else {
            row.ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        println!(
            "{:<20} {:<10} {:>8} {:>8} {:>10} {:<20} {:>8} {:>8}",
            row.name,
            state,
            if row.pid == 0 {
                "-".to_string()
            } else {
                row.pid.to_string()
            },
            format_uptime(row.started_at),
            format_memory(row.memory_bytes),
            ports,
            row.stdout_lines,
            row.stderr_lines
        );
    }
}

fn format_uptime(started_at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let Some(started) = started_at else {
        return "-".to_string();
    };
    let secs = (chrono::Utc::now() - started).num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn format_memory(bytes: u64) -> String {
    if bytes == 0 {
        return "-".to_string();
    }
    const MIB: f64 = 1024.0 * 1024.0;
    if (bytes as f64) < MIB {
        format!("{:.0} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / MIB)
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
