//! Cadence CLI - run and administer cron schedules, job queues and workflows
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler, worker pools and maintenance loops
//! cadence serve
//!
//! # Register a workflow and schedule it every 15 minutes
//! cadence workflow register lead-import.json
//! cadence schedule create --workflow lead-import --cron '*/15 * * * *'
//!
//! # Inspect jobs
//! cadence job list --status dead_lettered
//!
//! # Show effective settings
//! cadence info
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod app;
mod commands;
mod settings;

use app::App;
use commands::{info, job, schedule, serve, workflow};
use settings::Settings;

/// Cadence - durable cron scheduling, job queues and workflows
#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Cadence CLI - schedules, jobs and workflows",
    long_about = "Cadence fires cron schedules into a durable job queue and runs\n\
                  each job as a multi-step workflow with retries and circuit breakers."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (TOML). Defaults to ./cadence.toml when present.
    #[arg(short, long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scheduler, workers and maintenance loops until interrupted
    #[command(name = "serve")]
    Serve(serve::ServeArgs),

    /// Manage cron schedules
    #[command(name = "schedule")]
    Schedule(schedule::ScheduleArgs),

    /// Submit and inspect jobs
    #[command(name = "job")]
    Job(job::JobArgs),

    /// Register workflows and inspect run history
    #[command(name = "workflow")]
    Workflow(workflow::WorkflowArgs),

    /// Show effective settings
    #[command(name = "info")]
    Info(info::InfoArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A server is silent at warn; default it to info
    let verbosity = match cli.command {
        Commands::Serve(_) => cli.verbose.max(1),
        _ => cli.verbose,
    };
    setup_logging(verbosity);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Info(args) => info::run(args, &settings),
        command => {
            let app = App::open(settings).await?;
            let result = dispatch(&app, command).await;
            app.close().await;
            result
        }
    }
}

async fn dispatch(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Serve(args) => serve::run(app, args).await,
        Commands::Schedule(args) => schedule::run(app, args).await,
        Commands::Job(args) => job::run(app, args).await,
        Commands::Workflow(args) => workflow::run(app, args).await,
        Commands::Info(args) => info::run(args, &app.settings),
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
