//! Info command - Show effective settings
//!
//! Usage:
//! ```bash
//! cadence info
//! cadence --config /etc/cadence.toml info --json
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::Cell;

use cadence_runtime::HandlerRegistry;

use super::{print_json, table};
use crate::settings::{Settings, StorageBackend};

#[derive(Args)]
pub struct InfoArgs {
    /// Dump the merged settings as JSON
    #[arg(long)]
    json: bool,
}

pub fn run(args: InfoArgs, settings: &Settings) -> Result<()> {
    if args.json {
        return print_json(settings);
    }

    let version = env!("CARGO_PKG_VERSION");

    println!("{}", "Cadence - schedules, jobs and workflows".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!();

    println!("  {} {}", "Version:".dimmed(), version.green());
    println!();

    println!("{}", "Storage:".bold());
    println!("  {} {}", "Backend:".dimmed(), settings.storage.backend.as_str().green());
    if settings.storage.backend == StorageBackend::Sqlite {
        let sqlite = &settings.storage.sqlite;
        println!("  {} {}", "URL:".dimmed(), sqlite.url);
        println!("  {} {}", "Connections:".dimmed(), sqlite.max_connections);
        println!("  {} {}", "WAL:".dimmed(), sqlite.wal_mode);
    }
    println!();

    println!("{}", "Scheduler:".bold());
    let scheduler = &settings.scheduler;
    println!("  {} {}s", "Tick interval:".dimmed(), scheduler.tick_interval_secs);
    println!("  {} {}", "Failure threshold:".dimmed(), scheduler.failure_threshold);
    println!(
        "  {} {} attempts, {}ms base backoff",
        "Job retry budget:".dimmed(),
        scheduler.job_max_attempts,
        scheduler.job_backoff_base_ms
    );
    println!();

    println!("{}", "Worker pools:".bold());
    let mut pools = table(&["Queue", "Concurrency", "Lease", "Heartbeat", "Job timeout"]);
    for pool in &settings.workers {
        pools.add_row(vec![
            Cell::new(&pool.queue),
            Cell::new(pool.max_concurrency),
            Cell::new(format!("{}s", pool.lease_timeout.as_secs())),
            Cell::new(format!("{}s", pool.heartbeat_interval.as_secs())),
            Cell::new(format!("{}s", pool.handler_timeout.as_secs())),
        ]);
    }
    println!("{pools}");
    println!();

    println!("{}", "Resilience:".bold());
    let retry = &settings.executor.default_retry;
    println!(
        "  {} {} attempts, {}..{}ms backoff, {:.0}% jitter",
        "Step retry:".dimmed(),
        retry.max_attempts,
        retry.base_delay_ms,
        retry.max_delay_ms,
        retry.jitter_ratio * 100.0
    );
    println!("  {} {}ms", "Step timeout:".dimmed(), settings.executor.default_step_timeout_ms);
    let breaker = &settings.breaker;
    println!(
        "  {} opens after {} failures, {}ms cooldown (max {}ms)",
        "Breaker:".dimmed(),
        breaker.failure_threshold,
        breaker.cooldown_ms,
        breaker.max_cooldown_ms
    );
    println!(
        "  {} sweep every {}ms, breaker snapshot every {}ms",
        "Maintenance:".dimmed(),
        settings.maintenance.sweep_interval_ms,
        settings.maintenance.breaker_snapshot_interval_ms
    );
    println!();

    println!("{}", "Step handlers:".bold());
    for name in HandlerRegistry::with_builtins().names() {
        println!("  {} {}", "•".cyan(), name.green());
    }
    println!();

    Ok(())
}
