//! Schedule command - cron schedule administration
//!
//! Usage:
//! ```bash
//! cadence schedule create --workflow lead-import --cron '*/15 * * * *'
//! cadence schedule list
//! cadence schedule update <id> --cron '0 * * * *'
//! cadence schedule pause <id>
//! cadence schedule upcoming --limit 5
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, Color};
use uuid::Uuid;

use cadence_scheduler::{NewSchedule, Schedule, SchedulePatch};

use super::{parse_json, print_json, status, status_cell, table, time, truncate};
use crate::app::App;
use crate::{print_success, print_warning};

#[derive(Args)]
pub struct ScheduleArgs {
    #[command(subcommand)]
    command: ScheduleCommand,
}

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Create a schedule
    #[command(name = "create")]
    Create {
        /// Workflow started by each fire
        #[arg(long)]
        workflow: String,

        /// Five-field cron expression (UTC) or @hourly/@daily/...
        #[arg(long)]
        cron: String,

        #[arg(long)]
        name: Option<String>,

        /// JSON payload handed to the workflow
        #[arg(long)]
        payload: Option<String>,

        /// Queue jobs are submitted to
        #[arg(long)]
        queue: Option<String>,

        /// Create without arming
        #[arg(long)]
        disabled: bool,
    },

    /// Show one schedule
    #[command(name = "get")]
    Get {
        id: Uuid,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// List all schedules
    #[command(name = "list")]
    List {
        #[arg(long)]
        json: bool,
    },

    /// Change fields of a schedule
    #[command(name = "update")]
    Update {
        id: Uuid,

        #[arg(long)]
        cron: Option<String>,

        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        payload: Option<String>,

        #[arg(long)]
        queue: Option<String>,
    },

    /// Delete a schedule
    #[command(name = "delete")]
    Delete { id: Uuid },

    /// Reset a failed schedule's error count and re-arm it
    #[command(name = "retry")]
    Retry { id: Uuid },

    /// Stop firing until resumed
    #[command(name = "pause")]
    Pause { id: Uuid },

    #[command(name = "resume")]
    Resume { id: Uuid },

    /// Next fires in time order
    #[command(name = "upcoming")]
    Upcoming {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

pub async fn run(app: &App, args: ScheduleArgs) -> Result<()> {
    let scheduler = &app.scheduler;
    match args.command {
        ScheduleCommand::Create {
            workflow,
            cron,
            name,
            payload,
            queue,
            disabled,
        } => {
            let mut new = NewSchedule::new(workflow, cron);
            if let Some(name) = name {
                new = new.with_name(name);
            }
            if let Some(payload) = payload {
                new = new.with_payload(parse_json(&payload)?);
            }
            new.queue = queue;
            if disabled {
                new = new.disabled();
            }
            if app.executor.store().get_definition(&new.workflow_id).await?.is_none() {
                print_warning(&format!(
                    "Workflow '{}' is not registered; its jobs will fail until it is",
                    new.workflow_id
                ));
            }
            let schedule = scheduler.create(new).await.context("Failed to create schedule")?;
            print_success(&format!("Schedule {} created", schedule.id));
            show(&schedule);
        }
        ScheduleCommand::Get { id, json } => {
            let schedule = scheduler.get(id).await?;
            if json {
                print_json(&schedule)?;
            } else {
                show(&schedule);
            }
        }
        ScheduleCommand::List { json } => {
            let schedules = scheduler.list().await?;
            if json {
                print_json(&schedules)?;
            } else {
                list(&schedules);
            }
        }
        ScheduleCommand::Update {
            id,
            cron,
            enabled,
            name,
            workflow,
            payload,
            queue,
        } => {
            let patch = SchedulePatch {
                cron,
                enabled,
                name,
                workflow_id: workflow,
                payload: payload.as_deref().map(parse_json).transpose()?,
                queue,
                ..Default::default()
            };
            if patch.is_empty() {
                print_warning("Nothing to update");
                return Ok(());
            }
            let schedule = scheduler.update(id, patch).await.context("Failed to update schedule")?;
            print_success(&format!("Schedule {} updated", schedule.id));
            show(&schedule);
        }
        ScheduleCommand::Delete { id } => {
            scheduler.delete(id).await?;
            print_success(&format!("Schedule {} deleted", id));
        }
        ScheduleCommand::Retry { id } => {
            let schedule = scheduler.retry(id).await?;
            print_success(&format!("Schedule {} re-armed", schedule.id));
            show(&schedule);
        }
        ScheduleCommand::Pause { id } => {
            scheduler.pause(id).await?;
            print_success(&format!("Schedule {} paused", id));
        }
        ScheduleCommand::Resume { id } => {
            let schedule = scheduler.resume(id).await?;
            print_success(&format!(
                "Schedule {} resumed, next run {}",
                schedule.id,
                time(schedule.next_run_at)
            ));
        }
        ScheduleCommand::Upcoming { limit } => {
            let schedules = scheduler.upcoming(limit).await?;
            let mut t = table(&["Next run (UTC)", "ID", "Workflow", "Cron"]);
            for s in &schedules {
                t.add_row(vec![
                    Cell::new(time(s.next_run_at)).fg(Color::Green),
                    Cell::new(s.id),
                    Cell::new(&s.workflow_id),
                    Cell::new(&s.cron),
                ]);
            }
            println!("{t}");
        }
    }
    Ok(())
}

fn list(schedules: &[Schedule]) {
    if schedules.is_empty() {
        println!("No schedules");
        return;
    }
    let mut t = table(&["ID", "Name", "Workflow", "Cron", "Status", "Next run", "Last run", "Failures"]);
    for s in schedules {
        let state = if s.enabled { s.status.as_str() } else { "disabled" };
        t.add_row(vec![
            Cell::new(s.id),
            Cell::new(s.name.as_deref().unwrap_or("-")),
            Cell::new(&s.workflow_id),
            Cell::new(&s.cron),
            status_cell(state),
            Cell::new(time(s.next_run_at)),
            Cell::new(time(s.last_run_at)),
            Cell::new(s.retry_count),
        ]);
    }
    println!("{t}");
}

fn show(s: &Schedule) {
    println!();
    println!("  {} {}", "ID:".dimmed(), s.id);
    if let Some(name) = &s.name {
        println!("  {} {}", "Name:".dimmed(), name);
    }
    println!("  {} {}", "Workflow:".dimmed(), s.workflow_id.green());
    println!("  {} {}", "Cron:".dimmed(), s.cron);
    println!("  {} {}", "Queue:".dimmed(), s.queue);
    println!("  {} {}", "Status:".dimmed(), status(s.status.as_str()));
    println!("  {} {}", "Enabled:".dimmed(), s.enabled);
    println!("  {} {}", "Next run:".dimmed(), time(s.next_run_at));
    println!("  {} {}", "Last run:".dimmed(), time(s.last_run_at));
    if let Some(job) = s.last_job_id {
        println!("  {} {}", "Last job:".dimmed(), job);
    }
    if s.retry_count > 0 {
        println!("  {} {}", "Failures:".dimmed(), s.retry_count.to_string().red());
    }
    if let Some(err) = &s.last_error {
        println!("  {} {}", "Last error:".dimmed(), truncate(err, 200).red());
    }
    println!();
}
