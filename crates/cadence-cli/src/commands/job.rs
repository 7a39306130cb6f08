//! Job command - submit and inspect queued work
//!
//! Usage:
//! ```bash
//! cadence job submit lead-import '{"source": "crm"}'
//! cadence job list --status running
//! cadence job cancel <id>
//! cadence job dead-letters
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::Cell;
use uuid::Uuid;

use cadence_queue::{JobEntry, JobFilter, JobStatus, NewJob};

use super::{parse_json, print_json, status, status_cell, table, time, truncate};
use crate::app::App;
use crate::{print_info, print_success, print_warning};

#[derive(Args)]
pub struct JobArgs {
    #[command(subcommand)]
    command: JobCommand,
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Enqueue a workflow run
    #[command(name = "submit")]
    Submit {
        /// Workflow to run
        workflow: String,

        /// JSON parameters for the run
        #[arg(default_value = "{}")]
        payload: String,

        #[arg(long)]
        queue: Option<String>,

        /// Higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Executions before the job is dead-lettered
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Resubmitting with the same key returns the existing job
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Show one job with its error history
    #[command(name = "get")]
    Get {
        id: Uuid,

        #[arg(long)]
        json: bool,
    },

    /// List jobs, newest first
    #[command(name = "list")]
    List {
        /// queued, running, completed, failed, dead_lettered or cancelled
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        queue: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Cancel a queued job, or ask a running one to stop
    #[command(name = "cancel")]
    Cancel { id: Uuid },

    /// Jobs that exhausted their retry budget
    #[command(name = "dead-letters")]
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
}

pub async fn run(app: &App, args: JobArgs) -> Result<()> {
    let queue = &app.queue;
    match args.command {
        JobCommand::Submit {
            workflow,
            payload,
            queue: queue_name,
            priority,
            max_attempts,
            idempotency_key,
        } => {
            let mut job = NewJob::new(workflow, parse_json(&payload)?)
                .with_priority(priority)
                .with_max_attempts(max_attempts.unwrap_or(app.settings.scheduler.job_max_attempts))
                .with_backoff_base_ms(app.settings.scheduler.job_backoff_base_ms);
            if let Some(name) = queue_name {
                job = job.on_queue(name);
            }
            if let Some(key) = idempotency_key {
                job = job.with_idempotency_key(key);
            }
            let enqueued = queue.enqueue(job).await.context("Failed to enqueue job")?;
            if enqueued.deduplicated {
                print_info(&format!("Existing job {} returned for this idempotency key", enqueued.id));
            } else {
                print_success(&format!("Job {} queued", enqueued.id));
            }
        }
        JobCommand::Get { id, json } => {
            let job = queue.get_job(id).await?;
            if json {
                print_json(&job)?;
            } else {
                show(&job);
            }
        }
        JobCommand::List {
            status: status_name,
            workflow,
            queue: queue_name,
            limit,
            json,
        } => {
            let status = status_name
                .as_deref()
                .map(|s| JobStatus::parse(s).ok_or_else(|| anyhow!("Unknown job status '{}'", s)))
                .transpose()?;
            let filter = JobFilter {
                status,
                workflow_id: workflow,
                queue: queue_name,
                schedule_id: None,
                limit,
            };
            let jobs = queue.list_jobs(&filter).await?;
            if json {
                print_json(&jobs)?;
            } else {
                list(&jobs);
            }
        }
        JobCommand::Cancel { id } => {
            let job = queue.cancel(id).await?;
            match job.status {
                JobStatus::Cancelled => print_success(&format!("Job {} cancelled", id)),
                JobStatus::Running => print_info(&format!(
                    "Job {} is running; it stops at its next step boundary",
                    id
                )),
                other => print_warning(&format!("Job {} already {}", id, other)),
            }
        }
        JobCommand::DeadLetters { limit, json } => {
            let jobs = queue.dead_letters(limit).await?;
            if json {
                print_json(&jobs)?;
            } else {
                list(&jobs);
            }
        }
    }
    Ok(())
}

fn list(jobs: &[JobEntry]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    let mut t = table(&["ID", "Workflow", "Queue", "Status", "Attempts", "Progress", "Updated", "Last error"]);
    for job in jobs {
        t.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.workflow_id),
            Cell::new(&job.queue),
            status_cell(job.status.as_str()),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(format!("{}%", job.progress)),
            Cell::new(time(Some(job.updated_at))),
            Cell::new(truncate(job.last_error.as_deref().unwrap_or(""), 40)),
        ]);
    }
    println!("{t}");
}

fn show(job: &JobEntry) {
    println!();
    println!("  {} {}", "ID:".dimmed(), job.id);
    println!("  {} {}", "Workflow:".dimmed(), job.workflow_id.green());
    println!("  {} {}", "Queue:".dimmed(), job.queue);
    println!("  {} {}", "Status:".dimmed(), status(job.status.as_str()));
    if job.cancel_requested && !job.status.is_terminal() {
        println!("  {} {}", "Cancel:".dimmed(), "requested".yellow());
    }
    println!("  {} {}/{}", "Attempts:".dimmed(), job.attempts, job.max_attempts);
    println!("  {} {}%", "Progress:".dimmed(), job.progress);
    println!("  {} {}", "Created:".dimmed(), time(Some(job.created_at)));
    println!("  {} {}", "Started:".dimmed(), time(job.started_at));
    println!("  {} {}", "Completed:".dimmed(), time(job.completed_at));
    if let Some(owner) = &job.owner {
        println!("  {} {} (lease until {})", "Owner:".dimmed(), owner, time(job.lease_expires_at));
    }
    if let Some(schedule) = job.schedule_id {
        println!("  {} {}", "Schedule:".dimmed(), schedule);
    }
    if let Some(result) = &job.result {
        println!("  {} {}", "Result:".dimmed(), result);
    }
    if !job.error_history.is_empty() {
        println!();
        println!("{}", "Error history:".bold());
        for failure in &job.error_history {
            println!(
                "  {} #{} {}",
                time(Some(failure.at)).dimmed(),
                failure.attempt,
                failure.error.red()
            );
        }
    }
    println!();
}
