//! Workflow command - definitions and run history
//!
//! Usage:
//! ```bash
//! cadence workflow register lead-import.json
//! cadence workflow list
//! cadence workflow runs --workflow lead-import
//! cadence workflow show <run-id>
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::Cell;
use std::path::PathBuf;
use uuid::Uuid;

use cadence_runtime::{WorkflowDefinition, WorkflowRun};

use super::{print_json, status, status_cell, table, time, truncate};
use crate::app::App;
use crate::print_success;

#[derive(Args)]
pub struct WorkflowArgs {
    #[command(subcommand)]
    command: WorkflowCommand,
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate and store a workflow definition from a JSON file
    #[command(name = "register")]
    Register { file: PathBuf },

    /// List registered workflows
    #[command(name = "list")]
    List,

    /// Run history, newest first
    #[command(name = "runs")]
    Runs {
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run step by step
    #[command(name = "show")]
    Show {
        id: Uuid,

        #[arg(long)]
        json: bool,
    },
}

pub async fn run(app: &App, args: WorkflowArgs) -> Result<()> {
    match args.command {
        WorkflowCommand::Register { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let def: WorkflowDefinition = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid workflow definition in {}", file.display()))?;
            app.executor
                .register(&def)
                .await
                .with_context(|| format!("Workflow '{}' rejected", def.id))?;
            print_success(&format!("Workflow '{}' registered ({} steps)", def.id, def.steps.len()));
        }
        WorkflowCommand::List => {
            let defs = app.workflows().list_definitions().await?;
            if defs.is_empty() {
                println!("No workflows registered");
                return Ok(());
            }
            let mut t = table(&["ID", "Name", "Steps", "Continue on error"]);
            for def in &defs {
                let steps: Vec<String> = def
                    .steps
                    .iter()
                    .map(|s| format!("{}:{}", s.id, s.handler))
                    .collect();
                t.add_row(vec![
                    Cell::new(&def.id),
                    Cell::new(&def.name),
                    Cell::new(steps.join(" → ")),
                    Cell::new(def.continue_on_error),
                ]);
            }
            println!("{t}");
        }
        WorkflowCommand::Runs { workflow, limit } => {
            let runs = app.workflows().list_runs(workflow.as_deref(), limit).await?;
            if runs.is_empty() {
                println!("No runs");
                return Ok(());
            }
            let mut t = table(&["Run", "Workflow", "Status", "Steps", "Started", "Finished", "Error"]);
            for run in &runs {
                t.add_row(vec![
                    Cell::new(run.id),
                    Cell::new(&run.workflow_id),
                    status_cell(run.status.as_str()),
                    Cell::new(format!("{}/{}", run.completed_steps(), run.steps.len())),
                    Cell::new(time(Some(run.created_at))),
                    Cell::new(time(run.completed_at)),
                    Cell::new(truncate(run.error.as_deref().unwrap_or(""), 40)),
                ]);
            }
            println!("{t}");
        }
        WorkflowCommand::Show { id, json } => {
            let run = app
                .workflows()
                .get_run(id)
                .await?
                .ok_or_else(|| anyhow!("Run {} not found", id))?;
            if json {
                print_json(&run)?;
            } else {
                show(&run);
            }
        }
    }
    Ok(())
}

fn show(run: &WorkflowRun) {
    println!();
    println!("  {} {}", "Run:".dimmed(), run.id);
    println!("  {} {}", "Workflow:".dimmed(), run.workflow_id.green());
    println!("  {} {}", "Status:".dimmed(), status(run.status.as_str()));
    if let Some(job) = run.job_id {
        println!("  {} {}", "Job:".dimmed(), job);
    }
    if run.cancelled {
        println!("  {} {}", "Cancelled:".dimmed(), "yes".yellow());
    }
    println!("  {} {}", "Started:".dimmed(), time(Some(run.created_at)));
    println!("  {} {}", "Finished:".dimmed(), time(run.completed_at));
    if let Some(err) = &run.error {
        println!("  {} {}", "Error:".dimmed(), err.red());
    }
    println!();

    let mut t = table(&["#", "Step", "Handler", "Status", "Attempts", "Class", "Result / error"]);
    for (i, step) in run.steps.iter().enumerate() {
        let detail = match (&step.error, &step.result) {
            (Some(err), _) => err.clone(),
            (None, Some(result)) => result.to_string(),
            (None, None) => String::new(),
        };
        t.add_row(vec![
            Cell::new(i),
            Cell::new(&step.id),
            Cell::new(&step.handler),
            status_cell(step.status.as_str()),
            Cell::new(step.attempts),
            Cell::new(step.error_class.map(|c| format!("{:?}", c)).unwrap_or_default()),
            Cell::new(truncate(&detail, 60)),
        ]);
    }
    println!("{t}");
}
