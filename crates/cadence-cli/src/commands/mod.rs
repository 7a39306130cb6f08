//! CLI subcommands

pub mod info;
pub mod job;
pub mod schedule;
pub mod serve;
pub mod workflow;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use serde::Serialize;

/// Table with the house style and a cyan header row
pub(crate) fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub(crate) fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {}", raw))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Color a lifecycle status by how it ended
pub(crate) fn status(s: &str) -> ColoredString {
    match s {
        "completed" | "active" | "closed" => s.green(),
        "running" | "half_open" => s.blue(),
        "queued" | "pending" | "paused" | "skipped" => s.yellow(),
        "failed" | "dead_lettered" | "open" => s.red().bold(),
        _ => s.dimmed(),
    }
}

pub(crate) fn status_cell(s: &str) -> Cell {
    let color = match s {
        "completed" | "active" | "closed" => Color::Green,
        "running" | "half_open" => Color::Blue,
        "queued" | "pending" | "paused" | "skipped" => Color::Yellow,
        "failed" | "dead_lettered" | "open" => Color::Red,
        _ => Color::DarkGrey,
    };
    Cell::new(s).fg(color)
}

/// Shorten long free text for table cells
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("connection reset by peer", 10), "connectio…");
        assert_eq!(truncate("überlänge", 4), "übe…");
    }

    #[test]
    fn test_time_placeholder() {
        assert_eq!(time(None), "-");
    }

    #[test]
    fn test_parse_json_reports_input() {
        let err = parse_json("{nope").unwrap_err();
        assert!(err.to_string().contains("{nope"));
    }
}
