//! Output formatting for simulation reports.

use colored::Colorize;
use rangekeep_storage::types::Liveness;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn parse(format: &str) -> Self {
        match format {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}

/// Per-store summary row.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct StoreRow {
    #[tabled(rename = "Store")]
    pub store: i32,

    #[tabled(rename = "Node")]
    pub node: i32,

    #[tabled(rename = "Status", display = "display_status")]
    pub status: Liveness,

    #[tabled(rename = "Replicas")]
    pub replicas: usize,

    #[tabled(rename = "Leases")]
    pub leases: usize,

    #[tabled(rename = "Available", display = "display_pct")]
    pub available_pct: f64,

    #[tabled(rename = "Processed")]
    pub processed: u64,

    #[tabled(rename = "Failed")]
    pub failed: u64,
}

fn display_status(status: &Liveness) -> String {
    match status {
        Liveness::Alive => status.to_string().green().to_string(),
        Liveness::Dead => status.to_string().red().to_string(),
        Liveness::Unknown => status.to_string().yellow().to_string(),
    }
}

fn display_pct(pct: &f64) -> String {
    format!("{pct:.2}%")
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub cycles: u32,
    pub converged: bool,
    pub changes: u64,
    pub ranges: usize,
    pub under_replicated: usize,
    pub over_replicated: usize,
    pub with_dead_replicas: usize,
    pub stores: Vec<StoreRow>,
}

/// Print the report in the specified format.
pub fn print_report(report: &SimReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!("{}", Table::new(&report.stores));
            println!();
            print_summary(report);
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string());
            println!("{}", json);
        }
    }
}

fn print_summary(report: &SimReport) {
    let status = if report.converged {
        "Converged:".green().bold()
    } else {
        "Not converged:".red().bold()
    };
    println!(
        "{} {} ranges after {} cycles ({} changes)",
        status, report.ranges, report.cycles, report.changes
    );

    if report.under_replicated > 0 {
        println!("{} {}", "Under-replicated:".yellow().bold(), report.under_replicated);
    }
    if report.over_replicated > 0 {
        println!("{} {}", "Over-replicated:".yellow().bold(), report.over_replicated);
    }
    if report.with_dead_replicas > 0 {
        println!("{} {}", "Dead replicas:".red().bold(), report.with_dead_replicas);
    }
}
