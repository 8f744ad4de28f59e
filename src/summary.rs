//! Result object and user-visible summary (spec.md §6).
//!
//! Grounded on the teacher's hand-rolled RFC3339 formatter in `run.rs`:
//! plain arithmetic, no date/time crate pulled in for something this small.

use serde::Serialize;
use std::time::Duration;

use crate::plan::{LibStatus, PackageType, PlanRow};

/// Plan rows augmented with execution fields, plus the derived summary
/// (spec.md §6 Result object).
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    pub rows: Vec<RowReport>,
    pub summary: Summary,
}

/// JSON-friendly projection of a finished [`PlanRow`].
#[derive(Debug, Serialize)]
pub struct RowReport {
    pub package: String,
    pub version: String,
    pub build_done: bool,
    pub install_done: bool,
    pub build_error: bool,
    pub install_error: bool,
    pub build_seconds: Option<f64>,
    pub install_seconds: Option<f64>,
    pub lib_status: LibStatus,
    pub install_note: String,
}

/// Counts and cumulative timings printed on completion (spec.md §6).
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub installed: usize,
    pub updated: usize,
    pub not_updated: usize,
    pub current: usize,
    pub build_time_human: String,
    pub install_time_human: String,
}

/// Install-time note (spec.md §6, display only).
pub fn install_note(row: &PlanRow) -> String {
    match row.kind {
        PackageType::Cran | PackageType::Standard => {
            // `standard` with non-standard sub-provenance metadata still
            // gets a parenthetical note; CRAN and ordinary standard rows
            // get none.
            if row.kind == PackageType::Standard {
                if let Some(provenance) = row.metadata.get("RemoteType") {
                    if provenance != "standard" {
                        return format!("({provenance})");
                    }
                }
            }
            String::new()
        }
        PackageType::Bioc => "(BioC)".to_string(),
        PackageType::Local => "(local)".to_string(),
        PackageType::Github => {
            let user = row.metadata.get("RemoteUsername").map(String::as_str).unwrap_or("?");
            let repo = row.metadata.get("RemoteRepo").map(String::as_str).unwrap_or("?");
            let sha = row
                .metadata
                .get("RemoteSha")
                .map(|s| s.chars().take(7).collect::<String>())
                .unwrap_or_else(|| "???????".to_string());
            format!("(github::{user}/{repo}@{sha})")
        }
        PackageType::Deps | PackageType::Installed => String::new(),
    }
}

/// Format a duration the way the teacher formats timestamps: plain integer
/// arithmetic, no external crate.
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Build the final [`ExecutionReport`] from completed plan rows.
pub fn build_report(rows: &[PlanRow]) -> ExecutionReport {
    let mut summary = Summary::default();
    let mut build_total = Duration::ZERO;
    let mut install_total = Duration::ZERO;

    let mut row_reports = Vec::with_capacity(rows.len());
    for row in rows {
        match row.lib_status {
            LibStatus::New => summary.installed += 1,
            LibStatus::Update => summary.updated += 1,
            LibStatus::NoUpdate => summary.not_updated += 1,
            LibStatus::Current => summary.current += 1,
        }
        if let Some(d) = row.build_time.elapsed() {
            build_total += d;
        }
        if let Some(d) = row.install_time.elapsed() {
            install_total += d;
        }
        row_reports.push(RowReport {
            package: row.package.clone(),
            version: row.version.clone(),
            build_done: row.build_done,
            install_done: row.install_done,
            build_error: row.build_error,
            install_error: row.install_error,
            build_seconds: row.build_time.elapsed().map(|d| d.as_secs_f64()),
            install_seconds: row.install_time.elapsed().map(|d| d.as_secs_f64()),
            lib_status: row.lib_status,
            install_note: install_note(row),
        });
    }

    summary.build_time_human = format_duration(build_total);
    summary.install_time_human = format_duration(install_total);

    ExecutionReport {
        rows: row_reports,
        summary,
    }
}
