//! Result files written at the end of a completed scan.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::config::ScanConfig;
use crate::types::{RankedEntry, ScanSummary, ValidationState};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanInfo {
    pub domain: String,
    pub dns_type: String,
    pub validation_enabled: bool,
    pub total_found: u64,
    pub total_passed_validation: u64,
    pub total_saved: usize,
    pub elapsed_seconds: f64,
    pub timestamp: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub scan_info: ScanInfo,
    pub servers: Vec<String>,
}

/// Paths of the files produced by [`write_results`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFiles {
    pub text: PathBuf,
    pub json: PathBuf,
}

/// Addresses worth keeping, in ranking order: only validated ones when
/// validation ran, otherwise everything found.
pub fn saved_addresses(summary: &ScanSummary) -> Vec<String> {
    summary
        .ranked
        .iter()
        .filter(|e| !summary.validation_enabled || e.validation == ValidationState::Success)
        .map(|e| e.address.clone())
        .collect()
}

pub fn build_report(summary: &ScanSummary, cfg: &ScanConfig, now: OffsetDateTime) -> ScanReport {
    let servers = saved_addresses(summary);
    ScanReport {
        scan_info: ScanInfo {
            domain: cfg.domain.clone(),
            dns_type: cfg.record_type.to_string(),
            validation_enabled: summary.validation_enabled,
            total_found: summary.status.found,
            total_passed_validation: summary.status.passed,
            total_saved: servers.len(),
            elapsed_seconds: (summary.status.elapsed_secs * 100.0).round() / 100.0,
            timestamp: now.format(&Rfc3339).unwrap_or_default(),
        },
        servers,
    }
}

/// `scan_2025-01-31_23-59-07`
pub fn file_stem(now: OffsetDateTime) -> String {
    format!(
        "scan_{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Writes the text and JSON result files into `dir`. Returns `None` when
/// there is nothing to save.
pub fn write_results(
    dir: &Path,
    summary: &ScanSummary,
    cfg: &ScanConfig,
) -> Result<Option<WrittenFiles>> {
    let now = OffsetDateTime::now_utc();
    let report = build_report(summary, cfg, now);
    if report.servers.is_empty() {
        info!("no resolvers to save");
        return Ok(None);
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let stem = file_stem(now);
    let text = dir.join(format!("{stem}.txt"));
    let json = dir.join(format!("{stem}.json"));

    write_text(&text, &report)?;
    let file = fs::File::create(&json)
        .with_context(|| format!("failed to create {}", json.display()))?;
    serde_json::to_writer_pretty(file, &report)
        .with_context(|| format!("failed to write {}", json.display()))?;

    info!(
        saved = report.servers.len(),
        text = %text.display(),
        json = %json.display(),
        "results written"
    );
    Ok(Some(WrittenFiles { text, json }))
}

fn write_text(path: &Path, report: &ScanReport) -> Result<()> {
    let mut f = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let info = &report.scan_info;
    writeln!(f, "# DNS resolver scan results")?;
    writeln!(f, "# Domain: {}", info.domain)?;
    writeln!(f, "# Record type: {}", info.dns_type)?;
    writeln!(f, "# Generated: {}", info.timestamp)?;
    writeln!(
        f,
        "# Validation: {}",
        if info.validation_enabled { "enabled" } else { "disabled" }
    )?;
    writeln!(f, "# Found: {}  Saved: {}", info.total_found, info.total_saved)?;
    writeln!(f)?;
    for server in &report.servers {
        writeln!(f, "{server}")?;
    }
    Ok(())
}

pub fn print_results_table(entries: &[RankedEntry]) {
    let addr_w = entries
        .iter()
        .map(|e| e.address.len())
        .max()
        .unwrap_or(0)
        .max("address".len());
    let lat_w = "latency_ms".len();
    let state_w = "not_requested".len();

    println!("\nResolvers found: {}", entries.len());
    println!(
        "{:<addr_w$}  {:>lat_w$}  {:<state_w$}",
        "address", "latency_ms", "validation"
    );
    println!("{:-<addr_w$}  {:-<lat_w$}  {:-<state_w$}", "", "", "");
    for e in entries {
        println!(
            "{:<addr_w$}  {:>lat_w$}  {:<state_w$}",
            e.address,
            e.latency_ms,
            state_label(e.validation)
        );
    }
}

fn state_label(state: ValidationState) -> &'static str {
    match state {
        ValidationState::NotRequested => "not_requested",
        ValidationState::Pending => "pending",
        ValidationState::Testing => "testing",
        ValidationState::Success => "success",
        ValidationState::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanOutcome, ScanStatus};
    use time::macros::datetime;

    fn entry(addr: &str, ms: u64, validation: ValidationState) -> RankedEntry {
        RankedEntry {
            address: addr.into(),
            latency_ms: ms,
            validation,
        }
    }

    fn summary(validation_enabled: bool, ranked: Vec<RankedEntry>) -> ScanSummary {
        ScanSummary {
            outcome: ScanOutcome::Completed,
            status: ScanStatus {
                found: ranked.len() as u64,
                elapsed_secs: 12.3456,
                ..ScanStatus::default()
            },
            validation_enabled,
            ranked,
        }
    }

    #[test]
    fn only_successes_saved_when_validating() {
        let s = summary(
            true,
            vec![
                entry("192.0.2.1", 40, ValidationState::Success),
                entry("192.0.2.2", 10, ValidationState::Failed),
                entry("192.0.2.3", 20, ValidationState::Pending),
            ],
        );
        assert_eq!(saved_addresses(&s), vec!["192.0.2.1".to_string()]);
    }

    #[test]
    fn everything_saved_without_validation() {
        let s = summary(
            false,
            vec![
                entry("192.0.2.2", 10, ValidationState::NotRequested),
                entry("192.0.2.1", 40, ValidationState::NotRequested),
            ],
        );
        assert_eq!(saved_addresses(&s), vec!["192.0.2.2", "192.0.2.1"]);
    }

    #[test]
    fn stem_is_zero_padded() {
        assert_eq!(file_stem(datetime!(2025-01-02 03:04:05 UTC)), "scan_2025-01-02_03-04-05");
    }

    #[test]
    fn report_rounds_elapsed() {
        let s = summary(false, vec![entry("192.0.2.1", 1, ValidationState::NotRequested)]);
        let cfg = ScanConfig::new("t.example.com");
        let report = build_report(&s, &cfg, datetime!(2025-01-02 03:04:05 UTC));
        assert_eq!(report.scan_info.elapsed_seconds, 12.35);
        assert_eq!(report.scan_info.dns_type, "A");
        assert_eq!(report.scan_info.timestamp, "2025-01-02T03:04:05Z");
        assert_eq!(report.scan_info.total_saved, 1);
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = summary(false, vec![entry("192.0.2.7", 3, ValidationState::NotRequested)]);
        let cfg = ScanConfig::new("t.example.com");
        let written = write_results(dir.path(), &s, &cfg).unwrap().unwrap();

        let text = std::fs::read_to_string(&written.text).unwrap();
        assert!(text.starts_with("# DNS resolver scan results"));
        assert!(text.lines().any(|l| l == "192.0.2.7"));

        let json: ScanReport =
            serde_json::from_str(&std::fs::read_to_string(&written.json).unwrap()).unwrap();
        assert_eq!(json.servers, vec!["192.0.2.7"]);
        assert_eq!(json.scan_info.domain, "t.example.com");
    }

    #[test]
    fn nothing_to_save_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let s = summary(true, vec![entry("192.0.2.7", 3, ValidationState::Failed)]);
        let cfg = ScanConfig::new("t.example.com");
        assert!(write_results(dir.path(), &s, &cfg).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
