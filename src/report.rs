//! Sweep report documents and console summary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::SystemConfig;
use crate::schedule::GATE_ALL;
use crate::sweep::{StepStatus, SweepResult};

/// Stdev spread across all-open steps below which the cycle time is ruled out
/// as a jitter source.
pub const JITTER_SPREAD_THRESHOLD_US: f64 = 50.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub total: usize,
    pub ok: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total: usize,
    pub ok: usize,
    pub config_failed: usize,
    pub capture_failed: usize,
    pub insufficient_data: usize,
    #[serde(default)]
    pub interrupted: usize,
    pub categories: BTreeMap<String, CategoryCount>,
}

impl SweepSummary {
    pub fn from_results(results: &[SweepResult]) -> Self {
        let mut summary = SweepSummary { total: results.len(), ..Default::default() };
        for r in results {
            match r.status {
                StepStatus::Ok => summary.ok += 1,
                StepStatus::ConfigFailed => summary.config_failed += 1,
                StepStatus::CaptureFailed => summary.capture_failed += 1,
                StepStatus::InsufficientData => summary.insufficient_data += 1,
                StepStatus::Interrupted => summary.interrupted += 1,
            }
            let key = if r.category.is_empty() { "uncategorized" } else { r.category.as_str() };
            let count = summary.categories.entry(key.to_string()).or_default();
            count.total += 1;
            if r.is_ok() {
                count.ok += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterVerdict {
    pub all_open_steps: Vec<String>,
    pub stdev_min_us: f64,
    pub stdev_max_us: f64,
    pub spread_us: f64,
    pub cycle_is_factor: bool,
    pub message: String,
}

fn is_all_open(r: &SweepResult) -> bool {
    !r.entries.is_empty() && r.entries.iter().all(|e| e.gate_mask == GATE_ALL)
}

/// Does gap jitter change with the cycle time when every gate stays open?
/// Needs at least two successful all-open steps.
pub fn jitter_verdict(results: &[SweepResult], threshold_us: f64) -> Option<JitterVerdict> {
    let open: Vec<&SweepResult> = results.iter().filter(|r| r.is_ok() && is_all_open(r)).collect();
    if open.len() < 2 {
        return None;
    }
    let stdevs: Vec<f64> = open.iter().map(|r| r.report.gap_stdev_us).collect();
    let min = stdevs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = stdevs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread = max - min;
    let cycle_is_factor = spread >= threshold_us;
    let message = if cycle_is_factor {
        format!(
            "Jitter varies with cycle time (spread {:.0}µs): gate transitions are a factor",
            spread
        )
    } else {
        format!(
            "Jitter is similar across cycle times (spread {:.0}µs): cycle time is not the cause, \
             look at the host adapter or switch store-and-forward latency",
            spread
        )
    };
    Some(JitterVerdict {
        all_open_steps: open.iter().map(|r| r.label.clone()).collect(),
        stdev_min_us: min,
        stdev_max_us: max,
        spread_us: spread,
        cycle_is_factor,
        message,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: String,
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_sec: f64,
    pub config: SystemConfig,
    pub summary: SweepSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_verdict: Option<JitterVerdict>,
    pub results: Vec<SweepResult>,
}

impl SweepReport {
    pub fn new(
        run_id: &str,
        plan: &str,
        started_at: DateTime<Utc>,
        config: &SystemConfig,
        results: &[SweepResult],
    ) -> Self {
        let finished_at = Utc::now();
        SweepReport {
            run_id: run_id.to_string(),
            plan: plan.to_string(),
            started_at,
            finished_at,
            elapsed_sec: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
            config: config.clone(),
            summary: SweepSummary::from_results(results),
            jitter_verdict: jitter_verdict(results, JITTER_SPREAD_THRESHOLD_US),
            results: results.iter().map(SweepResult::without_samples).collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSamples {
    pub label: String,
    pub gap_samples_us: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplesDocument {
    pub run_id: String,
    pub samples: Vec<LabelSamples>,
}

impl SamplesDocument {
    pub fn new(run_id: &str, results: &[SweepResult]) -> Self {
        SamplesDocument {
            run_id: run_id.to_string(),
            samples: results
                .iter()
                .filter(|r| !r.report.gap_samples.is_empty())
                .map(|r| LabelSamples {
                    label: r.label.clone(),
                    gap_samples_us: r.report.gap_samples.clone(),
                })
                .collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

/// `results/run.json` -> `results/run.samples.json`
pub fn samples_path(report_path: &Path) -> PathBuf {
    let stem = report_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    report_path.with_file_name(format!("{}.samples.json", stem))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// `results/tas_<plan>_<local time>.json`
pub fn default_report_path(dir: &Path, plan: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("tas_{}_{}.json", plan, stamp))
}

/// Log the summary and write the report plus its samples file.
pub fn save_sweep(
    config: &SystemConfig,
    plan: &str,
    started_at: DateTime<Utc>,
    results: &[SweepResult],
    output: &Path,
) -> Result<()> {
    for line in summary_table(results) {
        info!("{}", line);
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let report = SweepReport::new(&run_id, plan, started_at, config, results);
    if let Some(verdict) = &report.jitter_verdict {
        info!("[Report] {}", verdict.message);
    }
    info!(
        "[Report] {}/{} steps ok in {:.0}s",
        report.summary.ok, report.summary.total, report.elapsed_sec
    );
    for (category, count) in &report.summary.categories {
        info!("[Report]   {:<16} {}/{}", category, count.ok, count.total);
    }

    report.write(output)?;
    let samples = samples_path(output);
    SamplesDocument::new(&run_id, results).write(&samples)?;
    info!("[Report] Saved {} and {}", output.display(), samples.display());
    Ok(())
}

/// Fixed-width comparison table, one line per step.
pub fn summary_table(results: &[SweepResult]) -> Vec<String> {
    let mut lines = vec![
        format!(
            "{:<30} {:<14} {:>6} {:>6} {:>8} {:>8} {:>8} {:>7} {:>8} {:>12}",
            "Label",
            "Category",
            "Pkts",
            "Cmpl%",
            "GapSD",
            "P99",
            "Max",
            "Burst%",
            "BurstMax",
            "Loss"
        ),
        "-".repeat(118),
    ];
    for r in results {
        if r.status != StepStatus::Ok {
            let status = serde_json::to_value(r.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            lines.push(format!("{:<30} {:<14} {:>6}", r.label, r.category, status.to_uppercase()));
            continue;
        }
        let rep = &r.report;
        lines.push(format!(
            "{:<30} {:<14} {:>6} {:>5.1}% {:>7.0}µ {:>7.0}µ {:>7.0}µ {:>6.1}% {:>8} {:>12}",
            r.label,
            r.category,
            rep.packet_count,
            rep.completeness,
            rep.gap_stdev_us,
            rep.percentile(99.0).unwrap_or(0.0),
            rep.gap_max_us,
            rep.buckets.burst_pct,
            rep.burst_runs.run_max,
            rep.loss_pattern.as_str()
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::GapAnalyzer;
    use crate::config::AnalyzerConfig;
    use crate::schedule::Schedule;
    use std::time::{Duration, Instant};

    fn result(
        label: &str,
        category: &str,
        schedule: &Schedule,
        jitter_us: u64,
        status: StepStatus,
    ) -> SweepResult {
        let base = Instant::now();
        let mut t = base;
        let mut ts = vec![t];
        for i in 0..500u64 {
            t += Duration::from_micros(if i % 2 == 0 { 781 - jitter_us } else { 781 + jitter_us });
            ts.push(t);
        }
        SweepResult {
            label: label.to_string(),
            category: category.to_string(),
            cycle_ns: schedule.cycle_ns(),
            open_ns: schedule.open_ns_for(0),
            open_pct: schedule.open_pct_for(0),
            entries: schedule.entries().to_vec(),
            capture_secs: 1.0,
            status,
            error: None,
            report: GapAnalyzer::new(AnalyzerConfig::default()).analyze(&ts),
        }
    }

    fn open(cycle_ms: u64) -> Schedule {
        Schedule::all_open(cycle_ms * 1_000_000).unwrap()
    }

    #[test]
    fn test_summary_counts_per_category() {
        let gated = Schedule::from_percent(1_000_000, 50.0).unwrap();
        let results = vec![
            result("a", "all_open", &open(1), 10, StepStatus::Ok),
            result("b", "gated", &gated, 10, StepStatus::Ok),
            result("c", "gated", &gated, 10, StepStatus::ConfigFailed),
            result("d", "", &gated, 10, StepStatus::InsufficientData),
        ];
        let s = SweepSummary::from_results(&results);
        assert_eq!(s.total, 4);
        assert_eq!(s.ok, 2);
        assert_eq!(s.config_failed, 1);
        assert_eq!(s.insufficient_data, 1);
        assert_eq!(s.categories["gated"], CategoryCount { total: 2, ok: 1 });
        assert_eq!(s.categories["uncategorized"].total, 1);
    }

    #[test]
    fn test_jitter_verdict_similar_and_varying() {
        let gated = Schedule::from_percent(1_000_000, 50.0).unwrap();
        let similar = vec![
            result("All-Open (1ms cycle)", "all_open", &open(1), 100, StepStatus::Ok),
            result("All-Open (10ms cycle)", "all_open", &open(10), 110, StepStatus::Ok),
            result("1ms/50%", "gated", &gated, 400, StepStatus::Ok),
        ];
        let v = jitter_verdict(&similar, JITTER_SPREAD_THRESHOLD_US).unwrap();
        assert_eq!(v.all_open_steps.len(), 2);
        assert!(!v.cycle_is_factor);
        assert!(v.spread_us < 50.0);

        let varying = vec![
            result("All-Open (1ms cycle)", "all_open", &open(1), 10, StepStatus::Ok),
            result("All-Open (100ms cycle)", "all_open", &open(100), 300, StepStatus::Ok),
        ];
        assert!(jitter_verdict(&varying, JITTER_SPREAD_THRESHOLD_US).unwrap().cycle_is_factor);

        let single = vec![result("All-Open", "all_open", &open(1), 10, StepStatus::Ok)];
        assert!(jitter_verdict(&single, JITTER_SPREAD_THRESHOLD_US).is_none());
    }

    #[test]
    fn test_report_and_samples_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("sweep.json");
        let results = vec![result("a", "basic", &open(1), 5, StepStatus::Ok)];
        assert!(!results[0].report.gap_samples.is_empty());

        let config = SystemConfig::default();
        let report = SweepReport::new("run-1", "basic", Utc::now(), &config, &results);
        report.write(&path).unwrap();
        let samples = samples_path(&path);
        assert_eq!(samples.file_name().unwrap(), "sweep.samples.json");
        SamplesDocument::new("run-1", &results).write(&samples).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["run_id"], "run-1");
        assert_eq!(doc["summary"]["ok"], 1);
        assert!(doc["results"][0]["report"].get("gap_samples").is_none());
        assert_eq!(doc["results"][0]["status"], "ok");

        let back: SamplesDocument =
            serde_json::from_str(&std::fs::read_to_string(&samples).unwrap()).unwrap();
        assert_eq!(back.samples[0].label, "a");
        assert_eq!(back.samples[0].gap_samples_us.len(), 500);
    }

    #[test]
    fn test_summary_table_rows() {
        let gated = Schedule::from_percent(1_000_000, 50.0).unwrap();
        let results = vec![
            result("1ms/50%", "basic", &gated, 5, StepStatus::Ok),
            result("bad", "basic", &gated, 5, StepStatus::ConfigFailed),
            result("stopped", "basic", &gated, 5, StepStatus::Interrupted),
        ];
        let lines = summary_table(&results);
        assert_eq!(lines.len(), 5);
        assert!(lines[2].starts_with("1ms/50%"));
        assert!(lines[2].contains("none"));
        assert!(lines[3].contains("CONFIG_FAILED"));
        assert!(lines[4].contains("INTERRUPTED"));
        assert_eq!(SweepSummary::from_results(&results).interrupted, 1);
    }

    #[test]
    fn test_save_sweep_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_report_path(dir.path(), "basic");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tas_basic_") && name.ends_with(".json"), "{}", name);

        let results = vec![result("a", "basic", &open(1), 5, StepStatus::Ok)];
        save_sweep(&SystemConfig::default(), "basic", Utc::now(), &results, &path).unwrap();
        assert!(path.exists());
        assert!(samples_path(&path).exists());
    }
}
