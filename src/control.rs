//! On-demand schedule changes and background sweeps while live monitoring runs.
//!
//! Requests arrive through the stats server (kinds 4-6). Every schedule goes
//! through [`Schedule::build`] before the applier sees it, and the applied
//! mirror is published only after the switch accepted the change. One sweep
//! at a time; manual changes are refused while it runs.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::analyzer::GapAnalyzer;
use crate::config::SystemConfig;
use crate::presets;
use crate::report;
use crate::schedule::{us_to_ns, AppliedSchedule, EntrySpec, Schedule};
use crate::state::SnapshotCell;
use crate::stats_server::QueryKind;
use crate::sweep::{SweepOrchestrator, SweepProgress};
use crate::traits::{Capturer, ScheduleApplier};

/// One applier shared by manual changes and the sweep thread, so only one
/// configuration document is in flight at a time.
#[derive(Clone)]
pub struct SharedApplier {
    inner: Arc<Mutex<Box<dyn ScheduleApplier + Send>>>,
}

impl SharedApplier {
    pub fn new(applier: Box<dyn ScheduleApplier + Send>) -> Self {
        SharedApplier { inner: Arc::new(Mutex::new(applier)) }
    }
}

impl ScheduleApplier for SharedApplier {
    fn apply(&mut self, schedule: &Schedule) -> Result<()> {
        let mut applier = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        applier.apply(schedule)
    }
}

/// Kind 4 payload: open/close schedule, `open_us` defaults to the whole cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    pub cycle_us: u64,
    #[serde(default)]
    pub open_us: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryUs {
    pub gate: i64,
    pub duration_us: i64,
}

/// Kind 5 payload: explicit gate-control list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateListRequest {
    pub cycle_us: u64,
    pub entries: Vec<EntryUs>,
}

/// Kind 6 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    pub preset: String,
}

pub type CapturerFactory = Box<dyn Fn() -> Box<dyn Capturer + Send> + Send + Sync>;

/// Clears the running flag when the sweep thread ends, panics included.
struct SweepRunning(Arc<AtomicBool>);

impl Drop for SweepRunning {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("Malformed request payload")
}

pub struct ControlPlane {
    config: SystemConfig,
    applier: SharedApplier,
    new_capturer: CapturerFactory,
    stop: Arc<AtomicBool>,
    applied: Arc<SnapshotCell<AppliedSchedule>>,
    sweep: Arc<SnapshotCell<SweepProgress>>,
    sweep_running: Arc<AtomicBool>,
    sweep_thread: Mutex<Option<JoinHandle<()>>>,
    report_dir: PathBuf,
}

impl ControlPlane {
    pub fn new(
        config: SystemConfig,
        applier: SharedApplier,
        new_capturer: CapturerFactory,
        stop: Arc<AtomicBool>,
    ) -> Self {
        ControlPlane {
            config,
            applier,
            new_capturer,
            stop,
            applied: Arc::new(SnapshotCell::default()),
            sweep: Arc::new(SnapshotCell::default()),
            sweep_running: Arc::new(AtomicBool::new(false)),
            sweep_thread: Mutex::new(None),
            report_dir: PathBuf::from("results"),
        }
    }

    pub fn with_applied(mut self, applied: Arc<SnapshotCell<AppliedSchedule>>) -> Self {
        self.applied = applied;
        self
    }

    pub fn with_progress(mut self, sweep: Arc<SnapshotCell<SweepProgress>>) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    pub fn sweep_running(&self) -> bool {
        self.sweep_running.load(Ordering::SeqCst)
    }

    pub fn apply_gate(&self, cycle_us: u64, open_us: Option<u64>) -> Result<AppliedSchedule> {
        let cycle_ns = us_to_ns(cycle_us)?;
        let open_ns = us_to_ns(open_us.unwrap_or(cycle_us).min(cycle_us))?;
        let schedule = Schedule::open_close(cycle_ns, open_ns)?;
        self.apply(&schedule)
    }

    pub fn apply_entries(&self, cycle_us: u64, entries: &[EntryUs]) -> Result<AppliedSchedule> {
        let cycle_ns = us_to_ns(cycle_us)?;
        let specs = entries
            .iter()
            .map(|e| {
                EntrySpec::checked_us(e.gate, e.duration_us)
                    .ok_or_else(|| anyhow!("entry duration {}us out of range", e.duration_us))
            })
            .collect::<Result<Vec<_>>>()?;
        let schedule = Schedule::build(cycle_ns, &specs)?;
        self.apply(&schedule)
    }

    fn apply(&self, schedule: &Schedule) -> Result<AppliedSchedule> {
        if self.sweep_running() {
            return Err(anyhow!("sweep in progress, schedule change refused"));
        }
        let tc = self.config.sweep.monitored_traffic_class;
        info!("[Control] Applying {}", schedule.describe(tc));
        self.applier.clone().apply(schedule)?;
        let applied = AppliedSchedule::from_schedule(schedule, tc);
        self.applied.publish(applied.clone());
        Ok(applied)
    }

    /// Start `preset` on a background thread. Returns the number of steps.
    pub fn start_sweep(&self, preset: &str) -> Result<usize> {
        let plan = presets::preset(preset)?;
        if self
            .sweep_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!("sweep already running"));
        }
        let running = SweepRunning(self.sweep_running.clone());

        let mut orchestrator = SweepOrchestrator::new(
            self.applier.clone(),
            (self.new_capturer)(),
            GapAnalyzer::new(self.config.analyzer.clone()),
            self.config.sweep.clone(),
            self.stop.clone(),
        )
        .with_progress(self.sweep.clone())
        .with_applied(self.applied.clone());

        let total = plan.len();
        let config = self.config.clone();
        let name = preset.to_string();
        let output = report::default_report_path(&self.report_dir, preset);
        info!("[Control] Starting {} sweep ({} steps)", name, total);

        let handle = thread::Builder::new().name("sweep".to_string()).spawn(move || {
            let _running = running;
            let started_at = Utc::now();
            let results = orchestrator.run(&plan);
            if let Err(e) = report::save_sweep(&config, &name, started_at, &results, &output) {
                error!("[Report] {:#}", e);
            }
        })?;

        let previous = self.sweep_thread.lock().unwrap_or_else(|p| p.into_inner()).replace(handle);
        if let Some(previous) = previous {
            let _ = previous.join();
        }
        Ok(total)
    }

    /// Block until the background sweep, if any, has finished.
    pub fn wait_for_sweep(&self) {
        let handle = self.sweep_thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("[Control] Sweep thread panicked");
            }
        }
    }

    /// Answer one control request. Failures come back as `ok: false`.
    pub fn handle(&self, kind: QueryKind, payload: &[u8]) -> serde_json::Value {
        let outcome = match kind {
            QueryKind::ApplyGate => parse::<GateRequest>(payload)
                .and_then(|r| self.apply_gate(r.cycle_us, r.open_us))
                .map(|applied| json!({ "ok": true, "applied": applied })),
            QueryKind::ApplyEntries => parse::<GateListRequest>(payload)
                .and_then(|r| self.apply_entries(r.cycle_us, &r.entries))
                .map(|applied| json!({ "ok": true, "applied": applied })),
            QueryKind::StartSweep => parse::<SweepRequest>(payload).and_then(|r| {
                let total = self.start_sweep(&r.preset)?;
                Ok(json!({ "ok": true, "preset": r.preset, "total": total }))
            }),
            _ => Err(anyhow!("kind {:?} is not a control request", kind)),
        };
        outcome.unwrap_or_else(|e| {
            warn!("[Control] Request refused: {:#}", e);
            json!({ "ok": false, "error": format!("{:#}", e) })
        })
    }
}
