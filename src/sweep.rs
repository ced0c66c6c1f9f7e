//! Sweep state machine.
//!
//! For each planned configuration: apply the schedule, wait for the switch to
//! settle, capture, analyze, record. A failing step is recorded with its status
//! and the sweep moves on. The all-open schedule is applied before the first
//! step and after the last one, including when the sweep is stopped.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::{self, GapAnalyzer, GapReport};
use crate::capture::capture_duration;
use crate::config::SweepConfig;
use crate::live::sleep_unless_stopped;
use crate::schedule::{
    format_duration_ns, AppliedSchedule, EntrySpec, GateEntry, Schedule, ScheduleError,
};
use crate::state::SnapshotCell;
use crate::traits::{Capturer, ScheduleApplier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Idle,
    Configuring,
    Settling,
    Capturing,
    Analyzing,
    Recording,
    Done,
}

impl SweepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepPhase::Idle => "idle",
            SweepPhase::Configuring => "configuring",
            SweepPhase::Settling => "settling",
            SweepPhase::Capturing => "capturing",
            SweepPhase::Analyzing => "analyzing",
            SweepPhase::Recording => "recording",
            SweepPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    ConfigFailed,
    CaptureFailed,
    InsufficientData,
    Interrupted, // Stop raised before the capture window finished
}

/// How a plan entry lays out its cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSchedule {
    AllOpen,
    OpenClose { open_ns: u64 },
    Entries { entries: Vec<EntrySpec> },
}

/// One planned sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepStep {
    pub label: String,
    #[serde(default)]
    pub category: String,
    pub cycle_ns: u64,
    pub schedule: StepSchedule,
    #[serde(default)]
    pub capture_secs: Option<f64>, // Overrides SweepConfig::capture_secs
}

impl SweepStep {
    pub fn all_open(label: impl Into<String>, category: &str, cycle_ns: u64) -> Self {
        SweepStep {
            label: label.into(),
            category: category.to_string(),
            cycle_ns,
            schedule: StepSchedule::AllOpen,
            capture_secs: None,
        }
    }

    pub fn open_close(
        label: impl Into<String>,
        category: &str,
        cycle_ns: u64,
        open_ns: u64,
    ) -> Self {
        SweepStep {
            label: label.into(),
            category: category.to_string(),
            cycle_ns,
            schedule: StepSchedule::OpenClose { open_ns },
            capture_secs: None,
        }
    }

    pub fn entries(
        label: impl Into<String>,
        category: &str,
        cycle_ns: u64,
        entries: Vec<EntrySpec>,
    ) -> Self {
        SweepStep {
            label: label.into(),
            category: category.to_string(),
            cycle_ns,
            schedule: StepSchedule::Entries { entries },
            capture_secs: None,
        }
    }

    pub fn with_capture_secs(mut self, secs: f64) -> Self {
        self.capture_secs = Some(secs);
        self
    }

    /// Capture window for this step, falling back to `default_secs`.
    pub fn capture_duration(&self, default_secs: f64) -> Result<Duration> {
        let secs = self.capture_secs.unwrap_or(default_secs);
        capture_duration(secs).map_err(|e| anyhow!("{}: {}", self.label, e))
    }

    pub fn build_schedule(&self) -> Result<Schedule, ScheduleError> {
        match &self.schedule {
            StepSchedule::AllOpen => Schedule::all_open(self.cycle_ns),
            StepSchedule::OpenClose { open_ns } => Schedule::open_close(self.cycle_ns, *open_ns),
            StepSchedule::Entries { entries } => Schedule::build(self.cycle_ns, entries),
        }
    }
}

/// Outcome of one step. Appended in plan order, never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub label: String,
    pub category: String,
    pub cycle_ns: u64,
    pub open_ns: u64,
    pub open_pct: f64,
    pub entries: Vec<GateEntry>,
    pub capture_secs: f64,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub report: GapReport,
}

impl SweepResult {
    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    pub fn without_samples(&self) -> Self {
        SweepResult { report: self.report.without_samples(), ..self.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub running: bool,
    pub phase: SweepPhase,
    pub step: usize,
    pub total: usize,
    pub label: String,
    pub message: String,
    pub results: Vec<SweepResult>, // Completed steps, without gap samples
}

impl Default for SweepProgress {
    fn default() -> Self {
        SweepProgress {
            running: false,
            phase: SweepPhase::Idle,
            step: 0,
            total: 0,
            label: String::new(),
            message: "idle".to_string(),
            results: Vec::new(),
        }
    }
}

pub struct SweepOrchestrator<A: ScheduleApplier, C: Capturer> {
    applier: A,
    capturer: C,
    analyzer: GapAnalyzer,
    config: SweepConfig,
    stop: Arc<AtomicBool>,
    progress: Arc<SnapshotCell<SweepProgress>>,
    applied: Arc<SnapshotCell<AppliedSchedule>>,
}

impl<A: ScheduleApplier, C: Capturer> SweepOrchestrator<A, C> {
    pub fn new(
        applier: A,
        capturer: C,
        analyzer: GapAnalyzer,
        config: SweepConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        SweepOrchestrator {
            applier,
            capturer,
            analyzer,
            config,
            stop,
            progress: Arc::new(SnapshotCell::default()),
            applied: Arc::new(SnapshotCell::default()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<SnapshotCell<SweepProgress>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_applied(mut self, applied: Arc<SnapshotCell<AppliedSchedule>>) -> Self {
        self.applied = applied;
        self
    }

    pub fn progress(&self) -> Arc<SnapshotCell<SweepProgress>> {
        self.progress.clone()
    }

    pub fn applied(&self) -> Arc<SnapshotCell<AppliedSchedule>> {
        self.applied.clone()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: SweepPhase, step: usize, total: usize, label: &str) {
        let message = format!("[{}/{}] {}: {}", step, total, label, phase.as_str());
        info!("[Sweep] {}", message);
        let label = label.to_string();
        self.progress.update(move |p| {
            p.running = true;
            p.phase = phase;
            p.step = step;
            p.total = total;
            p.label = label;
            p.message = message;
        });
    }

    /// Apply the all-open schedule. Failures are logged; the sweep continues.
    fn restore_safe(&mut self, reason: &str) {
        let schedule = match Schedule::all_open(self.config.safe_cycle_ns) {
            Ok(s) => s,
            Err(e) => {
                error!("[Sweep] Invalid safe cycle {}ns: {}", self.config.safe_cycle_ns, e);
                return;
            }
        };
        info!("[Sweep] Restoring all-open schedule ({})", reason);
        let tc = self.config.monitored_traffic_class;
        match self.applier.apply(&schedule) {
            Ok(()) => self.applied.publish(AppliedSchedule::from_schedule(&schedule, tc)),
            Err(e) => warn!("[Sweep] Failed to restore all-open schedule: {:#}", e),
        }
    }

    /// Run every step of `plan` and return one result per executed step.
    pub fn run(&mut self, plan: &[SweepStep]) -> Vec<SweepResult> {
        let total = plan.len();
        self.progress.publish(SweepProgress {
            running: true,
            total,
            message: format!("starting sweep of {} configurations", total),
            ..SweepProgress::default()
        });
        info!("[Sweep] Starting sweep of {} configurations", total);

        self.restore_safe("before sweep");

        // A panicking step must not leave the switch gated
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_steps(plan)));
        let results = match outcome {
            Ok(results) => {
                let reason = if self.stopped() { "sweep interrupted" } else { "after sweep" };
                self.restore_safe(reason);
                results
            }
            Err(payload) => {
                error!("[Sweep] Step panicked, restoring all-open schedule");
                self.restore_safe("step panicked");
                self.progress.update(|p| {
                    p.running = false;
                    p.message = "aborted: step panicked".to_string();
                });
                panic::resume_unwind(payload);
            }
        };

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let message = format!("done: {}/{} ok", ok, results.len());
        info!("[Sweep] {}", message);
        self.progress.update(move |p| {
            p.running = false;
            p.phase = SweepPhase::Done;
            p.message = message;
        });
        results
    }

    fn run_steps(&mut self, plan: &[SweepStep]) -> Vec<SweepResult> {
        let total = plan.len();
        let mut results = Vec::with_capacity(total);
        for (i, step) in plan.iter().enumerate() {
            if self.stopped() {
                warn!("[Sweep] Stop requested, skipping remaining {} steps", total - i);
                break;
            }
            let result = self.run_step(i + 1, total, step);
            let summary = result.without_samples();
            self.progress.update(move |p| p.results.push(summary));
            results.push(result);
        }
        results
    }

    fn interrupted(&self, result: &mut SweepResult, index: usize, total: usize) {
        warn!("[Sweep] {}: stop requested, step not measured", result.label);
        result.status = StepStatus::Interrupted;
        result.error = Some("stop requested".to_string());
        result.report = GapReport::degenerate(0);
        self.set_phase(SweepPhase::Recording, index, total, &result.label);
    }

    fn run_step(&mut self, index: usize, total: usize, step: &SweepStep) -> SweepResult {
        let capture_secs = step.capture_secs.unwrap_or(self.config.capture_secs);
        let mut result = SweepResult {
            label: step.label.clone(),
            category: step.category.clone(),
            cycle_ns: step.cycle_ns,
            open_ns: 0,
            open_pct: 0.0,
            entries: Vec::new(),
            capture_secs,
            status: StepStatus::Ok,
            error: None,
            report: GapReport::degenerate(0),
        };

        self.set_phase(SweepPhase::Configuring, index, total, &step.label);
        let window = step.capture_duration(self.config.capture_secs);
        let configured =
            window.and_then(|window| self.configure(step, &mut result).map(|()| window));
        let window = match configured {
            Ok(window) => window,
            Err(e) => {
                warn!("[Sweep] {}: config failed: {:#}", step.label, e);
                result.status = StepStatus::ConfigFailed;
                result.error = Some(format!("{:#}", e));
                self.set_phase(SweepPhase::Recording, index, total, &step.label);
                return result;
            }
        };

        self.set_phase(SweepPhase::Settling, index, total, &step.label);
        sleep_unless_stopped(Duration::from_millis(self.config.settle_ms), &self.stop);
        if self.stopped() {
            self.interrupted(&mut result, index, total);
            return result;
        }

        self.set_phase(SweepPhase::Capturing, index, total, &step.label);
        let timestamps = match self.capturer.capture(window) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("[Sweep] {}: capture failed: {:#}", step.label, e);
                result.status = StepStatus::CaptureFailed;
                result.error = Some(format!("{:#}", e));
                self.set_phase(SweepPhase::Recording, index, total, &step.label);
                return result;
            }
        };
        if self.stopped() {
            self.interrupted(&mut result, index, total);
            return result;
        }

        self.set_phase(SweepPhase::Analyzing, index, total, &step.label);
        result.report = self.analyzer.analyze(&timestamps);
        analyzer::log_summary(&step.label, &result.report);
        if timestamps.len() < self.analyzer.config().min_packets {
            result.status = StepStatus::InsufficientData;
            result.error = Some(format!("only {} packets captured", timestamps.len()));
        }

        self.set_phase(SweepPhase::Recording, index, total, &step.label);
        result
    }

    fn configure(&mut self, step: &SweepStep, result: &mut SweepResult) -> Result<()> {
        let schedule = step
            .build_schedule()
            .map_err(|e| anyhow!("invalid schedule for {}: {}", step.label, e))?;

        let tc = self.config.monitored_traffic_class;
        result.open_ns = schedule.open_ns_for(tc);
        result.open_pct = schedule.open_pct_for(tc);
        result.entries = schedule.entries().to_vec();

        info!(
            "[Sweep] Applying {} cycle {}: {}",
            step.label,
            format_duration_ns(schedule.cycle_ns()),
            schedule.describe(tc)
        );
        self.applier.apply(&schedule)?;
        self.applied.publish(AppliedSchedule::from_schedule(&schedule, tc));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::schedule::NS_PER_MS;
    use crate::traits::{MockCapturer, MockScheduleApplier};
    use std::sync::Mutex;
    use std::time::Instant;

    struct PanickingCapturer;

    impl Capturer for PanickingCapturer {
        fn capture(&mut self, _duration: Duration) -> Result<Vec<Instant>> {
            panic!("capture blew up")
        }
    }

    fn stream(n: usize) -> Vec<Instant> {
        let base = Instant::now();
        (0..n).map(|i| base + Duration::from_micros(781 * i as u64)).collect()
    }

    fn sweep_config() -> SweepConfig {
        SweepConfig { settle_ms: 0, capture_secs: 0.01, ..SweepConfig::default() }
    }

    fn plan() -> Vec<SweepStep> {
        vec![
            SweepStep::open_close("1ms/80%", "basic", NS_PER_MS, 800_000),
            SweepStep::open_close("1ms/50%", "basic", NS_PER_MS, 500_000),
            SweepStep::open_close("1ms/20%", "basic", NS_PER_MS, 200_000),
        ]
    }

    /// Applier that records every schedule and fails on the given call numbers (1-based).
    fn recording_applier(
        fail_on: Vec<usize>,
        log: Arc<Mutex<Vec<Schedule>>>,
    ) -> MockScheduleApplier {
        let mut applier = MockScheduleApplier::new();
        let mut calls = 0usize;
        applier.expect_apply().returning(move |s| {
            calls += 1;
            log.lock().unwrap().push(s.clone());
            if fail_on.contains(&calls) {
                Err(anyhow!("Failed: patch rejected"))
            } else {
                Ok(())
            }
        });
        applier
    }

    #[test]
    fn test_failed_apply_does_not_abort_sweep() {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = Arc::new(Mutex::new(Vec::new()));
        // Call 1 is the pre-sweep restore, call 3 is the second step
        let applier = recording_applier(vec![3], log.clone());
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().times(2).returning(|_| Ok(stream(200)));

        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        );
        let results = orch.run(&plan());

        let statuses: Vec<StepStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![StepStatus::Ok, StepStatus::ConfigFailed, StepStatus::Ok]);
        assert_eq!(results[1].report.loss_pattern, analyzer::LossPattern::TotalLoss);
        assert!(results[1].error.as_deref().unwrap_or("").contains("Failed"));
        let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["1ms/80%", "1ms/50%", "1ms/20%"]);

        let applied = log.lock().unwrap();
        assert_eq!(applied.len(), 5);
        assert!(applied[0].is_all_open());
        assert!(applied[4].is_all_open());
        assert!(!applied[1].is_all_open());

        let progress = orch.progress().snapshot();
        assert!(!progress.running);
        assert_eq!(progress.phase, SweepPhase::Done);
        assert_eq!(progress.results.len(), 3);
        assert!(progress.results.iter().all(|r| r.report.gap_samples.is_empty()));
        assert!(orch.applied().snapshot().open_pct > 99.9);
    }

    #[test]
    fn test_invalid_schedule_is_config_failed_without_apply() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log.clone());
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().never();

        let bad = SweepStep::entries(
            "600/300",
            "custom",
            NS_PER_MS,
            vec![EntrySpec::us(0xFF, 600), EntrySpec::us(0xFE, 300)],
        );
        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        );
        let results = orch.run(&[bad]);

        assert_eq!(results[0].status, StepStatus::ConfigFailed);
        let err = results[0].error.clone().unwrap_or_default();
        assert!(err.contains("900000") && err.contains("1000000"), "{}", err);
        // Only the two restores reached the switch
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_capture_failure_and_insufficient_data() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log);
        let mut capturer = MockCapturer::new();
        let mut calls = 0;
        capturer.expect_capture().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(anyhow!("Failed to bind capture socket to 0.0.0.0:7502"))
            } else {
                Ok(stream(4))
            }
        });

        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        );
        let results = orch.run(&plan()[..2]);

        assert_eq!(results[0].status, StepStatus::CaptureFailed);
        assert_eq!(results[1].status, StepStatus::InsufficientData);
        assert_eq!(results[1].report.packet_count, 4);
        assert_eq!(results[1].report.loss_pattern, analyzer::LossPattern::SevereLoss);
    }

    #[test]
    fn test_stop_still_restores_all_open() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log.clone());
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().never();

        let stop = Arc::new(AtomicBool::new(true));
        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            stop,
        );
        let results = orch.run(&plan());

        assert!(results.is_empty());
        let applied = log.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|s| s.is_all_open()));
        assert_eq!(orch.progress().snapshot().phase, SweepPhase::Done);
    }

    #[test]
    fn test_step_capture_override_and_message() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log);
        let mut capturer = MockCapturer::new();
        capturer
            .expect_capture()
            .withf(|d| *d == Duration::from_millis(500))
            .times(1)
            .returning(|_| Ok(stream(50)));

        let progress = Arc::new(SnapshotCell::default());
        let step = SweepStep::all_open("All-open 10ms", "diagnosis", 10 * NS_PER_MS)
            .with_capture_secs(0.5);
        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_progress(progress.clone());

        let results = orch.run(&[step]);
        assert_eq!(results[0].status, StepStatus::Ok);
        assert!((results[0].open_pct - 100.0).abs() < 1e-9);
        assert_eq!(results[0].capture_secs, 0.5);

        let p = progress.snapshot();
        assert_eq!(p.results.len(), 1);
        assert_eq!(p.step, 1);
        assert_eq!(p.total, 1);
    }

    #[test]
    fn test_panicking_step_still_restores_all_open() {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log.clone());
        let progress = Arc::new(SnapshotCell::default());
        let mut orch = SweepOrchestrator::new(
            applier,
            PanickingCapturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        )
        .with_progress(progress.clone());

        let plan = [SweepStep::open_close("1ms/20%", "basic", NS_PER_MS, 200_000)];
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| orch.run(&plan)));
        assert!(outcome.is_err());

        let applied = log.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(!applied[1].is_all_open());
        assert!(applied[2].is_all_open());
        assert!(!progress.snapshot().running);
        assert_eq!(orch.applied().snapshot().open_pct, 100.0);
    }

    #[test]
    fn test_unusable_capture_length_is_config_failed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log.clone());
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().never();

        let plan = [
            SweepStep::open_close("1ms/20%", "basic", NS_PER_MS, 200_000).with_capture_secs(1e19),
            SweepStep::all_open("nan", "basic", NS_PER_MS).with_capture_secs(f64::NAN),
        ];
        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        );
        let results = orch.run(&plan);

        assert!(results.iter().all(|r| r.status == StepStatus::ConfigFailed));
        assert!(results[0].error.as_deref().unwrap_or("").contains("1ms/20%"));
        // The gated schedule never reached the switch
        let applied = log.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert!(applied.iter().all(|s| s.is_all_open()));
    }

    #[test]
    fn test_stop_during_settle_marks_step_interrupted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut applier = MockScheduleApplier::new();
        let raise = stop.clone();
        let applies = log.clone();
        applier.expect_apply().returning(move |s| {
            applies.lock().unwrap().push(s.clone());
            // Ctrl+C lands while the first gated step settles
            if !s.is_all_open() {
                raise.store(true, Ordering::SeqCst);
            }
            Ok(())
        });
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().never();

        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            SweepConfig { settle_ms: 5_000, ..sweep_config() },
            stop,
        );
        let started = std::time::Instant::now();
        let results = orch.run(&plan());

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepStatus::Interrupted);
        assert_eq!(results[0].report.packet_count, 0);
        let applied = log.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert!(applied[2].is_all_open());
    }

    #[test]
    fn test_stop_during_capture_marks_step_interrupted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log);
        let stop = Arc::new(AtomicBool::new(false));
        let raise = stop.clone();
        let mut capturer = MockCapturer::new();
        capturer.expect_capture().times(1).returning(move |_| {
            raise.store(true, Ordering::SeqCst);
            Ok(stream(30))
        });

        let mut orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            stop,
        );
        let results = orch.run(&plan());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepStatus::Interrupted);
        assert!(!results[0].is_ok());
    }

    #[test]
    fn test_step_message_format() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let applier = recording_applier(vec![], log);
        let capturer = MockCapturer::new();
        let orch = SweepOrchestrator::new(
            applier,
            capturer,
            GapAnalyzer::new(AnalyzerConfig::default()),
            sweep_config(),
            Arc::new(AtomicBool::new(false)),
        );
        orch.set_phase(SweepPhase::Settling, 3, 13, "10ms/50%");
        assert_eq!(orch.progress().snapshot().message, "[3/13] 10ms/50%: settling");
    }

    #[test]
    fn test_plan_json_roundtrip() {
        let json = r#"[
            {"label": "base", "cycle_ns": 1000000, "schedule": {"kind": "all_open"}},
            {"label": "5ms/20%", "category": "custom", "cycle_ns": 5000000,
             "schedule": {"kind": "open_close", "open_ns": 1000000}, "capture_secs": 3.0},
            {"label": "tc0", "cycle_ns": 10000000,
             "schedule": {"kind": "entries", "entries": [
                {"gate": 1, "duration_ns": 4000000}, {"gate": 64, "duration_ns": 6000000}]}}
        ]"#;
        let plan: Vec<SweepStep> = serde_json::from_str(json).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].category, "");
        assert_eq!(plan[1].capture_secs, Some(3.0));
        let s = plan[2].build_schedule().unwrap();
        assert_eq!(s.open_ns_for(0), 4_000_000);
        assert!(plan.iter().all(|p| p.build_schedule().is_ok()));
    }
}
