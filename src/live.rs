//! Continuous capture/analysis loop.
//!
//! Each window captures for `window_secs`, analyzes the timestamps and
//! publishes three snapshots: the raw window, an EMA-smoothed view for
//! dashboards, and a bounded history of raw windows. The capture port is held
//! only for the duration of a window so a sweep can interleave.

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::analyzer::{GapAnalyzer, GapReport, LossPattern};
use crate::config::LiveConfig;
use crate::state::SnapshotCell;
use crate::traits::Capturer;

/// Pause between windows; a sweep step blocked on the capture gate gets the port here.
const WINDOW_HANDOFF: Duration = Duration::from_millis(20);
const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStats {
    pub window: u64,
    pub packet_count: f64,
    pub pps: f64,
    pub completeness: f64,
    pub gap_mean_us: f64,
    pub gap_stdev_us: f64,
    pub gap_max_us: f64,
    pub burst_pct: f64,
    pub large_pct: f64,
    pub jitter_mean_us: f64,
    pub loss_pattern: LossPattern,
    pub updated_ts: i64, // Unix ms
}

impl Default for LiveStats {
    fn default() -> Self {
        LiveStats {
            window: 0,
            packet_count: 0.0,
            pps: 0.0,
            completeness: 0.0,
            gap_mean_us: 0.0,
            gap_stdev_us: 0.0,
            gap_max_us: 0.0,
            burst_pct: 0.0,
            large_pct: 0.0,
            jitter_mean_us: 0.0,
            loss_pattern: LossPattern::TotalLoss,
            updated_ts: 0,
        }
    }
}

impl LiveStats {
    pub fn from_report(window: u64, report: &GapReport) -> Self {
        LiveStats {
            window,
            packet_count: report.packet_count as f64,
            pps: report.pps,
            completeness: report.completeness,
            gap_mean_us: report.gap_mean_us,
            gap_stdev_us: report.gap_stdev_us,
            gap_max_us: report.gap_max_us,
            burst_pct: report.buckets.burst_pct,
            large_pct: report.buckets.large_pct,
            jitter_mean_us: report.frames.jitter_mean_us.unwrap_or(0.0),
            loss_pattern: report.loss_pattern,
            updated_ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Blend `raw` into `self` with weight `alpha`. Categorical fields follow raw.
    pub fn smooth_towards(&self, raw: &LiveStats, alpha: f64) -> LiveStats {
        let ema = |prev: f64, new: f64| alpha * new + (1.0 - alpha) * prev;
        LiveStats {
            window: raw.window,
            packet_count: ema(self.packet_count, raw.packet_count),
            pps: ema(self.pps, raw.pps),
            completeness: ema(self.completeness, raw.completeness),
            gap_mean_us: ema(self.gap_mean_us, raw.gap_mean_us),
            gap_stdev_us: ema(self.gap_stdev_us, raw.gap_stdev_us),
            gap_max_us: ema(self.gap_max_us, raw.gap_max_us),
            burst_pct: ema(self.burst_pct, raw.burst_pct),
            large_pct: ema(self.large_pct, raw.large_pct),
            jitter_mean_us: ema(self.jitter_mean_us, raw.jitter_mean_us),
            loss_pattern: raw.loss_pattern,
            updated_ts: raw.updated_ts,
        }
    }
}

/// Published live state, shared with the stats server.
#[derive(Default)]
pub struct LiveView {
    pub raw: SnapshotCell<LiveStats>,
    pub smoothed: SnapshotCell<LiveStats>,
    pub history: SnapshotCell<VecDeque<LiveStats>>,
}

pub struct LiveMonitor<C: Capturer> {
    capturer: C,
    analyzer: GapAnalyzer,
    config: LiveConfig,
    view: Arc<LiveView>,
    window: u64,
}

impl<C: Capturer> LiveMonitor<C> {
    pub fn new(
        capturer: C,
        analyzer: GapAnalyzer,
        config: LiveConfig,
        view: Arc<LiveView>,
    ) -> Self {
        LiveMonitor { capturer, analyzer, config, view, window: 0 }
    }

    pub fn view(&self) -> Arc<LiveView> {
        self.view.clone()
    }

    /// Capture and publish one window.
    pub fn run_window(&mut self) -> Result<Arc<LiveStats>> {
        let duration = Duration::from_secs_f64(self.config.window_secs.max(0.01));
        let timestamps = self.capturer.capture(duration)?;
        let report = self.analyzer.analyze(&timestamps);

        self.window += 1;
        let raw = LiveStats::from_report(self.window, &report);
        let smoothed = self.view.smoothed.snapshot().smooth_towards(&raw, self.config.ema_alpha);

        let history_len = self.config.history_len;
        let entry = raw.clone();
        self.view.history.update(move |h| {
            h.push_back(entry);
            while h.len() > history_len {
                h.pop_front();
            }
        });
        self.view.smoothed.publish(smoothed);
        let raw = Arc::new(raw);
        self.view.raw.publish_arc(raw.clone());

        debug!(
            "[Live] Window {}: {} pkts, completeness {:.1}%, stdev {:.1}µs, loss {}",
            raw.window,
            report.packet_count,
            raw.completeness,
            raw.gap_stdev_us,
            raw.loss_pattern.as_str()
        );
        Ok(raw)
    }

    /// Loop until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(
            "[Live] Monitoring in {:.1}s windows (EMA alpha {}, history {})",
            self.config.window_secs, self.config.ema_alpha, self.config.history_len
        );

        while !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_window() {
                warn!("[Live] Capture failed: {:#}. Retrying in {:?}", e, CAPTURE_RETRY_DELAY);
                sleep_unless_stopped(CAPTURE_RETRY_DELAY, stop);
                continue;
            }
            thread::sleep(WINDOW_HANDOFF);
        }

        info!("[Live] Stopped after {} windows", self.window);
    }
}

/// Sleep in short slices so a raised `stop` ends the wait early.
pub fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
}
