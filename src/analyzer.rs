//! Inter-packet gap analysis.
//!
//! Turns one captured timestamp sequence into an immutable [`GapReport`]:
//! dispersion statistics, burst/normal/large classification, burst run
//! lengths, frame segmentation with per-frame jitter, a periodicity check for
//! gating-cycle signatures, and a categorical loss pattern.
//!
//! ## Units
//! Every `*_us` field is microseconds, every `*_pct` field and `completeness`
//! is a percentage in 0..=100. Nothing is rounded here; rounding happens only
//! when printing.

use log::info;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config::AnalyzerConfig;

/// Histogram bin edges in µs.
const HISTOGRAM_EDGES_US: [f64; 21] = [
    0.0, 10.0, 50.0, 100.0, 200.0, 400.0, 600.0, 700.0, 750.0, 780.0, 800.0, 850.0, 900.0,
    1000.0, 1200.0, 1500.0, 2000.0, 5000.0, 10000.0, 50000.0, 100000.0,
];

const COMPLETE_PCT: f64 = 99.5;
const MINOR_LOSS_PCT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPattern {
    None,
    Minor,
    Periodic,
    Distributed,
    Burst,
    SevereLoss,
    TotalLoss,
}

impl LossPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossPattern::None => "none",
            LossPattern::Minor => "minor",
            LossPattern::Periodic => "periodic",
            LossPattern::Distributed => "distributed",
            LossPattern::Burst => "burst",
            LossPattern::SevereLoss => "severe_loss",
            LossPattern::TotalLoss => "total_loss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub p: f64,
    pub value_us: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower_us: f64,
    pub upper_us: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicityHit {
    pub period_us: f64,
    pub count: usize,
    pub signature: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GapBuckets {
    pub burst_count: usize,
    pub burst_pct: f64,
    pub intermediate_count: usize,
    pub intermediate_pct: f64,
    pub normal_count: usize,
    pub normal_pct: f64,
    pub large_count: usize,
    pub large_pct: f64,
    pub burst_gap_mean_us: Option<f64>,
    pub normal_gap_mean_us: Option<f64>,
    pub normal_gap_stdev_us: Option<f64>,
    pub large_gap_mean_us: Option<f64>,
    pub large_gap_max_us: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BurstRuns {
    pub run_count: usize,
    pub run_mean: f64,
    pub run_max: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub boundary_count: usize,
    pub frame_count: usize,
    pub completeness_mean: Option<f64>,
    pub completeness_min: Option<f64>,
    pub jitter_mean_us: Option<f64>,
    pub jitter_stdev_us: Option<f64>,
    pub jitter_min_us: Option<f64>,
    pub jitter_max_us: Option<f64>,
    /// Spacing of consecutive boundaries in packets
    pub interval_mean_pkts: Option<f64>,
    pub interval_stdev_pkts: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    pub packet_count: usize,
    pub duration_sec: f64,
    pub pps: f64,
    pub completeness: f64,
    pub gap_mean_us: f64,
    pub gap_median_us: f64,
    pub gap_stdev_us: f64,
    pub gap_min_us: f64,
    pub gap_max_us: f64,
    pub percentiles: Vec<Percentile>,
    pub buckets: GapBuckets,
    pub burst_runs: BurstRuns,
    pub frames: FrameStats,
    pub periodicity: Vec<PeriodicityHit>,
    pub histogram: Vec<HistogramBin>,
    pub loss_pattern: LossPattern,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gap_samples: Vec<f64>,
}

impl GapReport {
    /// Zeroed report for sequences too short to measure.
    pub fn degenerate(packet_count: usize) -> Self {
        GapReport {
            packet_count,
            duration_sec: 0.0,
            pps: 0.0,
            completeness: 0.0,
            gap_mean_us: 0.0,
            gap_median_us: 0.0,
            gap_stdev_us: 0.0,
            gap_min_us: 0.0,
            gap_max_us: 0.0,
            percentiles: Vec::new(),
            buckets: GapBuckets::default(),
            burst_runs: BurstRuns::default(),
            frames: FrameStats::default(),
            periodicity: Vec::new(),
            histogram: Vec::new(),
            loss_pattern: if packet_count == 0 {
                LossPattern::TotalLoss
            } else {
                LossPattern::SevereLoss
            },
            gap_samples: Vec::new(),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self.loss_pattern, LossPattern::TotalLoss | LossPattern::SevereLoss)
    }

    /// Look up a requested percentile, e.g. `percentile(99.0)`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|q| (q.p - p).abs() < 1e-9)
            .map(|q| q.value_us)
    }

    /// Copy without the raw gap samples, for summary documents.
    pub fn without_samples(&self) -> Self {
        GapReport { gap_samples: Vec::new(), ..self.clone() }
    }
}

pub struct GapAnalyzer {
    config: AnalyzerConfig,
}

impl GapAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        GapAnalyzer { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze(&self, timestamps: &[Instant]) -> GapReport {
        if timestamps.len() < self.config.min_packets.max(2) {
            return GapReport::degenerate(timestamps.len());
        }
        let gaps: Vec<f64> = timestamps
            .windows(2)
            .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64() * 1e6)
            .collect();
        let span_sec = timestamps[timestamps.len() - 1]
            .saturating_duration_since(timestamps[0])
            .as_secs_f64();
        self.analyze_gaps(timestamps.len(), span_sec, &gaps)
    }

    /// Analysis core over precomputed gaps (µs) of `packet_count` packets.
    pub fn analyze_gaps(&self, packet_count: usize, span_sec: f64, gaps: &[f64]) -> GapReport {
        let cfg = &self.config;
        if packet_count < cfg.min_packets.max(2) || gaps.is_empty() {
            return GapReport::degenerate(packet_count);
        }

        let pps = if span_sec > 0.0 { packet_count as f64 / span_sec } else { 0.0 };
        let expected_packets = span_sec * cfg.expected_pps + 1.0;
        let completeness = if expected_packets > 0.0 {
            (packet_count as f64 / expected_packets * 100.0).min(100.0)
        } else {
            0.0
        };

        let mut sorted = gaps.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let gap_mean_us = mean(gaps);
        let percentiles = cfg
            .percentiles
            .iter()
            .map(|&p| Percentile { p, value_us: percentile_sorted(&sorted, p) })
            .collect();

        let buckets = self.classify(gaps);
        let burst_runs = self.burst_runs(gaps);
        let frames = self.frame_stats(gaps);
        let periodicity = self.periodicity(gaps);
        let loss_pattern = self.loss_pattern(gaps, completeness, &buckets);

        GapReport {
            packet_count,
            duration_sec: span_sec,
            pps,
            completeness,
            gap_mean_us,
            gap_median_us: percentile_sorted(&sorted, 50.0),
            gap_stdev_us: stdev(gaps, gap_mean_us),
            gap_min_us: sorted[0],
            gap_max_us: sorted[sorted.len() - 1],
            percentiles,
            buckets,
            burst_runs,
            frames,
            periodicity,
            histogram: histogram(gaps),
            loss_pattern,
            gap_samples: downsample(gaps, cfg.gap_sample_limit),
        }
    }

    fn classify(&self, gaps: &[f64]) -> GapBuckets {
        let cfg = &self.config;
        let burst: Vec<f64> = gaps.iter().copied().filter(|&g| g < cfg.burst_gap_us).collect();
        let large: Vec<f64> = gaps.iter().copied().filter(|&g| g > cfg.large_gap_us).collect();
        let normal: Vec<f64> = gaps
            .iter()
            .copied()
            .filter(|&g| g >= cfg.burst_gap_us.max(cfg.normal_min_us) && g <= cfg.large_gap_us)
            .collect();
        let intermediate_count =
            gaps.len().saturating_sub(burst.len() + large.len() + normal.len());

        let total = gaps.len() as f64;
        let pct = |n: usize| n as f64 / total * 100.0;

        let normal_gap_mean_us = (!normal.is_empty()).then(|| mean(&normal));
        GapBuckets {
            burst_count: burst.len(),
            burst_pct: pct(burst.len()),
            intermediate_count,
            intermediate_pct: pct(intermediate_count),
            normal_count: normal.len(),
            normal_pct: pct(normal.len()),
            large_count: large.len(),
            large_pct: pct(large.len()),
            burst_gap_mean_us: (!burst.is_empty()).then(|| mean(&burst)),
            normal_gap_mean_us,
            normal_gap_stdev_us: normal_gap_mean_us.map(|m| stdev(&normal, m)),
            large_gap_mean_us: (!large.is_empty()).then(|| mean(&large)),
            large_gap_max_us: large.iter().copied().reduce(f64::max),
        }
    }

    /// Runs of consecutive sub-threshold gaps: how many packets one gate-open
    /// window releases back to back.
    fn burst_runs(&self, gaps: &[f64]) -> BurstRuns {
        let mut runs = Vec::new();
        let mut run_len = 0usize;
        for &g in gaps {
            if g < self.config.burst_gap_us {
                run_len += 1;
            } else if run_len > 0 {
                runs.push(run_len);
                run_len = 0;
            }
        }
        if run_len > 0 {
            runs.push(run_len);
        }

        if runs.is_empty() {
            return BurstRuns::default();
        }
        BurstRuns {
            run_count: runs.len(),
            run_mean: runs.iter().sum::<usize>() as f64 / runs.len() as f64,
            run_max: runs.iter().copied().max().unwrap_or(0),
        }
    }

    fn frame_stats(&self, gaps: &[f64]) -> FrameStats {
        let cfg = &self.config;
        let threshold = cfg.nominal_interval_us * cfg.frame_boundary_factor;
        let boundaries: Vec<usize> = gaps
            .iter()
            .enumerate()
            .filter(|&(_, &g)| g > threshold)
            .map(|(i, _)| i)
            .collect();

        // Frames are the gap runs between boundary gaps; the boundary gap
        // itself belongs to neither frame.
        let mut segments: Vec<&[f64]> = Vec::with_capacity(boundaries.len() + 1);
        let mut start = 0usize;
        for &b in &boundaries {
            segments.push(&gaps[start..b]);
            start = b + 1;
        }
        segments.push(&gaps[start.min(gaps.len())..]);

        let completes: Vec<f64> = segments
            .iter()
            .map(|seg| {
                let packets = seg.len() + 1;
                if cfg.packets_per_frame == 0 {
                    0.0
                } else {
                    (packets as f64 / cfg.packets_per_frame as f64 * 100.0).min(100.0)
                }
            })
            .collect();

        let jitters: Vec<f64> = segments
            .iter()
            .filter(|seg| seg.len() > cfg.min_frame_gaps)
            .map(|seg| stdev(seg, mean(seg)))
            .collect();

        let mut stats = FrameStats {
            boundary_count: boundaries.len(),
            frame_count: segments.len(),
            completeness_mean: Some(mean(&completes)),
            completeness_min: completes.iter().copied().reduce(f64::min),
            ..FrameStats::default()
        };

        if !jitters.is_empty() {
            let m = mean(&jitters);
            stats.jitter_mean_us = Some(m);
            stats.jitter_stdev_us = Some(stdev(&jitters, m));
            stats.jitter_min_us = jitters.iter().copied().reduce(f64::min);
            stats.jitter_max_us = jitters.iter().copied().reduce(f64::max);
        }

        if boundaries.len() > 2 {
            let intervals: Vec<f64> = boundaries.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
            let m = mean(&intervals);
            stats.interval_mean_pkts = Some(m);
            stats.interval_stdev_pkts = Some(stdev(&intervals, m));
        }

        stats
    }

    fn periodicity(&self, gaps: &[f64]) -> Vec<PeriodicityHit> {
        let cfg = &self.config;
        let multiples = cfg.periodicity_max_multiple.max(1);
        cfg.periodicity_candidates_us
            .iter()
            .map(|&period_us| {
                let count = gaps
                    .iter()
                    .filter(|&&g| {
                        (1..=multiples).any(|k| {
                            (g - period_us * k as f64).abs() < cfg.periodicity_tolerance_us
                        })
                    })
                    .count();
                PeriodicityHit { period_us, count, signature: count > cfg.periodicity_min_hits }
            })
            .collect()
    }

    fn loss_pattern(&self, gaps: &[f64], completeness: f64, buckets: &GapBuckets) -> LossPattern {
        let cfg = &self.config;
        if completeness >= COMPLETE_PCT {
            return LossPattern::None;
        }
        if completeness >= MINOR_LOSS_PCT {
            if buckets.large_count <= cfg.min_large_gaps_for_pattern {
                return LossPattern::Minor;
            }
            // Only gaps spanning several nominal intervals count here, not the
            // bucket threshold.
            let positions: Vec<usize> = gaps
                .iter()
                .enumerate()
                .filter(|&(_, &g)| g > cfg.periodic_gap_us)
                .map(|(i, _)| i)
                .collect();
            if positions.len() <= 2 {
                return LossPattern::Burst;
            }
            let intervals: Vec<f64> = positions.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
            let m = mean(&intervals);
            let cv = if m > 0.0 { stdev(&intervals, m) / m } else { f64::INFINITY };
            return if cv < cfg.periodic_cv_max {
                LossPattern::Periodic
            } else {
                LossPattern::Distributed
            };
        }
        if buckets.burst_pct > cfg.burst_dominated_pct {
            LossPattern::Burst
        } else {
            LossPattern::Distributed
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation around a precomputed mean.
pub fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Linear interpolation between order statistics (rank = p/100 * (n-1)).
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 100.0) / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn histogram(gaps: &[f64]) -> Vec<HistogramBin> {
    let last = HISTOGRAM_EDGES_US.len() - 2;
    let mut counts = [0usize; HISTOGRAM_EDGES_US.len() - 1];
    for &g in gaps {
        if g < HISTOGRAM_EDGES_US[0] || g > HISTOGRAM_EDGES_US[last + 1] {
            continue;
        }
        // Half-open bins, the last one closed
        let idx = HISTOGRAM_EDGES_US
            .windows(2)
            .position(|w| g >= w[0] && g < w[1])
            .unwrap_or(last);
        counts[idx] += 1;
    }
    counts
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c > 0)
        .map(|(i, &count)| HistogramBin {
            lower_us: HISTOGRAM_EDGES_US[i],
            upper_us: HISTOGRAM_EDGES_US[i + 1],
            count,
        })
        .collect()
}

fn downsample(gaps: &[f64], limit: usize) -> Vec<f64> {
    if limit == 0 {
        return Vec::new();
    }
    let step = gaps.len().div_ceil(limit).max(1);
    gaps.iter().step_by(step).copied().collect()
}

pub fn log_summary(label: &str, r: &GapReport) {
    info!(
        "[Analyze] {}: {} pkts | {:.0} pps | completeness {:.1}% | loss {}",
        label,
        r.packet_count,
        r.pps,
        r.completeness,
        r.loss_pattern.as_str()
    );
    if r.is_degenerate() {
        return;
    }
    info!(
        "[Analyze] Gap mean={:.1}µs median={:.1}µs stdev={:.1}µs \
         min={:.1}µs max={:.1}µs P99={:.0}µs",
        r.gap_mean_us,
        r.gap_median_us,
        r.gap_stdev_us,
        r.gap_min_us,
        r.gap_max_us,
        r.percentile(99.0).unwrap_or(0.0)
    );
    info!(
        "[Analyze] Burst {:.1}% | Normal {:.1}% | Large {:.1}% | Other {:.1}% \
         | burst runs {}x max {}",
        r.buckets.burst_pct,
        r.buckets.normal_pct,
        r.buckets.large_pct,
        r.buckets.intermediate_pct,
        r.burst_runs.run_count,
        r.burst_runs.run_max
    );
    if let Some(j) = r.frames.jitter_mean_us {
        info!(
            "[Analyze] Frames {} (boundaries {}) | per-frame jitter mean={:.1}µs max={:.1}µs",
            r.frames.frame_count,
            r.frames.boundary_count,
            j,
            r.frames.jitter_max_us.unwrap_or(0.0)
        );
    }
    for hit in r.periodicity.iter().filter(|h| h.signature) {
        info!(
            "[Analyze] {} gaps near {:.0}µs multiples (gating signature)",
            hit.count, hit.period_us
        );
    }
}
