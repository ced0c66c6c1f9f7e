use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::applier::validate_interface;
use crate::capture::capture_duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub capture: CaptureConfig,
    pub analyzer: AnalyzerConfig,
    pub sweep: SweepConfig,
    pub applier: ApplierConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub port: u16,
    pub packet_size: usize,           // Exact datagram length accepted; everything else is dropped
    pub recv_buffer_bytes: usize,     // SO_RCVBUF; undersizing shows up as fake gating loss
    pub recv_timeout_ms: u64,         // Polling interval for deadline / stop checks
    pub reuse_address: bool,          // SO_REUSEADDR; lets a second process share the port
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub expected_pps: f64,            // 128 pkts/frame * 10 Hz
    pub nominal_interval_us: f64,     // 100ms / 128 pkts
    pub packets_per_frame: usize,
    pub frame_boundary_factor: f64,
    pub min_packets: usize,           // Below this the report is degenerate
    pub burst_gap_us: f64,            // Back-to-back at line rate
    pub normal_min_us: f64,
    pub large_gap_us: f64,            // Upper edge of "normal"; above is "large"
    pub periodic_gap_us: f64,         // Large-gap definition used by the periodic/distributed rule
    pub periodic_cv_max: f64,
    pub min_large_gaps_for_pattern: usize,
    pub burst_dominated_pct: f64,
    pub min_frame_gaps: usize,        // Frames with fewer gaps are skipped for per-frame jitter
    pub percentiles: Vec<f64>,
    pub periodicity_candidates_us: Vec<f64>,
    pub periodicity_tolerance_us: f64,
    pub periodicity_max_multiple: u32,
    pub periodicity_min_hits: usize,
    pub gap_sample_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub settle_ms: u64,
    pub capture_secs: f64,            // Default per step; plan entries may override
    pub safe_cycle_ns: u64,           // Cycle of the all-open schedule restored around a sweep
    pub monitored_traffic_class: u8,  // Bit index in the gate mask carrying the stream (TC0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    pub command: String,
    pub args: Vec<String>,            // The rendered document path is appended
    pub working_dir: String,
    pub document_path: String,
    pub interface: String,            // Switch port name in the YANG path
    pub failure_marker: String,       // Tool prints this on stdout when a patch fails
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub window_secs: f64,
    pub ema_alpha: f64,               // Lower = smoother
    pub history_len: usize,
    pub stats_port: u16,
    pub allow_control: bool,          // Accept apply / sweep requests on the stats port
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            capture: CaptureConfig::default(),
            analyzer: AnalyzerConfig::default(),
            sweep: SweepConfig::default(),
            applier: ApplierConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            port: 7502,
            packet_size: 3328,
            recv_buffer_bytes: 16 * 1024 * 1024,
            recv_timeout_ms: 500,
            reuse_address: false,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            expected_pps: 1280.0,
            nominal_interval_us: 781.0,
            packets_per_frame: 128,
            frame_boundary_factor: 1.5,
            min_packets: 10,
            burst_gap_us: 50.0,
            normal_min_us: 500.0,
            large_gap_us: 1200.0,
            periodic_gap_us: 5000.0,
            periodic_cv_max: 0.3,
            min_large_gaps_for_pattern: 5,
            burst_dominated_pct: 30.0,
            min_frame_gaps: 5,
            percentiles: vec![1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0],
            periodicity_candidates_us: vec![1000.0, 5000.0, 10000.0],
            periodicity_tolerance_us: 100.0,
            periodicity_max_multiple: 2,
            periodicity_min_hits: 5,
            gap_sample_limit: 2000,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            settle_ms: 2000,
            capture_secs: 10.0,
            safe_cycle_ns: 1_000_000, // 1ms, all gates open
            monitored_traffic_class: 0,
        }
    }
}

impl Default for ApplierConfig {
    fn default() -> Self {
        ApplierConfig {
            command: "./keti-tsn".to_string(),
            args: vec!["patch".to_string()],
            working_dir: ".".to_string(),
            document_path: "lidar-tas/_tasgap_config.yaml".to_string(),
            interface: "1".to_string(),
            failure_marker: "Failed".to_string(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            window_secs: 1.0,
            ema_alpha: 0.15, // ~7 window memory
            history_len: 300,
            stats_port: 31902,
            allow_control: true,
        }
    }
}

impl SystemConfig {
    /// Load a config file. Missing sections and fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would only fail deep inside a sweep.
    pub fn validate(&self) -> Result<()> {
        capture_duration(self.sweep.capture_secs).context("sweep.capture_secs")?;
        capture_duration(self.live.window_secs).context("live.window_secs")?;
        validate_interface(&self.applier.interface).context("applier.interface")?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
