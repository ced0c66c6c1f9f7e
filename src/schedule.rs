//! Gate-control list model for 802.1Qbv time-aware shaping.
//!
//! A [`Schedule`] is an ordered list of gate entries (8-bit traffic-class mask
//! plus a duration) whose durations add up exactly to the cycle time. Every
//! schedule is created through [`Schedule::build`], so a value of this type is
//! always valid and can be handed to a [`crate::traits::ScheduleApplier`].
//!
//! Durations are nanoseconds, the unit of the switch's `time-interval-value`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// All traffic classes open.
pub const GATE_ALL: u8 = 0xFF;
/// Everything except TC0 (the LiDAR stream travels untagged on TC0).
pub const GATE_ALL_BUT_TC0: u8 = 0xFE;
pub const GATE_TC0: u8 = 0x01;
pub const GATE_TC2: u8 = 0x04;
pub const GATE_TC5: u8 = 0x20;
pub const GATE_TC6: u8 = 0x40;

pub const NS_PER_US: u64 = 1_000;
pub const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cycle time must be > 0")]
    ZeroCycle,
    #[error("entry {index}: gate {gate} outside 0..=255")]
    GateOutOfRange { index: usize, gate: i64 },
    #[error("entry {index}: duration {duration} must be >= 0")]
    NegativeDuration { index: usize, duration: i64 },
    #[error("all entry durations are 0")]
    Empty,
    #[error("sum(duration)={sum} must equal cycle={cycle} ({sum} != {cycle})")]
    SumMismatch { sum: u64, cycle: u64 },
    #[error("{us}us does not fit in nanoseconds")]
    OutOfRange { us: u64 },
}

pub fn us_to_ns(us: u64) -> Result<u64, ScheduleError> {
    us.checked_mul(NS_PER_US).ok_or(ScheduleError::OutOfRange { us })
}

/// Unvalidated entry as it arrives from a plan file or the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub gate: i64,
    pub duration_ns: i64,
}

impl EntrySpec {
    pub fn new(gate: i64, duration_ns: i64) -> Self {
        EntrySpec { gate, duration_ns }
    }

    pub fn us(gate: i64, duration_us: i64) -> Self {
        EntrySpec { gate, duration_ns: duration_us.saturating_mul(NS_PER_US as i64) }
    }

    /// Microsecond entry from untrusted input; `None` when it does not fit in ns.
    pub fn checked_us(gate: i64, duration_us: i64) -> Option<Self> {
        Some(EntrySpec { gate, duration_ns: duration_us.checked_mul(NS_PER_US as i64)? })
    }

    pub fn ms(gate: i64, duration_ms: f64) -> Self {
        EntrySpec { gate, duration_ns: (duration_ms * NS_PER_MS as f64).round() as i64 }
    }
}

/// `GATE:DURATION`, e.g. `0xFF:600us`, `1:4ms`, `254:400000ns`. A bare
/// duration is microseconds.
impl FromStr for EntrySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (gate, duration) = s
            .split_once(':')
            .ok_or_else(|| format!("expected GATE:DURATION, got '{}'", s))?;
        let gate = gate.trim();
        let gate = match gate.strip_prefix("0x").or_else(|| gate.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => gate.parse::<i64>(),
        }
        .map_err(|e| format!("bad gate '{}': {}", gate, e))?;

        let duration = duration.trim();
        let (number, scale) = if let Some(v) = duration.strip_suffix("ns") {
            (v, 1.0)
        } else if let Some(v) = duration.strip_suffix("ms") {
            (v, NS_PER_MS as f64)
        } else if let Some(v) =
            duration.strip_suffix("us").or_else(|| duration.strip_suffix("µs"))
        {
            (v, NS_PER_US as f64)
        } else {
            (duration, NS_PER_US as f64)
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|e| format!("bad duration '{}': {}", duration, e))?;
        let ns = (value * scale).round();
        if !ns.is_finite() || ns.abs() >= i64::MAX as f64 {
            return Err(format!("duration '{}' out of range", duration));
        }
        Ok(EntrySpec { gate, duration_ns: ns as i64 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEntry {
    pub gate_mask: u8,
    pub duration_ns: u64,
}

impl GateEntry {
    pub fn is_open_for(&self, traffic_class: u8) -> bool {
        traffic_class < 8 && self.gate_mask & (1u8 << traffic_class) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    cycle_ns: u64,
    entries: Vec<GateEntry>,
}

impl Schedule {
    /// Validate a raw entry list against the declared cycle.
    ///
    /// Zero-duration entries are dropped. The remaining durations must sum to
    /// `cycle_ns` exactly.
    pub fn build(cycle_ns: u64, entries: &[EntrySpec]) -> Result<Self, ScheduleError> {
        if cycle_ns == 0 {
            return Err(ScheduleError::ZeroCycle);
        }

        let mut normalized = Vec::with_capacity(entries.len());
        let mut sum: u64 = 0;
        for (index, e) in entries.iter().enumerate() {
            if !(0..=255).contains(&e.gate) {
                return Err(ScheduleError::GateOutOfRange { index, gate: e.gate });
            }
            if e.duration_ns < 0 {
                return Err(ScheduleError::NegativeDuration { index, duration: e.duration_ns });
            }
            if e.duration_ns == 0 {
                continue;
            }
            let duration_ns = e.duration_ns as u64;
            sum = sum.saturating_add(duration_ns);
            normalized.push(GateEntry { gate_mask: e.gate as u8, duration_ns });
        }

        if normalized.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if sum != cycle_ns {
            return Err(ScheduleError::SumMismatch { sum, cycle: cycle_ns });
        }

        Ok(Schedule { cycle_ns, entries: normalized })
    }

    /// Classic two-entry schedule: everything open for `open_ns`, then TC0
    /// closed for the rest of the cycle. `open_ns >= cycle_ns` yields a single
    /// all-open entry.
    pub fn open_close(cycle_ns: u64, open_ns: u64) -> Result<Self, ScheduleError> {
        let open_ns = open_ns.min(cycle_ns);
        let close_ns = cycle_ns - open_ns;
        if close_ns == 0 {
            return Self::all_open(cycle_ns);
        }
        Self::build(
            cycle_ns,
            &[
                EntrySpec::new(GATE_ALL as i64, open_ns as i64),
                EntrySpec::new(GATE_ALL_BUT_TC0 as i64, close_ns as i64),
            ],
        )
    }

    pub fn all_open(cycle_ns: u64) -> Result<Self, ScheduleError> {
        Self::build(cycle_ns, &[EntrySpec::new(GATE_ALL as i64, cycle_ns as i64)])
    }

    /// Two-entry schedule from a percentage of the cycle.
    pub fn from_percent(cycle_ns: u64, open_pct: f64) -> Result<Self, ScheduleError> {
        Self::open_close(cycle_ns, open_duration_for_percent(cycle_ns, open_pct))
    }

    pub fn cycle_ns(&self) -> u64 {
        self.cycle_ns
    }

    pub fn entries(&self) -> &[GateEntry] {
        &self.entries
    }

    /// Time per cycle during which `traffic_class` may transmit.
    pub fn open_ns_for(&self, traffic_class: u8) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_open_for(traffic_class))
            .map(|e| e.duration_ns)
            .sum()
    }

    pub fn open_pct_for(&self, traffic_class: u8) -> f64 {
        percent_open(self.open_ns_for(traffic_class), self.cycle_ns)
    }

    pub fn is_all_open(&self) -> bool {
        self.entries.iter().all(|e| e.gate_mask == GATE_ALL)
    }

    /// e.g. `OPEN(600µs) → CLOSE(400µs)` from the point of view of one class.
    pub fn describe(&self, traffic_class: u8) -> String {
        self.entries
            .iter()
            .map(|e| {
                let state = if e.gate_mask == GATE_ALL {
                    "OPEN".to_string()
                } else if e.is_open_for(traffic_class) {
                    format!("OPEN[0x{:02X}]", e.gate_mask)
                } else {
                    format!("CLOSE[0x{:02X}]", e.gate_mask)
                };
                format!("{}({})", state, format_duration_ns(e.duration_ns))
            })
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Absolute open time for a percentage of the cycle, truncated to whole ns
/// and clamped to the cycle.
pub fn open_duration_for_percent(cycle_ns: u64, open_pct: f64) -> u64 {
    let pct = open_pct.clamp(0.0, 100.0);
    ((cycle_ns as f64 * pct / 100.0) as u64).min(cycle_ns)
}

pub fn percent_open(open_ns: u64, cycle_ns: u64) -> f64 {
    if cycle_ns == 0 {
        return 0.0;
    }
    open_ns as f64 / cycle_ns as f64 * 100.0
}

pub fn format_duration_ns(ns: u64) -> String {
    if ns >= NS_PER_MS && ns % (NS_PER_MS / 1000) == 0 && ns % NS_PER_MS != 0 {
        format!("{:.3}ms", ns as f64 / NS_PER_MS as f64)
    } else if ns >= NS_PER_MS && ns % NS_PER_MS == 0 {
        format!("{}ms", ns / NS_PER_MS)
    } else if ns % NS_PER_US == 0 {
        format!("{}µs", ns / NS_PER_US)
    } else {
        format!("{}ns", ns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Single,
    Multi,
}

/// One mirrored entry, in microseconds like the rest of the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AppliedEntry {
    pub gate: u8,
    pub duration_us: f64,
}

/// Last schedule known to be applied to the switch. Display only; the switch
/// holds the authoritative copy.
///
/// Times are microseconds (fractional when the schedule has sub-µs entries);
/// `open_us` is the open time of the monitored traffic class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedSchedule {
    pub enabled: bool,
    pub cycle_us: f64,
    pub open_us: f64,
    pub close_us: f64,
    pub open_pct: f64,
    pub mode: ScheduleMode,
    pub entries: Vec<AppliedEntry>,
    pub applied_ts: u64,
}

fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / NS_PER_US as f64
}

impl AppliedSchedule {
    pub fn from_schedule(schedule: &Schedule, traffic_class: u8) -> Self {
        let open_ns = schedule.open_ns_for(traffic_class);
        let close_ns = schedule.cycle_ns().saturating_sub(open_ns);
        AppliedSchedule {
            enabled: close_ns > 0,
            cycle_us: ns_to_us(schedule.cycle_ns()),
            open_us: ns_to_us(open_ns),
            close_us: ns_to_us(close_ns),
            open_pct: schedule.open_pct_for(traffic_class),
            mode: if schedule.entries().len() > 2 {
                ScheduleMode::Multi
            } else {
                ScheduleMode::Single
            },
            entries: schedule
                .entries()
                .iter()
                .map(|e| AppliedEntry { gate: e.gate_mask, duration_us: ns_to_us(e.duration_ns) })
                .collect(),
            applied_ts: chrono::Utc::now().timestamp() as u64,
        }
    }
}

impl Default for AppliedSchedule {
    fn default() -> Self {
        AppliedSchedule {
            enabled: false,
            cycle_us: 1000.0,
            open_us: 1000.0,
            close_us: 0.0,
            open_pct: 100.0,
            mode: ScheduleMode::Single,
            entries: vec![AppliedEntry { gate: GATE_ALL, duration_us: 1000.0 }],
            applied_ts: 0,
        }
    }
}
