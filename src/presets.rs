//! Built-in sweep plans and plan files.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::schedule::{
    EntrySpec, GATE_ALL, GATE_ALL_BUT_TC0, GATE_TC0, GATE_TC2, GATE_TC5, GATE_TC6, NS_PER_MS,
    NS_PER_US,
};
use crate::sweep::SweepStep;

pub const PRESET_NAMES: [&str; 4] = ["basic", "diagnosis", "comprehensive", "multitc"];

const ENDURANCE_SECS: f64 = 60.0;

pub fn preset(name: &str) -> Result<Vec<SweepStep>> {
    match name {
        "basic" => Ok(basic()),
        "diagnosis" => Ok(diagnosis()),
        "comprehensive" => Ok(comprehensive()),
        "multitc" => Ok(multitc()),
        _ => Err(anyhow!("Unknown preset '{}' (available: {})", name, PRESET_NAMES.join(", "))),
    }
}

/// Load a JSON array of steps.
pub fn load_plan(path: &Path) -> Result<Vec<SweepStep>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let plan: Vec<SweepStep> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse plan {}", path.display()))?;
    if plan.is_empty() {
        return Err(anyhow!("Plan {} has no steps", path.display()));
    }
    for step in plan.iter().filter(|s| s.capture_secs.is_some()) {
        step.capture_duration(0.0)
            .with_context(|| format!("Invalid capture_secs in plan {}", path.display()))?;
    }
    Ok(plan)
}

fn pct_step(category: &str, cycle_us: u64, pct: u64, label: String) -> SweepStep {
    let cycle_ns = cycle_us * NS_PER_US;
    SweepStep::open_close(label, category, cycle_ns, cycle_ns * pct / 100)
}

fn ms_label(cycle_us: u64) -> String {
    if cycle_us % 1000 == 0 {
        format!("{}ms", cycle_us / 1000)
    } else {
        format!("{}µs", cycle_us)
    }
}

/// Baseline plus 1/5/10/50 ms cycles at 80/50/20 % open.
pub fn basic() -> Vec<SweepStep> {
    let mut plan = vec![SweepStep::all_open("Baseline", "baseline", NS_PER_MS)];
    for cycle_ms in [1u64, 5, 10, 50] {
        for pct in [80u64, 50, 20] {
            plan.push(pct_step("basic", cycle_ms * 1000, pct, format!("{}ms/{}%", cycle_ms, pct)));
        }
    }
    plan
}

/// All-open at three cycle times, then gated comparisons. Stdev spread across
/// the all-open steps tells whether the cycle itself adds jitter.
pub fn diagnosis() -> Vec<SweepStep> {
    let mut plan: Vec<SweepStep> = [1u64, 10, 100]
        .iter()
        .map(|&ms| {
            SweepStep::all_open(format!("All-Open ({}ms cycle)", ms), "all_open", ms * NS_PER_MS)
        })
        .collect();
    let gated = [(1000u64, 800u64), (1000, 500), (5000, 4000), (10000, 5000), (50000, 10000)];
    for (cycle_us, open_us) in gated {
        let label = format!("{}/{}% open", ms_label(cycle_us), open_us * 100 / cycle_us);
        plan.push(SweepStep::open_close(label, "gated", cycle_us * NS_PER_US, open_us * NS_PER_US));
    }
    plan
}

fn open_close_entries(open_ms: &[(bool, u64)]) -> Vec<EntrySpec> {
    open_ms
        .iter()
        .map(|&(open, ms)| {
            let gate = if open { GATE_ALL } else { GATE_ALL_BUT_TC0 };
            EntrySpec::new(gate as i64, (ms * NS_PER_MS) as i64)
        })
        .collect()
}

pub fn comprehensive() -> Vec<SweepStep> {
    let mut plan = Vec::new();

    // Sub-millisecond: cycles at or below the packet interval
    for cycle_us in [100u64, 250, 500, 750, 781] {
        for pct in [80u64, 50] {
            let open_us = cycle_us * pct / 100;
            plan.push(SweepStep::open_close(
                format!("{}µs/{}%", cycle_us, pct),
                "sub_ms",
                cycle_us * NS_PER_US,
                open_us * NS_PER_US,
            ));
        }
    }

    // Buffer mapping: close time sweep at 20% open, then open % at 50ms
    for cycle_ms in [10u64, 15, 20, 25, 30, 35, 40, 45, 50] {
        plan.push(pct_step("buffer", cycle_ms * 1000, 20, format!("{}ms/20%", cycle_ms)));
    }
    for pct in [25u64, 30, 35, 40] {
        plan.push(pct_step("buffer", 50_000, pct, format!("50ms/{}%", pct)));
    }

    // 100ms = one sensor frame
    for pct in [90u64, 80, 70, 60, 50] {
        plan.push(pct_step("frame_aligned", 100_000, pct, format!("100ms/{}%", pct)));
    }

    plan.push(SweepStep::entries(
        "10ms 3-gate (2/6/2)",
        "multi_gcl",
        10 * NS_PER_MS,
        open_close_entries(&[(true, 2), (false, 6), (true, 2)]),
    ));
    plan.push(SweepStep::entries(
        "10ms 3-gate (1/8/1)",
        "multi_gcl",
        10 * NS_PER_MS,
        open_close_entries(&[(true, 1), (false, 8), (true, 1)]),
    ));
    plan.push(SweepStep::entries(
        "20ms 4-gate (5/5/5/5)",
        "multi_gcl",
        20 * NS_PER_MS,
        open_close_entries(&[(true, 5), (false, 5), (true, 5), (false, 5)]),
    ));
    plan.push(SweepStep::entries(
        "100ms 4-gate (30/20/30/20)",
        "multi_gcl",
        100 * NS_PER_MS,
        open_close_entries(&[(true, 30), (false, 20), (true, 30), (false, 20)]),
    ));

    for (cycle_us, open_us, label) in [
        (1000u64, 500u64, "1ms/50%"),
        (10_000, 2000, "10ms/20%"),
        (50_000, 10_000, "50ms/20%"),
        (781, 390, "781µs/50%"),
        (100_000, 70_000, "100ms/70%"),
    ] {
        let step = SweepStep::open_close(
            format!("{} (60s)", label),
            "endurance",
            cycle_us * NS_PER_US,
            open_us * NS_PER_US,
        );
        plan.push(step.with_capture_secs(ENDURANCE_SECS));
    }

    for pct in [99u64, 98, 95, 90] {
        plan.push(pct_step("boundary", 1000, pct, format!("1ms/{}%", pct)));
    }
    plan.push(pct_step("boundary", 200_000, 80, "200ms/80%".to_string()));
    plan.push(pct_step("boundary", 500_000, 50, "500ms/50%".to_string()));

    plan
}

fn tc_entries(slots: &[(u8, u64)]) -> Vec<EntrySpec> {
    slots
        .iter()
        .filter(|(_, ns)| *ns > 0)
        .map(|&(gate, ns)| EntrySpec::new(gate as i64, ns as i64))
        .collect()
}

/// Multi-class plans: the sensor shares a 10ms cycle with control, camera
/// and radar classes instead of being gated by an open/close pair.
pub fn multitc() -> Vec<SweepStep> {
    let ms = |v: f64| (v * NS_PER_MS as f64).round() as u64;
    let cycle = 10 * NS_PER_MS;
    let mut plan = Vec::new();

    let splits = [
        (1u64, 5u64, 4u64),
        (2, 4, 4),
        (3, 4, 3),
        (4, 3, 3),
        (5, 3, 2),
        (6, 2, 2),
        (7, 2, 1),
        (8, 1, 1),
    ];
    for (tc0, tc6, tc2) in splits {
        plan.push(SweepStep::entries(
            format!("TC0={}ms ({}%)", tc0, tc0 * 10),
            "tc0_sweep",
            cycle,
            tc_entries(&[
                (GATE_TC0, tc0 * NS_PER_MS),
                (GATE_TC6, tc6 * NS_PER_MS),
                (GATE_TC2, tc2 * NS_PER_MS),
            ]),
        ));
    }

    // Same 4ms of TC0 per cycle, split into more and shorter windows
    let fragmentation: Vec<(&str, Vec<(u8, u64)>)> = vec![
        ("1×4ms (contiguous)", vec![(GATE_TC0, ms(4.0)), (GATE_TC6, ms(6.0))]),
        (
            "2×2ms (split)",
            vec![
                (GATE_TC0, ms(2.0)),
                (GATE_TC6, ms(3.0)),
                (GATE_TC0, ms(2.0)),
                (GATE_TC2, ms(3.0)),
            ],
        ),
        (
            "3×1.3ms (fragmented)",
            vec![
                (GATE_TC0, 1_333_333),
                (GATE_TC6, ms(2.0)),
                (GATE_TC0, 1_333_333),
                (GATE_TC2, ms(2.0)),
                (GATE_TC0, 1_333_334),
                (GATE_TC6, ms(2.0)),
            ],
        ),
        (
            "4×1ms (high freq)",
            vec![
                (GATE_TC0, ms(1.0)),
                (GATE_TC6, ms(1.0)),
                (GATE_TC0, ms(1.0)),
                (GATE_TC6, ms(1.0)),
                (GATE_TC0, ms(1.0)),
                (GATE_TC6, ms(1.0)),
                (GATE_TC0, ms(1.0)),
                (GATE_TC6, ms(3.0)),
            ],
        ),
        (
            "4×0.5ms (ultra-fast)",
            vec![
                (GATE_TC0, ms(0.5)),
                (GATE_TC6, ms(0.5)),
                (GATE_TC0, ms(0.5)),
                (GATE_TC6, ms(0.5)),
                (GATE_TC0, ms(0.5)),
                (GATE_TC6, ms(0.5)),
                (GATE_TC0, ms(0.5)),
                (GATE_TC6, ms(6.5)),
            ],
        ),
        ("1×2ms (half baseline)", vec![(GATE_TC0, ms(2.0)), (GATE_TC6, ms(8.0))]),
    ];
    for (label, slots) in fragmentation {
        plan.push(SweepStep::entries(label, "fragmentation", cycle, tc_entries(&slots)));
    }

    // Fixed 40/30/20/10 split, only the cycle changes
    for cycle_ms in [2u64, 5, 10, 20, 50, 100] {
        let c = cycle_ms as f64;
        plan.push(SweepStep::entries(
            format!("{}ms cycle (ROII)", cycle_ms),
            "cycle_scaling",
            cycle_ms * NS_PER_MS,
            tc_entries(&[
                (GATE_TC0, ms(c * 0.4)),
                (GATE_TC6, ms(c * 0.3)),
                (GATE_TC2, ms(c * 0.2)),
                (GATE_ALL, ms(c * 0.1)),
            ]),
        ));
    }

    for (name, tc0, tc6, tc5, tc2, guard) in [
        ("ROII-Standard", 4.0, 2.5, 1.5, 1.0, 1.0),
        ("LiDAR-Heavy", 6.0, 1.5, 1.0, 0.5, 1.0),
        ("Radar-Heavy", 2.0, 5.0, 1.0, 1.0, 1.0),
        ("Camera-Heavy", 2.0, 1.0, 5.0, 1.0, 1.0),
        ("Equal-Share", 2.0, 2.0, 2.0, 2.0, 2.0),
    ] {
        plan.push(SweepStep::entries(
            name,
            "roii_profiles",
            cycle,
            tc_entries(&[
                (GATE_TC0, ms(tc0)),
                (GATE_TC6, ms(tc6)),
                (GATE_TC5, ms(tc5)),
                (GATE_TC2, ms(tc2)),
                (GATE_ALL, ms(guard)),
            ]),
        ));
    }

    // Guard slot opens every class, TC0 included
    for (guard_ms, tc6_ms) in [(0u64, 6u64), (1, 5), (2, 4), (3, 3), (6, 0)] {
        plan.push(SweepStep::entries(
            format!("Guard={}ms (eff TC0={}ms)", guard_ms, 4 + guard_ms),
            "guard_band",
            cycle,
            tc_entries(&[
                (GATE_TC0, 4 * NS_PER_MS),
                (GATE_ALL, guard_ms * NS_PER_MS),
                (GATE_TC6, tc6_ms * NS_PER_MS),
            ]),
        ));
    }

    plan
}
