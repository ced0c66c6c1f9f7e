//! Switch configuration through the external TSN configuration tool.
//!
//! The schedule is rendered as a YANG `gate-parameter-table` patch document,
//! written to disk, and handed to the tool (`./keti-tsn patch <file>` by
//! default). The tool exits 0 even when individual patches fail, so stdout is
//! also checked for the failure marker.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::ApplierConfig;
use crate::schedule::{Schedule, GATE_ALL};
use crate::traits::ScheduleApplier;

const OUTPUT_TAIL: usize = 400;
const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct GateParameterTable {
    gate_enabled: bool,
    admin_gate_states: u8,
    admin_cycle_time: RationalTime,
    admin_base_time: PtpTime,
    admin_control_list: ControlList,
    config_change: bool,
}

#[derive(Debug, Serialize)]
struct RationalTime {
    numerator: u64,
    denominator: u64,
}

#[derive(Debug, Serialize)]
struct PtpTime {
    seconds: u64,
    nanoseconds: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ControlList {
    gate_control_entry: Vec<GateControlEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct GateControlEntry {
    index: usize,
    operation_name: &'static str,
    gate_states_value: u8,
    time_interval_value: u64,
}

impl GateParameterTable {
    fn from_schedule(schedule: &Schedule) -> Self {
        GateParameterTable {
            gate_enabled: true,
            admin_gate_states: GATE_ALL,
            admin_cycle_time: RationalTime {
                numerator: schedule.cycle_ns(),
                denominator: NS_PER_SEC,
            },
            admin_base_time: PtpTime { seconds: 0, nanoseconds: 0 },
            admin_control_list: ControlList {
                gate_control_entry: schedule
                    .entries()
                    .iter()
                    .enumerate()
                    .map(|(index, e)| GateControlEntry {
                        index,
                        operation_name: "set-gate-states",
                        gate_states_value: e.gate_mask,
                        time_interval_value: e.duration_ns,
                    })
                    .collect(),
            },
            config_change: true,
        }
    }
}

/// Switch port names end up inside an XPath predicate; only plain names pass.
pub fn validate_interface(interface: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':');
    if interface.is_empty() || !interface.chars().all(allowed) {
        return Err(anyhow!(
            "interface name {:?} may only contain ASCII letters, digits and - _ . / :",
            interface
        ));
    }
    Ok(())
}

pub fn gate_table_path(interface: &str) -> String {
    format!(
        "/ietf-interfaces:interfaces/interface[name='{}']\
         /ieee802-dot1q-bridge:bridge-port\
         /ieee802-dot1q-sched-bridge:gate-parameter-table",
        interface
    )
}

/// Render the gate-parameter-table patch for `interface`: a one-element list
/// mapping the YANG path to the table.
pub fn render_gate_table(schedule: &Schedule, interface: &str) -> Result<String> {
    validate_interface(interface)?;
    let mut patch = BTreeMap::new();
    patch.insert(gate_table_path(interface), GateParameterTable::from_schedule(schedule));
    serde_yaml::to_string(&[patch]).context("Failed to render gate-parameter-table")
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Runs the configured tool for every apply.
pub struct CommandApplier {
    config: ApplierConfig,
}

impl CommandApplier {
    pub fn new(config: ApplierConfig) -> Self {
        CommandApplier { config }
    }

    pub fn document_path(&self) -> PathBuf {
        Path::new(&self.config.working_dir).join(&self.config.document_path)
    }

    fn write_document(&self, schedule: &Schedule) -> Result<PathBuf> {
        let path = self.document_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let document = render_gate_table(schedule, &self.config.interface)?;
        std::fs::write(&path, document)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

impl ScheduleApplier for CommandApplier {
    fn apply(&mut self, schedule: &Schedule) -> Result<()> {
        let path = self.write_document(schedule)?;
        let description = schedule.describe(0);
        debug!("[Applier] Wrote {} ({})", path.display(), description);

        let output = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(&self.config.document_path)
            .current_dir(&self.config.working_dir)
            .output()
            .with_context(|| {
                format!("Failed to run {} in {}", self.config.command, self.config.working_dir)
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let marker = &self.config.failure_marker;
        let marker_hit = !marker.is_empty() && stdout.contains(marker.as_str());

        if !output.status.success() || marker_hit {
            return Err(anyhow!(
                "{} rejected schedule {} (cycle {}ns, {}): stdout: {} stderr: {}",
                self.config.command,
                description,
                schedule.cycle_ns(),
                output.status,
                tail(&stdout, OUTPUT_TAIL),
                tail(&stderr, OUTPUT_TAIL)
            ));
        }

        info!("[Applier] Applied {}", description);
        Ok(())
    }
}

/// Logs the rendered document instead of touching the switch.
#[derive(Default)]
pub struct DryRunApplier {
    interface: String,
    applied: usize,
}

impl DryRunApplier {
    pub fn new(interface: &str) -> Self {
        DryRunApplier { interface: interface.to_string(), applied: 0 }
    }

    pub fn applied_count(&self) -> usize {
        self.applied
    }
}

impl ScheduleApplier for DryRunApplier {
    fn apply(&mut self, schedule: &Schedule) -> Result<()> {
        self.applied += 1;
        info!("[Applier] Dry run: {}", schedule.describe(0));
        let document = render_gate_table(schedule, &self.interface)?;
        debug!("[Applier] Dry run document:\n{}", document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::EntrySpec;

    fn parse(document: &str) -> serde_yaml::Value {
        serde_yaml::from_str(document).unwrap()
    }

    fn table<'a>(doc: &'a serde_yaml::Value, interface: &str) -> &'a serde_yaml::Value {
        let list = doc.as_sequence().expect("patch list");
        assert_eq!(list.len(), 1);
        &list[0][gate_table_path(interface).as_str()]
    }

    #[test]
    fn test_render_two_entry_table() {
        let schedule = Schedule::open_close(1_000_000, 600_000).unwrap();
        let doc = parse(&render_gate_table(&schedule, "1").unwrap());
        let t = table(&doc, "1");

        assert_eq!(t["gate-enabled"], serde_yaml::Value::Bool(true));
        assert_eq!(t["admin-gate-states"].as_u64(), Some(255));
        assert_eq!(t["admin-cycle-time"]["numerator"].as_u64(), Some(1_000_000));
        assert_eq!(t["admin-cycle-time"]["denominator"].as_u64(), Some(1_000_000_000));
        assert_eq!(t["admin-base-time"]["seconds"].as_u64(), Some(0));
        assert_eq!(t["config-change"], serde_yaml::Value::Bool(true));

        let entries = t["admin-control-list"]["gate-control-entry"].as_sequence().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["index"].as_u64(), Some(0));
        assert_eq!(entries[0]["operation-name"].as_str(), Some("set-gate-states"));
        assert_eq!(entries[0]["gate-states-value"].as_u64(), Some(255));
        assert_eq!(entries[0]["time-interval-value"].as_u64(), Some(600_000));
        assert_eq!(entries[1]["gate-states-value"].as_u64(), Some(254));
        assert_eq!(entries[1]["time-interval-value"].as_u64(), Some(400_000));
    }

    #[test]
    fn test_gate_table_path() {
        assert_eq!(
            gate_table_path("1"),
            "/ietf-interfaces:interfaces/interface[name='1']/ieee802-dot1q-bridge:bridge-port\
             /ieee802-dot1q-sched-bridge:gate-parameter-table"
        );
    }

    #[test]
    fn test_render_multi_entry_indices() {
        let schedule = Schedule::build(
            10_000_000,
            &[EntrySpec::ms(0x01, 4.0), EntrySpec::ms(0x40, 3.0), EntrySpec::ms(0x04, 3.0)],
        )
        .unwrap();
        let doc = parse(&render_gate_table(&schedule, "swp2").unwrap());
        let t = table(&doc, "swp2");
        let entries = t["admin-control-list"]["gate-control-entry"].as_sequence().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2]["index"].as_u64(), Some(2));
        assert_eq!(entries[1]["gate-states-value"].as_u64(), Some(64));
        assert_eq!(t["admin-cycle-time"]["numerator"].as_u64(), Some(10_000_000));
    }

    #[test]
    fn test_interface_names_are_checked() {
        for ok in ["1", "eth0", "swp1.100", "ge-0/0/1", "Port_3:a"] {
            assert!(validate_interface(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "eth\"0", "eth'0", "1']/x", "a b", "p\n"] {
            assert!(validate_interface(bad).is_err(), "{:?}", bad);
        }

        let schedule = Schedule::all_open(1_000_000).unwrap();
        assert!(render_gate_table(&schedule, "eth\"0").is_err());
        let mut dry = DryRunApplier::new("eth'0");
        assert!(dry.apply(&schedule).is_err());
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("short\n", 10), "short");
        assert_eq!(tail("0123456789abc", 3), "abc");
        assert_eq!(tail("ééé", 3), "é");
    }

    #[test]
    fn test_dry_run_counts() {
        let mut applier = DryRunApplier::new("1");
        applier.apply(&Schedule::all_open(1_000_000).unwrap()).unwrap();
        assert_eq!(applier.applied_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_applier_detects_failure_marker() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = Schedule::open_close(1_000_000, 500_000).unwrap();

        let mut config = ApplierConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo \"Patched $0\"".to_string()],
            working_dir: dir.path().display().to_string(),
            document_path: "lidar-tas/_patch.yaml".to_string(),
            ..ApplierConfig::default()
        };
        let mut ok = CommandApplier::new(config.clone());
        ok.apply(&schedule).unwrap();
        let written = std::fs::read_to_string(dir.path().join("lidar-tas/_patch.yaml")).unwrap();
        let doc = parse(&written);
        let entries = &table(&doc, "1")["admin-control-list"]["gate-control-entry"];
        assert_eq!(entries[1]["time-interval-value"].as_u64(), Some(500_000));

        config.args = vec!["-c".to_string(), "echo \"Failed to patch $0\"".to_string()];
        let err = CommandApplier::new(config.clone()).apply(&schedule).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("Failed to patch"), "{}", msg);
        assert!(msg.contains("1000000"), "{}", msg);

        config.args = vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()];
        let err = CommandApplier::new(config).apply(&schedule).unwrap_err();
        assert!(format!("{:#}", err).contains("oops"));
    }
}
