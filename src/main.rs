use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tasgap::analyzer::{self, GapAnalyzer};
use tasgap::applier::{CommandApplier, DryRunApplier};
use tasgap::capture::{capture_duration, CaptureGate, PacketCapture};
use tasgap::config::SystemConfig;
use tasgap::control::{CapturerFactory, ControlPlane, EntryUs, GateListRequest, SharedApplier};
use tasgap::live::{LiveMonitor, LiveView};
use tasgap::presets;
use tasgap::report;
use tasgap::schedule::{
    format_duration_ns, us_to_ns, AppliedSchedule, EntrySpec, Schedule, NS_PER_US,
};
use tasgap::state::SnapshotCell;
use tasgap::stats_server::{self, StatsRequest, StatsServer, StatsSources};
use tasgap::sweep::{SweepOrchestrator, SweepProgress, SweepStep};
use tasgap::traits::{Capturer, ScheduleApplier};

const REPORT_DIR: &str = "results";
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file (missing fields use defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// UDP port of the sensor stream
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Switch port name in the gate-parameter-table path
    #[arg(long, global = true)]
    interface: Option<String>,

    /// Log schedules instead of running the configuration tool
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a sweep over gate schedules and write a JSON report
    Sweep(SweepArgs),
    /// Continuous capture with published live statistics
    Live(LiveArgs),
    /// Apply a single schedule to the switch
    Apply {
        #[command(flatten)]
        schedule: ScheduleArgs,
        /// Send the schedule to a running `live` instance (HOST:PORT) instead
        #[arg(long)]
        remote: Option<String>,
    },
    /// Capture once under the current schedule and print the analysis
    Capture {
        /// Capture duration in seconds
        #[arg(short, long, default_value_t = 10.0)]
        secs: f64,
        /// Write the full gap report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Built-in plan: basic, diagnosis, comprehensive, multitc
    #[arg(long, default_value = "basic", conflicts_with = "plan")]
    preset: String,
    /// JSON plan file instead of a preset
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Report path; `<name>.samples.json` is written next to it
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    settle_ms: Option<u64>,
    /// Default capture time per step; plan entries may override
    #[arg(long)]
    capture_secs: Option<f64>,
    /// Serve sweep status on the stats port while running
    #[arg(long)]
    serve: bool,
}

#[derive(Args, Debug)]
struct LiveArgs {
    #[arg(long)]
    window_secs: Option<f64>,
    #[arg(long)]
    stats_port: Option<u16>,
    /// Run this preset in the background while live stats keep updating
    #[arg(long)]
    sweep: Option<String>,
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    /// Cycle time in microseconds
    #[arg(long, default_value_t = 1000)]
    cycle_us: u64,
    /// Open time of TC0 per cycle in microseconds
    #[arg(long, conflicts_with_all = ["open_pct", "entry"])]
    open_us: Option<u64>,
    /// Open share of the cycle in percent
    #[arg(long, conflicts_with = "entry")]
    open_pct: Option<f64>,
    /// Explicit entry GATE:DURATION (e.g. 0x01:4ms), repeatable
    #[arg(long)]
    entry: Vec<EntrySpec>,
}

impl ScheduleArgs {
    fn build(&self) -> Result<Schedule> {
        let cycle_ns = us_to_ns(self.cycle_us)?;
        let schedule = if !self.entry.is_empty() {
            Schedule::build(cycle_ns, &self.entry)?
        } else if let Some(open_us) = self.open_us {
            Schedule::open_close(cycle_ns, us_to_ns(open_us)?)?
        } else if let Some(pct) = self.open_pct {
            Schedule::from_percent(cycle_ns, pct)?
        } else {
            Schedule::all_open(cycle_ns)?
        };
        Ok(schedule)
    }
}

fn load_config(cli: &Cli) -> Result<SystemConfig> {
    let mut config = match &cli.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if let Some(port) = cli.port {
        config.capture.port = port;
    }
    if let Some(interface) = &cli.interface {
        config.applier.interface = interface.clone();
    }
    match &cli.command {
        Command::Sweep(args) => {
            if let Some(ms) = args.settle_ms {
                config.sweep.settle_ms = ms;
            }
            if let Some(secs) = args.capture_secs {
                config.sweep.capture_secs = secs;
            }
        }
        Command::Live(args) => {
            if let Some(secs) = args.window_secs {
                config.live.window_secs = secs;
            }
            if let Some(port) = args.stats_port {
                config.live.stats_port = port;
            }
        }
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

fn make_applier(config: &SystemConfig, dry_run: bool) -> Box<dyn ScheduleApplier + Send> {
    if dry_run {
        info!("Dry run: schedules are logged, the switch is not touched");
        Box::new(DryRunApplier::new(&config.applier.interface))
    } else {
        Box::new(CommandApplier::new(config.applier.clone()))
    }
}

fn resolve_plan(preset: &str, plan: Option<&Path>) -> Result<(String, Vec<SweepStep>)> {
    match plan {
        Some(path) => {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "plan".to_string());
            Ok((name, presets::load_plan(path)?))
        }
        None => Ok((preset.to_string(), presets::preset(preset)?)),
    }
}

fn spawn_stats_server(
    port: u16,
    sources: StatsSources,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let server = StatsServer::bind(port)?;
    Ok(thread::spawn(move || server.run(&sources, &stop)))
}

fn run_sweep(
    cli: &Cli,
    args: &SweepArgs,
    config: SystemConfig,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let (plan_name, plan) = resolve_plan(&args.preset, args.plan.as_deref())?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| report::default_report_path(Path::new(REPORT_DIR), &plan_name));

    let progress = Arc::new(SnapshotCell::<SweepProgress>::default());
    let applied = Arc::new(SnapshotCell::<AppliedSchedule>::default());
    let server_stop = Arc::new(AtomicBool::new(false));
    let server = if args.serve {
        let sources = StatsSources {
            sweep: progress.clone(),
            applied: applied.clone(),
            ..StatsSources::default()
        };
        Some(spawn_stats_server(config.live.stats_port, sources, server_stop.clone())?)
    } else {
        None
    };

    let capture =
        PacketCapture::new(config.capture.clone(), CaptureGate::new()).with_stop(stop.clone());
    let mut orchestrator = SweepOrchestrator::new(
        make_applier(&config, cli.dry_run),
        capture,
        GapAnalyzer::new(config.analyzer.clone()),
        config.sweep.clone(),
        stop,
    )
    .with_progress(progress)
    .with_applied(applied);

    let started_at = chrono::Utc::now();
    let results = orchestrator.run(&plan);
    let outcome = report::save_sweep(&config, &plan_name, started_at, &results, &output);

    server_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = server {
        let _ = handle.join();
    }
    outcome
}

fn run_live(cli: &Cli, args: &LiveArgs, config: SystemConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let gate = CaptureGate::new();
    let mut sources = StatsSources::default();
    let view: Arc<LiveView> = sources.live.clone();

    // Sweeps started here share the capture gate with the live windows
    let control = if config.live.allow_control || args.sweep.is_some() {
        let capture_config = config.capture.clone();
        let capture_gate = gate.clone();
        let capture_stop = stop.clone();
        let new_capturer: CapturerFactory = Box::new(move || {
            let capture = PacketCapture::new(capture_config.clone(), capture_gate.clone())
                .with_stop(capture_stop.clone());
            Box::new(capture) as Box<dyn Capturer + Send>
        });
        let control = ControlPlane::new(
            config.clone(),
            SharedApplier::new(make_applier(&config, cli.dry_run)),
            new_capturer,
            stop.clone(),
        )
        .with_applied(sources.applied.clone())
        .with_progress(sources.sweep.clone())
        .with_report_dir(REPORT_DIR);
        Some(Arc::new(control))
    } else {
        None
    };
    if config.live.allow_control {
        sources.control = control.clone();
    }

    let server = spawn_stats_server(config.live.stats_port, sources, stop.clone())?;

    if let (Some(preset), Some(control)) = (&args.sweep, &control) {
        control.start_sweep(preset)?;
    }

    #[cfg(unix)]
    {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!("sd_notify failed: {}", e);
        }
    }

    let capture = PacketCapture::new(config.capture.clone(), gate).with_stop(stop.clone());
    let analyzer = GapAnalyzer::new(config.analyzer.clone());
    let mut monitor = LiveMonitor::new(capture, analyzer, config.live.clone(), view);
    monitor.run(&stop);

    if let Some(control) = &control {
        control.wait_for_sweep();
    }
    let _ = server.join();
    Ok(())
}

/// Hand the schedule to a running `live` instance so its mirror follows.
fn apply_remote(addr: &str, schedule: &Schedule) -> Result<()> {
    let entries = schedule
        .entries()
        .iter()
        .map(|e| {
            if e.duration_ns % NS_PER_US != 0 {
                return Err(anyhow!(
                    "remote apply needs whole microseconds, got {}ns",
                    e.duration_ns
                ));
            }
            let duration_us = (e.duration_ns / NS_PER_US) as i64;
            Ok(EntryUs { gate: e.gate_mask as i64, duration_us })
        })
        .collect::<Result<Vec<_>>>()?;
    let request = GateListRequest { cycle_us: schedule.cycle_ns() / NS_PER_US, entries };
    let payload = serde_json::to_vec(&request)?;

    let request_id = rand_request_id();
    let query = StatsRequest::new(request_id, 5).with_payload(payload);
    let reply = stats_server::query(addr, &query, REMOTE_TIMEOUT)?;
    if reply["ok"] != true {
        return Err(anyhow!("{} refused the schedule: {}", addr, reply["error"]));
    }
    info!("Applied via {}: {}", addr, reply["applied"]);
    Ok(())
}

fn rand_request_id() -> u32 {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn run_apply(
    cli: &Cli,
    args: &ScheduleArgs,
    remote: Option<&str>,
    config: &SystemConfig,
) -> Result<()> {
    let schedule = args.build()?;
    let tc = config.sweep.monitored_traffic_class;
    info!(
        "Applying cycle {}: {} (TC{} open {:.1}%)",
        format_duration_ns(schedule.cycle_ns()),
        schedule.describe(tc),
        tc,
        schedule.open_pct_for(tc)
    );
    if let Some(addr) = remote {
        return apply_remote(addr, &schedule);
    }
    make_applier(config, cli.dry_run).apply(&schedule)?;
    let applied = AppliedSchedule::from_schedule(&schedule, tc);
    info!("Applied: {}", serde_json::to_string(&applied)?);
    Ok(())
}

fn run_capture(
    secs: f64,
    output: Option<&Path>,
    config: &SystemConfig,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let duration = capture_duration(secs)?;
    let mut capture =
        PacketCapture::new(config.capture.clone(), CaptureGate::new()).with_stop(stop);
    let timestamps = capture.capture(duration)?;
    let gap_report = GapAnalyzer::new(config.analyzer.clone()).analyze(&timestamps);
    analyzer::log_summary("capture", &gap_report);

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&gap_report)?)?;
        info!("Saved {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        s.store(true, Ordering::SeqCst);
    })?;

    match &cli.command {
        Command::Sweep(args) => run_sweep(&cli, args, config, stop)?,
        Command::Live(args) => run_live(&cli, args, config, stop)?,
        Command::Apply { schedule, remote } => {
            run_apply(&cli, schedule, remote.as_deref(), &config)?
        }
        Command::Capture { secs, output } => {
            run_capture(*secs, output.as_deref(), &config, stop)?
        }
        Command::Config => println!("{}", config.to_json()?),
    }

    info!("Exiting.");
    Ok(())
}
