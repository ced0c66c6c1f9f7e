//! UDP stats query server.
//!
//! Lets dashboards and scripts on other hosts read the published snapshots
//! without touching the capture port, and, when a [`ControlPlane`] is
//! attached, change the schedule or start a sweep.
//!
//! # Protocol
//!
//! **Port:** 31902 (UDP, configurable)
//!
//! **Request Packet:** 9 bytes plus optional payload
//! - `[0-3]` Magic: "TASQ" (0x54415351)
//! - `[4-7]` Request ID (u32 BE, for matching responses)
//! - `[8]`   Kind: 0=live raw, 1=live smoothed, 2=sweep status, 3=applied schedule,
//!   4=apply open/close, 5=apply entry list, 6=start sweep
//! - `[9..]` UTF-8 JSON payload for kinds 4-6:
//!   `{"cycle_us", "open_us"}`, `{"cycle_us", "entries": [{"gate", "duration_us"}]}`,
//!   `{"preset"}`
//!
//! **Response Packet:** variable
//! - `[0-3]` Magic: "TASR" (0x54415352)
//! - `[4-7]` Request ID (echo back)
//! - `[8..]` UTF-8 JSON body

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::control::ControlPlane;
use crate::live::LiveView;
use crate::schedule::AppliedSchedule;
use crate::state::SnapshotCell;
use crate::sweep::{SweepPhase, SweepProgress, StepStatus};

pub const STATS_SERVER_PORT: u16 = 31902;

/// Request magic bytes: "TASQ"
const REQUEST_MAGIC: u32 = 0x54415351;

/// Response magic bytes: "TASR"
const RESPONSE_MAGIC: u32 = 0x54415352;

const REQUEST_SIZE: usize = 9;
const HEADER_SIZE: usize = 8;
const MAX_REQUEST: usize = 8192;

/// Largest JSON body that fits one IPv4 UDP datagram with the header.
const MAX_BODY: usize = 65507 - HEADER_SIZE;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    LiveRaw,
    LiveSmoothed,
    SweepStatus,
    AppliedSchedule,
    ApplyGate,
    ApplyEntries,
    StartSweep,
}

impl QueryKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QueryKind::LiveRaw),
            1 => Some(QueryKind::LiveSmoothed),
            2 => Some(QueryKind::SweepStatus),
            3 => Some(QueryKind::AppliedSchedule),
            4 => Some(QueryKind::ApplyGate),
            5 => Some(QueryKind::ApplyEntries),
            6 => Some(QueryKind::StartSweep),
            _ => None,
        }
    }
}

/// Parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRequest {
    pub request_id: u32,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl StatsRequest {
    pub fn new(request_id: u32, kind: u8) -> Self {
        StatsRequest { request_id, kind, payload: Vec::new() }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < REQUEST_SIZE || BigEndian::read_u32(&buf[0..4]) != REQUEST_MAGIC {
            return None;
        }
        Some(StatsRequest {
            request_id: BigEndian::read_u32(&buf[4..8]),
            kind: buf[8],
            payload: buf[REQUEST_SIZE..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_SIZE + self.payload.len());
        // Writes into a Vec cannot fail
        let _ = buf.write_u32::<BigEndian>(REQUEST_MAGIC);
        let _ = buf.write_u32::<BigEndian>(self.request_id);
        let _ = buf.write_u8(self.kind);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Compact sweep state; full per-step reports live in the report file.
#[derive(Debug, Serialize)]
struct SweepStatusView<'a> {
    running: bool,
    phase: SweepPhase,
    step: usize,
    total: usize,
    label: &'a str,
    message: &'a str,
    completed: Vec<StepLine<'a>>,
}

#[derive(Debug, Serialize)]
struct StepLine<'a> {
    label: &'a str,
    status: StepStatus,
    completeness: f64,
    gap_stdev_us: f64,
    loss_pattern: &'static str,
}

impl<'a> SweepStatusView<'a> {
    fn new(p: &'a SweepProgress) -> Self {
        SweepStatusView {
            running: p.running,
            phase: p.phase,
            step: p.step,
            total: p.total,
            label: &p.label,
            message: &p.message,
            completed: p
                .results
                .iter()
                .map(|r| StepLine {
                    label: &r.label,
                    status: r.status,
                    completeness: r.report.completeness,
                    gap_stdev_us: r.report.gap_stdev_us,
                    loss_pattern: r.report.loss_pattern.as_str(),
                })
                .collect(),
        }
    }
}

/// Everything the server can report on.
#[derive(Clone)]
pub struct StatsSources {
    pub live: Arc<LiveView>,
    pub sweep: Arc<SnapshotCell<SweepProgress>>,
    pub applied: Arc<SnapshotCell<AppliedSchedule>>,
    pub control: Option<Arc<ControlPlane>>,
}

impl Default for StatsSources {
    fn default() -> Self {
        StatsSources {
            live: Arc::new(LiveView::default()),
            sweep: Arc::new(SnapshotCell::default()),
            applied: Arc::new(SnapshotCell::default()),
            control: None,
        }
    }
}

impl StatsSources {
    fn body(&self, kind: u8, payload: &[u8]) -> Vec<u8> {
        let encoded = match QueryKind::from_u8(kind) {
            Some(
                control_kind @ (QueryKind::ApplyGate
                | QueryKind::ApplyEntries
                | QueryKind::StartSweep),
            ) => match &self.control {
                Some(control) => serde_json::to_vec(&control.handle(control_kind, payload)),
                None => serde_json::to_vec(&json!({
                    "ok": false,
                    "error": "control requests are disabled",
                })),
            },
            Some(QueryKind::LiveRaw) => serde_json::to_vec(&*self.live.raw.snapshot()),
            Some(QueryKind::LiveSmoothed) => serde_json::to_vec(&*self.live.smoothed.snapshot()),
            Some(QueryKind::SweepStatus) => {
                let progress = self.sweep.snapshot();
                serde_json::to_vec(&SweepStatusView::new(&progress))
            }
            Some(QueryKind::AppliedSchedule) => serde_json::to_vec(&*self.applied.snapshot()),
            None => serde_json::to_vec(&json!({ "error": format!("unknown query kind {}", kind) })),
        };
        match encoded {
            Ok(body) if body.len() <= MAX_BODY => body,
            Ok(body) => json!({ "error": format!("response too large ({} bytes)", body.len()) })
                .to_string()
                .into_bytes(),
            Err(e) => json!({ "error": e.to_string() }).to_string().into_bytes(),
        }
    }
}

/// Build a response datagram.
pub fn build_response(request_id: u32, body: &[u8]) -> Vec<u8> {
    let mut resp = Vec::with_capacity(HEADER_SIZE + body.len());
    let _ = resp.write_u32::<BigEndian>(RESPONSE_MAGIC);
    let _ = resp.write_u32::<BigEndian>(request_id);
    resp.extend_from_slice(body);
    resp
}

pub struct StatsServer {
    socket: UdpSocket,
}

impl StatsServer {
    /// Bind on all interfaces. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let port = socket.local_addr()?.port();
        info!("[StatsServer] Listening on UDP port {} for stats queries", port);

        Ok(StatsServer { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer queued requests. Returns after the first empty poll.
    pub fn handle_requests(&self, sources: &StatsSources) -> usize {
        let mut buf = vec![0u8; MAX_REQUEST];
        let mut answered = 0;

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((size, src)) => {
                    let Some(request) = StatsRequest::parse(&buf[..size]) else {
                        debug!(
                            "[StatsServer] Ignoring {} byte packet without request magic from {}",
                            size, src
                        );
                        continue;
                    };

                    let body = sources.body(request.kind, &request.payload);
                    let response = build_response(request.request_id, &body);
                    if let Err(e) = self.socket.send_to(&response, src) {
                        debug!("[StatsServer] Failed to send response to {}: {}", src, e);
                    } else {
                        debug!("[StatsServer] Answered kind {} for {}", request.kind, src);
                        answered += 1;
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => {
                    error!("[StatsServer] Socket error: {}", e);
                    break;
                }
            }
        }
        answered
    }

    /// Serve until `stop` is raised.
    pub fn run(&self, sources: &StatsSources, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            self.handle_requests(sources);
        }
        debug!("[StatsServer] Stopped");
    }
}

/// Send one request and wait for the matching response body.
pub fn query<A: ToSocketAddrs>(
    server: A,
    request: &StatsRequest,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(timeout))?;
    socket.send_to(&request.encode(), server)?;

    let mut buf = vec![0u8; 65536];
    loop {
        let size = socket
            .recv(&mut buf)
            .map_err(|e| anyhow!("No response from stats server: {}", e))?;
        if size < HEADER_SIZE || BigEndian::read_u32(&buf[0..4]) != RESPONSE_MAGIC {
            debug!("[StatsServer] Ignoring {} byte reply without response magic", size);
            continue;
        }
        if BigEndian::read_u32(&buf[4..8]) != request.request_id {
            continue;
        }
        return Ok(serde_json::from_slice(&buf[HEADER_SIZE..size])?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveStats;

    #[test]
    fn test_magic_bytes() {
        assert_eq!(&REQUEST_MAGIC.to_be_bytes(), b"TASQ");
        assert_eq!(&RESPONSE_MAGIC.to_be_bytes(), b"TASR");
    }

    #[test]
    fn test_request_parse() {
        let req = StatsRequest::new(0x12345678, 2);
        let bytes = req.encode();
        assert_eq!(bytes.len(), REQUEST_SIZE);
        assert_eq!(StatsRequest::parse(&bytes), Some(req));

        let with_body = StatsRequest::new(7, 4).with_payload(br#"{"cycle_us":1000}"#.to_vec());
        let parsed = StatsRequest::parse(&with_body.encode()).unwrap();
        assert_eq!(parsed.payload, br#"{"cycle_us":1000}"#);

        assert_eq!(StatsRequest::parse(&bytes[..8]), None);
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert_eq!(StatsRequest::parse(&bad), None);
    }

    #[test]
    fn test_response_format() {
        let resp = build_response(42, b"{}");
        assert_eq!(&resp[0..4], b"TASR");
        assert_eq!(BigEndian::read_u32(&resp[4..8]), 42);
        assert_eq!(&resp[8..], b"{}");
    }

    #[test]
    fn test_body_per_kind() {
        let sources = StatsSources::default();
        let window = LiveStats { window: 7, gap_stdev_us: 12.5, ..LiveStats::default() };
        sources.live.raw.publish(window);

        let raw: serde_json::Value = serde_json::from_slice(&sources.body(0, &[])).unwrap();
        assert_eq!(raw["window"], 7);
        assert_eq!(raw["gap_stdev_us"], 12.5);

        let sweep: serde_json::Value = serde_json::from_slice(&sources.body(2, &[])).unwrap();
        assert_eq!(sweep["phase"], "idle");
        assert_eq!(sweep["running"], false);

        let applied: serde_json::Value = serde_json::from_slice(&sources.body(3, &[])).unwrap();
        assert_eq!(applied["open_pct"], 100.0);
        assert_eq!(applied["cycle_us"], 1000.0);
        assert_eq!(applied["mode"], "single");

        let unknown: serde_json::Value = serde_json::from_slice(&sources.body(9, &[])).unwrap();
        assert!(unknown["error"].as_str().unwrap().contains("9"));

        // Read-only server refuses control requests
        let refused: serde_json::Value = serde_json::from_slice(&sources.body(4, b"{}")).unwrap();
        assert_eq!(refused["ok"], false);
        assert!(refused["error"].as_str().unwrap().contains("disabled"));
    }

    #[test]
    fn test_query_roundtrip_over_udp() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = StatsServer::bind(0).unwrap();
        let port = server.local_addr().unwrap().port();
        let sources = StatsSources::default();
        let smoothed = LiveStats { window: 3, completeness: 98.0, ..LiveStats::default() };
        sources.live.smoothed.publish(smoothed);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(b"junk", ("127.0.0.1", port)).unwrap();
        client
            .send_to(&StatsRequest::new(99, 1).encode(), ("127.0.0.1", port))
            .unwrap();

        // Give both datagrams time to queue before one poll pass
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.handle_requests(&sources), 1);

        let mut buf = [0u8; 4096];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[0..4], b"TASR");
        assert_eq!(BigEndian::read_u32(&buf[4..8]), 99);
        let body: serde_json::Value = serde_json::from_slice(&buf[8..n]).unwrap();
        assert_eq!(body["window"], 3);
        assert_eq!(body["completeness"], 98.0);
    }

    #[test]
    fn test_stats_server_port_constant() {
        assert_eq!(STATS_SERVER_PORT, 31902);
    }

    #[test]
    fn test_control_request_updates_applied_mirror() {
        use crate::applier::DryRunApplier;
        use crate::capture::{CaptureGate, PacketCapture};
        use crate::config::SystemConfig;
        use crate::control::{CapturerFactory, SharedApplier};
        use crate::traits::Capturer;

        let _ = env_logger::builder().is_test(true).try_init();
        let config = SystemConfig::default();
        let capture_config = config.capture.clone();
        let factory: CapturerFactory = Box::new(move || {
            let capture = PacketCapture::new(capture_config.clone(), CaptureGate::new());
            Box::new(capture) as Box<dyn Capturer + Send>
        });
        let mut sources = StatsSources::default();
        let control = ControlPlane::new(
            config,
            SharedApplier::new(Box::new(DryRunApplier::new("1"))),
            factory,
            Arc::new(AtomicBool::new(false)),
        )
        .with_applied(sources.applied.clone())
        .with_progress(sources.sweep.clone());
        sources.control = Some(Arc::new(control));

        let server = StatsServer::bind(0).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let sources = sources.clone();
            let stop = stop.clone();
            std::thread::spawn(move || server.run(&sources, &stop))
        };

        let payload = json!({
            "cycle_us": 5000,
            "entries": [{"gate": 255, "duration_us": 1000}, {"gate": 254, "duration_us": 4000}],
        });
        let request = StatsRequest::new(5, 5).with_payload(payload.to_string().into_bytes());
        let reply = query(("127.0.0.1", port), &request, Duration::from_secs(2)).unwrap();
        assert_eq!(reply["ok"], true, "{}", reply);

        let state =
            query(("127.0.0.1", port), &StatsRequest::new(6, 3), Duration::from_secs(2)).unwrap();
        assert_eq!(state["cycle_us"], 5000.0);
        assert_eq!(state["open_us"], 1000.0);
        assert_eq!(state["enabled"], true);

        let bad = StatsRequest::new(7, 4).with_payload(br#"{"cycle_us": 0}"#.to_vec());
        let reply = query(("127.0.0.1", port), &bad, Duration::from_secs(2)).unwrap();
        assert_eq!(reply["ok"], false);

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
