//! Time-bounded packet timestamp capture.
//!
//! A capture window binds the receive port, records the host arrival instant
//! of every datagram whose length matches the expected packet size, and closes
//! the port again when the wall-clock deadline passes. Only one window may own
//! the port at a time; [`CaptureGate`] is that mutual-exclusion point, shared
//! by sweep steps and the continuous live loop.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::CaptureConfig;
use crate::net::UdpPacketSource;
use crate::traits::{Capturer, PacketSource};

const MIN_RECV_TIMEOUT: Duration = Duration::from_millis(1);

/// Longest single capture window.
pub const MAX_CAPTURE_SECS: f64 = 24.0 * 3600.0;

/// Convert a capture length in seconds, rejecting values no window can use.
pub fn capture_duration(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_CAPTURE_SECS {
        return Err(anyhow!(
            "capture duration must be in (0, {}] seconds, got {}",
            MAX_CAPTURE_SECS, secs
        ));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Exclusive ownership token for the capture port.
#[derive(Clone, Default)]
pub struct CaptureGate {
    inner: Arc<Mutex<()>>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other window holds the port.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        // A panicked holder released the socket when it unwound
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Per-receive timeout used while capturing for `capture`.
///
/// Always strictly shorter than the capture itself so the loop gets to check
/// the deadline and the stop flag while the port is silent.
pub fn effective_recv_timeout(configured: Duration, capture: Duration) -> Duration {
    let ceiling = capture / 4;
    configured.min(ceiling).max(MIN_RECV_TIMEOUT)
}

/// Collect arrival instants from `source` until `duration` has elapsed.
///
/// Datagrams of any other length than `expected_size` are ignored. Returns
/// early with what was collected when `stop` is raised.
pub fn capture_from<P: PacketSource + ?Sized>(
    source: &mut P,
    duration: Duration,
    expected_size: usize,
    stop: Option<&AtomicBool>,
) -> Vec<Instant> {
    let start = Instant::now();
    let deadline = match start.checked_add(duration) {
        Some(deadline) => deadline,
        None => {
            warn!(
                "[Capture] Duration {:?} is out of range, capturing for {}s",
                duration, MAX_CAPTURE_SECS
            );
            start + Duration::from_secs_f64(MAX_CAPTURE_SECS)
        }
    };
    let mut timestamps = Vec::new();
    let mut discarded: u64 = 0;

    while Instant::now() < deadline {
        if stop.map_or(false, |s| s.load(Ordering::SeqCst)) {
            debug!("[Capture] Stop requested after {} packets", timestamps.len());
            break;
        }

        match source.recv_packet() {
            Ok(Some((size, rx_time))) => {
                if size == expected_size {
                    timestamps.push(rx_time);
                } else {
                    discarded += 1;
                }
            }
            Ok(None) => {
                // Receive timeout, re-check deadline
            }
            Err(e) => {
                warn!("[Capture] Receive error: {}", e);
                let remaining = deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(remaining.min(Duration::from_millis(10)));
            }
        }
    }

    if discarded > 0 {
        debug!("[Capture] Discarded {} datagrams with unexpected size", discarded);
    }
    timestamps
}

/// UDP capture on the configured port, serialized through a [`CaptureGate`].
pub struct PacketCapture {
    config: CaptureConfig,
    gate: CaptureGate,
    stop: Option<Arc<AtomicBool>>,
}

impl PacketCapture {
    pub fn new(config: CaptureConfig, gate: CaptureGate) -> Self {
        PacketCapture { config, gate, stop: None }
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }
}

impl Capturer for PacketCapture {
    fn capture(&mut self, duration: Duration) -> Result<Vec<Instant>> {
        capture_duration(duration.as_secs_f64())?;
        let _owner = self.gate.acquire();

        let configured = Duration::from_millis(self.config.recv_timeout_ms);
        let recv_timeout = effective_recv_timeout(configured, duration);
        let mut source = UdpPacketSource::bind(&self.config, recv_timeout)?;
        debug!(
            "[Capture] UDP {} bound for {:.1}s (recv timeout {:?})",
            self.config.port,
            duration.as_secs_f64(),
            recv_timeout
        );

        let started = Instant::now();
        let stop = self.stop.as_deref();
        let timestamps = capture_from(&mut source, duration, self.config.packet_size, stop);
        drop(source);

        info!(
            "[Capture] Captured {} packets in {:.1}s",
            timestamps.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(timestamps)
    }
}
