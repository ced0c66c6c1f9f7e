use anyhow::{anyhow, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use crate::config::CaptureConfig;
use crate::traits::PacketSource;

/// Largest UDP payload; the exact-size filter runs after the receive.
const MAX_DATAGRAM: usize = 65535;

pub fn create_capture_socket(config: &CaptureConfig, recv_timeout: Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Off by default: with it a second capture binds the same unicast port and
    // the kernel hands each datagram to only one of them.
    if config.reuse_address {
        socket.set_reuse_address(true)?;
    }

    // Burst releases after a closed gate arrive at line rate; a small buffer
    // drops them in the kernel and looks exactly like gating loss.
    let requested = config.recv_buffer_bytes;
    socket.set_recv_buffer_size(requested)?;
    let actual = socket.recv_buffer_size()?;
    if actual < requested {
        warn!(
            "[Capture] Receive buffer is {} bytes (requested {}). \
             Raise net.core.rmem_max to avoid kernel drops.",
            actual, requested
        );
    } else {
        debug!("[Capture] Receive buffer {} bytes", actual);
    }

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket
        .bind(&addr.into())
        .map_err(|e| anyhow!("Failed to bind capture socket to {}: {}", addr, e))?;

    socket.set_read_timeout(Some(recv_timeout))?;

    Ok(socket.into())
}

/// Blocking UDP receive surface with a read timeout. Dropping it closes the socket.
pub struct UdpPacketSource {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpPacketSource {
    pub fn bind(config: &CaptureConfig, recv_timeout: Duration) -> Result<Self> {
        let socket = create_capture_socket(config, recv_timeout)?;
        Ok(UdpPacketSource { socket, buf: vec![0u8; MAX_DATAGRAM] })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSource for UdpPacketSource {
    fn recv_packet(&mut self) -> Result<Option<(usize, Instant)>> {
        match self.socket.recv(&mut self.buf) {
            Ok(size) => Ok(Some((size, Instant::now()))),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
