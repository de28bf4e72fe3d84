use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ForwardError;
use crate::flood::{FloodGuard, FloodKey};
use crate::forwarder::Forwarder;
use crate::proto::MAX_UDP_PACKET;

/// Creates the client-facing UDP socket with enlarged kernel buffers.
pub fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Single-worker event loop: one datagram is fully answered before the next
/// one is read.
pub struct Server {
    socket: UdpSocket,
    forwarder: Forwarder,
    flood: FloodGuard,
    poll_interval: Duration,
    buf: Vec<u8>,
}

impl Server {
    pub fn new(
        socket: UdpSocket,
        forwarder: Forwarder,
        flood: FloodGuard,
        poll_interval: Duration,
    ) -> Self {
        Self {
            socket,
            forwarder,
            flood,
            poll_interval,
            buf: vec![0u8; MAX_UDP_PACKET],
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(&mut self) {
        loop {
            self.poll_once().await;
        }
    }

    /// Waits up to the poll interval for a datagram, expires old flood
    /// counters, then answers the datagram if one arrived.
    pub async fn poll_once(&mut self) {
        let received = timeout(self.poll_interval, self.socket.recv_from(&mut self.buf)).await;
        let now = Instant::now();

        let swept = self.flood.sweep(now);
        if swept > 0 {
            debug!(swept, tracked = self.flood.len(), "expired flood counters");
        }

        let (len, peer) = match received {
            Err(_) => return,
            Ok(Err(err)) => {
                warn!(error = %err, "udp recv failed");
                return;
            }
            Ok(Ok(got)) => got,
        };
        let packet = Bytes::copy_from_slice(&self.buf[..len]);
        debug!(client = %peer, len, "query received");

        match self.handle(&packet, peer, now).await {
            Ok(resp) => {
                if let Err(err) = self.socket.send_to(&resp, peer).await {
                    warn!(client = %peer, error = %err, "failed to send response");
                }
            }
            Err(err) => log_drop(&err, peer),
        }
    }

    /// Admission check followed by resolution. Any error means nothing is
    /// sent back.
    pub async fn handle(
        &mut self,
        packet: &[u8],
        peer: SocketAddr,
        now: Instant,
    ) -> Result<Bytes, ForwardError> {
        let key = FloodKey::new(packet, peer.ip());
        let client = key.client();
        if !self.flood.admit(key, now) {
            return Err(ForwardError::FloodDetected { client });
        }
        self.forwarder.answer(packet, now).await
    }
}

fn log_drop(err: &ForwardError, peer: SocketAddr) {
    match err {
        ForwardError::Malformed(_) => {
            debug!(client = %peer, kind = err.kind(), error = %err, "dropping request")
        }
        ForwardError::UpstreamTimeout { .. } => {
            info!(client = %peer, kind = err.kind(), error = %err, "dropping request")
        }
        ForwardError::FloodDetected { .. }
        | ForwardError::UpstreamIntegrity { .. }
        | ForwardError::Io(_) => {
            warn!(client = %peer, kind = err.kind(), error = %err, "dropping request")
        }
    }
}
