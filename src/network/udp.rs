//! UDP datagram transport

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::header::FrameFlags;
use super::transport::{ReceiveStatus, Transport};
use crate::constants::{FRAME_MARKER, FRAME_TIMEOUT, HEADER_SIZE, RECEIVE_TIMEOUT, SOCKET_RECV_BUFFER};
use crate::error::NetworkError;

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65_536;

/// Create a bound UDP socket with a large receive buffer
pub fn create_socket(addr: SocketAddr, recv_buffer: usize, timeout: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // The kernel may clamp this; a small buffer only costs drops under load
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        warn!("Could not set receive buffer of {} to {} bytes: {}", addr, recv_buffer, e);
    }

    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket.into())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Assemble one single-link frame body from consecutive datagrams
///
/// The first datagram is the start of the body; every following datagram
/// carries a header that is dropped. `recv` returns `None` when its receive
/// timeout expires. Bytes that did not arrive within `frame_timeout` are
/// zeroed and the frame is flagged `SHORT`.
pub fn assemble_frame<F>(
    mut recv: F,
    frame: &mut [u8],
    scratch: &mut [u8],
    frame_timeout: Duration,
) -> Result<ReceiveStatus, NetworkError>
where
    F: FnMut(&mut [u8]) -> Result<Option<usize>, NetworkError>,
{
    let Some(first) = recv(scratch)? else {
        return Ok(ReceiveStatus::NoData);
    };

    let mut flags = FrameFlags::empty();
    let mut filled = first.min(frame.len());
    frame[..filled].copy_from_slice(&scratch[..filled]);
    if first > frame.len() {
        flags |= FrameFlags::OVERRUN;
    }

    let deadline = Instant::now() + frame_timeout;
    while filled < frame.len() {
        match recv(scratch)? {
            Some(len) if len > HEADER_SIZE => {
                let payload = &scratch[HEADER_SIZE..len];
                let remaining = frame.len() - filled;
                let take = payload.len().min(remaining);
                if payload.len() > remaining {
                    flags |= FrameFlags::OVERRUN;
                }
                frame[filled..filled + take].copy_from_slice(&payload[..take]);
                filled += take;
            }
            Some(_) => {}
            None if Instant::now() >= deadline => break,
            None => {}
        }
    }

    if filled < frame.len() {
        flags |= FrameFlags::SHORT;
        frame[filled..].fill(0);
    }
    if frame.first() != Some(&FRAME_MARKER) {
        flags |= FrameFlags::BAD_MARKER;
    }

    Ok(ReceiveStatus::Complete { flags, bytes: filled })
}

/// Datagram link bound to a local address
pub struct UdpTransport {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    recv_buffer: usize,
    timeout: Duration,
    frame_timeout: Duration,
    scratch: Vec<u8>,
    last_peer: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            remote: None,
            socket: None,
            recv_buffer: SOCKET_RECV_BUFFER,
            timeout: RECEIVE_TIMEOUT,
            frame_timeout: FRAME_TIMEOUT,
            scratch: vec![0u8; MAX_DATAGRAM],
            last_peer: None,
        }
    }

    /// Destination for `send_data`; without it replies go to the last sender
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_timeouts(mut self, receive: Duration, frame: Duration) -> Self {
        self.timeout = receive;
        self.frame_timeout = frame;
        self
    }

    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes;
        self
    }

    fn socket(&self) -> Result<&UdpSocket, NetworkError> {
        self.socket.as_ref().ok_or(NetworkError::NotConnected)
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<(), NetworkError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = create_socket(self.local, self.recv_buffer, self.timeout)
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", self.local, e)))?;
        info!("UDP link bound to {}", socket.local_addr().unwrap_or(self.local));
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP link {} closed", self.local);
        }
    }

    fn is_live(&self) -> bool {
        self.socket.is_some()
    }

    fn send_data(&mut self, data: &[u8]) -> Result<usize, NetworkError> {
        let target = self.remote.or(self.last_peer).ok_or(NetworkError::NotConnected)?;
        self.socket()?
            .send_to(data, target)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", target, e)))
    }

    fn receive_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetworkError> {
        match self.socket()?.recv_from(buf) {
            Ok((len, peer)) => {
                self.last_peer = Some(peer);
                Ok(Some(len))
            }
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    fn receive_data(&mut self, buf: &mut [u8]) -> Result<ReceiveStatus, NetworkError> {
        let socket = self.socket.as_ref().ok_or(NetworkError::NotConnected)?;
        let recv = |out: &mut [u8]| match socket.recv(out) {
            Ok(len) => Ok(Some(len)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        };
        assemble_frame(recv, buf, &mut self.scratch, self.frame_timeout)
    }

    fn receive_range(&mut self, buf: &mut [u8], min: usize) -> Result<usize, NetworkError> {
        let mut total = 0;
        while total < min.max(1) && total < buf.len() {
            match self.receive_packet(&mut buf[total..])? {
                Some(len) => total += len,
                None => break,
            }
        }
        Ok(total)
    }

    fn clear_data_in_socket(&mut self) -> usize {
        let Some(socket) = self.socket.as_ref() else {
            return 0;
        };
        if socket.set_nonblocking(true).is_err() {
            return 0;
        }
        let mut dropped = 0;
        while let Ok(len) = socket.recv(&mut self.scratch) {
            dropped += len;
        }
        if let Err(e) = socket.set_nonblocking(false) {
            warn!("Could not restore blocking mode on {}: {}", self.local, e);
        }
        if dropped > 0 {
            debug!("Discarded {} stale bytes on {}", dropped, self.local);
        }
        dropped
    }

    /// Address actually bound, once connected
    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.local_addr().unwrap_or(self.local))
    }
}
