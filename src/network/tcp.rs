//! TCP stream transport and frame re-segmentation

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::header::FrameFlags;
use super::transport::{ReceiveStatus, Transport};
use crate::constants::{FRAME_MARKER, FRAME_TIMEOUT, RECEIVE_TIMEOUT, SOCKET_RECV_BUFFER};
use crate::error::NetworkError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cuts a byte stream into fixed-size frames
///
/// Reads rarely line up with frame boundaries. Bytes past the end of the
/// current frame are kept and start the next one, however many there are;
/// a read holding several whole frames emits all of them.
#[derive(Debug, Clone)]
pub struct StreamAssembler {
    frame: Vec<u8>,
    filled: usize,
}

impl StreamAssembler {
    /// # Panics
    /// Panics if `frame_len` is 0.
    pub fn new(frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame length must be greater than 0");
        Self {
            frame: vec![0u8; frame_len],
            filled: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame.len()
    }

    /// Bytes of the next frame already received
    pub fn pending(&self) -> usize {
        self.filled
    }

    pub fn reset(&mut self) {
        self.filled = 0;
    }

    /// Feed one read, calling `on_frame` for every frame it completes
    pub fn push<F: FnMut(&[u8])>(&mut self, mut chunk: &[u8], mut on_frame: F) -> usize {
        let frame_len = self.frame.len();
        let mut emitted = 0;

        // Finish the frame carried over from earlier reads
        if self.filled > 0 {
            let take = (frame_len - self.filled).min(chunk.len());
            self.frame[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
            self.filled += take;
            chunk = &chunk[take..];
            if self.filled < frame_len {
                return 0;
            }
            on_frame(&self.frame);
            self.filled = 0;
            emitted += 1;
        }

        // Whole frames straight from the read buffer
        while chunk.len() >= frame_len {
            on_frame(&chunk[..frame_len]);
            chunk = &chunk[frame_len..];
            emitted += 1;
        }

        // Excess bytes start the next frame
        self.frame[..chunk.len()].copy_from_slice(chunk);
        self.filled = chunk.len();
        emitted
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Stream link to the detector's data port
pub struct TcpTransport {
    remote: SocketAddr,
    stream: Option<TcpStream>,
    timeout: Duration,
    frame_timeout: Duration,
    recv_buffer: usize,
}

impl TcpTransport {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            stream: None,
            timeout: RECEIVE_TIMEOUT,
            frame_timeout: FRAME_TIMEOUT,
            recv_buffer: SOCKET_RECV_BUFFER,
        }
    }

    /// Read timeout of the socket, and the time a whole frame may take in
    /// `receive_data`
    pub fn with_timeouts(mut self, receive: Duration, frame: Duration) -> Self {
        self.timeout = receive;
        self.frame_timeout = frame;
        self
    }

    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes;
        self
    }

    /// Wrap an accepted stream, as the simulator does on its side
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self, NetworkError> {
        let remote = stream
            .peer_addr()
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .and_then(|_| stream.set_read_timeout(Some(timeout)))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            remote,
            stream: Some(stream),
            timeout,
            frame_timeout: FRAME_TIMEOUT,
            recv_buffer: SOCKET_RECV_BUFFER,
        })
    }

    fn open(&self) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(self.remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        if let Err(e) = socket.set_recv_buffer_size(self.recv_buffer) {
            warn!("Could not set receive buffer for {}: {}", self.remote, e);
        }
        socket.connect_timeout(&self.remote.into(), CONNECT_TIMEOUT)?;
        socket.set_read_timeout(Some(self.timeout))?;
        Ok(socket.into())
    }

    /// One read; `Ok(None)` on timeout, an error when the peer closed
    fn read_some(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetworkError> {
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                warn!("Detector closed the data stream {}", self.remote);
                self.stream = None;
                Err(NetworkError::ReceiveFailed("connection closed".into()))
            }
            Ok(len) => Ok(Some(len)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                self.stream = None;
                Err(NetworkError::ReceiveFailed(e.to_string()))
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), NetworkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self
            .open()
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", self.remote, e)))?;
        info!("TCP link connected to {}", self.remote);
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("TCP link {} closed", self.remote);
        }
    }

    fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    fn send_data(&mut self, data: &[u8]) -> Result<usize, NetworkError> {
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
        stream
            .write_all(data)
            .map(|_| data.len())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn receive_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetworkError> {
        self.read_some(buf)
    }

    fn receive_data(&mut self, buf: &mut [u8]) -> Result<ReceiveStatus, NetworkError> {
        let mut filled = match self.read_some(buf)? {
            None => return Ok(ReceiveStatus::NoData),
            Some(len) => len,
        };
        let deadline = Instant::now() + self.frame_timeout;
        let mut flags = FrameFlags::empty();
        while filled < buf.len() {
            match self.read_some(&mut buf[filled..]) {
                Ok(Some(len)) => filled += len,
                Ok(None) if Instant::now() >= deadline => {
                    debug!("Frame incomplete after {:?}: {} of {} bytes", self.frame_timeout, filled, buf.len());
                    flags |= FrameFlags::SHORT;
                    buf[filled..].fill(0);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Frame cut short after {} bytes: {}", filled, e);
                    flags |= FrameFlags::SHORT;
                    buf[filled..].fill(0);
                    break;
                }
            }
        }
        if buf.first() != Some(&FRAME_MARKER) {
            flags |= FrameFlags::BAD_MARKER;
        }
        Ok(ReceiveStatus::Complete { flags, bytes: filled })
    }

    fn receive_range(&mut self, buf: &mut [u8], min: usize) -> Result<usize, NetworkError> {
        let mut total = 0;
        while total < min.max(1) && total < buf.len() {
            match self.read_some(&mut buf[total..])? {
                Some(len) => total += len,
                None => break,
            }
        }
        Ok(total)
    }

    fn clear_data_in_socket(&mut self) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        if stream.set_nonblocking(true).is_err() {
            return 0;
        }
        let mut scratch = [0u8; 16 * 1024];
        let mut dropped = 0;
        while let Ok(len) = stream.read(&mut scratch) {
            if len == 0 {
                break;
            }
            dropped += len;
        }
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("Could not restore blocking mode on {}: {}", self.remote, e);
        }
        if dropped > 0 {
            debug!("Discarded {} stale bytes from {}", dropped, self.remote);
        }
        dropped
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.remote)
    }
}
