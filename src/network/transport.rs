//! Transport abstraction consumed by the receiver tasks

use std::net::SocketAddr;

use super::header::FrameFlags;
use crate::error::NetworkError;

/// Outcome of a whole-frame receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// Nothing arrived within the receive timeout
    NoData,
    /// A frame was assembled, possibly with problems
    Complete { flags: FrameFlags, bytes: usize },
}

/// Bidirectional packet or stream link to the detector
///
/// Receive calls block for at most the transport's receive timeout. A
/// timeout is not an error: it shows up as `None`, `NoData` or 0 bytes.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), NetworkError>;

    fn disconnect(&mut self);

    fn is_live(&self) -> bool;

    /// Send `data`, returning the bytes sent
    fn send_data(&mut self, data: &[u8]) -> Result<usize, NetworkError>;

    /// Receive one datagram (or whatever a stream read returns)
    fn receive_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetworkError>;

    /// Receive one frame body filling `buf`
    ///
    /// The first body byte is checked against the frame marker.
    fn receive_data(&mut self, buf: &mut [u8]) -> Result<ReceiveStatus, NetworkError>;

    /// Receive at least `min` and at most `buf.len()` bytes
    ///
    /// Returns fewer than `min` bytes only when the link went quiet.
    fn receive_range(&mut self, buf: &mut [u8], min: usize) -> Result<usize, NetworkError>;

    /// Discard everything queued in the socket, returning the bytes dropped
    fn clear_data_in_socket(&mut self) -> usize;

    /// Local address of the open socket
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}
