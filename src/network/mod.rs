//! Network subsystem: detector links, wire format and receiver tasks

pub mod header;
pub mod receiver;
pub mod sender;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use header::{FrameCounter, FrameFlags, PacketHeader};
pub use receiver::{
    LinkCounters, LinkStats, MultiLinkReceiver, PacketMonitor, SingleLinkTcpReceiver, SingleLinkUdpReceiver,
};
pub use sender::Packetizer;
pub use tcp::{StreamAssembler, TcpTransport};
pub use transport::{ReceiveStatus, Transport};
pub use udp::{assemble_frame, create_socket, UdpTransport};
