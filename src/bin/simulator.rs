//! Detector simulator
//!
//! Streams synthetic images in the detector's wire format to a receiver
//! running with the same configuration file.
//!
//! ```text
//! simulator [CONFIG.toml] [IMAGES] [FPS]
//! ```
//!
//! UDP modes send to the configured link addresses (an unspecified address
//! means localhost). In TCP mode the simulator plays the detector side and
//! listens on the configured address until the receiver connects.

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixel_acquisition::{
    codec::ImageEncoder,
    config::{AcquisitionMode, BitDepth, ReceiverConfig},
    constants::{COUNTER_BITS, FRAME_COUNTER_BITS, RECEIVE_TIMEOUT},
    network::{Packetizer, TcpTransport, Transport, UdpTransport},
};

/// 24-bit frame counter of the wire header
const FRAME_COUNTER_MASK: u32 = (1 << FRAME_COUNTER_BITS) - 1;

/// Raw frames of one synthetic image: a diagonal ramp shifted per image
fn raw_frames(encoder: &mut ImageEncoder, bit_depth: BitDepth, index: u64) -> Result<Vec<Vec<u8>>> {
    let geometry = encoder.geometry().clone();
    let width = geometry.width() as u64;
    let pixels = geometry.pixel_count() as u64;
    let frames = match bit_depth {
        BitDepth::Twelve => {
            let max = (1u64 << COUNTER_BITS) - 1;
            let image: Vec<u16> = (0..pixels)
                .map(|i| ((i % width + i / width + index) % max) as u16)
                .collect();
            vec![encoder.encode(&image)?]
        }
        BitDepth::TwentyFour => {
            let max = (1u64 << (2 * COUNTER_BITS)) - 1;
            let image: Vec<u32> = (0..pixels)
                .map(|i| ((i * 97 + index * 4099) % max) as u32)
                .collect();
            let (low, high) = encoder.encode_24(&image)?;
            vec![low, high]
        }
    };
    Ok(frames)
}

fn target(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

fn udp_link(remote: SocketAddr) -> Result<UdpTransport> {
    let mut link = UdpTransport::new(SocketAddr::from(([0, 0, 0, 0], 0))).with_remote(target(remote));
    link.connect()?;
    Ok(link)
}

/// Time between images for a rate, none for 0
fn pacing(fps: f64) -> Option<Duration> {
    (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps))
}

struct Stream {
    encoder: ImageEncoder,
    packetizer: Packetizer,
    bit_depth: BitDepth,
    images: u64,
    interval: Option<Duration>,
}

impl Stream {
    /// Call `send` for every raw frame with its 24-bit frame number
    fn run(&mut self, mut send: impl FnMut(&mut Packetizer, &[u8], u32) -> Result<()>) -> Result<u64> {
        let mut frame_no: u32 = 1;
        let mut sent = 0;
        let mut next = Instant::now();
        for index in 0..self.images {
            for raw in raw_frames(&mut self.encoder, self.bit_depth, index)? {
                send(&mut self.packetizer, &raw, frame_no)?;
                frame_no = (frame_no + 1) & FRAME_COUNTER_MASK;
                sent += 1;
            }
            if let Some(interval) = self.interval {
                next += interval;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            if (index + 1) % 100 == 0 {
                tracing::info!("{} images sent", index + 1);
            }
        }
        Ok(sent)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let path = PathBuf::from(path);
            ReceiverConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
        }
        None => ReceiverConfig::default(),
    };
    let images: u64 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("image count '{}'", n))?,
        None => 100,
    };
    let fps: f64 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("frame rate '{}'", n))?,
        None => 50.0,
    };

    let net = &config.network;
    tracing::info!(
        "Simulating {:?} with chips {:?}, {} bit, {} images at {} fps",
        net.mode,
        config.detector.chips,
        config.detector.bit_depth.bits(),
        images,
        fps
    );

    let mut stream = Stream {
        encoder: ImageEncoder::for_chips(&config.detector.chips)?,
        packetizer: Packetizer::new(net.packet_size),
        bit_depth: config.detector.bit_depth,
        images,
        interval: pacing(fps),
    };

    let started = Instant::now();
    let sent = match net.mode {
        AcquisitionMode::MultiLinkUdp => {
            let mut links = net.links.iter().map(|&a| udp_link(a)).collect::<Result<Vec<_>>>()?;
            stream.run(|packetizer, raw, frame_no| {
                let count = links.len();
                for (i, packet) in packetizer.multi_link(raw, frame_no).iter().enumerate() {
                    links[i % count].send_data(packet)?;
                }
                Ok(())
            })?
        }
        AcquisitionMode::SingleLinkUdp => {
            let Some(&addr) = net.links.first() else {
                bail!("no link configured");
            };
            let mut link = udp_link(addr)?;
            stream.run(|packetizer, raw, frame_no| {
                for datagram in packetizer.single_link(raw, frame_no) {
                    link.send_data(&datagram)?;
                }
                Ok(())
            })?
        }
        AcquisitionMode::SingleLinkTcp => {
            let Some(&addr) = net.links.first() else {
                bail!("no link configured");
            };
            let listener = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
            tracing::info!("Waiting for the receiver on {}", addr);
            let (socket, peer) = listener.accept()?;
            tracing::info!("Receiver connected from {}", peer);
            let mut link = TcpTransport::from_stream(socket, RECEIVE_TIMEOUT)?;
            stream.run(|packetizer, raw, _| {
                link.send_data(&packetizer.body(raw))?;
                Ok(())
            })?
        }
    };

    tracing::info!(
        "Sent {} raw frames in {:.2}s",
        sent,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
