//! End-to-end acquisition over loopback sockets
//!
//! A sender thread plays the detector, `DataReceiver` receives, decodes and
//! delivers. Senders pace frames so the default socket buffers never drop.

use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use pixel_acquisition::acquisition::DataReceiver;
use pixel_acquisition::codec::{CompressionMethod, ImageEncoder};
use pixel_acquisition::config::{AcquisitionMode, BitDepth, CompressionSettings, ReceiverConfig};
use pixel_acquisition::constants::RECEIVE_TIMEOUT;
use pixel_acquisition::network::{Packetizer, TcpTransport, Transport, UdpTransport};

const FRAME_GAP: Duration = Duration::from_millis(5);

fn config(mode: AcquisitionMode, links: usize, chips: &[u8]) -> ReceiverConfig {
    let mut config = ReceiverConfig::default();
    config.detector.chips = chips.to_vec();
    config.network.mode = mode;
    config.network.links = vec![SocketAddr::from(([127, 0, 0, 1], 0)); links];
    config.buffers.raw_pool_size = 32;
    config.buffers.decoded_pool_size = 32;
    config.buffers.safety_margin = 4;
    config
}

fn images(count: usize, pixels: usize) -> Vec<Vec<u16>> {
    (0..count)
        .map(|n| (0..pixels).map(|i| ((i * 3 + n * 17) % 4096) as u16).collect())
        .collect()
}

fn udp_sender(to: SocketAddr) -> UdpTransport {
    let mut link = UdpTransport::new(SocketAddr::from(([127, 0, 0, 1], 0))).with_remote(to);
    link.connect().unwrap();
    link
}

/// Read 12-bit images until `count` arrived, checking each against `expected`
fn collect_short(receiver: &DataReceiver, expected: &[Vec<u16>]) -> Vec<(i64, i32)> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::new();
    while seen.len() < expected.len() && Instant::now() < deadline {
        match receiver.decoded_image_short() {
            Some((info, data)) => {
                let want = &expected[seen.len()];
                assert!(
                    data.iter().zip(want).all(|(&d, &w)| d == w as i16),
                    "image {} differs",
                    info.frame_no
                );
                seen.push((info.frame_no, info.error_code));
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    seen
}

#[test]
fn test_single_link_udp_loopback() {
    let mut receiver = DataReceiver::init(config(AcquisitionMode::SingleLinkUdp, 1, &[1])).unwrap();
    let addr = receiver.local_addrs()[0];
    assert_ne!(addr.port(), 0);
    receiver.set_requested_images(5);
    receiver.start().unwrap();

    let expected = images(5, 256 * 256);
    let frames: Vec<Vec<u8>> = {
        let mut encoder = ImageEncoder::for_chips(&[1]).unwrap();
        expected.iter().map(|img| encoder.encode(img).unwrap()).collect()
    };
    let sender = thread::spawn(move || {
        let mut link = udp_sender(addr);
        let mut packetizer = Packetizer::new(8198);
        for (n, frame) in frames.iter().enumerate() {
            for datagram in packetizer.single_link(frame, n as u32 + 1) {
                link.send_data(&datagram).unwrap();
            }
            thread::sleep(FRAME_GAP);
        }
    });

    let seen = collect_short(&receiver, &expected);
    sender.join().unwrap();
    assert_eq!(seen, vec![(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);

    receiver.stop();
    let stats = receiver.stats();
    assert_eq!(stats.raw_received, 5);
    assert_eq!(stats.decoded_received, 5);
    assert_eq!(stats.requested, 5);
}

#[test]
fn test_multi_link_udp_loopback() {
    let mut receiver = DataReceiver::init(config(AcquisitionMode::MultiLinkUdp, 2, &[1, 2])).unwrap();
    let addrs = receiver.local_addrs().to_vec();
    receiver.start().unwrap();

    let expected = images(4, 512 * 256);
    let frames: Vec<Vec<u8>> = {
        let mut encoder = ImageEncoder::for_chips(&[1, 2]).unwrap();
        expected.iter().map(|img| encoder.encode(img).unwrap()).collect()
    };
    let sender = thread::spawn(move || {
        let mut links: Vec<UdpTransport> = addrs.iter().map(|&a| udp_sender(a)).collect();
        let mut packetizer = Packetizer::new(8198);
        // detector frame numbers need not start at 1
        for (n, frame) in frames.iter().enumerate() {
            for (i, packet) in packetizer.multi_link(frame, 700 + n as u32).iter().enumerate() {
                links[i % 2].send_data(packet).unwrap();
            }
            thread::sleep(FRAME_GAP);
        }
    });

    let seen = collect_short(&receiver, &expected);
    sender.join().unwrap();
    assert_eq!(seen, vec![(700, 0), (701, 0), (702, 0), (703, 0)]);

    let stats = receiver.stats();
    assert_eq!(stats.links.len(), 2);
    assert_eq!(stats.links.iter().map(|l| l.packets).sum::<u64>(), 4 * 24);
    assert_eq!(stats.rejected(), 0);
}

#[test]
fn test_single_link_tcp_24_bit_compressed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let detector = listener.local_addr().unwrap();

    let mut config = config(AcquisitionMode::SingleLinkTcp, 1, &[3]);
    config.network.links = vec![detector];
    config.detector.bit_depth = BitDepth::TwentyFour;
    config.decoding.compression = Some(CompressionSettings {
        method: CompressionMethod::Lz4,
        level: 4,
    });
    let mut receiver = DataReceiver::init(config).unwrap();
    let (socket, _) = listener.accept().unwrap();

    let counts: Vec<Vec<u32>> = (0..3u32)
        .map(|n| (0..256 * 256u32).map(|i| (i * 251 + n * 65_537) % (1 << 24)).collect())
        .collect();
    let mut encoder = ImageEncoder::for_chips(&[3]).unwrap();
    let mut bodies = Vec::new();
    let mut packetizer = Packetizer::new(8198);
    for image in &counts {
        let (low, high) = encoder.encode_24(image).unwrap();
        bodies.push(packetizer.body(&low));
        bodies.push(packetizer.body(&high));
    }

    receiver.start().unwrap();
    let sender = thread::spawn(move || {
        let mut link = TcpTransport::from_stream(socket, RECEIVE_TIMEOUT).unwrap();
        // one write for everything: frame boundaries fall inside reads
        let stream: Vec<u8> = bodies.iter().flat_map(|b| b.iter().copied()).collect();
        link.send_data(&stream).unwrap();
        link
    });

    let codec = CompressionMethod::Lz4.codec().unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::new();
    while seen.len() < counts.len() && Instant::now() < deadline {
        let Some((info, data)) = receiver.compressed_data() else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        let mut bytes = Vec::new();
        codec.decompress(&data, &mut bytes).unwrap();
        let pixels: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let want = &counts[seen.len()];
        assert!(pixels.iter().zip(want).all(|(&p, &w)| p == w as i32));
        seen.push((info.frame_no, info.error_code));
    }
    let _link = sender.join().unwrap();
    assert_eq!(seen, vec![(1, 0), (2, 0), (3, 0)]);
    assert_eq!(receiver.received_raw_images(), 6);
}
