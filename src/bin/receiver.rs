//! Acquisition runner
//!
//! Loads a receiver configuration, acquires images and logs throughput.
//!
//! ```text
//! receiver [CONFIG.toml] [IMAGES]
//! ```
//!
//! Without a path the per-user configuration file is used if present,
//! built-in defaults otherwise. `IMAGES` of 0 (the default) runs until the
//! process is killed.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixel_acquisition::{
    acquisition::DataReceiver,
    config::{BitDepth, ReceiverConfig},
    pool::FrameInfo,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const POLL_SLEEP: Duration = Duration::from_micros(500);

fn load_config(path: Option<PathBuf>) -> Result<ReceiverConfig> {
    let path = path.or_else(|| ReceiverConfig::default_path().filter(|p| p.exists()));
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            ReceiverConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            tracing::info!("No configuration file, using defaults");
            Ok(ReceiverConfig::default())
        }
    }
}

/// Running totals over delivered images
#[derive(Default)]
struct Tally {
    images: u64,
    damaged: u64,
    last_frame: Option<i64>,
    bytes: u64,
}

impl Tally {
    fn add(&mut self, info: &FrameInfo, bytes: usize) {
        self.images += 1;
        if info.error_code != 0 {
            self.damaged += 1;
        }
        if let Some(last) = self.last_frame {
            if info.frame_no != last + 1 {
                tracing::warn!("Frame {} follows {}", info.frame_no, last);
            }
        }
        self.last_frame = Some(info.frame_no);
        self.bytes += bytes as u64;
    }
}

/// Read every image currently queued
fn drain(receiver: &DataReceiver, tally: &mut Tally) {
    loop {
        let delivered = if receiver.config().decoding.compression.is_some() {
            receiver.compressed_data().map(|(info, data)| (info, data.len()))
        } else {
            match receiver.config().detector.bit_depth {
                BitDepth::Twelve => receiver
                    .decoded_image_short()
                    .map(|(info, data)| (info, data.len() * 2)),
                BitDepth::TwentyFour => receiver
                    .decoded_image_int()
                    .map(|(info, data)| (info, data.len() * 4)),
            }
        };
        match delivered {
            Some((info, bytes)) => tally.add(&info, bytes),
            None => break,
        }
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

    tracing::info!("Starting pixel detector receiver");

    let mut args = std::env::args().skip(1);
    let config = load_config(args.next().map(PathBuf::from))?;
    let requested: u64 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("image count '{}'", n))?,
        None => 0,
    };

    let mut receiver = DataReceiver::init(config).context("setting up the receiver")?;
    for addr in receiver.local_addrs() {
        tracing::info!("Listening on {}", addr);
    }
    let (width, height) = receiver.image_size();
    tracing::info!("Images are {}x{}", width, height);

    receiver.set_requested_images(requested);
    receiver.start()?;

    let started = Instant::now();
    let mut last_stats = Instant::now();
    let mut tally = Tally::default();
    loop {
        drain(&receiver, &mut tally);
        if requested > 0 && tally.images >= requested {
            break;
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let stats = receiver.stats();
            tracing::info!(
                "{} raw, {} decoded, {} delivered ({} damaged), queue {}, free {}",
                stats.raw_received,
                stats.decoded_received,
                tally.images,
                tally.damaged,
                stats.queue_depth,
                stats.free_buffer
            );
            for (i, link) in stats.links.iter().enumerate() {
                tracing::debug!(
                    "Link {}: {} packets, {} rejected, {} malformed, {} errors",
                    i,
                    link.packets,
                    link.rejected,
                    link.malformed,
                    link.errors
                );
            }
        }

        thread::sleep(POLL_SLEEP);
    }

    receiver.stop();
    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        "Received {} images ({} damaged) in {:.2}s, {:.1} images/s, {:.1} MB/s",
        tally.images,
        tally.damaged,
        elapsed,
        tally.images as f64 / elapsed,
        tally.bytes as f64 / elapsed / 1e6
    );
    Ok(())
}
