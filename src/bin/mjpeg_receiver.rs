//! mjpeg_receiver - receive an MJPEG stream and log what arrives.
//!
//! Decodes every frame to RGB, logs frame arrivals at debug level and the
//! pipeline statistics periodically. Exits on Ctrl-C or when the source ends.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use mjpeg_receiver::{
    DecodedFrame, FrameDecoder, QueuePolicy, Receiver, ReceiverConfig, RgbImage,
    RgbImageDecoder, SourceTermination,
};

enum Event {
    Shutdown,
    SourceEnded(SourceTermination),
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Receive an MJPEG stream and dispatch decoded frames"
)]
struct Args {
    /// Stream URL: http(s)://, file:// or stub://. Overrides MJPEG_URL and the config file.
    url: Option<String>,

    /// Keep only the newest frame; drop frames the decoder cannot keep up with.
    #[arg(long, conflicts_with_all = ["capacity", "workers"])]
    latest_only: bool,

    /// Ingest queue capacity for the bounded policy.
    #[arg(long)]
    capacity: Option<usize>,

    /// Decode worker threads for the bounded policy.
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between statistics log lines.
    #[arg(long, env = "MJPEG_STATS_INTERVAL_SECS", default_value_t = 10)]
    stats_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ReceiverConfig::load()?;
    if let Some(url) = args.url {
        config.url = url;
    }
    if args.latest_only {
        config.policy = QueuePolicy::LatestOnly;
    } else if args.capacity.is_some() || args.workers.is_some() {
        let (capacity, decode_workers) = match config.policy {
            QueuePolicy::Bounded {
                capacity,
                decode_workers,
            } => (capacity, decode_workers),
            QueuePolicy::LatestOnly => (
                mjpeg_receiver::queue::DEFAULT_QUEUE_CAPACITY,
                mjpeg_receiver::queue::DEFAULT_DECODE_WORKERS,
            ),
        };
        config.policy = QueuePolicy::Bounded {
            capacity: args.capacity.unwrap_or(capacity),
            decode_workers: args.workers.unwrap_or(decode_workers),
        };
    }

    let decoder: Arc<dyn FrameDecoder<RgbImage>> = Arc::new(RgbImageDecoder);
    let receiver = Receiver::new(config, decoder)?;
    receiver.add_listener(Arc::new(|frame: &Arc<DecodedFrame<RgbImage>>| {
        let image = frame.image();
        log::debug!(
            "frame {}: {}x{} ({:?} after capture)",
            frame.sequence(),
            image.width,
            image.height,
            frame.decode_latency()
        );
    }));

    let (tx, rx) = crossbeam_channel::unbounded();
    let ended_tx = tx.clone();
    receiver.on_source_termination(move |ended: &SourceTermination| {
        let _ = ended_tx.send(Event::SourceEnded(ended.clone()));
    });
    ctrlc::set_handler(move || {
        let _ = tx.send(Event::Shutdown);
    })
    .context("error setting Ctrl-C handler")?;

    receiver.start()?;
    log::info!("mjpeg_receiver running; Ctrl-C to stop");

    let interval = Duration::from_secs(args.stats_interval_secs.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let stats = serde_json::to_string(&receiver.stats())?;
                log::info!("stats {} healthy={}", stats, receiver.is_healthy());
            }
            Ok(Event::SourceEnded(termination)) => {
                log::warn!("source ended: {}", serde_json::to_string(&termination)?);
                break;
            }
            Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping receiver...");
                break;
            }
        }
    }

    receiver.stop();
    log::info!("final stats {}", serde_json::to_string(&receiver.stats())?);
    Ok(())
}
