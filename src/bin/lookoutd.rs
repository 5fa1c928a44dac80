//! lookoutd - realtime camera client daemon
//!
//! This daemon:
//! 1. Captures frames from the configured source (device, stream, or stub)
//! 2. Submits frames to a remote detector over a persistent WebSocket at
//!    the detection rate
//! 3. Composites the latest detection result onto the live video at the
//!    display rate
//! 4. Keeps rendering through detector outages with a visible
//!    disconnected status

use anyhow::Result;
use clap::Parser;

use lookout::{NullSink, PipelineConfig, PipelineController};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Capture source: device index, stream URL, or stub://name.
    #[arg(long, env = "LOOKOUT_SOURCE")]
    source: Option<String>,
    /// Detector WebSocket endpoint.
    #[arg(long, env = "LOOKOUT_DETECTOR_URL")]
    detector_url: Option<String>,
    /// Target display frame rate.
    #[arg(long)]
    display_fps: Option<u32>,
    /// Target detection submission rate.
    #[arg(long)]
    detection_fps: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = PipelineConfig::load()?;
    if let Some(source) = args.source {
        config.source.descriptor = source;
    }
    if let Some(url) = args.detector_url {
        config.detector.url = url;
    }
    if let Some(fps) = args.display_fps {
        config.display.fps = fps;
    }
    if let Some(fps) = args.detection_fps {
        config.detector.detection_fps = fps;
    }
    config.validate()?;

    log::info!(
        "lookoutd {} starting: source {}, detector {}",
        env!("CARGO_PKG_VERSION"),
        config.source.descriptor,
        config.detector.url
    );

    let mut controller = PipelineController::new(config);
    let handle = controller.handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        handle.stop();
    })?;

    controller.start(Box::new(NullSink::new()))?;
    controller.wait();

    let stats = controller.stats();
    log::info!(
        "pipeline stopped: {} frames displayed, {} detections, {:.1} fps average",
        stats.frames(),
        stats.detections(),
        stats.fps()
    );
    Ok(())
}
