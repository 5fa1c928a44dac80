//! Pipeline orchestration: the two loops and their lifecycle.
//!
//! Two threads run for the life of the pipeline:
//! - the capture/display loop, paced at the display rate, which reads
//!   frames, composites the overlay, and presents to the sink;
//! - the detection loop, which ticks the scheduler at the (slower)
//!   detection cadence.
//!
//! They share only the two handoff slots, the connection status, and the
//! counters. The capture/display loop never waits on the network: the
//! overlay always uses whatever result is cached, however stale.
//!
//! Shutdown is flag-based. `PipelineHandle::stop` only flips an atomic,
//! so it is safe to call from a signal handler; `stop` on the controller
//! then waits out a bounded grace period before detaching stuck loops.

use crossbeam_channel::{bounded, Receiver, Sender};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{ConnectionStatus, DetectionChannel};
use crate::compositor::{Compositor, OverlayStatus};
use crate::config::PipelineConfig;
use crate::detect::DetectionResult;
use crate::error::{ConnectError, SourceError};
use crate::frame::{Frame, LatestSlot};
use crate::scheduler::DetectionScheduler;
use crate::source::FrameSource;

/// How long the capture loop backs off after a recoverable read failure.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Detection loop poll period between scheduler ticks.
const DETECTION_POLL: Duration = Duration::from_millis(10);
/// JPEG quality for operator-saved snapshots.
const SNAPSHOT_QUALITY: u8 = 90;

/// Commands an operator can issue through the display sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Stop the pipeline.
    Quit,
    /// Save the current composited frame to disk.
    SaveFrame,
}

/// Where composited frames go.
///
/// The pipeline core is display-agnostic; a sink can be a window, a
/// streaming encoder, or nothing at all.
pub trait DisplaySink: Send {
    /// Present one composited frame. An error stops the pipeline.
    fn present(&mut self, image: &RgbImage) -> anyhow::Result<()>;

    /// Drain one pending operator command, if any.
    fn poll_command(&mut self) -> Option<OperatorCommand>;

    /// Called once when the capture/display loop exits.
    fn close(&mut self) {}
}

/// Sink that discards frames. Used headless and in tests.
#[derive(Debug, Default)]
pub struct NullSink {
    presented: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplaySink for NullSink {
    fn present(&mut self, _image: &RgbImage) -> anyhow::Result<()> {
        self.presented += 1;
        Ok(())
    }

    fn poll_command(&mut self) -> Option<OperatorCommand> {
        None
    }
}

/// Live pipeline counters, shared read-only with the overlay.
#[derive(Debug)]
pub struct PipelineStats {
    frames: Arc<AtomicU64>,
    detections: Arc<AtomicU64>,
    started: Instant,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            detections: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }

    /// Average display rate since start.
    pub fn fps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.frames() as f64 / elapsed
        }
    }
}

/// Signal-safe stop handle.
///
/// `stop` only stores an atomic, so it can be called from a ctrl-c
/// handler or any thread.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
}

impl PipelineHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Owns the pipeline threads from start to stop.
pub struct PipelineController {
    config: PipelineConfig,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    status: Arc<ConnectionStatus>,
    handles: Vec<JoinHandle<()>>,
    done_rx: Option<Receiver<&'static str>>,
}

impl PipelineController {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::new()),
            status: Arc::new(ConnectionStatus::new()),
            handles: Vec::new(),
            done_rx: None,
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Open the source, connect the detector, and start both loops.
    ///
    /// A dead detector is not fatal: past the retry budget the pipeline
    /// starts anyway and renders with a disconnected status while the
    /// channel worker keeps reconnecting. A source that cannot open is
    /// fatal, because there is nothing to display.
    pub fn start(&mut self, sink: Box<dyn DisplaySink>) -> anyhow::Result<()> {
        if !self.handles.is_empty() {
            anyhow::bail!("pipeline already started");
        }

        let mut source = FrameSource::new(self.config.source.clone())?;
        source.open()?;

        let mut channel = DetectionChannel::new(self.config.detector.clone());
        match channel.connect() {
            Ok(()) => {}
            Err(e @ ConnectError::BadEndpoint { .. }) => {
                // Misconfiguration, not an outage; no point starting.
                return Err(e.into());
            }
            Err(e) => {
                log::error!("starting without detector: {e}");
            }
        }
        self.status = channel.status();

        let frame_slot = Arc::new(LatestSlot::new());
        let result_slot = Arc::new(LatestSlot::new());
        let scheduler = DetectionScheduler::new(
            self.config.detection_interval(),
            Arc::clone(&frame_slot),
            Arc::clone(&result_slot),
            Arc::clone(&self.stats.detections),
        );

        self.running.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = bounded(2);
        self.done_rx = Some(done_rx);

        let capture = CaptureLoop {
            config: self.config.clone(),
            source,
            sink,
            compositor: Compositor::new(self.config.display.font_path.as_deref()),
            frame_slot,
            result_slot,
            status: Arc::clone(&self.status),
            stats: Arc::clone(&self.stats),
            running: Arc::clone(&self.running),
        };
        self.handles.push(spawn_loop(
            "capture-display",
            done_tx.clone(),
            move || capture.run(),
        )?);

        let running = Arc::clone(&self.running);
        self.handles.push(spawn_loop("detection", done_tx, move || {
            detection_loop(channel, scheduler, running)
        })?);

        log::info!(
            "pipeline started: source {}, display {} fps, detection {} fps",
            self.config.source.descriptor,
            self.config.display.fps,
            self.config.detector.detection_fps
        );
        Ok(())
    }

    /// Block until the pipeline stops on its own (source exhausted,
    /// operator quit, or `PipelineHandle::stop`).
    pub fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("pipeline loop panicked");
            }
        }
        self.done_rx = None;
    }

    /// Stop both loops, waiting at most the configured grace period.
    ///
    /// Loops that miss the deadline are detached rather than blocked on;
    /// a wedged sink must not turn shutdown into a hang.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(done_rx) = self.done_rx.take() else {
            return;
        };

        let deadline = Instant::now() + self.config.display.shutdown_grace;
        let mut finished = 0;
        while finished < self.handles.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(name) => {
                    log::debug!("{name} loop stopped");
                    finished += 1;
                }
                Err(_) => break,
            }
        }

        if finished == self.handles.len() {
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    log::error!("pipeline loop panicked");
                }
            }
        } else {
            log::warn!(
                "{} loop(s) still running after {:?} grace; detaching",
                self.handles.len() - finished,
                self.config.display.shutdown_grace
            );
            self.handles.clear();
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop<F>(
    name: &'static str,
    done: Sender<&'static str>,
    body: F,
) -> anyhow::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            body();
            let _ = done.send(name);
        })
        .map_err(|e| anyhow::anyhow!("failed to spawn {name} loop: {e}"))
}

struct CaptureLoop {
    config: PipelineConfig,
    source: FrameSource,
    sink: Box<dyn DisplaySink>,
    compositor: Compositor,
    frame_slot: Arc<LatestSlot<Frame>>,
    result_slot: Arc<LatestSlot<DetectionResult>>,
    status: Arc<ConnectionStatus>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(mut self) {
        let interval = self.config.display_interval();
        let mut next_tick = Instant::now() + interval;

        while self.running.load(Ordering::SeqCst) {
            let frame = match self.source.read_frame() {
                Ok(frame) => Arc::new(frame),
                Err(SourceError::Read { .. }) => {
                    // Transient; the source is still counting toward its
                    // threshold. Back off briefly and try again.
                    std::thread::sleep(READ_RETRY_BACKOFF);
                    continue;
                }
                Err(e) => {
                    log::error!("capture stopped: {e}");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            };

            self.frame_slot.publish_arc(Arc::clone(&frame));
            self.stats.frames.fetch_add(1, Ordering::Relaxed);

            let result = self.result_slot.latest();
            let overlay = OverlayStatus {
                fps: self.stats.fps(),
                frame_count: self.stats.frames(),
                detection_count: self.stats.detections(),
                connection: self.status.get(),
                source_label: self.config.source.descriptor.clone(),
            };
            let image = self.compositor.render(&frame, result.as_deref(), &overlay);

            if let Err(e) = self.sink.present(&image) {
                log::error!("display sink failed: {e}");
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            while let Some(command) = self.sink.poll_command() {
                match command {
                    OperatorCommand::Quit => {
                        log::info!("operator requested quit");
                        self.running.store(false, Ordering::SeqCst);
                    }
                    OperatorCommand::SaveFrame => {
                        save_snapshot(&self.config.display.save_dir, &frame, &image);
                    }
                }
            }

            // Fixed-rate pacing; when a cycle overruns, rebase instead of
            // bursting to catch up.
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
                next_tick += interval;
            } else {
                next_tick = now + interval;
            }
        }

        self.source.close();
        self.sink.close();
        log::debug!("capture/display loop exited");
    }
}

fn detection_loop(
    mut channel: DetectionChannel,
    mut scheduler: DetectionScheduler,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        scheduler.tick(&channel, Instant::now());
        std::thread::sleep(DETECTION_POLL);
    }
    channel.close();
    log::debug!("detection loop exited");
}

/// Write the composited frame to the save directory as a JPEG.
///
/// Best-effort: a failed save is logged, never fatal.
fn save_snapshot(dir: &Path, frame: &Frame, image: &RgbImage) {
    let path = dir.join(format!("frame_{}.jpg", frame.seq));
    let result = std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("create {}: {e}", dir.display()))
        .and_then(|_| {
            let file = std::fs::File::create(&path)
                .map_err(|e| anyhow::anyhow!("create {}: {e}", path.display()))?;
            let writer = std::io::BufWriter::new(file);
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(writer, SNAPSHOT_QUALITY);
            image
                .write_with_encoder(encoder)
                .map_err(|e| anyhow::anyhow!("encode {}: {e}", path.display()))
        });
    match result {
        Ok(()) => log::info!("saved frame to {}", path.display()),
        Err(e) => log::error!("failed to save frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.source.descriptor = "stub://test".to_string();
        config.source.width = 64;
        config.source.height = 48;
        // A closed local port fails the handshake immediately; one attempt
        // keeps startup fast.
        config.detector.url = "ws://127.0.0.1:1".to_string();
        config.detector.max_connect_retries = 1;
        config.detector.retry_delay = Duration::from_millis(10);
        config.display.shutdown_grace = Duration::from_secs(2);
        config
    }

    /// Sink that counts frames and plays back scripted commands.
    struct ScriptedSink {
        presented: Arc<AtomicU64>,
        commands: Mutex<Vec<(u64, OperatorCommand)>>,
    }

    impl ScriptedSink {
        fn new(commands: Vec<(u64, OperatorCommand)>) -> (Self, Arc<AtomicU64>) {
            let presented = Arc::new(AtomicU64::new(0));
            (
                Self {
                    presented: Arc::clone(&presented),
                    commands: Mutex::new(commands),
                },
                presented,
            )
        }
    }

    impl DisplaySink for ScriptedSink {
        fn present(&mut self, _image: &RgbImage) -> anyhow::Result<()> {
            self.presented.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn poll_command(&mut self) -> Option<OperatorCommand> {
            let frame = self.presented.load(Ordering::SeqCst);
            let mut commands = self.commands.lock().unwrap();
            match commands.first() {
                Some((at, _)) if *at <= frame => Some(commands.remove(0).1),
                _ => None,
            }
        }
    }

    #[test]
    fn pipeline_renders_without_a_detector() {
        let mut controller = PipelineController::new(test_config());
        let (sink, presented) = ScriptedSink::new(vec![]);
        controller.start(Box::new(sink)).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        controller.stop();

        // ~30 fps for 300ms; allow wide slack for loaded CI machines.
        assert!(presented.load(Ordering::SeqCst) >= 2);
        assert!(controller.stats().frames() >= 2);
        assert!(!controller.status().is_connected());
    }

    #[test]
    fn operator_quit_stops_the_pipeline() {
        let mut controller = PipelineController::new(test_config());
        let (sink, _presented) = ScriptedSink::new(vec![(3, OperatorCommand::Quit)]);
        controller.start(Box::new(sink)).unwrap();

        controller.wait();
        assert!(!controller.handle().is_running());
    }

    #[test]
    fn exhausted_source_stops_the_pipeline() {
        let mut config = test_config();
        config.source.descriptor = "stub://fail-after-5".to_string();
        config.source.failure_threshold = 2;

        let mut controller = PipelineController::new(config);
        controller.start(Box::new(NullSink::new())).unwrap();

        controller.wait();
        assert!(!controller.handle().is_running());
        assert!(controller.stats().frames() >= 5);
    }

    #[test]
    fn save_command_writes_a_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.display.save_dir = dir.path().to_path_buf();

        let mut controller = PipelineController::new(config);
        let (sink, _presented) = ScriptedSink::new(vec![
            (2, OperatorCommand::SaveFrame),
            (4, OperatorCommand::Quit),
        ]);
        controller.start(Box::new(sink)).unwrap();
        controller.wait();

        let saved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "jpg").unwrap_or(false))
            .collect();
        assert!(!saved.is_empty(), "expected at least one saved frame");
    }

    #[test]
    fn stop_is_idempotent() {
        let mut controller = PipelineController::new(test_config());
        controller.start(Box::new(NullSink::new())).unwrap();
        controller.stop();
        controller.stop();
        assert!(!controller.handle().is_running());
    }
}
