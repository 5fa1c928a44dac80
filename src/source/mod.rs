//! Frame capture sources.
//!
//! A `FrameSource` pulls raw frames from one of:
//! - a network stream (URL-style descriptor, e.g. `rtsp://` or `http://`),
//! - a local device (integer-like descriptor, e.g. `"0"`),
//! - a synthetic `stub://` source (always available, used by tests).
//!
//! Real capture backends are feature-gated (`source-gstreamer`); the stub
//! source needs no system dependencies.
//!
//! Failure policy: consecutive read failures are counted. Past the
//! configured threshold the source is declared dead and `read_frame`
//! returns `SourceError::Exhausted`: the pipeline must stop, not retry,
//! because both causes (stream ended, device unplugged) are fatal to this
//! source instance.

#[cfg(feature = "source-gstreamer")]
mod gst;
mod synthetic;

pub use synthetic::SyntheticSource;

use std::time::{Duration, Instant};
use url::Url;

use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::frame::Frame;

/// How long a network stream may take to deliver its first decodable
/// frame before `open` declares it dead.
const STREAM_WARMUP: Duration = Duration::from_secs(2);
/// Pause between warm-up attempts when the backend fails fast.
const WARMUP_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// What kind of capture a descriptor names, decided by its shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device, by index.
    Device(u32),
    /// Pull-style network stream.
    Stream(Url),
    /// Synthetic source for tests and demos (`stub://name`).
    Stub(String),
}

impl SourceKind {
    /// Classify a descriptor: integer-like means device, URL means stream.
    pub fn parse(descriptor: &str) -> Result<Self, SourceError> {
        let descriptor = descriptor.trim();
        if let Ok(index) = descriptor.parse::<u32>() {
            return Ok(SourceKind::Device(index));
        }
        if let Some(name) = descriptor.strip_prefix("stub://") {
            return Ok(SourceKind::Stub(name.to_string()));
        }
        match Url::parse(descriptor) {
            Ok(url) => Ok(SourceKind::Stream(url)),
            Err(e) => Err(SourceError::Open {
                descriptor: descriptor.to_string(),
                reason: format!("neither a device index nor a URL: {e}"),
            }),
        }
    }

    /// Network streams get a warm-up read and a larger internal buffer;
    /// devices get a minimal buffer to avoid stale frames.
    pub fn is_network(&self) -> bool {
        matches!(self, SourceKind::Stream(_))
    }
}

/// Backend contract: produce raw RGB frames on demand.
///
/// `read_raw` may block up to roughly one frame interval; pacing is the
/// caller's job.
trait CaptureBackend: Send {
    fn read_raw(&mut self) -> Result<(Vec<u8>, u32, u32), String>;
    fn close(&mut self);
}

/// A capture source with liveness tracking.
pub struct FrameSource {
    kind: SourceKind,
    settings: SourceSettings,
    backend: Option<Box<dyn CaptureBackend>>,
    consecutive_failures: u32,
    frames_read: u64,
    next_seq: u64,
}

impl FrameSource {
    pub fn new(settings: SourceSettings) -> Result<Self, SourceError> {
        let kind = SourceKind::parse(&settings.descriptor)?;
        Ok(Self {
            kind,
            settings,
            backend: None,
            consecutive_failures: 0,
            frames_read: 0,
            next_seq: 0,
        })
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    /// Open the capture backend and bring it to a ready state.
    ///
    /// Network streams perform a warm-up read-and-discard, tolerating a
    /// bounded startup delay, before the source is declared ready.
    pub fn open(&mut self) -> Result<(), SourceError> {
        let mut backend: Box<dyn CaptureBackend> = match &self.kind {
            SourceKind::Stub(name) => Box::new(SyntheticSource::new(
                name.clone(),
                self.settings.width,
                self.settings.height,
            )),
            #[cfg(feature = "source-gstreamer")]
            SourceKind::Stream(url) => Box::new(gst::GstBackend::open_stream(url)?),
            #[cfg(feature = "source-gstreamer")]
            SourceKind::Device(index) => Box::new(gst::GstBackend::open_device(*index)?),
            #[cfg(not(feature = "source-gstreamer"))]
            SourceKind::Stream(_) | SourceKind::Device(_) => {
                return Err(SourceError::Open {
                    descriptor: self.settings.descriptor.clone(),
                    reason: "real capture requires the source-gstreamer feature".to_string(),
                })
            }
        };

        if self.kind.is_network() {
            // Streams can take a moment to negotiate and deliver the first
            // decodable frame; read and discard one to prove the stream is
            // live, retrying within the startup window.
            warm_up(backend.as_mut(), STREAM_WARMUP).map_err(|reason| SourceError::Open {
                descriptor: self.settings.descriptor.clone(),
                reason: format!("warm-up read failed: {reason}"),
            })?;
            log::info!("source warm-up complete: {}", self.settings.descriptor);
        }

        self.backend = Some(backend);
        self.consecutive_failures = 0;
        log::info!("source open: {}", self.settings.descriptor);
        Ok(())
    }

    /// Read the next frame, stamping it with the next sequence number.
    ///
    /// Frames are produced in strictly increasing sequence order. A failed
    /// read increments the consecutive-failure count; a successful read
    /// resets it.
    pub fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let backend = self.backend.as_mut().ok_or(SourceError::NotOpen)?;
        match backend.read_raw() {
            Ok((pixels, width, height)) => {
                self.consecutive_failures = 0;
                self.frames_read += 1;
                self.next_seq += 1;
                Ok(Frame::new(pixels, width, height, self.next_seq))
            }
            Err(reason) => {
                self.consecutive_failures += 1;
                log::warn!(
                    "frame read failed ({}/{}): {}",
                    self.consecutive_failures,
                    self.settings.failure_threshold,
                    reason
                );
                if self.consecutive_failures >= self.settings.failure_threshold {
                    Err(SourceError::Exhausted {
                        consecutive: self.consecutive_failures,
                    })
                } else {
                    Err(SourceError::Read {
                        consecutive: self.consecutive_failures,
                    })
                }
            }
        }
    }

    /// Whether the source is open and under its failure threshold.
    pub fn is_alive(&self) -> bool {
        self.backend.is_some() && self.consecutive_failures < self.settings.failure_threshold
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            log::info!("source closed: {}", self.settings.descriptor);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-and-discard one frame, retrying until the startup window closes.
fn warm_up(backend: &mut dyn CaptureBackend, window: Duration) -> Result<(), String> {
    let start = Instant::now();
    loop {
        match backend.read_raw() {
            Ok(_) => return Ok(()),
            Err(reason) => {
                if start.elapsed() >= window {
                    return Err(reason);
                }
                std::thread::sleep(WARMUP_RETRY_PAUSE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_settings() -> SourceSettings {
        SourceSettings {
            descriptor: "stub://test".to_string(),
            width: 64,
            height: 48,
            failure_threshold: 3,
        }
    }

    #[test]
    fn device_descriptor_is_integer_like() {
        assert_eq!(SourceKind::parse("0").unwrap(), SourceKind::Device(0));
        assert_eq!(SourceKind::parse(" 2 ").unwrap(), SourceKind::Device(2));
    }

    #[test]
    fn url_descriptor_is_a_stream() {
        let kind = SourceKind::parse("rtsp://cam.local:554/live").unwrap();
        assert!(kind.is_network());
        let kind = SourceKind::parse("http://localhost:8080/video.mjpg").unwrap();
        assert!(kind.is_network());
    }

    #[test]
    fn garbage_descriptor_is_an_open_error() {
        assert!(SourceKind::parse("not a source").is_err());
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = FrameSource::new(stub_settings()).unwrap();
        assert!(matches!(source.read_frame(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn stub_source_produces_sequenced_frames() {
        let mut source = FrameSource::new(stub_settings()).unwrap();
        source.open().unwrap();

        let first = source.read_frame().unwrap();
        let second = source.read_frame().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(first.width, 64);
        assert_eq!(first.byte_len(), 64 * 48 * 3);
        assert!(source.is_alive());
    }

    struct SlowStartBackend {
        failures_left: u32,
        attempts: u32,
    }

    impl CaptureBackend for SlowStartBackend {
        fn read_raw(&mut self) -> Result<(Vec<u8>, u32, u32), String> {
            self.attempts += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                Err("not negotiated yet".to_string())
            } else {
                Ok((vec![0u8; 12], 2, 2))
            }
        }

        fn close(&mut self) {}
    }

    #[test]
    fn warm_up_retries_within_the_startup_window() {
        let mut backend = SlowStartBackend {
            failures_left: 2,
            attempts: 0,
        };
        warm_up(&mut backend, Duration::from_secs(2)).unwrap();
        assert_eq!(backend.attempts, 3);
    }

    #[test]
    fn warm_up_gives_up_when_the_window_closes() {
        let mut backend = SlowStartBackend {
            failures_left: u32::MAX,
            attempts: 0,
        };
        let err = warm_up(&mut backend, Duration::from_millis(120)).unwrap_err();
        assert!(err.contains("not negotiated"));
        assert!(backend.attempts >= 2);
    }

    #[test]
    fn close_releases_the_backend() {
        let mut source = FrameSource::new(stub_settings()).unwrap();
        source.open().unwrap();
        source.close();
        assert!(!source.is_alive());
        assert!(matches!(source.read_frame(), Err(SourceError::NotOpen)));
    }
}
