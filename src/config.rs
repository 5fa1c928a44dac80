//! Pipeline configuration.
//!
//! Configuration is resolved once at startup from three layers: built-in
//! defaults, an optional JSON file pointed at by `LOOKOUT_CONFIG`, and
//! field-wise environment overrides. The resolved `PipelineConfig` is
//! immutable for the life of the pipeline; no component mutates it.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SOURCE: &str = "stub://demo";
const DEFAULT_DETECTOR_URL: &str = "ws://localhost:8765";
const DEFAULT_DISPLAY_FPS: u32 = 30;
const DEFAULT_DETECTION_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_MAX_CONNECT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 500;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    source: Option<SourceFile>,
    detector: Option<DetectorFile>,
    display: Option<DisplayFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceFile {
    descriptor: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    failure_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorFile {
    url: Option<String>,
    detection_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    max_connect_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    keepalive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayFile {
    fps: Option<u32>,
    font_path: Option<PathBuf>,
    save_dir: Option<PathBuf>,
    shutdown_grace_ms: Option<u64>,
}

/// Immutable pipeline configuration, fixed at start.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub display: DisplaySettings,
}

/// Capture source settings.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Stream URL (`rtsp://`, `http://`, `stub://`) or device index (`"0"`).
    pub descriptor: String,
    pub width: u32,
    pub height: u32,
    /// Consecutive read failures after which the source is declared dead.
    pub failure_threshold: u32,
}

/// Detection channel settings.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// WebSocket endpoint of the detector service.
    pub url: String,
    /// Target rate at which frames are submitted for detection.
    pub detection_fps: u32,
    pub jpeg_quality: u8,
    pub max_connect_retries: u32,
    pub retry_delay: Duration,
    pub send_timeout: Duration,
    pub response_timeout: Duration,
    pub keepalive_interval: Duration,
}

/// Display loop settings.
#[derive(Debug, Clone)]
pub struct DisplaySettings {
    /// Target display frame rate, independent of the detection rate.
    pub fps: u32,
    /// TTF for overlay labels. Labels are skipped when absent.
    pub font_path: Option<PathBuf>,
    /// Directory that saved frames are written into.
    pub save_dir: PathBuf,
    /// How long `stop()` waits for loops to exit before detaching them.
    pub shutdown_grace: Duration,
}

impl PipelineConfig {
    /// Resolve configuration from `LOOKOUT_CONFIG` plus env overrides.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("LOOKOUT_CONFIG").ok().as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        Self {
            source: SourceSettings {
                descriptor: source
                    .descriptor
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                failure_threshold: source
                    .failure_threshold
                    .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            },
            detector: DetectorSettings {
                url: detector
                    .url
                    .unwrap_or_else(|| DEFAULT_DETECTOR_URL.to_string()),
                detection_fps: detector.detection_fps.unwrap_or(DEFAULT_DETECTION_FPS),
                jpeg_quality: detector.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                max_connect_retries: detector
                    .max_connect_retries
                    .unwrap_or(DEFAULT_MAX_CONNECT_RETRIES),
                retry_delay: Duration::from_millis(
                    detector.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
                ),
                send_timeout: Duration::from_millis(
                    detector.send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
                ),
                response_timeout: Duration::from_millis(
                    detector
                        .response_timeout_ms
                        .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS),
                ),
                keepalive_interval: Duration::from_secs(
                    detector.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
                ),
            },
            display: DisplaySettings {
                fps: display.fps.unwrap_or(DEFAULT_DISPLAY_FPS),
                font_path: display.font_path,
                save_dir: display.save_dir.unwrap_or_else(|| PathBuf::from(".")),
                shutdown_grace: Duration::from_millis(
                    display
                        .shutdown_grace_ms
                        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(descriptor) = std::env::var("LOOKOUT_SOURCE") {
            if !descriptor.trim().is_empty() {
                self.source.descriptor = descriptor;
            }
        }
        if let Ok(url) = std::env::var("LOOKOUT_DETECTOR_URL") {
            if !url.trim().is_empty() {
                self.detector.url = url;
            }
        }
        if let Ok(fps) = std::env::var("LOOKOUT_DISPLAY_FPS") {
            self.display.fps = fps
                .parse()
                .map_err(|_| anyhow!("LOOKOUT_DISPLAY_FPS must be an integer"))?;
        }
        if let Ok(fps) = std::env::var("LOOKOUT_DETECTION_FPS") {
            self.detector.detection_fps = fps
                .parse()
                .map_err(|_| anyhow!("LOOKOUT_DETECTION_FPS must be an integer"))?;
        }
        if let Ok(path) = std::env::var("LOOKOUT_FONT_PATH") {
            if !path.trim().is_empty() {
                self.display.font_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    /// Check cross-field constraints. Run after any override.
    pub fn validate(&self) -> Result<()> {
        if self.display.fps == 0 {
            return Err(anyhow!("display fps must be greater than zero"));
        }
        if self.detector.detection_fps == 0 {
            return Err(anyhow!("detection fps must be greater than zero"));
        }
        if self.detector.detection_fps > self.display.fps {
            return Err(anyhow!(
                "detection fps ({}) must not exceed display fps ({})",
                self.detector.detection_fps,
                self.display.fps
            ));
        }
        if !(1..=100).contains(&self.detector.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100"));
        }
        if self.detector.max_connect_retries == 0 {
            return Err(anyhow!("max connect retries must be at least 1"));
        }
        if self.source.failure_threshold == 0 {
            return Err(anyhow!("source failure threshold must be at least 1"));
        }
        if self.source.descriptor.trim().is_empty() {
            return Err(anyhow!("source descriptor must not be empty"));
        }
        Ok(())
    }

    /// Interval between display frames.
    pub fn display_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.display.fps))
    }

    /// Interval between detection submissions.
    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.detector.detection_fps))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.display.fps, 30);
        assert_eq!(cfg.detector.detection_fps, 10);
        assert_eq!(cfg.source.descriptor, "stub://demo");
    }

    #[test]
    fn intervals_follow_cadence() {
        let cfg = PipelineConfig::default();
        assert!((cfg.display_interval().as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
        assert!((cfg.detection_interval().as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rejects_detection_faster_than_display() {
        let mut cfg = PipelineConfig::default();
        cfg.detector.detection_fps = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_fps() {
        let mut cfg = PipelineConfig::default();
        cfg.display.fps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let mut cfg = PipelineConfig::default();
        cfg.detector.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }
}
