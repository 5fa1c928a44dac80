//! GStreamer capture backend (feature `source-gstreamer`).
//!
//! Network streams decode through `uridecodebin` with a small buffer that
//! tolerates jitter; local devices go through `v4l2src` with a single
//! buffer and `drop=true` so reads always see the freshest frame.

use anyhow::Context;
use gstreamer::prelude::*;
use std::time::Duration;
use url::Url;

use super::CaptureBackend;
use crate::error::SourceError;

/// How long a single sample pull may wait before the read counts as failed.
const PULL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct GstBackend {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    descriptor: String,
}

impl GstBackend {
    pub fn open_stream(url: &Url) -> Result<Self, SourceError> {
        let description = format!(
            "uridecodebin uri={url} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink sync=false max-buffers=3 drop=true",
        );
        Self::build(&description, url.as_str())
    }

    pub fn open_device(index: u32) -> Result<Self, SourceError> {
        let description = format!(
            "v4l2src device=/dev/video{index} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink sync=false max-buffers=1 drop=true",
        );
        Self::build(&description, &format!("device {index}"))
    }

    fn build(description: &str, descriptor: &str) -> Result<Self, SourceError> {
        Self::build_inner(description)
            .map(|(pipeline, appsink)| Self {
                pipeline,
                appsink,
                descriptor: descriptor.to_string(),
            })
            .map_err(|e| SourceError::Open {
                descriptor: descriptor.to_string(),
                reason: format!("{e:#}"),
            })
    }

    fn build_inner(
        description: &str,
    ) -> anyhow::Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse_launch(description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;

        Ok((pipeline, appsink))
    }

    fn drain_bus(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(format!("pipeline error: {}", err.error()));
                }
                MessageView::Eos(..) => {
                    return Some("pipeline reached end of stream".to_string());
                }
                _ => {}
            }
        }
        None
    }
}

impl CaptureBackend for GstBackend {
    fn read_raw(&mut self) -> Result<(Vec<u8>, u32, u32), String> {
        if let Some(error) = self.drain_bus() {
            return Err(error);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| format!("no sample from {} within timeout", self.descriptor))?;

        sample_to_rgb(&sample).map_err(|e| format!("{e:#}"))
    }

    fn close(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop capture pipeline: {e}");
        }
    }
}

fn sample_to_rgb(sample: &gstreamer::Sample) -> anyhow::Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    // Strided layout: copy row by row.
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row out of bounds")?);
    }
    Ok((pixels, width, height))
}
