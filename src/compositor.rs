//! Overlay composition.
//!
//! A pure function of (latest frame, latest cached detection result,
//! connection status, counters) → display-ready image. No timers, no I/O
//! beyond the font loaded once at construction.
//!
//! Label text needs a TTF; when none is configured or it fails to load,
//! boxes and the colored status indicator still render and the gap is
//! logged once at startup.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::channel::ConnectionState;
use crate::detect::DetectionResult;
use crate::frame::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const STATUS_OK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const STATUS_WARN_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const STATUS_BAD_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const INFO_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const TEXT_SCALE: f32 = 16.0;
const LINE_HEIGHT: i32 = 22;

/// Live counters shown in the status block.
#[derive(Clone, Debug)]
pub struct OverlayStatus {
    pub fps: f64,
    pub frame_count: u64,
    pub detection_count: u64,
    pub connection: ConnectionState,
    pub source_label: String,
}

pub struct Compositor {
    font: Option<FontVec>,
}

impl Compositor {
    /// Build a compositor, loading the label font if one is configured.
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    log::warn!("invalid font {}: {e}; labels disabled", path.display());
                    None
                }
            },
            Err(e) => {
                log::warn!("cannot read font {}: {e}; labels disabled", path.display());
                None
            }
        });
        if font.is_none() {
            log::warn!("no overlay font loaded; boxes render without text labels");
        }
        Self { font }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Compose the display frame: video + boxes + labels + status block.
    pub fn render(
        &self,
        frame: &Frame,
        result: Option<&DetectionResult>,
        status: &OverlayStatus,
    ) -> RgbImage {
        let mut canvas = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone())
            .unwrap_or_else(|| RgbImage::new(frame.width, frame.height));

        if let Some(result) = result {
            for det in &result.detections {
                self.draw_detection(&mut canvas, det);
            }
        }
        self.draw_status(&mut canvas, result, status);
        canvas
    }

    fn draw_detection(&self, canvas: &mut RgbImage, det: &crate::detect::Detection) {
        let (w, h) = (canvas.width() as i32, canvas.height() as i32);
        let x1 = (det.bbox[0] as i32).clamp(0, w - 1);
        let y1 = (det.bbox[1] as i32).clamp(0, h - 1);
        let x2 = (det.bbox[2] as i32).clamp(0, w - 1);
        let y2 = (det.bbox[3] as i32).clamp(0, h - 1);
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        // Thickness scales with confidence, as the operators expect.
        let thickness = ((det.confidence * 3.0) as i32).max(1);
        for t in 0..thickness {
            let rect_w = (x2 - x1 - 2 * t).max(1) as u32;
            let rect_h = (y2 - y1 - 2 * t).max(1) as u32;
            let rect = Rect::at(x1 + t, y1 + t).of_size(rect_w, rect_h);
            draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
        }

        if let Some(font) = &self.font {
            let label = format!("{} {:.2}", det.class_name, det.confidence);
            let label_w = (label.len() as u32) * (TEXT_SCALE as u32) / 2 + 8;
            let label_h = TEXT_SCALE as u32 + 6;
            let label_y = (y1 - label_h as i32).max(0);
            draw_filled_rect_mut(
                canvas,
                Rect::at(x1, label_y).of_size(label_w, label_h),
                BOX_COLOR,
            );
            draw_text_mut(
                canvas,
                LABEL_TEXT_COLOR,
                x1 + 4,
                label_y + 2,
                PxScale::from(TEXT_SCALE),
                font,
                &label,
            );
        }
    }

    fn draw_status(
        &self,
        canvas: &mut RgbImage,
        result: Option<&DetectionResult>,
        status: &OverlayStatus,
    ) {
        // Connection indicator renders even without a font, so the
        // "disconnected" state is always visible.
        let indicator = match status.connection {
            ConnectionState::Connected => STATUS_OK_COLOR,
            ConnectionState::Connecting => STATUS_WARN_COLOR,
            ConnectionState::Disconnected | ConnectionState::Failed => STATUS_BAD_COLOR,
        };
        let side = 12u32.min(canvas.width()).min(canvas.height());
        if side > 0 {
            draw_filled_rect_mut(canvas, Rect::at(6, 6).of_size(side, side), indicator);
        }

        let Some(font) = &self.font else {
            return;
        };
        let detections_now = result.map(|r| r.len()).unwrap_or(0);
        let lines = [
            (format!("FPS: {:.1}", status.fps), STATUS_OK_COLOR),
            (format!("Frame: {}", status.frame_count), STATUS_OK_COLOR),
            (
                format!("Status: {:?}", status.connection),
                match status.connection {
                    ConnectionState::Connected => STATUS_OK_COLOR,
                    _ => STATUS_BAD_COLOR,
                },
            ),
            (
                format!(
                    "Detections: {} (total {})",
                    detections_now, status.detection_count
                ),
                INFO_COLOR,
            ),
            ("Q: Quit, S: Save".to_string(), INFO_COLOR),
            (format!("Source: {}", status.source_label), INFO_COLOR),
        ];
        let scale = PxScale::from(TEXT_SCALE);
        for (i, (text, color)) in lines.iter().enumerate() {
            let y = 26 + (i as i32) * LINE_HEIGHT;
            draw_text_mut(canvas, *color, 24, y, scale, font, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![10u8; (width * height * 3) as usize], width, height, 1)
    }

    fn status(connection: ConnectionState) -> OverlayStatus {
        OverlayStatus {
            fps: 29.7,
            frame_count: 120,
            detection_count: 4,
            connection,
            source_label: "stub://test".to_string(),
        }
    }

    fn detection(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            class_id: 16,
            class_name: "dog".to_string(),
            confidence,
            bbox,
            center_x: (bbox[0] + bbox[2]) / 2.0,
            center_y: (bbox[1] + bbox[3]) / 2.0,
        }
    }

    #[test]
    fn renders_box_at_expected_pixels() {
        let compositor = Compositor::new(None);
        let frame = test_frame(200, 200);
        let result = DetectionResult {
            detections: vec![detection([50.0, 60.0, 150.0, 160.0], 0.2)],
            frame_id: "frame_1".to_string(),
            ..DetectionResult::default()
        };

        let out = compositor.render(&frame, Some(&result), &status(ConnectionState::Connected));
        // Box edges carry the box color; the interior keeps frame pixels.
        assert_eq!(*out.get_pixel(50, 60), BOX_COLOR);
        assert_eq!(*out.get_pixel(150, 60), BOX_COLOR);
        assert_eq!(*out.get_pixel(50, 160), BOX_COLOR);
        assert_eq!(*out.get_pixel(100, 100), Rgb([10, 10, 10]));
    }

    #[test]
    fn high_confidence_draws_thicker_edges() {
        let compositor = Compositor::new(None);
        let frame = test_frame(200, 200);
        let result = DetectionResult {
            detections: vec![detection([50.0, 60.0, 150.0, 160.0], 0.95)],
            ..DetectionResult::default()
        };

        let out = compositor.render(&frame, Some(&result), &status(ConnectionState::Connected));
        // confidence 0.95 → thickness 2: one pixel inset is also colored.
        assert_eq!(*out.get_pixel(51, 61), BOX_COLOR);
    }

    #[test]
    fn no_result_renders_frame_with_status_only() {
        let compositor = Compositor::new(None);
        let frame = test_frame(64, 64);
        let out = compositor.render(&frame, None, &status(ConnectionState::Connected));
        // Away from the status indicator the frame is untouched.
        assert_eq!(*out.get_pixel(40, 40), Rgb([10, 10, 10]));
    }

    #[test]
    fn disconnected_state_is_visible_without_a_font() {
        let compositor = Compositor::new(None);
        let frame = test_frame(64, 64);
        let out = compositor.render(&frame, None, &status(ConnectionState::Failed));
        assert_eq!(*out.get_pixel(8, 8), STATUS_BAD_COLOR);

        let out = compositor.render(&frame, None, &status(ConnectionState::Connected));
        assert_eq!(*out.get_pixel(8, 8), STATUS_OK_COLOR);
    }

    #[test]
    fn out_of_frame_boxes_are_clamped_not_panicking() {
        let compositor = Compositor::new(None);
        let frame = test_frame(64, 64);
        let result = DetectionResult {
            detections: vec![detection([-20.0, -20.0, 500.0, 500.0], 0.9)],
            ..DetectionResult::default()
        };
        let out = compositor.render(&frame, Some(&result), &status(ConnectionState::Connected));
        assert_eq!(out.width(), 64);
    }

    #[test]
    fn missing_font_path_disables_labels() {
        let compositor = Compositor::new(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!compositor.has_font());
    }
}
