//! Detection results as cached and rendered by the pipeline.
//!
//! A `DetectionResult` is created from a detector response and held as
//! "current" until a newer one replaces it. It is never mutated after
//! creation; staleness is handled by replacement, not by editing.

use std::time::Duration;

/// A single detected object in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub class_name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Box corners `(x1, y1)` top-left, `(x2, y2)` bottom-right.
    pub bbox: [f32; 4],
    pub center_x: f32,
    pub center_y: f32,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

/// One completed round trip to the detector.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    /// Identifier of the frame this result was computed from.
    pub frame_id: String,
    /// Remote inference time reported by the detector.
    pub processing_time: Duration,
    /// Detector-side completion timestamp (epoch seconds).
    pub timestamp: f64,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_box_extent() {
        let det = Detection {
            class_id: 16,
            class_name: "dog".to_string(),
            confidence: 0.9,
            bbox: [10.0, 20.0, 110.0, 80.0],
            center_x: 60.0,
            center_y: 50.0,
        };
        assert_eq!(det.width(), 100.0);
        assert_eq!(det.height(), 60.0);
    }
}
