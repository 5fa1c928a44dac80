//! Detector wire protocol.
//!
//! JSON text messages over the WebSocket, matching the deployed detector
//! service:
//!
//! - request: `{ "type": "detection_request", "image": <base64 jpeg>,
//!   "frame_id": "frame_N", "timestamp": <epoch seconds> }`
//! - response: `{ "type": "detection_response", "frame_id": ...,
//!   "detections": [...], "processing_time": ..., "timestamp": ... }`,
//!   or the error envelope with the payload nested under `data`
//! - liveness: `{ "type": "ping", "timestamp" }` / `{ "type": "pong", ... }`
//!
//! Frames are compressed to JPEG at a moderate quality before transmission.
//! This is a bandwidth/latency trade-off, not a fidelity requirement.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::detect::{Detection, DetectionResult};
use crate::error::DecodeError;
use crate::frame::{epoch_seconds, Frame};

/// Outgoing detection request.
#[derive(Debug, Serialize)]
pub struct DetectionRequest {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    /// Base64-encoded JPEG of the frame.
    pub image: String,
    /// Monotonic frame identifier (`frame_N`).
    pub frame_id: String,
    /// Send timestamp in epoch seconds.
    pub timestamp: f64,
}

impl DetectionRequest {
    /// Encode a frame into a ready-to-send request.
    pub fn from_frame(frame: &Frame, jpeg_quality: u8) -> Result<Self, DecodeError> {
        let jpeg = encode_jpeg(frame, jpeg_quality)?;
        Ok(Self {
            msg_type: "detection_request",
            image: BASE64.encode(jpeg),
            frame_id: frame.frame_id(),
            timestamp: epoch_seconds(),
        })
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outgoing liveness ping.
#[derive(Debug, Serialize)]
pub struct Ping {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub timestamp: f64,
}

impl Ping {
    pub fn now() -> Self {
        Self {
            msg_type: "ping",
            timestamp: epoch_seconds(),
        }
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outgoing liveness pong, answering a detector-initiated ping.
#[derive(Debug, Serialize)]
pub struct Pong {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub timestamp: f64,
}

impl Pong {
    pub fn now() -> Self {
        Self {
            msg_type: "pong",
            timestamp: epoch_seconds(),
        }
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Any message the detector may send us, dispatched on the `type` tag.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Incoming {
    #[serde(rename = "detection_response")]
    DetectionResponse(ResponseBody),
    #[serde(rename = "pong")]
    Pong { timestamp: f64 },
    #[serde(rename = "ping")]
    Ping { timestamp: f64 },
}

/// Body of a `detection_response`.
///
/// The detector uses two shapes: fields at the top level on success, or an
/// `error` string with the (empty) payload nested under `data`. All fields
/// are optional here; `into_result` resolves the shape.
#[derive(Debug, Default, Deserialize)]
pub struct ResponseBody {
    pub frame_id: Option<String>,
    #[serde(default)]
    pub detections: Option<Vec<WireDetection>>,
    pub processing_time: Option<f64>,
    pub timestamp: Option<f64>,
    pub error: Option<String>,
    pub data: Option<Box<ResponseBody>>,
}

impl ResponseBody {
    /// Resolve the response into a `DetectionResult`.
    ///
    /// An error envelope is surfaced as `DecodeError::Remote`; the caller
    /// treats the request as failed and keeps its cached result.
    pub fn into_result(self) -> Result<DetectionResult, DecodeError> {
        if let Some(message) = self.error {
            return Err(DecodeError::Remote(message));
        }
        let body = match self.data {
            // Some deployments nest the payload even on success.
            Some(inner) if self.detections.is_none() => *inner,
            _ => self,
        };
        let detections = body
            .detections
            .unwrap_or_default()
            .into_iter()
            .map(WireDetection::into_detection)
            .collect();
        Ok(DetectionResult {
            detections,
            frame_id: body.frame_id.unwrap_or_default(),
            processing_time: Duration::from_secs_f64(
                body.processing_time.unwrap_or(0.0).max(0.0),
            ),
            timestamp: body.timestamp.unwrap_or(0.0),
        })
    }
}

/// One detection as serialized by the detector.
#[derive(Debug, Deserialize)]
pub struct WireDetection {
    #[serde(default)]
    pub class_id: i64,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixel coordinates.
    #[serde(default)]
    pub bbox: Vec<f32>,
    #[serde(default)]
    pub center_x: f32,
    #[serde(default)]
    pub center_y: f32,
}

impl WireDetection {
    fn into_detection(self) -> Detection {
        let mut bbox = [0.0f32; 4];
        for (slot, value) in bbox.iter_mut().zip(self.bbox.iter()) {
            *slot = *value;
        }
        Detection {
            class_id: self.class_id,
            class_name: self.class_name,
            confidence: self.confidence.clamp(0.0, 1.0),
            bbox,
            center_x: self.center_x,
            center_y: self.center_y,
        }
    }
}

/// Parse a raw text message from the detector.
pub fn parse_incoming(payload: &str) -> Result<Incoming, DecodeError> {
    Ok(serde_json::from_str(payload)?)
}

/// JPEG-compress a frame's pixels.
fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            &frame.pixels,
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| DecodeError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE_OK: &str = r#"{
        "type": "detection_response",
        "frame_id": "frame_12",
        "detections": [
            {
                "class_id": 16,
                "class_name": "dog",
                "confidence": 0.87,
                "bbox": [40.0, 60.0, 200.0, 220.0],
                "center_x": 120.0,
                "center_y": 140.0
            }
        ],
        "processing_time": 0.124,
        "timestamp": 1700000000.5
    }"#;

    const RESPONSE_ERROR: &str = r#"{
        "type": "detection_response",
        "error": "model not loaded",
        "data": {
            "frame_id": "frame_13",
            "detections": [],
            "processing_time": 0,
            "timestamp": 0
        }
    }"#;

    #[test]
    fn parses_successful_response() {
        let Incoming::DetectionResponse(body) = parse_incoming(RESPONSE_OK).unwrap() else {
            panic!("expected detection_response");
        };
        let result = body.into_result().unwrap();
        assert_eq!(result.frame_id, "frame_12");
        assert_eq!(result.len(), 1);
        assert_eq!(result.detections[0].class_name, "dog");
        assert_eq!(result.detections[0].bbox, [40.0, 60.0, 200.0, 220.0]);
        assert!((result.processing_time.as_secs_f64() - 0.124).abs() < 1e-9);
    }

    #[test]
    fn error_envelope_becomes_remote_error() {
        let Incoming::DetectionResponse(body) = parse_incoming(RESPONSE_ERROR).unwrap() else {
            panic!("expected detection_response");
        };
        let err = body.into_result().unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
    }

    #[test]
    fn liveness_messages_carry_their_tags() {
        let ping: serde_json::Value =
            serde_json::from_str(&Ping::now().to_json().unwrap()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping["timestamp"].is_number());

        let pong: serde_json::Value =
            serde_json::from_str(&Pong::now().to_json().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].is_number());
    }

    #[test]
    fn pong_is_dispatched_on_type_tag() {
        let msg = parse_incoming(r#"{"type": "pong", "timestamp": 12.5}"#).unwrap();
        assert!(matches!(msg, Incoming::Pong { .. }));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(parse_incoming("{not json").is_err());
    }

    #[test]
    fn request_round_trips_through_jpeg() {
        let frame = Frame::new(vec![128u8; 16 * 16 * 3], 16, 16, 5);
        let request = DetectionRequest::from_frame(&frame, 70).unwrap();
        assert_eq!(request.frame_id, "frame_5");
        assert_eq!(request.msg_type, "detection_request");

        let jpeg = BASE64.decode(&request.image).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn request_json_has_expected_fields() {
        let frame = Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, 1);
        let json = DetectionRequest::from_frame(&frame, 70)
            .unwrap()
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "detection_request");
        assert_eq!(value["frame_id"], "frame_1");
        assert!(value["image"].is_string());
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn short_bbox_is_padded_not_rejected() {
        let wire = WireDetection {
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 1.4,
            bbox: vec![1.0, 2.0],
            center_x: 0.0,
            center_y: 0.0,
        };
        let det = wire.into_detection();
        assert_eq!(det.bbox, [1.0, 2.0, 0.0, 0.0]);
        assert_eq!(det.confidence, 1.0);
    }
}
