//! Synthetic capture backend for tests and demos.
//!
//! Generates a flat background with a bright square orbiting the frame, so
//! overlay rendering has something recognizable to draw on. A descriptor of
//! the form `stub://fail-after-N` produces N good frames and then fails
//! every read, which is how tests exercise the failure threshold.

use super::CaptureBackend;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_count: u64,
    fail_after: Option<u64>,
}

impl SyntheticSource {
    pub fn new(name: String, width: u32, height: u32) -> Self {
        let fail_after = name
            .strip_prefix("fail-after-")
            .and_then(|n| n.parse::<u64>().ok());
        Self {
            name,
            width,
            height,
            frame_count: 0,
            fail_after,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![32u8; w * h * 3];

        // Square size and orbit derived from frame dimensions.
        let side = (w.min(h) / 4).max(1);
        let steps = (w - side).max(1) as u64;
        let x0 = (self.frame_count % steps) as usize;
        let y0 = (h - side) / 2;

        for y in y0..(y0 + side).min(h) {
            for x in x0..(x0 + side).min(w) {
                let i = (y * w + x) * 3;
                pixels[i] = 220;
                pixels[i + 1] = 180;
                pixels[i + 2] = 60;
            }
        }
        pixels
    }
}

impl CaptureBackend for SyntheticSource {
    fn read_raw(&mut self) -> Result<(Vec<u8>, u32, u32), String> {
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(format!("synthetic source '{}' exhausted", self.name));
            }
        }
        let pixels = self.render();
        self.frame_count += 1;
        Ok((pixels, self.width, self.height))
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_of_requested_size() {
        let mut source = SyntheticSource::new("demo".to_string(), 32, 24);
        let (pixels, w, h) = source.read_raw().unwrap();
        assert_eq!((w, h), (32, 24));
        assert_eq!(pixels.len(), 32 * 24 * 3);
    }

    #[test]
    fn square_moves_between_frames() {
        let mut source = SyntheticSource::new("demo".to_string(), 32, 24);
        let (a, _, _) = source.read_raw().unwrap();
        let (b, _, _) = source.read_raw().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fail_after_descriptor_exhausts() {
        let mut source = SyntheticSource::new("fail-after-2".to_string(), 8, 8);
        assert!(source.read_raw().is_ok());
        assert!(source.read_raw().is_ok());
        assert!(source.read_raw().is_err());
        assert!(source.read_raw().is_err());
    }
}
