//! Captured frames and the single-writer handoff slots between loops.
//!
//! Frames flow one way: capture loop → `LatestSlot<Frame>` → scheduler →
//! channel; results flow channel → `LatestSlot<DetectionResult>` →
//! compositor. Each slot has exactly one writer component; readers always
//! observe either the previous or the next fully-formed value because the
//! slot swaps a whole `Arc`.

use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// An immutable RGB8 frame with a monotonically increasing sequence number.
///
/// Pixel data is tightly packed, `width * height * 3` bytes, row-major.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Packed RGB8 pixels.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture order. Strictly increasing within a pipeline run.
    pub seq: u64,
    /// Monotonic capture instant, for staleness decisions.
    pub captured_at: Instant,
    /// Wall-clock capture time in epoch seconds, for the wire.
    pub captured_epoch: f64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            seq,
            captured_at: Instant::now(),
            captured_epoch: epoch_seconds(),
        }
    }

    /// Wire identifier for this frame.
    pub fn frame_id(&self) -> String {
        format!("frame_{}", self.seq)
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Single-writer, many-reader "most recent value" cell.
///
/// `publish` replaces the stored value; `latest` hands out a cheap `Arc`
/// clone of whatever is current. There is no queue: a slow reader sees
/// values skipped, never backlogged (bounded staleness over backlog).
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Replace the current value. Called only by the owning writer.
    pub fn publish(&self, value: T) {
        self.publish_arc(Arc::new(value));
    }

    /// Replace the current value with an already-shared one, so the writer
    /// can keep reading the same allocation it just published.
    pub fn publish_arc(&self, value: Arc<T>) {
        let mut guard = self.inner.lock().expect("latest slot poisoned");
        *guard = Some(value);
    }

    /// The most recent value, if any has been published yet.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.inner.lock().expect("latest slot poisoned").clone()
    }

    /// Conditional read: the latest value only if `admit` accepts it.
    ///
    /// Lets the scheduler pull "a frame I have not submitted yet" without
    /// consuming anything the compositor still needs.
    pub fn latest_if<F>(&self, admit: F) -> Option<Arc<T>>
    where
        F: FnOnce(&T) -> bool,
    {
        let guard = self.inner.lock().expect("latest slot poisoned");
        match guard.as_ref() {
            Some(value) if admit(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
