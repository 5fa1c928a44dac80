//! Detection scheduling: decouples the capture cadence from the much
//! slower detection cadence.
//!
//! The scheduler runs inside the detection loop. On each tick it decides
//! whether to submit the freshest frame, based on the detection interval,
//! the connection state, and whether it already submitted that frame. It
//! never queues: if detection cannot keep pace with capture, older frames
//! are dropped, not backlogged. Freshness wins over completeness.
//!
//! Failures of a single attempt never escalate: the cached result stays
//! on screen (stale-but-valid) and the scheduler cools down for one
//! interval before trying again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::DetectionResult;
use crate::error::ChannelError;
use crate::frame::{Frame, LatestSlot};

/// Where the scheduler is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Waiting for the detection interval to elapse.
    Idle,
    /// Interval elapsed, but no frame newer than the last submission yet.
    AwaitingFrame,
    /// A request is in flight (the tick is inside `send_and_await`).
    Requesting,
    /// Last attempt failed or was skipped; waiting out one interval.
    Cooling,
}

/// The scheduler's view of the detection channel.
///
/// A trait seam so the scheduling policy is testable without sockets.
pub trait DetectionTransport {
    fn is_connected(&self) -> bool;
    fn send_and_await(&self, frame: &Frame) -> Result<DetectionResult, ChannelError>;
}

impl DetectionTransport for crate::channel::DetectionChannel {
    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    fn send_and_await(&self, frame: &Frame) -> Result<DetectionResult, ChannelError> {
        // Fully-qualified call picks the inherent method over this trait.
        crate::channel::DetectionChannel::send_and_await(self, frame)
    }
}

pub struct DetectionScheduler {
    interval: Duration,
    frame_slot: Arc<LatestSlot<Frame>>,
    result_slot: Arc<LatestSlot<DetectionResult>>,
    detection_count: Arc<AtomicU64>,
    phase: SchedulerPhase,
    last_attempt: Option<Instant>,
    last_submitted_seq: u64,
}

impl DetectionScheduler {
    pub fn new(
        interval: Duration,
        frame_slot: Arc<LatestSlot<Frame>>,
        result_slot: Arc<LatestSlot<DetectionResult>>,
        detection_count: Arc<AtomicU64>,
    ) -> Self {
        Self {
            interval,
            frame_slot,
            result_slot,
            detection_count,
            phase: SchedulerPhase::Idle,
            last_attempt: None,
            last_submitted_seq: 0,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// One scheduler tick.
    ///
    /// Issues at most one request, synchronously, so there is never more
    /// than one in flight. Returns true when a request was attempted.
    pub fn tick<T: DetectionTransport>(&mut self, transport: &T, now: Instant) -> bool {
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.interval {
                if self.phase != SchedulerPhase::Cooling {
                    self.phase = SchedulerPhase::Idle;
                }
                return false;
            }
        }

        if !transport.is_connected() {
            // Burn this cycle; the channel worker reconnects on its own
            // schedule and the cached overlay stays up meanwhile.
            self.last_attempt = Some(now);
            self.phase = SchedulerPhase::Cooling;
            return false;
        }

        let fresh = self
            .frame_slot
            .latest_if(|frame| frame.seq > self.last_submitted_seq);
        let Some(frame) = fresh else {
            self.phase = SchedulerPhase::AwaitingFrame;
            return false;
        };

        self.phase = SchedulerPhase::Requesting;
        self.last_attempt = Some(now);
        self.last_submitted_seq = frame.seq;

        match transport.send_and_await(&frame) {
            Ok(result) => {
                self.detection_count.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "detection updated: {} objects for {}",
                    result.len(),
                    result.frame_id
                );
                self.result_slot.publish(result);
                self.phase = SchedulerPhase::Idle;
            }
            Err(e) => {
                // Keep the stale result; blanking the overlay is worse.
                log::warn!("detection attempt failed: {e}");
                self.phase = SchedulerPhase::Cooling;
            }
        }
        true
    }
}
