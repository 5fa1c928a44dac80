//! Lookout: a realtime camera client with remote detection.
//!
//! Frames are captured and displayed at one rate while a remote detector
//! is consulted at a slower rate over a persistent WebSocket; detection
//! results overlay the live video.
//!
//! # Architecture
//!
//! The pipeline holds four invariants by construction:
//!
//! 1. **Display never blocks on the network**: the capture/display loop
//!    reads only in-memory slots; all socket traffic happens on the
//!    detection side.
//! 2. **Bounded staleness over backlog**: frames and results are handed
//!    off through single-value slots, never queues. A slow consumer sees
//!    values skipped, not delayed.
//! 3. **Stale-but-valid overlay**: a failed detection cycle keeps the
//!    cached result on screen; only a newer result replaces it.
//! 4. **Bounded reconnection**: connection attempts retry a fixed number
//!    of times with a fixed delay, then the pipeline keeps rendering with
//!    a visible disconnected status while reconnects continue in the
//!    background.
//!
//! # Module Structure
//!
//! - `config`: layered configuration (defaults, JSON file, env overrides)
//! - `source`: frame capture (devices, streams, synthetic stub)
//! - `frame`: frame type and the single-writer handoff slots
//! - `channel`: the detector connection, its worker thread, and the wire
//!   protocol
//! - `detect`: detection result types
//! - `scheduler`: detection cadence and submission policy
//! - `compositor`: overlay rendering
//! - `pipeline`: the two loops and their lifecycle

pub mod channel;
pub mod compositor;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod scheduler;
pub mod source;

pub use channel::{ConnectionState, ConnectionStatus, DetectionChannel};
pub use compositor::{Compositor, OverlayStatus};
pub use config::{DetectorSettings, DisplaySettings, PipelineConfig, SourceSettings};
pub use detect::{Detection, DetectionResult};
pub use error::{ChannelError, ConnectError, DecodeError, SourceError, TimeoutPhase};
pub use frame::{Frame, LatestSlot};
pub use pipeline::{
    DisplaySink, NullSink, OperatorCommand, PipelineController, PipelineHandle, PipelineStats,
};
pub use scheduler::{DetectionScheduler, DetectionTransport, SchedulerPhase};
pub use source::{FrameSource, SourceKind, SyntheticSource};
