//! Error types for the capture and detection paths.
//!
//! Errors are split by recovery policy rather than by origin: a
//! `SourceError` decides whether the pipeline keeps reading or stops, a
//! `ConnectError` ends a bounded retry loop, and a `ChannelError` fails a
//! single detection cycle without touching the cached result.

use thiserror::Error;

/// Capture source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be opened at all.
    #[error("cannot open source {descriptor}: {reason}")]
    Open { descriptor: String, reason: String },

    /// A single read failed; the source is still under its threshold.
    #[error("frame read failed ({consecutive} consecutive)")]
    Read { consecutive: u32 },

    /// Consecutive failures crossed the threshold; the source is dead.
    #[error("source exhausted after {consecutive} consecutive read failures")]
    Exhausted { consecutive: u32 },

    /// A read was attempted before `open`.
    #[error("source is not open")]
    NotOpen,
}

/// Connection establishment failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint is not a usable WebSocket URL. Retrying cannot help.
    #[error("bad detector endpoint {endpoint}: {reason}")]
    BadEndpoint { endpoint: String, reason: String },

    /// One handshake attempt failed.
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// The bounded retry budget ran out.
    #[error("detector unreachable after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },
}

/// Which half of a detection exchange timed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    Send,
    Response,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Send => f.write_str("send"),
            TimeoutPhase::Response => f.write_str("response"),
        }
    }
}

/// A failed detection cycle.
///
/// None of these are fatal to the pipeline; the scheduler keeps the
/// cached result and tries again next interval.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The exchange overran its timeout. The connection is kept; the
    /// cycle is skipped and retried on the next tick.
    #[error("detection {phase} timed out")]
    Timeout { phase: TimeoutPhase },

    /// The connection is gone; the worker will reconnect on its own.
    #[error("detector connection closed")]
    Closed,

    /// No connection exists right now (never connected, or mid-reconnect).
    #[error("detector not connected")]
    NotConnected,

    /// The response could not be understood.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Wire-level encoding and decoding failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed detector message: {0}")]
    Json(#[from] serde_json::Error),

    /// The detector reported a failure on its side.
    #[error("detector error: {0}")]
    Remote(String),

    /// The outgoing frame could not be compressed.
    #[error("jpeg encode failed: {0}")]
    Encode(String),
}
