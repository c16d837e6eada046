//! Error taxonomy of the sink.
//!
//! Configuration and initialization failures are returned synchronously from
//! `configure` / the first `handle_buffer`. Write failures come back from
//! `handle_buffer` without tearing down sink state. Timestamp anomalies are only
//! escalated when the sink runs in strict diagnostic mode.

use thiserror::Error;

use crate::format::{AudioFormat, Encoding, PcmSpec};

/// A processing stage cannot handle the format it was configured with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} cannot handle {spec}: {reason}")]
pub struct UnhandledFormat {
    pub stage: &'static str,
    pub spec: PcmSpec,
    pub reason: String,
}

impl UnhandledFormat {
    pub fn new(stage: &'static str, spec: PcmSpec, reason: impl Into<String>) -> Self {
        Self {
            stage,
            spec,
            reason: reason.into(),
        }
    }
}

/// The requested format cannot be played in any output mode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("invalid format {format}: {reason}")]
    InvalidFormat { format: String, reason: String },

    #[error("unsupported configuration for {format}: no output mode accepts {encoding}")]
    Unsupported { format: String, encoding: Encoding },

    #[error("offload is required but not supported for {format}")]
    OffloadUnsupported { format: String },

    #[error("channel count {channels} exceeds device maximum {max} for {encoding}")]
    UnsupportedChannelCount {
        channels: u16,
        max: u16,
        encoding: Encoding,
    },

    #[error("invalid buffer size {0}")]
    InvalidBufferSize(usize),

    #[error("processing chain rejected format: {0}")]
    Processor(#[from] UnhandledFormat),
}

impl ConfigurationError {
    pub(crate) fn invalid(format: &AudioFormat, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            format: format.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a device driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    /// Driver specific error code (negative by convention).
    pub code: i32,
    /// The device handle is gone and cannot be written again.
    pub dead: bool,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            dead: false,
            message: message.into(),
        }
    }

    pub fn dead(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            dead: true,
            message: message.into(),
        }
    }
}

/// The device could not be opened for the current configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device init failed for {format} (recoverable: {recoverable}): {source}")]
pub struct InitializationError {
    pub format: String,
    /// Retrying with the same configuration may succeed.
    pub recoverable: bool,
    #[source]
    pub source: DeviceError,
}

/// A non-blocking device write failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device write failed for {format} (recoverable: {recoverable}): {source}")]
pub struct WriteError {
    pub format: String,
    /// The device was lost after data had been written; recreating it may help.
    pub recoverable: bool,
    #[source]
    pub source: DeviceError,
}

/// Kind of implausible hardware timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// Frame position or system time went backwards.
    NonMonotonic,
    /// The timestamp's system time is far from the current time.
    SystemTimeMismatch,
    /// The timestamp's frame position is far from the playback head.
    FramePositionMismatch,
    /// Frames advanced faster than wall-clock time allows.
    FasterThanWallClock,
}

/// A hardware timestamp was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "spurious device timestamp ({kind:?}): frame {frame_position}, system {system_time_us}us, \
     now {now_us}us, playhead {playhead_us}us"
)]
pub struct TimestampAnomaly {
    pub kind: AnomalyKind,
    pub frame_position: u64,
    pub system_time_us: i64,
    pub now_us: i64,
    pub playhead_us: i64,
}

/// Everything the sink can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    TimestampAnomaly(#[from] TimestampAnomaly),

    #[error("unexpected discontinuity: expected {expected_us}us, got {actual_us}us")]
    UnexpectedDiscontinuity { expected_us: i64, actual_us: i64 },

    #[error("invalid playback parameters: {0}")]
    InvalidParameters(String),

    #[error("sink is not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, SinkError>;
