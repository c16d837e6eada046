//! Device driver abstraction consumed by the sink.
//!
//! A driver opens devices and answers capability queries. A device accepts
//! non-blocking writes and reports how far playback has progressed.

use crate::error::DeviceError;
use crate::format::{AudioFormat, Encoding};
use crate::resolver::OutputMode;

/// Hardware timestamp: `frame_position` was played out at `system_time_us`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTimestamp {
    pub frame_position: u64,
    /// Same time base as the sink's [`Clock`](crate::clock::Clock).
    pub system_time_us: i64,
}

/// Parameters for opening a device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub mode: OutputMode,
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Device buffer size in bytes.
    pub buffer_size: usize,
    /// Reuse the audio session of a previous device when set.
    pub session_id: Option<u32>,
}

/// Static capabilities of an output.
pub trait DeviceCapabilities {
    fn is_encoding_supported(&self, encoding: Encoding) -> bool;

    fn max_channel_count(&self, encoding: Encoding) -> u16;

    fn is_offload_supported(&self, format: &AudioFormat) -> bool;

    /// Smallest buffer in bytes the device accepts for PCM with these parameters.
    fn min_buffer_size(&self, sample_rate: u32, channel_count: u16, encoding: Encoding) -> usize;
}

/// Opens output devices.
pub trait AudioDriver: DeviceCapabilities + Send {
    fn open(&mut self, config: &DeviceConfig) -> Result<Box<dyn AudioDevice>, DeviceError>;
}

/// An open output device.
///
/// Released on a background worker, hence `Send`.
pub trait AudioDevice: Send {
    /// Write as much of `data` as fits without blocking. Returns the bytes accepted.
    fn write_non_blocking(
        &mut self,
        data: &[u8],
        av_sync_time_us: Option<i64>,
    ) -> Result<usize, DeviceError>;

    /// Frames played out since the device was opened or last flushed.
    fn consumed_frames(&self) -> u64;

    /// Latest hardware timestamp, if the device provides one.
    fn timestamp(&self) -> Option<DeviceTimestamp>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Play out what was written, then stop.
    fn stop(&mut self);

    /// Discard written but unplayed data.
    fn flush(&mut self);

    fn set_volume(&mut self, volume: f32);

    fn session_id(&self) -> u32;

    /// Tear the device down. May block for a while.
    fn release(self: Box<Self>);
}
