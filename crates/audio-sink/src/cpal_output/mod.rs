//! CPAL-backed device driver.
//!
//! Plays 16-bit or float PCM on a host output device. Compressed output is not
//! supported, so the sink never chooses offload or passthrough with this driver.
//! Device discovery uses `anyhow` internally; failures reach the sink as [`DeviceError`].

mod queue;
mod stream;

pub use queue::OutputBuffer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::clock::Clock;
use crate::device::{AudioDevice, AudioDriver, DeviceCapabilities, DeviceConfig, DeviceTimestamp};
use crate::error::DeviceError;
use crate::format::{AudioFormat, Encoding, duration_us_to_frames};
use crate::resolver::OutputMode;

use self::stream::{StreamCommand, StreamHandle, StreamRequest, spawn_stream};

/// Duration reported as the minimum PCM buffer.
const MIN_BUFFER_DURATION_US: i64 = 20_000;
/// Channel count assumed when the device cannot be queried.
const FALLBACK_MAX_CHANNELS: u16 = 2;

const ERROR_OPEN: i32 = -1;
const ERROR_BAD_VALUE: i32 = -2;

/// Opens [`CpalDevice`]s on the default host.
pub struct CpalDriver {
    device_name: Option<String>,
    clock: Arc<dyn Clock>,
    next_session_id: AtomicU32,
}

impl CpalDriver {
    /// `device_name` selects an output by case-insensitive substring; `None` uses the
    /// default device. `clock` must be the clock the sink uses.
    pub fn new(device_name: Option<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_name,
            clock,
            next_session_id: AtomicU32::new(1),
        }
    }

    fn device(&self) -> Result<cpal::Device> {
        pick_device(&cpal::default_host(), self.device_name.as_deref())
    }
}

impl DeviceCapabilities for CpalDriver {
    fn is_encoding_supported(&self, encoding: Encoding) -> bool {
        matches!(encoding, Encoding::Pcm16 | Encoding::PcmFloat)
    }

    fn max_channel_count(&self, _encoding: Encoding) -> u16 {
        let max = self.device().and_then(|device| {
            let ranges = device.supported_output_configs()?;
            Ok(ranges.map(|r| r.channels()).max().unwrap_or(0))
        });
        match max {
            Ok(max) if max > 0 => max,
            Ok(_) => FALLBACK_MAX_CHANNELS,
            Err(err) => {
                tracing::debug!("cannot query output channels: {err:#}");
                FALLBACK_MAX_CHANNELS
            }
        }
    }

    fn is_offload_supported(&self, _format: &AudioFormat) -> bool {
        false
    }

    fn min_buffer_size(&self, sample_rate: u32, channel_count: u16, encoding: Encoding) -> usize {
        let frames = duration_us_to_frames(MIN_BUFFER_DURATION_US, sample_rate) as usize;
        frames * channel_count as usize * encoding.bytes_per_sample().unwrap_or(2)
    }
}

impl AudioDriver for CpalDriver {
    fn open(&mut self, config: &DeviceConfig) -> Result<Box<dyn AudioDevice>, DeviceError> {
        if config.mode != OutputMode::Pcm || !self.is_encoding_supported(config.encoding) {
            return Err(DeviceError::new(
                ERROR_BAD_VALUE,
                format!("unsupported output {:?} {}", config.mode, config.encoding),
            ));
        }
        let frame_size = config
            .encoding
            .bytes_per_sample()
            .map(|bps| bps * config.channel_count as usize)
            .filter(|&f| f > 0)
            .ok_or_else(|| DeviceError::new(ERROR_BAD_VALUE, "zero frame size"))?;

        let capacity_frames = (config.buffer_size / frame_size).max(1);
        let buffer = Arc::new(OutputBuffer::new(
            config.channel_count as usize,
            capacity_frames,
            self.clock.clone(),
        ));
        let request = StreamRequest {
            device_name: self.device_name.clone(),
            sample_rate: config.sample_rate,
            channels: config.channel_count,
        };
        let stream = spawn_stream(request, buffer.clone())
            .map_err(|err| DeviceError::new(ERROR_OPEN, format!("{err:#}")))?;

        let session_id = config
            .session_id
            .unwrap_or_else(|| self.next_session_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(session_id, capacity_frames, "cpal device opened");
        Ok(Box::new(CpalDevice {
            buffer,
            stream: Some(stream),
            encoding: config.encoding,
            frame_size,
            session_id,
            scratch: Vec::new(),
        }))
    }
}

/// An open CPAL output stream fed through an [`OutputBuffer`].
pub struct CpalDevice {
    buffer: Arc<OutputBuffer>,
    stream: Option<StreamHandle>,
    encoding: Encoding,
    frame_size: usize,
    session_id: u32,
    scratch: Vec<f32>,
}

impl CpalDevice {
    fn send(&self, command: StreamCommand) {
        if let Some(stream) = &self.stream {
            stream.send(command);
        }
    }
}

impl AudioDevice for CpalDevice {
    fn write_non_blocking(
        &mut self,
        data: &[u8],
        _av_sync_time_us: Option<i64>,
    ) -> Result<usize, DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::dead(ERROR_OPEN, "stream closed"));
        }
        let free_frames = self
            .buffer
            .capacity_frames()
            .saturating_sub(self.buffer.len_frames());
        let frames = (data.len() / self.frame_size).min(free_frames);
        if frames == 0 {
            return Ok(0);
        }
        let bytes = &data[..frames * self.frame_size];
        decode_samples(bytes, self.encoding, &mut self.scratch);
        let pushed = self.buffer.push_frames(&self.scratch);
        Ok(pushed * self.frame_size)
    }

    fn consumed_frames(&self) -> u64 {
        self.buffer.consumed_frames()
    }

    fn timestamp(&self) -> Option<DeviceTimestamp> {
        self.buffer.timestamp()
    }

    fn play(&mut self) {
        self.buffer.set_paused(false);
        self.send(StreamCommand::Play);
    }

    fn pause(&mut self) {
        self.buffer.set_paused(true);
        self.send(StreamCommand::Pause);
    }

    fn stop(&mut self) {
        // The callback keeps draining what is queued and then plays silence.
        tracing::debug!(
            queued_frames = self.buffer.len_frames(),
            underruns = self.buffer.underrun_events(),
            "cpal device stopping"
        );
    }

    fn flush(&mut self) {
        self.buffer.clear();
    }

    fn set_volume(&mut self, volume: f32) {
        self.buffer.set_volume(volume);
    }

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn release(mut self: Box<Self>) {
        self.buffer.set_paused(true);
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }
}

/// Convert little-endian PCM bytes to `f32` samples.
fn decode_samples(bytes: &[u8], encoding: Encoding, out: &mut Vec<f32>) {
    out.clear();
    match encoding {
        Encoding::PcmFloat => out.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        ),
        _ => out.extend(
            bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0),
        ),
    }
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `rate` and `channels`.
///
/// Ranges containing the rate win, then matching channel counts, then sample formats
/// in the order f32, i32, i16, u16.
pub fn pick_output_config(
    device: &cpal::Device,
    rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let min = range.min_sample_rate();
        let max = range.max_sample_rate();
        let candidate = Candidate {
            rate_matches: rate >= min && rate <= max,
            channels_match: range.channels() == channels,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .is_none_or(|(b, _)| candidate.is_better_than(b));
        if replace {
            best = Some((candidate, range.with_sample_rate(rate.clamp(min, max))));
        }
    }
    best.map(|(_, config)| config)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed buffer size if the device advertises a range.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    rate_matches: bool,
    channels_match: bool,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.rate_matches != other.rate_matches {
            self.rate_matches
        } else if self.channels_match != other.channels_match {
            self.channels_match
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn candidate(rate_matches: bool, channels_match: bool, format_rank: u8) -> Candidate {
        Candidate {
            rate_matches,
            channels_match,
            format_rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", " "));
    }

    #[test]
    fn candidate_prefers_rate_then_channels_then_format() {
        assert!(candidate(true, false, 3).is_better_than(&candidate(false, true, 0)));
        assert!(candidate(true, true, 3).is_better_than(&candidate(true, false, 0)));
        assert!(candidate(true, true, 0).is_better_than(&candidate(true, true, 2)));
        assert!(!candidate(true, true, 2).is_better_than(&candidate(true, true, 2)));
    }

    #[test]
    fn decodes_int16_and_float() {
        let mut out = Vec::new();
        decode_samples(&[0x00, 0x40, 0x00, 0x80], Encoding::Pcm16, &mut out);
        assert_eq!(out, vec![0.5, -1.0]);
        decode_samples(&0.25f32.to_le_bytes(), Encoding::PcmFloat, &mut out);
        assert_eq!(out, vec![0.25]);
    }

    #[test]
    fn driver_reports_pcm_only() {
        let driver = CpalDriver::new(None, Arc::new(SystemClock::new()));
        assert!(driver.is_encoding_supported(Encoding::Pcm16));
        assert!(driver.is_encoding_supported(Encoding::PcmFloat));
        assert!(!driver.is_encoding_supported(Encoding::Ac3));
        assert!(!driver.is_offload_supported(&AudioFormat::encoded(Encoding::Ac3, 48_000, 6)));
        assert_eq!(driver.min_buffer_size(48_000, 2, Encoding::Pcm16), 960 * 4);
    }

    #[test]
    fn open_rejects_encoded_output() {
        let mut driver = CpalDriver::new(None, Arc::new(SystemClock::new()));
        let config = DeviceConfig {
            mode: OutputMode::Passthrough,
            encoding: Encoding::Ac3,
            sample_rate: 48_000,
            channel_count: 6,
            buffer_size: 32_000,
            session_id: None,
        };
        let err = driver.open(&config).err().unwrap();
        assert_eq!(err.code, ERROR_BAD_VALUE);
    }
}
