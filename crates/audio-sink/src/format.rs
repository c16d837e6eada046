//! Audio format descriptions shared by the resolver, the processing stages and the sink.
//!
//! All PCM data is little-endian and interleaved. Compressed encodings are carried as
//! opaque access units and only ever reach the device in offload or passthrough mode.

use std::fmt;

use serde::Serialize;

/// Sample encoding of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Pcm8,
    Pcm16,
    Pcm24,
    Pcm32,
    PcmFloat,
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
    Aac,
    Mp3,
    Opus,
}

impl Encoding {
    /// Whether this is a linear PCM encoding.
    pub fn is_pcm(self) -> bool {
        matches!(
            self,
            Encoding::Pcm8 | Encoding::Pcm16 | Encoding::Pcm24 | Encoding::Pcm32 | Encoding::PcmFloat
        )
    }

    /// PCM encodings with more precision than 16-bit integer.
    pub fn is_high_resolution_pcm(self) -> bool {
        matches!(self, Encoding::Pcm24 | Encoding::Pcm32 | Encoding::PcmFloat)
    }

    /// Bytes per sample for PCM encodings, `None` for compressed ones.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            Encoding::Pcm8 => Some(1),
            Encoding::Pcm16 => Some(2),
            Encoding::Pcm24 => Some(3),
            Encoding::Pcm32 | Encoding::PcmFloat => Some(4),
            _ => None,
        }
    }

    /// Upper bound of the encoded bitrate in bytes per second (compressed encodings only).
    pub fn max_bytes_per_second(self) -> Option<u64> {
        let kbps: u64 = match self {
            Encoding::Ac3 => 640,
            Encoding::Eac3 => 6_144,
            Encoding::Dts => 1_536,
            Encoding::DtsHd => 18_000,
            Encoding::TrueHd => 24_500,
            Encoding::Aac => 800,
            Encoding::Mp3 => 320,
            Encoding::Opus => 510,
            _ => return None,
        };
        Some(kbps * 1000 / 8)
    }

    /// Decoded frames carried by one access unit of a compressed encoding.
    pub fn default_frames_per_access_unit(self) -> Option<u32> {
        match self {
            Encoding::Ac3 | Encoding::Eac3 => Some(1536),
            Encoding::Dts | Encoding::DtsHd => Some(512),
            Encoding::TrueHd => Some(640),
            Encoding::Aac => Some(1024),
            Encoding::Mp3 => Some(1152),
            Encoding::Opus => Some(960),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Pcm8 => "pcm_u8",
            Encoding::Pcm16 => "pcm_s16le",
            Encoding::Pcm24 => "pcm_s24le",
            Encoding::Pcm32 => "pcm_s32le",
            Encoding::PcmFloat => "pcm_f32le",
            Encoding::Ac3 => "ac3",
            Encoding::Eac3 => "eac3",
            Encoding::Dts => "dts",
            Encoding::DtsHd => "dts_hd",
            Encoding::TrueHd => "truehd",
            Encoding::Aac => "aac",
            Encoding::Mp3 => "mp3",
            Encoding::Opus => "opus",
        };
        f.write_str(name)
    }
}

/// Format of the stream handed to the sink by the decoder side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Frames to drop from the start of the stream (gapless playback).
    pub encoder_delay: u32,
    /// Frames to drop from the end of the stream (gapless playback).
    pub encoder_padding: u32,
    /// Overrides [`Encoding::default_frames_per_access_unit`] for compressed input.
    pub frames_per_access_unit: Option<u32>,
}

impl AudioFormat {
    /// Linear PCM format without gapless metadata.
    pub fn pcm(encoding: Encoding, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channel_count,
            encoder_delay: 0,
            encoder_padding: 0,
            frames_per_access_unit: None,
        }
    }

    /// Compressed format delivered in access units.
    pub fn encoded(encoding: Encoding, sample_rate: u32, channel_count: u16) -> Self {
        Self::pcm(encoding, sample_rate, channel_count)
    }

    pub fn with_gapless(mut self, encoder_delay: u32, encoder_padding: u32) -> Self {
        self.encoder_delay = encoder_delay;
        self.encoder_padding = encoder_padding;
        self
    }

    /// Bytes per interleaved frame, `None` for compressed encodings.
    pub fn pcm_frame_size(&self) -> Option<usize> {
        self.encoding
            .bytes_per_sample()
            .map(|bps| bps * self.channel_count as usize)
    }

    pub(crate) fn pcm_spec(&self) -> PcmSpec {
        PcmSpec::new(self.sample_rate, self.channel_count, self.encoding)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.encoding, self.sample_rate, self.channel_count)
    }
}

/// PCM shape passed between processing stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub encoding: Encoding,
}

impl PcmSpec {
    pub fn new(sample_rate: u32, channel_count: u16, encoding: Encoding) -> Self {
        Self {
            sample_rate,
            channel_count,
            encoding,
        }
    }

    /// Bytes per interleaved frame (zero for compressed encodings).
    pub fn frame_size(&self) -> usize {
        self.encoding.bytes_per_sample().unwrap_or(0) * self.channel_count as usize
    }
}

impl fmt::Display for PcmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.encoding, self.sample_rate, self.channel_count)
    }
}

/// Convert a frame count at `sample_rate` to microseconds.
pub fn frames_to_duration_us(frames: u64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    ((frames as u128 * 1_000_000) / sample_rate as u128) as i64
}

/// Convert microseconds to a frame count at `sample_rate` (negative durations clamp to zero).
pub fn duration_us_to_frames(duration_us: i64, sample_rate: u32) -> u64 {
    if duration_us <= 0 {
        return 0;
    }
    ((duration_us as u128 * sample_rate as u128) / 1_000_000) as u64
}
