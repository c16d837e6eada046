//! Output configuration: how a format reaches the device and how big the device buffer is.

use serde::Serialize;

use crate::config::{OffloadMode, SinkConfig};
use crate::device::{DeviceCapabilities, DeviceConfig};
use crate::error::ConfigurationError;
use crate::format::{AudioFormat, Encoding, PcmSpec, duration_us_to_frames, frames_to_duration_us};
use crate::pipeline::{ChainKind, ChainSet};

const PCM_BUFFER_MULTIPLICATION_FACTOR: usize = 4;
const MIN_PCM_BUFFER_DURATION_US: i64 = 250_000;
const MAX_PCM_BUFFER_DURATION_US: i64 = 750_000;
const PASSTHROUGH_BUFFER_DURATION_US: i64 = 250_000;
const OFFLOAD_BUFFER_DURATION_US: i64 = 50_000_000;

/// How audio reaches the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Linear PCM, possibly transformed by the processing chain.
    Pcm,
    /// The device decodes compressed audio itself.
    Offload,
    /// Compressed audio is forwarded unmodified to an external decoder.
    Passthrough,
}

/// Everything derived from one input format. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    pub input_format: AudioFormat,
    /// Input frame size in bytes, `None` for compressed input.
    pub input_pcm_frame_size: Option<usize>,
    pub output_mode: OutputMode,
    pub output_encoding: Encoding,
    pub output_sample_rate: u32,
    pub output_channel_count: u16,
    /// Output frame size in bytes, `None` for encoded output.
    pub output_pcm_frame_size: Option<usize>,
    /// Device buffer size in bytes.
    pub buffer_size: usize,
    /// The processing chain carrying PCM, `None` for encoded output.
    pub chain: Option<ChainKind>,
    /// Speed, pitch and silence skipping can be applied by the chain.
    pub chain_usable: bool,
    /// Decoded frames per access unit for encoded output, zero for PCM.
    pub frames_per_access_unit: u32,
}

impl Configuration {
    /// Whether a device opened for `other` can play this configuration too.
    pub fn is_compatible_with(&self, other: &Configuration) -> bool {
        self.output_mode == other.output_mode
            && self.output_encoding == other.output_encoding
            && self.output_sample_rate == other.output_sample_rate
            && self.output_channel_count == other.output_channel_count
            && self.output_pcm_frame_size == other.output_pcm_frame_size
    }

    pub fn input_frames_to_duration_us(&self, frames: u64) -> i64 {
        frames_to_duration_us(frames, self.input_format.sample_rate)
    }

    pub fn frames_to_duration_us(&self, frames: u64) -> i64 {
        frames_to_duration_us(frames, self.output_sample_rate)
    }

    pub fn duration_us_to_frames(&self, duration_us: i64) -> u64 {
        duration_us_to_frames(duration_us, self.output_sample_rate)
    }

    pub fn buffer_duration_us(&self) -> i64 {
        match (self.output_pcm_frame_size, self.output_encoding.max_bytes_per_second()) {
            (Some(frame_size), _) if frame_size > 0 => {
                self.frames_to_duration_us((self.buffer_size / frame_size) as u64)
            }
            (_, Some(bps)) if bps > 0 => (self.buffer_size as u128 * 1_000_000 / bps as u128) as i64,
            _ => 0,
        }
    }

    pub fn output_pcm_spec(&self) -> Option<PcmSpec> {
        self.output_pcm_frame_size.map(|_| {
            PcmSpec::new(self.output_sample_rate, self.output_channel_count, self.output_encoding)
        })
    }

    pub fn device_config(&self, session_id: Option<u32>) -> DeviceConfig {
        DeviceConfig {
            mode: self.output_mode,
            encoding: self.output_encoding,
            sample_rate: self.output_sample_rate,
            channel_count: self.output_channel_count,
            buffer_size: self.buffer_size,
            session_id,
        }
    }
}

/// How well a format can be played.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatSupport {
    /// Played as is.
    Supported,
    /// Played after conversion to 16-bit PCM.
    SupportedWithTranscoding,
    Unsupported,
}

/// Chooses the output mode and buffer size for an input format.
pub struct ConfigurationResolver<'a> {
    config: &'a SinkConfig,
    /// Offload failed earlier in this session.
    offload_disabled: bool,
}

impl<'a> ConfigurationResolver<'a> {
    pub fn new(config: &'a SinkConfig, offload_disabled: bool) -> Self {
        Self {
            config,
            offload_disabled,
        }
    }

    fn use_float_output(&self, format: &AudioFormat) -> bool {
        self.config.enable_float_output && format.encoding.is_high_resolution_pcm()
    }

    fn offload_allowed(&self) -> bool {
        self.config.offload_mode != OffloadMode::Disabled && !self.offload_disabled
    }

    /// Resolve `format` into a configuration.
    ///
    /// PCM input configures the chain it will run through once every check has passed;
    /// the chain's new format takes effect at its next flush. A rejected format leaves
    /// the chains untouched. A non-zero `specified_buffer_size` overrides the computed
    /// buffer size.
    pub fn resolve<C: DeviceCapabilities + ?Sized>(
        &self,
        format: &AudioFormat,
        specified_buffer_size: usize,
        capabilities: &C,
        chains: &mut ChainSet,
    ) -> Result<Configuration, ConfigurationError> {
        if format.sample_rate == 0 {
            return Err(ConfigurationError::invalid(format, "sample rate is zero"));
        }
        if format.channel_count == 0 {
            return Err(ConfigurationError::invalid(format, "no channels"));
        }

        let mut configuration = if format.encoding.is_pcm() {
            self.resolve_pcm(format, chains)?
        } else {
            self.resolve_encoded(format, capabilities)?
        };

        let max_channels = capabilities.max_channel_count(configuration.output_encoding);
        if configuration.output_channel_count > max_channels {
            return Err(ConfigurationError::UnsupportedChannelCount {
                channels: configuration.output_channel_count,
                max: max_channels,
                encoding: configuration.output_encoding,
            });
        }
        if !capabilities.is_encoding_supported(configuration.output_encoding)
            && configuration.output_mode == OutputMode::Pcm
        {
            return Err(ConfigurationError::Unsupported {
                format: format.to_string(),
                encoding: configuration.output_encoding,
            });
        }

        configuration.buffer_size = if specified_buffer_size != 0 {
            specified_buffer_size
        } else {
            self.buffer_size(&configuration, capabilities)
        };
        if let Some(frame_size) = configuration.output_pcm_frame_size
            && configuration.buffer_size < frame_size
        {
            return Err(ConfigurationError::InvalidBufferSize(configuration.buffer_size));
        }

        if let Some(kind) = configuration.chain {
            if kind == ChainKind::Int16
                && let Some(trimming) = chains.int16.trimming_mut()
            {
                trimming.set_trim_frame_count(format.encoder_delay, format.encoder_padding);
            }
            chains.get_mut(kind).configure(format.pcm_spec())?;
        }

        tracing::info!(
            format = %format,
            mode = ?configuration.output_mode,
            output_encoding = %configuration.output_encoding,
            output_rate_hz = configuration.output_sample_rate,
            output_channels = configuration.output_channel_count,
            buffer_size = configuration.buffer_size,
            chain_usable = configuration.chain_usable,
            "resolved output configuration"
        );
        Ok(configuration)
    }

    fn resolve_pcm(
        &self,
        format: &AudioFormat,
        chains: &ChainSet,
    ) -> Result<Configuration, ConfigurationError> {
        let kind = if self.use_float_output(format) {
            ChainKind::Float
        } else {
            ChainKind::Int16
        };
        let output = chains.get(kind).preview(format.pcm_spec())?;

        Ok(Configuration {
            input_format: format.clone(),
            input_pcm_frame_size: format.pcm_frame_size(),
            output_mode: OutputMode::Pcm,
            output_encoding: output.encoding,
            output_sample_rate: output.sample_rate,
            output_channel_count: output.channel_count,
            output_pcm_frame_size: Some(output.frame_size()),
            buffer_size: 0,
            chain: Some(kind),
            chain_usable: kind == ChainKind::Int16,
            frames_per_access_unit: 0,
        })
    }

    fn resolve_encoded<C: DeviceCapabilities + ?Sized>(
        &self,
        format: &AudioFormat,
        capabilities: &C,
    ) -> Result<Configuration, ConfigurationError> {
        let output_mode = if self.offload_allowed() && capabilities.is_offload_supported(format) {
            OutputMode::Offload
        } else if self.config.offload_mode == OffloadMode::Required {
            return Err(ConfigurationError::OffloadUnsupported {
                format: format.to_string(),
            });
        } else if capabilities.is_encoding_supported(format.encoding) {
            OutputMode::Passthrough
        } else {
            return Err(ConfigurationError::Unsupported {
                format: format.to_string(),
                encoding: format.encoding,
            });
        };

        let frames_per_access_unit = format
            .frames_per_access_unit
            .or_else(|| format.encoding.default_frames_per_access_unit())
            .filter(|&f| f > 0)
            .ok_or_else(|| ConfigurationError::invalid(format, "unknown frames per access unit"))?;

        Ok(Configuration {
            input_format: format.clone(),
            input_pcm_frame_size: None,
            output_mode,
            output_encoding: format.encoding,
            output_sample_rate: format.sample_rate,
            output_channel_count: format.channel_count,
            output_pcm_frame_size: None,
            buffer_size: 0,
            chain: None,
            chain_usable: false,
            frames_per_access_unit,
        })
    }

    fn buffer_size<C: DeviceCapabilities + ?Sized>(
        &self,
        configuration: &Configuration,
        capabilities: &C,
    ) -> usize {
        match configuration.output_mode {
            OutputMode::Pcm => {
                let frame_size = configuration.output_pcm_frame_size.unwrap_or(1).max(1);
                let rate = configuration.output_sample_rate;
                let min_buffer = capabilities.min_buffer_size(
                    rate,
                    configuration.output_channel_count,
                    configuration.output_encoding,
                );
                let bytes_for = |us: i64| duration_us_to_frames(us, rate) as usize * frame_size;
                let lower = bytes_for(MIN_PCM_BUFFER_DURATION_US);
                let upper = bytes_for(MAX_PCM_BUFFER_DURATION_US).max(min_buffer);
                let mut size = (min_buffer * PCM_BUFFER_MULTIPLICATION_FACTOR).clamp(lower, upper.max(lower));
                if self.config.variable_speed_playback && self.config.max_playback_speed > 1.0 {
                    size = (size as f64 * self.config.max_playback_speed as f64).ceil() as usize;
                }
                size.div_ceil(frame_size) * frame_size
            }
            OutputMode::Passthrough => encoded_buffer_size(
                configuration.output_encoding,
                PASSTHROUGH_BUFFER_DURATION_US,
            ),
            OutputMode::Offload => {
                encoded_buffer_size(configuration.output_encoding, OFFLOAD_BUFFER_DURATION_US)
            }
        }
    }

    /// How well the sink can play `format` with these capabilities.
    pub fn format_support<C: DeviceCapabilities + ?Sized>(
        &self,
        format: &AudioFormat,
        capabilities: &C,
    ) -> FormatSupport {
        if format.encoding.is_pcm() {
            if format.encoding == Encoding::Pcm16
                || (self.use_float_output(format)
                    && format.encoding == Encoding::PcmFloat
                    && capabilities.is_encoding_supported(Encoding::PcmFloat))
            {
                return FormatSupport::Supported;
            }
            return FormatSupport::SupportedWithTranscoding;
        }
        if (self.offload_allowed() && capabilities.is_offload_supported(format))
            || capabilities.is_encoding_supported(format.encoding)
        {
            FormatSupport::Supported
        } else {
            FormatSupport::Unsupported
        }
    }
}

fn encoded_buffer_size(encoding: Encoding, duration_us: i64) -> usize {
    let bytes_per_second = encoding.max_bytes_per_second().unwrap_or(0);
    (bytes_per_second as u128 * duration_us as u128 / 1_000_000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCapabilities;

    fn chains() -> ChainSet {
        ChainSet::new(&SinkConfig::default(), Vec::new())
    }

    #[test]
    fn pcm_uses_the_int16_chain() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let format = AudioFormat::pcm(Encoding::Pcm24, 48_000, 2);
        let c = resolver
            .resolve(&format, 0, &FakeCapabilities::default(), &mut chains())
            .unwrap();
        assert_eq!(c.output_mode, OutputMode::Pcm);
        assert_eq!(c.output_encoding, Encoding::Pcm16);
        assert_eq!(c.output_pcm_frame_size, Some(4));
        assert_eq!(c.input_pcm_frame_size, Some(6));
        assert!(c.chain_usable);
    }

    #[test]
    fn float_output_bypasses_speed_and_silence() {
        let config = SinkConfig {
            enable_float_output: true,
            ..SinkConfig::default()
        };
        let resolver = ConfigurationResolver::new(&config, false);
        let format = AudioFormat::pcm(Encoding::Pcm32, 96_000, 2);
        let c = resolver
            .resolve(&format, 0, &FakeCapabilities::default(), &mut chains())
            .unwrap();
        assert_eq!(c.output_encoding, Encoding::PcmFloat);
        assert_eq!(c.chain, Some(ChainKind::Float));
        assert!(!c.chain_usable);
    }

    #[test]
    fn pcm_buffer_is_clamped_to_duration_range() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let format = AudioFormat::pcm(Encoding::Pcm16, 48_000, 2);
        let caps = FakeCapabilities {
            min_buffer: 1_000,
            ..FakeCapabilities::default()
        };
        let c = resolver.resolve(&format, 0, &caps, &mut chains()).unwrap();
        // 250 ms of 48 kHz stereo 16-bit.
        assert_eq!(c.buffer_size, 48_000);
        assert_eq!(c.buffer_duration_us(), 250_000);

        let caps = FakeCapabilities {
            min_buffer: 100_000,
            ..FakeCapabilities::default()
        };
        let c = resolver.resolve(&format, 0, &caps, &mut chains()).unwrap();
        // 750 ms cap.
        assert_eq!(c.buffer_size, 144_000);
    }

    #[test]
    fn variable_speed_scales_pcm_buffer() {
        let config = SinkConfig {
            variable_speed_playback: true,
            max_playback_speed: 2.0,
            ..SinkConfig::default()
        };
        let resolver = ConfigurationResolver::new(&config, false);
        let format = AudioFormat::pcm(Encoding::Pcm16, 48_000, 2);
        let caps = FakeCapabilities {
            min_buffer: 1_000,
            ..FakeCapabilities::default()
        };
        let c = resolver.resolve(&format, 0, &caps, &mut chains()).unwrap();
        assert_eq!(c.buffer_size, 96_000);
    }

    #[test]
    fn specified_buffer_size_wins() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let format = AudioFormat::pcm(Encoding::Pcm16, 48_000, 2);
        let c = resolver
            .resolve(&format, 8_192, &FakeCapabilities::default(), &mut chains())
            .unwrap();
        assert_eq!(c.buffer_size, 8_192);
    }

    #[test]
    fn compressed_prefers_offload_then_passthrough() {
        let format = AudioFormat::encoded(Encoding::Ac3, 48_000, 6);
        let caps = FakeCapabilities {
            offload: vec![Encoding::Ac3],
            passthrough: vec![Encoding::Ac3],
            ..FakeCapabilities::default()
        };

        let config = SinkConfig {
            offload_mode: OffloadMode::Enabled,
            ..SinkConfig::default()
        };
        let c = ConfigurationResolver::new(&config, false)
            .resolve(&format, 0, &caps, &mut chains())
            .unwrap();
        assert_eq!(c.output_mode, OutputMode::Offload);
        assert_eq!(c.frames_per_access_unit, 1536);
        // 50 s at 640 kbit/s.
        assert_eq!(c.buffer_size, 4_000_000);

        let c = ConfigurationResolver::new(&config, true)
            .resolve(&format, 0, &caps, &mut chains())
            .unwrap();
        assert_eq!(c.output_mode, OutputMode::Passthrough);
        assert_eq!(c.buffer_size, 20_000);
    }

    #[test]
    fn required_offload_fails_when_unsupported() {
        let config = SinkConfig {
            offload_mode: OffloadMode::Required,
            ..SinkConfig::default()
        };
        let format = AudioFormat::encoded(Encoding::Eac3, 48_000, 6);
        let caps = FakeCapabilities {
            passthrough: vec![Encoding::Eac3],
            ..FakeCapabilities::default()
        };
        let err = ConfigurationResolver::new(&config, false)
            .resolve(&format, 0, &caps, &mut chains())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::OffloadUnsupported { .. }));
    }

    #[test]
    fn unsupported_encoding_and_channel_count() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let err = resolver
            .resolve(
                &AudioFormat::encoded(Encoding::Dts, 48_000, 6),
                0,
                &FakeCapabilities::default(),
                &mut chains(),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Unsupported { .. }));

        let caps = FakeCapabilities {
            max_channels: 2,
            ..FakeCapabilities::default()
        };
        let err = resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm16, 48_000, 6), 0, &caps, &mut chains())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedChannelCount { .. }));
    }

    #[test]
    fn rejected_format_leaves_chain_configuration_alone() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let caps = FakeCapabilities::default();
        let mut chains = chains();
        resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm16, 48_000, 2), 0, &caps, &mut chains)
            .unwrap();
        chains.int16.flush();

        let mono = AudioFormat::pcm(Encoding::Pcm16, 48_000, 1).with_gapless(100, 100);
        let err = resolver.resolve(&mono, 1, &caps, &mut chains).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidBufferSize(1)));
        let narrow = FakeCapabilities {
            max_channels: 2,
            ..FakeCapabilities::default()
        };
        let err = resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm16, 48_000, 6), 0, &narrow, &mut chains)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedChannelCount { .. }));

        chains.int16.flush();
        let output = chains.int16.output_spec().unwrap();
        assert_eq!(output.channel_count, 2);
        assert!(!chains.int16.active_stage_names().contains(&"trimming"));
    }

    #[test]
    fn compatibility_ignores_input_side() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let caps = FakeCapabilities::default();
        let a = resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm16, 48_000, 2), 0, &caps, &mut chains())
            .unwrap();
        let b = resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm24, 48_000, 2), 0, &caps, &mut chains())
            .unwrap();
        let c = resolver
            .resolve(&AudioFormat::pcm(Encoding::Pcm16, 44_100, 2), 0, &caps, &mut chains())
            .unwrap();
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn format_support_levels() {
        let config = SinkConfig::default();
        let resolver = ConfigurationResolver::new(&config, false);
        let caps = FakeCapabilities::default();
        assert_eq!(
            resolver.format_support(&AudioFormat::pcm(Encoding::Pcm16, 48_000, 2), &caps),
            FormatSupport::Supported
        );
        assert_eq!(
            resolver.format_support(&AudioFormat::pcm(Encoding::PcmFloat, 48_000, 2), &caps),
            FormatSupport::SupportedWithTranscoding
        );
        assert_eq!(
            resolver.format_support(&AudioFormat::encoded(Encoding::Opus, 48_000, 2), &caps),
            FormatSupport::Unsupported
        );
    }
}
