/// How compressed audio may be handed to a hardware decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffloadMode {
    /// Never offload.
    #[default]
    Disabled,
    /// Offload when the device supports the format, fall back to passthrough otherwise.
    Enabled,
    /// Offload or fail configuration.
    Required,
}

/// Sink tuning and feature switches, fixed at construction time.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Output high-resolution PCM as 32-bit float instead of transcoding to 16-bit.
    ///
    /// Float output bypasses the speed and silence stages.
    pub enable_float_output: bool,
    /// Offload policy for compressed input.
    pub offload_mode: OffloadMode,
    /// Escalate spurious device timestamps into errors (diagnostics / tests).
    pub fail_on_timestamp_anomaly: bool,
    /// Scale PCM device buffers up for faster-than-realtime playback.
    pub variable_speed_playback: bool,
    /// Highest playback speed the PCM buffer is sized for when `variable_speed_playback` is set.
    pub max_playback_speed: f32,
    /// Resample PCM output to this rate when it differs from the source.
    pub output_sample_rate: Option<u32>,
    /// Output channel `i` takes input channel `channel_map[i]`.
    pub channel_map: Option<Vec<usize>>,
    /// Samples with magnitude below this are treated as silence.
    pub silence_threshold: i16,
    /// Silence shorter than this is never shortened.
    pub min_silence_duration_us: i64,
    /// Silence kept at each side of a skipped section.
    pub silence_padding_us: i64,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enable_float_output: false,
            offload_mode: OffloadMode::Disabled,
            fail_on_timestamp_anomaly: false,
            variable_speed_playback: false,
            max_playback_speed: 2.0,
            output_sample_rate: None,
            channel_map: None,
            silence_threshold: 1024,
            min_silence_duration_us: 150_000,
            silence_padding_us: 20_000,
            resample_chunk_frames: 1024,
        }
    }
}
