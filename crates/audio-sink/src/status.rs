use serde::Serialize;

use crate::format::Encoding;
use crate::params::PlaybackParameters;
use crate::resolver::OutputMode;

/// Lifecycle state of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    /// No configuration.
    Idle,
    /// Configured, no device open yet.
    Configured,
    /// Device open, never started.
    Initialized,
    Playing,
    Paused,
    /// End of stream handed to the device, which is playing out what is left.
    Draining,
}

/// Event counters kept since the sink was created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkCounters {
    pub underruns: u64,
    pub timestamp_anomalies: u64,
    pub discontinuities: u64,
    pub write_errors: u64,
    pub stalls: u64,
    pub devices_opened: u64,
}

/// Snapshot of a sink for logs and diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SinkStatus {
    pub state: SinkState,
    pub output_mode: Option<OutputMode>,
    pub output_encoding: Option<Encoding>,
    pub output_sample_rate: Option<u32>,
    pub output_channels: Option<u16>,
    /// Device buffer size in bytes.
    pub buffer_size: Option<usize>,
    pub buffer_duration_us: Option<i64>,
    /// Stages currently in the data path.
    pub active_stages: Vec<&'static str>,
    pub submitted_frames: u64,
    pub written_frames: u64,
    pub playback: PlaybackParameters,
    pub skip_silence: bool,
    pub skipped_silence_us: i64,
    pub volume: f32,
    /// A configuration is waiting for the current device to drain.
    pub reconfiguration_pending: bool,
    pub counters: SinkCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_snake_case_enums() {
        let status = SinkStatus {
            state: SinkState::Playing,
            output_mode: Some(OutputMode::Pcm),
            output_encoding: Some(Encoding::Pcm16),
            output_sample_rate: Some(48_000),
            output_channels: Some(2),
            buffer_size: Some(48_000),
            buffer_duration_us: Some(250_000),
            active_stages: vec!["speed_change"],
            submitted_frames: 10,
            written_frames: 8,
            playback: PlaybackParameters::new(1.5, 1.0),
            skip_silence: false,
            skipped_silence_us: 0,
            volume: 1.0,
            reconfiguration_pending: false,
            counters: SinkCounters::default(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "playing");
        assert_eq!(json["output_mode"], "pcm");
        assert_eq!(json["output_encoding"], "pcm16");
        assert_eq!(json["playback"]["speed"], 1.5);
        assert_eq!(json["counters"]["underruns"], 0);
    }
}
