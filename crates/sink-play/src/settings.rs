//! Optional TOML settings file.
//!
//! Every field is optional; unset fields keep the sink defaults and command-line
//! flags override what the file says.

use std::path::Path;

use anyhow::{Context, Result};
use audio_sink::{OffloadMode, SinkConfig};
use serde::Deserialize;

use crate::cli::Args;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub device: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub skip_silence: Option<bool>,
    pub volume: Option<f32>,
    pub buffer_size: Option<usize>,
    pub float_output: Option<bool>,
    pub offload: Option<OffloadSetting>,
    pub fail_on_timestamp_anomaly: Option<bool>,
    pub variable_speed_playback: Option<bool>,
    pub max_playback_speed: Option<f32>,
    pub output_sample_rate: Option<u32>,
    pub channel_map: Option<Vec<usize>>,
    pub silence_threshold: Option<i16>,
    pub min_silence_duration_ms: Option<u64>,
    pub silence_padding_ms: Option<u64>,
    pub resample_chunk_frames: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadSetting {
    Disabled,
    Enabled,
    Required,
}

impl From<OffloadSetting> for OffloadMode {
    fn from(value: OffloadSetting) -> Self {
        match value {
            OffloadSetting::Disabled => OffloadMode::Disabled,
            OffloadSetting::Enabled => OffloadMode::Enabled,
            OffloadSetting::Required => OffloadMode::Required,
        }
    }
}

/// Everything the player needs, after merging the file with the command line.
#[derive(Clone, Debug)]
pub struct PlayOptions {
    pub device: Option<String>,
    pub speed: f32,
    pub pitch: f32,
    pub skip_silence: bool,
    pub volume: f32,
    pub buffer_size: usize,
    pub sink: SinkConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn sink_config(&self) -> SinkConfig {
        let mut config = SinkConfig::default();
        if let Some(v) = self.float_output {
            config.enable_float_output = v;
        }
        if let Some(v) = self.offload {
            config.offload_mode = v.into();
        }
        if let Some(v) = self.fail_on_timestamp_anomaly {
            config.fail_on_timestamp_anomaly = v;
        }
        if let Some(v) = self.variable_speed_playback {
            config.variable_speed_playback = v;
        }
        if let Some(v) = self.max_playback_speed {
            config.max_playback_speed = v;
        }
        if self.output_sample_rate.is_some() {
            config.output_sample_rate = self.output_sample_rate;
        }
        if self.channel_map.is_some() {
            config.channel_map = self.channel_map.clone();
        }
        if let Some(v) = self.silence_threshold {
            config.silence_threshold = v;
        }
        if let Some(ms) = self.min_silence_duration_ms {
            config.min_silence_duration_us = ms as i64 * 1000;
        }
        if let Some(ms) = self.silence_padding_ms {
            config.silence_padding_us = ms as i64 * 1000;
        }
        if let Some(v) = self.resample_chunk_frames {
            config.resample_chunk_frames = v;
        }
        config
    }

    /// Overlay command-line flags on these settings.
    pub fn merge(&self, args: &Args) -> PlayOptions {
        let mut sink = self.sink_config();
        if args.float_output {
            sink.enable_float_output = true;
        }
        let speed = args.speed.or(self.speed).unwrap_or(1.0);
        if speed > 1.0 {
            sink.variable_speed_playback = true;
            sink.max_playback_speed = sink.max_playback_speed.max(speed);
        }
        PlayOptions {
            device: args.device.clone().or_else(|| self.device.clone()),
            speed,
            pitch: args.pitch.or(self.pitch).unwrap_or(1.0),
            skip_silence: args.skip_silence || self.skip_silence.unwrap_or(false),
            volume: self.volume.unwrap_or(1.0),
            buffer_size: args.buffer_size.or(self.buffer_size).unwrap_or(0),
            sink,
        }
    }
}
