//! The audio sink: turns timestamped buffers into paced, non-blocking device writes.
//!
//! One thread owns the sink and drives every call. The only background work is device
//! release, see [`crate::release`].

use std::sync::Arc;

use crate::buffer::AudioBuf;
use crate::clock::{Clock, SystemClock};
use crate::config::SinkConfig;
use crate::device::{AudioDevice, AudioDriver};
use crate::error::{
    DeviceError, InitializationError, Result, SinkError, TimestampAnomaly, WriteError,
};
use crate::format::AudioFormat;
use crate::listener::SinkListener;
use crate::params::{ParameterSet, PlaybackParameters, ParameterTimeline};
use crate::pipeline::{ChainKind, ChainSet};
use crate::position::{PositionTracker, TrackerEvent};
use crate::processor::AudioProcessor;
use crate::release::DeviceReleaser;
use crate::resolver::{Configuration, ConfigurationResolver, FormatSupport, OutputMode};
use crate::status::{SinkCounters, SinkState, SinkStatus};

/// Drift between expected and actual presentation time that forces a resync.
const DISCONTINUITY_TOLERANCE_US: i64 = 200_000;

/// The open device and what has been written to it.
#[derive(Default)]
struct DeviceSlot {
    device: Option<Box<dyn AudioDevice>>,
    written_pcm_bytes: u64,
    written_encoded_frames: u64,
}

impl DeviceSlot {
    /// Write what the device accepts from `buf`, advancing it.
    fn write(
        &mut self,
        buf: &mut AudioBuf,
        av_sync_time_us: Option<i64>,
        pcm: bool,
    ) -> std::result::Result<usize, DeviceError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(0);
        };
        let n = device
            .write_non_blocking(buf.as_slice(), av_sync_time_us)?
            .min(buf.remaining());
        buf.advance(n);
        if pcm {
            self.written_pcm_bytes += n as u64;
        }
        Ok(n)
    }
}

/// Audio output pipeline in front of a device driver.
pub struct AudioSink {
    config: SinkConfig,
    driver: Box<dyn AudioDriver>,
    clock: Arc<dyn Clock>,
    listener: Option<Box<dyn SinkListener>>,
    chains: ChainSet,
    tracker: PositionTracker,
    releaser: DeviceReleaser,
    timeline: ParameterTimeline,

    configuration: Option<Configuration>,
    /// Waiting for the current device to drain.
    pending_configuration: Option<Configuration>,
    output: DeviceSlot,
    session_id: Option<u32>,
    volume: f32,
    playing: bool,
    started_since_init: bool,

    start_media_time_us: i64,
    start_media_time_needs_init: bool,
    start_media_time_needs_sync: bool,
    submitted_pcm_bytes: u64,
    submitted_encoded_frames: u64,

    /// Caller buffer being consumed; kept across calls that return `false`.
    input: Option<AudioBuf>,
    input_unit_count: usize,

    stopped_device: bool,
    handled_end_of_stream: bool,
    offload_disabled_until_next_configure: bool,
    offload_buffer_full: bool,
    last_feed_us: Option<i64>,
    pending_anomaly: Option<TimestampAnomaly>,
    reported_skip_silence: bool,
    counters: SinkCounters,
}

impl AudioSink {
    pub fn new(driver: Box<dyn AudioDriver>, config: SinkConfig) -> Self {
        Self::with_parts(driver, config, Arc::new(SystemClock::new()), Vec::new())
    }

    /// Build a sink with an explicit clock and extra processing stages.
    ///
    /// `processors` run after trimming and before silence skipping, and must keep
    /// 16-bit PCM as their output.
    pub fn with_parts(
        driver: Box<dyn AudioDriver>,
        config: SinkConfig,
        clock: Arc<dyn Clock>,
        processors: Vec<Box<dyn AudioProcessor>>,
    ) -> Self {
        let chains = ChainSet::new(&config, processors);
        Self {
            tracker: PositionTracker::new(clock.clone()),
            config,
            driver,
            clock,
            listener: None,
            chains,
            releaser: DeviceReleaser::new(),
            timeline: ParameterTimeline::new(),
            configuration: None,
            pending_configuration: None,
            output: DeviceSlot::default(),
            session_id: None,
            volume: 1.0,
            playing: false,
            started_since_init: false,
            start_media_time_us: 0,
            start_media_time_needs_init: true,
            start_media_time_needs_sync: false,
            submitted_pcm_bytes: 0,
            submitted_encoded_frames: 0,
            input: None,
            input_unit_count: 0,
            stopped_device: false,
            handled_end_of_stream: false,
            offload_disabled_until_next_configure: false,
            offload_buffer_full: false,
            last_feed_us: None,
            pending_anomaly: None,
            reported_skip_silence: false,
            counters: SinkCounters::default(),
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn SinkListener>) {
        self.listener = Some(listener);
    }

    fn notify(&mut self, f: impl FnOnce(&mut dyn SinkListener)) {
        if let Some(listener) = self.listener.as_deref_mut() {
            f(listener);
        }
    }

    pub fn format_support(&self, format: &AudioFormat) -> FormatSupport {
        ConfigurationResolver::new(&self.config, self.offload_disabled_until_next_configure)
            .format_support(format, self.driver.as_ref())
    }

    /// Configure for `format`. With a device open the configuration waits until the
    /// device has drained.
    pub fn configure(&mut self, format: &AudioFormat, specified_buffer_size: usize) -> Result<()> {
        let resolver =
            ConfigurationResolver::new(&self.config, self.offload_disabled_until_next_configure);
        let configuration = resolver.resolve(
            format,
            specified_buffer_size,
            self.driver.as_ref(),
            &mut self.chains,
        )?;
        self.offload_disabled_until_next_configure = false;

        if self.output.device.is_some() {
            tracing::debug!(format = %format, "configuration pending until the device drains");
            self.pending_configuration = Some(configuration);
        } else {
            self.configuration = Some(configuration);
        }
        Ok(())
    }

    /// Offer `buffer` stamped with `presentation_time_us`.
    ///
    /// Returns `Ok(true)` once the whole buffer has been taken. `Ok(false)` means the
    /// sink could not take all of it; call again later with the same buffer.
    /// `unit_count` is the number of access units for encoded input.
    pub fn handle_buffer(
        &mut self,
        buffer: &[u8],
        presentation_time_us: i64,
        unit_count: usize,
    ) -> Result<bool> {
        if let Some(anomaly) = self.pending_anomaly.take() {
            return Err(anomaly.into());
        }
        let result = self.handle_buffer_inner(buffer, presentation_time_us, unit_count);
        self.forward_tracker_events();
        self.last_feed_us = Some(self.clock.now_us());
        result
    }

    fn handle_buffer_inner(
        &mut self,
        buffer: &[u8],
        presentation_time_us: i64,
        unit_count: usize,
    ) -> Result<bool> {
        if self.configuration.is_none() {
            return Err(SinkError::NotConfigured);
        }

        if self.pending_configuration.is_some() && self.input.is_none() {
            if !self.drain_to_end_of_stream()? {
                return Ok(false);
            }
            let compatible = match (&self.pending_configuration, &self.configuration) {
                (Some(pending), Some(current)) => pending.is_compatible_with(current),
                _ => false,
            };
            if compatible {
                self.configuration = self.pending_configuration.take();
                tracing::debug!("reusing device for new configuration");
            } else {
                self.play_pending_data();
                if self.has_pending_data() {
                    return Ok(false);
                }
                // Promotes the pending configuration.
                self.flush();
            }
            self.apply_parameters(presentation_time_us);
        }

        if self.output.device.is_none() {
            self.initialize_device()?;
        }

        if self.start_media_time_needs_init {
            self.start_media_time_us = presentation_time_us.max(0);
            self.start_media_time_needs_sync = false;
            self.start_media_time_needs_init = false;
            self.apply_parameters(presentation_time_us);
            if self.playing {
                self.play();
            }
        }

        let written = self.written_frames();
        if let Some(device) = self.output.device.as_deref()
            && !self.tracker.may_handle_buffer(device, written)
        {
            return Ok(false);
        }

        if self.input.is_none() {
            if buffer.is_empty() {
                return Ok(true);
            }

            if self.timeline.has_pending_until_drain() {
                if !self.drain_to_end_of_stream()? {
                    return Ok(false);
                }
                self.apply_parameters(presentation_time_us);
            }

            let expected_us = self.expected_presentation_time_us();
            if !self.start_media_time_needs_sync
                && (expected_us - presentation_time_us).abs() > DISCONTINUITY_TOLERANCE_US
            {
                let err = SinkError::UnexpectedDiscontinuity {
                    expected_us,
                    actual_us: presentation_time_us,
                };
                tracing::warn!(expected_us, actual_us = presentation_time_us, "{err}");
                self.notify(|l| l.on_sink_error(&err));
                self.start_media_time_needs_sync = true;
            }
            if self.start_media_time_needs_sync {
                // Timing is only updated once nothing processed under the old timing remains.
                if !self.drain_to_end_of_stream()? {
                    return Ok(false);
                }
                let adjustment_us = presentation_time_us - expected_us;
                self.start_media_time_us += adjustment_us;
                self.start_media_time_needs_sync = false;
                self.apply_parameters(presentation_time_us);
                if adjustment_us != 0 {
                    self.counters.discontinuities += 1;
                    self.notify(|l| l.on_position_discontinuity());
                }
            }

            let Some(configuration) = self.configuration.as_ref() else {
                return Err(SinkError::NotConfigured);
            };
            if configuration.output_mode == OutputMode::Pcm {
                self.submitted_pcm_bytes += buffer.len() as u64;
            } else {
                self.submitted_encoded_frames +=
                    configuration.frames_per_access_unit as u64 * unit_count as u64;
            }
            self.input = Some(AudioBuf::from_slice(buffer));
            self.input_unit_count = unit_count;
        }

        self.process_buffers(Some(presentation_time_us))?;

        if self.input.as_ref().is_some_and(|input| !input.has_remaining()) {
            self.input = None;
            self.input_unit_count = 0;
            return Ok(true);
        }

        let written = self.written_frames();
        if let Some(device) = self.output.device.as_deref()
            && self.tracker.is_stalled(device, written)
        {
            tracing::warn!("resetting stalled audio device");
            self.counters.stalls += 1;
            self.flush();
            return Ok(true);
        }
        Ok(false)
    }

    fn expected_presentation_time_us(&self) -> i64 {
        let Some(configuration) = self.configuration.as_ref() else {
            return self.start_media_time_us;
        };
        let trimmed = match configuration.chain {
            Some(ChainKind::Int16) => self
                .chains
                .int16
                .trimming()
                .map(|t| t.trimmed_frame_count())
                .unwrap_or(0),
            _ => 0,
        };
        let frames = self.submitted_frames().saturating_sub(trimmed);
        self.start_media_time_us + configuration.input_frames_to_duration_us(frames)
    }

    fn initialize_device(&mut self) -> Result<()> {
        let Some(configuration) = self.configuration.clone() else {
            return Err(SinkError::NotConfigured);
        };
        // At most one device exists at a time.
        self.releaser.wait_until_released();

        let device_config = configuration.device_config(self.session_id);
        let mut device = match self.driver.open(&device_config) {
            Ok(device) => device,
            Err(source) => {
                let offload = configuration.output_mode == OutputMode::Offload;
                if offload {
                    tracing::warn!("offload device failed to open, disabling offload");
                    self.offload_disabled_until_next_configure = true;
                }
                let err = InitializationError {
                    format: configuration.input_format.to_string(),
                    recoverable: offload,
                    source,
                };
                return Err(err.into());
            }
        };

        if self.session_id.is_none() {
            self.session_id = Some(device.session_id());
        }
        device.set_volume(self.volume);
        self.tracker.set_device(
            configuration.output_mode,
            configuration.output_encoding,
            configuration.output_sample_rate,
            configuration.output_pcm_frame_size,
            configuration.buffer_size,
        );
        self.output.device = Some(device);
        self.start_media_time_needs_init = true;
        self.started_since_init = false;
        self.counters.devices_opened += 1;
        tracing::info!(
            mode = ?configuration.output_mode,
            encoding = %configuration.output_encoding,
            rate_hz = configuration.output_sample_rate,
            channels = configuration.output_channel_count,
            buffer_size = configuration.buffer_size,
            session_id = ?self.session_id,
            "output device opened"
        );
        Ok(())
    }

    /// Push the requested parameters into the chain and record a checkpoint anchored
    /// at `presentation_time_us` and the current written position.
    fn apply_parameters(&mut self, presentation_time_us: i64) {
        let Some(configuration) = self.configuration.as_ref() else {
            return;
        };
        let applied = if configuration.chain_usable {
            self.timeline.requested()
        } else {
            ParameterSet::default()
        };
        let chain_kind = configuration.chain;
        let device_time_us = configuration.frames_to_duration_us(self.written_frames());

        if let Some(kind) = chain_kind {
            let chain = self.chains.get_mut(kind);
            if let Some(speed) = chain.speed_mut() {
                speed.set_speed(applied.playback.speed);
                speed.set_pitch(applied.playback.pitch);
            }
            if let Some(silence) = chain.silence_skipping_mut() {
                silence.set_enabled(applied.skip_silence);
            }
        }

        let skipped_us = self.chains.int16.skipped_duration_us();
        self.timeline.finish_drain();
        self.timeline
            .push(applied, presentation_time_us, device_time_us, skipped_us);
        if let Some(kind) = chain_kind {
            self.chains.get_mut(kind).flush();
        }

        if applied.skip_silence != self.reported_skip_silence {
            self.reported_skip_silence = applied.skip_silence;
            self.notify(|l| l.on_skip_silence_enabled_changed(applied.skip_silence));
        }
    }

    /// Feed the chain from the pending input and write its output until the device or
    /// the chain stops making progress.
    fn process_buffers(&mut self, av_sync_time_us: Option<i64>) -> Result<()> {
        let Some(configuration) = self.configuration.as_ref() else {
            return Ok(());
        };
        let pcm = configuration.output_mode == OutputMode::Pcm;
        let Some(kind) = configuration
            .chain
            .filter(|&k| self.chains.get(k).is_operational())
        else {
            self.write_input(av_sync_time_us)?;
            return Ok(());
        };

        loop {
            if self.chains.get(kind).is_ended() {
                return Ok(());
            }
            loop {
                let out = self.chains.get_mut(kind).output();
                if !out.has_remaining() {
                    break;
                }
                let result = self.output.write(out, av_sync_time_us, pcm);
                let blocked = out.has_remaining();
                self.check_write(result, blocked)?;
                if blocked {
                    return Ok(());
                }
            }

            let Some(input) = self.input.as_mut().filter(|i| i.has_remaining()) else {
                return Ok(());
            };
            let before = input.remaining();
            self.chains.get_mut(kind).queue_input(input);
            let consumed = before != input.remaining();
            if !consumed && !self.chains.get_mut(kind).output().has_remaining() {
                return Ok(());
            }
        }
    }

    /// Write the pending input straight to the device. Returns whether it is fully written.
    fn write_input(&mut self, av_sync_time_us: Option<i64>) -> Result<bool> {
        let Some(mut input) = self.input.take() else {
            return Ok(true);
        };
        let pcm = self
            .configuration
            .as_ref()
            .is_some_and(|c| c.output_mode == OutputMode::Pcm);
        let result = self.output.write(&mut input, av_sync_time_us, pcm);
        let blocked = input.has_remaining();
        let fully_written = result.is_ok() && !blocked;
        if fully_written && !pcm {
            let frames_per_unit = self
                .configuration
                .as_ref()
                .map(|c| c.frames_per_access_unit)
                .unwrap_or(0);
            self.output.written_encoded_frames +=
                frames_per_unit as u64 * self.input_unit_count as u64;
        }
        self.input = Some(input);
        self.check_write(result, blocked)?;
        Ok(fully_written)
    }

    fn check_write(
        &mut self,
        result: std::result::Result<usize, DeviceError>,
        blocked: bool,
    ) -> Result<()> {
        let offload = self
            .configuration
            .as_ref()
            .is_some_and(|c| c.output_mode == OutputMode::Offload);
        match result {
            Ok(_) => {
                if offload {
                    if blocked && !self.offload_buffer_full {
                        self.offload_buffer_full = true;
                        self.notify(|l| l.on_offload_buffer_full());
                    } else if !blocked && self.offload_buffer_full {
                        self.offload_buffer_full = false;
                        self.notify(|l| l.on_offload_buffer_emptying());
                    }
                }
                Ok(())
            }
            Err(source) => {
                if source.dead {
                    tracing::warn!("device is dead, disabling offload until next configure");
                    self.offload_disabled_until_next_configure = true;
                }
                let format = self
                    .configuration
                    .as_ref()
                    .map(|c| c.input_format.to_string())
                    .unwrap_or_default();
                let recoverable = source.dead && self.written_frames() > 0;
                let err = SinkError::from(WriteError {
                    format,
                    recoverable,
                    source,
                });
                self.counters.write_errors += 1;
                tracing::warn!("{err}");
                self.notify(|l| l.on_sink_error(&err));
                Err(err)
            }
        }
    }

    /// Push end of stream through the chain and write everything out.
    /// Returns whether nothing is left to write.
    fn drain_to_end_of_stream(&mut self) -> Result<bool> {
        let Some(configuration) = self.configuration.as_ref() else {
            return Ok(true);
        };
        let Some(kind) = configuration
            .chain
            .filter(|&k| self.chains.get(k).is_operational())
        else {
            return self.write_input(None);
        };

        // Input accepted earlier goes in before the end-of-stream marker.
        if self.input.as_ref().is_some_and(|i| i.has_remaining()) {
            self.process_buffers(None)?;
            if self.input.as_ref().is_some_and(|i| i.has_remaining()) {
                return Ok(false);
            }
        }
        self.input = None;
        self.input_unit_count = 0;

        self.chains.get_mut(kind).queue_end_of_stream();
        self.process_buffers(None)?;
        Ok(self.chains.get(kind).is_ended())
    }

    fn play_pending_data(&mut self) {
        if self.stopped_device {
            return;
        }
        let written = self.written_frames();
        if let Some(device) = self.output.device.as_mut() {
            self.stopped_device = true;
            self.tracker.handle_end_of_stream(device.as_ref(), written);
            device.stop();
        }
    }

    /// Drain everything and let the device play it out. Call until it returns `true`,
    /// then poll [`is_ended`](Self::is_ended).
    pub fn play_to_end_of_stream(&mut self) -> Result<bool> {
        if !self.handled_end_of_stream
            && self.output.device.is_some()
            && self.drain_to_end_of_stream()?
        {
            self.play_pending_data();
            self.handled_end_of_stream = true;
            tracing::debug!(written_frames = self.written_frames(), "end of stream handled");
        }
        self.forward_tracker_events();
        Ok(self.handled_end_of_stream || self.output.device.is_none())
    }

    pub fn is_ended(&mut self) -> bool {
        self.output.device.is_none() || (self.handled_end_of_stream && !self.has_pending_data())
    }

    /// Written audio the device has not played yet.
    pub fn has_pending_data(&mut self) -> bool {
        let written = self.written_frames();
        match self.output.device.as_deref() {
            Some(device) => self.tracker.has_pending_data(device, written),
            None => false,
        }
    }

    /// Media position in microseconds, `None` until the first buffer after (re)initialization.
    pub fn current_position_us(&mut self, source_ended: bool) -> Option<i64> {
        if self.start_media_time_needs_init {
            return None;
        }
        let written = self.written_frames();
        let device = self.output.device.as_deref()?;
        let configuration = self.configuration.as_ref()?;

        let device_position_us = self
            .tracker
            .current_position_us(device, source_ended)
            .min(configuration.frames_to_duration_us(written));

        let chain = configuration.chain.map(|k| self.chains.get(k));
        let media_us = self.timeline.media_position(device_position_us, |playout_us| {
            chain.map_or(playout_us, |c| c.media_duration_for_playout_duration(playout_us))
        });
        let skipped_us =
            self.chains.int16.skipped_duration_us() - self.timeline.active().skipped_us_at_anchor;

        self.forward_tracker_events();
        Some(media_us + skipped_us.max(0))
    }

    pub fn set_playback_parameters(&mut self, params: PlaybackParameters) -> Result<()> {
        let playback = params.validated()?;
        let mut set = self.timeline.requested();
        set.playback = playback;
        self.request_parameters(set);
        Ok(())
    }

    pub fn playback_parameters(&self) -> PlaybackParameters {
        self.timeline.requested().playback
    }

    pub fn set_skip_silence_enabled(&mut self, enabled: bool) {
        let mut set = self.timeline.requested();
        set.skip_silence = enabled;
        self.request_parameters(set);
    }

    pub fn skip_silence_enabled(&self) -> bool {
        self.timeline.requested().skip_silence
    }

    fn request_parameters(&mut self, set: ParameterSet) {
        // With a device open, queued audio reflects the old parameters.
        let in_flight = self.output.device.is_some();
        self.timeline.request(set, in_flight);
    }

    /// Caller-declared discontinuity: the next buffer resyncs media time.
    pub fn handle_discontinuity(&mut self) {
        self.start_media_time_needs_sync = true;
    }

    pub fn play(&mut self) {
        self.playing = true;
        if let Some(device) = self.output.device.as_mut() {
            self.tracker.start();
            device.play();
            self.started_since_init = true;
        }
    }

    pub fn pause(&mut self) {
        self.playing = false;
        if let Some(device) = self.output.device.as_mut()
            && self.tracker.pause(device.as_ref())
        {
            device.pause();
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        if let Some(device) = self.output.device.as_mut() {
            device.set_volume(self.volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Stop and release the device, drop all buffered audio and reset counters.
    ///
    /// The device is released on a worker; the next device waits for that to finish.
    pub fn flush(&mut self) {
        self.reset_for_flush();
        if let Some(mut device) = self.output.device.take() {
            if self.tracker.is_playing() {
                device.pause();
            }
            device.flush();
            if let Some(pending) = self.pending_configuration.take() {
                self.configuration = Some(pending);
            }
            self.tracker.reset();
            self.releaser.release(device);
            tracing::debug!("sink flushed");
        }
        self.pending_anomaly = None;
    }

    fn reset_for_flush(&mut self) {
        self.submitted_pcm_bytes = 0;
        self.submitted_encoded_frames = 0;
        self.output.written_pcm_bytes = 0;
        self.output.written_encoded_frames = 0;
        self.timeline.reset();
        self.start_media_time_us = 0;
        self.start_media_time_needs_init = true;
        self.start_media_time_needs_sync = false;
        self.input = None;
        self.input_unit_count = 0;
        self.stopped_device = false;
        self.handled_end_of_stream = false;
        self.offload_buffer_full = false;
        if let Some(trimming) = self.chains.int16.trimming_mut() {
            trimming.reset_trimmed_frame_count();
        }
        if let Some(kind) = self.configuration.as_ref().and_then(|c| c.chain) {
            self.chains.get_mut(kind).flush();
        }
    }

    /// Flush, then forget the configuration, stage state and the audio session.
    pub fn reset(&mut self) {
        self.flush();
        self.chains.reset();
        self.configuration = None;
        self.pending_configuration = None;
        self.playing = false;
        self.offload_disabled_until_next_configure = false;
        self.session_id = None;
        self.reported_skip_silence = false;
        tracing::debug!("sink reset");
    }

    fn forward_tracker_events(&mut self) {
        let events: Vec<TrackerEvent> = self.tracker.drain_events().collect();
        for event in events {
            match event {
                TrackerEvent::Underrun {
                    buffer_size,
                    buffer_duration_us,
                } => {
                    self.counters.underruns += 1;
                    let now = self.clock.now_us();
                    let ms_since_last_feed = self
                        .last_feed_us
                        .map(|t| (now - t) / 1000)
                        .unwrap_or(0);
                    self.notify(|l| {
                        l.on_underrun(buffer_size, buffer_duration_us, ms_since_last_feed)
                    });
                }
                TrackerEvent::PositionAdvancing {
                    playout_start_system_time_us,
                } => {
                    self.notify(|l| l.on_position_advancing(playout_start_system_time_us));
                }
                TrackerEvent::TimestampAnomaly(anomaly) => {
                    self.counters.timestamp_anomalies += 1;
                    if self.config.fail_on_timestamp_anomaly && self.pending_anomaly.is_none() {
                        self.pending_anomaly = Some(anomaly.clone());
                    }
                    let err = SinkError::TimestampAnomaly(anomaly);
                    self.notify(|l| l.on_sink_error(&err));
                }
            }
        }
    }

    fn submitted_frames(&self) -> u64 {
        match self.configuration.as_ref() {
            Some(c) if c.output_mode == OutputMode::Pcm => c
                .input_pcm_frame_size
                .filter(|&f| f > 0)
                .map(|f| self.submitted_pcm_bytes / f as u64)
                .unwrap_or(0),
            Some(_) => self.submitted_encoded_frames,
            None => 0,
        }
    }

    fn written_frames(&self) -> u64 {
        match self.configuration.as_ref() {
            Some(c) if c.output_mode == OutputMode::Pcm => c
                .output_pcm_frame_size
                .filter(|&f| f > 0)
                .map(|f| self.output.written_pcm_bytes / f as u64)
                .unwrap_or(0),
            Some(_) => self.output.written_encoded_frames,
            None => 0,
        }
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub fn pending_configuration(&self) -> Option<&Configuration> {
        self.pending_configuration.as_ref()
    }

    pub fn state(&self) -> SinkState {
        match (&self.output.device, &self.configuration) {
            (None, None) => SinkState::Idle,
            (None, Some(_)) => SinkState::Configured,
            (Some(_), _) if self.handled_end_of_stream => SinkState::Draining,
            (Some(_), _) if self.playing => SinkState::Playing,
            (Some(_), _) if self.started_since_init => SinkState::Paused,
            (Some(_), _) => SinkState::Initialized,
        }
    }

    pub fn status(&self) -> SinkStatus {
        let configuration = self.configuration.as_ref();
        let requested = self.timeline.requested();
        SinkStatus {
            state: self.state(),
            output_mode: configuration.map(|c| c.output_mode),
            output_encoding: configuration.map(|c| c.output_encoding),
            output_sample_rate: configuration.map(|c| c.output_sample_rate),
            output_channels: configuration.map(|c| c.output_channel_count),
            buffer_size: configuration.map(|c| c.buffer_size),
            buffer_duration_us: configuration.map(|c| c.buffer_duration_us()),
            active_stages: configuration
                .and_then(|c| c.chain)
                .map(|k| self.chains.get(k).active_stage_names())
                .unwrap_or_default(),
            submitted_frames: self.submitted_frames(),
            written_frames: self.written_frames(),
            playback: requested.playback,
            skip_silence: requested.skip_silence,
            skipped_silence_us: self.chains.int16.skipped_duration_us(),
            volume: self.volume,
            reconfiguration_pending: self.pending_configuration.is_some(),
            counters: self.counters.clone(),
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        if let Some(device) = self.output.device.take() {
            self.releaser.release(device);
        }
    }
}
