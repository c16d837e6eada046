//! Playback position tracking for an open device.
//!
//! The tracker samples the device's consumed-frame counter and, when available, its
//! hardware timestamps. Playhead samples are smoothed into an offset against the
//! system clock; timestamps are used once they are seen advancing and pass sanity
//! checks. Implausible timestamps are reported as anomalies and ignored.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;
use crate::device::{AudioDevice, DeviceTimestamp};
use crate::error::{AnomalyKind, TimestampAnomaly};
use crate::format::{Encoding, duration_us_to_frames, frames_to_duration_us};
use crate::resolver::OutputMode;

const MAX_PLAYHEAD_OFFSET_COUNT: usize = 10;
const MIN_PLAYHEAD_OFFSET_SAMPLE_INTERVAL_US: i64 = 30_000;
const MAX_AUDIO_TIMESTAMP_OFFSET_US: i64 = 5_000_000;
/// Extra time without progress, beyond one buffer duration, before a device counts as stalled.
const STALL_GRACE_US: i64 = 200_000;

const FAST_POLL_INTERVAL_US: i64 = 10_000;
const SLOW_POLL_INTERVAL_US: i64 = 10_000_000;
const ERROR_POLL_INTERVAL_US: i64 = 500_000;
/// Give up waiting for a first timestamp after this long.
const INITIALIZING_DURATION_US: i64 = 500_000;

/// Something the sink should forward to its listener.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    Underrun {
        buffer_size: usize,
        buffer_duration_us: i64,
    },
    PositionAdvancing {
        playout_start_system_time_us: i64,
    },
    TimestampAnomaly(TimestampAnomaly),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlayState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimestampState {
    Initializing,
    /// A timestamp was seen but has not moved yet.
    Timestamp,
    Advancing,
    NoTimestamp,
    Error,
}

/// Polls hardware timestamps at a rate that depends on how trustworthy they are.
#[derive(Debug)]
struct TimestampPoller {
    state: TimestampState,
    state_since_us: i64,
    last_poll_us: i64,
    initial_frame_position: u64,
    accepted: Option<DeviceTimestamp>,
    candidate: Option<DeviceTimestamp>,
}

impl TimestampPoller {
    fn new(now_us: i64) -> Self {
        Self {
            state: TimestampState::Initializing,
            state_since_us: now_us,
            last_poll_us: i64::MIN,
            initial_frame_position: 0,
            accepted: None,
            candidate: None,
        }
    }

    fn set_state(&mut self, state: TimestampState, now_us: i64) {
        self.state = state;
        self.state_since_us = now_us;
    }

    fn poll_interval_us(&self) -> i64 {
        match self.state {
            TimestampState::Initializing | TimestampState::Timestamp => FAST_POLL_INTERVAL_US,
            TimestampState::Advancing | TimestampState::NoTimestamp => SLOW_POLL_INTERVAL_US,
            TimestampState::Error => ERROR_POLL_INTERVAL_US,
        }
    }

    /// Fetch a timestamp if one is due. Returns the candidate that needs validating.
    fn poll(&mut self, device: &dyn AudioDevice, now_us: i64) -> Option<DeviceTimestamp> {
        if now_us.saturating_sub(self.last_poll_us) < self.poll_interval_us() {
            return None;
        }
        self.last_poll_us = now_us;
        let timestamp = device.timestamp();

        match self.state {
            TimestampState::Initializing => match timestamp {
                Some(ts) => {
                    self.initial_frame_position = ts.frame_position;
                    self.set_state(TimestampState::Timestamp, now_us);
                }
                None if now_us - self.state_since_us > INITIALIZING_DURATION_US => {
                    self.set_state(TimestampState::NoTimestamp, now_us);
                }
                None => {}
            },
            TimestampState::Timestamp => match timestamp {
                Some(ts) if ts.frame_position > self.initial_frame_position => {
                    self.set_state(TimestampState::Advancing, now_us);
                }
                Some(_) => {}
                None => self.reset(now_us),
            },
            TimestampState::Advancing => {
                if timestamp.is_none() {
                    self.reset(now_us);
                }
            }
            TimestampState::NoTimestamp => {
                if timestamp.is_some() {
                    self.reset(now_us);
                }
            }
            TimestampState::Error => {
                // Try again from scratch.
                self.reset(now_us);
            }
        }
        self.candidate = timestamp;
        timestamp
    }

    fn accept(&mut self) {
        if self.state == TimestampState::Advancing {
            self.accepted = self.candidate;
        }
    }

    fn reject(&mut self, now_us: i64) {
        self.accepted = None;
        self.set_state(TimestampState::Error, now_us);
    }

    fn advancing(&self) -> Option<DeviceTimestamp> {
        match self.state {
            TimestampState::Advancing => self.accepted,
            _ => None,
        }
    }

    fn reset(&mut self, now_us: i64) {
        self.accepted = None;
        self.candidate = None;
        self.initial_frame_position = 0;
        self.set_state(TimestampState::Initializing, now_us);
    }
}

/// Where the device is playing, whether it still has data, and whether it is stuck.
pub struct PositionTracker {
    clock: Arc<dyn Clock>,
    mode: OutputMode,
    sample_rate: u32,
    buffer_size: usize,
    buffer_size_us: i64,
    /// Buffer capacity in frames, known only for PCM.
    buffer_frames: Option<u64>,
    state: PlayState,

    playhead_offsets: [i64; MAX_PLAYHEAD_OFFSET_COUNT],
    next_playhead_offset_index: usize,
    playhead_offset_count: usize,
    smoothed_playhead_offset_us: i64,
    last_playhead_sample_us: i64,

    poller: TimestampPoller,
    last_timestamp: Option<DeviceTimestamp>,
    last_position_us: i64,

    has_data: bool,
    stop_timestamp_us: Option<i64>,
    stop_head_frames: u64,
    end_head_frames: u64,

    last_head_frames: u64,
    last_progress_us: i64,
    playback_started: bool,
    underrun_reported_for_stall: bool,
    advancing_reported: bool,

    events: VecDeque<TrackerEvent>,
}

impl PositionTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_us();
        Self {
            clock,
            mode: OutputMode::Pcm,
            sample_rate: 0,
            buffer_size: 0,
            buffer_size_us: 0,
            buffer_frames: None,
            state: PlayState::Stopped,
            playhead_offsets: [0; MAX_PLAYHEAD_OFFSET_COUNT],
            next_playhead_offset_index: 0,
            playhead_offset_count: 0,
            smoothed_playhead_offset_us: 0,
            last_playhead_sample_us: i64::MIN,
            poller: TimestampPoller::new(now),
            last_timestamp: None,
            last_position_us: 0,
            has_data: false,
            stop_timestamp_us: None,
            stop_head_frames: 0,
            end_head_frames: 0,
            last_head_frames: 0,
            last_progress_us: now,
            playback_started: false,
            underrun_reported_for_stall: false,
            advancing_reported: false,
            events: VecDeque::new(),
        }
    }

    /// Start tracking a freshly opened device.
    ///
    /// `frame_size` is the output PCM frame size, `None` for encoded output.
    pub fn set_device(
        &mut self,
        mode: OutputMode,
        encoding: Encoding,
        sample_rate: u32,
        frame_size: Option<usize>,
        buffer_size: usize,
    ) {
        self.reset();
        self.mode = mode;
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        match frame_size.filter(|&f| f > 0) {
            Some(frame_size) => {
                let frames = (buffer_size / frame_size) as u64;
                self.buffer_frames = Some(frames);
                self.buffer_size_us = frames_to_duration_us(frames, sample_rate);
            }
            None => {
                self.buffer_frames = None;
                self.buffer_size_us = encoding
                    .max_bytes_per_second()
                    .filter(|&bps| bps > 0)
                    .map(|bps| (buffer_size as u128 * 1_000_000 / bps as u128) as i64)
                    .unwrap_or(0);
            }
        }
        tracing::debug!(
            ?mode,
            sample_rate,
            buffer_size,
            buffer_size_us = self.buffer_size_us,
            "position tracker attached"
        );
    }

    pub fn buffer_size_us(&self) -> i64 {
        self.buffer_size_us
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayState::Playing
    }

    pub fn start(&mut self) {
        let now = self.clock.now_us();
        if let Some(stop) = self.stop_timestamp_us {
            // Resuming after end of stream: keep extrapolating from now.
            self.stop_timestamp_us = Some(now.max(stop));
        }
        self.last_progress_us = now;
        self.poller.reset(now);
        self.state = PlayState::Playing;
    }

    /// Returns whether the device itself should be paused.
    pub fn pause(&mut self, device: &dyn AudioDevice) -> bool {
        self.reset_sync_params();
        if self.stop_timestamp_us.is_none() {
            self.state = PlayState::Paused;
            return true;
        }
        // Already stopped at end of stream; freeze the extrapolated head.
        self.stop_head_frames = self.head_frames(device);
        self.state = PlayState::Paused;
        false
    }

    /// Everything up to `written_frames` has been handed to the device and it was told to stop.
    pub fn handle_end_of_stream(&mut self, device: &dyn AudioDevice, written_frames: u64) {
        self.stop_head_frames = self.head_frames(device);
        self.stop_timestamp_us = Some(self.clock.now_us());
        self.end_head_frames = written_frames;
    }

    /// Detach from the device and forget everything learned about it.
    pub fn reset(&mut self) {
        let now = self.clock.now_us();
        self.reset_sync_params();
        self.poller = TimestampPoller::new(now);
        self.state = PlayState::Stopped;
        self.last_position_us = 0;
        self.has_data = false;
        self.stop_timestamp_us = None;
        self.stop_head_frames = 0;
        self.end_head_frames = 0;
        self.last_head_frames = 0;
        self.last_progress_us = now;
        self.playback_started = false;
        self.underrun_reported_for_stall = false;
        self.advancing_reported = false;
    }

    fn reset_sync_params(&mut self) {
        self.playhead_offsets = [0; MAX_PLAYHEAD_OFFSET_COUNT];
        self.next_playhead_offset_index = 0;
        self.playhead_offset_count = 0;
        self.smoothed_playhead_offset_us = 0;
        self.last_playhead_sample_us = i64::MIN;
        self.last_timestamp = None;
    }

    /// Events raised since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = TrackerEvent> + '_ {
        self.events.drain(..)
    }

    fn frames_to_us(&self, frames: u64) -> i64 {
        frames_to_duration_us(frames, self.sample_rate)
    }

    /// Frames the device has played, extrapolated after end of stream.
    fn head_frames(&self, device: &dyn AudioDevice) -> u64 {
        let reported = device.consumed_frames();
        match self.stop_timestamp_us {
            Some(_) if self.state == PlayState::Paused => self.stop_head_frames.max(reported),
            Some(stop_us) => {
                let elapsed = self.clock.now_us() - stop_us;
                let extrapolated =
                    self.stop_head_frames + duration_us_to_frames(elapsed, self.sample_rate);
                extrapolated.max(reported).min(self.end_head_frames.max(reported))
            }
            None => reported,
        }
    }

    fn head_position_us(&self, device: &dyn AudioDevice) -> i64 {
        self.frames_to_us(self.head_frames(device))
    }

    /// Current output position in microseconds of device playout.
    pub fn current_position_us(&mut self, device: &dyn AudioDevice, source_ended: bool) -> i64 {
        if self.state == PlayState::Playing {
            self.sample_sync_params(device);
        }
        let now = self.clock.now_us();

        let position = match self.poller.advancing() {
            Some(ts) => self.frames_to_us(ts.frame_position) + (now - ts.system_time_us),
            None if self.playhead_offset_count == 0 || self.state != PlayState::Playing => {
                self.head_position_us(device)
            }
            None => now + self.smoothed_playhead_offset_us,
        };

        let mut position = position.max(0);
        if source_ended {
            // Never run past what the device was given.
            let end_us = self.frames_to_us(self.end_head_frames.max(self.head_frames(device)));
            if self.stop_timestamp_us.is_some() {
                position = position.min(end_us);
            }
        }
        if self.state == PlayState::Playing {
            position = position.max(self.last_position_us);
        }
        self.last_position_us = position;
        position
    }

    fn sample_sync_params(&mut self, device: &dyn AudioDevice) {
        let now = self.clock.now_us();
        if now.saturating_sub(self.last_playhead_sample_us) >= MIN_PLAYHEAD_OFFSET_SAMPLE_INTERVAL_US {
            let head_us = self.head_position_us(device);
            if head_us == 0 {
                // The device has not started yet.
                return;
            }
            self.playhead_offsets[self.next_playhead_offset_index] = head_us - now;
            self.next_playhead_offset_index =
                (self.next_playhead_offset_index + 1) % MAX_PLAYHEAD_OFFSET_COUNT;
            if self.playhead_offset_count < MAX_PLAYHEAD_OFFSET_COUNT {
                self.playhead_offset_count += 1;
            }
            self.last_playhead_sample_us = now;
            let sum: i64 = self.playhead_offsets[..self.playhead_offset_count].iter().sum();
            self.smoothed_playhead_offset_us = sum / self.playhead_offset_count as i64;
        }
        self.poll_and_check_timestamp(device, now);
    }

    fn poll_and_check_timestamp(&mut self, device: &dyn AudioDevice, now: i64) {
        let Some(ts) = self.poller.poll(device, now) else {
            return;
        };
        let playhead_us = self.head_position_us(device);
        let anomaly = |kind| TimestampAnomaly {
            kind,
            frame_position: ts.frame_position,
            system_time_us: ts.system_time_us,
            now_us: now,
            playhead_us,
        };

        let kind = if self.last_timestamp.is_some_and(|prev| {
            ts.frame_position < prev.frame_position || ts.system_time_us < prev.system_time_us
        }) {
            Some(AnomalyKind::NonMonotonic)
        } else if (ts.system_time_us - now).abs() > MAX_AUDIO_TIMESTAMP_OFFSET_US {
            Some(AnomalyKind::SystemTimeMismatch)
        } else if (self.frames_to_us(ts.frame_position) - playhead_us).abs()
            > MAX_AUDIO_TIMESTAMP_OFFSET_US
        {
            Some(AnomalyKind::FramePositionMismatch)
        } else if let Some(prev) = self.last_timestamp {
            let media_us = self.frames_to_us(ts.frame_position - prev.frame_position);
            let wall_us = ts.system_time_us - prev.system_time_us;
            (media_us > wall_us + self.buffer_size_us).then_some(AnomalyKind::FasterThanWallClock)
        } else {
            None
        };

        match kind {
            Some(kind) => {
                let anomaly = anomaly(kind);
                tracing::warn!(
                    ?kind,
                    frame_position = anomaly.frame_position,
                    system_time_us = anomaly.system_time_us,
                    now_us = now,
                    playhead_us,
                    "rejecting device timestamp"
                );
                self.poller.reject(now);
                self.last_timestamp = None;
                self.events.push_back(TrackerEvent::TimestampAnomaly(anomaly));
            }
            None => {
                self.poller.accept();
                self.last_timestamp = Some(ts);
                if let Some(accepted) = self.poller.advancing() {
                    self.report_advancing(
                        accepted.system_time_us - self.frames_to_us(accepted.frame_position),
                    );
                }
            }
        }
    }

    fn report_advancing(&mut self, playout_start_system_time_us: i64) {
        if !self.advancing_reported {
            self.advancing_reported = true;
            self.events.push_back(TrackerEvent::PositionAdvancing {
                playout_start_system_time_us,
            });
        }
    }

    /// Record head progress, used for underrun and stall detection.
    fn observe_head(&mut self, device: &dyn AudioDevice) -> u64 {
        let head = self.head_frames(device);
        if head != self.last_head_frames {
            self.last_head_frames = head;
            self.last_progress_us = self.clock.now_us();
            self.underrun_reported_for_stall = false;
            if head > 0 && !self.playback_started && self.state == PlayState::Playing {
                self.playback_started = true;
                let now = self.clock.now_us();
                let start = now - self.frames_to_us(head);
                self.report_advancing(start);
            }
        }
        head
    }

    /// Whether written data has not been played out yet.
    pub fn has_pending_data(&mut self, device: &dyn AudioDevice, written_frames: u64) -> bool {
        written_frames > self.observe_head(device)
    }

    /// Whether another write is worth attempting.
    ///
    /// Also detects underruns: the device had data and now has none while playing.
    pub fn may_handle_buffer(&mut self, device: &dyn AudioDevice, written_frames: u64) -> bool {
        let had_data = self.has_data;
        let head = self.observe_head(device);
        self.has_data = written_frames > head;
        if had_data && !self.has_data && self.state != PlayState::Stopped {
            tracing::warn!(
                buffer_size = self.buffer_size,
                buffer_size_us = self.buffer_size_us,
                "audio underrun"
            );
            self.push_underrun();
        }
        match self.buffer_frames {
            Some(capacity) => written_frames.saturating_sub(head) < capacity.max(1),
            None => true,
        }
    }

    fn push_underrun(&mut self) {
        self.events.push_back(TrackerEvent::Underrun {
            buffer_size: self.buffer_size,
            buffer_duration_us: self.buffer_size_us,
        });
    }

    /// The device has pending data but has not made progress for too long.
    ///
    /// Only a device that never started counts as stalled. One that started and then
    /// stopped moving is reported as an underrun instead.
    pub fn is_stalled(&mut self, device: &dyn AudioDevice, written_frames: u64) -> bool {
        if self.state != PlayState::Playing || written_frames == 0 {
            return false;
        }
        let head = self.observe_head(device);
        if written_frames <= head {
            return false;
        }
        let idle_us = self.clock.now_us() - self.last_progress_us;
        if idle_us <= self.buffer_size_us + STALL_GRACE_US {
            return false;
        }
        if self.playback_started {
            if !self.underrun_reported_for_stall {
                self.underrun_reported_for_stall = true;
                tracing::warn!(idle_us, "device stopped consuming data");
                self.push_underrun();
            }
            return false;
        }
        true
    }
}
