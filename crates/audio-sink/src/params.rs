//! Playback parameters and the checkpoint timeline that maps device time to media time.
//!
//! A parameter change cannot take effect retroactively on audio that is already inside
//! the processing chain or the device. Each applied change becomes a [`Checkpoint`]
//! anchored at the device time reached when the first audio processed with it plays
//! out. Changes requested while a device is open wait in
//! [`ParameterTransition::PendingUntilDrain`] until the sink has drained the chain.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::SinkError;

const MIN_SPEED: f32 = 0.1;
const MAX_SPEED: f32 = 8.0;
const MIN_PITCH: f32 = 0.1;
const MAX_PITCH: f32 = 8.0;

/// Requested playback speed and pitch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlaybackParameters {
    pub speed: f32,
    pub pitch: f32,
}

impl PlaybackParameters {
    pub const DEFAULT: PlaybackParameters = PlaybackParameters {
        speed: 1.0,
        pitch: 1.0,
    };

    pub fn new(speed: f32, pitch: f32) -> Self {
        Self { speed, pitch }
    }

    /// Reject non-positive or non-finite values and clamp the rest into the supported range.
    pub fn validated(self) -> Result<Self, SinkError> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(SinkError::InvalidParameters(format!("speed {}", self.speed)));
        }
        if !self.pitch.is_finite() || self.pitch <= 0.0 {
            return Err(SinkError::InvalidParameters(format!("pitch {}", self.pitch)));
        }
        Ok(Self {
            speed: self.speed.clamp(MIN_SPEED, MAX_SPEED),
            pitch: self.pitch.clamp(MIN_PITCH, MAX_PITCH),
        })
    }
}

impl Default for PlaybackParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Everything the processing chain is steered by at a point in the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct ParameterSet {
    pub playback: PlaybackParameters,
    pub skip_silence: bool,
}

/// Parameters in effect from `device_time_us` onwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Checkpoint {
    pub params: ParameterSet,
    /// Media time that was current when the parameters were applied.
    pub media_time_us: i64,
    /// Output duration written to the device when the parameters were applied.
    pub device_time_us: i64,
    /// Skipped-silence duration already counted when the parameters were applied.
    pub skipped_us_at_anchor: i64,
}

impl Checkpoint {
    fn origin(params: ParameterSet) -> Self {
        Self {
            params,
            media_time_us: 0,
            device_time_us: 0,
            skipped_us_at_anchor: 0,
        }
    }
}

/// Whether the last requested parameters have reached the processing chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParameterTransition {
    Applied,
    /// Requested while audio was in flight; applied once the chain has drained.
    PendingUntilDrain(ParameterSet),
}

/// The active checkpoint, those still ahead of the device, and any deferred request.
#[derive(Debug)]
pub struct ParameterTimeline {
    /// Latest request, whether or not the chain can honour it.
    requested: ParameterSet,
    active: Checkpoint,
    queued: VecDeque<Checkpoint>,
    transition: ParameterTransition,
}

impl Default for ParameterTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterTimeline {
    pub fn new() -> Self {
        Self {
            requested: ParameterSet::default(),
            active: Checkpoint::origin(ParameterSet::default()),
            queued: VecDeque::new(),
            transition: ParameterTransition::Applied,
        }
    }

    /// The parameters the caller asked for most recently.
    ///
    /// A deferred request wins over the newest queued checkpoint, which wins over the
    /// active one.
    pub fn target(&self) -> ParameterSet {
        if let ParameterTransition::PendingUntilDrain(params) = self.transition {
            return params;
        }
        self.queued
            .back()
            .map(|c| c.params)
            .unwrap_or(self.active.params)
    }

    pub fn requested(&self) -> ParameterSet {
        self.requested
    }

    pub fn transition(&self) -> ParameterTransition {
        self.transition
    }

    pub fn active(&self) -> &Checkpoint {
        &self.active
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn last_queued(&self) -> Option<&Checkpoint> {
        self.queued.back()
    }

    /// Record a request. With `in_flight` audio it waits for a drain, otherwise it
    /// replaces the active parameters directly.
    pub fn request(&mut self, params: ParameterSet, in_flight: bool) {
        self.requested = params;
        if in_flight {
            self.transition = ParameterTransition::PendingUntilDrain(params);
        } else {
            self.active.params = params;
            self.transition = ParameterTransition::Applied;
        }
    }

    pub fn has_pending_until_drain(&self) -> bool {
        matches!(self.transition, ParameterTransition::PendingUntilDrain(_))
    }

    /// Mark a deferred request as handled. The sink records the checkpoint itself.
    pub fn finish_drain(&mut self) {
        self.transition = ParameterTransition::Applied;
    }

    /// Queue parameters that apply once the device reaches `device_time_us`.
    pub fn push(&mut self, params: ParameterSet, media_time_us: i64, device_time_us: i64, skipped_us: i64) {
        tracing::debug!(
            speed = params.playback.speed,
            skip_silence = params.skip_silence,
            media_time_us,
            device_time_us,
            "playback parameter checkpoint"
        );
        self.queued.push_back(Checkpoint {
            params,
            media_time_us: media_time_us.max(0),
            device_time_us,
            skipped_us_at_anchor: skipped_us,
        });
    }

    /// Media time for a device playout position.
    ///
    /// Checkpoints whose anchor has been reached become active. Within the newest
    /// checkpoint `media_duration` maps playout to media time at the achieved speed;
    /// while a newer checkpoint is queued the active checkpoint's target speed is used.
    pub fn media_position(
        &mut self,
        device_position_us: i64,
        media_duration: impl Fn(i64) -> i64,
    ) -> i64 {
        while self
            .queued
            .front()
            .is_some_and(|next| device_position_us >= next.device_time_us)
        {
            if let Some(next) = self.queued.pop_front() {
                self.active = next;
            }
        }

        let playout_us = device_position_us - self.active.device_time_us;
        if self.queued.is_empty() {
            self.active.media_time_us + media_duration(playout_us)
        } else {
            let speed = self.active.params.playback.speed as f64;
            self.active.media_time_us + (playout_us as f64 * speed).round() as i64
        }
    }

    /// Forget all checkpoints, keeping the most recent target as the new origin.
    pub fn reset(&mut self) {
        let params = self.target();
        self.active = Checkpoint::origin(params);
        self.queued.clear();
        self.transition = ParameterTransition::Applied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(speed: f32) -> ParameterSet {
        ParameterSet {
            playback: PlaybackParameters::new(speed, 1.0),
            skip_silence: false,
        }
    }

    #[test]
    fn parameters_are_clamped_and_validated() {
        let p = PlaybackParameters::new(20.0, 0.01).validated().unwrap();
        assert_eq!(p, PlaybackParameters::new(8.0, 0.1));
        assert!(PlaybackParameters::new(0.0, 1.0).validated().is_err());
        assert!(PlaybackParameters::new(1.0, f32::NAN).validated().is_err());
    }

    #[test]
    fn deferred_request_takes_precedence() {
        let mut timeline = ParameterTimeline::new();
        timeline.push(set(1.5), 0, 0, 0);
        assert_eq!(timeline.target(), set(1.5));
        timeline.request(set(2.0), true);
        assert_eq!(timeline.target(), set(2.0));
        assert!(timeline.has_pending_until_drain());
        timeline.finish_drain();
        assert_eq!(timeline.target(), set(1.5));
    }

    #[test]
    fn idle_request_applies_directly() {
        let mut timeline = ParameterTimeline::new();
        timeline.request(set(2.0), false);
        assert_eq!(timeline.transition(), ParameterTransition::Applied);
        assert_eq!(timeline.active().params, set(2.0));
    }

    #[test]
    fn checkpoints_are_consumed_as_device_advances() {
        let mut timeline = ParameterTimeline::new();
        timeline.push(set(1.0), 0, 0, 0);
        timeline.push(set(2.0), 1_000_000, 1_000_000, 0);

        // Before the second anchor the first checkpoint's target speed is used.
        assert_eq!(timeline.media_position(500_000, |d| d * 100), 500_000);
        assert_eq!(timeline.queued_len(), 1);

        // Past it, the newest checkpoint uses the chain's mapping.
        assert_eq!(timeline.media_position(1_500_000, |d| d * 2), 2_000_000);
        assert_eq!(timeline.queued_len(), 0);
        assert_eq!(timeline.active().media_time_us, 1_000_000);
    }

    #[test]
    fn reset_keeps_target() {
        let mut timeline = ParameterTimeline::new();
        timeline.push(set(1.25), 10, 10, 0);
        timeline.reset();
        assert_eq!(timeline.queued_len(), 0);
        assert_eq!(timeline.active().params, set(1.25));
        assert_eq!(timeline.active().media_time_us, 0);
    }
}
