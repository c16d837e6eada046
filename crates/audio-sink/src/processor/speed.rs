use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::{Encoding, PcmSpec};

use super::{AudioProcessor, StageCore, read_i16};

const SPEED_TOLERANCE: f32 = 0.0001;

/// Below this many produced frames the requested speed is used instead of the measured ratio.
const MIN_FRAMES_FOR_DURATION_SCALING: u64 = 1024;

/// Playback speed change by linear-interpolation varispeed on 16-bit PCM.
///
/// Tempo and pitch move together: the pitch value is carried for reporting, the bundled
/// algorithm does not shift pitch independently.
#[derive(Debug)]
pub struct SpeedChange {
    core: StageCore,
    pending_speed: f32,
    pending_pitch: f32,
    speed: f32,
    pitch: f32,
    /// Interleaved samples not yet fully consumed.
    buffered: Vec<i16>,
    /// Fractional read position in frames relative to `buffered`.
    position: f64,
    input_frames: u64,
    output_frames: u64,
}

impl Default for SpeedChange {
    fn default() -> Self {
        Self {
            core: StageCore::default(),
            pending_speed: 1.0,
            pending_pitch: 1.0,
            speed: 1.0,
            pitch: 1.0,
            buffered: Vec::new(),
            position: 0.0,
            input_frames: 0,
            output_frames: 0,
        }
    }
}

impl SpeedChange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Speed to use from the next flush.
    pub fn set_speed(&mut self, speed: f32) {
        self.pending_speed = speed;
    }

    /// Pitch to report from the next flush.
    pub fn set_pitch(&mut self, pitch: f32) {
        self.pending_pitch = pitch;
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    fn channels(&self) -> usize {
        self.core.input.map(|s| s.channel_count as usize).unwrap_or(1).max(1)
    }

    fn pending_input_frames(&self) -> f64 {
        let frames = (self.buffered.len() / self.channels()) as f64;
        (frames - self.position).max(0.0)
    }

    /// Media time covered by `playout_us` of output, from the ratio actually achieved.
    pub fn media_duration_for_playout_duration(&self, playout_us: i64) -> i64 {
        if self.output_frames >= MIN_FRAMES_FOR_DURATION_SCALING {
            let processed = self.input_frames as f64 - self.pending_input_frames();
            (playout_us as f64 * processed / self.output_frames as f64).round() as i64
        } else {
            (self.speed as f64 * playout_us as f64).round() as i64
        }
    }

    /// Produce frames while interpolation has both neighbours available, or all of
    /// them at end of stream.
    fn render(&mut self, to_end: bool) {
        let channels = self.channels();
        let frames = self.buffered.len() / channels;
        let step = self.speed as f64;
        let mut out = Vec::new();
        loop {
            let index = self.position.floor() as usize;
            let have_next = index + 1 < frames;
            if !(have_next || (to_end && index < frames)) {
                break;
            }
            let frac = (self.position - index as f64) as f32;
            for ch in 0..channels {
                let a = self.buffered[index * channels + ch] as f32;
                let b = if have_next {
                    self.buffered[(index + 1) * channels + ch] as f32
                } else {
                    a
                };
                let s = (a + (b - a) * frac).round() as i16;
                out.extend_from_slice(&s.to_le_bytes());
            }
            self.output_frames += 1;
            self.position += step;
        }
        let consumed = (self.position.floor() as usize).min(frames);
        self.buffered.drain(..consumed * channels);
        self.position -= consumed as f64;
        if !out.is_empty() {
            self.core.out = AudioBuf::from_vec(out);
        }
    }
}

impl AudioProcessor for SpeedChange {
    fn name(&self) -> &'static str {
        "speed_change"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        if input.encoding != Encoding::Pcm16 {
            return Err(UnhandledFormat::new(self.name(), input, "expects 16-bit PCM"));
        }
        Ok(Some(input))
    }

    fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        let output = self.output_format(input)?;
        self.core.set_pending(input, output);
        Ok(output)
    }

    fn is_active(&self) -> bool {
        self.core.input.is_some()
            && ((self.speed - 1.0).abs() >= SPEED_TOLERANCE
                || (self.pitch - 1.0).abs() >= SPEED_TOLERANCE)
    }

    fn queue_input(&mut self, input: &mut AudioBuf) {
        let frame_size = self.core.input_frame_size();
        if frame_size == 0 {
            input.advance(input.remaining());
            return;
        }
        let frames = input.remaining() / frame_size;
        if frames == 0 {
            return;
        }
        self.buffered.extend(read_i16(input.take(frames * frame_size)));
        self.input_frames += frames as u64;
        self.render(false);
    }

    fn queue_end_of_stream(&mut self) {
        if !self.core.input_ended {
            self.render(true);
            self.buffered.clear();
            self.position = 0.0;
        }
        self.core.input_ended = true;
    }

    fn take_output(&mut self) -> AudioBuf {
        self.core.take_output()
    }

    fn is_ended(&self) -> bool {
        self.core.is_ended()
    }

    fn flush(&mut self) {
        self.core.flush();
        self.speed = self.pending_speed;
        self.pitch = self.pending_pitch;
        self.buffered.clear();
        self.position = 0.0;
        self.input_frames = 0;
        self.output_frames = 0;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
