use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::{Encoding, PcmSpec, duration_us_to_frames, frames_to_duration_us};

use super::{AudioProcessor, StageCore, read_i16};

/// Thresholds for [`SilenceSkipping`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SilenceSkippingConfig {
    /// Samples with a magnitude below this are silent.
    pub threshold: i16,
    /// Silence must last this long before any of it is skipped.
    pub min_silence_duration_us: i64,
    /// Silence retained at both edges of a skipped section.
    pub padding_us: i64,
}

impl Default for SilenceSkippingConfig {
    fn default() -> Self {
        Self {
            threshold: 1024,
            min_silence_duration_us: 150_000,
            padding_us: 20_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SilenceState {
    Noisy,
    MaybeSilent,
    Silent,
}

/// Shortens long stretches of silence in 16-bit PCM.
///
/// The skipped-frame counter is monotonic across flushes and only cleared by `reset`.
#[derive(Debug)]
pub struct SilenceSkipping {
    core: StageCore,
    config: SilenceSkippingConfig,
    pending_enabled: bool,
    enabled: bool,
    state: SilenceState,
    maybe_silence: Vec<u8>,
    maybe_capacity: usize,
    padding: Vec<u8>,
    padding_capacity: usize,
    skipped_frames: u64,
    skipped_frames_at_rate: u64,
    skipped_us_base: i64,
}

impl SilenceSkipping {
    pub fn new(config: SilenceSkippingConfig) -> Self {
        Self {
            core: StageCore::default(),
            config,
            pending_enabled: false,
            enabled: false,
            state: SilenceState::Noisy,
            maybe_silence: Vec::new(),
            maybe_capacity: 0,
            padding: Vec::new(),
            padding_capacity: 0,
            skipped_frames: 0,
            skipped_frames_at_rate: 0,
            skipped_us_base: 0,
        }
    }

    /// Enable or disable skipping from the next flush.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.pending_enabled = enabled;
    }

    pub fn skipped_frame_count(&self) -> u64 {
        self.skipped_frames
    }

    /// Media time removed so far.
    pub fn skipped_duration_us(&self) -> i64 {
        let rate = self.core.input.map(|s| s.sample_rate).unwrap_or(0);
        self.skipped_us_base + frames_to_duration_us(self.skipped_frames_at_rate, rate)
    }

    fn is_silent(&self, frame: &[u8]) -> bool {
        let threshold = self.config.threshold.unsigned_abs();
        read_i16(frame).all(|s| s.unsigned_abs() < threshold)
    }

    fn skip_frames(&mut self, frames: u64) {
        self.skipped_frames += frames;
        self.skipped_frames_at_rate += frames;
    }
}

impl Default for SilenceSkipping {
    fn default() -> Self {
        Self::new(SilenceSkippingConfig::default())
    }
}

impl AudioProcessor for SilenceSkipping {
    fn name(&self) -> &'static str {
        "silence_skipping"
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
        self.enabled && self.core.input.is_some()
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
        let src = input.take(frames * frame_size).to_vec();
        let mut out = Vec::with_capacity(src.len());

        for frame in src.chunks_exact(frame_size) {
            let silent = self.is_silent(frame);
            match (self.state, silent) {
                (SilenceState::Noisy, false) => out.extend_from_slice(frame),
                (SilenceState::Noisy, true) => {
                    self.maybe_silence.extend_from_slice(frame);
                    self.state = SilenceState::MaybeSilent;
                }
                (SilenceState::MaybeSilent, true) => {
                    self.maybe_silence.extend_from_slice(frame);
                    if self.maybe_silence.len() >= self.maybe_capacity {
                        // Keep the leading padding, the rest becomes skippable tail.
                        let lead = self.padding_capacity.min(self.maybe_silence.len());
                        out.extend_from_slice(&self.maybe_silence[..lead]);
                        self.padding.extend_from_slice(&self.maybe_silence[lead..]);
                        self.maybe_silence.clear();
                        let excess = self.padding.len().saturating_sub(self.padding_capacity);
                        self.padding.drain(..excess);
                        self.skip_frames((excess / frame_size) as u64);
                        self.state = SilenceState::Silent;
                    }
                }
                (SilenceState::MaybeSilent, false) => {
                    out.append(&mut self.maybe_silence);
                    out.extend_from_slice(frame);
                    self.state = SilenceState::Noisy;
                }
                (SilenceState::Silent, true) => {
                    self.padding.extend_from_slice(frame);
                    if self.padding.len() > self.padding_capacity {
                        self.padding.drain(..frame_size);
                        self.skip_frames(1);
                    }
                }
                (SilenceState::Silent, false) => {
                    out.append(&mut self.padding);
                    out.extend_from_slice(frame);
                    self.state = SilenceState::Noisy;
                }
            }
        }

        if !out.is_empty() {
            self.core.out = AudioBuf::from_vec(out);
        }
    }

    fn queue_end_of_stream(&mut self) {
        let mut tail = std::mem::take(&mut self.maybe_silence);
        tail.append(&mut self.padding);
        if !tail.is_empty() {
            self.core.out = AudioBuf::from_vec(tail);
        }
        self.state = SilenceState::Noisy;
        self.core.input_ended = true;
    }

    fn take_output(&mut self) -> AudioBuf {
        self.core.take_output()
    }

    fn is_ended(&self) -> bool {
        self.core.is_ended()
    }

    fn flush(&mut self) {
        let previous_rate = self.core.input.map(|s| s.sample_rate).unwrap_or(0);
        self.core.flush();
        let spec = self.core.input;
        let rate = spec.map(|s| s.sample_rate).unwrap_or(0);
        if rate != previous_rate {
            self.skipped_us_base += frames_to_duration_us(self.skipped_frames_at_rate, previous_rate);
            self.skipped_frames_at_rate = 0;
        }
        self.enabled = self.pending_enabled;
        self.state = SilenceState::Noisy;
        self.maybe_silence.clear();
        self.padding.clear();
        let frame_size = spec.map(|s| s.frame_size()).unwrap_or(0);
        let min_frames = duration_us_to_frames(self.config.min_silence_duration_us, rate) as usize;
        let pad_frames = duration_us_to_frames(self.config.padding_us, rate) as usize;
        self.maybe_capacity = min_frames.max(1) * frame_size;
        self.padding_capacity = pad_frames.min(min_frames) * frame_size;
    }

    fn reset(&mut self) {
        let config = self.config;
        *self = Self::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::run_to_end;

    /// 1 kHz mono so frame counts equal milliseconds.
    fn stage(min_ms: i64, pad_ms: i64) -> SilenceSkipping {
        let mut stage = SilenceSkipping::new(SilenceSkippingConfig {
            threshold: 100,
            min_silence_duration_us: min_ms * 1000,
            padding_us: pad_ms * 1000,
        });
        stage.set_enabled(true);
        stage
            .configure(PcmSpec::new(1000, 1, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        stage
    }

    #[test]
    fn disabled_stage_is_inactive() {
        let mut stage = SilenceSkipping::default();
        stage
            .configure(PcmSpec::new(48_000, 2, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        assert!(!stage.is_active());
    }

    #[test]
    fn short_silence_is_kept() {
        let mut stage = stage(10, 2);
        let mut input = vec![5000i16; 3];
        input.extend(vec![0; 5]);
        input.extend(vec![5000; 3]);
        assert_eq!(run_to_end(&mut stage, &input), input);
        assert_eq!(stage.skipped_frame_count(), 0);
    }

    #[test]
    fn long_silence_is_shortened_to_padding() {
        let mut stage = stage(10, 2);
        let mut input = vec![5000i16; 3];
        input.extend(vec![0; 30]);
        input.extend(vec![5000; 3]);
        let out = run_to_end(&mut stage, &input);
        // 2 frames of leading padding plus 2 of trailing padding survive.
        assert_eq!(out.len(), 3 + 4 + 3);
        assert_eq!(stage.skipped_frame_count(), 26);
        assert_eq!(stage.skipped_duration_us(), 26_000);
    }

    #[test]
    fn skipped_count_survives_flush() {
        let mut stage = stage(10, 2);
        run_to_end(&mut stage, &[0; 40]);
        let skipped = stage.skipped_frame_count();
        assert!(skipped > 0);
        stage.flush();
        assert_eq!(stage.skipped_frame_count(), skipped);
        stage.reset();
        assert_eq!(stage.skipped_frame_count(), 0);
    }
}
