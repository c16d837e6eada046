use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::{Encoding, PcmSpec};

use super::{AudioProcessor, StageCore};

/// Removes encoder delay from the start and encoder padding from the end of a stream.
///
/// The trailing `padding` frames are always held back. They are discarded only when the
/// stream ends while a new configuration is pending (a gapless transition); a drain in
/// the middle of a stream emits them.
#[derive(Debug, Default)]
pub struct Trimming {
    core: StageCore,
    trim_start_frames: u32,
    trim_end_frames: u32,
    reconfiguration_pending: bool,
    pending_trim_start_bytes: usize,
    end_buffer: Vec<u8>,
    end_capacity: usize,
    trimmed_frames: u64,
}

impl Trimming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames to trim for the stream configured next.
    pub fn set_trim_frame_count(&mut self, start_frames: u32, end_frames: u32) {
        self.trim_start_frames = start_frames;
        self.trim_end_frames = end_frames;
    }

    /// Frames removed since the last [`Trimming::reset_trimmed_frame_count`].
    pub fn trimmed_frame_count(&self) -> u64 {
        self.trimmed_frames
    }

    pub fn reset_trimmed_frame_count(&mut self) {
        self.trimmed_frames = 0;
    }
}

impl AudioProcessor for Trimming {
    fn name(&self) -> &'static str {
        "trimming"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        if input.encoding != Encoding::Pcm16 {
            return Err(UnhandledFormat::new(self.name(), input, "expects 16-bit PCM"));
        }
        Ok((self.trim_start_frames != 0 || self.trim_end_frames != 0).then_some(input))
    }

    fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        let output = self.output_format(input)?;
        self.reconfiguration_pending = true;
        self.core.set_pending(input, output);
        Ok(output)
    }

    fn is_active(&self) -> bool {
        self.core.output.is_some()
    }

    fn queue_input(&mut self, input: &mut AudioBuf) {
        let frame = self.core.input_frame_size();
        if frame == 0 {
            input.advance(input.remaining());
            return;
        }
        let mut remaining = input.remaining();
        if remaining == 0 {
            return;
        }

        let trim = remaining.min(self.pending_trim_start_bytes);
        self.trimmed_frames += (trim / frame) as u64;
        self.pending_trim_start_bytes -= trim;
        input.advance(trim);
        if self.pending_trim_start_bytes > 0 {
            return;
        }
        remaining -= trim;

        // Everything except the last `end_capacity` bytes seen so far can go out.
        let to_output = (self.end_buffer.len() + remaining).saturating_sub(self.end_capacity);
        let from_end = to_output.min(self.end_buffer.len());
        let from_input = (to_output - from_end).min(remaining);

        let src = input.take(remaining).to_vec();
        let out = self.core.output_vec(to_output);
        out.extend_from_slice(&self.end_buffer[..from_end]);
        out.extend_from_slice(&src[..from_input]);
        self.end_buffer.drain(..from_end);
        self.end_buffer.extend_from_slice(&src[from_input..]);
    }

    fn queue_end_of_stream(&mut self) {
        if self.reconfiguration_pending {
            let frame = self.core.input_frame_size().max(1);
            self.trimmed_frames += (self.end_buffer.len() / frame) as u64;
            self.end_buffer.clear();
        }
        self.core.input_ended = true;
    }

    fn take_output(&mut self) -> AudioBuf {
        if self.core.input_ended && !self.core.out.has_remaining() && !self.end_buffer.is_empty() {
            let held = std::mem::take(&mut self.end_buffer);
            self.core.out = AudioBuf::from_vec(held);
        }
        self.core.take_output()
    }

    fn is_ended(&self) -> bool {
        self.core.is_ended() && self.end_buffer.is_empty()
    }

    fn flush(&mut self) {
        self.core.flush();
        if self.reconfiguration_pending {
            self.reconfiguration_pending = false;
            let frame = self.core.input_frame_size();
            self.end_capacity = self.trim_end_frames as usize * frame;
            self.pending_trim_start_bytes = self.trim_start_frames as usize * frame;
        }
        self.end_buffer.clear();
    }

    fn reset(&mut self) {
        self.core.reset();
        self.trim_start_frames = 0;
        self.trim_end_frames = 0;
        self.reconfiguration_pending = false;
        self.pending_trim_start_bytes = 0;
        self.end_buffer = Vec::new();
        self.end_capacity = 0;
        self.trimmed_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::run_to_end;

    fn configured(start: u32, end: u32) -> Trimming {
        let mut stage = Trimming::new();
        stage.set_trim_frame_count(start, end);
        stage
            .configure(PcmSpec::new(48_000, 1, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        stage
    }

    #[test]
    fn no_trim_is_inactive() {
        let stage = configured(0, 0);
        assert!(!stage.is_active());
    }

    #[test]
    fn trims_start_and_counts_frames() {
        let mut stage = configured(2, 0);
        assert_eq!(run_to_end(&mut stage, &[1, 2, 3, 4, 5]), vec![3, 4, 5]);
        assert_eq!(stage.trimmed_frame_count(), 2);
    }

    #[test]
    fn padding_is_emitted_when_drained_mid_stream() {
        let mut stage = configured(0, 2);
        assert_eq!(run_to_end(&mut stage, &[1, 2, 3, 4, 5]), vec![1, 2, 3, 4, 5]);
        assert_eq!(stage.trimmed_frame_count(), 0);
    }

    #[test]
    fn padding_is_dropped_on_gapless_transition() {
        let mut stage = configured(1, 2);
        // A new stream is negotiated while the old one drains.
        stage
            .configure(PcmSpec::new(48_000, 1, Encoding::Pcm16))
            .unwrap();
        assert_eq!(run_to_end(&mut stage, &[1, 2, 3, 4, 5]), vec![2, 3]);
        assert_eq!(stage.trimmed_frame_count(), 3);
    }

    #[test]
    fn start_trim_spans_buffers() {
        let mut stage = configured(3, 0);
        let mut out = Vec::new();
        for chunk in [[1i16, 2], [3, 4], [5, 6]] {
            let mut buf = crate::processor::test_util::pcm16(&chunk);
            stage.queue_input(&mut buf);
            out.extend(crate::processor::test_util::samples(&stage.take_output()));
        }
        assert_eq!(out, vec![4, 5, 6]);
    }
}
