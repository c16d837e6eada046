//! Processing stages.
//!
//! A stage transforms interleaved little-endian PCM. Configuration is two-phase:
//! [`AudioProcessor::configure`] records a pending format and returns what the stage will
//! output, and the next [`AudioProcessor::flush`] makes it current. This lets a new format
//! be negotiated while audio of the previous one is still draining through the stage.

mod channel_map;
mod pcm;
mod resample;
mod silence;
mod speed;
mod trim;

pub use channel_map::ChannelMapping;
pub use pcm::{ToFloatPcm, ToInt16Pcm};
pub use resample::Resampling;
pub use silence::{SilenceSkipping, SilenceSkippingConfig};
pub use speed::SpeedChange;
pub use trim::Trimming;

use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::PcmSpec;

/// Contract shared by every processing stage.
pub trait AudioProcessor: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// The output format `configure(input)` would report. Records nothing.
    ///
    /// `None` means the stage would be inactive (pass-through) for this input.
    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat>;

    /// Record `input` as the pending input format.
    ///
    /// Returns the same result as [`output_format`](Self::output_format). Takes effect on
    /// the next `flush`.
    fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat>;

    /// Whether the stage takes part in the data path for its current format.
    fn is_active(&self) -> bool;

    /// Consume as much of `input` as the stage can take.
    fn queue_input(&mut self, input: &mut AudioBuf);

    /// No more input will follow until the next flush; emit anything held back.
    fn queue_end_of_stream(&mut self);

    /// Output produced so far (possibly empty). Ownership moves to the caller.
    fn take_output(&mut self) -> AudioBuf;

    /// End of stream was queued and every byte has been taken.
    fn is_ended(&self) -> bool;

    /// Drop buffered data and apply any pending configuration.
    fn flush(&mut self);

    /// Return to the unconfigured state.
    fn reset(&mut self);
}

/// Format bookkeeping and output slot shared by the bundled stages.
#[derive(Debug, Default)]
pub(crate) struct StageCore {
    pending_input: Option<PcmSpec>,
    pending_output: Option<PcmSpec>,
    pub(crate) input: Option<PcmSpec>,
    pub(crate) output: Option<PcmSpec>,
    pub(crate) out: AudioBuf,
    pub(crate) input_ended: bool,
}

impl StageCore {
    pub(crate) fn set_pending(&mut self, input: PcmSpec, output: Option<PcmSpec>) {
        self.pending_input = Some(input);
        self.pending_output = output;
    }

    pub(crate) fn flush(&mut self) {
        self.input = self.pending_input;
        self.output = self.pending_output;
        self.out.clear();
        self.input_ended = false;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Replace the output slot with a fresh buffer of `capacity` bytes.
    ///
    /// Must only be called once the previous output has been taken.
    pub(crate) fn output_vec(&mut self, capacity: usize) -> &mut Vec<u8> {
        debug_assert!(!self.out.has_remaining(), "output overwritten before it was taken");
        self.out.reset_with_capacity(capacity)
    }

    pub(crate) fn take_output(&mut self) -> AudioBuf {
        std::mem::take(&mut self.out)
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.input_ended && !self.out.has_remaining()
    }

    pub(crate) fn input_frame_size(&self) -> usize {
        self.input.map(|s| s.frame_size()).unwrap_or(0)
    }
}

/// Read little-endian 16-bit samples.
pub(crate) fn read_i16(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub(crate) fn pcm16(samples: &[i16]) -> AudioBuf {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        AudioBuf::from_vec(data)
    }

    pub(crate) fn samples(buf: &AudioBuf) -> Vec<i16> {
        read_i16(buf.as_slice()).collect()
    }

    /// Feed `input` to `stage`, then end the stream and collect everything it produces.
    pub(crate) fn run_to_end(stage: &mut dyn AudioProcessor, input: &[i16]) -> Vec<i16> {
        let mut out = Vec::new();
        let mut buf = pcm16(input);
        while buf.has_remaining() {
            stage.queue_input(&mut buf);
            out.extend(samples(&stage.take_output()));
        }
        stage.queue_end_of_stream();
        while !stage.is_ended() {
            out.extend(samples(&stage.take_output()));
        }
        out
    }
}
