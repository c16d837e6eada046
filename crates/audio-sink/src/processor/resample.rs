//! Sample-rate conversion stage.
//!
//! Uses Rubato's streaming sinc resampler on 16-bit PCM converted to `f32`. Input is
//! processed in fixed chunks; the tail is resampled as a partial chunk at end of stream.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::{Encoding, PcmSpec};

use super::{AudioProcessor, StageCore, read_i16};

/// Resamples 16-bit PCM to a fixed output rate.
pub struct Resampling {
    core: StageCore,
    target_rate: Option<u32>,
    chunk_frames: usize,
    pending_resampler: Option<Async<f32>>,
    resampler: Option<Async<f32>>,
    input: Vec<f32>,
    scratch: Vec<f32>,
}

impl Resampling {
    pub fn new(chunk_frames: usize) -> Self {
        Self {
            core: StageCore::default(),
            target_rate: None,
            chunk_frames: chunk_frames.max(1),
            pending_resampler: None,
            resampler: None,
            input: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Output rate for the stream configured next; `None` disables the stage.
    pub fn set_output_sample_rate(&mut self, rate: Option<u32>) {
        self.target_rate = rate;
    }

    fn conversion_rate(&self, input: PcmSpec) -> Option<u32> {
        self.target_rate
            .filter(|&rate| rate != input.sample_rate && rate > 0)
    }

    fn build(&self, input: PcmSpec, dst_rate: u32) -> Result<Async<f32>, UnhandledFormat> {
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let ratio = dst_rate as f64 / input.sample_rate as f64;
        Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            self.chunk_frames,
            input.channel_count as usize,
            FixedAsync::Input,
        )
        .map_err(|e| UnhandledFormat::new("resampling", input, format!("resampler init: {e}")))
    }

    /// Resample `frames` frames from the front of the input queue.
    ///
    /// The frames leave the queue only once the resampler has taken them; on failure
    /// they stay queued and `false` is returned.
    fn process(&mut self, frames: usize, partial: bool) -> bool {
        let Some(spec) = self.core.input else {
            return false;
        };
        let Some(resampler) = self.resampler.as_mut() else {
            return false;
        };
        let channels = spec.channel_count as usize;
        let chunk: Vec<f32> = if partial {
            // Partial chunks still hand a full-size buffer to the resampler.
            let mut padded = self.input[..frames * channels].to_vec();
            padded.resize(self.chunk_frames * channels, 0.0);
            padded
        } else {
            self.input[..frames * channels].to_vec()
        };

        let in_frames = chunk.len() / channels;
        let out_capacity = resampler.output_frames_max();
        self.scratch.resize(out_capacity * channels, 0.0);

        let input_adapter = match InterleavedSlice::new(&chunk, channels, in_frames) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("interleaved slice (input) error: {e:#}");
                return false;
            }
        };
        let mut output_adapter =
            match InterleavedSlice::new_mut(&mut self.scratch, channels, out_capacity) {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("interleaved slice (output) error: {e:#}");
                    return false;
                }
            };
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial.then_some(frames),
        };
        let result =
            resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing));
        let produced = match result {
            Ok((_consumed, produced)) => produced,
            Err(e) => {
                tracing::error!(frames, "resampler process error: {e:#}");
                return false;
            }
        };
        self.input.drain(..frames * channels);

        let mut bytes = std::mem::take(&mut self.core.out).as_slice().to_vec();
        bytes.reserve(produced * channels * 2);
        for &f in &self.scratch[..produced * channels] {
            let s = (f.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.core.out = AudioBuf::from_vec(bytes);
        true
    }
}

impl AudioProcessor for Resampling {
    fn name(&self) -> &'static str {
        "resampling"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        if input.encoding != Encoding::Pcm16 {
            return Err(UnhandledFormat::new(self.name(), input, "expects 16-bit PCM"));
        }
        match self.conversion_rate(input) {
            Some(rate) => {
                // Rubato rejects some ratios and chunk sizes; find out before committing.
                self.build(input, rate)?;
                Ok(Some(PcmSpec::new(rate, input.channel_count, Encoding::Pcm16)))
            }
            None => Ok(None),
        }
    }

    fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        if input.encoding != Encoding::Pcm16 {
            return Err(UnhandledFormat::new(self.name(), input, "expects 16-bit PCM"));
        }
        let output = match self.conversion_rate(input) {
            Some(rate) => {
                self.pending_resampler = Some(self.build(input, rate)?);
                Some(PcmSpec::new(rate, input.channel_count, Encoding::Pcm16))
            }
            None => {
                self.pending_resampler = None;
                None
            }
        };
        self.core.set_pending(input, output);
        Ok(output)
    }

    fn is_active(&self) -> bool {
        self.core.output.is_some() && self.resampler.is_some()
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
        self.input.extend(
            read_i16(input.take(frames * frame_size)).map(|s| s as f32 / i16::MAX as f32),
        );
        let channels = frame_size / 2;
        while self.input.len() >= self.chunk_frames * channels {
            // A failed chunk stays queued for the next call.
            if !self.process(self.chunk_frames, false) {
                break;
            }
        }
    }

    fn queue_end_of_stream(&mut self) {
        if !self.core.input_ended {
            let channels = (self.core.input_frame_size() / 2).max(1);
            let tail = self.input.len() / channels;
            if tail > 0 && !self.process(tail, true) {
                tracing::warn!(frames = tail, "dropping unresampled tail at end of stream");
            }
            self.input.clear();
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
        if let Some(fresh) = self.pending_resampler.take() {
            self.resampler = Some(fresh);
        } else if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        if self.core.output.is_none() {
            self.resampler = None;
        }
        self.input.clear();
    }

    fn reset(&mut self) {
        self.core.reset();
        self.pending_resampler = None;
        self.resampler = None;
        self.input.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::run_to_end;

    #[test]
    fn same_rate_is_inactive() {
        let mut stage = Resampling::new(256);
        stage.set_output_sample_rate(Some(48_000));
        let out = stage
            .configure(PcmSpec::new(48_000, 2, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        assert!(out.is_none());
        assert!(!stage.is_active());
    }

    #[test]
    fn upsampling_doubles_frame_count_roughly() {
        let mut stage = Resampling::new(256);
        stage.set_output_sample_rate(Some(48_000));
        let out = stage
            .configure(PcmSpec::new(24_000, 1, Encoding::Pcm16))
            .unwrap()
            .unwrap();
        assert_eq!(out.sample_rate, 48_000);
        stage.flush();
        assert!(stage.is_active());
        let produced = run_to_end(&mut stage, &vec![0i16; 4096]);
        let expected = 8192i64;
        assert!((produced.len() as i64 - expected).abs() < 1024, "produced {}", produced.len());
    }

    #[test]
    fn failed_chunk_stays_queued() {
        let mut stage = Resampling::new(256);
        stage.set_output_sample_rate(Some(48_000));
        stage
            .configure(PcmSpec::new(24_000, 2, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        // Feed mono frames to a resampler built for stereo so the conversion fails.
        stage.core.input = Some(PcmSpec::new(24_000, 1, Encoding::Pcm16));

        let samples = vec![1000i16; 256];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut input = AudioBuf::from_vec(bytes);
        stage.queue_input(&mut input);

        assert!(!input.has_remaining());
        assert_eq!(stage.input.len(), 256);
        assert!(!stage.take_output().has_remaining());
    }

    #[test]
    fn target_rate_survives_reset() {
        let mut stage = Resampling::new(256);
        stage.set_output_sample_rate(Some(48_000));
        let spec = PcmSpec::new(44_100, 2, Encoding::Pcm16);
        stage.configure(spec).unwrap();
        stage.reset();
        let out = stage.configure(spec).unwrap().unwrap();
        assert_eq!(out.sample_rate, 48_000);
    }
}
