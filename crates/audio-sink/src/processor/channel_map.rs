use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::PcmSpec;

use super::{AudioProcessor, StageCore};

/// Reorders or drops channels: output channel `i` copies input channel `map[i]`.
#[derive(Debug, Default)]
pub struct ChannelMapping {
    core: StageCore,
    pending_map: Option<Vec<usize>>,
    map: Option<Vec<usize>>,
}

impl ChannelMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map to use from the next `configure` onwards; `None` disables the stage.
    pub fn set_channel_map(&mut self, map: Option<Vec<usize>>) {
        self.pending_map = map;
    }
}

impl AudioProcessor for ChannelMapping {
    fn name(&self) -> &'static str {
        "channel_mapping"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        let output = match &self.pending_map {
            None => None,
            Some(map) => {
                if input.encoding.bytes_per_sample().is_none() {
                    return Err(UnhandledFormat::new(self.name(), input, "not linear PCM"));
                }
                if map.is_empty() {
                    return Err(UnhandledFormat::new(self.name(), input, "empty channel map"));
                }
                if let Some(bad) = map.iter().find(|&&c| c >= input.channel_count as usize) {
                    return Err(UnhandledFormat::new(
                        self.name(),
                        input,
                        format!("channel {bad} out of range"),
                    ));
                }
                let identity = map.len() == input.channel_count as usize
                    && map.iter().enumerate().all(|(i, &c)| i == c);
                if identity {
                    None
                } else {
                    Some(PcmSpec::new(input.sample_rate, map.len() as u16, input.encoding))
                }
            }
        };
        Ok(output)
    }

    fn configure(&mut self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        let output = self.output_format(input)?;
        self.core.set_pending(input, output);
        Ok(output)
    }

    fn is_active(&self) -> bool {
        self.core.output.is_some()
    }

    fn queue_input(&mut self, input: &mut AudioBuf) {
        let (Some(spec), Some(map)) = (self.core.input, self.map.clone()) else {
            input.advance(input.remaining());
            return;
        };
        let in_frame = spec.frame_size();
        let bps = spec.encoding.bytes_per_sample().unwrap_or(2);
        let frames = input.remaining() / in_frame;
        if frames == 0 {
            return;
        }
        let src = input.take(frames * in_frame).to_vec();
        let out = self.core.output_vec(frames * map.len() * bps);
        for frame in src.chunks_exact(in_frame) {
            for &ch in &map {
                out.extend_from_slice(&frame[ch * bps..(ch + 1) * bps]);
            }
        }
    }

    fn queue_end_of_stream(&mut self) {
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
        self.map = if self.core.output.is_some() {
            self.pending_map.clone()
        } else {
            None
        };
    }

    fn reset(&mut self) {
        self.core.reset();
        self.map = None;
    }
}
