//! PCM sample-format conversion stages.

use crate::buffer::AudioBuf;
use crate::error::UnhandledFormat;
use crate::format::{Encoding, PcmSpec};

use super::{AudioProcessor, StageCore};

/// Converts 8/24/32-bit integer and float PCM to 16-bit integer PCM.
#[derive(Debug, Default)]
pub struct ToInt16Pcm {
    core: StageCore,
}

impl ToInt16Pcm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioProcessor for ToInt16Pcm {
    fn name(&self) -> &'static str {
        "to_int16_pcm"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        match input.encoding {
            Encoding::Pcm16 => Ok(None),
            Encoding::Pcm8 | Encoding::Pcm24 | Encoding::Pcm32 | Encoding::PcmFloat => Ok(Some(
                PcmSpec::new(input.sample_rate, input.channel_count, Encoding::Pcm16),
            )),
            _ => Err(UnhandledFormat::new(self.name(), input, "not linear PCM")),
        }
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
        let Some(spec) = self.core.input else {
            input.advance(input.remaining());
            return;
        };
        let bps = spec.encoding.bytes_per_sample().unwrap_or(2);
        let usable = input.remaining() / bps * bps;
        if usable == 0 {
            return;
        }
        let samples = usable / bps;
        let src = input.take(usable).to_vec();
        let out = self.core.output_vec(samples * 2);
        for chunk in src.chunks_exact(bps) {
            let s = match spec.encoding {
                Encoding::Pcm8 => ((chunk[0] as i16) - 128) << 8,
                Encoding::Pcm24 => i16::from_le_bytes([chunk[1], chunk[2]]),
                Encoding::Pcm32 => i16::from_le_bytes([chunk[2], chunk[3]]),
                Encoding::PcmFloat => {
                    let f = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                }
                _ => i16::from_le_bytes([chunk[0], chunk[1]]),
            };
            out.extend_from_slice(&s.to_le_bytes());
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
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}

/// Converts 24/32-bit integer PCM to 32-bit float PCM.
#[derive(Debug, Default)]
pub struct ToFloatPcm {
    core: StageCore,
}

impl ToFloatPcm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioProcessor for ToFloatPcm {
    fn name(&self) -> &'static str {
        "to_float_pcm"
    }

    fn output_format(&self, input: PcmSpec) -> Result<Option<PcmSpec>, UnhandledFormat> {
        match input.encoding {
            Encoding::PcmFloat => Ok(None),
            Encoding::Pcm24 | Encoding::Pcm32 => Ok(Some(PcmSpec::new(
                input.sample_rate,
                input.channel_count,
                Encoding::PcmFloat,
            ))),
            _ => Err(UnhandledFormat::new(
                self.name(),
                input,
                "float output needs high-resolution PCM",
            )),
        }
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
        let Some(spec) = self.core.input else {
            input.advance(input.remaining());
            return;
        };
        let bps = spec.encoding.bytes_per_sample().unwrap_or(4);
        let usable = input.remaining() / bps * bps;
        if usable == 0 {
            return;
        }
        let src = input.take(usable).to_vec();
        let out = self.core.output_vec(usable / bps * 4);
        for chunk in src.chunks_exact(bps) {
            let f = match spec.encoding {
                Encoding::Pcm24 => {
                    let v = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                    v as f32 / 8_388_608.0
                }
                _ => {
                    let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    v as f32 / 2_147_483_648.0
                }
            };
            out.extend_from_slice(&f.to_le_bytes());
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
    }

    fn reset(&mut self) {
        self.core.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::samples;

    #[test]
    fn sixteen_bit_input_is_inactive() {
        let mut stage = ToInt16Pcm::new();
        let out = stage
            .configure(PcmSpec::new(48_000, 2, Encoding::Pcm16))
            .unwrap();
        stage.flush();
        assert!(out.is_none());
        assert!(!stage.is_active());
    }

    #[test]
    fn compressed_input_is_rejected() {
        let mut stage = ToInt16Pcm::new();
        assert!(stage.configure(PcmSpec::new(48_000, 2, Encoding::Ac3)).is_err());
    }

    #[test]
    fn twenty_four_bit_keeps_high_bytes() {
        let mut stage = ToInt16Pcm::new();
        stage
            .configure(PcmSpec::new(48_000, 1, Encoding::Pcm24))
            .unwrap();
        stage.flush();
        assert!(stage.is_active());
        // 0x123456 and -1 (0xFFFFFF), plus a trailing partial sample.
        let mut input = AudioBuf::from_slice(&[0x56, 0x34, 0x12, 0xFF, 0xFF, 0xFF, 0x01]);
        stage.queue_input(&mut input);
        assert_eq!(input.remaining(), 1);
        assert_eq!(samples(&stage.take_output()), vec![0x1234, -1]);
    }

    #[test]
    fn float_is_clamped() {
        let mut stage = ToInt16Pcm::new();
        stage
            .configure(PcmSpec::new(48_000, 1, Encoding::PcmFloat))
            .unwrap();
        stage.flush();
        let mut bytes = Vec::new();
        for f in [0.0f32, 2.0, -2.0] {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        let mut input = AudioBuf::from_vec(bytes);
        stage.queue_input(&mut input);
        assert_eq!(samples(&stage.take_output()), vec![0, i16::MAX, -i16::MAX]);
    }

    #[test]
    fn to_float_scales_thirty_two_bit() {
        let mut stage = ToFloatPcm::new();
        stage
            .configure(PcmSpec::new(48_000, 1, Encoding::Pcm32))
            .unwrap();
        stage.flush();
        let mut input = AudioBuf::from_vec(i32::MIN.to_le_bytes().to_vec());
        stage.queue_input(&mut input);
        let out = stage.take_output();
        let f = f32::from_le_bytes(out.as_slice().try_into().unwrap());
        assert_eq!(f, -1.0);
    }
}
