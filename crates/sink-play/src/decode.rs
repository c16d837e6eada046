//! File decoding for the player.
//!
//! Uses Symphonia to probe the file and decode packets into little-endian PCM buffers
//! the sink accepts, each stamped with its presentation time.

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use audio_sink::{AudioFormat, Encoding};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

/// One decoded packet.
pub struct DecodedBuffer {
    pub bytes: Vec<u8>,
    pub presentation_time_us: i64,
}

/// A probed file producing [`DecodedBuffer`]s in decode order.
pub struct FileSource {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    format: AudioFormat,
    /// Frames decoded so far, used when packets carry no usable timestamp.
    decoded_frames: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .context("probe input")?;

        let reader = probed.format;
        let track = reader
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let params = track.codec_params.clone();
        let format = sink_format(&params)?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create decoder")?;

        tracing::info!(
            path = %path.display(),
            format = %format,
            encoder_delay = format.encoder_delay,
            encoder_padding = format.encoder_padding,
            "input opened"
        );
        Ok(Self {
            track_id: track.id,
            time_base: params.time_base,
            reader,
            decoder,
            format,
            decoded_frames: 0,
        })
    }

    /// Input format to configure the sink with.
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Decode the next packet of the selected track. `None` at end of stream.
    pub fn next_buffer(&mut self) -> Result<Option<DecodedBuffer>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(err) => return Err(err).context("read packet"),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    tracing::warn!(ts = packet.ts(), "skipping undecodable packet: {msg}");
                    continue;
                }
                Err(err) => return Err(err).context("decode packet"),
            };
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let presentation_time_us = match self.time_base {
                Some(tb) => time_to_us(tb, packet.ts()),
                None => frames_to_us(self.decoded_frames, self.format.sample_rate),
            };
            let bytes = encode_le(decoded, self.format.encoding);
            self.decoded_frames += frames as u64;
            return Ok(Some(DecodedBuffer {
                bytes,
                presentation_time_us,
            }));
        }
    }
}

/// Sources deeper than 16 bits are handed over as float so the sink can pick the
/// float output path.
fn sink_format(params: &CodecParameters) -> Result<AudioFormat> {
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channels = params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let channels = u16::try_from(channels).context("channel count")?;
    let bit_depth = params.bits_per_sample.or(params.bits_per_coded_sample);
    let encoding = match bit_depth {
        Some(bits) if bits > 16 => Encoding::PcmFloat,
        _ => Encoding::Pcm16,
    };
    Ok(AudioFormat::pcm(encoding, sample_rate, channels)
        .with_gapless(params.delay.unwrap_or(0), params.padding.unwrap_or(0)))
}

fn encode_le(decoded: AudioBufferRef<'_>, encoding: Encoding) -> Vec<u8> {
    let spec = *decoded.spec();
    let capacity = decoded.frames() as u64;
    match encoding {
        Encoding::PcmFloat => {
            let mut buf = SampleBuffer::<f32>::new(capacity, spec);
            buf.copy_interleaved_ref(decoded);
            buf.samples().iter().flat_map(|s| s.to_le_bytes()).collect()
        }
        _ => {
            let mut buf = SampleBuffer::<i16>::new(capacity, spec);
            buf.copy_interleaved_ref(decoded);
            buf.samples().iter().flat_map(|s| s.to_le_bytes()).collect()
        }
    }
}

fn time_to_us(time_base: TimeBase, ts: u64) -> i64 {
    let time = time_base.calc_time(ts);
    time.seconds as i64 * 1_000_000 + (time.frac * 1_000_000.0).round() as i64
}

fn frames_to_us(frames: u64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames as u128 * 1_000_000 / sample_rate as u128) as i64
}
