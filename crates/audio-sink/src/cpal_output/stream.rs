//! CPAL output stream and its real-time callback.
//!
//! `cpal::Stream` is not `Send` on every host, so each stream lives on its own thread
//! and is driven through a command channel. The callback drains the shared
//! [`OutputBuffer`] without blocking, maps channels, applies volume and converts to the
//! device sample format.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use super::queue::OutputBuffer;
use super::{pick_buffer_size, pick_device, pick_output_config};

/// Frames pulled from the buffer per refill inside the callback.
const REFILL_MAX_FRAMES: usize = 1024;

pub(crate) enum StreamCommand {
    Play,
    Pause,
    Close,
}

/// What the stream thread needs to open a stream.
#[derive(Clone, Debug)]
pub(crate) struct StreamRequest {
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Control side of a stream thread.
pub(crate) struct StreamHandle {
    tx: Sender<StreamCommand>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub(crate) fn send(&self, command: StreamCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("output stream thread is gone");
        }
    }

    /// Close the stream and wait for its thread.
    pub(crate) fn close(mut self) {
        self.send(StreamCommand::Close);
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::warn!("output stream thread panicked");
        }
    }
}

/// Open a stream on a dedicated thread. Returns once the stream is built or failed.
pub(crate) fn spawn_stream(request: StreamRequest, buffer: Arc<OutputBuffer>) -> Result<StreamHandle> {
    let (tx, rx) = unbounded::<StreamCommand>();
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let join = std::thread::Builder::new()
        .name("audio-sink-output".into())
        .spawn(move || run_stream(request, buffer, rx, ready_tx))
        .context("spawn output stream thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamHandle {
            tx,
            join: Some(join),
        }),
        Ok(Err(err)) => {
            let _ = join.join();
            Err(err)
        }
        Err(_) => {
            let _ = join.join();
            Err(anyhow!("output stream thread exited before reporting"))
        }
    }
}

fn run_stream(
    request: StreamRequest,
    buffer: Arc<OutputBuffer>,
    rx: Receiver<StreamCommand>,
    ready: Sender<Result<()>>,
) {
    let stream = match open_stream(&request, &buffer) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while let Ok(command) = rx.recv() {
        let result = match command {
            StreamCommand::Play => stream.play().map_err(anyhow::Error::from),
            StreamCommand::Pause => stream.pause().map_err(anyhow::Error::from),
            StreamCommand::Close => break,
        };
        if let Err(err) = result {
            tracing::warn!("output stream control failed: {err:#}");
        }
    }
    drop(stream);
    tracing::debug!("output stream closed");
}

fn open_stream(request: &StreamRequest, buffer: &Arc<OutputBuffer>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, request.device_name.as_deref())?;
    let supported = pick_output_config(&device, request.sample_rate, request.channels)?;
    if supported.sample_rate() != request.sample_rate {
        return Err(anyhow!(
            "device does not support {} Hz (closest {} Hz)",
            request.sample_rate,
            supported.sample_rate()
        ));
    }
    let mut config = supported.config();
    if let Some(buffer_size) = pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }
    tracing::info!(
        device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
        rate_hz = config.sample_rate,
        channels = config.channels,
        sample_format = ?supported.sample_format(),
        "opening output stream"
    );

    match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, buffer),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, buffer),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, buffer),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, buffer),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: &Arc<OutputBuffer>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Mutex::new(CallbackState {
        pos: 0,
        src_channels: buffer.channels(),
        src: Vec::with_capacity(REFILL_MAX_FRAMES * buffer.channels()),
    });
    let buffer = buffer.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if buffer.is_paused() {
                data.fill(silence);
                return;
            }
            let Ok(mut st) = state.lock() else {
                data.fill(silence);
                return;
            };
            let volume = buffer.volume();
            let frames = data.len() / channels_out;

            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    let mut src = std::mem::take(&mut st.src);
                    let got = buffer.pop_frames(REFILL_MAX_FRAMES, &mut src);
                    st.src = src;
                    if got == 0 {
                        buffer.note_underrun();
                        data[frame * channels_out..].fill(silence);
                        break;
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch) * volume;
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Samples pulled from the buffer but not yet handed to the device.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Read one output sample for `dst_ch`: mono is duplicated, stereo folded to mono by
/// averaging, other layouts clamp to the last source channel.
///
/// `st.pos` advances once per destination frame, after its last channel.
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }
    let frame_start = st.pos;
    let get = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get(0, st) + get(1, st)),
        (1, _) => get(0, st),
        _ => get(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(src_channels: usize, src: Vec<f32>) -> CallbackState {
        CallbackState {
            pos: 0,
            src_channels,
            src,
        }
    }

    fn render(st: &mut CallbackState, dst_channels: usize, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for _ in 0..frames {
            for ch in 0..dst_channels {
                out.push(next_sample_mapped(st, dst_channels, ch));
            }
        }
        out
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let mut st = state(1, vec![0.1, 0.2]);
        assert_eq!(render(&mut st, 2, 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let mut st = state(2, vec![0.25, 0.75, 1.0, 0.0]);
        assert_eq!(render(&mut st, 1, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn wider_output_repeats_last_channel() {
        let mut st = state(2, vec![0.1, 0.2]);
        assert_eq!(render(&mut st, 4, 1), vec![0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn exhausted_source_yields_silence() {
        let mut st = state(2, vec![0.1, 0.2]);
        assert_eq!(render(&mut st, 2, 2), vec![0.1, 0.2, 0.0, 0.0]);
    }
}
