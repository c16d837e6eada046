//! sink-play: decode a local file and play it through the audio sink.
//!
//! Decoded packets are offered to the sink on the main thread. When the sink
//! cannot take a buffer yet, the player waits briefly and offers it again, which
//! is how device backpressure reaches the decoder.

mod cli;
mod decode;
mod settings;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use audio_sink::cpal_output::{CpalDriver, list_devices};
use audio_sink::{AudioSink, PlaybackParameters, SinkError, SinkListener, SystemClock};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use decode::FileSource;
use settings::{PlayOptions, Settings};

const FEED_RETRY: Duration = Duration::from_millis(5);
const POSITION_LOG_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,sink_play=info,audio_sink=info")
        }))
        .init();

    if args.list_devices {
        list_devices()?;
        return Ok(());
    }

    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let options = settings.merge(&args);
    let Some(path) = args.path.as_deref() else {
        anyhow::bail!("no input file");
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_signal = stop.clone();
    ctrlc::set_handler(move || stop_for_signal.store(true, Ordering::Relaxed))
        .context("install Ctrl-C handler")?;

    play_file(path, &options, &stop)
}

fn play_file(path: &Path, options: &PlayOptions, stop: &AtomicBool) -> Result<()> {
    let mut source = FileSource::open(path)?;

    let clock = Arc::new(SystemClock::new());
    let driver = CpalDriver::new(options.device.clone(), clock.clone());
    let mut sink = AudioSink::with_parts(Box::new(driver), options.sink.clone(), clock, Vec::new());
    sink.set_listener(Box::new(LogListener));
    sink.set_playback_parameters(PlaybackParameters::new(options.speed, options.pitch))?;
    sink.set_skip_silence_enabled(options.skip_silence);
    sink.set_volume(options.volume);
    sink.configure(source.format(), options.buffer_size)?;
    sink.play();

    let mut progress = Progress::new();
    while let Some(buffer) = source.next_buffer()? {
        loop {
            if stop.load(Ordering::Relaxed) {
                return interrupt(&mut sink);
            }
            if sink.handle_buffer(&buffer.bytes, buffer.presentation_time_us, 1)? {
                break;
            }
            progress.log(&mut sink);
            thread::sleep(FEED_RETRY);
        }
        progress.log(&mut sink);
    }

    while !sink.play_to_end_of_stream()? {
        if stop.load(Ordering::Relaxed) {
            return interrupt(&mut sink);
        }
        thread::sleep(FEED_RETRY);
    }
    while !sink.is_ended() {
        if stop.load(Ordering::Relaxed) {
            return interrupt(&mut sink);
        }
        progress.log(&mut sink);
        thread::sleep(FEED_RETRY * 4);
    }

    let status = sink.status();
    tracing::info!(
        written_frames = status.written_frames,
        underruns = status.counters.underruns,
        "playback finished"
    );
    if let Ok(json) = serde_json::to_string(&status) {
        tracing::debug!(status = %json, "final sink status");
    }
    sink.reset();
    Ok(())
}

fn interrupt(sink: &mut AudioSink) -> Result<()> {
    tracing::info!("interrupted");
    sink.pause();
    sink.flush();
    sink.reset();
    Ok(())
}

/// Logs the sink position at most once per interval.
struct Progress {
    last: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    fn log(&mut self, sink: &mut AudioSink) {
        if self.last.elapsed() < POSITION_LOG_INTERVAL {
            return;
        }
        self.last = Instant::now();
        if let Some(position_us) = sink.current_position_us(false) {
            tracing::info!(
                position_ms = position_us / 1000,
                state = ?sink.state(),
                "position"
            );
        }
    }
}

struct LogListener;

impl SinkListener for LogListener {
    fn on_position_discontinuity(&mut self) {
        tracing::info!("position discontinuity");
    }

    fn on_underrun(&mut self, buffer_size: usize, buffer_duration_us: i64, ms_since_last_feed: i64) {
        tracing::warn!(buffer_size, buffer_duration_us, ms_since_last_feed, "underrun");
    }

    fn on_skip_silence_enabled_changed(&mut self, enabled: bool) {
        tracing::info!(enabled, "skip silence");
    }

    fn on_position_advancing(&mut self, playout_start_system_time_us: i64) {
        tracing::debug!(playout_start_system_time_us, "playback advancing");
    }

    fn on_sink_error(&mut self, error: &SinkError) {
        tracing::warn!("sink error: {error}");
    }
}
