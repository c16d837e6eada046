//! Sample buffer shared between the sink thread and the CPAL callback.
//!
//! The sink side pushes whole frames without blocking and learns how many fit; the
//! callback pops frames, counts them as consumed and stamps a timestamp. Neither side
//! ever waits on the other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::device::DeviceTimestamp;

/// Bounded interleaved `f32` buffer plus the playback state the callback reports.
pub struct OutputBuffer {
    channels: usize,
    capacity_frames: usize,
    samples: Mutex<VecDeque<f32>>,
    clock: Arc<dyn Clock>,
    consumed_frames: AtomicU64,
    timestamp: Mutex<Option<DeviceTimestamp>>,
    paused: AtomicBool,
    /// Volume as `f32` bits.
    volume: AtomicU32,
    underrun_events: AtomicU64,
}

impl OutputBuffer {
    pub fn new(channels: usize, capacity_frames: usize, clock: Arc<dyn Clock>) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity_frames: capacity_frames.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity_frames * channels)),
            clock,
            consumed_frames: AtomicU64::new(0),
            timestamp: Mutex::new(None),
            paused: AtomicBool::new(true),
            volume: AtomicU32::new(1.0f32.to_bits()),
            underrun_events: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn len_frames(&self) -> usize {
        self.samples
            .lock()
            .map(|q| q.len() / self.channels)
            .unwrap_or(0)
    }

    /// Append as many whole frames of `samples` as fit. Returns the frames taken.
    pub fn push_frames(&self, samples: &[f32]) -> usize {
        let Ok(mut queue) = self.samples.lock() else {
            return 0;
        };
        let free = self
            .capacity_frames
            .saturating_sub(queue.len() / self.channels);
        let frames = (samples.len() / self.channels).min(free);
        queue.extend(&samples[..frames * self.channels]);
        frames
    }

    /// Move up to `max_frames` whole frames into `out` and count them as consumed.
    pub fn pop_frames(&self, max_frames: usize, out: &mut Vec<f32>) -> usize {
        out.clear();
        let frames = {
            let Ok(mut queue) = self.samples.lock() else {
                return 0;
            };
            let frames = (queue.len() / self.channels).min(max_frames);
            out.extend(queue.drain(..frames * self.channels));
            frames
        };
        if frames > 0 {
            let position = self.consumed_frames.fetch_add(frames as u64, Ordering::AcqRel)
                + frames as u64;
            if let Ok(mut ts) = self.timestamp.lock() {
                *ts = Some(DeviceTimestamp {
                    frame_position: position,
                    system_time_us: self.clock.now_us(),
                });
            }
        }
        frames
    }

    /// Drop queued samples and start counting from zero again.
    pub fn clear(&self) {
        if let Ok(mut queue) = self.samples.lock() {
            queue.clear();
        }
        self.consumed_frames.store(0, Ordering::Release);
        if let Ok(mut ts) = self.timestamp.lock() {
            *ts = None;
        }
    }

    pub fn consumed_frames(&self) -> u64 {
        self.consumed_frames.load(Ordering::Acquire)
    }

    pub fn timestamp(&self) -> Option<DeviceTimestamp> {
        self.timestamp.lock().ok().and_then(|ts| *ts)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub(crate) fn note_underrun(&self) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }
}
