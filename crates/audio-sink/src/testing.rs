//! Test doubles for the clock, the device driver and the listener.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::device::{AudioDevice, AudioDriver, DeviceCapabilities, DeviceConfig, DeviceTimestamp};
use crate::error::{DeviceError, SinkError};
use crate::format::{AudioFormat, Encoding};
use crate::listener::SinkListener;
use crate::resolver::OutputMode;

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct FakeClock {
    now_us: AtomicI64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: i64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeDeviceState {
    pub config: Option<DeviceConfig>,
    pub frame_size: usize,
    /// Bytes the device holds at most; `None` accepts everything.
    pub capacity: Option<usize>,
    pub written: Vec<u8>,
    pub consumed_frames: u64,
    pub timestamp: Option<DeviceTimestamp>,
    pub write_errors: Vec<DeviceError>,
    pub playing: bool,
    pub stopped: bool,
    pub flushed: bool,
    pub released: bool,
    pub volume: f32,
    pub session_id: u32,
}

impl FakeDeviceState {
    fn pending_bytes(&self) -> usize {
        let consumed = self.consumed_frames as usize * self.frame_size;
        self.written.len().saturating_sub(consumed)
    }
}

/// Device whose playback progress is scripted by the test through its handle.
pub struct FakeDevice {
    state: Arc<Mutex<FakeDeviceState>>,
    live: Option<Arc<Mutex<LiveDevices>>>,
}

/// Test-side view of a [`FakeDevice`].
#[derive(Clone)]
pub struct FakeDeviceHandle {
    state: Arc<Mutex<FakeDeviceState>>,
}

impl FakeDevice {
    /// A 16-bit stereo device with unlimited capacity.
    pub fn new() -> (Self, FakeDeviceHandle) {
        let state = Arc::new(Mutex::new(FakeDeviceState {
            config: None,
            frame_size: 4,
            capacity: None,
            written: Vec::new(),
            consumed_frames: 0,
            timestamp: None,
            write_errors: Vec::new(),
            playing: false,
            stopped: false,
            flushed: false,
            released: false,
            volume: 1.0,
            session_id: 1,
        }));
        (
            Self {
                state: state.clone(),
                live: None,
            },
            FakeDeviceHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, FakeDeviceState> {
        self.state.lock().unwrap()
    }
}

impl FakeDeviceHandle {
    pub fn state(&self) -> MutexGuard<'_, FakeDeviceState> {
        self.state.lock().unwrap()
    }

    /// Advance the playback head by `frames`.
    pub fn consume(&self, frames: u64) {
        self.state().consumed_frames += frames;
    }

    /// Play out everything written so far.
    pub fn consume_all(&self) {
        let mut state = self.state();
        if state.frame_size > 0 {
            state.consumed_frames = (state.written.len() / state.frame_size) as u64;
        }
    }

    pub fn set_timestamp(&self, timestamp: Option<DeviceTimestamp>) {
        self.state().timestamp = timestamp;
    }

    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.state().capacity = capacity;
    }

    /// Fail the next write with `error`.
    pub fn fail_next_write(&self, error: DeviceError) {
        self.state().write_errors.push(error);
    }

    pub fn written_len(&self) -> usize {
        self.state().written.len()
    }

    pub fn written_i16(&self) -> Vec<i16> {
        self.state()
            .written
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }
}

impl AudioDevice for FakeDevice {
    fn write_non_blocking(&mut self, data: &[u8], _av_sync_time_us: Option<i64>) -> Result<usize, DeviceError> {
        let mut state = self.lock();
        if !state.write_errors.is_empty() {
            return Err(state.write_errors.remove(0));
        }
        let room = match state.capacity {
            Some(capacity) => capacity.saturating_sub(state.pending_bytes()),
            None => data.len(),
        };
        let mut n = data.len().min(room);
        if state.frame_size > 0 && state.config.as_ref().is_none_or(|c| c.mode == OutputMode::Pcm) {
            n -= n % state.frame_size;
        }
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn consumed_frames(&self) -> u64 {
        self.lock().consumed_frames
    }

    fn timestamp(&self) -> Option<DeviceTimestamp> {
        self.lock().timestamp
    }

    fn play(&mut self) {
        self.lock().playing = true;
    }

    fn pause(&mut self) {
        self.lock().playing = false;
    }

    fn stop(&mut self) {
        self.lock().stopped = true;
    }

    fn flush(&mut self) {
        let mut state = self.lock();
        state.flushed = true;
        state.written.clear();
        state.consumed_frames = 0;
    }

    fn set_volume(&mut self, volume: f32) {
        self.lock().volume = volume;
    }

    fn session_id(&self) -> u32 {
        self.lock().session_id
    }

    fn release(self: Box<Self>) {
        self.lock().released = true;
        if let Some(live) = &self.live {
            live.lock().unwrap().count -= 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct LiveDevices {
    pub count: usize,
    pub max: usize,
}

/// Capabilities answered from plain fields.
#[derive(Clone, Debug)]
pub struct FakeCapabilities {
    /// Encodings the device accepts for passthrough.
    pub passthrough: Vec<Encoding>,
    pub offload: Vec<Encoding>,
    pub max_channels: u16,
    pub min_buffer: usize,
}

impl Default for FakeCapabilities {
    fn default() -> Self {
        Self {
            passthrough: Vec::new(),
            offload: Vec::new(),
            max_channels: 8,
            min_buffer: 3_840,
        }
    }
}

impl DeviceCapabilities for FakeCapabilities {
    fn is_encoding_supported(&self, encoding: Encoding) -> bool {
        matches!(encoding, Encoding::Pcm16 | Encoding::PcmFloat) || self.passthrough.contains(&encoding)
    }

    fn max_channel_count(&self, _encoding: Encoding) -> u16 {
        self.max_channels
    }

    fn is_offload_supported(&self, format: &AudioFormat) -> bool {
        self.offload.contains(&format.encoding)
    }

    fn min_buffer_size(&self, _sample_rate: u32, _channel_count: u16, _encoding: Encoding) -> usize {
        self.min_buffer
    }
}

pub struct FakeDriverState {
    pub capabilities: FakeCapabilities,
    pub opened: Vec<DeviceConfig>,
    pub devices: Vec<FakeDeviceHandle>,
    pub open_errors: Vec<DeviceError>,
    /// Applied to every device opened from now on.
    pub device_capacity: Option<usize>,
    next_session_id: u32,
}

/// Driver handing out [`FakeDevice`]s.
pub struct FakeDriver {
    state: Arc<Mutex<FakeDriverState>>,
    live: Arc<Mutex<LiveDevices>>,
}

#[derive(Clone)]
pub struct FakeDriverHandle {
    state: Arc<Mutex<FakeDriverState>>,
    live: Arc<Mutex<LiveDevices>>,
}

impl FakeDriver {
    pub fn new(capabilities: FakeCapabilities) -> (Self, FakeDriverHandle) {
        let state = Arc::new(Mutex::new(FakeDriverState {
            capabilities,
            opened: Vec::new(),
            devices: Vec::new(),
            open_errors: Vec::new(),
            device_capacity: None,
            next_session_id: 7,
        }));
        let live = Arc::new(Mutex::new(LiveDevices::default()));
        (
            Self {
                state: state.clone(),
                live: live.clone(),
            },
            FakeDriverHandle { state, live },
        )
    }
}

impl FakeDriverHandle {
    pub fn state(&self) -> MutexGuard<'_, FakeDriverState> {
        self.state.lock().unwrap()
    }

    /// Most recently opened device.
    pub fn device(&self) -> FakeDeviceHandle {
        self.state().devices.last().cloned().expect("no device opened")
    }

    pub fn open_count(&self) -> usize {
        self.state().opened.len()
    }

    pub fn live(&self) -> MutexGuard<'_, LiveDevices> {
        self.live.lock().unwrap()
    }
}

impl DeviceCapabilities for FakeDriver {
    fn is_encoding_supported(&self, encoding: Encoding) -> bool {
        self.state.lock().unwrap().capabilities.is_encoding_supported(encoding)
    }

    fn max_channel_count(&self, encoding: Encoding) -> u16 {
        self.state.lock().unwrap().capabilities.max_channel_count(encoding)
    }

    fn is_offload_supported(&self, format: &AudioFormat) -> bool {
        self.state.lock().unwrap().capabilities.is_offload_supported(format)
    }

    fn min_buffer_size(&self, sample_rate: u32, channel_count: u16, encoding: Encoding) -> usize {
        self.state
            .lock()
            .unwrap()
            .capabilities
            .min_buffer_size(sample_rate, channel_count, encoding)
    }
}

impl AudioDriver for FakeDriver {
    fn open(&mut self, config: &DeviceConfig) -> Result<Box<dyn AudioDevice>, DeviceError> {
        let mut state = self.state.lock().unwrap();
        if !state.open_errors.is_empty() {
            return Err(state.open_errors.remove(0));
        }
        state.opened.push(config.clone());
        let session_id = config.session_id.unwrap_or_else(|| {
            state.next_session_id += 1;
            state.next_session_id
        });

        let (mut device, handle) = FakeDevice::new();
        {
            let mut device_state = handle.state();
            device_state.config = Some(config.clone());
            device_state.frame_size = config
                .encoding
                .bytes_per_sample()
                .map(|bps| bps * config.channel_count as usize)
                .unwrap_or(1);
            device_state.capacity = state.device_capacity;
            device_state.session_id = session_id;
        }
        {
            let mut live = self.live.lock().unwrap();
            live.count += 1;
            live.max = live.max.max(live.count);
        }
        device.live = Some(self.live.clone());
        state.devices.push(handle);
        Ok(Box::new(device))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ListenerEvent {
    PositionDiscontinuity,
    Underrun {
        buffer_size: usize,
        buffer_duration_us: i64,
    },
    OffloadBufferFull,
    OffloadBufferEmptying,
    SkipSilenceEnabledChanged(bool),
    PositionAdvancing,
    SinkError(String),
}

/// Listener that records every callback.
#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<ListenerEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &ListenerEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    fn push(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl SinkListener for RecordingListener {
    fn on_position_discontinuity(&mut self) {
        self.push(ListenerEvent::PositionDiscontinuity);
    }

    fn on_underrun(&mut self, buffer_size: usize, buffer_duration_us: i64, _ms_since_last_feed: i64) {
        self.push(ListenerEvent::Underrun {
            buffer_size,
            buffer_duration_us,
        });
    }

    fn on_offload_buffer_full(&mut self) {
        self.push(ListenerEvent::OffloadBufferFull);
    }

    fn on_offload_buffer_emptying(&mut self) {
        self.push(ListenerEvent::OffloadBufferEmptying);
    }

    fn on_skip_silence_enabled_changed(&mut self, enabled: bool) {
        self.push(ListenerEvent::SkipSilenceEnabledChanged(enabled));
    }

    fn on_position_advancing(&mut self, _playout_start_system_time_us: i64) {
        self.push(ListenerEvent::PositionAdvancing);
    }

    fn on_sink_error(&mut self, error: &SinkError) {
        self.push(ListenerEvent::SinkError(error.to_string()));
    }
}
