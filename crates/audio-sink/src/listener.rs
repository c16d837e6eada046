use crate::error::SinkError;

/// Receives sink events. Every method defaults to doing nothing.
///
/// Called on the thread driving the sink.
pub trait SinkListener: Send {
    /// Media time jumped because the sink resynchronized to the input timestamps.
    fn on_position_discontinuity(&mut self) {}

    /// The device ran out of data while playing.
    fn on_underrun(&mut self, _buffer_size: usize, _buffer_duration_us: i64, _ms_since_last_feed: i64) {}

    /// An offload device stopped accepting data.
    fn on_offload_buffer_full(&mut self) {}

    /// An offload device accepts data again after being full.
    fn on_offload_buffer_emptying(&mut self) {}

    fn on_skip_silence_enabled_changed(&mut self, _enabled: bool) {}

    /// Playback started advancing; `playout_start_system_time_us` is when frame zero played.
    fn on_position_advancing(&mut self, _playout_start_system_time_us: i64) {}

    /// A non-fatal error the sink recovered from or is about to return.
    fn on_sink_error(&mut self, _error: &SinkError) {}
}
