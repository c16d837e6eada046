//! Audio output sink.
//!
//! Takes decoded, timestamped PCM or encoded audio and turns it into paced,
//! non-blocking writes to an output device, with speed change, silence skipping,
//! gapless trimming and media-time position reporting.
//!
//! [`AudioSink`] is the entry point. Devices are reached through the [`AudioDriver`]
//! trait; [`cpal_output::CpalDriver`] plays PCM on the host's audio devices.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod cpal_output;
pub mod device;
pub mod error;
pub mod format;
pub mod listener;
pub mod params;
pub mod pipeline;
pub mod position;
pub mod processor;
pub mod release;
pub mod resolver;
pub mod sink;
pub mod status;

#[cfg(test)]
mod testing;

pub use buffer::AudioBuf;
pub use clock::{Clock, SystemClock};
pub use config::{OffloadMode, SinkConfig};
pub use device::{AudioDevice, AudioDriver, DeviceCapabilities, DeviceConfig, DeviceTimestamp};
pub use error::{
    AnomalyKind, ConfigurationError, DeviceError, InitializationError, SinkError,
    TimestampAnomaly, UnhandledFormat, WriteError,
};
pub use format::{AudioFormat, Encoding, PcmSpec};
pub use listener::SinkListener;
pub use params::PlaybackParameters;
pub use processor::AudioProcessor;
pub use resolver::{FormatSupport, OutputMode};
pub use sink::AudioSink;
pub use status::{SinkCounters, SinkState, SinkStatus};
