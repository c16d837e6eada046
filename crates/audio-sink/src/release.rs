//! Asynchronous device release.
//!
//! Releasing a device can take a while, so it happens on a worker thread fed through
//! a single-slot queue. A gate counts releases in progress and blocks the creation of
//! the next device until it drops back to zero, so two devices never coexist.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded};

use crate::device::AudioDevice;

/// Counts releases in flight and wakes waiters when none remain.
#[derive(Debug, Default)]
pub struct ReleaseGate {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl ReleaseGate {
    fn close(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending += 1;
        }
    }

    fn open(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Block until every queued release has finished.
    pub fn wait(&self) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        while *pending > 0 {
            pending = match self.idle.wait(pending) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    pub fn is_open(&self) -> bool {
        self.pending.lock().map(|p| *p == 0).unwrap_or(true)
    }
}

/// Hands devices to the release worker.
pub struct DeviceReleaser {
    gate: Arc<ReleaseGate>,
    tx: Option<Sender<Box<dyn AudioDevice>>>,
    join: Option<JoinHandle<()>>,
}

impl Default for DeviceReleaser {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceReleaser {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(ReleaseGate::default()),
            tx: None,
            join: None,
        }
    }

    pub fn gate(&self) -> Arc<ReleaseGate> {
        self.gate.clone()
    }

    /// Queue `device` for release. Blocks only if a previous release is still queued.
    pub fn release(&mut self, device: Box<dyn AudioDevice>) {
        self.gate.close();
        let tx = self.sender();
        if let Err(err) = tx.send(device) {
            // Worker is gone; release inline.
            tracing::warn!("device release worker unavailable, releasing inline");
            err.into_inner().release();
            self.gate.open();
        }
    }

    /// Block until released devices are gone.
    pub fn wait_until_released(&self) {
        self.gate.wait();
    }

    fn sender(&mut self) -> Sender<Box<dyn AudioDevice>> {
        if let Some(tx) = &self.tx {
            return tx.clone();
        }
        let (tx, rx) = bounded::<Box<dyn AudioDevice>>(1);
        let gate = self.gate.clone();
        let join = std::thread::Builder::new()
            .name("audio-sink-release".into())
            .spawn(move || {
                while let Ok(device) = rx.recv() {
                    device.release();
                    tracing::debug!("device released");
                    gate.open();
                }
            });
        match join {
            Ok(join) => self.join = Some(join),
            Err(e) => tracing::error!("failed to spawn device release worker: {e:#}"),
        }
        self.tx = Some(tx.clone());
        tx
    }
}

impl Drop for DeviceReleaser {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::device::DeviceTimestamp;
    use crate::error::DeviceError;

    struct SlowDevice {
        released: Arc<AtomicUsize>,
    }

    impl AudioDevice for SlowDevice {
        fn write_non_blocking(&mut self, data: &[u8], _: Option<i64>) -> Result<usize, DeviceError> {
            Ok(data.len())
        }
        fn consumed_frames(&self) -> u64 {
            0
        }
        fn timestamp(&self) -> Option<DeviceTimestamp> {
            None
        }
        fn play(&mut self) {}
        fn pause(&mut self) {}
        fn stop(&mut self) {}
        fn flush(&mut self) {}
        fn set_volume(&mut self, _: f32) {}
        fn session_id(&self) -> u32 {
            1
        }
        fn release(self: Box<Self>) {
            std::thread::sleep(Duration::from_millis(20));
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn gate_blocks_until_release_finishes() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut releaser = DeviceReleaser::new();
        assert!(releaser.gate().is_open());

        releaser.release(Box::new(SlowDevice {
            released: released.clone(),
        }));
        releaser.release(Box::new(SlowDevice {
            released: released.clone(),
        }));
        releaser.wait_until_released();

        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(releaser.gate().is_open());
    }

    #[test]
    fn drop_joins_worker() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let mut releaser = DeviceReleaser::new();
            releaser.release(Box::new(SlowDevice {
                released: released.clone(),
            }));
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
