//! Microphone capture and PCM16 framing
//!
//! A dedicated OS thread pulls fixed-size float blocks from the microphone,
//! encodes each one and hands it to the transport. Frames are dropped, never
//! buffered, while the transport is not writable. A microphone failure ends
//! the thread and is reported on the session's event stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::error::{Result, VoiceError};
use crate::events::TransportEvent;
use crate::transport::TransportHandle;

/// A live microphone track producing mono `f32` samples.
pub trait MicrophoneStream: Send {
    /// Native sample rate of the device.
    fn sample_rate(&self) -> u32;

    /// Block until `block` is filled with the next samples.
    fn read_block(&mut self, block: &mut [f32]) -> Result<()>;

    /// Stop the underlying device track.
    fn stop(&mut self);
}

/// A live camera track. Only its lifetime matters to the engine.
pub trait CameraStream: Send {
    fn label(&self) -> &str;

    fn stop(&mut self);
}

/// Grants access to the local capture devices.
pub trait MediaDevices: Send + Sync {
    fn open_microphone(&self) -> Result<Box<dyn MicrophoneStream>>;

    fn open_camera(&self) -> Result<Option<Box<dyn CameraStream>>> {
        Ok(None)
    }
}

/// Counters for one capture run.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct CaptureEncoder {
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    sample_rate: u32,
    worker: Option<JoinHandle<Box<dyn MicrophoneStream>>>,
}

impl CaptureEncoder {
    /// Start pulling `block_size` blocks from `mic` into `transport`.
    ///
    /// A read failure while running is pushed to `failures` as a
    /// [`TransportEvent::Error`].
    pub fn start(
        mut mic: Box<dyn MicrophoneStream>,
        transport: TransportHandle,
        block_size: usize,
        failures: WeakUnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let sample_rate = mic.sample_rate();
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());

        let thread_running = running.clone();
        let thread_stats = stats.clone();
        let worker = std::thread::Builder::new()
            .name("capture-encoder".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; block_size];
                while thread_running.load(Ordering::Acquire) {
                    if let Err(e) = mic.read_block(&mut block) {
                        // Only a live capture reports; errors during teardown are expected
                        if thread_running.swap(false, Ordering::AcqRel) {
                            error!("Microphone read failed: {}", e);
                            if let Some(tx) = failures.upgrade() {
                                let _ = tx.send(TransportEvent::Error(format!("microphone read failed: {}", e)));
                            }
                        }
                        break;
                    }
                    // A block that completes after teardown began is discarded
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    if !transport.is_writable() {
                        thread_stats.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match transport.send_binary(codec::encode_block(&block)) {
                        Ok(()) => {
                            thread_stats.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!("Dropping capture frame: {}", e);
                            thread_stats.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!("Capture thread exiting");
                mic
            })
            .map_err(|e| VoiceError::AudioDevice(format!("failed to spawn capture thread: {}", e)))?;

        info!("Capture started at {} Hz, {} samples per block", sample_rate, block_size);
        Ok(Self {
            running,
            stats,
            sample_rate,
            worker: Some(worker),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Stop encoding immediately. The thread exits after its current read.
    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Halt and wait for the capture thread, handing back the microphone.
    pub fn join(&mut self) -> Option<Box<dyn MicrophoneStream>> {
        self.halt();
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(mic) => {
                info!(
                    sent = self.frames_sent(),
                    dropped = self.frames_dropped(),
                    "Capture stopped"
                );
                Some(mic)
            }
            Err(_) => {
                warn!("Capture thread panicked");
                None
            }
        }
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        self.halt();
    }
}
