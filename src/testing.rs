//! In-memory stand-ins for the device and network seams.
//!
//! Used by the unit tests and by integration tests that drive a whole session
//! without PulseAudio.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::capture::{CameraStream, MediaDevices, MicrophoneStream};
use crate::config::InterviewProfile;
use crate::error::{Result, VoiceError};
use crate::events::TransportEvent;
use crate::playback::{OutputContext, OutputContextFactory, PlayableBuffer};
use crate::remote::ConfigSource;
use crate::transport::{Connector, Transport, TransportPeer};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A buffer handed to [`ManualOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub duration: f64,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct OutputState {
    now: f64,
    suspended: bool,
    scheduled: Vec<ScheduledBuffer>,
    created: usize,
    resumes: usize,
    closed: bool,
}

/// Output device whose clock only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, now: f64) {
        locked(&self.state).now = now;
    }

    /// Make the next created context start suspended.
    pub fn suspend(&self) {
        locked(&self.state).suspended = true;
    }

    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        locked(&self.state).scheduled.clone()
    }

    pub fn created(&self) -> usize {
        locked(&self.state).created
    }

    pub fn resumes(&self) -> usize {
        locked(&self.state).resumes
    }

    pub fn is_closed(&self) -> bool {
        locked(&self.state).closed
    }
}

impl OutputContextFactory for ManualOutput {
    fn create(&self, _sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        let mut state = locked(&self.state);
        state.created += 1;
        state.closed = false;
        Ok(Box::new(ManualContext { state: self.state.clone() }))
    }
}

struct ManualContext {
    state: Arc<Mutex<OutputState>>,
}

impl OutputContext for ManualContext {
    fn current_time(&self) -> f64 {
        locked(&self.state).now
    }

    fn is_suspended(&self) -> bool {
        locked(&self.state).suspended
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = locked(&self.state);
        state.suspended = false;
        state.resumes += 1;
        Ok(())
    }

    fn schedule(&mut self, buffer: PlayableBuffer, start: f64) -> Result<()> {
        let mut state = locked(&self.state);
        if state.closed {
            return Err(VoiceError::ConnectionClosed);
        }
        state.scheduled.push(ScheduledBuffer {
            start,
            duration: buffer.duration(),
            samples: buffer.samples.len(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        locked(&self.state).closed = true;
        Ok(())
    }
}

/// Observes a [`ScriptedMicrophone`] after it has been moved away.
#[derive(Debug, Clone, Default)]
pub struct MicObserver {
    stopped: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl MicObserver {
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

/// Microphone that repeats a fixed prefix at the start of every block and
/// pads the rest with silence. Each read takes about a millisecond unless a
/// delay is set.
pub struct ScriptedMicrophone {
    sample_rate: u32,
    script: Vec<f32>,
    fail: bool,
    read_delay: Duration,
    observer: MicObserver,
}

impl ScriptedMicrophone {
    pub fn new(sample_rate: u32, script: Vec<f32>) -> Self {
        Self {
            sample_rate,
            script,
            fail: false,
            read_delay: Duration::from_millis(1),
            observer: MicObserver::default(),
        }
    }

    /// Make every read block for `delay`, like a real device waiting for a
    /// full buffer.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// A microphone whose every read fails.
    pub fn failing(sample_rate: u32) -> Self {
        Self { fail: true, ..Self::new(sample_rate, Vec::new()) }
    }

    pub fn observer(&self) -> MicObserver {
        self.observer.clone()
    }
}

impl MicrophoneStream for ScriptedMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_block(&mut self, block: &mut [f32]) -> Result<()> {
        std::thread::sleep(self.read_delay);
        self.observer.reads.fetch_add(1, Ordering::AcqRel);
        if self.fail {
            return Err(VoiceError::AudioDevice("scripted read failure".to_string()));
        }
        let n = self.script.len().min(block.len());
        block[..n].copy_from_slice(&self.script[..n]);
        block[n..].fill(0.0);
        Ok(())
    }

    fn stop(&mut self) {
        self.observer.stopped.store(true, Ordering::Release);
    }
}

struct FakeCamera {
    stopped: Arc<AtomicBool>,
}

impl CameraStream for FakeCamera {
    fn label(&self) -> &str {
        "fake camera"
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// [`MediaDevices`] handing out [`ScriptedMicrophone`]s.
#[derive(Debug, Default)]
pub struct FakeDevices {
    sample_rate: u32,
    script: Vec<f32>,
    deny_microphone: bool,
    failing_reads: bool,
    read_delay: Option<Duration>,
    open_delay: Option<Duration>,
    camera: bool,
    camera_stopped: Arc<AtomicBool>,
    last_observer: Mutex<Option<MicObserver>>,
}

impl FakeDevices {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            script: vec![0.25],
            ..Default::default()
        }
    }

    /// Every microphone request is refused.
    pub fn denying(mut self) -> Self {
        self.deny_microphone = true;
        self
    }

    /// Microphones open fine but every read fails.
    pub fn failing_reads(mut self) -> Self {
        self.failing_reads = true;
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Opening a microphone blocks for `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn with_camera(mut self) -> Self {
        self.camera = true;
        self
    }

    /// Observer of the most recently opened microphone.
    pub fn mic_observer(&self) -> Option<MicObserver> {
        locked(&self.last_observer).clone()
    }

    pub fn camera_stopped(&self) -> bool {
        self.camera_stopped.load(Ordering::Acquire)
    }
}

impl MediaDevices for FakeDevices {
    fn open_microphone(&self) -> Result<Box<dyn MicrophoneStream>> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        if self.deny_microphone {
            return Err(VoiceError::PermissionDenied("microphone access refused".to_string()));
        }
        let mut mic = if self.failing_reads {
            ScriptedMicrophone::failing(self.sample_rate)
        } else {
            ScriptedMicrophone::new(self.sample_rate, self.script.clone())
        };
        if let Some(delay) = self.read_delay {
            mic = mic.with_read_delay(delay);
        }
        *locked(&self.last_observer) = Some(mic.observer());
        Ok(Box::new(mic))
    }

    fn open_camera(&self) -> Result<Option<Box<dyn CameraStream>>> {
        if !self.camera {
            return Ok(None);
        }
        self.camera_stopped.store(false, Ordering::Release);
        Ok(Some(Box::new(FakeCamera { stopped: self.camera_stopped.clone() })))
    }
}

/// [`ConfigSource`] answering from memory.
#[derive(Debug, Clone)]
pub struct FakeConfigSource {
    pub key: String,
    pub instructions: String,
    pub fail: bool,
}

impl FakeConfigSource {
    pub fn new(key: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            instructions: instructions.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::new("", "") }
    }
}

#[async_trait]
impl ConfigSource for FakeConfigSource {
    async fn fetch_credential(&self) -> Result<String> {
        if self.fail {
            return Err(VoiceError::MissingConfig("credential service unavailable".to_string()));
        }
        Ok(self.key.clone())
    }

    async fn fetch_instructions(&self, profile: &InterviewProfile) -> Result<String> {
        if self.fail {
            return Err(VoiceError::MissingConfig("instructions service unavailable".to_string()));
        }
        Ok(format!("{} Candidate: {}.", self.instructions, profile.user_name))
    }
}

/// How a [`FakeConnector`] behaves on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connect and report `Opened`.
    Open,
    /// Connect, then close before opening.
    CloseBeforeOpen,
    /// Fail the connect call.
    Refuse,
}

/// [`Connector`] that hands the far side of each transport to the test.
#[derive(Debug)]
pub struct FakeConnector {
    behavior: ConnectBehavior,
    peers: Mutex<Vec<TransportPeer>>,
    credentials: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            peers: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
        }
    }

    /// Take the peer of the oldest transport not yet claimed.
    pub fn take_peer(&self) -> Option<TransportPeer> {
        let mut peers = locked(&self.peers);
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }

    pub fn credentials(&self) -> Vec<String> {
        locked(&self.credentials).clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str, credential: &str) -> Result<Transport> {
        locked(&self.credentials).push(credential.to_string());
        if self.behavior == ConnectBehavior::Refuse {
            return Err(VoiceError::ConnectionClosed);
        }

        let (transport, peer) = Transport::pair();
        match self.behavior {
            ConnectBehavior::Open => {
                let _ = peer.inbound.send(TransportEvent::Opened);
            }
            _ => peer.fail(TransportEvent::Closed(Some("rejected".to_string()))),
        }
        locked(&self.peers).push(peer);
        Ok(transport)
    }
}
