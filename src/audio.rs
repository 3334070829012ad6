//! PulseAudio device backends
//!
//! Device discovery goes through the introspection API; capture and playback
//! use the simple API on dedicated threads. Capture runs at the source's
//! native rate in float format, playback takes float samples at the agent's
//! output rate.

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::{CameraStream, MediaDevices, MicrophoneStream};
use crate::error::{Result, VoiceError};
use crate::playback::{OutputContext, OutputContextFactory, PlayableBuffer};

/// Rate assumed when the source cannot be introspected.
const FALLBACK_CAPTURE_RATE: u32 = 48_000;

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Is this device a monitor (system playback) or a microphone
    pub is_monitor: bool,
}

/// Audio device type for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

fn pulse_err(context: &str, e: impl std::fmt::Display) -> VoiceError {
    VoiceError::AudioDevice(format!("{}: {}", context, e))
}

/// List available PulseAudio input devices
pub fn list_devices(app_name: &str, device_type: DeviceType) -> Result<Vec<AudioDevice>> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist =
        Proplist::new().ok_or_else(|| VoiceError::AudioDevice("failed to create proplist".to_string()))?;
    proplist
        .set_str(libpulse_binding::proplist::properties::APPLICATION_NAME, app_name)
        .map_err(|_| VoiceError::AudioDevice("failed to set application name".to_string()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| VoiceError::AudioDevice("failed to create mainloop".to_string()))?;

    let mut context = Context::new_with_proplist(&mainloop, "device-lister", &proplist)
        .ok_or_else(|| VoiceError::AudioDevice("failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| pulse_err("context connect", e))?;

    // Wait for context to be ready
    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(VoiceError::AudioDevice("mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }

        match context.get_state() {
            libpulse_binding::context::State::Ready => break,
            libpulse_binding::context::State::Failed | libpulse_binding::context::State::Terminated => {
                return Err(VoiceError::AudioDevice("PulseAudio connection failed".to_string()));
            }
            _ => {}
        }
    }

    let operation_done = Arc::new(Mutex::new(false));
    let operation_done_clone = operation_done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |source_info_list| match source_info_list {
        ListResult::Item(source_info) => {
            let is_monitor = source_info.monitor_of_sink.is_some()
                || source_info
                    .name
                    .as_ref()
                    .map(|name| name.contains("monitor"))
                    .unwrap_or(false);

            let should_include = match device_type {
                DeviceType::Microphone => !is_monitor,
                DeviceType::Monitor => is_monitor,
                DeviceType::Any => true,
            };

            if should_include {
                if let (Some(name), Some(description)) = (
                    source_info.name.as_ref().map(|s| s.to_string()),
                    source_info.description.as_ref().map(|s| s.to_string()),
                ) {
                    if let Ok(mut devices) = devices_clone.lock() {
                        devices.push(AudioDevice {
                            name,
                            description,
                            sample_rate: source_info.sample_spec.rate,
                            channels: source_info.sample_spec.channels,
                            is_monitor,
                        });
                    }
                }
            }
        }
        ListResult::End => {
            if let Ok(mut done) = operation_done_clone.lock() {
                *done = true;
            }
        }
        ListResult::Error => {
            if let Ok(mut done) = operation_done_clone.lock() {
                *done = true;
            }
            error!("Error listing audio devices");
        }
    });

    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(VoiceError::AudioDevice("mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
        if operation_done.lock().map(|done| *done).unwrap_or(true) {
            break;
        }
    }

    let result = devices
        .lock()
        .map(|devices| devices.clone())
        .map_err(|_| VoiceError::AudioDevice("device list lock poisoned".to_string()));

    context.disconnect();
    mainloop.quit(Retval(0));

    result
}

/// Microphone track backed by a PulseAudio record stream.
pub struct PulseMicrophone {
    simple: Option<Simple>,
    sample_rate: u32,
    device_name: Option<String>,
}

impl PulseMicrophone {
    pub fn open(app_name: &str, device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let spec = Spec {
            format: Format::FLOAT32NE,
            channels: 1,
            rate: sample_rate,
        };
        let simple = Simple::new(
            None,
            app_name,
            Direction::Record,
            device_name,
            "interview microphone",
            &spec,
            None,
            None,
        )
        .map_err(|e| VoiceError::PermissionDenied(format!("microphone unavailable: {}", e)))?;

        info!("Opened microphone {:?} at {} Hz", device_name.unwrap_or("default"), sample_rate);
        Ok(Self {
            simple: Some(simple),
            sample_rate,
            device_name: device_name.map(|s| s.to_string()),
        })
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl MicrophoneStream for PulseMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_block(&mut self, block: &mut [f32]) -> Result<()> {
        let simple = self.simple.as_ref().ok_or(VoiceError::ConnectionClosed)?;
        simple
            .read(bytemuck::cast_slice_mut(block))
            .map_err(|e| pulse_err("microphone read", e))
    }

    fn stop(&mut self) {
        if self.simple.take().is_some() {
            debug!("Microphone stream released");
        }
    }
}

/// [`MediaDevices`] for the local PulseAudio server.
#[derive(Debug, Clone)]
pub struct PulseDevices {
    app_name: String,
    microphone: Option<String>,
    camera: bool,
}

impl PulseDevices {
    pub fn new(app_name: impl Into<String>, microphone: Option<String>, camera: bool) -> Self {
        Self {
            app_name: app_name.into(),
            microphone,
            camera,
        }
    }

    /// Pick the configured source, else the first real microphone.
    fn choose_source(&self) -> Option<AudioDevice> {
        let devices = match list_devices(&self.app_name, DeviceType::Microphone) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Could not list audio sources: {}", e);
                return None;
            }
        };
        match &self.microphone {
            Some(wanted) => {
                let found = devices.into_iter().find(|d| &d.name == wanted);
                if found.is_none() {
                    warn!("Configured microphone {} not found", wanted);
                }
                found
            }
            None => devices.into_iter().next(),
        }
    }
}

impl MediaDevices for PulseDevices {
    fn open_microphone(&self) -> Result<Box<dyn MicrophoneStream>> {
        let mic = match self.choose_source() {
            Some(device) => {
                info!("Using microphone: {} ({} Hz)", device.description, device.sample_rate);
                PulseMicrophone::open(&self.app_name, Some(&device.name), device.sample_rate)?
            }
            None => {
                info!("Using default audio input at {} Hz", FALLBACK_CAPTURE_RATE);
                PulseMicrophone::open(&self.app_name, self.microphone.as_deref(), FALLBACK_CAPTURE_RATE)?
            }
        };
        Ok(Box::new(mic))
    }

    fn open_camera(&self) -> Result<Option<Box<dyn CameraStream>>> {
        if self.camera {
            return Err(VoiceError::PermissionDenied("no camera backend available".to_string()));
        }
        Ok(None)
    }
}

struct ScheduledJob {
    buffer: PlayableBuffer,
    start: f64,
}

/// Output context writing to a PulseAudio playback stream.
///
/// The clock starts at zero when the context is created. A writer thread
/// connects to the server and then pads with silence up to each job's start
/// time before writing it. Opening never waits on the server; if the stream
/// cannot be created the thread exits and later scheduling fails.
pub struct PulseOutput {
    tx: Option<mpsc::Sender<ScheduledJob>>,
    epoch: Instant,
}

impl PulseOutput {
    pub fn open(app_name: &str, sample_rate: u32) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<ScheduledJob>();
        let epoch = Instant::now();
        let app_name = app_name.to_string();

        std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let spec = Spec {
                    format: Format::FLOAT32NE,
                    channels: 1,
                    rate: sample_rate,
                };
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    None,
                    "interviewer voice",
                    &spec,
                    None,
                    None,
                ) {
                    Ok(simple) => simple,
                    Err(e) => {
                        error!("Failed to open playback stream: {}", e);
                        return;
                    }
                };
                info!("Audio output ready at {} Hz", sample_rate);
                run_playback(simple, rx, epoch, sample_rate);
            })
            .map_err(|e| VoiceError::AudioDevice(format!("failed to spawn playback thread: {}", e)))?;

        Ok(Self { tx: Some(tx), epoch })
    }
}

fn run_playback(simple: Simple, rx: mpsc::Receiver<ScheduledJob>, epoch: Instant, sample_rate: u32) {
    let rate = f64::from(sample_rate);
    // End of what has been handed to the device, on the context clock
    let mut written_until = 0.0f64;

    while let Ok(job) = rx.recv() {
        let position = written_until.max(epoch.elapsed().as_secs_f64());
        let gap = job.start - position;
        if gap > 0.0 {
            let silence = vec![0.0f32; (gap * rate).round() as usize];
            if let Err(e) = simple.write(bytemuck::cast_slice(&silence)) {
                error!("Playback write failed: {}", e);
                return;
            }
        }
        if let Err(e) = simple.write(bytemuck::cast_slice(&job.buffer.samples)) {
            error!("Playback write failed: {}", e);
            return;
        }
        written_until = position + gap.max(0.0) + job.buffer.duration();
    }

    if let Err(e) = simple.drain() {
        debug!("Playback drain failed: {}", e);
    }
    debug!("Playback thread exiting");
}

impl OutputContext for PulseOutput {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn is_suspended(&self) -> bool {
        false
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn schedule(&mut self, buffer: PlayableBuffer, start: f64) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(VoiceError::ConnectionClosed)?;
        tx.send(ScheduledJob { buffer, start })
            .map_err(|_| VoiceError::AudioDevice("playback thread exited".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the sender lets the thread finish queued audio and exit
        self.tx.take();
        Ok(())
    }
}

/// Opens [`PulseOutput`] contexts.
#[derive(Debug, Clone)]
pub struct PulseOutputFactory {
    app_name: String,
}

impl PulseOutputFactory {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self { app_name: app_name.into() }
    }
}

impl OutputContextFactory for PulseOutputFactory {
    fn create(&self, sample_rate: u32) -> Result<Box<dyn OutputContext>> {
        Ok(Box::new(PulseOutput::open(&self.app_name, sample_rate)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // Fails without a PulseAudio server, which is fine in CI
        match list_devices("interview-voice-test", DeviceType::Any) {
            Ok(devices) => println!("Available input devices: {:?}", devices),
            Err(e) => println!("No PulseAudio server: {}", e),
        }
    }

    #[test]
    fn test_camera_request_without_backend_is_denied() {
        let devices = PulseDevices::new("interview-voice-test", None, true);
        assert!(matches!(devices.open_camera(), Err(VoiceError::PermissionDenied(_))));

        let devices = PulseDevices::new("interview-voice-test", None, false);
        assert!(devices.open_camera().unwrap().is_none());
    }

    #[test]
    fn test_output_opens_without_waiting_for_server() {
        // Succeeds whether or not a PulseAudio server is reachable
        let mut output = PulseOutput::open("interview-voice-test", 24_000).unwrap();
        assert!(!output.is_suspended());
        assert!(output.current_time() >= 0.0);

        output.close().unwrap();
        let buffer = PlayableBuffer { samples: vec![0.0; 240], sample_rate: 24_000 };
        assert!(matches!(output.schedule(buffer, 0.0), Err(VoiceError::ConnectionClosed)));
    }
}
