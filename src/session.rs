//! Session controller
//!
//! Owns the call state machine `Idle -> Connecting -> Active -> (Idle | Error)`
//! and the resources of the live call. A call's transport, capture thread,
//! camera track and output context live in one [`Session`] value that is
//! built by `start_call` and consumed by teardown, so a new call always starts
//! from fresh state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audio::{PulseDevices, PulseOutputFactory};
use crate::capture::{CameraStream, CaptureEncoder, MediaDevices, MicrophoneStream};
use crate::config::{InterviewProfile, Voice, VoiceConfig};
use crate::conversation::Conversation;
use crate::dispatcher::{ControlEventDispatcher, Dispatched};
use crate::error::{Result, VoiceError};
use crate::events::{CallStatus, TransportEvent, Turn, UiEvent};
use crate::playback::{OutputContextFactory, PlaybackScheduler};
use crate::protocol::{
    AgentContext, AgentSettings, AudioFormat, AudioSettings, ClientMessage, HistoryMessage, ListenSettings,
    Provider, Settings, SpeakSettings, ThinkSettings, LINEAR16,
};
use crate::remote::{ConfigSource, HttpConfigSource};
use crate::tools;
use crate::transport::{Connector, TransportHandle, WsConnector};

/// External collaborators of the controller.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub config_source: Arc<dyn ConfigSource>,
    pub devices: Arc<dyn MediaDevices>,
    pub output: Arc<dyn OutputContextFactory>,
}

impl SessionDeps {
    /// WebSocket agent, HTTP collaborators and PulseAudio devices.
    pub fn production(config: &VoiceConfig) -> Self {
        Self {
            connector: Arc::new(WsConnector),
            config_source: Arc::new(HttpConfigSource::from_config(config)),
            devices: Arc::new(PulseDevices::new(
                config.app_name.clone(),
                config.microphone.clone(),
                config.camera,
            )),
            output: Arc::new(PulseOutputFactory::new(config.app_name.clone())),
        }
    }
}

/// Build the one-time settings handshake.
pub fn build_settings(
    config: &VoiceConfig,
    input_sample_rate: u32,
    prompt: &str,
    voice: &Voice,
    history: &[Turn],
) -> Settings {
    Settings {
        audio: AudioSettings {
            input: AudioFormat {
                encoding: LINEAR16.to_string(),
                sample_rate: input_sample_rate,
                container: None,
            },
            output: AudioFormat {
                encoding: LINEAR16.to_string(),
                sample_rate: config.output_sample_rate,
                container: Some("none".to_string()),
            },
        },
        agent: AgentSettings {
            listen: ListenSettings {
                provider: Provider {
                    kind: config.listen_provider.clone(),
                    model: config.listen_model.clone(),
                },
            },
            think: ThinkSettings {
                provider: Provider {
                    kind: config.think_provider.clone(),
                    model: config.think_model.clone(),
                },
                prompt: prompt.to_string(),
                functions: tools::declarations(),
            },
            speak: SpeakSettings {
                provider: Provider {
                    kind: config.speak_provider.clone(),
                    model: voice.id.to_string(),
                },
            },
            greeting: config.greeting.clone(),
            context: AgentContext {
                messages: history.iter().map(HistoryMessage::from).collect(),
            },
        },
    }
}

/// Resources of one live call.
struct Session {
    transport: TransportHandle,
    events: UnboundedReceiver<TransportEvent>,
    capture: Option<CaptureEncoder>,
    camera: Option<Box<dyn CameraStream>>,
    playback: PlaybackScheduler,
    keepalive: Interval,
    voice: &'static Voice,
    history: Vec<Turn>,
}

impl Session {
    fn send_keepalive(&self) {
        if !self.transport.is_writable() {
            return;
        }
        match self.transport.send_json(&ClientMessage::KeepAlive) {
            Ok(()) => debug!("Sent keep-alive"),
            Err(e) => debug!("Keep-alive not sent: {}", e),
        }
    }

    /// Tell capture to stop, then close the transport. Returns the capture
    /// thread, which may still be inside a blocking read.
    fn stop_capture(&mut self) -> Option<CaptureEncoder> {
        if let Some(capture) = &self.capture {
            capture.halt();
        }
        self.transport.close();
        self.capture.take()
    }

    fn release_outputs(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            debug!("Stopping camera {}", camera.label());
            camera.stop();
        }

        self.playback.close();
        self.events.close();
        info!("Session resources released");
    }

    /// Release everything. Capture is told to stop before anything else and
    /// the transport closes before the capture thread is joined; the output
    /// goes last so queued audio can drain. The join runs on the blocking
    /// pool.
    async fn teardown(mut self) {
        if let Some(capture) = self.stop_capture() {
            if let Err(e) = tokio::task::spawn_blocking(move || finish_capture(capture)).await {
                warn!("Capture shutdown task failed: {}", e);
            }
        }
        self.release_outputs();
    }

    /// Teardown for contexts that cannot wait. The capture thread is joined
    /// in the background when a runtime is available.
    fn abandon(mut self) {
        if let Some(capture) = self.stop_capture() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || finish_capture(capture));
                }
                Err(_) => finish_capture(capture),
            }
        }
        self.release_outputs();
    }
}

fn finish_capture(mut capture: CaptureEncoder) {
    if let Some(mut mic) = capture.join() {
        mic.stop();
    }
}

type OpenedDevices = (Box<dyn MicrophoneStream>, Option<Box<dyn CameraStream>>);

/// Open the microphone, and the camera when requested. Blocks on the device
/// backend.
fn open_devices(devices: &dyn MediaDevices, camera: bool) -> Result<OpenedDevices> {
    let mut mic = devices.open_microphone()?;
    if !camera {
        return Ok((mic, None));
    }
    match devices.open_camera() {
        Ok(camera) => Ok((mic, camera)),
        Err(e) => {
            mic.stop();
            Err(e)
        }
    }
}

/// Devices and connection acquired while connecting. Whatever is still held
/// when this is dropped gets released.
#[derive(Default)]
struct Acquired {
    mic: Option<Box<dyn MicrophoneStream>>,
    camera: Option<Box<dyn CameraStream>>,
    transport: Option<TransportHandle>,
}

impl Drop for Acquired {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut mic) = self.mic.take() {
            debug!("Releasing microphone after failed setup");
            mic.stop();
        }
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
    }
}

pub struct SessionController {
    config: VoiceConfig,
    profile: InterviewProfile,
    deps: SessionDeps,
    status: CallStatus,
    status_tx: watch::Sender<CallStatus>,
    session: Option<Session>,
    dispatcher: ControlEventDispatcher,
    conversation: Conversation,
}

impl SessionController {
    pub fn new(config: VoiceConfig, profile: InterviewProfile, deps: SessionDeps) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::Idle);
        let (conversation, _) = Conversation::new();
        Self {
            config,
            profile,
            deps,
            status: CallStatus::Idle,
            status_tx,
            session: None,
            dispatcher: ControlEventDispatcher::new(),
            conversation,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    /// Transcript, indicator and status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.conversation.subscribe()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn voice(&self) -> Option<&'static Voice> {
        self.session.as_ref().map(|s| s.voice)
    }

    /// History the live call was started with.
    pub fn history(&self) -> &[Turn] {
        self.session.as_ref().map(|s| s.history.as_slice()).unwrap_or(&[])
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.status == status {
            return;
        }
        info!("Call status: {} -> {}", self.status.as_str(), status.as_str());
        self.status = status;
        self.status_tx.send_replace(status);
        self.conversation.status_changed(status);
    }

    /// Start a call seeded with `history`, spoken in `voice_id`.
    ///
    /// Only valid from `Idle`. Any setup failure leaves the controller in
    /// `Error` with nothing held; call [`end_call`](Self::end_call) to return
    /// to `Idle`.
    pub async fn start_call(&mut self, history: Vec<Turn>, voice_id: &str) -> Result<()> {
        if self.status != CallStatus::Idle {
            warn!("Ignoring start request while {}", self.status.as_str());
            return Err(VoiceError::InvalidState(self.status));
        }
        self.set_status(CallStatus::Connecting);

        match self.connect(history, voice_id).await {
            Ok(session) => {
                self.session = Some(session);
                self.set_status(CallStatus::Active);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start call: {}", e);
                self.set_status(CallStatus::Error);
                Err(e)
            }
        }
    }

    async fn connect(&self, history: Vec<Turn>, voice_id: &str) -> Result<Session> {
        let voice = Voice::resolve(voice_id);
        let source = &self.deps.config_source;
        let (credential, prompt) =
            tokio::try_join!(source.fetch_credential(), source.fetch_instructions(&self.profile))?;

        let devices = self.deps.devices.clone();
        let want_camera = self.config.camera;
        let (mic, camera) = tokio::task::spawn_blocking(move || open_devices(&*devices, want_camera))
            .await
            .map_err(|e| VoiceError::AudioDevice(format!("device setup task failed: {}", e)))??;

        let mut acquired = Acquired::default();
        let input_rate = acquired.mic.insert(mic).sample_rate();
        acquired.camera = camera;

        let mut transport = self.deps.connector.connect(&self.config.agent_url, &credential).await?;
        acquired.transport = Some(transport.handle.clone());

        match transport.events.recv().await {
            Some(TransportEvent::Opened) => {}
            Some(TransportEvent::Closed(reason)) => {
                warn!("Agent closed the connection before it opened: {:?}", reason);
                return Err(VoiceError::ConnectionClosed);
            }
            Some(TransportEvent::Error(e)) => return Err(VoiceError::Transport(e)),
            Some(other) => {
                return Err(VoiceError::Malformed(format!("agent sent {:?} before opening", other)));
            }
            None => return Err(VoiceError::ChannelClosed),
        }

        let settings = build_settings(&self.config, input_rate, &prompt, voice, &history);
        transport.handle.send_json(&ClientMessage::Settings(settings))?;
        info!(
            history = history.len(),
            voice = voice.id,
            "Sent session settings"
        );

        // The handshake is already queued on the ordered writer, so every
        // capture frame lands after it.
        let mic = acquired
            .mic
            .take()
            .ok_or_else(|| VoiceError::AudioDevice("microphone released during setup".to_string()))?;
        let capture = CaptureEncoder::start(
            mic,
            transport.handle.clone(),
            self.config.capture_block_size,
            transport.reporter.clone(),
        )?;

        let period = Duration::from_secs(self.config.keepalive_secs);
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        acquired.transport = None;
        Ok(Session {
            transport: transport.handle,
            events: transport.events,
            capture: Some(capture),
            camera: acquired.camera.take(),
            playback: PlaybackScheduler::new(self.deps.output.clone(), self.config.output_sample_rate),
            keepalive,
            voice,
            history,
        })
    }

    /// End the call from any state. Safe to repeat.
    pub async fn end_call(&mut self) {
        match self.session.take() {
            Some(session) => {
                info!("Ending call");
                session.teardown().await;
            }
            None => debug!("No live session to end"),
        }
        self.conversation.clear();
        self.set_status(CallStatus::Idle);
    }

    /// Send the candidate's code to the interviewer as a user turn.
    pub fn submit_code(&mut self, code: &str) -> Result<()> {
        let session = match &self.session {
            Some(session) if self.status == CallStatus::Active => session,
            _ => return Err(VoiceError::InvalidState(self.status)),
        };
        self.dispatcher.tools().submit_code(code, &session.transport)?;
        self.conversation.set_code_mode(false);
        Ok(())
    }

    pub fn close_code_editor(&mut self) {
        self.conversation.set_code_mode(false);
    }

    /// Wait for the next transport event of the live call, sending
    /// keep-alives while waiting. Pending forever when there is no call.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            let Some(session) = self.session.as_mut() else {
                return std::future::pending().await;
            };
            tokio::select! {
                event = session.events.recv() => {
                    return event.unwrap_or(TransportEvent::Closed(None));
                }
                _ = session.keepalive.tick() => session.send_keepalive(),
            }
        }
    }

    /// Apply one transport event.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {:?} with no live session", event);
            return;
        };

        match event {
            TransportEvent::Binary(bytes) => {
                if self.status != CallStatus::Active {
                    return;
                }
                if let Err(e) = session.playback.enqueue(&bytes) {
                    warn!(bytes = bytes.len(), "Dropping agent audio: {}", e);
                }
            }
            TransportEvent::Text(text) => {
                let outcome = self.dispatcher.dispatch(&text, &mut self.conversation, &session.transport);
                if outcome == Dispatched::Dropped {
                    debug!("Agent message dropped");
                }
            }
            TransportEvent::Opened => debug!("Ignoring repeated open notification"),
            TransportEvent::Closed(reason) => {
                info!("Agent closed the call: {:?}", reason);
                self.release_session().await;
                self.set_status(CallStatus::Idle);
            }
            TransportEvent::Error(e) => {
                error!("Call failed: {}", e);
                self.release_session().await;
                self.set_status(CallStatus::Error);
            }
        }
    }

    /// Wait for and apply the next event.
    pub async fn pump(&mut self) {
        let event = self.next_event().await;
        self.handle_event(event).await;
    }

    async fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.teardown().await;
        }
        self.conversation.set_listening(false);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OutboundFrame, Role};
    use crate::testing::{ConnectBehavior, FakeConfigSource, FakeConnector, FakeDevices, ManualOutput};
    use crate::transport::TransportPeer;

    struct Harness {
        controller: SessionController,
        connector: Arc<FakeConnector>,
        devices: Arc<FakeDevices>,
        output: ManualOutput,
    }

    fn harness_with(behavior: ConnectBehavior, devices: FakeDevices, source: FakeConfigSource) -> Harness {
        let connector = Arc::new(FakeConnector::new(behavior));
        let devices = Arc::new(devices);
        let output = ManualOutput::new();
        let deps = SessionDeps {
            connector: connector.clone(),
            config_source: Arc::new(source),
            devices: devices.clone(),
            output: Arc::new(output.clone()),
        };
        let config = VoiceConfig { capture_block_size: 256, ..Default::default() };
        Harness {
            controller: SessionController::new(config, InterviewProfile::default(), deps),
            connector,
            devices,
            output,
        }
    }

    fn harness() -> Harness {
        harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000),
            FakeConfigSource::new("key-1", "Be a tough interviewer."),
        )
    }

    /// Pull outbound frames until `pred` matches one.
    async fn next_matching(peer: &mut TransportPeer, pred: impl Fn(&OutboundFrame) -> bool) -> OutboundFrame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), peer.outbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("outbound channel closed");
            if pred(&frame) {
                return frame;
            }
        }
    }

    fn drain_text(peer: &mut TransportPeer) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = peer.outbound.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_precedes_capture() {
        let mut h = harness();
        h.controller
            .start_call(vec![Turn::user("hi")], "aura-2-zeus-en")
            .await
            .unwrap();
        assert_eq!(h.controller.status(), CallStatus::Active);
        assert_eq!(h.connector.credentials(), vec!["key-1".to_string()]);

        let mut peer = h.connector.take_peer().unwrap();
        let first = peer.outbound.recv().await.unwrap();
        let settings: serde_json::Value = match first {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected handshake first, got {:?}", other),
        };
        assert_eq!(settings["type"], "Settings");
        assert_eq!(settings["audio"]["input"]["sample_rate"], 16_000);
        assert_eq!(settings["audio"]["output"]["sample_rate"], 24_000);
        assert_eq!(settings["agent"]["speak"]["provider"]["model"], "aura-2-zeus-en");
        assert_eq!(settings["agent"]["think"]["functions"][0]["name"], "open_code_editor");
        assert!(settings["agent"]["think"]["prompt"]
            .as_str()
            .unwrap()
            .starts_with("Be a tough interviewer."));
        assert_eq!(
            settings["agent"]["context"]["messages"],
            serde_json::json!([{"type": "History", "role": "user", "content": "hi"}])
        );

        let frame = next_matching(&mut peer, |f| matches!(f, OutboundFrame::Binary(_))).await;
        match frame {
            OutboundFrame::Binary(bytes) => assert_eq!(bytes.len(), 256 * 2),
            _ => unreachable!(),
        }
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_assistant_text_appends_one_entry() {
        let mut h = harness();
        h.controller.start_call(vec![Turn::user("hi")], "").await.unwrap();
        let peer = h.connector.take_peer().unwrap();

        peer.inbound
            .send(TransportEvent::Text(
                r#"{"type":"ConversationText","role":"assistant","content":"hello"}"#.into(),
            ))
            .unwrap();
        h.controller.pump().await;

        let transcript = h.controller.conversation().transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, Role::Assistant);
        assert_eq!(transcript[0].content, "hello");
        assert_eq!(h.controller.voice().unwrap().id, "aura-2-thalia-en");
        assert_eq!(h.controller.history(), &[Turn::user("hi")]);
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let mut h = harness();
        h.controller.end_call().await;
        assert_eq!(h.controller.status(), CallStatus::Idle);

        h.controller.start_call(Vec::new(), "").await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();
        peer.inbound.send(TransportEvent::Binary(vec![0; 4_800])).unwrap();
        h.controller.pump().await;
        assert_eq!(h.output.scheduled().len(), 1);

        h.controller.end_call().await;
        h.controller.end_call().await;
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert!(h.controller.conversation().transcript().is_empty());
        assert!(h.devices.mic_observer().unwrap().stopped());
        assert!(h.output.is_closed());

        let frames: Vec<OutboundFrame> = std::iter::from_fn(|| peer.outbound.try_recv().ok()).collect();
        assert_eq!(frames.iter().filter(|f| **f == OutboundFrame::Close).count(), 1);

        // Capture has been joined, nothing more arrives
        std::thread::sleep(Duration::from_millis(20));
        assert!(peer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_credential_failure_sets_error() {
        let mut h = harness_with(ConnectBehavior::Open, FakeDevices::new(16_000), FakeConfigSource::failing());
        assert!(h.controller.start_call(Vec::new(), "").await.is_err());
        assert_eq!(h.controller.status(), CallStatus::Error);
        assert!(h.connector.credentials().is_empty());

        h.controller.end_call().await;
        assert_eq!(h.controller.status(), CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_microphone_denial_is_fatal() {
        let mut h = harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000).denying(),
            FakeConfigSource::new("k", "p"),
        );
        let result = h.controller.start_call(Vec::new(), "").await;
        assert!(matches!(result, Err(VoiceError::PermissionDenied(_))));
        assert_eq!(h.controller.status(), CallStatus::Error);
        assert!(h.connector.credentials().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_open_releases_devices() {
        let mut h = harness_with(
            ConnectBehavior::CloseBeforeOpen,
            FakeDevices::new(16_000),
            FakeConfigSource::new("k", "p"),
        );
        let result = h.controller.start_call(Vec::new(), "").await;
        assert!(matches!(result, Err(VoiceError::ConnectionClosed)));
        assert_eq!(h.controller.status(), CallStatus::Error);
        assert!(h.devices.mic_observer().unwrap().stopped());
    }

    #[tokio::test]
    async fn test_start_rejected_while_active() {
        let mut h = harness();
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let result = h.controller.start_call(Vec::new(), "").await;
        assert!(matches!(result, Err(VoiceError::InvalidState(CallStatus::Active))));
        assert_eq!(h.controller.status(), CallStatus::Active);
        assert_eq!(h.connector.credentials().len(), 1);
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_idle() {
        let mut h = harness();
        let mut status = h.controller.watch_status();
        h.controller.start_call(Vec::new(), "").await.unwrap();
        assert_eq!(*status.borrow_and_update(), CallStatus::Active);
        let peer = h.connector.take_peer().unwrap();

        peer.inbound
            .send(TransportEvent::Text(r#"{"type":"ConversationText","role":"user","content":"bye"}"#.into()))
            .unwrap();
        h.controller.pump().await;
        peer.fail(TransportEvent::Closed(Some("done".into())));
        h.controller.pump().await;

        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert_eq!(*status.borrow(), CallStatus::Idle);
        assert!(h.devices.mic_observer().unwrap().stopped());
        assert_eq!(h.controller.conversation().transcript().len(), 1);

        // A new call gets a fresh transport
        h.controller.start_call(Vec::new(), "").await.unwrap();
        assert!(h.connector.take_peer().is_some());
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_remote_error_sets_error() {
        let mut h = harness();
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let peer = h.connector.take_peer().unwrap();

        peer.fail(TransportEvent::Error("reset by peer".into()));
        h.controller.pump().await;
        assert_eq!(h.controller.status(), CallStatus::Error);
        assert!(h.devices.mic_observer().unwrap().stopped());
    }

    #[tokio::test]
    async fn test_tool_call_gets_exactly_one_response() {
        let mut h = harness();
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();

        for raw in [
            r#"{"type":"FunctionCallRequest","functions":[{"id":"fc-1","name":"open_code_editor","arguments":"{}"}]}"#,
            r#"{"type":"FunctionCallRequest","functions":[{"id":"fc-2","name":"launch_rockets","arguments":"{}"}]}"#,
            r#"{not json"#,
        ] {
            peer.inbound.send(TransportEvent::Text(raw.into())).unwrap();
            h.controller.pump().await;
        }
        assert_eq!(h.controller.status(), CallStatus::Active);
        assert!(h.controller.conversation().code_mode());

        let responses: Vec<_> = drain_text(&mut peer)
            .into_iter()
            .filter(|v| v["type"] == "FunctionCallResponse")
            .collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "fc-1");
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_submit_code_requires_active_call() {
        let mut h = harness();
        assert!(matches!(
            h.controller.submit_code("x"),
            Err(VoiceError::InvalidState(CallStatus::Idle))
        ));

        h.controller.start_call(Vec::new(), "").await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();
        peer.inbound
            .send(TransportEvent::Text(
                r#"{"type":"FunctionCallRequest","functions":[{"id":"fc-1","name":"open_code_editor"}]}"#.into(),
            ))
            .unwrap();
        h.controller.pump().await;
        assert!(h.controller.conversation().code_mode());

        h.controller.submit_code("print(1)").unwrap();
        assert!(!h.controller.conversation().code_mode());
        let texts = drain_text(&mut peer);
        let submitted = texts.iter().find(|v| v["type"] == "ConversationText").unwrap();
        assert_eq!(submitted["role"], "user");
        assert_eq!(submitted["content"], "Here is my code solution:\n\nprint(1)");
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_keepalive_while_waiting() {
        let mut h = harness();
        h.controller.config.keepalive_secs = 1;
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(1_500), h.controller.next_event()).await;
        assert!(waited.is_err());
        let keepalives = drain_text(&mut peer)
            .into_iter()
            .filter(|v| v["type"] == "KeepAlive")
            .count();
        assert_eq!(keepalives, 1);
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_camera_is_released_on_end() {
        let mut h = harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000).with_camera(),
            FakeConfigSource::new("k", "p"),
        );
        h.controller.config.camera = true;
        h.controller.start_call(Vec::new(), "").await.unwrap();
        assert!(!h.devices.camera_stopped());

        h.controller.end_call().await;
        assert!(h.devices.camera_stopped());
    }

    #[tokio::test]
    async fn test_microphone_failure_ends_call() {
        let mut h = harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000).failing_reads(),
            FakeConfigSource::new("k", "p"),
        );
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();

        tokio::time::timeout(Duration::from_secs(2), h.controller.pump())
            .await
            .expect("microphone failure never reached the session");
        assert_eq!(h.controller.status(), CallStatus::Error);
        assert!(h.devices.mic_observer().unwrap().stopped());

        let frames: Vec<OutboundFrame> = std::iter::from_fn(|| peer.outbound.try_recv().ok()).collect();
        assert!(!frames.iter().any(|f| matches!(f, OutboundFrame::Binary(_))));
        assert!(frames.contains(&OutboundFrame::Close));
    }

    /// Flag set by a task that needs the runtime to make progress.
    fn spawn_ticker() -> Arc<std::sync::atomic::AtomicBool> {
        let ticked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ticked.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::Release);
        });
        ticked
    }

    #[tokio::test]
    async fn test_slow_device_open_leaves_runtime_free() {
        let mut h = harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000).with_open_delay(Duration::from_millis(200)),
            FakeConfigSource::new("k", "p"),
        );
        let ticked = spawn_ticker();
        h.controller.start_call(Vec::new(), "").await.unwrap();
        assert!(ticked.load(std::sync::atomic::Ordering::Acquire));
        assert_eq!(h.controller.status(), CallStatus::Active);
        h.controller.end_call().await;
    }

    #[tokio::test]
    async fn test_slow_capture_join_leaves_runtime_free() {
        let mut h = harness_with(
            ConnectBehavior::Open,
            FakeDevices::new(16_000).with_read_delay(Duration::from_millis(200)),
            FakeConfigSource::new("k", "p"),
        );
        h.controller.start_call(Vec::new(), "").await.unwrap();
        let ticked = spawn_ticker();

        h.controller.end_call().await;
        assert!(ticked.load(std::sync::atomic::Ordering::Acquire));
        assert!(h.devices.mic_observer().unwrap().stopped());
        assert_eq!(h.controller.status(), CallStatus::Idle);
    }
}
