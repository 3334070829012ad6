//! Interview Voice - real-time voice sessions for mock interviews
//!
//! A call streams microphone audio to a hosted conversational agent while the
//! agent's speech is played back gaplessly. Transcripts, speaking signals and
//! tool calls arrive on the same connection and update the conversation state.

#![forbid(unsafe_code)]

/// PulseAudio device discovery, microphone and speaker backends
pub mod audio;
pub mod capture;
/// PCM16 <-> float sample conversion
pub mod codec;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod playback;
/// Voice agent wire protocol
pub mod protocol;
pub mod remote;
pub mod session;
/// In-memory doubles for the device and network seams
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod tools;
pub mod transport;

pub use config::{InterviewProfile, Voice, VoiceConfig};
pub use error::{Result, VoiceError};
pub use events::{CallStatus, Role, Turn, UiEvent};
pub use session::{SessionController, SessionDeps};
