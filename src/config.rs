//! Session configuration
//!
//! Values come from the environment (a `.env` file is honoured) with defaults
//! matching the hosted voice agent and the local collaborator server.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, warn};

use crate::error::{Result, VoiceError};

pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";
pub const DEFAULT_TOKEN_URL: &str = "http://localhost:3021/api/deepgram-token";
pub const DEFAULT_INSTRUCTIONS_URL: &str = "http://localhost:3021/api/voice-instructions";

/// Fixed sample rate of agent audio.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture block.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;
/// Interval between keep-alive frames while a call is active.
pub const KEEPALIVE_SECS: u64 = 8;

/// A selectable interviewer voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voice {
    pub id: &'static str,
    pub name: &'static str,
    pub language: &'static str,
    pub kind: &'static str,
}

pub const VOICES: &[Voice] = &[
    Voice { id: "aura-2-thalia-en", name: "Thalia", language: "English (US)", kind: "Feminine" },
    Voice { id: "aura-2-theia-en", name: "Theia", language: "English (AUS)", kind: "Feminine" },
    Voice { id: "aura-2-zeus-en", name: "Zeus", language: "English (US)", kind: "Masculine" },
];

impl Voice {
    pub fn default_voice() -> &'static Voice {
        &VOICES[0]
    }

    /// Look up a voice by id, falling back to the default for unknown ids.
    pub fn resolve(id: &str) -> &'static Voice {
        match VOICES.iter().find(|v| v.id == id) {
            Some(voice) => voice,
            None => {
                warn!("Unknown voice id {:?}, using {}", id, Self::default_voice().id);
                Self::default_voice()
            }
        }
    }
}

/// Candidate profile used to synthesize the interviewer prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewProfile {
    pub user_name: String,
    pub target_role: String,
    pub experience: String,
    pub tech_stack: String,
}

impl Default for InterviewProfile {
    fn default() -> Self {
        Self {
            user_name: "Candidate".to_string(),
            target_role: "Software Engineer".to_string(),
            experience: "Junior".to_string(),
            tech_stack: "JavaScript".to_string(),
        }
    }
}

impl InterviewProfile {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_name: env_or("INTERVIEW_USER_NAME", defaults.user_name),
            target_role: env_or("INTERVIEW_TARGET_ROLE", defaults.target_role),
            experience: env_or("INTERVIEW_EXPERIENCE", defaults.experience),
            tech_stack: env_or("INTERVIEW_TECH_STACK", defaults.tech_stack),
        }
    }
}

/// Configuration for the voice session engine
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub agent_url: String,
    pub token_url: String,
    pub instructions_url: String,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
    pub listen_provider: String,
    pub listen_model: String,
    pub think_provider: String,
    pub think_model: String,
    pub speak_provider: String,
    pub greeting: Option<String>,
    pub app_name: String,
    pub microphone: Option<String>,
    pub camera: bool,
    pub keepalive_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            instructions_url: DEFAULT_INSTRUCTIONS_URL.to_string(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_block_size: CAPTURE_BLOCK_SIZE,
            listen_provider: "deepgram".to_string(),
            listen_model: "nova-3".to_string(),
            think_provider: "open_ai".to_string(),
            think_model: "gpt-4o-mini".to_string(),
            speak_provider: "deepgram".to_string(),
            greeting: None,
            app_name: "interview-voice".to_string(),
            microphone: None,
            camera: false,
            keepalive_secs: KEEPALIVE_SECS,
        }
    }
}

impl VoiceConfig {
    /// Build a configuration from `INTERVIEW_VOICE_*` variables.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let defaults = Self::default();
        let config = Self {
            agent_url: env_or("INTERVIEW_VOICE_AGENT_URL", defaults.agent_url),
            token_url: env_or("INTERVIEW_VOICE_TOKEN_URL", defaults.token_url),
            instructions_url: env_or("INTERVIEW_VOICE_INSTRUCTIONS_URL", defaults.instructions_url),
            output_sample_rate: defaults.output_sample_rate,
            capture_block_size: parse_env("INTERVIEW_VOICE_BLOCK_SIZE", defaults.capture_block_size)?,
            listen_provider: defaults.listen_provider,
            listen_model: env_or("INTERVIEW_VOICE_LISTEN_MODEL", defaults.listen_model),
            think_provider: env_or("INTERVIEW_VOICE_THINK_PROVIDER", defaults.think_provider),
            think_model: env_or("INTERVIEW_VOICE_THINK_MODEL", defaults.think_model),
            speak_provider: defaults.speak_provider,
            greeting: env::var("INTERVIEW_VOICE_GREETING").ok().filter(|g| !g.is_empty()),
            app_name: defaults.app_name,
            microphone: env::var("INTERVIEW_VOICE_MICROPHONE").ok().filter(|m| !m.is_empty()),
            camera: parse_env("INTERVIEW_VOICE_CAMERA", defaults.camera)?,
            keepalive_secs: parse_env("INTERVIEW_VOICE_KEEPALIVE_SECS", defaults.keepalive_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_url.is_empty() {
            return Err(VoiceError::MissingConfig("agent url".to_string()));
        }
        if self.capture_block_size == 0 {
            return Err(VoiceError::MissingConfig("capture block size must be non-zero".to_string()));
        }
        if self.keepalive_secs == 0 {
            return Err(VoiceError::MissingConfig("keep-alive interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| VoiceError::MissingConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}
