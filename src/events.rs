use serde::{Deserialize, Serialize};

/// Connection status rendered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Active => "active",
            CallStatus::Error => "error",
        }
    }
}

/// Speaker of a conversation turn, in the application's own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Map an agent-side role string. Anything that is not the user is the
    /// interviewer.
    pub fn from_agent(role: &str) -> Self {
        if role.eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::Assistant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One prior turn handed to a new call as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Events produced by the transport, consumed in arrival order by the
/// session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Binary(Vec<u8>),
    Text(String),
    Closed(Option<String>),
    Error(String),
}

/// Frames handed to the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Non-audio messages from the agent, after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ConversationText { role: Role, content: String },
    SpeechStarted,
    AgentStartedSpeaking,
    FunctionCallRequest { id: String, name: String, args: serde_json::Value },
    Error { detail: String },
}

/// Application-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status(CallStatus),
    Transcript(Turn),
    TranscriptCleared,
    Listening(bool),
    CodeMode(bool),
}
