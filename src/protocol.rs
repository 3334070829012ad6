//! Voice agent wire protocol
//!
//! Text frames are JSON objects discriminated by `type`. Binary frames carry
//! raw PCM16 and never pass through this module.

use serde::{Deserialize, Serialize};

use crate::events::{Role, Turn};

pub const LINEAR16: &str = "linear16";

/// Audio stream description for one direction.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

/// Provider selection for one agent stage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ListenSettings {
    pub provider: Provider,
}

/// Tool declaration advertised to the agent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ThinkSettings {
    pub provider: Provider,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpeakSettings {
    pub provider: Provider,
}

/// A prior turn replayed to the agent before live audio starts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename = "History")]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for HistoryMessage {
    fn from(turn: &Turn) -> Self {
        Self { role: turn.role, content: turn.content.clone() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AgentContext {
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentSettings {
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub context: AgentContext,
}

/// The one-time handshake sent right after the socket opens.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

/// Message sent from client to agent.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Settings(Settings),
    FunctionCallResponse {
        id: String,
        name: String,
        content: String,
    },
    ConversationText {
        role: Role,
        content: String,
    },
    KeepAlive,
}

/// Function descriptor inside a `FunctionCallRequest`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub parameters: serde_json::Value,
}

/// Agent -> client messages
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    ConversationText {
        role: String,
        #[serde(default)]
        content: String,
    },
    UserStartedSpeaking,
    AgentStartedSpeaking,
    AgentAudioDone,
    FunctionCallRequest {
        #[serde(default)]
        functions: Vec<FunctionCall>,
    },
    Error {
        #[serde(default, alias = "message")]
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: String,
    },
    #[serde(other)]
    Unknown,
}
