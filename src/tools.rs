//! Local capabilities the agent can invoke mid-conversation.
//!
//! Each request becomes a [`PendingToolCall`] that is consumed by its single
//! response, so a call can never be answered twice.

use tracing::{info, warn};

use crate::conversation::Conversation;
use crate::error::Result;
use crate::events::Role;
use crate::protocol::{ClientMessage, FunctionDeclaration};
use crate::transport::TransportHandle;

pub const OPEN_CODE_EDITOR: &str = "open_code_editor";

/// Prefix for code injected into the dialogue on submission.
pub const CODE_SUBMISSION_PREFIX: &str = "Here is my code solution:\n\n";

/// A named local capability.
pub struct LocalTool {
    pub name: &'static str,
    pub description: &'static str,
    pub confirmation: &'static str,
    pub apply: fn(&mut Conversation),
}

fn open_code_editor(conversation: &mut Conversation) {
    conversation.set_code_mode(true);
}

pub static REGISTRY: &[LocalTool] = &[LocalTool {
    name: OPEN_CODE_EDITOR,
    description: "Switch the interview into code-submission mode so the candidate gets a code \
                  editor. Call this whenever you ask the candidate to write code.",
    confirmation: "The code editor is now open. Wait for the candidate to submit their solution.",
    apply: open_code_editor,
}];

pub fn lookup(name: &str) -> Option<&'static LocalTool> {
    REGISTRY.iter().find(|tool| tool.name == name)
}

/// Declarations advertised in the settings handshake.
pub fn declarations() -> Vec<FunctionDeclaration> {
    REGISTRY
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        })
        .collect()
}

/// A tool call awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
}

impl PendingToolCall {
    /// Confirm the call back to the agent.
    pub fn respond(self, confirmation: &str, transport: &TransportHandle) -> Result<ToolOutcome> {
        let response = ClientMessage::FunctionCallResponse {
            id: self.id.clone(),
            name: self.name,
            content: confirmation.to_string(),
        };
        transport.send_json(&response)?;
        Ok(ToolOutcome::Responded { id: self.id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Responded { id: String },
    UnknownTool { name: String },
}

#[derive(Debug, Default)]
pub struct ToolInvocationBridge;

impl ToolInvocationBridge {
    pub fn new() -> Self {
        Self
    }

    /// Run the named capability and confirm it back to the agent.
    ///
    /// Unknown names get no response.
    pub fn invoke(
        &self,
        id: &str,
        name: &str,
        conversation: &mut Conversation,
        transport: &TransportHandle,
    ) -> Result<ToolOutcome> {
        let Some(tool) = lookup(name) else {
            warn!(id, name, "Agent requested an unknown tool, ignoring");
            return Ok(ToolOutcome::UnknownTool { name: name.to_string() });
        };

        let call = PendingToolCall {
            id: id.to_string(),
            name: name.to_string(),
        };
        info!(id, name, "Invoking local tool");
        (tool.apply)(conversation);
        call.respond(tool.confirmation, transport)
    }

    /// Inject submitted code into the dialogue as a user turn.
    pub fn submit_code(&self, code: &str, transport: &TransportHandle) -> Result<()> {
        let message = ClientMessage::ConversationText {
            role: Role::User,
            content: format!("{}{}", CODE_SUBMISSION_PREFIX, code),
        };
        transport.send_json(&message)?;
        info!(bytes = code.len(), "Submitted code to the interviewer");
        Ok(())
    }
}
