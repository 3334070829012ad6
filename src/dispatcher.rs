//! Classification and routing of inbound text frames.

use tracing::{debug, error, info, warn};

use crate::conversation::Conversation;
use crate::error::{Result, VoiceError};
use crate::events::{ControlEvent, Role, Turn};
use crate::protocol::ServerMessage;
use crate::tools::{ToolInvocationBridge, ToolOutcome};
use crate::transport::TransportHandle;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Transcript(Role),
    Listening,
    AgentSpeaking,
    Tool(ToolOutcome),
    AgentError,
    Ignored,
    Dropped,
}

/// Parse a text frame into a control event.
///
/// `Ok(None)` means the frame was well formed but carries nothing to route
/// (acknowledgements and kinds this client does not know).
pub fn parse(text: &str) -> Result<Option<ControlEvent>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| VoiceError::Malformed(e.to_string()))?;

    let event = match message {
        ServerMessage::ConversationText { role, content } => Some(ControlEvent::ConversationText {
            role: Role::from_agent(&role),
            content,
        }),
        ServerMessage::UserStartedSpeaking => Some(ControlEvent::SpeechStarted),
        ServerMessage::AgentStartedSpeaking => Some(ControlEvent::AgentStartedSpeaking),
        ServerMessage::FunctionCallRequest { functions } => {
            if functions.len() > 1 {
                warn!(count = functions.len(), "Multiple functions requested, handling the first");
            }
            match functions.into_iter().next() {
                Some(call) => Some(ControlEvent::FunctionCallRequest {
                    id: call.id,
                    name: call.name,
                    args: call.parameters,
                }),
                None => return Err(VoiceError::Malformed("function call request without functions".to_string())),
            }
        }
        ServerMessage::Error { description, code } => Some(ControlEvent::Error {
            detail: match code {
                Some(code) => format!("{} ({})", description, code),
                None => description,
            },
        }),
        ServerMessage::Welcome { request_id } => {
            info!("Agent welcomed session {:?}", request_id);
            None
        }
        ServerMessage::SettingsApplied => {
            info!("Agent applied session settings");
            None
        }
        ServerMessage::AgentAudioDone => {
            debug!("Agent finished sending audio");
            None
        }
        ServerMessage::Warning { description } => {
            warn!("Agent warning: {}", description);
            None
        }
        ServerMessage::Unknown => {
            debug!("Ignoring unrecognised agent message");
            None
        }
    };
    Ok(event)
}

#[derive(Debug, Default)]
pub struct ControlEventDispatcher {
    tools: ToolInvocationBridge,
}

impl ControlEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tools(&self) -> &ToolInvocationBridge {
        &self.tools
    }

    /// Classify one text frame and apply it. Never fails: bad frames are
    /// logged and dropped.
    pub fn dispatch(
        &mut self,
        text: &str,
        conversation: &mut Conversation,
        transport: &TransportHandle,
    ) -> Dispatched {
        let event = match parse(text) {
            Ok(Some(event)) => event,
            Ok(None) => return Dispatched::Ignored,
            Err(e) => {
                warn!("Dropping agent message: {}", e);
                debug!("Raw message: {}", text);
                return Dispatched::Dropped;
            }
        };

        match event {
            ControlEvent::ConversationText { role, content } => {
                debug!("{}: {}", role.as_str(), content);
                conversation.push(Turn { role, content });
                Dispatched::Transcript(role)
            }
            ControlEvent::SpeechStarted => {
                conversation.set_listening(true);
                Dispatched::Listening
            }
            ControlEvent::AgentStartedSpeaking => {
                conversation.set_listening(false);
                Dispatched::AgentSpeaking
            }
            ControlEvent::FunctionCallRequest { id, name, args } => {
                debug!(%id, %name, %args, "Function call requested");
                match self.tools.invoke(&id, &name, conversation, transport) {
                    Ok(outcome) => Dispatched::Tool(outcome),
                    Err(e) => {
                        error!(%id, "Failed to answer tool call: {}", e);
                        Dispatched::Dropped
                    }
                }
            }
            ControlEvent::Error { detail } => {
                error!("Agent reported an error: {}", detail);
                Dispatched::AgentError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutboundFrame;
    use crate::tools::OPEN_CODE_EDITOR;
    use crate::transport::Transport;

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            parse(r#"{"type":"ConversationText","role":"assistant","content":"hello"}"#).unwrap(),
            Some(ControlEvent::ConversationText { role: Role::Assistant, content: "hello".into() })
        );
        assert_eq!(
            parse(r#"{"type":"UserStartedSpeaking"}"#).unwrap(),
            Some(ControlEvent::SpeechStarted)
        );
        assert_eq!(
            parse(r#"{"type":"Error","description":"quota"}"#).unwrap(),
            Some(ControlEvent::Error { detail: "quota".into() })
        );
        assert_eq!(parse(r#"{"type":"SettingsApplied"}"#).unwrap(), None);
        assert_eq!(parse(r#"{"type":"FutureThing","x":[1,2]}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_takes_first_function() {
        let event = parse(
            r#"{"type":"FunctionCallRequest","functions":[
                {"id":"a","name":"open_code_editor","arguments":"{}"},
                {"id":"b","name":"other","arguments":"{}"}]}"#,
        )
        .unwrap();
        match event {
            Some(ControlEvent::FunctionCallRequest { id, name, .. }) => {
                assert_eq!(id, "a");
                assert_eq!(name, OPEN_CODE_EDITOR);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(parse(r#"{"type":"FunctionCallRequest","functions":[]}"#).is_err());
    }

    #[test]
    fn test_assistant_text_appends_one_entry() {
        let (transport, _peer) = Transport::pair();
        let (mut conversation, _rx) = Conversation::new();
        let mut dispatcher = ControlEventDispatcher::new();

        let result = dispatcher.dispatch(
            r#"{"type":"ConversationText","role":"assistant","content":"hello"}"#,
            &mut conversation,
            &transport.handle,
        );
        assert_eq!(result, Dispatched::Transcript(Role::Assistant));
        assert_eq!(conversation.transcript(), &[Turn::assistant("hello")]);
    }

    #[test]
    fn test_speech_signals_toggle_listening() {
        let (transport, _peer) = Transport::pair();
        let (mut conversation, _rx) = Conversation::new();
        let mut dispatcher = ControlEventDispatcher::new();

        dispatcher.dispatch(r#"{"type":"UserStartedSpeaking"}"#, &mut conversation, &transport.handle);
        assert!(conversation.listening());
        dispatcher.dispatch(r#"{"type":"AgentStartedSpeaking"}"#, &mut conversation, &transport.handle);
        assert!(!conversation.listening());
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_harmless() {
        let (transport, mut peer) = Transport::pair();
        let (mut conversation, _rx) = Conversation::new();
        let mut dispatcher = ControlEventDispatcher::new();

        for raw in ["{oops", r#"{"role":"user"}"#, r#"{"type":"ConversationText"}"#] {
            assert_eq!(dispatcher.dispatch(raw, &mut conversation, &transport.handle), Dispatched::Dropped);
        }
        assert_eq!(
            dispatcher.dispatch(r#"{"type":"Brand new"}"#, &mut conversation, &transport.handle),
            Dispatched::Ignored
        );
        assert_eq!(
            dispatcher.dispatch(r#"{"type":"Error","description":"x"}"#, &mut conversation, &transport.handle),
            Dispatched::AgentError
        );
        assert!(conversation.transcript().is_empty());
        assert!(peer.outbound.try_recv().is_err());
    }

    #[test]
    fn test_function_call_routes_to_bridge() {
        let (transport, mut peer) = Transport::pair();
        let (mut conversation, _rx) = Conversation::new();
        let mut dispatcher = ControlEventDispatcher::new();

        let result = dispatcher.dispatch(
            r#"{"type":"FunctionCallRequest","functions":[{"id":"f1","name":"open_code_editor","arguments":"{}"}]}"#,
            &mut conversation,
            &transport.handle,
        );
        assert_eq!(result, Dispatched::Tool(ToolOutcome::Responded { id: "f1".into() }));
        assert!(conversation.code_mode());
        assert!(matches!(peer.outbound.try_recv().unwrap(), OutboundFrame::Text(_)));

        let result = dispatcher.dispatch(
            r#"{"type":"FunctionCallRequest","functions":[{"id":"f2","name":"nope"}]}"#,
            &mut conversation,
            &transport.handle,
        );
        assert_eq!(result, Dispatched::Tool(ToolOutcome::UnknownTool { name: "nope".into() }));
        assert!(peer.outbound.try_recv().is_err());
    }
}
