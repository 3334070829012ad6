//! Application state mutated by control events: the running transcript, the
//! "listening" indicator and the code-editor mode flag. Every change is
//! broadcast as a [`UiEvent`].

use tokio::sync::broadcast;

use crate::events::{CallStatus, Turn, UiEvent};

const UI_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Conversation {
    transcript: Vec<Turn>,
    listening: bool,
    code_mode: bool,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl Conversation {
    pub fn new() -> (Self, broadcast::Receiver<UiEvent>) {
        let (ui_tx, ui_rx) = broadcast::channel(UI_CHANNEL_CAPACITY);
        (
            Self {
                transcript: Vec::new(),
                listening: false,
                code_mode: false,
                ui_tx,
            },
            ui_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn code_mode(&self) -> bool {
        self.code_mode
    }

    pub fn push(&mut self, turn: Turn) {
        self.transcript.push(turn.clone());
        self.emit(UiEvent::Transcript(turn));
    }

    pub fn set_listening(&mut self, listening: bool) {
        if self.listening != listening {
            self.listening = listening;
            self.emit(UiEvent::Listening(listening));
        }
    }

    pub fn set_code_mode(&mut self, enabled: bool) {
        if self.code_mode != enabled {
            self.code_mode = enabled;
            self.emit(UiEvent::CodeMode(enabled));
        }
    }

    pub fn status_changed(&self, status: CallStatus) {
        self.emit(UiEvent::Status(status));
    }

    /// Drop the transcript and reset indicators.
    pub fn clear(&mut self) {
        self.transcript.clear();
        self.set_listening(false);
        self.set_code_mode(false);
        self.emit(UiEvent::TranscriptCleared);
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is fine
        let _ = self.ui_tx.send(event);
    }
}
