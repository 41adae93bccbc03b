//! Conversation transcript
//!
//! The service streams transcriptions of both sides in fragments. Fragments
//! for one speaker accumulate in an open, partial message until the turn
//! completes. Every change is broadcast so a UI can redraw just that message.

use std::time::SystemTime;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub at: SystemTime,
    pub is_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub is_partial: bool,
}

impl From<&Message> for TranscriptEvent {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            role: message.role,
            text: message.text.clone(),
            is_partial: message.is_partial,
        }
    }
}

pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
    events: broadcast::Sender<TranscriptEvent>,
}

impl Transcript {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            messages: Vec::new(),
            next_id: 0,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<TranscriptEvent> {
        self.events.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a fragment to the speaker's open message, or open a new one.
    pub fn push_fragment(&mut self, role: Role, text: &str) {
        if text.is_empty() {
            return;
        }
        let open = self
            .messages
            .iter()
            .rposition(|m| m.role == role && m.is_partial);

        let index = match open {
            Some(index) => {
                self.messages[index].text.push_str(text);
                index
            }
            None => {
                self.next_id += 1;
                self.messages.push(Message {
                    id: self.next_id,
                    role,
                    text: text.to_string(),
                    at: SystemTime::now(),
                    is_partial: true,
                });
                self.messages.len() - 1
            }
        };
        self.publish(index);
    }

    /// Close every open message.
    pub fn complete_turn(&mut self) {
        for index in 0..self.messages.len() {
            if self.messages[index].is_partial {
                self.messages[index].is_partial = false;
                self.publish(index);
            }
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn publish(&self, index: usize) {
        // Nobody listening is fine.
        let _ = self.events.send(TranscriptEvent::from(&self.messages[index]));
    }
}
