//! Shared types for the Cadence voice-conversation server.
//!
//! This crate provides the data model every other Cadence crate speaks:
//! audio frames, transcript fragments, reply chunks, the conversation
//! lifecycle state and the events a session emits towards its transport.
//!
//! No crate in the workspace depends on anything *except* `cadence-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod audio;
pub mod voice;

pub use audio::{AudioFormat, AudioFrame};

/// One transcription result for the current utterance.
///
/// Fragments sharing an index describe the same utterance; only a fragment
/// with `is_final` set may start an agent turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptFragment {
    /// Monotonically non-decreasing utterance index.
    pub index: u64,
    /// Transcribed text.
    pub text: String,
    /// Whether the provider will no longer revise this utterance.
    pub is_final: bool,
}

impl TranscriptFragment {
    pub fn partial(index: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(index: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            is_final: true,
        }
    }
}

/// A segment of the agent's reply, synthesized in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyChunk {
    pub text: String,
    /// Set on the last chunk of a turn.
    pub end_of_turn: bool,
}

impl ReplyChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_of_turn: false,
        }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            end_of_turn: true,
        }
    }
}

/// Lifecycle of a conversation session.
///
/// `Active` is transient: a successful bind moves straight on to `Listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Created, ports not yet bound.
    Idle,
    /// Ports bound, accepting audio.
    Active,
    /// Awaiting a final transcript.
    Listening,
    /// Agent and synthesis in flight for the current turn.
    Responding,
    /// Terminal; no further frames accepted.
    Terminated,
}

impl ConversationState {
    /// Whether `submit_audio` is legal in this state.
    pub fn accepts_audio(self) -> bool {
        matches!(self, Self::Listening | Self::Responding)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Listening => "listening",
            Self::Responding => "responding",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error category reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Decode,
    Transcription,
    Agent,
    Synthesis,
    InvalidState,
    DuplicateSession,
    Capacity,
    /// Malformed client message or an unexpected server fault.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Decode => "decode",
            Self::Transcription => "transcription",
            Self::Agent => "agent",
            Self::Synthesis => "synthesis",
            Self::InvalidState => "invalid_state",
            Self::DuplicateSession => "duplicate_session",
            Self::Capacity => "capacity",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a session emits towards its transport, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// The session exists and can be started.
    ConnectionEstablished { session_id: String },
    /// Ports are bound and audio is accepted.
    ConversationStarted,
    /// One synthesized frame of the reply for `turn`.
    AudioResponse {
        /// Per-session monotonic counter.
        sequence: u64,
        turn: u64,
        frame: AudioFrame,
    },
    /// The session reached `Terminated`.
    ConversationEnded,
    /// A recoverable failure; the session stays open.
    Error { message: String, kind: ErrorKind },
}

impl ConversationEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::ConversationStarted => "conversation_started",
            Self::AudioResponse { .. } => "audio_response",
            Self::ConversationEnded => "conversation_ended",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listening_and_responding_accept_audio() {
        assert!(!ConversationState::Idle.accepts_audio());
        assert!(!ConversationState::Active.accepts_audio());
        assert!(ConversationState::Listening.accepts_audio());
        assert!(ConversationState::Responding.accepts_audio());
        assert!(!ConversationState::Terminated.accepts_audio());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidState).unwrap();
        assert_eq!(json, "\"invalid_state\"");
        assert_eq!(ErrorKind::DuplicateSession.to_string(), "duplicate_session");
    }

    #[test]
    fn event_names_match_wire_protocol() {
        let frame = AudioFrame::new(vec![0i16; 4], AudioFormat::speech(), 0);
        let names: Vec<_> = [
            ConversationEvent::ConnectionEstablished {
                session_id: "s1".into(),
            },
            ConversationEvent::ConversationStarted,
            ConversationEvent::AudioResponse {
                sequence: 0,
                turn: 0,
                frame,
            },
            ConversationEvent::ConversationEnded,
            ConversationEvent::error(ErrorKind::Agent, "quota"),
        ]
        .iter()
        .map(ConversationEvent::name)
        .collect();
        assert_eq!(
            names,
            [
                "connection_established",
                "conversation_started",
                "audio_response",
                "conversation_ended",
                "error"
            ]
        );
    }
}
