//! Audio handling and speech providers for Cadence.
//!
//! This crate owns everything between raw client audio and the conversation
//! pipeline: decoding inbound payloads into canonical frames, the capability
//! traits a session is bound to (transcriber, agent, synthesizer), and the
//! concrete providers behind them.
//!
//! Hosted providers (Whisper transcription, chat completions, ElevenLabs
//! synthesis) talk HTTP through a shared `reqwest` client. Local providers
//! (whisper.cpp, Piper) run as child processes with bounded input and a
//! timeout.

pub mod agent;
pub mod codec;
pub mod config;
pub mod error;
pub mod ports;
pub mod segmenter;
pub mod service;
pub mod stt;
pub mod tts;

pub use agent::{OpenAiChatAgent, SentenceChunker, SseDecoder};
pub use codec::{RawAudio, RawPayload};
pub use config::{
    AgentOptions, ConversationOptions, ProvidersConfig, SynthesizerOptions, SynthesizerProvider,
    TranscriberOptions, TranscriberProvider,
};
pub use error::{AgentError, ConfigurationError, DecodeError, SynthesisError, TranscriptionError};
pub use ports::{
    Agent, AudioStream, FragmentStream, PortFactory, PortSet, ReplyStream, Synthesizer,
    Transcriber,
};
pub use segmenter::{SegmenterSettings, UtteranceSegmenter};
pub use service::VoiceProviders;
pub use stt::{OpenAiWhisperBackend, SegmentingTranscriber, UtteranceBackend, WhisperCppBackend};
pub use tts::{ElevenLabsSynthesizer, FrameSlicer, PiperSynthesizer};
