use cadence_types::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// An inbound payload could not be turned into an [`AudioFrame`](cadence_types::AudioFrame).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unsupported sample width: {0} bytes")]
    UnsupportedSampleWidth(u16),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(u16),

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("payload of {len} bytes is not a whole number of {frame_bytes}-byte frames")]
    MisalignedPayload { len: usize, frame_bytes: usize },

    #[error("sample {0} is not a finite number")]
    NonFiniteSample(usize),

    #[error("invalid WAV data: {0}")]
    Wav(String),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Decode
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscriptionError {
    #[error("malformed audio frame: {0}")]
    MalformedFrame(String),

    #[error("transcription provider error: {0}")]
    Provider(String),

    #[error("transcription provider did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("transcription stream is closed")]
    Closed,
}

impl TranscriptionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transcription
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("agent quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("agent provider error: {0}")]
    Provider(String),

    #[error("agent did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("agent input is empty")]
    EmptyInput,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Agent
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("synthesis provider error: {0}")]
    Provider(String),

    #[error("synthesizer did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("text exceeds maximum size: {len} bytes (limit: {limit} bytes)")]
    TextTooLong { len: usize, limit: usize },
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Synthesis
    }
}

/// A session's ports could not be assembled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("required port is not bound: {0}")]
    MissingPort(&'static str),

    #[error("{provider} is missing required setting `{setting}`")]
    MissingCredential {
        provider: &'static str,
        setting: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigurationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}
