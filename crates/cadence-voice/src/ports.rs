//! Capability interfaces for the three provider stages of a conversation.
//!
//! Each trait is implemented once per provider. A fresh set of instances is
//! built for every session (see [`PortFactory`]), so implementations may keep
//! per-session state such as conversation history or a segmentation buffer.
//!
//! Lazy sequences are bounded `mpsc` receivers. Producers must stop as soon
//! as either the cancellation token fires or the receiver is dropped.

use crate::config::ConversationOptions;
use crate::error::{AgentError, ConfigurationError, SynthesisError, TranscriptionError};
use async_trait::async_trait;
use cadence_types::{AudioFormat, AudioFrame, ReplyChunk, TranscriptFragment};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transcript fragments in non-decreasing index order.
pub type FragmentStream = mpsc::Receiver<Result<TranscriptFragment, TranscriptionError>>;

/// Reply chunks of one agent turn, in emission order.
pub type ReplyStream = mpsc::Receiver<Result<ReplyChunk, AgentError>>;

/// Synthesized audio for one reply chunk.
pub type AudioStream = mpsc::Receiver<Result<AudioFrame, SynthesisError>>;

/// Speech-to-text for one session.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    /// Feeds one frame of caller audio.
    ///
    /// # Errors
    ///
    /// Returns [`TranscriptionError`] if the frame is malformed or the
    /// provider rejects it. The session continues either way.
    async fn submit(&self, frame: AudioFrame) -> Result<(), TranscriptionError>;

    /// Hands out the fragment sequence. Called once, when the session binds;
    /// the sequence ends only when [`close`](Self::close) is called.
    fn fragments(&mut self) -> FragmentStream;

    /// Releases provider resources and ends the fragment sequence.
    async fn close(&self);
}

/// Conversational reply generation for one session.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a reply to finalized, non-empty transcript text.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] if the request cannot be started; failures
    /// after that arrive through the stream.
    async fn respond(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ReplyStream, AgentError>;
}

/// Text-to-speech for one session.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesizes one reply chunk.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError`] if synthesis cannot be started; failures
    /// after that arrive through the stream.
    async fn synthesize(
        &self,
        chunk: &ReplyChunk,
        cancel: CancellationToken,
    ) -> Result<AudioStream, SynthesisError>;
}

/// The ports offered to a session at bind time.
///
/// Every field is required; [`PortSet::into_parts`] reports the first one
/// that is missing.
#[derive(Default)]
pub struct PortSet {
    pub transcriber: Option<Box<dyn Transcriber>>,
    pub agent: Option<Box<dyn Agent>>,
    pub synthesizer: Option<Box<dyn Synthesizer>>,
}

impl PortSet {
    pub fn new(
        transcriber: Box<dyn Transcriber>,
        agent: Box<dyn Agent>,
        synthesizer: Box<dyn Synthesizer>,
    ) -> Self {
        Self {
            transcriber: Some(transcriber),
            agent: Some(agent),
            synthesizer: Some(synthesizer),
        }
    }

    /// Splits the set into its three ports.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingPort`] naming the first absent port.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> Result<(Box<dyn Transcriber>, Box<dyn Agent>, Box<dyn Synthesizer>), ConfigurationError>
    {
        let transcriber = self
            .transcriber
            .ok_or(ConfigurationError::MissingPort("transcriber"))?;
        let agent = self.agent.ok_or(ConfigurationError::MissingPort("agent"))?;
        let synthesizer = self
            .synthesizer
            .ok_or(ConfigurationError::MissingPort("synthesizer"))?;
        Ok((transcriber, agent, synthesizer))
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSet")
            .field("transcriber", &self.transcriber.as_ref().map(|p| p.name().to_string()))
            .field("agent", &self.agent.as_ref().map(|p| p.name().to_string()))
            .field("synthesizer", &self.synthesizer.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

/// Builds the ports for a new session.
pub trait PortFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] when a provider lacks credentials or
    /// settings. This happens before the session becomes active.
    fn build(
        &self,
        options: &ConversationOptions,
        format: AudioFormat,
    ) -> Result<PortSet, ConfigurationError>;
}
