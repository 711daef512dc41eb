//! The per-session worker.
//!
//! One task per bound session owns the ports and serializes everything that
//! changes the conversation: reacting to transcript fragments and
//! orchestrating turns. Caller audio is fed to the transcriber by a separate
//! forwarding task, so a slow transcriber never holds up barge-in or
//! termination. Each turn runs in its own child task so the worker can
//! detect barge-in while the agent and synthesizer are busy.

use crate::farewell::is_farewell;
use crate::outbound::Outbound;
use crate::settings::PipelineSettings;
use crate::stats::StatsCounters;
use cadence_types::{ConversationEvent, ConversationState, ErrorKind, ReplyChunk};
use cadence_types::{AudioFrame, TranscriptFragment};
use cadence_voice::{
    Agent, AgentError, FragmentStream, SynthesisError, Synthesizer, Transcriber,
    TranscriptionError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// How long the final `ConversationEnded` event may wait for queue space.
const END_EVENT_GRACE: Duration = Duration::from_secs(5);

/// Moves `state` to `to` unless the session is already terminated.
pub(crate) fn advance(state: &watch::Sender<ConversationState>, to: ConversationState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == to {
            false
        } else {
            *current = to;
            true
        }
    })
}

/// What a turn speaks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TurnInput {
    /// The configured greeting, synthesized without consulting the agent.
    Greeting(String),
    /// A final transcript, answered by the agent.
    Utterance(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum TurnError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

impl TurnError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Agent(e) => e.kind(),
            Self::Synthesis(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TurnOutcome {
    Completed { frames: u64 },
    Failed(TurnError),
    Cancelled,
}

enum Halt {
    Cancelled,
    Failed(TurnError),
}

impl From<AgentError> for Halt {
    fn from(e: AgentError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<SynthesisError> for Halt {
    fn from(e: SynthesisError) -> Self {
        Halt::Failed(e.into())
    }
}

struct ActiveTurn {
    turn: u64,
    token: CancellationToken,
    handle: JoinHandle<TurnOutcome>,
    /// Completing this turn ends the conversation.
    farewell: bool,
}

pub(crate) struct Worker {
    pub(crate) session_id: String,
    pub(crate) transcriber: Arc<dyn Transcriber>,
    pub(crate) fragments: FragmentStream,
    pub(crate) agent: Arc<dyn Agent>,
    pub(crate) synthesizer: Arc<dyn Synthesizer>,
    pub(crate) outbound: Outbound,
    pub(crate) state: Arc<watch::Sender<ConversationState>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) settings: PipelineSettings,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) greeting: Option<String>,
    pub(crate) end_on_goodbye: bool,
}

pub(crate) struct Pipeline {
    worker: Worker,
    active: Option<ActiveTurn>,
    turns: u64,
    last_index: Option<u64>,
    last_final_index: Option<u64>,
}

impl Pipeline {
    pub(crate) fn new(worker: Worker) -> Self {
        Self {
            worker,
            active: None,
            turns: 0,
            last_index: None,
            last_final_index: None,
        }
    }

    pub(crate) async fn run(mut self, audio: AudioForwarder) {
        let audio_cancel = audio.cancel.clone();
        let mut forwarding = tokio::spawn(audio.run());
        let mut forwarding_done = false;
        let mut fragments_open = true;

        if let Some(greeting) = self.worker.greeting.take() {
            self.start_turn(TurnInput::Greeting(greeting));
        }

        loop {
            tokio::select! {
                biased;
                () = self.worker.cancel.cancelled() => break,
                result = join_active(&mut self.active) => {
                    if let Some(turn) = self.active.take() {
                        if self.finish_turn(turn.turn, turn.farewell, result).await {
                            advance(&self.worker.state, ConversationState::Terminated);
                            break;
                        }
                    }
                }
                fragment = self.worker.fragments.recv(), if fragments_open => match fragment {
                    Some(fragment) => {
                        if self.on_fragment(fragment).await {
                            advance(&self.worker.state, ConversationState::Terminated);
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(session_id = %self.worker.session_id, "transcript stream ended");
                        fragments_open = false;
                    }
                },
                // The inbound queue closed: nobody can send audio any more.
                result = &mut forwarding => {
                    forwarding_done = true;
                    if let Err(e) = result {
                        tracing::error!(session_id = %self.worker.session_id, "audio forwarding failed: {}", e);
                    }
                    break;
                }
            }
        }

        audio_cancel.cancel();
        if !forwarding_done {
            if let Err(e) = forwarding.await {
                tracing::error!(session_id = %self.worker.session_id, "audio forwarding failed: {}", e);
            }
        }
        self.shutdown().await;
    }

    /// Handles one transcript fragment. Returns `true` when a farewell turn
    /// that finished in the meantime ends the conversation.
    async fn on_fragment(
        &mut self,
        fragment: Result<TranscriptFragment, TranscriptionError>,
    ) -> bool {
        let fragment = match fragment {
            Ok(fragment) => fragment,
            Err(e) => {
                tracing::warn!(session_id = %self.worker.session_id, "transcription failed: {}", e);
                self.emit_error(e.kind(), e.to_string()).await;
                return false;
            }
        };

        if let Some(last) = self.last_index {
            if fragment.index < last {
                tracing::warn!(
                    session_id = %self.worker.session_id,
                    index = fragment.index,
                    last,
                    "dropping out-of-order transcript fragment"
                );
                return false;
            }
        }
        self.last_index = Some(fragment.index);

        if !fragment.is_final {
            tracing::debug!(session_id = %self.worker.session_id, index = fragment.index, "partial transcript");
            return false;
        }

        if let Some(last_final) = self.last_final_index {
            if fragment.index <= last_final {
                tracing::warn!(
                    session_id = %self.worker.session_id,
                    index = fragment.index,
                    "dropping repeated final transcript"
                );
                return false;
            }
        }
        self.last_final_index = Some(fragment.index);

        let text = fragment.text.trim();
        if text.is_empty() {
            tracing::debug!(session_id = %self.worker.session_id, index = fragment.index, "empty final transcript");
            return false;
        }
        let text = text.to_string();

        if self.interrupt().await {
            return true;
        }
        self.start_turn(TurnInput::Utterance(text));
        false
    }

    /// Cancels the active turn, if any, and waits for it to stop. Returns
    /// `true` if the turn had already completed and ends the conversation.
    async fn interrupt(&mut self) -> bool {
        let Some(ActiveTurn {
            turn,
            token,
            handle,
            farewell,
        }) = self.active.take()
        else {
            return false;
        };
        token.cancel();
        // Queued audio of the cancelled turn must not reach the caller while
        // it winds down.
        self.worker.outbound.begin_turn(self.turns + 1);
        match handle.await {
            Ok(TurnOutcome::Cancelled) => {
                StatsCounters::bump(&self.worker.stats.turns_interrupted);
                tracing::info!(session_id = %self.worker.session_id, turn, "turn interrupted by barge-in");
                advance(&self.worker.state, ConversationState::Listening);
                false
            }
            result => self.finish_turn(turn, farewell, result).await,
        }
    }

    fn start_turn(&mut self, input: TurnInput) {
        self.turns += 1;
        let turn = self.turns;
        self.worker.outbound.begin_turn(turn);

        let farewell = match &input {
            TurnInput::Utterance(text) => self.worker.end_on_goodbye && is_farewell(text),
            TurnInput::Greeting(_) => false,
        };
        let token = self.worker.cancel.child_token();
        let runner = TurnRunner {
            turn,
            agent: self.worker.agent.clone(),
            synthesizer: self.worker.synthesizer.clone(),
            outbound: self.worker.outbound.clone(),
            token: token.clone(),
            settings: self.worker.settings.clone(),
            stats: self.worker.stats.clone(),
        };

        StatsCounters::bump(&self.worker.stats.turns_started);
        advance(&self.worker.state, ConversationState::Responding);
        tracing::info!(
            session_id = %self.worker.session_id,
            turn,
            greeting = matches!(input, TurnInput::Greeting(_)),
            farewell,
            "turn started"
        );

        self.active = Some(ActiveTurn {
            turn,
            token,
            handle: tokio::spawn(runner.run(input)),
            farewell,
        });
    }

    /// Records the outcome of a turn that ran to its end. Returns `true` if
    /// the conversation should end.
    async fn finish_turn(
        &mut self,
        turn: u64,
        farewell: bool,
        result: Result<TurnOutcome, JoinError>,
    ) -> bool {
        let session_id = self.worker.session_id.clone();
        match result {
            Ok(TurnOutcome::Completed { frames }) => {
                StatsCounters::bump(&self.worker.stats.turns_completed);
                tracing::info!(session_id = %session_id, turn, frames, "turn completed");
                if farewell {
                    tracing::info!(session_id = %session_id, "farewell received, ending conversation");
                    return true;
                }
            }
            Ok(TurnOutcome::Failed(e)) => {
                StatsCounters::bump(&self.worker.stats.turns_failed);
                tracing::warn!(session_id = %session_id, turn, "turn failed: {}", e);
                self.emit_error(e.kind(), e.to_string()).await;
            }
            Ok(TurnOutcome::Cancelled) => {
                tracing::debug!(session_id = %session_id, turn, "turn stopped early");
            }
            Err(e) => {
                StatsCounters::bump(&self.worker.stats.turns_failed);
                tracing::error!(session_id = %session_id, turn, "turn task failed: {}", e);
                self.emit_error(ErrorKind::Internal, "internal error while responding")
                    .await;
            }
        }
        advance(&self.worker.state, ConversationState::Listening);
        false
    }

    async fn emit_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let event = ConversationEvent::error(kind, message);
        tokio::select! {
            biased;
            () = self.worker.cancel.cancelled() => {}
            _ = self.worker.outbound.emit(event) => {}
        }
    }

    async fn shutdown(mut self) {
        if let Some(turn) = self.active.take() {
            turn.token.cancel();
            if let Err(e) = turn.handle.await {
                tracing::error!(session_id = %self.worker.session_id, "turn task failed during shutdown: {}", e);
            }
        }

        let limit = self.worker.settings.transcriber_timeout;
        if tokio::time::timeout(limit, self.worker.transcriber.close())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.worker.session_id, "transcriber did not close in time");
        }

        advance(&self.worker.state, ConversationState::Terminated);
        if !self
            .worker
            .outbound
            .emit_within(ConversationEvent::ConversationEnded, END_EVENT_GRACE)
            .await
        {
            tracing::debug!(session_id = %self.worker.session_id, "conversation_ended not delivered");
        }
        tracing::info!(session_id = %self.worker.session_id, "session worker stopped");
    }
}

/// Feeds caller audio to the transcriber in arrival order.
pub(crate) struct AudioForwarder {
    pub(crate) session_id: String,
    pub(crate) transcriber: Arc<dyn Transcriber>,
    pub(crate) inbound: mpsc::Receiver<AudioFrame>,
    pub(crate) outbound: Outbound,
    pub(crate) cancel: CancellationToken,
    pub(crate) timeout: Duration,
}

impl AudioForwarder {
    async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                frame = self.inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let limit = self.timeout;
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = tokio::time::timeout(limit, self.transcriber.submit(frame)) => {
                    result.unwrap_or(Err(TranscriptionError::Timeout(limit)))
                }
            };
            if let Err(e) = result {
                tracing::warn!(session_id = %self.session_id, "transcriber rejected frame: {}", e);
                let event = ConversationEvent::error(e.kind(), e.to_string());
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    _ = self.outbound.emit(event) => {}
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "audio forwarding stopped");
    }
}

async fn join_active(active: &mut Option<ActiveTurn>) -> Result<TurnOutcome, JoinError> {
    match active {
        Some(turn) => (&mut turn.handle).await,
        None => std::future::pending().await,
    }
}

/// Runs one turn: agent (unless it is the greeting), then synthesis of each
/// reply chunk in order.
struct TurnRunner {
    turn: u64,
    agent: Arc<dyn Agent>,
    synthesizer: Arc<dyn Synthesizer>,
    outbound: Outbound,
    token: CancellationToken,
    settings: PipelineSettings,
    stats: Arc<StatsCounters>,
}

impl TurnRunner {
    async fn run(self, input: TurnInput) -> TurnOutcome {
        let mut frames = 0u64;
        let result = match input {
            TurnInput::Greeting(text) => self.speak(&ReplyChunk::last(text), &mut frames).await,
            TurnInput::Utterance(text) => self.respond(&text, &mut frames).await,
        };
        match result {
            Ok(()) => TurnOutcome::Completed { frames },
            Err(Halt::Cancelled) => TurnOutcome::Cancelled,
            Err(Halt::Failed(e)) => TurnOutcome::Failed(e),
        }
    }

    async fn respond(&self, text: &str, frames: &mut u64) -> Result<(), Halt> {
        let limit = self.settings.agent_timeout;
        let mut replies = self
            .bounded(limit, self.agent.respond(text, self.token.clone()))
            .await?
            .map_err(|_| AgentError::Timeout(limit))??;

        loop {
            let next = self
                .bounded(limit, replies.recv())
                .await?
                .map_err(|_| AgentError::Timeout(limit))?;
            let chunk = match next {
                Some(chunk) => chunk?,
                None => return Ok(()),
            };
            if !chunk.text.trim().is_empty() {
                self.speak(&chunk, frames).await?;
            }
            if chunk.end_of_turn {
                return Ok(());
            }
        }
    }

    async fn speak(&self, chunk: &ReplyChunk, frames: &mut u64) -> Result<(), Halt> {
        let limit = self.settings.synthesizer_timeout;
        let mut audio = self
            .bounded(limit, self.synthesizer.synthesize(chunk, self.token.clone()))
            .await?
            .map_err(|_| SynthesisError::Timeout(limit))??;

        loop {
            let next = self
                .bounded(limit, audio.recv())
                .await?
                .map_err(|_| SynthesisError::Timeout(limit))?;
            let frame = match next {
                Some(frame) => frame?,
                None => return Ok(()),
            };
            let delivered = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(Halt::Cancelled),
                delivered = self.outbound.emit_audio(self.turn, frame) => delivered,
            };
            if !delivered {
                // The transport went away; nobody is left to hear the rest.
                return Err(Halt::Cancelled);
            }
            *frames += 1;
            StatsCounters::bump(&self.stats.audio_frames);
        }
    }

    /// Awaits `fut` for at most `limit`, or until the turn is cancelled.
    async fn bounded<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = T>,
    ) -> Result<Result<T, tokio::time::error::Elapsed>, Halt> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Halt::Cancelled),
            result = tokio::time::timeout(limit, fut) => Ok(result),
        }
    }
}
