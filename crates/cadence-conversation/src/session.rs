//! A single conversation and its lifecycle.

use crate::error::SessionError;
use crate::outbound::{self, EventStream, Outbound};
use crate::pipeline::{advance, AudioForwarder, Pipeline, Worker};
use crate::settings::PipelineSettings;
use crate::stats::{SessionStats, StatsCounters};
use cadence_types::{AudioFrame, ConversationEvent, ConversationState};
use cadence_voice::codec::{self, RawAudio};
use cadence_voice::{ConversationOptions, PortSet, Transcriber};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One connected conversation.
///
/// Created `Idle` by the registry, bound to its ports once, and terminated
/// exactly once. All methods take `&self`; a session is shared as
/// `Arc<Session>` between the registry and the transport.
#[derive(Debug)]
pub struct Session {
    id: String,
    settings: PipelineSettings,
    state: Arc<watch::Sender<ConversationState>>,
    outbound: Outbound,
    events: Mutex<Option<EventStream>>,
    inbound: OnceLock<mpsc::Sender<AudioFrame>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatsCounters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("session lock poisoned; recovering");
        poisoned.into_inner()
    })
}

impl Session {
    /// Creates an idle session and queues its `connection_established` event.
    pub fn new(id: impl Into<String>, settings: PipelineSettings) -> Self {
        let id = id.into();
        // Room for the two lifecycle events that precede any reader activity.
        let (outbound, events) = outbound::channel(settings.outbound_capacity.max(2));
        outbound.try_emit(ConversationEvent::ConnectionEstablished {
            session_id: id.clone(),
        });
        let (state, _) = watch::channel(ConversationState::Idle);

        Self {
            id,
            settings,
            state: Arc::new(state),
            outbound,
            events: Mutex::new(Some(events)),
            inbound: OnceLock::new(),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    /// Hands out the outbound event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<EventStream> {
        lock(&self.events).take()
    }

    /// Binds the session to its ports and starts the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Configuration`] if a port is missing, and
    /// [`SessionError::InvalidState`] unless the session is `Idle`. The
    /// session is left unchanged on error.
    pub fn bind(&self, ports: PortSet, options: &ConversationOptions) -> Result<(), SessionError> {
        let current = self.state();
        if current != ConversationState::Idle {
            return Err(SessionError::InvalidState {
                operation: "bind",
                state: current,
            });
        }
        let (mut transcriber, agent, synthesizer) = ports.into_parts()?;

        // Held until the worker handle is stored so `terminate` always finds it.
        let mut worker = lock(&self.worker);

        let mut observed = ConversationState::Idle;
        let activated = self.state.send_if_modified(|state| {
            if *state == ConversationState::Idle {
                *state = ConversationState::Active;
                true
            } else {
                observed = *state;
                false
            }
        });
        if !activated {
            return Err(SessionError::InvalidState {
                operation: "bind",
                state: observed,
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.settings.inbound_capacity.max(1));
        // Only one bind can get past the Idle -> Active transition.
        let _ = self.inbound.set(inbound_tx);
        self.outbound.try_emit(ConversationEvent::ConversationStarted);
        advance(&self.state, ConversationState::Listening);

        let fragments = transcriber.fragments();
        let transcriber: Arc<dyn Transcriber> = Arc::from(transcriber);
        let audio = AudioForwarder {
            session_id: self.id.clone(),
            transcriber: transcriber.clone(),
            inbound: inbound_rx,
            outbound: self.outbound.clone(),
            cancel: self.cancel.child_token(),
            timeout: self.settings.transcriber_timeout,
        };
        let pipeline = Pipeline::new(Worker {
            session_id: self.id.clone(),
            transcriber,
            fragments,
            agent: Arc::from(agent),
            synthesizer: Arc::from(synthesizer),
            outbound: self.outbound.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            settings: self.settings.clone(),
            stats: self.stats.clone(),
            greeting: options.agent.greeting().map(str::to_string),
            end_on_goodbye: options.agent.end_on_goodbye,
        });
        *worker = Some(tokio::spawn(pipeline.run(audio)));

        tracing::info!(session_id = %self.id, "conversation started");
        Ok(())
    }

    /// Queues one frame for the transcriber.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] unless the session is
    /// `Listening` or `Responding`.
    pub async fn submit_audio(&self, frame: AudioFrame) -> Result<(), SessionError> {
        let state = self.state();
        if !state.accepts_audio() {
            return Err(SessionError::InvalidState {
                operation: "submit audio",
                state,
            });
        }
        let Some(inbound) = self.inbound.get() else {
            return Err(SessionError::InvalidState {
                operation: "submit audio",
                state,
            });
        };
        if inbound.send(frame).await.is_err() {
            return Err(SessionError::InvalidState {
                operation: "submit audio",
                state: ConversationState::Terminated,
            });
        }
        StatsCounters::bump(&self.stats.frames_accepted);
        Ok(())
    }

    /// Decodes a raw payload and queues the frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Decode`] if the payload is invalid; the frame
    /// is dropped and counted, and the session continues.
    pub async fn submit_raw(&self, raw: RawAudio) -> Result<(), SessionError> {
        let state = self.state();
        if !state.accepts_audio() {
            return Err(SessionError::InvalidState {
                operation: "submit audio",
                state,
            });
        }
        let frame = match codec::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                StatsCounters::bump(&self.stats.frames_dropped);
                tracing::warn!(session_id = %self.id, "dropping undecodable frame: {}", e);
                return Err(e.into());
            }
        };
        self.submit_audio(frame).await
    }

    /// Ends the conversation: cancels in-flight work, discards audio not yet
    /// delivered and releases the ports. Idempotent.
    pub async fn terminate(&self) {
        let mut previous = ConversationState::Terminated;
        let moved = self.state.send_if_modified(|state| {
            previous = *state;
            if state.is_terminal() {
                false
            } else {
                *state = ConversationState::Terminated;
                true
            }
        });
        if !moved {
            return;
        }

        self.outbound.discard_pending_audio();
        self.cancel.cancel();

        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::error!(session_id = %self.id, "session worker failed: {}", e);
            }
        }
        tracing::info!(session_id = %self.id, from = %previous, "session terminated");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
