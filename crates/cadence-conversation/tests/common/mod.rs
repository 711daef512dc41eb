//! Scripted ports for driving a session deterministically.

#![allow(dead_code)]

use async_trait::async_trait;
use cadence_conversation::{EventStream, Session};
use cadence_types::{AudioFormat, AudioFrame, ConversationEvent, ConversationState, ReplyChunk};
use cadence_types::TranscriptFragment;
use cadence_voice::{
    Agent, AgentError, AgentOptions, AudioStream, ConversationOptions, FragmentStream, PortSet,
    ReplyStream, SynthesisError, Synthesizer, Transcriber, TranscriptionError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn frame(marker: i16, timestamp_ms: u64) -> AudioFrame {
    AudioFrame::new(vec![marker; 160], AudioFormat::speech(), timestamp_ms)
}

/// Conversation options without a greeting, so tests start in a quiet state.
pub fn quiet_options() -> ConversationOptions {
    ConversationOptions {
        agent: AgentOptions {
            initial_message: None,
            ..AgentOptions::default()
        },
        ..ConversationOptions::default()
    }
}

// --- transcriber ---

type FragmentSender = mpsc::Sender<Result<TranscriptFragment, TranscriptionError>>;

/// Records submitted frames. A frame starting with `i16::MIN` is rejected,
/// and one starting with `i16::MAX` is never answered.
pub struct ScriptedTranscriber {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    sender: Arc<Mutex<Option<FragmentSender>>>,
    receiver: Option<FragmentStream>,
    closed: Arc<AtomicUsize>,
    hanging: Arc<AtomicUsize>,
}

/// Test-side handle of a [`ScriptedTranscriber`].
#[derive(Clone)]
pub struct TranscriberHandle {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    sender: Arc<Mutex<Option<FragmentSender>>>,
    closed: Arc<AtomicUsize>,
    hanging: Arc<AtomicUsize>,
}

impl ScriptedTranscriber {
    pub fn new() -> (Self, TranscriberHandle) {
        let (tx, rx) = mpsc::channel(64);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sender = Arc::new(Mutex::new(Some(tx)));
        let closed = Arc::new(AtomicUsize::new(0));
        let hanging = Arc::new(AtomicUsize::new(0));
        (
            Self {
                frames: frames.clone(),
                sender: sender.clone(),
                receiver: Some(rx),
                closed: closed.clone(),
                hanging: hanging.clone(),
            },
            TranscriberHandle {
                frames,
                sender,
                closed,
                hanging,
            },
        )
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, frame: AudioFrame) -> Result<(), TranscriptionError> {
        match frame.samples().first() {
            Some(&i16::MIN) => {
                return Err(TranscriptionError::MalformedFrame("marker frame".to_string()));
            }
            Some(&i16::MAX) => {
                self.hanging.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            _ => {}
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn fragments(&mut self) -> FragmentStream {
        self.receiver.take().expect("fragments taken twice")
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }
}

impl TranscriberHandle {
    pub async fn emit(&self, fragment: TranscriptFragment) {
        self.emit_result(Ok(fragment)).await;
    }

    pub async fn emit_result(&self, fragment: Result<TranscriptFragment, TranscriptionError>) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender.send(fragment).await.unwrap();
        }
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of submissions currently stuck on a hanging frame.
    pub fn hanging_submits(&self) -> usize {
        self.hanging.load(Ordering::SeqCst)
    }

    /// Waits until `count` frames have been submitted.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<AudioFrame> {
        tokio::time::timeout(WAIT, async {
            loop {
                let frames = self.frames();
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames did not reach the transcriber")
    }
}

// --- agent ---

#[derive(Debug, Clone)]
pub enum AgentScript {
    Reply(Vec<ReplyChunk>),
    /// Never produces anything; waits for cancellation.
    Stall,
    /// Fails to start.
    Refuse(AgentError),
    /// Starts, then fails mid-stream after the given chunks.
    FailAfter(Vec<ReplyChunk>, AgentError),
}

#[derive(Clone, Default)]
pub struct AgentLog {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub cancellations: Arc<AtomicUsize>,
}

impl AgentLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

pub struct ScriptedAgent {
    scripts: Mutex<VecDeque<AgentScript>>,
    log: AgentLog,
}

impl ScriptedAgent {
    pub fn new(scripts: Vec<AgentScript>) -> (Self, AgentLog) {
        let log = AgentLog::default();
        (
            Self {
                scripts: Mutex::new(scripts.into()),
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ReplyStream, AgentError> {
        self.log.calls.lock().unwrap().push(text.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| AgentScript::Reply(vec![ReplyChunk::last("ok")]));

        let (tx, rx) = mpsc::channel(16);
        let cancellations = self.log.cancellations.clone();
        match script {
            AgentScript::Refuse(e) => return Err(e),
            AgentScript::Reply(chunks) => {
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                });
            }
            AgentScript::FailAfter(chunks, e) => {
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Err(e)).await;
                });
            }
            AgentScript::Stall => {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    cancellations.fetch_add(1, Ordering::SeqCst);
                    drop(tx);
                });
            }
        }
        Ok(rx)
    }
}

// --- synthesizer ---

#[derive(Clone, Default)]
pub struct SynthLog {
    pub chunks: Arc<Mutex<Vec<String>>>,
    pub cancellations: Arc<AtomicUsize>,
}

impl SynthLog {
    pub fn chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

/// Emits `frames_per_chunk` frames per chunk. Each frame's samples hold the
/// chunk's call number so tests can tell chunks apart.
pub struct ScriptedSynthesizer {
    frames_per_chunk: usize,
    /// Chunks with this text emit one frame and then wait for cancellation.
    stall_on: Option<String>,
    /// Chunks with this text fail.
    fail_on: Option<String>,
    /// Chunks with this text block the calling thread the first time, like a
    /// provider client that ignores cancellation.
    block_on: Option<(String, Duration)>,
    blocked: AtomicBool,
    log: SynthLog,
}

impl ScriptedSynthesizer {
    pub fn new(frames_per_chunk: usize) -> (Self, SynthLog) {
        let log = SynthLog::default();
        (
            Self {
                frames_per_chunk,
                stall_on: None,
                fail_on: None,
                block_on: None,
                blocked: AtomicBool::new(false),
                log: log.clone(),
            },
            log,
        )
    }

    pub fn stalling_on(mut self, text: &str) -> Self {
        self.stall_on = Some(text.to_string());
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    pub fn blocking_on(mut self, text: &str, duration: Duration) -> Self {
        self.block_on = Some((text.to_string(), duration));
        self
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(
        &self,
        chunk: &ReplyChunk,
        cancel: CancellationToken,
    ) -> Result<AudioStream, SynthesisError> {
        let marker = {
            let mut chunks = self.log.chunks.lock().unwrap();
            chunks.push(chunk.text.clone());
            chunks.len() as i16
        };
        if let Some((text, duration)) = &self.block_on {
            if *text == chunk.text && !self.blocked.swap(true, Ordering::SeqCst) {
                std::thread::sleep(*duration);
            }
        }
        if self.fail_on.as_deref() == Some(chunk.text.as_str()) {
            return Err(SynthesisError::Provider(format!("cannot say {:?}", chunk.text)));
        }

        let stall = self.stall_on.as_deref() == Some(chunk.text.as_str());
        let frames = if stall { 1 } else { self.frames_per_chunk };
        let cancellations = self.log.cancellations.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for i in 0..frames {
                if tx.send(Ok(frame(marker, i as u64 * 10))).await.is_err() {
                    return;
                }
            }
            if stall {
                cancel.cancelled().await;
                cancellations.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(rx)
    }
}

pub fn port_set(
    transcriber: ScriptedTranscriber,
    agent: ScriptedAgent,
    synthesizer: ScriptedSynthesizer,
) -> PortSet {
    PortSet::new(Box::new(transcriber), Box::new(agent), Box::new(synthesizer))
}

// --- observation helpers ---

pub async fn next_event(events: &mut EventStream) -> ConversationEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

/// Skips the `connection_established` / `conversation_started` preamble.
pub async fn skip_preamble(events: &mut EventStream) {
    assert!(matches!(
        next_event(events).await,
        ConversationEvent::ConnectionEstablished { .. }
    ));
    assert_eq!(next_event(events).await, ConversationEvent::ConversationStarted);
}

pub async fn wait_for_state(session: &Session, state: ConversationState) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {state}, stuck in {}", session.state()))
        .expect("state channel closed");
}

/// Collects events until the stream ends.
pub async fn drain(events: &mut EventStream) -> Vec<ConversationEvent> {
    let mut all = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(WAIT, events.recv()).await {
        all.push(event);
    }
    all
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
