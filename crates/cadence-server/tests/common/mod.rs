//! A scripted port factory and a test server.

#![allow(dead_code)]

use async_trait::async_trait;
use cadence_conversation::{PipelineSettings, SessionRegistry};
use cadence_server::{app, AppState};
use cadence_types::{AudioFormat, AudioFrame, ReplyChunk, TranscriptFragment};
use cadence_voice::{
    Agent, AgentError, AgentOptions, AudioStream, ConfigurationError, ConversationOptions,
    FragmentStream, PortFactory, PortSet, ReplyStream, SynthesisError, Synthesizer, Transcriber,
    TranscriptionError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// First sample of a frame that ends the caller's utterance.
pub const END_OF_UTTERANCE: i16 = 1000;

/// Frames emitted per synthesized chunk.
pub const FRAMES_PER_CHUNK: usize = 2;

type FragmentSender = mpsc::Sender<Result<TranscriptFragment, TranscriptionError>>;

/// Emits a final transcript ("hello", or "goodbye" after a frame starting
/// with `-END_OF_UTTERANCE`) when a marker frame arrives.
struct MarkerTranscriber {
    tx: Mutex<Option<FragmentSender>>,
    rx: Option<FragmentStream>,
    index: AtomicU64,
}

#[async_trait]
impl Transcriber for MarkerTranscriber {
    fn name(&self) -> &str {
        "marker"
    }

    async fn submit(&self, frame: AudioFrame) -> Result<(), TranscriptionError> {
        let text = match frame.samples().first() {
            Some(&END_OF_UTTERANCE) => "hello",
            Some(&s) if s == -END_OF_UTTERANCE => "goodbye",
            _ => return Ok(()),
        };
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let index = self.index.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(Ok(TranscriptFragment::final_text(index, text))).await;
        }
        Ok(())
    }

    fn fragments(&mut self) -> FragmentStream {
        self.rx.take().unwrap()
    }

    async fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Replies "You said: {text}".
struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn respond(
        &self,
        text: &str,
        _cancel: CancellationToken,
    ) -> Result<ReplyStream, AgentError> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx
            .send(Ok(ReplyChunk::last(format!("You said: {}", text))))
            .await;
        Ok(rx)
    }
}

/// Emits `FRAMES_PER_CHUNK` 16 kHz frames per chunk.
struct ToneSynthesizer;

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    fn name(&self) -> &str {
        "tone"
    }

    async fn synthesize(
        &self,
        _chunk: &ReplyChunk,
        _cancel: CancellationToken,
    ) -> Result<AudioStream, SynthesisError> {
        let (tx, rx) = mpsc::channel(FRAMES_PER_CHUNK);
        for i in 0..FRAMES_PER_CHUNK {
            let frame = AudioFrame::new(vec![7i16; 160], AudioFormat::speech(), i as u64 * 10);
            let _ = tx.send(Ok(frame)).await;
        }
        Ok(rx)
    }
}

/// Builds scripted ports, or fails like a provider without credentials.
#[derive(Default)]
pub struct ScriptedPorts {
    pub missing_credentials: bool,
    pub formats: Mutex<Vec<AudioFormat>>,
}

impl PortFactory for ScriptedPorts {
    fn build(
        &self,
        _options: &ConversationOptions,
        format: AudioFormat,
    ) -> Result<PortSet, ConfigurationError> {
        if self.missing_credentials {
            return Err(ConfigurationError::MissingCredential {
                provider: "elevenlabs",
                setting: "api_key",
            });
        }
        self.formats.lock().unwrap().push(format);
        let (tx, rx) = mpsc::channel(16);
        Ok(PortSet::new(
            Box::new(MarkerTranscriber {
                tx: Mutex::new(Some(tx)),
                rx: Some(rx),
                index: AtomicU64::new(0),
            }),
            Box::new(EchoAgent),
            Box::new(ToneSynthesizer),
        ))
    }
}

pub fn quiet_conversation() -> ConversationOptions {
    ConversationOptions {
        agent: AgentOptions {
            initial_message: None,
            ..AgentOptions::default()
        },
        ..ConversationOptions::default()
    }
}

pub fn test_state(ports: Arc<ScriptedPorts>, max_sessions: usize) -> AppState {
    AppState {
        registry: SessionRegistry::new(PipelineSettings::default(), max_sessions),
        ports,
        conversation: quiet_conversation(),
        cors_origins: Vec::new(),
    }
}

/// Serves `state` on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let router = app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}
