//! WebSocket transport: one conversation per connection.
//!
//! A session is created as soon as the socket is upgraded and announced with
//! `connection_established`. `start_conversation` builds the ports and binds
//! them; `audio_data` (or a binary frame) feeds caller audio; the session is
//! removed from the registry on `end_conversation`, when the conversation
//! ends itself, or when the socket closes.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use base64::Engine;
use cadence_conversation::{EventStream, Session, SessionRegistry};
use cadence_types::{AudioFormat, ConversationEvent, ConversationState, ErrorKind};
use cadence_voice::codec::{self, RawAudio, RawPayload};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages buffered for a slow client before event forwarding waits.
const OUTBOUND_BUFFER: usize = 256;

/// Incoming WebSocket message types.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "start_conversation")]
    StartConversation {
        #[serde(rename = "sampleRate", default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
    },
    #[serde(rename = "audio_data")]
    AudioData { data: AudioPayload },
    #[serde(rename = "end_conversation")]
    EndConversation,
}

/// Audio in a JSON message: Web Audio float samples or base64 s16le PCM.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Samples(Vec<f32>),
    Encoded(String),
}

/// Outgoing WebSocket message types.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "connection_established")]
    ConnectionEstablished { status: &'static str, sid: String },
    #[serde(rename = "conversation_started")]
    ConversationStarted { status: &'static str },
    #[serde(rename = "audio_response")]
    AudioResponse {
        sequence: u64,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        channels: u16,
        #[serde(rename = "timestampMs")]
        timestamp_ms: u64,
        /// Base64 s16le PCM.
        data: String,
    },
    #[serde(rename = "conversation_ended")]
    ConversationEnded { status: &'static str },
    #[serde(rename = "error")]
    Error { message: String, kind: ErrorKind },
}

impl From<ConversationEvent> for OutgoingMessage {
    fn from(event: ConversationEvent) -> Self {
        match event {
            ConversationEvent::ConnectionEstablished { session_id } => {
                Self::ConnectionEstablished {
                    status: "connected",
                    sid: session_id,
                }
            }
            ConversationEvent::ConversationStarted => Self::ConversationStarted { status: "success" },
            ConversationEvent::AudioResponse {
                sequence, frame, ..
            } => Self::AudioResponse {
                sequence,
                sample_rate: frame.sample_rate(),
                channels: frame.channels(),
                timestamp_ms: frame.timestamp_ms(),
                data: base64::engine::general_purpose::STANDARD
                    .encode(codec::pcm16_bytes(frame.samples())),
            },
            ConversationEvent::ConversationEnded => Self::ConversationEnded { status: "success" },
            ConversationEvent::Error { message, kind } => Self::Error { message, kind },
        }
    }
}

/// Upgrades the request to a WebSocket carrying one conversation.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handles the WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a client that stops reading pushes back on its session's
    // outbound queue instead of growing memory here.
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        state,
        tx,
        remote,
        session: None,
        format: AudioFormat::speech(),
        received: 0,
    };
    connection.open_session(true);

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(remote_addr = %remote, "websocket receive failed: {}", e);
                break;
            }
        };
        match msg {
            AxumMessage::Text(text) => match serde_json::from_str::<IncomingMessage>(text.as_str()) {
                Ok(incoming) => connection.handle(incoming).await,
                Err(e) => {
                    tracing::warn!(remote_addr = %remote, "invalid websocket message: {}", e);
                    connection.send_error(ErrorKind::Internal, format!("invalid message: {}", e));
                }
            },
            AxumMessage::Binary(bytes) => {
                connection
                    .audio(RawPayload::Pcm {
                        bytes: bytes.to_vec(),
                        sample_width: 2,
                    })
                    .await;
            }
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    connection.close().await;
    send_task.abort();
}

/// Per-connection state of the receive loop.
struct Connection {
    state: Arc<AppState>,
    tx: mpsc::Sender<String>,
    remote: SocketAddr,
    /// The connection's current session, live or already ended.
    session: Option<Arc<Session>>,
    /// Format of caller audio, fixed by `start_conversation`.
    format: AudioFormat,
    /// Samples per channel received in this conversation; stamps inbound frames.
    received: u64,
}

impl Connection {
    async fn handle(&mut self, incoming: IncomingMessage) {
        match incoming {
            IncomingMessage::StartConversation {
                sample_rate,
                channels,
            } => self.start(sample_rate, channels).await,
            IncomingMessage::AudioData { data } => {
                let payload = match data {
                    AudioPayload::Samples(samples) => RawPayload::Samples(samples),
                    AudioPayload::Encoded(encoded) => {
                        match base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) {
                            Ok(bytes) => RawPayload::Pcm {
                                bytes,
                                sample_width: 2,
                            },
                            Err(_) => {
                                self.send_error(ErrorKind::Decode, "audio data is not valid base64");
                                return;
                            }
                        }
                    }
                };
                self.audio(payload).await;
            }
            IncomingMessage::EndConversation => self.end().await,
        }
    }

    /// Registers a new session and starts forwarding its events.
    fn open_session(&mut self, announce: bool) -> Option<Arc<Session>> {
        let id = Uuid::new_v4().to_string();
        let session = match self.state.registry.create(id.clone()) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(remote_addr = %self.remote, "cannot open session: {}", e);
                self.send_error(e.kind(), e.to_string());
                return None;
            }
        };
        if let Some(events) = session.take_events() {
            tokio::spawn(forward_events(
                events,
                self.tx.clone(),
                self.state.registry.clone(),
                id.clone(),
                announce,
            ));
        }
        tracing::info!(session_id = %id, remote_addr = %self.remote, "client connected");
        self.session = Some(session.clone());
        Some(session)
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.session
            .as_ref()
            .filter(|s| !s.state().is_terminal())
            .cloned()
    }

    async fn start(&mut self, sample_rate: Option<u32>, channels: Option<u16>) {
        let default = AudioFormat::speech();
        let format = AudioFormat::new(
            sample_rate.unwrap_or(default.sample_rate),
            channels.unwrap_or(default.channels),
        );
        if !codec::SUPPORTED_SAMPLE_RATES.contains(&format.sample_rate)
            || !codec::SUPPORTED_CHANNELS.contains(&format.channels)
        {
            self.send_error(
                ErrorKind::Decode,
                format!(
                    "unsupported audio format: {} Hz, {} channel(s)",
                    format.sample_rate, format.channels
                ),
            );
            return;
        }

        // A conversation that ended (explicitly or by farewell) is replaced
        // by a fresh session on the same socket.
        let session = match self.live_session() {
            Some(session) => session,
            None => match self.open_session(false) {
                Some(session) => session,
                None => return,
            },
        };
        let current = session.state();
        if current != ConversationState::Idle {
            self.send_error(
                ErrorKind::InvalidState,
                format!("conversation already started (state: {})", current),
            );
            return;
        }

        let ports = match self.state.ports.build(&self.state.conversation, format) {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(session_id = %session.id(), "cannot build conversation ports: {}", e);
                self.send_error(e.kind(), e.to_string());
                return;
            }
        };
        if let Err(e) = session.bind(ports, &self.state.conversation) {
            tracing::warn!(session_id = %session.id(), "cannot start conversation: {}", e);
            self.send_error(e.kind(), e.to_string());
            return;
        }
        self.format = format;
        self.received = 0;
    }

    async fn audio(&mut self, payload: RawPayload) {
        let Some(session) = self
            .live_session()
            .filter(|s| s.state().accepts_audio())
        else {
            tracing::warn!(remote_addr = %self.remote, "audio received without an active conversation");
            self.send_error(ErrorKind::InvalidState, "No active conversation found");
            return;
        };

        let channels = u64::from(self.format.channels.max(1));
        let per_channel = match &payload {
            RawPayload::Pcm {
                bytes,
                sample_width,
            } => bytes.len() as u64 / u64::from((*sample_width).max(1)) / channels,
            RawPayload::Samples(samples) => samples.len() as u64 / channels,
            RawPayload::Wav(_) => 0,
        };
        let timestamp_ms = self.received * 1000 / u64::from(self.format.sample_rate.max(1));
        self.received += per_channel;
        tracing::debug!(session_id = %session.id(), timestamp_ms, "audio received");

        let raw = RawAudio {
            payload,
            format: self.format,
            timestamp_ms,
        };
        if let Err(e) = session.submit_raw(raw).await {
            self.send_error(e.kind(), e.to_string());
        }
    }

    async fn end(&mut self) {
        match self.live_session() {
            Some(session) if session.state() != ConversationState::Idle => {
                self.state.registry.remove(session.id()).await;
                tracing::info!(session_id = %session.id(), "conversation ended by client");
            }
            _ => {
                tracing::warn!(remote_addr = %self.remote, "no active conversation to end");
            }
        }
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.state.registry.remove(session.id()).await;
            tracing::info!(session_id = %session.id(), remote_addr = %self.remote, "client disconnected");
        }
    }

    /// Sends an error frame to the client, dropping it if the client is too slow.
    fn send_error(&self, kind: ErrorKind, message: impl Into<String>) {
        let message = OutgoingMessage::Error {
            message: message.into(),
            kind,
        };
        match serde_json::to_string(&message) {
            Ok(json) => {
                if let Err(e) = self.tx.try_send(json) {
                    tracing::warn!("failed to send WebSocket error to client: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("failed to serialize WebSocket error message: {}", e);
            }
        }
    }
}

/// Relays session events to the socket until the conversation ends or the
/// client goes away. A conversation that ends itself is removed here.
async fn forward_events(
    mut events: EventStream,
    tx: mpsc::Sender<String>,
    registry: SessionRegistry,
    session_id: String,
    announce: bool,
) {
    while let Some(event) = events.recv().await {
        if !announce && matches!(event, ConversationEvent::ConnectionEstablished { .. }) {
            continue;
        }
        let ended = matches!(event, ConversationEvent::ConversationEnded);
        match serde_json::to_string(&OutgoingMessage::from(event)) {
            Ok(json) => {
                if tx.send(json).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, "failed to serialize event: {}", e);
            }
        }
        if ended {
            registry.remove(&session_id).await;
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "event forwarding stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::AudioFrame;
    use serde_json::json;

    #[test]
    fn incoming_messages_parse() {
        let start: IncomingMessage =
            serde_json::from_value(json!({"type": "start_conversation", "sampleRate": 48000}))
                .unwrap();
        assert!(matches!(
            start,
            IncomingMessage::StartConversation {
                sample_rate: Some(48_000),
                channels: None
            }
        ));

        let floats: IncomingMessage =
            serde_json::from_value(json!({"type": "audio_data", "data": [0.5, -0.5, 0]})).unwrap();
        match floats {
            IncomingMessage::AudioData {
                data: AudioPayload::Samples(samples),
            } => assert_eq!(samples, vec![0.5, -0.5, 0.0]),
            other => panic!("unexpected {:?}", other),
        }

        let encoded: IncomingMessage =
            serde_json::from_value(json!({"type": "audio_data", "data": "AAABAA=="})).unwrap();
        assert!(matches!(
            encoded,
            IncomingMessage::AudioData {
                data: AudioPayload::Encoded(_)
            }
        ));

        let end: IncomingMessage =
            serde_json::from_value(json!({"type": "end_conversation"})).unwrap();
        assert!(matches!(end, IncomingMessage::EndConversation));

        assert!(serde_json::from_value::<IncomingMessage>(json!({"type": "subscribe"})).is_err());
    }

    #[test]
    fn audio_events_serialize_as_base64_pcm() {
        let frame = AudioFrame::new(vec![1i16, -1], AudioFormat::new(24_000, 1), 40);
        let message = OutgoingMessage::from(ConversationEvent::AudioResponse {
            sequence: 7,
            turn: 2,
            frame,
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "audio_response");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["sampleRate"], 24_000);
        assert_eq!(value["channels"], 1);
        assert_eq!(value["timestampMs"], 40);

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn lifecycle_events_serialize() {
        let value = serde_json::to_value(OutgoingMessage::from(
            ConversationEvent::ConnectionEstablished {
                session_id: "abc".to_string(),
            },
        ))
        .unwrap();
        assert_eq!(value, json!({"type": "connection_established", "status": "connected", "sid": "abc"}));

        let value = serde_json::to_value(OutgoingMessage::from(ConversationEvent::error(
            ErrorKind::Agent,
            "agent quota exceeded",
        )))
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "message": "agent quota exceeded", "kind": "agent"})
        );
    }
}
