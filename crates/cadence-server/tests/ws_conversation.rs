//! End-to-end conversations over a real socket with scripted ports.

mod common;

use base64::Engine;
use cadence_conversation::SessionRegistry;
use common::{spawn_server, test_state, ScriptedPorts, END_OF_UTTERANCE, FRAMES_PER_CHUNK};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("failed to connect");
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("failed to parse json");
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("failed to send");
}

fn pcm(first: i16) -> Vec<u8> {
    let mut samples = vec![0i16; 160];
    samples[0] = first;
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    tokio::time::timeout(WAIT, async {
        while registry.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {count} sessions, found {}", registry.len()));
}

#[tokio::test]
async fn full_conversation_round_trip() {
    let ports = Arc::new(ScriptedPorts::default());
    let state = test_state(ports.clone(), 8);
    let registry = state.registry.clone();
    let addr = spawn_server(state).await;
    let mut ws = connect(addr).await;

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "connection_established");
    let sid = hello["sid"].as_str().unwrap().to_string();
    assert!(registry.get(&sid).is_some());

    send_json(&mut ws, json!({"type": "start_conversation", "sampleRate": 16000})).await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "conversation_started", "status": "success"})
    );

    // A binary frame ending the utterance triggers one reply.
    ws.send(Message::Binary(pcm(END_OF_UTTERANCE).into()))
        .await
        .unwrap();
    for expected in 0..FRAMES_PER_CHUNK as u64 {
        let audio = next_json(&mut ws).await;
        assert_eq!(audio["type"], "audio_response");
        assert_eq!(audio["sequence"], expected);
        assert_eq!(audio["sampleRate"], 16000);
        assert_eq!(audio["channels"], 1);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(audio["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes.len(), 320);
    }

    // Base64 audio saying goodbye ends the conversation after the reply.
    let encoded = base64::engine::general_purpose::STANDARD.encode(pcm(-END_OF_UTTERANCE));
    send_json(&mut ws, json!({"type": "audio_data", "data": encoded})).await;
    for _ in 0..FRAMES_PER_CHUNK {
        assert_eq!(next_json(&mut ws).await["type"], "audio_response");
    }
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "conversation_ended", "status": "success"})
    );
    wait_for_sessions(&registry, 0).await;

    // The socket stays usable: audio is refused until a new conversation starts.
    send_json(&mut ws, json!({"type": "audio_data", "data": [0.0, 0.1]})).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "No active conversation found");
    assert_eq!(error["kind"], "invalid_state");

    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_started");
    wait_for_sessions(&registry, 1).await;
    assert_eq!(ports.formats.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn end_conversation_removes_the_session() {
    let state = test_state(Arc::new(ScriptedPorts::default()), 8);
    let registry = state.registry.clone();
    let addr = spawn_server(state).await;
    let mut ws = connect(addr).await;

    assert_eq!(next_json(&mut ws).await["type"], "connection_established");
    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_started");

    send_json(&mut ws, json!({"type": "end_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_ended");
    wait_for_sessions(&registry, 0).await;
}

#[tokio::test]
async fn disconnect_terminates_the_session() {
    let state = test_state(Arc::new(ScriptedPorts::default()), 8);
    let registry = state.registry.clone();
    let addr = spawn_server(state).await;
    let mut ws = connect(addr).await;

    let sid = next_json(&mut ws).await["sid"].as_str().unwrap().to_string();
    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_started");
    let session = registry.get(&sid).unwrap();

    ws.close(None).await.unwrap();
    wait_for_sessions(&registry, 0).await;
    assert!(session.state().is_terminal());
}

#[tokio::test]
async fn start_reports_missing_credentials() {
    let ports = Arc::new(ScriptedPorts {
        missing_credentials: true,
        ..ScriptedPorts::default()
    });
    let state = test_state(ports, 8);
    let registry = state.registry.clone();
    let addr = spawn_server(state).await;
    let mut ws = connect(addr).await;

    assert_eq!(next_json(&mut ws).await["type"], "connection_established");
    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["kind"], "configuration");
    assert!(error["message"].as_str().unwrap().contains("elevenlabs"));

    // The idle session survives and can still be retried.
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn starting_twice_is_refused() {
    let addr = spawn_server(test_state(Arc::new(ScriptedPorts::default()), 8)).await;
    let mut ws = connect(addr).await;

    assert_eq!(next_json(&mut ws).await["type"], "connection_established");
    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_started");
    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["kind"], "invalid_state");
}

#[tokio::test]
async fn malformed_input_is_reported_not_fatal() {
    let addr = spawn_server(test_state(Arc::new(ScriptedPorts::default()), 8)).await;
    let mut ws = connect(addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "connection_established");

    send_json(&mut ws, json!({"type": "subscribe", "channelId": "x"})).await;
    assert_eq!(next_json(&mut ws).await["kind"], "internal");

    send_json(&mut ws, json!({"type": "start_conversation", "sampleRate": 4000})).await;
    assert_eq!(next_json(&mut ws).await["kind"], "decode");

    send_json(&mut ws, json!({"type": "start_conversation"})).await;
    assert_eq!(next_json(&mut ws).await["type"], "conversation_started");

    send_json(&mut ws, json!({"type": "audio_data", "data": "not base64!"})).await;
    assert_eq!(next_json(&mut ws).await["kind"], "decode");

    // Three bytes are not a whole 16-bit sample.
    ws.send(Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["kind"], "decode");
}

#[tokio::test]
async fn connections_beyond_capacity_are_told_why() {
    let state = test_state(Arc::new(ScriptedPorts::default()), 1);
    let addr = spawn_server(state).await;

    let mut first = connect(addr).await;
    assert_eq!(next_json(&mut first).await["type"], "connection_established");

    let mut second = connect(addr).await;
    let error = next_json(&mut second).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["kind"], "capacity");
}
