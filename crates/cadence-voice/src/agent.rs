//! Conversational agent backed by a chat-completions endpoint.
//!
//! Replies are streamed (server-sent events) and cut into sentences as they
//! arrive, so synthesis of the first sentence can start while the model is
//! still generating the rest.

use crate::config::{AgentOptions, OpenAiConfig};
use crate::error::AgentError;
use crate::ports::{Agent, ReplyStream};
use async_trait::async_trait;
use cadence_types::ReplyChunk;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use futures_util::Stream;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reply chunks buffered ahead of the synthesizer.
const REPLY_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatDelta,
}

#[derive(Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What the caller has been given of one reply. Sealed when the next turn
/// starts; nothing is added after that.
#[derive(Debug, Default)]
struct ReplyRecord {
    text: String,
    sealed: bool,
}

#[derive(Debug, Default)]
struct History {
    messages: Vec<ChatMessage>,
    /// The reply of the latest turn, still being streamed or not yet sealed.
    open: Option<Arc<Mutex<ReplyRecord>>>,
}

impl History {
    /// Moves the open reply into the transcript.
    fn seal_open_reply(&mut self) {
        let Some(record) = self.open.take() else {
            return;
        };
        let mut record = lock(&record);
        record.sealed = true;
        let text = std::mem::take(&mut record.text);
        if !text.trim().is_empty() {
            self.messages.push(ChatMessage::assistant(text.trim()));
        }
    }
}

/// Chat-completions agent. One instance per session; it keeps the
/// conversation history so follow-up questions have context.
///
/// Only the sentences handed to the pipeline are recorded as the assistant's
/// reply, so after a barge-in the model sees what the caller actually got,
/// ahead of the question that interrupted it.
pub struct OpenAiChatAgent {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    request_timeout: Duration,
    history: Mutex<History>,
}

impl OpenAiChatAgent {
    pub fn new(client: reqwest::Client, config: &OpenAiConfig, options: &AgentOptions) -> Self {
        let mut messages = Vec::new();
        if !options.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(options.system_prompt.trim()));
        }
        if let Some(greeting) = options.greeting() {
            messages.push(ChatMessage::assistant(greeting));
        }

        Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: options.model_identifier.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            history: Mutex::new(History {
                messages,
                open: None,
            }),
        }
    }

    /// Number of messages recorded so far, including the system prompt.
    pub fn history_len(&self) -> usize {
        lock(&self.history).messages.len()
    }

    /// Seals the previous reply, records `text` and opens a record for the
    /// reply to it. Returns the messages to send.
    fn open_turn(&self, text: &str) -> (Vec<ChatMessage>, Arc<Mutex<ReplyRecord>>) {
        let mut history = lock(&self.history);
        history.seal_open_reply();
        history.messages.push(ChatMessage::user(text));
        let record = Arc::new(Mutex::new(ReplyRecord::default()));
        history.open = Some(record.clone());
        (history.messages.clone(), record)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("agent history lock poisoned; recovering");
        poisoned.into_inner()
    })
}

#[async_trait]
impl Agent for OpenAiChatAgent {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn respond(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ReplyStream, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::EmptyInput);
        }

        let (messages, record) = self.open_turn(text);

        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };
        let send = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();
        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| AgentError::Timeout(self.request_timeout))?
            .map_err(|e| AgentError::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::QuotaExceeded(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!(
                "chat request returned {}: {}",
                status, body
            )));
        }

        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        tokio::spawn(async move {
            stream_reply(response.bytes_stream(), &tx, &cancel, &record).await;
        });
        Ok(rx)
    }
}

/// Forwards sentences from a streaming response until it ends, fails, is
/// cancelled, or the receiver goes away.
async fn stream_reply<S, B, E>(
    body: S,
    tx: &mpsc::Sender<Result<ReplyChunk, AgentError>>,
    cancel: &CancellationToken,
    record: &Mutex<ReplyRecord>,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::default();
    let mut chunker = SentenceChunker::default();
    // The last sentence is held back so it can carry `end_of_turn`.
    let mut pending: Option<String> = None;

    'read: loop {
        let bytes = tokio::select! {
            () = cancel.cancelled() => return,
            next = body.next() => match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let _ = tx.send(Err(AgentError::Provider(format!("stream failed: {}", e)))).await;
                    return;
                }
                None => break 'read,
            },
        };

        for event in decoder.push(bytes.as_ref()) {
            if event == "[DONE]" {
                break 'read;
            }
            let chunk: ChatStreamChunk = match serde_json::from_str(&event) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!("ignoring unparseable stream event: {}", e);
                    continue;
                }
            };
            let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta.content)
            else {
                continue;
            };
            for sentence in chunker.push(&delta) {
                if let Some(previous) = pending.replace(sentence) {
                    if !deliver(tx, record, ReplyChunk::new(previous)).await {
                        return;
                    }
                }
            }
        }
    }

    if let Some(rest) = chunker.finish() {
        if let Some(previous) = pending.replace(rest) {
            if !deliver(tx, record, ReplyChunk::new(previous)).await {
                return;
            }
        }
    }
    deliver(tx, record, ReplyChunk::last(pending.unwrap_or_default())).await;
}

/// Hands `chunk` to the pipeline and records its text, both under the record
/// lock. Returns `false` if the receiver is gone or the turn was sealed.
async fn deliver(
    tx: &mpsc::Sender<Result<ReplyChunk, AgentError>>,
    record: &Mutex<ReplyRecord>,
    chunk: ReplyChunk,
) -> bool {
    let Ok(permit) = tx.reserve().await else {
        return false;
    };
    let mut record = lock(record);
    if record.sealed {
        return false;
    }
    if !chunk.text.is_empty() {
        if !record.text.is_empty() {
            record.text.push(' ');
        }
        record.text.push_str(&chunk.text);
    }
    permit.send(Ok(chunk));
    true
}

/// Incremental parser for `text/event-stream` bodies. Yields the payload of
/// each `data:` line; other fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    events.push(data.to_string());
                }
            }
        }
        events
    }
}

/// Splits streamed text into sentences.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a newline.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
}

impl SentenceChunker {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Returns whatever text is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\n' {
                return Some(i + 1);
            }
            if matches!(c, '.' | '!' | '?') {
                if let Some(&(next_at, next)) = chars.peek() {
                    if next.is_whitespace() {
                        return Some(next_at);
                    }
                }
            }
        }
        None
    }
}
