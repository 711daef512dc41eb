//! Speech-to-text providers.
//!
//! Both shipped engines transcribe complete utterances, so they share the
//! [`SegmentingTranscriber`] front end: frames are cut into utterances by the
//! [`UtteranceSegmenter`] and each utterance is handed to an
//! [`UtteranceBackend`]. Segmentation and transcription run in separate
//! tasks so a slow backend never blocks frame submission.

use crate::codec;
use crate::error::TranscriptionError;
use crate::ports::{FragmentStream, Transcriber};
use crate::segmenter::{Segment, SegmenterSettings, UtteranceSegmenter};
use async_trait::async_trait;
use cadence_types::{AudioFormat, AudioFrame, TranscriptFragment};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Maximum audio input size for one utterance (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for local STT process execution.
const STT_TIMEOUT: Duration = Duration::from_secs(120);

const FRAME_BUFFER: usize = 256;
const SEGMENT_BUFFER: usize = 8;
const FRAGMENT_BUFFER: usize = 32;

/// Transcribes one WAV-encoded utterance.
#[async_trait]
pub trait UtteranceBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, TranscriptionError>;
}

struct PendingUtterance {
    index: u64,
    is_final: bool,
    samples: Vec<i16>,
}

/// A [`Transcriber`] that segments audio and transcribes whole utterances.
pub struct SegmentingTranscriber {
    name: String,
    format: AudioFormat,
    frames: mpsc::Sender<AudioFrame>,
    fragments: Option<FragmentStream>,
    cancel: CancellationToken,
}

impl SegmentingTranscriber {
    /// Starts the segmentation and transcription tasks for one session.
    pub fn spawn<B: UtteranceBackend>(
        backend: B,
        settings: SegmenterSettings,
        format: AudioFormat,
    ) -> Self {
        let name = backend.name().to_string();
        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_BUFFER);
        let (fragment_tx, fragment_rx) = mpsc::channel(FRAGMENT_BUFFER);

        tokio::spawn(segment_loop(frame_rx, segment_tx, settings, cancel.clone()));
        tokio::spawn(transcribe_loop(
            Arc::new(backend),
            segment_rx,
            fragment_tx,
            format,
            cancel.clone(),
        ));

        Self {
            name,
            format,
            frames: frame_tx,
            fragments: Some(fragment_rx),
            cancel,
        }
    }
}

#[async_trait]
impl Transcriber for SegmentingTranscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, frame: AudioFrame) -> Result<(), TranscriptionError> {
        if frame.format() != self.format {
            return Err(TranscriptionError::MalformedFrame(format!(
                "expected {} Hz / {} channel(s), got {} Hz / {} channel(s)",
                self.format.sample_rate,
                self.format.channels,
                frame.sample_rate(),
                frame.channels()
            )));
        }
        self.frames
            .send(frame)
            .await
            .map_err(|_| TranscriptionError::Closed)
    }

    fn fragments(&mut self) -> FragmentStream {
        self.fragments.take().unwrap_or_else(|| {
            tracing::warn!(transcriber = %self.name, "fragment stream requested twice");
            mpsc::channel(1).1
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SegmentingTranscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn segment_loop(
    mut frames: mpsc::Receiver<AudioFrame>,
    segments: mpsc::Sender<PendingUtterance>,
    settings: SegmenterSettings,
    cancel: CancellationToken,
) {
    let mut segmenter = UtteranceSegmenter::new(settings);
    let mut index = 0u64;

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match segmenter.push(&frame) {
            Some(Segment::Partial(samples)) => {
                // Provisional results are best effort; never stall ingestion for them.
                if segments
                    .try_send(PendingUtterance {
                        index,
                        is_final: false,
                        samples,
                    })
                    .is_err()
                {
                    tracing::debug!(index, "skipping partial transcription, backend busy");
                }
            }
            Some(Segment::Final(samples)) => {
                let pending = PendingUtterance {
                    index,
                    is_final: true,
                    samples,
                };
                if segments.send(pending).await.is_err() {
                    break;
                }
                index += 1;
            }
            None => {}
        }
    }
}

async fn transcribe_loop(
    backend: Arc<dyn UtteranceBackend>,
    mut segments: mpsc::Receiver<PendingUtterance>,
    fragments: mpsc::Sender<Result<TranscriptFragment, TranscriptionError>>,
    format: AudioFormat,
    cancel: CancellationToken,
) {
    loop {
        let utterance = tokio::select! {
            () = cancel.cancelled() => break,
            next = segments.recv() => match next {
                Some(utterance) => utterance,
                None => break,
            },
        };

        let wav = match codec::to_wav(&utterance.samples, format) {
            Ok(wav) => wav,
            Err(e) => {
                let err = TranscriptionError::Provider(format!("failed to encode utterance: {}", e));
                if fragments.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = backend.transcribe(wav) => result,
        };

        let item = match result {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() && !utterance.is_final {
                    continue;
                }
                Ok(TranscriptFragment {
                    index: utterance.index,
                    text: text.to_string(),
                    is_final: utterance.is_final,
                })
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend.name(),
                    index = utterance.index,
                    "utterance transcription failed: {}",
                    e
                );
                Err(e)
            }
        };

        if fragments.send(item).await.is_err() {
            break;
        }
    }
}

/// Runs a local whisper.cpp binary per utterance.
#[derive(Debug, Clone)]
pub struct WhisperCppBackend {
    model_path: PathBuf,
    binary_path: PathBuf,
}

impl WhisperCppBackend {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl UtteranceBackend for WhisperCppBackend {
    fn name(&self) -> &str {
        "whisper.cpp"
    }

    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, TranscriptionError> {
        if wav.len() > MAX_STT_INPUT_BYTES {
            return Err(TranscriptionError::MalformedFrame(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                wav.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        // -m <model>: GGML model, -f -: read WAV from stdin, -nt: plain text without timestamps.
        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .arg("-nt")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            TranscriptionError::Provider(format!("failed to spawn whisper.cpp: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TranscriptionError::Provider("failed to open stdin".to_string()))?;

        // Write from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(&wav).await });

        let output = tokio::time::timeout(STT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| TranscriptionError::Timeout(STT_TIMEOUT))?
            .map_err(|e| TranscriptionError::Provider(format!("failed to read stdout: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(TranscriptionError::Provider(format!(
                    "failed to write to whisper.cpp stdin: {}",
                    e
                )))
            }
            Err(e) => {
                return Err(TranscriptionError::Provider(format!(
                    "stdin task failed: {}",
                    e
                )))
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscriptionError::Provider(format!(
                "whisper.cpp failed: {}",
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Hosted Whisper transcription (`/audio/transcriptions`).
#[derive(Debug, Clone)]
pub struct OpenAiWhisperBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiWhisperBackend {
    pub fn new(
        client: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl UtteranceBackend for OpenAiWhisperBackend {
    fn name(&self) -> &str {
        "openai-whisper"
    }

    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, TranscriptionError> {
        if wav.len() > MAX_STT_INPUT_BYTES {
            return Err(TranscriptionError::MalformedFrame(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                wav.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Provider(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);

        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Provider(format!(
                "transcription request returned {}: {}",
                status, body
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Provider(format!("invalid response body: {}", e)))?;
        Ok(parsed.text)
    }
}
