//! Text-to-speech providers.
//!
//! Both providers produce raw s16le PCM as a byte stream; [`FrameSlicer`]
//! turns that stream into fixed-length [`AudioFrame`]s so playback can start
//! before synthesis of a chunk has finished.

use crate::config::{ElevenLabsConfig, PiperConfig};
use crate::error::SynthesisError;
use crate::ports::{AudioStream, Synthesizer};
use async_trait::async_trait;
use cadence_types::voice::VoiceProfile;
use cadence_types::{AudioFormat, AudioFrame, ReplyChunk};
use futures_util::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for TTS process execution.
const TTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Length of each synthesized frame handed to the session.
const OUTPUT_FRAME: Duration = Duration::from_millis(100);

const AUDIO_BUFFER: usize = 64;
const READ_BUFFER_BYTES: usize = 8 * 1024;

fn check_length(text: &str) -> Result<(), SynthesisError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(SynthesisError::TextTooLong {
            len: text.len(),
            limit: MAX_TTS_INPUT_BYTES,
        });
    }
    Ok(())
}

/// Cuts a little-endian s16 byte stream into frames of a fixed duration.
///
/// Odd trailing bytes and incomplete frames are carried over to the next
/// call. Timestamps count from the first byte pushed.
#[derive(Debug)]
pub struct FrameSlicer {
    format: AudioFormat,
    frame_samples: usize,
    pending: Vec<i16>,
    odd_byte: Option<u8>,
    emitted_per_channel: u64,
}

impl FrameSlicer {
    pub fn new(format: AudioFormat, frame_duration: Duration) -> Self {
        let frame_samples = format.samples_for(frame_duration).max(usize::from(format.channels.max(1)));
        Self {
            format,
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            odd_byte: None,
            emitted_per_channel: 0,
        }
    }

    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<AudioFrame> {
        if let Some(low) = self.odd_byte.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    self.pending.push(i16::from_le_bytes([low, high]));
                    bytes = rest;
                }
                None => {
                    self.odd_byte = Some(low);
                    return Vec::new();
                }
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        self.pending
            .extend(pairs.by_ref().map(|c| i16::from_le_bytes([c[0], c[1]])));
        if let [last] = pairs.remainder() {
            self.odd_byte = Some(*last);
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(self.frame(samples));
        }
        frames
    }

    /// Emits the remaining whole sample frames, if any.
    pub fn finish(&mut self) -> Option<AudioFrame> {
        self.odd_byte = None;
        let channels = usize::from(self.format.channels.max(1));
        let whole = self.pending.len() - self.pending.len() % channels;
        self.pending.truncate(whole);
        if self.pending.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.pending);
        Some(self.frame(samples))
    }

    fn frame(&mut self, samples: Vec<i16>) -> AudioFrame {
        let rate = u64::from(self.format.sample_rate.max(1));
        let timestamp_ms = self.emitted_per_channel * 1000 / rate;
        self.emitted_per_channel += (samples.len() / usize::from(self.format.channels.max(1))) as u64;
        AudioFrame::new(samples, self.format, timestamp_ms)
    }
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// Hosted streaming synthesis. Requests `pcm_16000` so no container parsing
/// is needed.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model_id: String,
    request_timeout: Duration,
}

impl ElevenLabsSynthesizer {
    pub const FORMAT: AudioFormat = AudioFormat::new(16_000, 1);

    pub fn new(client: reqwest::Client, config: &ElevenLabsConfig, voice_id: &str) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!(
                "{}/text-to-speech/{}/stream?output_format=pcm_16000",
                config.base_url.trim_end_matches('/'),
                voice_id
            ),
            model_id: config.model_id.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(
        &self,
        chunk: &ReplyChunk,
        cancel: CancellationToken,
    ) -> Result<AudioStream, SynthesisError> {
        check_length(&chunk.text)?;

        let request = ElevenLabsRequest {
            text: &chunk.text,
            model_id: &self.model_id,
        };
        let send = self
            .client
            .post(&self.endpoint)
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send();
        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| SynthesisError::Timeout(self.request_timeout))?
            .map_err(|e| SynthesisError::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Provider(format!(
                "synthesis request returned {}: {}",
                status, body
            )));
        }

        let (tx, rx) = mpsc::channel(AUDIO_BUFFER);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut slicer = FrameSlicer::new(Self::FORMAT, OUTPUT_FRAME);
            loop {
                let bytes = tokio::select! {
                    () = cancel.cancelled() => return,
                    next = body.next() => match next {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            let err = SynthesisError::Provider(format!("stream failed: {}", e));
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        None => break,
                    },
                };
                for frame in slicer.push(&bytes) {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
            if let Some(frame) = slicer.finish() {
                let _ = tx.send(Ok(frame)).await;
            }
        });
        Ok(rx)
    }
}

/// Local synthesis through the `piper` binary.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    piper_binary: PathBuf,
    voices_dir: PathBuf,
    profile: VoiceProfile,
}

impl PiperSynthesizer {
    pub fn new(config: &PiperConfig, profile: VoiceProfile) -> Self {
        Self {
            piper_binary: PathBuf::from(&config.binary_path),
            voices_dir: PathBuf::from(&config.voices_dir),
            profile,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.profile.sample_rate, 1)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.voices_dir.join(path)
        }
    }
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    fn name(&self) -> &str {
        "piper"
    }

    async fn synthesize(
        &self,
        chunk: &ReplyChunk,
        cancel: CancellationToken,
    ) -> Result<AudioStream, SynthesisError> {
        check_length(&chunk.text)?;

        let model_path = self.resolve(&self.profile.model_path);
        if !model_path.exists() {
            return Err(SynthesisError::Provider(format!(
                "model file not found: {:?}",
                model_path
            )));
        }

        if self.profile.speed < 0.1 || self.profile.speed > 10.0 {
            return Err(SynthesisError::Provider(
                "speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        let mut command = Command::new(&self.piper_binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speed: 2.0x speed is a 0.5 length scale.
            .arg("--length_scale")
            .arg((1.0 / self.profile.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config) = &self.profile.config_path {
            command.arg("--config").arg(self.resolve(config));
        }

        if let Some(speaker) = self.profile.speaker_id {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| SynthesisError::Provider(format!("failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SynthesisError::Provider("failed to open stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SynthesisError::Provider("failed to open stdout".to_string()))?;
        let mut stderr = child.stderr.take();

        // Piper reads one utterance per line.
        let text = format!("{}\n", chunk.text.replace('\n', " "));
        // Stdin is dropped at the end of the task, which tells piper the input is complete.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                tracing::warn!("failed to write to piper stdin: {}", e);
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let format = self.format();
        let (tx, rx) = mpsc::channel(AUDIO_BUFFER);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(TTS_TIMEOUT);
            tokio::pin!(deadline);
            let mut slicer = FrameSlicer::new(format, OUTPUT_FRAME);
            let mut buf = vec![0u8; READ_BUFFER_BYTES];

            loop {
                let read = tokio::select! {
                    () = cancel.cancelled() => return,
                    () = &mut deadline => {
                        let _ = tx.send(Err(SynthesisError::Timeout(TTS_TIMEOUT))).await;
                        return;
                    }
                    read = stdout.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let err = SynthesisError::Provider(format!("failed to read piper output: {}", e));
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for frame in slicer.push(&buf[..n]) {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }

            let status = tokio::select! {
                () = cancel.cancelled() => return,
                status = child.wait() => status,
            };
            match status {
                Ok(status) if status.success() => {
                    if let Some(frame) = slicer.finish() {
                        let _ = tx.send(Ok(frame)).await;
                    }
                }
                Ok(_) => {
                    let stderr = stderr_task.await.unwrap_or_default();
                    let err = SynthesisError::Provider(format!(
                        "piper failed: {}",
                        String::from_utf8_lossy(&stderr)
                    ));
                    let _ = tx.send(Err(err)).await;
                }
                Err(e) => {
                    let err = SynthesisError::Provider(format!("failed to wait for piper: {}", e));
                    let _ = tx.send(Err(err)).await;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn slicer_emits_fixed_frames_with_timestamps() {
        let format = AudioFormat::new(1_000, 1);
        let mut slicer = FrameSlicer::new(format, Duration::from_millis(10));
        let samples: Vec<i16> = (0..25).collect();

        let frames = slicer.push(&bytes(&samples));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), &samples[..10]);
        assert_eq!(frames[0].timestamp_ms(), 0);
        assert_eq!(frames[1].timestamp_ms(), 10);

        let tail = slicer.finish().unwrap();
        assert_eq!(tail.samples(), &samples[20..]);
        assert_eq!(tail.timestamp_ms(), 20);
        assert!(slicer.finish().is_none());
    }

    #[test]
    fn slicer_rejoins_samples_split_across_pushes() {
        let format = AudioFormat::new(1_000, 1);
        let mut slicer = FrameSlicer::new(format, Duration::from_millis(2));
        let data = bytes(&[300, -300, 7]);

        assert!(slicer.push(&data[..1]).is_empty());
        assert!(slicer.push(&[]).is_empty());
        let frames = slicer.push(&data[1..5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples(), &[300, -300]);

        assert!(slicer.push(&data[5..]).is_empty());
        assert_eq!(slicer.finish().unwrap().samples(), &[7]);
    }

    #[test]
    fn slicer_drops_incomplete_stereo_frame_on_finish() {
        let mut slicer = FrameSlicer::new(AudioFormat::new(1_000, 2), Duration::from_millis(10));
        assert!(slicer.push(&bytes(&[1, 2, 3])).is_empty());
        assert_eq!(slicer.finish().unwrap().samples(), &[1, 2]);
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let synthesizer = PiperSynthesizer::new(&PiperConfig::default(), VoiceProfile::default());
        let chunk = ReplyChunk::new("a".repeat(MAX_TTS_INPUT_BYTES + 1));
        let result = synthesizer.synthesize(&chunk, CancellationToken::new()).await;
        assert!(matches!(result, Err(SynthesisError::TextTooLong { .. })));
    }

    #[tokio::test]
    async fn missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = PiperConfig {
            voices_dir: dir.path().to_string_lossy().into_owned(),
            ..PiperConfig::default()
        };
        let synthesizer = PiperSynthesizer::new(&config, VoiceProfile::default());
        let result = synthesizer
            .synthesize(&ReplyChunk::new("hello"), CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(SynthesisError::Provider(msg)) if msg.contains("model file not found")
        ));
    }

    #[test]
    fn elevenlabs_endpoint_names_voice_and_format() {
        let config = ElevenLabsConfig {
            api_key: "key".to_string(),
            base_url: "https://tts.example/v1/".to_string(),
            ..ElevenLabsConfig::default()
        };
        let synthesizer = ElevenLabsSynthesizer::new(reqwest::Client::new(), &config, "rachel");
        assert_eq!(
            synthesizer.endpoint,
            "https://tts.example/v1/text-to-speech/rachel/stream?output_format=pcm_16000"
        );
    }
}
