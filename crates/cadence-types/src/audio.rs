//! Canonical audio frame representation.
//!
//! Every stage of the conversation pipeline exchanges audio as [`AudioFrame`]:
//! interleaved signed 16-bit PCM plus the format it was captured or
//! synthesized in. Frames are immutable; cloning one shares the sample buffer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate and channel layout of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Samples per second, per channel.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 16 kHz mono, the format browsers are asked to capture in.
    pub const fn speech() -> Self {
        Self::new(16_000, 1)
    }

    /// Number of interleaved samples covering `duration`.
    pub fn samples_for(&self, duration: Duration) -> usize {
        let per_channel = (u128::from(self.sample_rate) * duration.as_millis()) / 1000;
        per_channel as usize * usize::from(self.channels)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::speech()
    }
}

/// An immutable buffer of interleaved PCM samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    format: AudioFormat,
    timestamp_ms: u64,
}

impl AudioFrame {
    /// Wraps already-validated samples. Use the codec in `cadence-voice` to
    /// build frames from untrusted payloads.
    pub fn new(samples: impl Into<Arc<[i16]>>, format: AudioFormat, timestamp_ms: u64) -> Self {
        Self {
            samples: samples.into(),
            format,
            timestamp_ms,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Milliseconds from the start of the stream this frame belongs to.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames_per_channel(&self) -> usize {
        match self.format.channels {
            0 => 0,
            channels => self.samples.len() / usize::from(channels),
        }
    }

    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = self.frames_per_channel() as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.format.sample_rate))
    }

    /// Root-mean-square level normalized to `0.0..=1.0`.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32_768.0;
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}
