//! Energy-based utterance segmentation.
//!
//! Request/response speech engines transcribe whole utterances, so the
//! incoming frame stream has to be cut at pauses first. The segmenter starts
//! an utterance on the first frame above the RMS threshold and closes it
//! after a run of trailing silence or once it reaches the maximum length.

use cadence_types::AudioFrame;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    /// Normalized RMS level (0.0–1.0) above which a frame counts as speech.
    pub speech_threshold: f32,
    /// Silence that closes an utterance.
    pub trailing_silence_ms: u64,
    /// Utterances with less speech than this are discarded as noise.
    pub min_speech_ms: u64,
    /// Upper bound on a single utterance.
    pub max_utterance_ms: u64,
    /// Interval between provisional transcriptions; 0 disables them.
    pub partial_interval_ms: u64,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            speech_threshold: 0.02,
            trailing_silence_ms: 700,
            min_speech_ms: 200,
            max_utterance_ms: 15_000,
            partial_interval_ms: 0,
        }
    }
}

/// Audio ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// The utterance so far; more audio will follow.
    Partial(Vec<i16>),
    /// A closed utterance.
    Final(Vec<i16>),
}

#[derive(Debug)]
pub struct UtteranceSegmenter {
    settings: SegmenterSettings,
    buffer: Vec<i16>,
    in_speech: bool,
    speech_ms: u64,
    silence_ms: u64,
    total_ms: u64,
    last_partial_ms: u64,
}

impl UtteranceSegmenter {
    pub fn new(settings: SegmenterSettings) -> Self {
        Self {
            settings,
            buffer: Vec::new(),
            in_speech: false,
            speech_ms: 0,
            silence_ms: 0,
            total_ms: 0,
            last_partial_ms: 0,
        }
    }

    pub fn in_utterance(&self) -> bool {
        self.in_speech
    }

    /// Feeds one frame, returning a segment when one becomes available.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<Segment> {
        let duration_ms = frame.duration().as_millis() as u64;
        let loud = frame.rms() >= self.settings.speech_threshold;

        if !self.in_speech {
            if !loud {
                return None;
            }
            self.in_speech = true;
        }

        self.buffer.extend_from_slice(frame.samples());
        self.total_ms += duration_ms;
        if loud {
            self.speech_ms += duration_ms;
            self.silence_ms = 0;
        } else {
            self.silence_ms += duration_ms;
        }

        if self.silence_ms >= self.settings.trailing_silence_ms
            || self.total_ms >= self.settings.max_utterance_ms
        {
            return self.close();
        }

        let interval = self.settings.partial_interval_ms;
        if interval > 0 && self.total_ms - self.last_partial_ms >= interval {
            self.last_partial_ms = self.total_ms;
            return Some(Segment::Partial(self.buffer.clone()));
        }
        None
    }

    /// Closes the current utterance, if any, regardless of trailing silence.
    pub fn flush(&mut self) -> Option<Segment> {
        if self.in_speech {
            self.close()
        } else {
            None
        }
    }

    fn close(&mut self) -> Option<Segment> {
        let buffer = std::mem::take(&mut self.buffer);
        let enough_speech = self.speech_ms >= self.settings.min_speech_ms;
        self.in_speech = false;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.total_ms = 0;
        self.last_partial_ms = 0;
        enough_speech.then_some(Segment::Final(buffer))
    }
}
