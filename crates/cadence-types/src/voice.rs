//! Voice profile definitions for local speech synthesis.
//!
//! A `VoiceProfile` maps a logical voice identifier to a Piper model and its
//! parameters. Hosted synthesizers identify voices by their own opaque id and
//! do not need a profile.

use serde::{Deserialize, Serialize};

/// A local synthesis voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceProfile {
    /// Unique identifier, matched against `synthesizer.voice_identifier`.
    pub id: String,
    /// Path to the model file (relative to the voices directory or absolute).
    pub model_path: String,
    /// Path to the model configuration file (if applicable).
    pub config_path: Option<String>,
    /// Output sample rate of the model.
    pub sample_rate: u32,
    /// Speech speed multiplier (1.0 is normal).
    pub speed: f32,
    /// Speaker ID within a multi-speaker model (0-indexed).
    pub speaker_id: Option<u32>,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            model_path: "en_US-lessac-medium.onnx".to_string(),
            config_path: Some("en_US-lessac-medium.onnx.json".to_string()),
            sample_rate: 22_050,
            speed: 1.0,
            speaker_id: None,
        }
    }
}
