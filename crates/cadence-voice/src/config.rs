use crate::segmenter::SegmenterSettings;
use cadence_types::voice::VoiceProfile;
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_INITIAL_MESSAGE: &str = "Hello! How can I help you today?";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. Keep replies short and \
     conversational; they are spoken aloud, so avoid lists, markdown and code.";

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_elevenlabs_base_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}

fn default_elevenlabs_model() -> String {
    "eleven_monolingual_v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Per-conversation options consumed when a session binds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationOptions {
    pub agent: AgentOptions,
    pub synthesizer: SynthesizerOptions,
    pub transcriber: TranscriberOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Greeting spoken when the conversation starts. Empty disables it.
    pub initial_message: Option<String>,
    pub model_identifier: String,
    /// End the conversation after replying to a farewell.
    pub end_on_goodbye: bool,
    pub system_prompt: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            initial_message: Some(DEFAULT_INITIAL_MESSAGE.to_string()),
            model_identifier: "gpt-3.5-turbo".to_string(),
            end_on_goodbye: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AgentOptions {
    /// The greeting, if one is configured and non-blank.
    pub fn greeting(&self) -> Option<&str> {
        self.initial_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerOptions {
    /// Provider voice id. Falls back to the provider's configured default.
    pub voice_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberOptions {
    pub model_identifier: String,
}

impl Default for TranscriberOptions {
    fn default() -> Self {
        Self {
            model_identifier: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriberProvider {
    #[default]
    OpenAi,
    WhisperCpp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesizerProvider {
    #[default]
    ElevenLabs,
    Piper,
}

/// Provider selection and credentials, shared by every session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub transcriber: TranscriberProvider,
    pub synthesizer: SynthesizerProvider,
    pub openai: OpenAiConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub whisper_cpp: WhisperCppConfig,
    pub piper: PiperConfig,
    pub segmenter: SegmenterSettings,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    /// Voice used when the conversation does not name one.
    pub voice_id: String,
    pub base_url: String,
    pub model_id: String,
    pub request_timeout_secs: u64,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: String::new(),
            base_url: default_elevenlabs_base_url(),
            model_id: default_elevenlabs_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("api_key", &"[REDACTED]")
            .field("voice_id", &self.voice_id)
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WhisperCppConfig {
    pub binary_path: String,
    pub model_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PiperConfig {
    pub binary_path: String,
    pub voices_dir: String,
    pub voices: Vec<VoiceProfile>,
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            binary_path: "piper".to_string(),
            voices_dir: "voices".to_string(),
            voices: vec![VoiceProfile::default()],
        }
    }
}

impl PiperConfig {
    /// Looks up a voice by id, falling back to the first configured voice.
    pub fn voice(&self, id: Option<&str>) -> Option<&VoiceProfile> {
        match id {
            Some(id) => self.voices.iter().find(|v| v.id == id),
            None => self.voices.first(),
        }
    }
}
