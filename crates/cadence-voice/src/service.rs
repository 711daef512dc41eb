use crate::agent::OpenAiChatAgent;
use crate::config::{
    ConversationOptions, ProvidersConfig, SynthesizerProvider, TranscriberProvider,
};
use crate::error::ConfigurationError;
use crate::ports::{Agent, PortFactory, PortSet, Synthesizer, Transcriber};
use crate::stt::{OpenAiWhisperBackend, SegmentingTranscriber, WhisperCppBackend};
use crate::tts::{ElevenLabsSynthesizer, PiperSynthesizer};
use cadence_types::AudioFormat;

/// Builds provider-backed ports for each new session.
///
/// Credentials are checked here, before the session becomes active, so a
/// misconfigured deployment fails the bind instead of the first turn.
#[derive(Debug, Clone)]
pub struct VoiceProviders {
    config: ProvidersConfig,
    client: reqwest::Client,
}

impl VoiceProviders {
    pub fn new(config: ProvidersConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Shares an existing HTTP client (and its connection pool).
    pub fn with_client(config: ProvidersConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ProvidersConfig {
        &self.config
    }

    fn openai_key(&self) -> Result<(), ConfigurationError> {
        if self.config.openai.api_key.trim().is_empty() {
            return Err(ConfigurationError::MissingCredential {
                provider: "openai",
                setting: "api_key",
            });
        }
        Ok(())
    }

    fn build_transcriber(
        &self,
        options: &ConversationOptions,
        format: AudioFormat,
    ) -> Result<Box<dyn Transcriber>, ConfigurationError> {
        let segmenter = self.config.segmenter.clone();
        match self.config.transcriber {
            TranscriberProvider::OpenAi => {
                self.openai_key()?;
                let backend = OpenAiWhisperBackend::new(
                    self.client.clone(),
                    self.config.openai.api_key.clone(),
                    self.config.openai.base_url.clone(),
                    options.transcriber.model_identifier.clone(),
                );
                Ok(Box::new(SegmentingTranscriber::spawn(backend, segmenter, format)))
            }
            TranscriberProvider::WhisperCpp => {
                let whisper = &self.config.whisper_cpp;
                if whisper.binary_path.trim().is_empty() {
                    return Err(ConfigurationError::MissingCredential {
                        provider: "whisper_cpp",
                        setting: "binary_path",
                    });
                }
                if whisper.model_path.trim().is_empty() {
                    return Err(ConfigurationError::MissingCredential {
                        provider: "whisper_cpp",
                        setting: "model_path",
                    });
                }
                let backend = WhisperCppBackend::new(&whisper.model_path, &whisper.binary_path);
                Ok(Box::new(SegmentingTranscriber::spawn(backend, segmenter, format)))
            }
        }
    }

    fn build_agent(
        &self,
        options: &ConversationOptions,
    ) -> Result<Box<dyn Agent>, ConfigurationError> {
        self.openai_key()?;
        Ok(Box::new(OpenAiChatAgent::new(
            self.client.clone(),
            &self.config.openai,
            &options.agent,
        )))
    }

    fn build_synthesizer(
        &self,
        options: &ConversationOptions,
    ) -> Result<Box<dyn Synthesizer>, ConfigurationError> {
        let requested = options
            .synthesizer
            .voice_identifier
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match self.config.synthesizer {
            SynthesizerProvider::ElevenLabs => {
                let elevenlabs = &self.config.elevenlabs;
                if elevenlabs.api_key.trim().is_empty() {
                    return Err(ConfigurationError::MissingCredential {
                        provider: "elevenlabs",
                        setting: "api_key",
                    });
                }
                let voice = requested
                    .or_else(|| Some(elevenlabs.voice_id.trim()).filter(|v| !v.is_empty()))
                    .ok_or(ConfigurationError::MissingCredential {
                        provider: "elevenlabs",
                        setting: "voice_id",
                    })?;
                Ok(Box::new(ElevenLabsSynthesizer::new(
                    self.client.clone(),
                    elevenlabs,
                    voice,
                )))
            }
            SynthesizerProvider::Piper => {
                let piper = &self.config.piper;
                if piper.binary_path.trim().is_empty() {
                    return Err(ConfigurationError::MissingCredential {
                        provider: "piper",
                        setting: "binary_path",
                    });
                }
                let profile = piper.voice(requested).cloned().ok_or_else(|| {
                    ConfigurationError::Invalid(format!(
                        "unknown piper voice: {}",
                        requested.unwrap_or("<default>")
                    ))
                })?;
                Ok(Box::new(PiperSynthesizer::new(piper, profile)))
            }
        }
    }
}

impl PortFactory for VoiceProviders {
    fn build(
        &self,
        options: &ConversationOptions,
        format: AudioFormat,
    ) -> Result<PortSet, ConfigurationError> {
        // Agent and synthesizer first: they hold no tasks, so a failure here
        // leaves nothing running.
        let agent = self.build_agent(options)?;
        let synthesizer = self.build_synthesizer(options)?;
        let transcriber = self.build_transcriber(options, format)?;
        tracing::debug!(
            transcriber = transcriber.name(),
            agent = agent.name(),
            synthesizer = synthesizer.name(),
            "built conversation ports"
        );
        Ok(PortSet::new(transcriber, agent, synthesizer))
    }
}
