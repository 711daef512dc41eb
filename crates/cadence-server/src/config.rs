//! Server configuration loading from file and environment variables.

use cadence_conversation::{PipelineSettings, DEFAULT_MAX_SESSIONS};
use cadence_voice::{ConversationOptions, ProvidersConfig};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Queue sizes and port timeouts for every session.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Options applied to every conversation at bind time.
    #[serde(default)]
    pub conversation: ConversationOptions,

    /// Provider selection and credentials.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Upper bound on concurrently live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cadence_conversation=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Per-session pipeline tuning. Timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub transcriber_timeout_ms: u64,
    pub agent_timeout_ms: u64,
    pub synthesizer_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let defaults = PipelineSettings::default();
        Self {
            inbound_capacity: defaults.inbound_capacity,
            outbound_capacity: defaults.outbound_capacity,
            transcriber_timeout_ms: defaults.transcriber_timeout.as_millis() as u64,
            agent_timeout_ms: defaults.agent_timeout.as_millis() as u64,
            synthesizer_timeout_ms: defaults.synthesizer_timeout.as_millis() as u64,
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            inbound_capacity: self.inbound_capacity,
            outbound_capacity: self.outbound_capacity,
            transcriber_timeout: Duration::from_millis(self.transcriber_timeout_ms),
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
            synthesizer_timeout: Duration::from_millis(self.synthesizer_timeout_ms),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting that would make every session fail.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CADENCE_HOST` overrides `server.host`
/// - `CADENCE_PORT` overrides `server.port`
/// - `CADENCE_MAX_SESSIONS` overrides `server.max_sessions`
/// - `CADENCE_ALLOWED_ORIGINS` overrides `server.allowed_origins` (comma separated)
/// - `CADENCE_LOG_LEVEL` overrides `logging.level`
/// - `CADENCE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `OPENAI_API_KEY` overrides `providers.openai.api_key`
/// - `ELEVENLABS_API_KEY` overrides `providers.elevenlabs.api_key`
/// - `ELEVENLABS_VOICE_ID` overrides `providers.elevenlabs.voice_id`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting pipeline settings are unusable.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Applies environment-style overrides read through `lookup`.
///
/// Values that fail to parse are ignored with a warning.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CADENCE_HOST") {
        match host.parse() {
            Ok(parsed) => config.server.host = parsed,
            Err(_) => tracing::warn!(value = %host, "ignoring invalid CADENCE_HOST"),
        }
    }
    if let Some(port) = lookup("CADENCE_PORT") {
        match port.parse() {
            Ok(parsed) => config.server.port = parsed,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid CADENCE_PORT"),
        }
    }
    if let Some(max) = lookup("CADENCE_MAX_SESSIONS") {
        match max.parse() {
            Ok(parsed) => config.server.max_sessions = parsed,
            Err(_) => tracing::warn!(value = %max, "ignoring invalid CADENCE_MAX_SESSIONS"),
        }
    }
    if let Some(origins) = lookup("CADENCE_ALLOWED_ORIGINS") {
        config.server.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(level) = lookup("CADENCE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CADENCE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.providers.openai.api_key = key;
    }
    if let Some(key) = lookup("ELEVENLABS_API_KEY") {
        config.providers.elevenlabs.api_key = key;
    }
    if let Some(voice) = lookup("ELEVENLABS_VOICE_ID") {
        config.providers.elevenlabs.voice_id = voice;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.max_sessions == 0 {
        return Err(ConfigError::Invalid(
            "server.max_sessions must be at least 1".to_string(),
        ));
    }
    let pipeline = &config.pipeline;
    if pipeline.inbound_capacity == 0 || pipeline.outbound_capacity == 0 {
        return Err(ConfigError::Invalid(
            "pipeline queue capacities must be at least 1".to_string(),
        ));
    }
    if pipeline.transcriber_timeout_ms == 0
        || pipeline.agent_timeout_ms == 0
        || pipeline.synthesizer_timeout_ms == 0
    {
        return Err(ConfigError::Invalid(
            "pipeline timeouts must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
