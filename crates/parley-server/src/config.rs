//! Server configuration loading from file and environment variables.

use parley_types::{AudioFormat, DispatchMode};
use parley_voice::{
    DeviceConfig, PipelineConfig, RecognitionConfig, SynthesisBackend, SynthesisConfig,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
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

    /// Sound card and external audio tools.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Turn pacing, merge tool and scratch directory.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Speech synthesis backend.
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Speech recognition backend.
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Where and how microphone captures are stored.
    #[serde(default)]
    pub recording: RecordingConfig,
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
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Recording configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Directory captures are written to.
    #[serde(default = "default_record_dir")]
    pub dir: PathBuf,

    /// Container the recorder writes.
    #[serde(default)]
    pub format: AudioFormat,

    /// Upper bound for bounded recordings when a request names none.
    #[serde(default = "default_max_seconds")]
    pub max_seconds: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_record_dir() -> PathBuf {
    std::env::temp_dir().join("parley").join("recordings")
}

fn default_max_seconds() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
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

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: default_record_dir(),
            format: AudioFormat::Wav,
            max_seconds: default_max_seconds(),
        }
    }
}

impl RecordingConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
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
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_SOUND_CARD_INDEX` overrides `device.sound_card_index`
/// - `PARLEY_TTS_BACKEND` overrides `synthesis.backend` (`kokoro` or `piper`)
/// - `PARLEY_TTS_URL` overrides `synthesis.url`
/// - `PARLEY_TTS_VOICE` overrides `synthesis.voice`
/// - `PARLEY_TTS_FORMAT` overrides `synthesis.response_format`
/// - `PARLEY_TTS_MODE` overrides `synthesis.mode` (`single_shot` or `incremental`)
/// - `PARLEY_ASR_URL` overrides `recognition.url` and enables recognition
/// - `PARLEY_RECORD_DIR` overrides `recording.dir`
///
/// Values that do not parse are ignored.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
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

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("PARLEY_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("PARLEY_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(card) = var("PARLEY_SOUND_CARD_INDEX") {
        config.device.sound_card_index = card;
    }
    if let Some(parsed) = var("PARLEY_TTS_BACKEND").and_then(|v| v.parse::<SynthesisBackend>().ok())
    {
        config.synthesis.backend = parsed;
    }
    if let Some(url) = var("PARLEY_TTS_URL") {
        config.synthesis.url = url;
    }
    if let Some(voice) = var("PARLEY_TTS_VOICE") {
        config.synthesis.voice = voice;
    }
    if let Some(parsed) = var("PARLEY_TTS_FORMAT").and_then(|v| v.parse::<AudioFormat>().ok()) {
        config.synthesis.response_format = parsed;
    }
    if let Some(mode) = var("PARLEY_TTS_MODE") {
        match mode.as_str() {
            "single_shot" => config.synthesis.mode = DispatchMode::SingleShot,
            "incremental" => config.synthesis.mode = DispatchMode::Incremental,
            _ => {}
        }
    }
    if let Some(url) = var("PARLEY_ASR_URL") {
        config.recognition.url = url;
        config.recognition.enabled = true;
    }
    if let Some(dir) = var("PARLEY_RECORD_DIR") {
        config.recording.dir = PathBuf::from(dir);
    }
}
