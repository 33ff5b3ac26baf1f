//! Synthesized audio artifacts.
//!
//! A `SpeechArtifact` is what a synthesis backend hands back for a piece of
//! text: an audio payload (raw bytes, a base64 string, or a file on disk),
//! the container format of that payload, and a duration estimate when the
//! backend knows it. Artifacts are immutable once produced.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Audio container formats produced by synthesis backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// RIFF/WAVE container with uncompressed PCM.
    #[default]
    Wav,
    /// MPEG-1 layer III.
    Mp3,
    /// Ogg/Opus.
    Opus,
    /// AAC (ADTS or MP4).
    Aac,
    /// FLAC.
    Flac,
    /// Headerless PCM, treated like WAV for duration purposes.
    Pcm,
}

impl AudioFormat {
    /// Returns the canonical lowercase label, which is also the file extension.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Pcm => "pcm",
        }
    }

    /// Returns `true` for formats whose duration can only be learned by
    /// decoding the stream.
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Mp3 | Self::Opus | Self::Aac | Self::Flac)
    }

    /// Guesses the format from a file path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.to_ascii_lowercase().parse().ok())
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = ParseAudioFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wav" | "wave" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "opus" | "ogg" => Ok(Self::Opus),
            "aac" | "m4a" => Ok(Self::Aac),
            "flac" => Ok(Self::Flac),
            "pcm" | "raw" => Ok(Self::Pcm),
            _ => Err(ParseAudioFormatError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown audio format string.
#[derive(Debug, Clone)]
pub struct ParseAudioFormatError(pub String);

impl std::fmt::Display for ParseAudioFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown audio format: {}", self.0)
    }
}

impl std::error::Error for ParseAudioFormatError {}

/// Where the audio of an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    /// Encoded audio held in memory.
    Bytes(Vec<u8>),
    /// Encoded audio as a standard base64 string.
    Base64(String),
    /// Encoded audio stored in a file.
    File(PathBuf),
}

impl AudioPayload {
    /// Returns the file path for file payloads.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            _ => None,
        }
    }

    /// Decodes an in-memory payload into raw bytes.
    ///
    /// Returns `Ok(None)` for file payloads, which must be read by the caller.
    pub fn to_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        match self {
            Self::Bytes(bytes) => Ok(Some(bytes.clone())),
            Self::Base64(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map(Some),
            Self::File(_) => Ok(None),
        }
    }

    fn has_content(&self) -> bool {
        match self {
            Self::Bytes(bytes) => !bytes.is_empty(),
            Self::Base64(encoded) => !encoded.trim().is_empty(),
            Self::File(path) => !path.as_os_str().is_empty(),
        }
    }
}

/// A synthesized piece of speech plus its duration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechArtifact {
    payload: Option<AudioPayload>,
    format: AudioFormat,
    duration_ms: Option<u64>,
}

impl SpeechArtifact {
    /// An artifact with no audio. Failed synthesis degrades to this.
    pub fn empty() -> Self {
        Self {
            payload: None,
            format: AudioFormat::default(),
            duration_ms: Some(0),
        }
    }

    /// Wraps an in-memory encoded buffer.
    pub fn from_bytes(bytes: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            payload: Some(AudioPayload::Bytes(bytes)),
            format,
            duration_ms: None,
        }
    }

    /// Wraps a base64-encoded buffer.
    pub fn from_base64(encoded: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            payload: Some(AudioPayload::Base64(encoded.into())),
            format,
            duration_ms: None,
        }
    }

    /// Wraps an audio file. The format is guessed from the extension and
    /// falls back to WAV.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = AudioFormat::from_path(&path).unwrap_or_default();
        Self {
            payload: Some(AudioPayload::File(path)),
            format,
            duration_ms: None,
        }
    }

    /// Attaches a duration reported by the producer.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Overrides the container format.
    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn payload(&self) -> Option<&AudioPayload> {
        self.payload.as_ref()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The duration reported by the producer, if any.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Returns the file path for file-backed artifacts.
    pub fn file_path(&self) -> Option<&Path> {
        self.payload.as_ref().and_then(AudioPayload::file_path)
    }

    pub fn is_file(&self) -> bool {
        self.file_path().is_some()
    }

    /// Returns `true` when there is nothing to play.
    pub fn is_empty(&self) -> bool {
        !self.payload.as_ref().is_some_and(AudioPayload::has_content)
    }
}
