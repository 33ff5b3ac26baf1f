use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("TTS error: {0}")]
    Tts(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}")]
    ProcessExit { program: String, code: Option<i32> },

    #[error("audio merge failed: {0}")]
    Merge(String),

    #[error("no artifacts to merge")]
    NoArtifacts,

    #[error("recording was cancelled")]
    RecordingCancelled,

    #[error("duration measurement failed: {0}")]
    Duration(String),

    #[error("audio device is shut down")]
    DeviceClosed,

    #[error("background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}
