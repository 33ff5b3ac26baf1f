//! Shared types for the parley speech workspace.
//!
//! This crate holds the value types that cross crate boundaries: synthesized
//! artifacts, the synthesis dispatch policy, and the small state enums the
//! playback pipeline and the audio device report. It performs no I/O.

pub mod artifact;

pub use artifact::{AudioFormat, AudioPayload, ParseAudioFormatError, SpeechArtifact};

use serde::{Deserialize, Serialize};

/// How a pipeline turns a stream of sentences into synthesis calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One synthesis call for the whole utterance, issued at end of turn.
    #[default]
    SingleShot,
    /// One synthesis call per sentence, issued as soon as it is recognized.
    Incremental,
}

/// What to do when a single synthesis call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisFailurePolicy {
    /// Treat the failed unit as silent and move on.
    #[default]
    Skip,
    /// Try the call once more before treating it as silent.
    RetryOnce,
}

/// Playback session state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PlaybackState {
    Idle = 0,
    Playing = 1,
}

impl PlaybackState {
    /// Returns the numeric code for this state.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a numeric code back to a state. Unknown codes map to `Idle`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::Playing,
            _ => Self::Idle,
        }
    }
}

/// How a turn's playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackOutcome {
    /// Audio was played to the end (or to the fallback timer).
    Completed,
    /// The turn had text but produced no playable audio.
    Silent,
    /// The audio device reported an error.
    Failed,
    /// The turn was cancelled with `stop`.
    Stopped,
    /// Nothing was pending: the turn had no text, or no turn was open.
    Empty,
}

/// Who currently holds the audio device's exclusivity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHolder {
    Player,
    Recorder,
}

impl DeviceHolder {
    /// Returns the string label for this holder.
    pub fn label(self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Recorder => "recorder",
        }
    }
}
