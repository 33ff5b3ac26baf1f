//! Speech output and capture for streamed model responses.
//!
//! The [`StreamPipeline`] turns response text arriving in chunks into
//! speech: it recognizes sentences as they complete, hands them to a
//! [`Synthesizer`], and plays the audio in order through an
//! [`AudioOutput`]. The [`AudioDevice`] is the real output: it drives the
//! sound card through external player, decoder and recorder processes and
//! guarantees that only one of them holds the card at a time.
//!
//! Synthesis and recognition backends live in [`tts`] and [`stt`]; both are
//! plain HTTP or subprocess clients with no state of their own.

pub mod config;
pub mod device;
pub mod duration;
pub mod error;
pub mod merge;
pub mod pipeline;
mod process;
pub mod purify;
pub mod record;
pub mod segment;
mod signal;
pub mod stt;
pub mod tts;

pub use config::{
    CommandTemplate, DeviceConfig, PipelineConfig, RecognitionConfig, SynthesisBackend,
    SynthesisConfig,
};
pub use device::{AudioDevice, AudioOutput, DeviceLease, PlayReport};
pub use duration::{resolve_duration_ms, wav_duration_ms};
pub use error::VoiceError;
pub use merge::{merge_artifacts, Merged};
pub use pipeline::{PipelineBuilder, SentenceObserver, StreamPipeline, TextObserver};
pub use purify::{purify_for_speech, Purifier};
pub use record::ManualRecording;
pub use segment::{split_sentences, Segmented};
pub use signal::PlaybackEnd;
pub use stt::WhisperServerClient;
pub use tts::{KokoroSynthesizer, PiperSynthesizer, Synthesizer};
