use parley_types::{AudioFormat, DispatchMode, SynthesisFailurePolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// An external program plus argument template.
///
/// Arguments may contain `{card}`, `{file}` and `{format}` placeholders. An
/// argument that is exactly `{inputs}` expands to one argument per input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitutes placeholders and returns the final argument list.
    pub fn render(&self, vars: &[(&str, &str)], inputs: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + inputs.len());
        for arg in &self.args {
            if arg == "{inputs}" {
                out.extend(inputs.iter().cloned());
                continue;
            }
            let mut rendered = arg.clone();
            for (key, value) in vars {
                rendered = rendered.replace(&format!("{{{key}}}"), value);
            }
            out.push(rendered);
        }
        out
    }
}

fn s(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn default_sound_card_index() -> String {
    "1".to_string()
}

fn default_player() -> CommandTemplate {
    CommandTemplate::new("play", ["{file}"])
}

fn default_mp3_decoder() -> CommandTemplate {
    CommandTemplate::new(
        "mpg123",
        ["-", "--scale", "2", "-o", "alsa", "-a", "hw:{card},0"],
    )
}

fn default_wav_decoder() -> CommandTemplate {
    CommandTemplate::new("aplay", ["-q", "-D", "plughw:{card},0", "-"])
}

/// Raw PCM carries no header, so the sample spec has to be spelled out.
fn default_pcm_decoder() -> CommandTemplate {
    let rate = crate::duration::PCM_SAMPLE_RATE.to_string();
    CommandTemplate::new(
        "aplay",
        [
            "-q",
            "-t",
            "raw",
            "-f",
            "S16_LE",
            "-c",
            "1",
            "-r",
            rate.as_str(),
            "-D",
            "plughw:{card},0",
            "-",
        ],
    )
}

fn capture_args() -> Vec<String> {
    s(&[
        "-t",
        "alsa",
        "plughw:{card},0",
        "-t",
        "{format}",
        "-c",
        "1",
        "-r",
        "16000",
        "-b",
        "16",
        "-e",
        "signed-integer",
        "{file}",
    ])
}

fn default_recorder() -> CommandTemplate {
    // Stop after 1 s of silence once speech above 60% has been heard.
    let mut args = capture_args();
    args.extend(s(&["silence", "1", "0.1", "60%", "1", "1.0", "60%"]));
    CommandTemplate {
        program: "sox".to_string(),
        args,
    }
}

fn default_manual_recorder() -> CommandTemplate {
    CommandTemplate {
        program: "sox".to_string(),
        args: capture_args(),
    }
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    200
}

fn default_fallback_grace_ms() -> u64 {
    2000
}

/// Sound card and external tool settings for [`crate::AudioDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// ALSA card index substituted for `{card}`.
    #[serde(default = "default_sound_card_index")]
    pub sound_card_index: String,
    /// Plays one audio file per invocation.
    #[serde(default = "default_player")]
    pub player: CommandTemplate,
    /// Decodes MP3 (and other compressed) bytes from stdin.
    #[serde(default = "default_mp3_decoder")]
    pub mp3_decoder: CommandTemplate,
    /// Plays WAV bytes from stdin.
    #[serde(default = "default_wav_decoder")]
    pub wav_decoder: CommandTemplate,
    /// Plays headerless 16-bit mono PCM from stdin.
    #[serde(default = "default_pcm_decoder")]
    pub pcm_decoder: CommandTemplate,
    /// Bounded capture that stops on trailing silence.
    #[serde(default = "default_recorder")]
    pub recorder: CommandTemplate,
    /// Open-ended capture stopped by the caller.
    #[serde(default = "default_manual_recorder")]
    pub manual_recorder: CommandTemplate,
    /// Pause after a capture process exits before the card is handed on.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Time a process gets to exit after a polite signal before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Added to a playback budget before the fallback timer fires.
    #[serde(default = "default_fallback_grace_ms")]
    pub fallback_grace_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sound_card_index: default_sound_card_index(),
            player: default_player(),
            mp3_decoder: default_mp3_decoder(),
            wav_decoder: default_wav_decoder(),
            pcm_decoder: default_pcm_decoder(),
            recorder: default_recorder(),
            manual_recorder: default_manual_recorder(),
            settle_delay_ms: default_settle_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            fallback_grace_ms: default_fallback_grace_ms(),
        }
    }
}

impl DeviceConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }
}

fn default_single_shot_margin_ms() -> u64 {
    15_000
}

fn default_incremental_margin_ms() -> u64 {
    5_000
}

fn default_merge() -> CommandTemplate {
    CommandTemplate::new("sox", ["{inputs}", "{file}"])
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("parley")
}

/// Settings for [`crate::StreamPipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Safety margin added to the audio duration in single-shot mode.
    #[serde(default = "default_single_shot_margin_ms")]
    pub single_shot_margin_ms: u64,
    /// Safety margin added to the audio duration in incremental mode.
    #[serde(default = "default_incremental_margin_ms")]
    pub incremental_margin_ms: u64,
    #[serde(default)]
    pub failure_policy: SynthesisFailurePolicy,
    /// Joins several audio files into `{file}`.
    #[serde(default = "default_merge")]
    pub merge: CommandTemplate,
    /// Scratch directory for merged and synthesized files.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            single_shot_margin_ms: default_single_shot_margin_ms(),
            incremental_margin_ms: default_incremental_margin_ms(),
            failure_policy: SynthesisFailurePolicy::default(),
            merge: default_merge(),
            work_dir: default_work_dir(),
        }
    }
}

impl PipelineConfig {
    pub fn margin_for(&self, mode: DispatchMode) -> Duration {
        Duration::from_millis(match mode {
            DispatchMode::SingleShot => self.single_shot_margin_ms,
            DispatchMode::Incremental => self.incremental_margin_ms,
        })
    }
}

/// Which synthesis backend the server wires into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisBackend {
    /// OpenAI-compatible HTTP speech server (Kokoro-FastAPI and friends).
    #[default]
    Kokoro,
    /// Local piper binary.
    Piper,
}

impl std::str::FromStr for SynthesisBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kokoro" => Ok(Self::Kokoro),
            "piper" => Ok(Self::Piper),
            _ => Err(format!("unknown synthesis backend: {s}")),
        }
    }
}

fn default_tts_url() -> String {
    "http://localhost:8880".to_string()
}

fn default_tts_model() -> String {
    "kokoro".to_string()
}

fn default_tts_voice() -> String {
    "af_heart".to_string()
}

fn default_response_format() -> AudioFormat {
    AudioFormat::Mp3
}

fn default_speed() -> f32 {
    1.0
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_piper_binary() -> PathBuf {
    PathBuf::from("piper")
}

fn default_piper_model() -> PathBuf {
    PathBuf::from("en_US-lessac-medium.onnx")
}

/// Settings for the synthesis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub backend: SynthesisBackend,
    /// Dispatch policy the pipeline uses with this backend.
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_tts_url")]
    pub url: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_response_format")]
    pub response_format: AudioFormat,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_piper_binary")]
    pub piper_binary: PathBuf,
    #[serde(default = "default_piper_model")]
    pub model_path: PathBuf,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            backend: SynthesisBackend::default(),
            mode: DispatchMode::default(),
            url: default_tts_url(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            response_format: default_response_format(),
            speed: default_speed(),
            timeout_secs: default_timeout_secs(),
            piper_binary: default_piper_binary(),
            model_path: default_piper_model(),
        }
    }
}

impl SynthesisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_asr_url() -> String {
    "http://localhost:9000".to_string()
}

/// Settings for the speech recognition collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_asr_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_asr_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}
