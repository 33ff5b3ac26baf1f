use crate::config::SynthesisConfig;
use crate::duration::{resolve_duration_ms, wav_duration_ms};
use crate::error::VoiceError;
use futures_util::future::BoxFuture;
use parley_types::{AudioFormat, DispatchMode, SpeechArtifact};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Header through which speech servers point at a downloadable rendition.
const DOWNLOAD_PATH_HEADER: &str = "x-download-path";

/// A text-to-speech backend.
///
/// The pipeline asks a synthesizer how it wants to be fed
/// ([`dispatch_mode`](Synthesizer::dispatch_mode)) and then calls
/// [`synthesize`](Synthesizer::synthesize) once per utterance or once per
/// sentence accordingly.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>>;

    fn dispatch_mode(&self) -> DispatchMode;
}

fn check_input_size(text: &str) -> Result<(), VoiceError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: AudioFormat,
    speed: f32,
    stream: bool,
    return_download_link: bool,
}

/// Client for an OpenAI-compatible speech server such as Kokoro-FastAPI.
#[derive(Debug, Clone)]
pub struct KokoroSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
    format: AudioFormat,
    speed: f32,
    mode: DispatchMode,
}

impl KokoroSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self, VoiceError> {
        if !(0.25..=4.0).contains(&config.speed) {
            return Err(VoiceError::Config(
                "Speed must be between 0.25 and 4.0".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            format: config.response_format,
            speed: config.speed,
            mode: config.mode,
        })
    }

    fn download_url(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("{}/{}", self.base_url, link.trim_start_matches('/'))
        }
    }

    /// Synthesizes `text` and returns the encoded audio with its duration.
    pub async fn synthesize_text(&self, text: &str) -> Result<SpeechArtifact, VoiceError> {
        check_input_size(text)?;

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: self.format,
            speed: self.speed,
            stream: false,
            return_download_link: true,
        };
        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "speech server returned {}: {}",
                status,
                body.trim()
            )));
        }

        let link = response
            .headers()
            .get(DOWNLOAD_PATH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = match link {
            Some(link) => {
                let url = self.download_url(&link);
                tracing::debug!(%url, "fetching synthesized audio");
                self.client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await?
            }
            None => response.bytes().await?,
        };

        if bytes.is_empty() {
            return Err(VoiceError::Tts("speech server returned no audio".to_string()));
        }

        let artifact = SpeechArtifact::from_bytes(bytes.to_vec(), self.format);
        let duration_ms = resolve_duration_ms(&artifact).await;
        tracing::debug!(chars = text.len(), duration_ms, format = %self.format, "speech synthesized");
        Ok(if duration_ms > 0 {
            artifact.with_duration_ms(duration_ms)
        } else {
            artifact
        })
    }
}

impl Synthesizer for KokoroSynthesizer {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>> {
        Box::pin(async move { self.synthesize_text(&text).await })
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }
}

/// Runs a local piper binary, writing one WAV file per call.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    binary: PathBuf,
    model_path: PathBuf,
    work_dir: PathBuf,
    speed: f32,
    timeout: Duration,
    mode: DispatchMode,
}

impl PiperSynthesizer {
    /// Creates a synthesizer that writes its output into `work_dir`.
    pub fn new(config: &SynthesisConfig, work_dir: impl AsRef<Path>) -> Result<Self, VoiceError> {
        if config.speed < 0.1 || config.speed > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }
        Ok(Self {
            binary: config.piper_binary.clone(),
            model_path: config.model_path.clone(),
            work_dir: work_dir.as_ref().to_path_buf(),
            speed: config.speed,
            timeout: config.timeout(),
            mode: config.mode,
        })
    }

    pub async fn synthesize_text(&self, text: &str) -> Result<SpeechArtifact, VoiceError> {
        check_input_size(text)?;
        if !self.model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                self.model_path
            )));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let output_path = self
            .work_dir
            .join(format!("piper-{}.wav", uuid::Uuid::new_v4()));

        let mut command = Command::new(&self.binary);
        command
            .arg("--model")
            .arg(&self.model_path)
            .arg("--output_file")
            .arg(&output_path)
            // Length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / self.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| VoiceError::Spawn {
            program: self.binary.to_string_lossy().into_owned(),
            source,
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = format!("{}\n", text);

        // Write from a task so a full stderr pipe cannot deadlock us.
        let write_task = tokio::spawn(async move {
            stdin.write_all(text_owned.as_bytes()).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })??;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Task(e.to_string())),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr.trim())));
        }

        let bytes = tokio::fs::read(&output_path).await?;
        let duration_ms = wav_duration_ms(&bytes);
        tracing::debug!(path = %output_path.display(), duration_ms, "piper synthesized");
        Ok(SpeechArtifact::from_file(output_path).with_duration_ms(duration_ms))
    }
}

impl Synthesizer for PiperSynthesizer {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>> {
        Box::pin(async move { self.synthesize_text(&text).await })
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }
}
