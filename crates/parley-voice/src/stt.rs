use crate::config::RecognitionConfig;
use crate::error::VoiceError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Serialize)]
struct RecognizeRequest {
    audio: String,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    recognition: String,
}

/// Client for a whisper HTTP server that transcribes base64 audio.
#[derive(Debug, Clone)]
pub struct WhisperServerClient {
    client: reqwest::Client,
    base_url: String,
}

impl WhisperServerClient {
    pub fn new(config: &RecognitionConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Transcribes the recording at `path`.
    pub async fn recognize(&self, path: impl AsRef<Path>) -> Result<String, VoiceError> {
        let path = path.as_ref();
        let audio_data = tokio::fs::read(path)
            .await
            .map_err(|e| VoiceError::Stt(format!("cannot read {}: {}", path.display(), e)))?;
        if audio_data.is_empty() {
            return Err(VoiceError::Stt(format!(
                "recording is empty: {}",
                path.display()
            )));
        }
        self.recognize_bytes(&audio_data).await
    }

    pub async fn recognize_bytes(&self, audio_data: &[u8]) -> Result<String, VoiceError> {
        if audio_data.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let request = RecognizeRequest {
            audio: base64::engine::general_purpose::STANDARD.encode(audio_data),
        };
        let response = self
            .client
            .post(format!("{}/recognize", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!(
                "recognition server returned {}: {}",
                status,
                body.trim()
            )));
        }

        let body: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Stt(format!("unexpected response: {}", e)))?;
        let text = body.recognition.trim().to_string();
        tracing::debug!(bytes = audio_data.len(), chars = text.len(), "speech recognized");
        Ok(text)
    }
}
