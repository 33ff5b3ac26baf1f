//! API handlers for the Parley server.

use crate::{AppState, ManualSlot};
use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use parley_types::{DeviceHolder, PlaybackOutcome, PlaybackState};
use parley_voice::{VoiceError, WhisperServerClient};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longest bounded recording a request may ask for.
const MAX_RECORD_SECONDS: u64 = 300;

/// Request body for `POST /api/turn/partial`.
#[derive(Debug, Deserialize)]
pub struct PartialTextRequest {
    /// The next chunk of response text.
    pub text: String,
}

/// Response body for `POST /api/turn/begin`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BeginTurnResponse {
    pub turn: u64,
}

/// Response body for `GET /api/turn/wait`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WaitResponse {
    pub outcome: PlaybackOutcome,
}

/// Response body for `GET /api/playback`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlaybackResponse {
    pub state: PlaybackState,
    /// Who holds the sound card right now, if anyone.
    pub device: Option<DeviceHolder>,
}

/// Request body for `POST /api/record`.
#[derive(Debug, Default, Deserialize)]
pub struct RecordRequest {
    /// Overrides `recording.max_seconds`.
    #[serde(default)]
    pub max_seconds: Option<u64>,
    /// Transcribe the capture before responding.
    #[serde(default)]
    pub transcribe: bool,
}

/// Request body for `POST /api/record/manual/finish`.
#[derive(Debug, Default, Deserialize)]
pub struct FinishRecordRequest {
    #[serde(default)]
    pub transcribe: bool,
}

/// Response body for recording routes.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Response body for `POST /api/record/stop`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopRecordResponse {
    /// Capture processes that were running.
    pub stopped: usize,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<VoiceError> for ApiError {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::RecordingCancelled | VoiceError::DeviceClosed => {
                ApiError::Conflict(e.to_string())
            }
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

/// Handler for `POST /api/turn/begin`.
pub async fn begin_turn_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<BeginTurnResponse> {
    Json(BeginTurnResponse {
        turn: state.pipeline.begin_turn(),
    })
}

/// Handler for `POST /api/turn/partial`.
pub async fn partial_text_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<PartialTextRequest>,
) -> StatusCode {
    state.pipeline.on_partial_text(&payload.text);
    StatusCode::NO_CONTENT
}

/// Handler for `POST /api/turn/end`.
pub async fn end_turn_handler(Extension(state): Extension<Arc<AppState>>) -> StatusCode {
    state.pipeline.on_turn_end();
    StatusCode::NO_CONTENT
}

/// Handler for `GET /api/turn/wait`.
///
/// Holds the request open until the latest turn has finished playing.
pub async fn wait_turn_handler(Extension(state): Extension<Arc<AppState>>) -> Json<WaitResponse> {
    Json(WaitResponse {
        outcome: state.pipeline.await_playback_end().await,
    })
}

/// Handler for `POST /api/turn/stop`.
pub async fn stop_turn_handler(Extension(state): Extension<Arc<AppState>>) -> StatusCode {
    state.pipeline.stop();
    StatusCode::NO_CONTENT
}

/// Handler for `GET /api/playback`.
pub async fn playback_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<PlaybackResponse> {
    Json(PlaybackResponse {
        state: state.pipeline.playback_state(),
        device: state.device.holder(),
    })
}

/// Handler for `POST /api/record`.
///
/// Records until silence or the time limit, then optionally transcribes.
pub async fn record_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<RecordRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let max_seconds = payload.max_seconds.unwrap_or(state.recording.max_seconds);
    if max_seconds == 0 || max_seconds > MAX_RECORD_SECONDS {
        return Err(ApiError::BadRequest(format!(
            "max_seconds must be between 1 and {}",
            MAX_RECORD_SECONDS
        )));
    }
    let recognizer = recognizer_for(&state, payload.transcribe)?;

    let output = capture_path(&state, "record").await?;
    let path = state
        .device
        .record(&output, Duration::from_secs(max_seconds))
        .await?;
    let text = transcribe(recognizer, &path).await?;
    Ok(Json(RecordResponse { path, text }))
}

static NEXT_MANUAL_TICKET: AtomicU64 = AtomicU64::new(0);

/// Frees a `Starting` slot that still carries its ticket when the start
/// request ends without a recording, including when the client goes away.
struct PendingStart<'a> {
    state: &'a AppState,
    ticket: u64,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        let mut slot = self.state.manual_slot();
        if matches!(*slot, ManualSlot::Starting(ticket) if ticket == self.ticket) {
            *slot = ManualSlot::Idle;
        }
    }
}

/// Handler for `POST /api/record/manual`.
///
/// The slot is marked as starting while the request waits for the card, so
/// concurrent start, finish and stop requests answer at once.
pub async fn start_manual_record_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    let ticket = NEXT_MANUAL_TICKET.fetch_add(1, Ordering::Relaxed);
    {
        let mut slot = state.manual_slot();
        match &*slot {
            ManualSlot::Starting(_) => {
                return Err(ApiError::Conflict(
                    "a manual recording is already starting".to_string(),
                ))
            }
            ManualSlot::Active(recording) if !recording.is_finished() => {
                return Err(ApiError::Conflict(
                    "a manual recording is already active".to_string(),
                ))
            }
            _ => {}
        }
        *slot = ManualSlot::Starting(ticket);
    }
    let pending = PendingStart {
        state: &state,
        ticket,
    };

    let output = capture_path(&state, "manual").await?;
    let recording = state.device.record_manually(&output).await?;
    let path = recording.path().to_path_buf();
    {
        let mut slot = state.manual_slot();
        if !matches!(*slot, ManualSlot::Starting(current) if current == ticket) {
            recording.stop();
            return Err(ApiError::Conflict(
                "manual recording was cancelled while starting".to_string(),
            ));
        }
        *slot = ManualSlot::Active(recording);
    }
    drop(pending);
    Ok((StatusCode::CREATED, Json(RecordResponse { path, text: None })))
}

/// Handler for `POST /api/record/manual/finish`.
pub async fn finish_manual_record_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<FinishRecordRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let recognizer = recognizer_for(&state, payload.transcribe)?;
    let recording = {
        let mut slot = state.manual_slot();
        match std::mem::take(&mut *slot) {
            ManualSlot::Active(recording) => recording,
            starting @ ManualSlot::Starting(_) => {
                *slot = starting;
                return Err(ApiError::Conflict(
                    "the manual recording has not started yet".to_string(),
                ));
            }
            ManualSlot::Idle => {
                return Err(ApiError::Conflict(
                    "no manual recording is active".to_string(),
                ))
            }
        }
    };

    let path = recording.finish().await?;
    let text = transcribe(recognizer, &path).await?;
    Ok(Json(RecordResponse { path, text }))
}

/// Handler for `POST /api/record/stop`.
///
/// Cancels bounded and manual recordings alike, including a manual
/// recording still waiting for the card.
pub async fn stop_record_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<StopRecordResponse> {
    let stopped = state.device.stop_recording();
    *state.manual_slot() = ManualSlot::Idle;
    Json(StopRecordResponse { stopped })
}

fn recognizer_for(
    state: &AppState,
    transcribe: bool,
) -> Result<Option<&WhisperServerClient>, ApiError> {
    if !transcribe {
        return Ok(None);
    }
    state
        .recognizer
        .as_ref()
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("speech recognition is disabled".to_string()))
}

async fn capture_path(state: &AppState, prefix: &str) -> Result<PathBuf, ApiError> {
    let dir = &state.recording.dir;
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        tracing::error!(path = %dir.display(), "cannot create recording directory: {}", e);
        ApiError::InternalServerError("cannot create recording directory".to_string())
    })?;
    Ok(dir.join(format!(
        "{}-{}.{}",
        prefix,
        uuid::Uuid::new_v4(),
        state.recording.format
    )))
}

async fn transcribe(
    recognizer: Option<&WhisperServerClient>,
    path: &Path,
) -> Result<Option<String>, ApiError> {
    match recognizer {
        Some(client) => {
            let text = client.recognize(path).await?;
            tracing::info!(chars = text.len(), "recording transcribed");
            Ok(Some(text))
        }
        None => Ok(None),
    }
}
