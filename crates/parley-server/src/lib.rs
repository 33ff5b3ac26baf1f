//! Parley server library logic.
//!
//! One [`StreamPipeline`] and one [`AudioDevice`] per process, driven over
//! HTTP. Observer callbacks are fanned out to SSE subscribers.

pub mod api;
pub mod api_sse;
pub mod config;

use api_sse::TurnEvent;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::{Config, RecordingConfig};
use parley_voice::{
    AudioDevice, KokoroSynthesizer, ManualRecording, PiperSynthesizer, StreamPipeline,
    SynthesisBackend, SynthesisConfig, Synthesizer, VoiceError, WhisperServerClient,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Maximum request body size (1 MiB). Requests carry text chunks only.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Capacity of the observer event channel per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The single manual recording slot.
#[derive(Default)]
pub enum ManualSlot {
    #[default]
    Idle,
    /// A start request holds the slot while it waits for the card. The
    /// ticket tells it whether the slot was cleared in the meantime.
    Starting(u64),
    Active(ManualRecording),
}

/// Application state shared across all request handlers.
pub struct AppState {
    /// The speech pipeline for model responses.
    pub pipeline: StreamPipeline,
    /// The sound card.
    pub device: Arc<AudioDevice>,
    /// Transcription backend, when recognition is enabled.
    pub recognizer: Option<WhisperServerClient>,
    /// Where captures go.
    pub recording: RecordingConfig,
    /// The manual recording in progress, if any. Never held across an await.
    pub manual: Mutex<ManualSlot>,
    /// Broadcast channel for observer events (SSE stream).
    pub events_tx: broadcast::Sender<TurnEvent>,
    /// Flipped once on shutdown to end open SSE streams.
    pub closing: watch::Sender<bool>,
}

impl AppState {
    /// Wires a pipeline around `synthesizer` and a device built from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognition client cannot be built.
    pub fn new(config: &Config, synthesizer: Arc<dyn Synthesizer>) -> Result<Self, VoiceError> {
        let device = Arc::new(AudioDevice::new(config.device.clone()));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closing, _) = watch::channel(false);

        let sentences_tx = events_tx.clone();
        let text_tx = events_tx.clone();
        let pipeline = StreamPipeline::builder(synthesizer, device.clone())
            .config(config.pipeline.clone())
            .on_sentences(move |sentences| {
                // No subscribers is fine.
                let _ = sentences_tx.send(TurnEvent::Sentences {
                    sentences: sentences.to_vec(),
                });
            })
            .on_full_text(move |text| {
                let _ = text_tx.send(TurnEvent::FullText {
                    text: text.to_string(),
                });
            })
            .build();

        let recognizer = if config.recognition.enabled {
            Some(WhisperServerClient::new(&config.recognition)?)
        } else {
            None
        };

        Ok(Self {
            pipeline,
            device,
            recognizer,
            recording: config.recording.clone(),
            manual: Mutex::new(ManualSlot::Idle),
            events_tx,
            closing,
        })
    }

    pub fn manual_slot(&self) -> MutexGuard<'_, ManualSlot> {
        self.manual.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops speech, releases the sound card and ends SSE streams.
    pub fn shutdown(&self) {
        self.pipeline.stop();
        self.device.shutdown();
        self.closing.send_replace(true);
        tracing::info!("speech pipeline and audio device released");
    }
}

/// Builds the synthesis backend named in `config`.
///
/// # Errors
///
/// Returns an error if the backend rejects its settings.
pub fn build_synthesizer(
    config: &SynthesisConfig,
    work_dir: &Path,
) -> Result<Arc<dyn Synthesizer>, VoiceError> {
    Ok(match config.backend {
        SynthesisBackend::Kokoro => Arc::new(KokoroSynthesizer::new(config)?),
        SynthesisBackend::Piper => Arc::new(PiperSynthesizer::new(config, work_dir)?),
    })
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/turn/begin", post(api::begin_turn_handler))
        .route("/api/turn/partial", post(api::partial_text_handler))
        .route("/api/turn/end", post(api::end_turn_handler))
        .route("/api/turn/wait", get(api::wait_turn_handler))
        .route("/api/turn/stop", post(api::stop_turn_handler))
        .route("/api/playback", get(api::playback_handler))
        .route("/api/record", post(api::record_handler))
        .route("/api/record/manual", post(api::start_manual_record_handler))
        .route(
            "/api/record/manual/finish",
            post(api::finish_manual_record_handler),
        )
        .route("/api/record/stop", post(api::stop_record_handler))
        .route("/events/turn", get(api_sse::get_turn_stream_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(state))
}
