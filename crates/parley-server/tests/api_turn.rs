#![cfg(unix)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::future::BoxFuture;
use parley_server::{app, config::Config, AppState, ManualSlot};
use parley_types::{AudioFormat, DeviceHolder, DispatchMode, SpeechArtifact};
use parley_voice::{CommandTemplate, Synthesizer, VoiceError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Echoes the text back as "audio".
struct EchoSynth {
    mode: DispatchMode,
    calls: Mutex<Vec<String>>,
}

impl Synthesizer for EchoSynth {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(text.clone());
            Ok(SpeechArtifact::from_bytes(text.into_bytes(), AudioFormat::Mp3).with_duration_ms(10))
        })
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }
}

fn sh(script: &str) -> CommandTemplate {
    CommandTemplate::new("sh", ["-c", script, "{file}"])
}

fn setup(dir: &tempfile::TempDir, mode: DispatchMode) -> (Router, Arc<AppState>, Arc<EchoSynth>) {
    let mut config = Config::default();
    config.device.player = CommandTemplate::new("true", Vec::<String>::new());
    config.device.mp3_decoder = CommandTemplate::new("sh", ["-c", "cat > /dev/null"]);
    config.device.recorder = sh("printf captured > \"$0\"");
    config.device.manual_recorder = sh("printf manual > \"$0\"; exec sleep 30");
    config.device.settle_delay_ms = 10;
    config.device.stop_grace_ms = 100;
    config.pipeline.work_dir = dir.path().join("work");
    config.recording.dir = dir.path().join("recordings");

    let synth = Arc::new(EchoSynth {
        mode,
        calls: Mutex::new(Vec::new()),
    });
    let state = Arc::new(AppState::new(&config, synth.clone()).expect("state"));
    (app(state.clone()), state, synth)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => request
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_reports_version() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = setup(&dir, DispatchMode::SingleShot);

    let (status, json) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_turn_is_spoken_and_waited_for() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, synth) = setup(&dir, DispatchMode::SingleShot);

    let (status, json) = send(&app, "POST", "/api/turn/begin", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["turn"].is_u64());

    for chunk in ["Hello wor", "ld. How are", " you?"] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/turn/partial",
            Some(serde_json::json!({ "text": chunk })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (status, _) = send(&app, "POST", "/api/turn/end", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, json) = send(&app, "GET", "/api/turn/wait", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "completed");
    assert_eq!(
        synth.calls.lock().unwrap().clone(),
        vec!["Hello world. How are you?".to_string()]
    );

    // The worker goes idle right after resolving the turn.
    let mut json = Value::Null;
    for _ in 0..200 {
        json = send(&app, "GET", "/api/playback", None).await.1;
        if json["state"] == "idle" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(json["state"], "idle");
    assert_eq!(json["device"], Value::Null);
}

#[tokio::test]
async fn test_wait_without_turn_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = setup(&dir, DispatchMode::Incremental);

    let (status, json) = send(&app, "GET", "/api/turn/wait", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "empty");
}

#[tokio::test]
async fn test_stop_turn_resolves_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state, _) = setup(&dir, DispatchMode::Incremental);

    send(
        &app,
        "POST",
        "/api/turn/partial",
        Some(serde_json::json!({ "text": "Still talking" })),
    )
    .await;
    let waiting = state.pipeline.playback_end();

    let (status, _) = send(&app, "POST", "/api/turn/stop", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(waiting.wait().await, parley_types::PlaybackOutcome::Stopped);
}

#[tokio::test]
async fn test_partial_text_requires_json_body() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = setup(&dir, DispatchMode::Incremental);

    let (status, _) = send(&app, "POST", "/api/turn/partial", None).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_record_rejects_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = setup(&dir, DispatchMode::SingleShot);

    let (status, json) = send(
        &app,
        "POST",
        "/api/record",
        Some(serde_json::json!({ "max_seconds": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("max_seconds"));

    // Recognition is disabled by default.
    let (status, json) = send(
        &app,
        "POST",
        "/api/record",
        Some(serde_json::json!({ "transcribe": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("recognition"));
}

#[tokio::test]
async fn test_bounded_record_returns_path() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _, _) = setup(&dir, DispatchMode::SingleShot);

    let (status, json) = send(
        &app,
        "POST",
        "/api/record",
        Some(serde_json::json!({ "max_seconds": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let path = std::path::PathBuf::from(json["path"].as_str().unwrap());
    assert!(path.starts_with(dir.path().join("recordings")));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("wav"));
    assert_eq!(std::fs::read(&path).unwrap(), b"captured");
    assert!(json.get("text").is_none());
}

#[tokio::test]
async fn test_manual_recording_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state, _) = setup(&dir, DispatchMode::SingleShot);

    let (status, json) = send(&app, "POST", "/api/record/manual", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let path = std::path::PathBuf::from(json["path"].as_str().unwrap());

    let (status, _) = send(&app, "POST", "/api/record/manual", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, json) = send(&app, "GET", "/api/playback", None).await;
    assert_eq!(json["device"], "recorder");

    // Give the recorder a moment to write its file.
    for _ in 0..200 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (status, json) = send(
        &app,
        "POST",
        "/api/record/manual/finish",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["path"], path.to_str().unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), b"manual");
    assert_eq!(state.device.holder(), None);

    let (status, _) = send(
        &app,
        "POST",
        "/api/record/manual/finish",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_manual_start_waiting_for_card_does_not_block_other_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state, _) = setup(&dir, DispatchMode::SingleShot);
    let lease = state.device.acquire(DeviceHolder::Player).await.unwrap();

    let first = tokio::spawn({
        let app = app.clone();
        async move { send(&app, "POST", "/api/record/manual", None).await }
    });
    for _ in 0..200 {
        if matches!(*state.manual_slot(), ManualSlot::Starting(_)) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(matches!(*state.manual_slot(), ManualSlot::Starting(_)));

    let quick = std::time::Duration::from_secs(2);
    let (status, _) = tokio::time::timeout(quick, send(&app, "POST", "/api/record/manual", None))
        .await
        .expect("second start blocked behind the first");
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = tokio::time::timeout(
        quick,
        send(
            &app,
            "POST",
            "/api/record/manual/finish",
            Some(serde_json::json!({})),
        ),
    )
    .await
    .expect("finish blocked behind the start");
    assert_eq!(status, StatusCode::CONFLICT);

    drop(lease);
    let (status, json) = first.await.unwrap();
    assert_eq!(status, StatusCode::CREATED);
    assert!(json["path"].is_string());
    assert!(matches!(*state.manual_slot(), ManualSlot::Active(_)));
    state.shutdown();
}

#[tokio::test]
async fn test_stop_record_clears_manual_start_waiting_for_card() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state, _) = setup(&dir, DispatchMode::SingleShot);
    let lease = state.device.acquire(DeviceHolder::Player).await.unwrap();

    let first = tokio::spawn({
        let app = app.clone();
        async move { send(&app, "POST", "/api/record/manual", None).await }
    });
    for _ in 0..200 {
        if matches!(*state.manual_slot(), ManualSlot::Starting(_)) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (status, _) = send(&app, "POST", "/api/record/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    drop(lease);
    let (status, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(matches!(*state.manual_slot(), ManualSlot::Idle));
}

#[tokio::test]
async fn test_stop_record_cancels_manual_recording() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state, _) = setup(&dir, DispatchMode::SingleShot);

    let (status, _) = send(&app, "POST", "/api/record/manual", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(&app, "POST", "/api/record/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stopped"], 1);

    let (status, _) = send(
        &app,
        "POST",
        "/api/record/manual/finish",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // A new manual recording can start once the card is free again.
    for _ in 0..200 {
        if state.device.holder().is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let (status, _) = send(&app, "POST", "/api/record/manual", None).await;
    assert_eq!(status, StatusCode::CREATED);
    state.shutdown();
}
