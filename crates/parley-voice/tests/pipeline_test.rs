use futures_util::future::BoxFuture;
use parley_types::{
    AudioFormat, DispatchMode, PlaybackOutcome, PlaybackState, SpeechArtifact,
    SynthesisFailurePolicy,
};
use parley_voice::{
    AudioOutput, CommandTemplate, PipelineConfig, PlayReport, StreamPipeline, Synthesizer,
    VoiceError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Synthesizer whose latency and failures are scripted per text. Audio is
/// the text itself, so playback order can be read back from the output.
struct ScriptedSynth {
    mode: DispatchMode,
    delays_ms: HashMap<String, u64>,
    formats: HashMap<String, AudioFormat>,
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSynth {
    fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            delays_ms: HashMap::new(),
            formats: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn delay(mut self, text: &str, ms: u64) -> Self {
        self.delays_ms.insert(text.to_string(), ms);
        self
    }

    fn format(mut self, text: &str, format: AudioFormat) -> Self {
        self.formats.insert(text.to_string(), format);
        self
    }

    /// Fails the next `times` calls for `text`.
    fn fail(self, text: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(text.to_string(), times);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Synthesizer for ScriptedSynth {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(text.clone());
            if let Some(ms) = self.delays_ms.get(&text) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&text) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(VoiceError::Tts(format!("scripted failure for {text}")));
            }
            let format = self.formats.get(&text).copied().unwrap_or(AudioFormat::Mp3);
            Ok(SpeechArtifact::from_bytes(text.into_bytes(), format).with_duration_ms(10))
        })
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }
}

/// Synthesizer that writes each unit to a WAV file in `dir`, the way local
/// engines do.
struct FileSynth {
    dir: PathBuf,
    slow: Option<String>,
    next: AtomicUsize,
    written: AtomicUsize,
}

impl FileSynth {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            slow: None,
            next: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
        }
    }

    /// Makes synthesis of `text` take a minute.
    fn slow(mut self, text: &str) -> Self {
        self.slow = Some(text.to_string());
        self
    }
}

impl Synthesizer for FileSynth {
    fn synthesize(&self, text: String) -> BoxFuture<'_, Result<SpeechArtifact, VoiceError>> {
        Box::pin(async move {
            if self.slow.as_deref() == Some(text.as_str()) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            let path = self.dir.join(format!("unit-{n}.wav"));
            tokio::fs::write(&path, text.as_bytes()).await?;
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(SpeechArtifact::from_file(path)
                .with_format(AudioFormat::Wav)
                .with_duration_ms(10))
        })
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Incremental
    }
}

fn unit_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("unit-"))
        .count()
}

#[derive(Clone, Copy, PartialEq)]
enum OutputBehavior {
    /// Returns immediately.
    Instant,
    /// Plays until `stop_playing` is called.
    UntilStopped,
    /// Never returns and ignores `stop_playing`.
    Hang,
}

struct RecordingOutput {
    behavior: OutputBehavior,
    played: Mutex<Vec<String>>,
    budgets: Mutex<Vec<Duration>>,
    stop: Notify,
    stop_calls: AtomicUsize,
}

impl RecordingOutput {
    fn new(behavior: OutputBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            played: Mutex::new(Vec::new()),
            budgets: Mutex::new(Vec::new()),
            stop: Notify::new(),
            stop_calls: AtomicUsize::new(0),
        })
    }

    fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioOutput for RecordingOutput {
    fn play<'a>(
        &'a self,
        artifact: &'a SpeechArtifact,
        budget: Duration,
    ) -> BoxFuture<'a, Result<PlayReport, VoiceError>> {
        Box::pin(async move {
            let bytes = artifact
                .payload()
                .and_then(|payload| payload.to_bytes().ok().flatten())
                .unwrap_or_default();
            self.played
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&bytes).into_owned());
            self.budgets.lock().unwrap().push(budget);
            match self.behavior {
                OutputBehavior::Instant => Ok(PlayReport::Finished),
                OutputBehavior::UntilStopped => {
                    self.stop.notified().await;
                    Ok(PlayReport::Stopped)
                }
                OutputBehavior::Hang => std::future::pending().await,
            }
        })
    }

    fn stop_playing(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

fn build(
    synth: Arc<dyn Synthesizer>,
    output: Arc<RecordingOutput>,
    config: PipelineConfig,
) -> (StreamPipeline, Arc<Mutex<Vec<Vec<String>>>>, Arc<Mutex<Vec<String>>>) {
    let sentences = Arc::new(Mutex::new(Vec::new()));
    let full_texts = Arc::new(Mutex::new(Vec::new()));
    let sentence_sink = sentences.clone();
    let text_sink = full_texts.clone();
    let pipeline = StreamPipeline::builder(synth, output)
        .config(config)
        .on_sentences(move |batch: &[String]| sentence_sink.lock().unwrap().push(batch.to_vec()))
        .on_full_text(move |text: &str| text_sink.lock().unwrap().push(text.to_string()))
        .build();
    (pipeline, sentences, full_texts)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_playback_order_survives_reversed_synthesis_order() {
    let synth = Arc::new(
        ScriptedSynth::new(DispatchMode::Incremental)
            .delay("First sentence.", 300)
            .delay("Second sentence.", 10),
    );
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("First sentence. Second sentence.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(output.played(), vec!["First sentence.Second sentence."]);
    assert_eq!(pipeline.playback_state(), PlaybackState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_single_shot_word_split_across_chunks() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, sentences, full_texts) =
        build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("Hello wor");
    assert!(sentences.lock().unwrap().is_empty());
    pipeline.on_partial_text("ld. How are you?");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(
        sentences.lock().unwrap().concat(),
        vec!["Hello world.", "How are you?"]
    );
    assert_eq!(*full_texts.lock().unwrap(), vec!["Hello world. How are you?"]);
    assert_eq!(synth.calls(), vec!["Hello world. How are you?"]);
    assert_eq!(output.played(), vec!["Hello world. How are you?"]);
}

#[tokio::test(start_paused = true)]
async fn test_incremental_word_split_across_chunks() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::Incremental));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, sentences, full_texts) =
        build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("Hello wor");
    pipeline.on_partial_text("ld. How are you?");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(
        sentences.lock().unwrap().concat(),
        vec!["Hello world.", "How are you?"]
    );
    assert_eq!(*full_texts.lock().unwrap(), vec!["Hello world. How are you?"]);
    let mut calls = synth.calls();
    calls.sort();
    assert_eq!(calls, vec!["Hello world.", "How are you?"]);
    assert_eq!(output.played(), vec!["Hello world.How are you?"]);
}

#[tokio::test(start_paused = true)]
async fn test_trailing_remainder_becomes_last_sentence() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::Incremental));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, sentences, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("One. Two! Three");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    let batches = sentences.lock().unwrap().clone();
    assert_eq!(batches, vec![vec!["One.", "Two!"], vec!["Three"]]);
    assert_eq!(output.played(), vec!["One.Two!Three"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_synthesis_is_skipped() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::Incremental).fail("Broken one.", 1));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, sentences, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("Good one. Broken one. Last one.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(output.played(), vec!["Good one.Last one."]);
    // Text is never lost, only audio.
    assert_eq!(sentences.lock().unwrap().concat().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_once_recovers_from_single_failure() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot).fail("Try again.", 1));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let config = PipelineConfig {
        failure_policy: SynthesisFailurePolicy::RetryOnce,
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth.clone(), output.clone(), config);

    pipeline.on_partial_text("Try again.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(synth.calls().len(), 2);
    assert_eq!(output.played(), vec!["Try again."]);
}

#[tokio::test(start_paused = true)]
async fn test_turn_with_no_audio_is_silent() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot).fail("Nope.", 5));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("Nope.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Silent);
    assert!(output.played().is_empty());
    assert_eq!(pipeline.playback_state(), PlaybackState::Idle);
}

#[tokio::test]
async fn test_stop_when_idle_is_a_no_op() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, _) = build(synth, output, PipelineConfig::default());

    pipeline.stop();
    pipeline.stop();
    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Empty);
    assert_eq!(pipeline.playback_state(), PlaybackState::Idle);
}

#[tokio::test]
async fn test_stop_during_playback_resolves_waiters() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot));
    let output = RecordingOutput::new(OutputBehavior::UntilStopped);
    let (pipeline, _, _) = build(synth, output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("This will be interrupted.");
    pipeline.on_turn_end();
    let waiter = tokio::spawn(pipeline.playback_end().wait());
    wait_until(|| output.played().len() == 1).await;
    assert_eq!(pipeline.playback_state(), PlaybackState::Playing);

    pipeline.stop();

    assert_eq!(waiter.await.unwrap(), PlaybackOutcome::Stopped);
    let state_pipeline = pipeline.clone();
    wait_until(move || state_pipeline.playback_state() == PlaybackState::Idle).await;
    assert!(output.stop_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_stop_cancels_open_turn() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::Incremental).delay("Slow.", 60_000));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, _) = build(synth, output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("Slow. And more");
    let end = pipeline.playback_end();
    pipeline.stop();

    assert_eq!(end.wait().await, PlaybackOutcome::Stopped);
    // The turn is gone; ending it now does nothing.
    pipeline.on_turn_end();
    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Empty);
    assert!(output.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_output_is_abandoned_after_budget() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot));
    let output = RecordingOutput::new(OutputBehavior::Hang);
    let config = PipelineConfig {
        single_shot_margin_ms: 100,
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth, output.clone(), config);

    pipeline.on_partial_text("Nobody hears this.");
    pipeline.on_turn_end();

    let started = tokio::time::Instant::now();
    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Failed);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(output.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *output.budgets.lock().unwrap(),
        vec![Duration::from_millis(110)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_turns_play_in_fifo_order() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot).delay("One.", 200));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, full_texts) = build(synth, output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("One.");
    let first = pipeline.playback_end();
    pipeline.on_turn_end();
    pipeline.on_partial_text("Two.");
    pipeline.on_turn_end();
    let second = pipeline.playback_end();

    assert_eq!(second.wait().await, PlaybackOutcome::Completed);
    assert_eq!(first.wait().await, PlaybackOutcome::Completed);
    assert_eq!(output.played(), vec!["One.", "Two."]);
    assert_eq!(*full_texts.lock().unwrap(), vec!["One.", "Two."]);
}

#[tokio::test(start_paused = true)]
async fn test_margin_depends_on_dispatch_mode() {
    let config = PipelineConfig {
        single_shot_margin_ms: 1_000,
        incremental_margin_ms: 200,
        ..PipelineConfig::default()
    };

    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (single, _, _) = build(
        Arc::new(ScriptedSynth::new(DispatchMode::SingleShot)),
        output.clone(),
        config.clone(),
    );
    single.on_partial_text("A.");
    single.on_turn_end();
    single.await_playback_end().await;

    let (incremental, _, _) = build(
        Arc::new(ScriptedSynth::new(DispatchMode::Incremental)),
        output.clone(),
        config,
    );
    incremental.on_partial_text("A. B.");
    incremental.on_turn_end();
    incremental.await_playback_end().await;

    assert_eq!(
        *output.budgets.lock().unwrap(),
        vec![Duration::from_millis(1_010), Duration::from_millis(220)]
    );
}

#[tokio::test]
async fn test_stop_during_synthesis_removes_finished_unit_files() {
    let dir = tempfile::tempdir().unwrap();
    let synth = Arc::new(FileSynth::new(dir.path()).slow("Slow one."));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let config = PipelineConfig {
        work_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth.clone(), output.clone(), config);

    pipeline.on_partial_text("Fast one. Slow one. And");
    wait_until(|| synth.written.load(Ordering::SeqCst) == 1).await;
    pipeline.stop();

    wait_until(|| unit_files(dir.path()) == 0).await;
    assert!(output.played().is_empty());
}

#[tokio::test]
async fn test_stop_while_collecting_audio_removes_unit_files() {
    let dir = tempfile::tempdir().unwrap();
    let synth = Arc::new(FileSynth::new(dir.path()).slow("Slow one."));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let config = PipelineConfig {
        work_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth.clone(), output.clone(), config);

    pipeline.on_partial_text("Fast one. Slow one.");
    pipeline.on_turn_end();
    wait_until(|| synth.written.load(Ordering::SeqCst) == 1).await;
    assert_eq!(pipeline.playback_state(), PlaybackState::Playing);
    pipeline.stop();

    let state_pipeline = pipeline.clone();
    wait_until(move || state_pipeline.playback_state() == PlaybackState::Idle).await;
    assert_eq!(unit_files(dir.path()), 0);
    assert!(output.played().is_empty());
}

#[tokio::test]
async fn test_failed_file_merge_makes_turn_silent() {
    let dir = tempfile::tempdir().unwrap();
    let synth = Arc::new(FileSynth::new(dir.path()));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let config = PipelineConfig {
        merge: CommandTemplate::new("false", Vec::<String>::new()),
        work_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth, output.clone(), config);

    pipeline.on_partial_text("First part. Second part.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Silent);
    assert!(output.played().is_empty());
    let state_pipeline = pipeline.clone();
    wait_until(move || state_pipeline.playback_state() == PlaybackState::Idle).await;
    assert_eq!(unit_files(dir.path()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_in_memory_formats_make_turn_silent() {
    let synth = Arc::new(
        ScriptedSynth::new(DispatchMode::Incremental).format("Second part.", AudioFormat::Wav),
    );
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, _, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("First part. Second part.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Silent);
    assert_eq!(synth.calls().len(), 2);
    assert!(output.played().is_empty());
    assert_eq!(pipeline.playback_state(), PlaybackState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_reaches_output_that_missed_it() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::SingleShot));
    let output = RecordingOutput::new(OutputBehavior::Hang);
    let config = PipelineConfig {
        single_shot_margin_ms: 60_000,
        ..PipelineConfig::default()
    };
    let (pipeline, _, _) = build(synth, output.clone(), config);

    pipeline.on_partial_text("Long reply.");
    pipeline.on_turn_end();
    let waiter = tokio::spawn(pipeline.playback_end().wait());
    wait_until(|| output.played().len() == 1).await;

    pipeline.stop();

    assert_eq!(waiter.await.unwrap(), PlaybackOutcome::Stopped);
    // The worker must not sit out the 65 s budget.
    let state_pipeline = pipeline.clone();
    wait_until(move || state_pipeline.playback_state() == PlaybackState::Idle).await;
    assert!(output.stop_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_symbol_only_sentence_is_reported_but_not_spoken() {
    let synth = Arc::new(ScriptedSynth::new(DispatchMode::Incremental));
    let output = RecordingOutput::new(OutputBehavior::Instant);
    let (pipeline, sentences, _) = build(synth.clone(), output.clone(), PipelineConfig::default());

    pipeline.on_partial_text("😊! Hello there.");
    pipeline.on_turn_end();

    assert_eq!(pipeline.await_playback_end().await, PlaybackOutcome::Completed);
    assert_eq!(sentences.lock().unwrap().concat(), vec!["😊!", "Hello there."]);
    assert_eq!(synth.calls(), vec!["Hello there."]);
    assert_eq!(output.played(), vec!["Hello there."]);
}
