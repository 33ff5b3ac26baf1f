//! Streaming text to ordered speech.
//!
//! A [`StreamPipeline`] receives the text of one model response in chunks
//! (a *turn*), segments it into sentences, dispatches synthesis according to
//! the synthesizer's [`DispatchMode`], and plays the resulting audio through
//! an [`AudioOutput`] in sentence order. Turns that end while an earlier turn
//! is still playing are queued and played in order by a single worker task.
//!
//! All turn bookkeeping lives behind one mutex that is never held across an
//! await point; synthesis and playback run in spawned tasks.

use crate::config::PipelineConfig;
use crate::device::{AudioOutput, PlayReport};
use crate::duration::resolve_duration_ms;
use crate::merge::merge_artifacts;
use crate::process::lock;
use crate::purify::{purify_for_speech, Purifier};
use crate::segment::split_sentences;
use crate::signal::{PlaybackEnd, PlaybackSignal};
use crate::tts::Synthesizer;
use parley_types::{
    DispatchMode, PlaybackOutcome, PlaybackState, SpeechArtifact, SynthesisFailurePolicy,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

/// Called with the sentences completed by one `on_partial_text` or
/// `on_turn_end` call.
pub type SentenceObserver = dyn Fn(&[String]) + Send + Sync;

/// Called with the full text of a turn when it ends.
pub type TextObserver = dyn Fn(&str) + Send + Sync;

/// Extra time the pipeline gives an output beyond the playback budget before
/// it gives up on it.
const OUTPUT_GUARD: Duration = Duration::from_secs(5);

struct SynthesisTask {
    text: String,
    handle: JoinHandle<Option<SpeechArtifact>>,
}

struct OpenTurn {
    id: u64,
    buffer: String,
    sentences: Vec<String>,
    tasks: Vec<SynthesisTask>,
    signal: PlaybackSignal,
}

struct PlaybackJob {
    turn: u64,
    tasks: Vec<SynthesisTask>,
    margin: Duration,
    signal: PlaybackSignal,
}

struct ActiveJob {
    signal: PlaybackSignal,
    cancel: watch::Sender<bool>,
    aborts: Vec<AbortHandle>,
}

#[derive(Default)]
struct Turns {
    next_id: u64,
    open: Option<OpenTurn>,
    queue: VecDeque<PlaybackJob>,
    active: Option<ActiveJob>,
}

impl Turns {
    fn open_turn(&mut self) -> &mut OpenTurn {
        if self.open.is_none() {
            self.next_id += 1;
            tracing::info!(turn = self.next_id, "turn started");
        }
        let next_id = self.next_id;
        self.open.get_or_insert_with(|| OpenTurn {
            id: next_id,
            buffer: String::new(),
            sentences: Vec::new(),
            tasks: Vec::new(),
            signal: PlaybackSignal::new(),
        })
    }
}

struct Inner {
    synthesizer: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
    purifier: Arc<Purifier>,
    config: PipelineConfig,
    mode: DispatchMode,
    on_sentences: Option<Arc<SentenceObserver>>,
    on_full_text: Option<Arc<TextObserver>>,
    state: AtomicU8,
    turns: Mutex<Turns>,
}

/// Builder for [`StreamPipeline`].
pub struct PipelineBuilder {
    synthesizer: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
    purifier: Arc<Purifier>,
    config: PipelineConfig,
    on_sentences: Option<Arc<SentenceObserver>>,
    on_full_text: Option<Arc<TextObserver>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default [`purify_for_speech`] step.
    pub fn purifier(mut self, purifier: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.purifier = Arc::new(purifier);
        self
    }

    pub fn on_sentences(mut self, observer: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.on_sentences = Some(Arc::new(observer));
        self
    }

    pub fn on_full_text(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_full_text = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> StreamPipeline {
        let mode = self.synthesizer.dispatch_mode();
        StreamPipeline {
            inner: Arc::new(Inner {
                synthesizer: self.synthesizer,
                output: self.output,
                purifier: self.purifier,
                config: self.config,
                mode,
                on_sentences: self.on_sentences,
                on_full_text: self.on_full_text,
                state: AtomicU8::new(PlaybackState::Idle.as_u8()),
                turns: Mutex::new(Turns::default()),
            }),
        }
    }
}

/// Turns streamed response text into ordered speech. Cheap to clone.
///
/// Methods that dispatch work spawn tokio tasks and must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct StreamPipeline {
    inner: Arc<Inner>,
}

impl StreamPipeline {
    pub fn builder(
        synthesizer: Arc<dyn Synthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            synthesizer,
            output,
            purifier: Arc::new(purify_for_speech),
            config: PipelineConfig::default(),
            on_sentences: None,
            on_full_text: None,
        }
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.inner.mode
    }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Opens a turn if none is open and returns its id.
    pub fn begin_turn(&self) -> u64 {
        lock(&self.inner.turns).open_turn().id
    }

    /// Feeds the next chunk of response text.
    pub fn on_partial_text(&self, chunk: &str) {
        let chunk = chunk.replace(['\r', '\n'], " ");
        let completed = {
            let mut turns = lock(&self.inner.turns);
            let open = turns.open_turn();
            open.buffer.push_str(&chunk);
            let segmented = split_sentences(&open.buffer);
            open.buffer = segmented.remainder;
            if self.inner.mode == DispatchMode::Incremental {
                for sentence in &segmented.sentences {
                    if let Some(task) = self.inner.dispatch(sentence) {
                        open.tasks.push(task);
                    }
                }
            }
            open.sentences.extend(segmented.sentences.iter().cloned());
            segmented.sentences
        };

        if !completed.is_empty() {
            tracing::debug!(sentences = completed.len(), "sentences recognized");
            if let Some(observer) = &self.inner.on_sentences {
                observer(completed.as_slice());
            }
        }
    }

    /// Ends the current turn: flushes the remainder, dispatches what is
    /// left to synthesize, and queues the turn for playback.
    pub fn on_turn_end(&self) {
        let (tail, full_text) = {
            let mut turns = lock(&self.inner.turns);
            let Some(mut open) = turns.open.take() else {
                tracing::debug!("turn end without an open turn");
                return;
            };

            let remainder = open.buffer.trim().to_string();
            open.buffer.clear();
            let mut tail = Vec::new();
            if !remainder.is_empty() {
                if self.inner.mode == DispatchMode::Incremental {
                    if let Some(task) = self.inner.dispatch(&remainder) {
                        open.tasks.push(task);
                    }
                }
                open.sentences.push(remainder.clone());
                tail.push(remainder);
            }

            let full_text = open.sentences.join(" ");
            if self.inner.mode == DispatchMode::SingleShot && !full_text.is_empty() {
                if let Some(task) = self.inner.dispatch(&full_text) {
                    open.tasks.push(task);
                }
            }

            if open.tasks.is_empty() {
                let outcome = if open.sentences.is_empty() {
                    PlaybackOutcome::Empty
                } else {
                    PlaybackOutcome::Silent
                };
                tracing::info!(turn = open.id, ?outcome, "turn ended with nothing to play");
                open.signal.resolve(outcome);
            } else {
                tracing::info!(
                    turn = open.id,
                    sentences = open.sentences.len(),
                    tasks = open.tasks.len(),
                    "turn ended, queued for playback"
                );
                turns.queue.push_back(PlaybackJob {
                    turn: open.id,
                    tasks: open.tasks,
                    margin: self.inner.config.margin_for(self.inner.mode),
                    signal: open.signal,
                });
                self.start_worker();
            }
            (tail, full_text)
        };

        if !tail.is_empty() {
            if let Some(observer) = &self.inner.on_sentences {
                observer(tail.as_slice());
            }
        }
        if let Some(observer) = &self.inner.on_full_text {
            observer(full_text.as_str());
        }
    }

    /// Starts the playback worker unless it is already running. Called with
    /// the turn lock held so the worker cannot miss a freshly queued job.
    fn start_worker(&self) {
        let started = self
            .inner
            .state
            .compare_exchange(
                PlaybackState::Idle.as_u8(),
                PlaybackState::Playing.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if started {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.run_playback().await });
        }
    }

    /// Returns a handle that resolves when the most recent open or pending
    /// turn has finished playing. Resolves at once with
    /// [`PlaybackOutcome::Empty`] when there is nothing to wait for.
    pub fn playback_end(&self) -> PlaybackEnd {
        let turns = lock(&self.inner.turns);
        if let Some(open) = &turns.open {
            return open.signal.subscribe();
        }
        if let Some(job) = turns.queue.back() {
            return job.signal.subscribe();
        }
        if let Some(active) = &turns.active {
            return active.signal.subscribe();
        }
        PlaybackEnd::ready(PlaybackOutcome::Empty)
    }

    /// Waits until the most recent turn has finished playing.
    pub async fn await_playback_end(&self) -> PlaybackOutcome {
        self.playback_end().wait().await
    }

    /// Cancels everything: the open turn, queued turns, pending synthesis and
    /// current playback. Every pending waiter resolves with
    /// [`PlaybackOutcome::Stopped`]. Safe to call at any time.
    pub fn stop(&self) {
        let (signals, abandoned) = {
            let mut turns = lock(&self.inner.turns);
            let mut signals = Vec::new();
            let mut abandoned = Vec::new();
            if let Some(open) = turns.open.take() {
                abandoned.extend(open.tasks.into_iter().map(|task| task.handle));
                signals.push(open.signal);
            }
            for job in turns.queue.drain(..) {
                abandoned.extend(job.tasks.into_iter().map(|task| task.handle));
                signals.push(job.signal);
            }
            if let Some(active) = &turns.active {
                active.cancel.send_replace(true);
                for abort in &active.aborts {
                    abort.abort();
                }
                signals.push(active.signal.clone());
            }
            (signals, abandoned)
        };

        for handle in &abandoned {
            handle.abort();
        }
        if !abandoned.is_empty() {
            // Units that finished before the abort may have left files behind.
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(discard_units(abandoned, self.inner.config.work_dir.clone()));
                }
                Err(_) => tracing::debug!("no runtime, abandoned synthesis output left in place"),
            }
        }

        self.inner.output.stop_playing();
        let resolved = signals
            .iter()
            .filter(|signal| signal.resolve(PlaybackOutcome::Stopped))
            .count();
        tracing::info!(resolved, "pipeline stopped");
    }
}

/// Waits out aborted synthesis tasks and deletes the work-directory files of
/// those that had already finished.
async fn discard_units(handles: Vec<JoinHandle<Option<SpeechArtifact>>>, work_dir: PathBuf) {
    let mut artifacts = Vec::new();
    for handle in handles {
        if let Ok(Some(artifact)) = handle.await {
            artifacts.push(artifact);
        }
    }
    remove_scratch(&scratch_files(&artifacts, &work_dir)).await;
}

async fn synthesize_with_policy(
    synthesizer: Arc<dyn Synthesizer>,
    text: String,
    policy: SynthesisFailurePolicy,
) -> Option<SpeechArtifact> {
    let attempts = match policy {
        SynthesisFailurePolicy::Skip => 1,
        SynthesisFailurePolicy::RetryOnce => 2,
    };
    for attempt in 1..=attempts {
        match synthesizer.synthesize(text.clone()).await {
            Ok(artifact) if artifact.is_empty() => {
                tracing::warn!(attempt, chars = text.len(), "synthesis returned no audio");
            }
            Ok(artifact) => return Some(artifact),
            Err(e) => {
                tracing::warn!(attempt, chars = text.len(), error = %e, "synthesis failed");
            }
        }
    }
    None
}

impl Inner {
    /// Purifies `text` and spawns its synthesis. Returns `None` when nothing
    /// speakable is left.
    fn dispatch(&self, text: &str) -> Option<SynthesisTask> {
        let cleaned = (self.purifier)(text);
        if !cleaned.chars().any(char::is_alphanumeric) {
            tracing::debug!("nothing speakable after purification");
            return None;
        }
        tracing::debug!(chars = cleaned.len(), "dispatching synthesis");
        let handle = tokio::spawn(synthesize_with_policy(
            self.synthesizer.clone(),
            cleaned.clone(),
            self.config.failure_policy,
        ));
        Some(SynthesisTask {
            text: cleaned,
            handle,
        })
    }

    async fn run_playback(self: Arc<Self>) {
        loop {
            let next = {
                let mut turns = lock(&self.turns);
                match turns.queue.pop_front() {
                    Some(job) => {
                        let (cancel, cancelled) = watch::channel(false);
                        turns.active = Some(ActiveJob {
                            signal: job.signal.clone(),
                            cancel,
                            aborts: job
                                .tasks
                                .iter()
                                .map(|task| task.handle.abort_handle())
                                .collect(),
                        });
                        Some((job, cancelled))
                    }
                    None => {
                        turns.active = None;
                        self.state
                            .store(PlaybackState::Idle.as_u8(), Ordering::SeqCst);
                        None
                    }
                }
            };
            let Some((job, cancelled)) = next else {
                break;
            };

            let signal = job.signal.clone();
            let turn = job.turn;
            let outcome = self.play_job(job, cancelled).await;
            if signal.resolve(outcome) {
                tracing::info!(turn, ?outcome, "turn playback ended");
            }
        }
    }

    async fn play_job(
        &self,
        job: PlaybackJob,
        mut cancelled: watch::Receiver<bool>,
    ) -> PlaybackOutcome {
        let mut artifacts = Vec::with_capacity(job.tasks.len());
        for task in job.tasks {
            match task.handle.await {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => {
                    tracing::debug!(turn = job.turn, text = %task.text, "skipping unit without audio");
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(turn = job.turn, error = %e, "synthesis task failed"),
            }
        }

        let scratch = scratch_files(&artifacts, &self.config.work_dir);
        if *cancelled.borrow() {
            remove_scratch(&scratch).await;
            return PlaybackOutcome::Stopped;
        }
        if artifacts.is_empty() {
            tracing::warn!(turn = job.turn, "no audio produced for turn");
            return PlaybackOutcome::Silent;
        }

        let merged =
            match merge_artifacts(artifacts, &self.config.merge, &self.config.work_dir).await {
                Ok(merged) => merged,
                Err(e) => {
                    tracing::warn!(turn = job.turn, error = %e, "audio merge failed, turn is silent");
                    remove_scratch(&scratch).await;
                    return PlaybackOutcome::Silent;
                }
            };

        let duration_ms = resolve_duration_ms(&merged.artifact).await;
        let budget = Duration::from_millis(duration_ms) + job.margin;
        let outcome = if *cancelled.borrow() {
            PlaybackOutcome::Stopped
        } else {
            tracing::info!(
                turn = job.turn,
                duration_ms,
                budget_ms = budget.as_millis() as u64,
                "playing turn"
            );
            let played = tokio::time::timeout(
                budget + OUTPUT_GUARD,
                self.output.play(&merged.artifact, budget),
            );
            // A stop may land after the check above but before the output
            // starts listening for it.
            let played = tokio::select! {
                played = played => played,
                Ok(_) = cancelled.wait_for(|stopped| *stopped) => {
                    self.output.stop_playing();
                    Ok(Ok(PlayReport::Stopped))
                }
            };
            match played {
                Ok(Ok(PlayReport::Finished | PlayReport::TimedOut)) => PlaybackOutcome::Completed,
                Ok(Ok(PlayReport::Stopped)) => PlaybackOutcome::Stopped,
                Ok(Ok(PlayReport::Skipped)) => PlaybackOutcome::Silent,
                Ok(Err(e)) => {
                    tracing::warn!(turn = job.turn, error = %e, "playback failed");
                    PlaybackOutcome::Failed
                }
                Err(_) => {
                    tracing::warn!(
                        turn = job.turn,
                        budget_ms = budget.as_millis() as u64,
                        "audio output did not finish in time, abandoning playback"
                    );
                    self.output.stop_playing();
                    PlaybackOutcome::Failed
                }
            }
        };

        merged.cleanup().await;
        remove_scratch(&scratch).await;
        outcome
    }
}

/// Synthesizer output files that live in the work directory.
fn scratch_files(artifacts: &[SpeechArtifact], work_dir: &Path) -> Vec<PathBuf> {
    artifacts
        .iter()
        .filter_map(SpeechArtifact::file_path)
        .filter(|path| path.starts_with(work_dir))
        .map(Path::to_path_buf)
        .collect()
}

/// Removes synthesizer output written into the work directory.
async fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove scratch audio");
        }
    }
}
