//! Exclusive access to the sound card.
//!
//! [`AudioDevice`] owns a single-permit token. Every playback and every
//! recording holds it for the lifetime of its external process, so the card
//! is never opened by two processes at once. Waiters are served in arrival
//! order.

use crate::config::DeviceConfig;
use crate::error::VoiceError;
use crate::process::{
    lock, spawn_process, supervise, Politeness, ProcessEnd, ProcessRegistry, ProcessRole,
    Registration, StopRequest,
};
use futures_util::future::BoxFuture;
use parley_types::{AudioFormat, AudioPayload, DeviceHolder, SpeechArtifact};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// How a single playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayReport {
    /// The player exited on its own.
    Finished,
    /// The fallback timer fired and the player was terminated.
    TimedOut,
    /// `stop_playing` interrupted or cancelled the playback.
    Stopped,
    /// The artifact had no audio.
    Skipped,
}

/// Where a pipeline sends its audio.
///
/// Implemented by [`AudioDevice`]; tests substitute scripted outputs.
pub trait AudioOutput: Send + Sync {
    /// Plays one artifact. `budget` is the expected playback time; the
    /// output may give up some time after it passes.
    fn play<'a>(
        &'a self,
        artifact: &'a SpeechArtifact,
        budget: Duration,
    ) -> BoxFuture<'a, Result<PlayReport, VoiceError>>;

    /// Interrupts current playback and cancels queued playbacks. Never
    /// blocks.
    fn stop_playing(&self);
}

/// Proof of exclusive access to the card. Releases on drop.
pub struct DeviceLease {
    holder: Arc<Mutex<Option<DeviceHolder>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        *lock(&self.holder) = None;
    }
}

/// The sound card plus the external tools that drive it.
pub struct AudioDevice {
    pub(crate) config: DeviceConfig,
    token: Arc<Semaphore>,
    holder: Arc<Mutex<Option<DeviceHolder>>>,
    pub(crate) processes: Arc<ProcessRegistry>,
    decoder_slot: Mutex<Option<u64>>,
    play_epoch: AtomicU64,
    pub(crate) record_epoch: AtomicU64,
}

impl AudioDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            token: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
            processes: Arc::new(ProcessRegistry::default()),
            decoder_slot: Mutex::new(None),
            play_epoch: AtomicU64::new(0),
            record_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Who holds the exclusivity token right now, if anyone.
    pub fn holder(&self) -> Option<DeviceHolder> {
        *lock(&self.holder)
    }

    /// Number of audio processes currently tracked.
    pub fn active_processes(&self) -> usize {
        self.processes.count()
    }

    /// Waits for the exclusivity token.
    pub async fn acquire(&self, holder: DeviceHolder) -> Result<DeviceLease, VoiceError> {
        let permit = self
            .token
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VoiceError::DeviceClosed)?;
        *lock(&self.holder) = Some(holder);
        tracing::debug!(holder = holder.label(), "audio device acquired");
        Ok(DeviceLease {
            holder: self.holder.clone(),
            _permit: permit,
        })
    }

    /// Plays one artifact and resolves when it ends.
    ///
    /// File artifacts are handed to the player; in-memory audio is piped into
    /// a decoder chosen by format. The player is terminated if it is still
    /// running `fallback_grace` after `budget`.
    pub async fn play(
        &self,
        artifact: &SpeechArtifact,
        budget: Duration,
    ) -> Result<PlayReport, VoiceError> {
        if artifact.is_empty() {
            tracing::info!("no audio data to play, skipping playback");
            return Ok(PlayReport::Skipped);
        }

        let epoch = self.play_epoch.load(Ordering::SeqCst);
        let _lease = self.acquire(DeviceHolder::Player).await?;
        if self.play_epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("playback cancelled while waiting for the device");
            return Ok(PlayReport::Stopped);
        }

        let deadline = budget + self.config.fallback_grace();
        match artifact.payload() {
            Some(AudioPayload::File(path)) => self.play_file(path, deadline, epoch).await,
            Some(payload) => {
                let bytes = payload.to_bytes()?.unwrap_or_default();
                self.play_bytes(bytes, artifact.format(), deadline, epoch)
                    .await
            }
            None => Ok(PlayReport::Skipped),
        }
    }

    /// Registers a running child and, if a stop raced with its spawn, asks
    /// it to stop straight away.
    fn track(
        &self,
        role: ProcessRole,
        pid: Option<u32>,
        epoch: u64,
    ) -> (Registration, tokio::sync::oneshot::Receiver<StopRequest>) {
        let (registration, stop_rx) = self.processes.register(role, pid);
        if self.play_epoch.load(Ordering::SeqCst) != epoch {
            self.processes
                .request_stop(registration.id(), StopRequest::Cancel);
        }
        (registration, stop_rx)
    }

    async fn play_file(
        &self,
        path: &Path,
        deadline: Duration,
        epoch: u64,
    ) -> Result<PlayReport, VoiceError> {
        let card = self.config.sound_card_index.clone();
        let file = path.to_string_lossy().into_owned();
        let template = &self.config.player;
        let args = template.render(&[("card", card.as_str()), ("file", file.as_str())], &[]);

        let mut child = spawn_process(&template.program, &args, Stdio::null())?;
        let (registration, stop_rx) = self.track(ProcessRole::Player, child.id(), epoch);
        tracing::info!(pid = ?child.id(), path = %file, "playing audio file");

        let end = supervise(
            &mut child,
            stop_rx,
            Some(deadline),
            Politeness::Terminate,
            self.config.stop_grace(),
        )
        .await;
        drop(registration);
        report(&template.program, end?)
    }

    async fn play_bytes(
        &self,
        bytes: Vec<u8>,
        format: AudioFormat,
        deadline: Duration,
        epoch: u64,
    ) -> Result<PlayReport, VoiceError> {
        let template = match format {
            AudioFormat::Pcm => &self.config.pcm_decoder,
            format if format.is_compressed() => &self.config.mp3_decoder,
            _ => &self.config.wav_decoder,
        };
        let card = self.config.sound_card_index.clone();
        let args = template.render(
            &[("card", card.as_str()), ("format", format.as_str())],
            &[],
        );

        // Only one decoder may hold the card.
        let previous = lock(&self.decoder_slot).take();
        if let Some(previous) = previous {
            self.processes.request_stop(previous, StopRequest::Cancel);
        }

        let mut child = spawn_process(&template.program, &args, Stdio::piped())?;
        let (registration, stop_rx) = self.track(ProcessRole::Decoder, child.id(), epoch);
        let id = registration.id();
        *lock(&self.decoder_slot) = Some(id);
        tracing::info!(
            pid = ?child.id(),
            %format,
            bytes = bytes.len(),
            "streaming audio to decoder"
        );

        // Write from a separate task so a decoder that stops reading cannot
        // deadlock the supervisor.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await
            })
        });

        let end = supervise(
            &mut child,
            stop_rx,
            Some(deadline),
            Politeness::Terminate,
            self.config.stop_grace(),
        )
        .await;

        {
            let mut slot = lock(&self.decoder_slot);
            if *slot == Some(id) {
                *slot = None;
            }
        }
        drop(registration);

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "decoder stdin closed early"),
                Err(e) => tracing::warn!(error = %e, "decoder writer task failed"),
            }
        }
        report(&template.program, end?)
    }

    /// Interrupts all playback processes and cancels playbacks still
    /// waiting for the card. Recordings are left alone.
    pub fn stop_playing(&self) {
        self.play_epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.decoder_slot).take();
        let stopped = self
            .processes
            .stop_where(|role| role != ProcessRole::Recorder, StopRequest::Cancel);
        if stopped > 0 {
            tracing::info!(stopped, "stopped audio playback");
        }
    }

    /// Stops everything and refuses further use of the card.
    pub fn shutdown(&self) {
        self.stop_playing();
        self.stop_recording();
        self.token.close();
        tracing::info!("audio device shut down");
    }
}

fn report(program: &str, end: ProcessEnd) -> Result<PlayReport, VoiceError> {
    match end {
        ProcessEnd::Exited(status) if status.success() => {
            tracing::debug!(program, "playback finished");
            Ok(PlayReport::Finished)
        }
        ProcessEnd::Exited(status) => Err(VoiceError::ProcessExit {
            program: program.to_string(),
            code: status.code(),
        }),
        ProcessEnd::TimedOut => {
            tracing::warn!(program, "playback fallback timer fired, player terminated");
            Ok(PlayReport::TimedOut)
        }
        ProcessEnd::Stopped(_) => Ok(PlayReport::Stopped),
    }
}

impl AudioOutput for AudioDevice {
    fn play<'a>(
        &'a self,
        artifact: &'a SpeechArtifact,
        budget: Duration,
    ) -> BoxFuture<'a, Result<PlayReport, VoiceError>> {
        Box::pin(AudioDevice::play(self, artifact, budget))
    }

    fn stop_playing(&self) {
        AudioDevice::stop_playing(self);
    }
}
