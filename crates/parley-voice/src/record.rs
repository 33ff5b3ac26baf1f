//! Microphone capture through the audio device.

use crate::device::{AudioDevice, DeviceLease};
use crate::error::VoiceError;
use crate::process::{
    spawn_process, supervise, Politeness, ProcessEnd, ProcessRole, Registration, StopRequest,
};
use parley_types::{AudioFormat, DeviceHolder};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// An open-ended capture started with [`AudioDevice::record_manually`].
pub struct ManualRecording {
    id: u64,
    path: PathBuf,
    device: Arc<AudioDevice>,
    completion: JoinHandle<Result<PathBuf, VoiceError>>,
}

impl ManualRecording {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the capture has ended, whether finished or cancelled.
    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Asks the recorder to finish. The completion still resolves with the
    /// captured file.
    pub fn stop(&self) {
        self.device
            .processes
            .request_stop(self.id, StopRequest::Finish);
    }

    /// Resolves when the capture has ended and the device is released.
    pub async fn completion(self) -> Result<PathBuf, VoiceError> {
        match self.completion.await {
            Ok(result) => result,
            Err(e) => Err(VoiceError::Task(e.to_string())),
        }
    }

    /// Stops the capture and waits for the file.
    pub async fn finish(self) -> Result<PathBuf, VoiceError> {
        self.stop();
        self.completion().await
    }
}

impl AudioDevice {
    fn spawn_recorder(
        &self,
        manual: bool,
        output: &Path,
        epoch: u64,
    ) -> Result<(Child, Registration, oneshot::Receiver<StopRequest>), VoiceError> {
        let template = if manual {
            &self.config.manual_recorder
        } else {
            &self.config.recorder
        };
        let file = output.to_string_lossy().into_owned();
        let format = AudioFormat::from_path(output).unwrap_or_default();
        let args = template.render(
            &[
                ("card", self.config.sound_card_index.as_str()),
                ("format", format.as_str()),
                ("file", file.as_str()),
            ],
            &[],
        );
        let child = spawn_process(&template.program, &args, Stdio::null())?;
        let (registration, stop_rx) = self.processes.register(ProcessRole::Recorder, child.id());
        if self.record_epoch.load(Ordering::SeqCst) != epoch {
            self.processes
                .request_stop(registration.id(), StopRequest::Cancel);
        }
        Ok((child, registration, stop_rx))
    }

    async fn acquire_for_recording(&self) -> Result<(DeviceLease, u64), VoiceError> {
        let epoch = self.record_epoch.load(Ordering::SeqCst);
        let lease = self.acquire(DeviceHolder::Recorder).await?;
        if self.record_epoch.load(Ordering::SeqCst) != epoch {
            return Err(VoiceError::RecordingCancelled);
        }
        Ok((lease, epoch))
    }

    /// Waits for the recorder to end, lets the card settle, then releases it.
    async fn run_recorder(
        &self,
        mut child: Child,
        registration: Registration,
        stop_rx: oneshot::Receiver<StopRequest>,
        max_duration: Option<Duration>,
        output: PathBuf,
        lease: DeviceLease,
    ) -> Result<PathBuf, VoiceError> {
        let end = supervise(
            &mut child,
            stop_rx,
            max_duration,
            Politeness::Interrupt,
            self.config.stop_grace(),
        )
        .await;
        drop(registration);

        tokio::time::sleep(self.config.settle_delay()).await;
        drop(lease);

        match end? {
            ProcessEnd::Exited(status) if status.success() => {
                tracing::info!(path = %output.display(), "recording finished");
                Ok(output)
            }
            ProcessEnd::Exited(status) => Err(VoiceError::ProcessExit {
                program: self.config.recorder.program.clone(),
                code: status.code(),
            }),
            ProcessEnd::TimedOut => {
                tracing::info!(path = %output.display(), "recording reached its time limit");
                Ok(output)
            }
            ProcessEnd::Stopped(StopRequest::Finish) => {
                tracing::info!(path = %output.display(), "recording stopped by caller");
                Ok(output)
            }
            ProcessEnd::Stopped(StopRequest::Cancel) => {
                tracing::info!(path = %output.display(), "recording cancelled");
                Err(VoiceError::RecordingCancelled)
            }
        }
    }

    /// Records into `output` until the speaker falls silent or
    /// `max_duration` passes, whichever is first.
    pub async fn record(
        &self,
        output: impl AsRef<Path>,
        max_duration: Duration,
    ) -> Result<PathBuf, VoiceError> {
        let output = output.as_ref().to_path_buf();
        let (lease, epoch) = self.acquire_for_recording().await?;
        let (child, registration, stop_rx) = self.spawn_recorder(false, &output, epoch)?;
        tracing::info!(
            pid = ?child.id(),
            max_secs = max_duration.as_secs_f32(),
            path = %output.display(),
            "recording started"
        );
        self.run_recorder(child, registration, stop_rx, Some(max_duration), output, lease)
            .await
    }

    /// Starts an open-ended recording. Returns once capture has begun; the
    /// returned handle stops it and yields the file.
    pub async fn record_manually(
        self: &Arc<Self>,
        output: impl AsRef<Path>,
    ) -> Result<ManualRecording, VoiceError> {
        let output = output.as_ref().to_path_buf();
        let (lease, epoch) = self.acquire_for_recording().await?;
        let (child, registration, stop_rx) = self.spawn_recorder(true, &output, epoch)?;
        let id = registration.id();
        tracing::info!(pid = ?child.id(), path = %output.display(), "manual recording started");

        let device = self.clone();
        let path = output.clone();
        let completion = tokio::spawn(async move {
            device
                .run_recorder(child, registration, stop_rx, None, path, lease)
                .await
        });

        Ok(ManualRecording {
            id,
            path: output,
            device: self.clone(),
            completion,
        })
    }

    /// Cancels any recording in progress or waiting for the card. Pending
    /// completions resolve with [`VoiceError::RecordingCancelled`]. Returns
    /// the number of capture processes stopped.
    pub fn stop_recording(&self) -> usize {
        self.record_epoch.fetch_add(1, Ordering::SeqCst);
        let stopped = self
            .processes
            .stop_where(|role| role == ProcessRole::Recorder, StopRequest::Cancel);
        if stopped == 0 {
            tracing::info!("no recording in progress");
        } else {
            tracing::info!(stopped, "recording stopped");
        }
        stopped
    }
}
