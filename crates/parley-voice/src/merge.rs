//! Joins the artifacts of one turn into a single playable artifact.
//!
//! File-based artifacts are concatenated by an external utility. In-memory
//! WAV buffers with a common sample spec are joined with `hound`; other
//! in-memory buffers of one format are concatenated as they are. Headerless
//! PCM handed to the utility is wrapped in a WAV container first.

use crate::config::CommandTemplate;
use crate::duration::PCM_SAMPLE_RATE;
use crate::error::VoiceError;
use parley_types::{AudioFormat, SpeechArtifact};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Result of a merge.
#[derive(Debug)]
pub struct Merged {
    pub artifact: SpeechArtifact,
    /// File created by the merge, to be removed once played.
    pub temporary: Option<PathBuf>,
}

impl Merged {
    /// Deletes the merge output, if any.
    pub async fn cleanup(&self) {
        if let Some(path) = &self.temporary {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove merged audio");
            }
        }
    }
}

fn total_duration(artifacts: &[SpeechArtifact]) -> Option<u64> {
    artifacts
        .iter()
        .map(SpeechArtifact::duration_ms)
        .sum::<Option<u64>>()
}

/// Merges `artifacts` in order.
///
/// One artifact is returned unchanged. Zero artifacts is
/// [`VoiceError::NoArtifacts`].
pub async fn merge_artifacts(
    artifacts: Vec<SpeechArtifact>,
    merge_command: &CommandTemplate,
    work_dir: &Path,
) -> Result<Merged, VoiceError> {
    let mut artifacts = artifacts;
    match artifacts.len() {
        0 => return Err(VoiceError::NoArtifacts),
        1 => {
            return Ok(Merged {
                artifact: artifacts.remove(0),
                temporary: None,
            })
        }
        _ => {}
    }

    if artifacts.iter().any(SpeechArtifact::is_file) {
        return merge_files(&artifacts, merge_command, work_dir).await;
    }

    let format = artifacts[0].format();
    if artifacts.iter().any(|artifact| artifact.format() != format) {
        return Err(VoiceError::Merge(format!(
            "cannot join in-memory audio of mixed formats (first is {format})"
        )));
    }

    let mut buffers = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        if let Some(payload) = artifact.payload() {
            buffers.push(payload.to_bytes()?.unwrap_or_default());
        }
    }

    let joined = match format {
        AudioFormat::Wav => join_wav(&buffers)?,
        _ => buffers.concat(),
    };
    let mut merged = SpeechArtifact::from_bytes(joined, format);
    if let Some(duration_ms) = total_duration(&artifacts) {
        merged = merged.with_duration_ms(duration_ms);
    }
    tracing::debug!(count = artifacts.len(), %format, "joined in-memory audio");
    Ok(Merged {
        artifact: merged,
        temporary: None,
    })
}

async fn merge_files(
    artifacts: &[SpeechArtifact],
    merge_command: &CommandTemplate,
    work_dir: &Path,
) -> Result<Merged, VoiceError> {
    tokio::fs::create_dir_all(work_dir).await?;

    let format = match artifacts
        .iter()
        .find(|artifact| artifact.is_file())
        .map(SpeechArtifact::format)
        .unwrap_or_default()
    {
        AudioFormat::Pcm => AudioFormat::Wav,
        format => format,
    };
    let output = work_dir.join(format!("merged-{}.{}", uuid::Uuid::new_v4(), format.as_str()));

    let mut inputs = Vec::with_capacity(artifacts.len());
    let mut materialized = Vec::new();
    let result = match stage_inputs(artifacts, work_dir, &mut inputs, &mut materialized).await {
        Ok(()) => run_merge(merge_command, &inputs, &output).await,
        Err(e) => Err(e),
    };
    for path in &materialized {
        let _ = tokio::fs::remove_file(path).await;
    }
    result?;

    let mut artifact = SpeechArtifact::from_file(&output).with_format(format);
    if let Some(duration_ms) = total_duration(artifacts) {
        artifact = artifact.with_duration_ms(duration_ms);
    }
    tracing::info!(count = inputs.len(), path = %output.display(), "merged audio files");
    Ok(Merged {
        artifact,
        temporary: Some(output),
    })
}

/// Collects one input path per artifact. In-memory audio and headerless PCM
/// are written to `part-*` files first; their paths go into `materialized`.
async fn stage_inputs(
    artifacts: &[SpeechArtifact],
    work_dir: &Path,
    inputs: &mut Vec<PathBuf>,
    materialized: &mut Vec<PathBuf>,
) -> Result<(), VoiceError> {
    for artifact in artifacts {
        let format = artifact.format();
        let bytes = match (artifact.file_path(), artifact.payload()) {
            (Some(path), _) if format != AudioFormat::Pcm => {
                inputs.push(path.to_path_buf());
                continue;
            }
            (Some(path), _) => tokio::fs::read(path).await?,
            (None, Some(payload)) => payload.to_bytes()?.unwrap_or_default(),
            (None, None) => continue,
        };
        let (bytes, format) = match format {
            AudioFormat::Pcm => (pcm_to_wav(&bytes)?, AudioFormat::Wav),
            format => (bytes, format),
        };
        let path = work_dir.join(format!("part-{}.{}", uuid::Uuid::new_v4(), format.as_str()));
        tokio::fs::write(&path, bytes).await?;
        inputs.push(path.clone());
        materialized.push(path);
    }
    Ok(())
}

/// Wraps headerless 16-bit mono PCM in a WAV container.
fn pcm_to_wav(bytes: &[u8]) -> Result<Vec<u8>, VoiceError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: PCM_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec)?;
        for pair in bytes.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}

async fn run_merge(
    template: &CommandTemplate,
    inputs: &[PathBuf],
    output: &Path,
) -> Result<(), VoiceError> {
    let file = output.to_string_lossy().into_owned();
    let inputs: Vec<String> = inputs
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    let args = template.render(&[("file", file.as_str())], &inputs);

    let result = tokio::process::Command::new(&template.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| VoiceError::Spawn {
            program: template.program.clone(),
            source,
        })?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let _ = tokio::fs::remove_file(output).await;
        return Err(VoiceError::Merge(format!(
            "{} exited with {:?}: {}",
            template.program,
            result.status.code(),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Concatenates WAV buffers that share one sample spec.
fn join_wav(buffers: &[Vec<u8>]) -> Result<Vec<u8>, VoiceError> {
    let mut readers = Vec::with_capacity(buffers.len());
    for buffer in buffers {
        readers.push(hound::WavReader::new(Cursor::new(buffer.as_slice()))?);
    }
    let Some(spec) = readers.first().map(hound::WavReader::spec) else {
        return Err(VoiceError::NoArtifacts);
    };
    if readers.iter().any(|reader| reader.spec() != spec) {
        return Err(VoiceError::Merge(
            "WAV buffers have different sample specs".to_string(),
        ));
    }

    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec)?;
        for reader in &mut readers {
            match spec.sample_format {
                hound::SampleFormat::Int => {
                    for sample in reader.samples::<i32>() {
                        writer.write_sample(sample?)?;
                    }
                }
                hound::SampleFormat::Float => {
                    for sample in reader.samples::<f32>() {
                        writer.write_sample(sample?)?;
                    }
                }
            }
        }
        writer.finalize()?;
    }
    Ok(out.into_inner())
}
