//! Audio duration derivation.
//!
//! Backends do not always report how long their audio is. The playback
//! fallback timer needs a number, so it is derived here: from the fixed
//! header fields of a WAV container, or by walking the packets of a
//! compressed stream. Neither path ever fails the caller; an unreadable
//! artifact simply has a duration of 0.

use crate::error::VoiceError;
use parley_types::{AudioFormat, AudioPayload, SpeechArtifact};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Size of the canonical RIFF/WAVE header.
pub const WAV_HEADER_LEN: usize = 44;

/// Sample rate assumed for headerless PCM (16-bit mono), the raw output
/// format of OpenAI-compatible speech servers.
pub const PCM_SAMPLE_RATE: u32 = 24_000;

const CHANNELS_OFFSET: usize = 22;
const SAMPLE_RATE_OFFSET: usize = 24;
const BITS_PER_SAMPLE_OFFSET: usize = 34;

fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Duration in milliseconds of a canonical PCM WAV buffer.
///
/// Reads channel count, sample rate and bits per sample from their fixed
/// header offsets. Buffers shorter than the header, or with zero-valued
/// fields, yield 0.
pub fn wav_duration_ms(bytes: &[u8]) -> u64 {
    if bytes.len() < WAV_HEADER_LEN {
        return 0;
    }
    let channels = u64::from(read_u16_le(bytes, CHANNELS_OFFSET));
    let sample_rate = u64::from(read_u32_le(bytes, SAMPLE_RATE_OFFSET));
    let bits_per_sample = u64::from(read_u16_le(bytes, BITS_PER_SAMPLE_OFFSET));
    let bytes_per_frame = channels * bits_per_sample / 8;
    if bytes_per_frame == 0 || sample_rate == 0 {
        return 0;
    }
    let frames = (bytes.len() - WAV_HEADER_LEN) as u64 / bytes_per_frame;
    frames * 1000 / sample_rate
}

/// Duration in milliseconds of headerless 16-bit mono PCM.
pub fn pcm_duration_ms(bytes: &[u8]) -> u64 {
    (bytes.len() as u64 / 2) * 1000 / u64::from(PCM_SAMPLE_RATE)
}

/// Decodes a compressed stream for its duration in milliseconds.
///
/// Uses the container's frame count when present and otherwise walks every
/// packet of the default track, summing packet durations.
pub fn decode_duration_ms(bytes: Vec<u8>, format: AudioFormat) -> Result<u64, VoiceError> {
    let mss = MediaSourceStream::new(
        Box::new(std::io::Cursor::new(bytes)),
        MediaSourceStreamOptions::default(),
    );
    let mut hint = Hint::new();
    hint.with_extension(format.as_str());

    let detected = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Duration(e.to_string()))?;
    let mut reader = detected.format;

    let track = reader
        .default_track()
        .ok_or_else(|| VoiceError::Duration("no audio track found".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let frames = match params.n_frames {
        Some(n) => n,
        None => {
            let mut total = 0u64;
            loop {
                match reader.next_packet() {
                    Ok(packet) if packet.track_id() == track_id => total += packet.dur(),
                    Ok(_) => {}
                    Err(symphonia::core::errors::Error::IoError(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break
                    }
                    Err(e) => return Err(VoiceError::Duration(e.to_string())),
                }
            }
            total
        }
    };

    if let Some(time_base) = params.time_base {
        let time = time_base.calc_time(frames);
        return Ok(time.seconds * 1000 + (time.frac * 1000.0).round() as u64);
    }
    match params.sample_rate {
        Some(rate) if rate > 0 => Ok(frames * 1000 / u64::from(rate)),
        _ => Err(VoiceError::Duration(
            "stream has neither time base nor sample rate".to_string(),
        )),
    }
}

/// Reads the encoded bytes behind an artifact.
pub async fn artifact_bytes(artifact: &SpeechArtifact) -> Result<Vec<u8>, VoiceError> {
    match artifact.payload() {
        None => Ok(Vec::new()),
        Some(AudioPayload::File(path)) => Ok(tokio::fs::read(path).await?),
        Some(payload) => Ok(payload.to_bytes()?.unwrap_or_default()),
    }
}

/// Duration of an artifact in milliseconds.
///
/// Trusts the producer's reported duration; otherwise derives it from the
/// audio itself. Any failure is logged and reported as 0.
pub async fn resolve_duration_ms(artifact: &SpeechArtifact) -> u64 {
    if let Some(reported) = artifact.duration_ms() {
        return reported;
    }
    if artifact.is_empty() {
        return 0;
    }

    let bytes = match artifact_bytes(artifact).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read artifact for duration");
            return 0;
        }
    };

    let format = artifact.format();
    let duration = match format {
        AudioFormat::Wav => wav_duration_ms(&bytes),
        AudioFormat::Pcm => pcm_duration_ms(&bytes),
        _ => {
            match tokio::task::spawn_blocking(move || decode_duration_ms(bytes, format)).await {
                Ok(Ok(ms)) => ms,
                Ok(Err(e)) => {
                    tracing::warn!(%format, error = %e, "failed to measure audio duration");
                    0
                }
                Err(e) => {
                    tracing::warn!(%format, error = %e, "duration task failed");
                    0
                }
            }
        }
    };
    tracing::debug!(%format, duration_ms = duration, "derived artifact duration");
    duration
}

#[cfg(test)]
pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, bits: u16, data_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    let block_align = channels * bits / 8;
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    out.resize(WAV_HEADER_LEN + data_len, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_duration_from_header_fields() {
        // 1 second of 16 kHz, 16-bit mono
        assert_eq!(wav_duration_ms(&wav_bytes(16_000, 1, 16, 32_000)), 1000);
        // 500 ms of 24 kHz, 16-bit stereo
        assert_eq!(wav_duration_ms(&wav_bytes(24_000, 2, 16, 48_000)), 500);
    }

    #[test]
    fn short_header_yields_zero() {
        assert_eq!(wav_duration_ms(&[]), 0);
        assert_eq!(wav_duration_ms(&[0u8; WAV_HEADER_LEN - 1]), 0);
    }

    #[test]
    fn zeroed_header_yields_zero() {
        assert_eq!(wav_duration_ms(&[0u8; 128]), 0);
    }

    #[test]
    fn pcm_duration_assumes_mono_16_bit() {
        assert_eq!(pcm_duration_ms(&vec![0u8; 48_000]), 1000);
    }

    #[test]
    fn decoding_garbage_is_an_error() {
        let result = decode_duration_ms(vec![0x42; 64], AudioFormat::Mp3);
        assert!(matches!(result, Err(VoiceError::Duration(_))));
    }

    #[test]
    fn decoder_reads_wav_container() {
        let ms = decode_duration_ms(wav_bytes(8_000, 1, 16, 16_000), AudioFormat::Wav).unwrap();
        assert_eq!(ms, 1000);
    }

    #[tokio::test]
    async fn reported_duration_is_trusted() {
        let artifact =
            SpeechArtifact::from_bytes(vec![1, 2, 3], AudioFormat::Mp3).with_duration_ms(1234);
        assert_eq!(resolve_duration_ms(&artifact).await, 1234);
    }

    #[tokio::test]
    async fn undecodable_artifact_resolves_to_zero() {
        let artifact = SpeechArtifact::from_bytes(vec![0x42; 64], AudioFormat::Mp3);
        assert_eq!(resolve_duration_ms(&artifact).await, 0);

        let missing = SpeechArtifact::from_file("/nonexistent/parley/reply.wav");
        assert_eq!(resolve_duration_ms(&missing).await, 0);
    }

    #[tokio::test]
    async fn wav_file_duration_is_derived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reply.wav");
        std::fs::write(&path, wav_bytes(16_000, 1, 16, 16_000)).unwrap();
        assert_eq!(
            resolve_duration_ms(&SpeechArtifact::from_file(&path)).await,
            500
        );
    }
}
