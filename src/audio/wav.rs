//! RIFF/WAVE frame validation and PCM utilities.
//!
//! Clients send complete WAV containers per frame: PCM, mono, 16 kHz,
//! 16-bit. Anything else is rejected with `InvalidFrame`.

use crate::error::{Result, SamtaleError};

/// Required sample rate for inbound frames.
pub const SAMPLE_RATE: u32 = 16_000;
/// Required bits per sample.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Parsed layout of a validated WAV frame.
#[derive(Debug, Clone, Copy)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Byte offset of the PCM payload within the frame.
    pub data_offset: usize,
    /// Byte length of the PCM payload.
    pub data_len: usize,
}

impl WavInfo {
    /// Duration of the payload in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_second =
            self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8);
        if bytes_per_second == 0 {
            return 0;
        }
        self.data_len as u64 * 1000 / bytes_per_second
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let chunk: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(chunk))
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let chunk: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(chunk))
}

/// Validate a frame as a complete PCM/mono/16 kHz/16-bit WAV container.
pub fn validate_frame(bytes: &[u8]) -> Result<WavInfo> {
    if bytes.len() < 44 {
        return Err(SamtaleError::InvalidFrame(format!(
            "frame too small ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(SamtaleError::InvalidFrame(
            "missing RIFF/WAVE header".to_string(),
        ));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<(usize, usize)> = None;

    // Walk chunks after the 12-byte RIFF header. Chunk payloads are padded
    // to even length.
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let chunk_id = &bytes[offset..offset + 4];
        let chunk_size = read_u32(bytes, offset + 4)
            .ok_or_else(|| SamtaleError::InvalidFrame("truncated chunk header".to_string()))?
            as usize;
        let payload_start = offset + 8;

        if payload_start + chunk_size > bytes.len() {
            return Err(SamtaleError::InvalidFrame(format!(
                "chunk '{}' overruns frame",
                String::from_utf8_lossy(chunk_id)
            )));
        }

        match chunk_id {
            b"fmt " => {
                if chunk_size < 16 {
                    return Err(SamtaleError::InvalidFrame("fmt chunk too small".to_string()));
                }
                let audio_format = read_u16(bytes, payload_start).unwrap_or(0);
                let channels = read_u16(bytes, payload_start + 2).unwrap_or(0);
                let sample_rate = read_u32(bytes, payload_start + 4).unwrap_or(0);
                let bits = read_u16(bytes, payload_start + 14).unwrap_or(0);
                fmt = Some((audio_format, channels, sample_rate, bits));
            }
            b"data" => {
                data = Some((payload_start, chunk_size));
            }
            _ => {}
        }

        offset = payload_start + chunk_size + (chunk_size & 1);
    }

    let (audio_format, channels, sample_rate, bits) = fmt
        .ok_or_else(|| SamtaleError::InvalidFrame("missing fmt chunk".to_string()))?;
    let (data_offset, data_len) =
        data.ok_or_else(|| SamtaleError::InvalidFrame("missing data chunk".to_string()))?;

    if audio_format != 1 {
        return Err(SamtaleError::InvalidFrame(format!(
            "unsupported audio format {} (PCM required)",
            audio_format
        )));
    }
    if channels != 1 {
        return Err(SamtaleError::InvalidFrame(format!(
            "{} channels (mono required)",
            channels
        )));
    }
    if sample_rate != SAMPLE_RATE {
        return Err(SamtaleError::InvalidFrame(format!(
            "sample rate {} ({} required)",
            sample_rate, SAMPLE_RATE
        )));
    }
    if bits != BITS_PER_SAMPLE {
        return Err(SamtaleError::InvalidFrame(format!(
            "{} bits per sample ({} required)",
            bits, BITS_PER_SAMPLE
        )));
    }
    if data_len == 0 {
        return Err(SamtaleError::InvalidFrame("empty data chunk".to_string()));
    }

    Ok(WavInfo {
        sample_rate,
        channels,
        bits_per_sample: bits,
        data_offset,
        data_len,
    })
}

/// Merge validated frames into a single WAV container by concatenating
/// their PCM payloads under one synthesized header.
pub fn merge_frames(frames: &[(Vec<u8>, WavInfo)]) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(SamtaleError::InvalidFrame("no frames to merge".to_string()));
    }

    let total_pcm: usize = frames.iter().map(|(_, info)| info.data_len).sum();
    let mut out = Vec::with_capacity(44 + total_pcm);

    let byte_rate = SAMPLE_RATE * (BITS_PER_SAMPLE as u32 / 8);
    let block_align = BITS_PER_SAMPLE / 8;

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + total_pcm) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(total_pcm as u32).to_le_bytes());

    for (bytes, info) in frames {
        out.extend_from_slice(&bytes[info.data_offset..info.data_offset + info.data_len]);
    }

    Ok(out)
}

/// RMS level of a 16-bit PCM payload, scaled to 0-100.
pub fn rms_level(pcm: &[u8]) -> u8 {
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    if samples.is_empty() {
        return 0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    let level = rms / i16::MAX as f64 * 100.0;
    level.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
pub(crate) fn make_test_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let byte_rate = sample_rate * channels as u32 * 2;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + pcm.len()) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(&pcm);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_good_frame() {
        let wav = make_test_wav(16_000, 1, &[0, 100, -100, 3000]);
        let info = validate_frame(&wav).unwrap();
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.data_len, 8);
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut wav = make_test_wav(16_000, 1, &[0; 16]);
        wav[0..4].copy_from_slice(b"OGGS");
        assert!(matches!(
            validate_frame(&wav),
            Err(SamtaleError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_reject_wrong_rate_and_channels() {
        let wav = make_test_wav(44_100, 1, &[0; 16]);
        assert!(validate_frame(&wav).is_err());

        let wav = make_test_wav(16_000, 2, &[0; 16]);
        assert!(validate_frame(&wav).is_err());
    }

    #[test]
    fn test_reject_truncated() {
        let wav = make_test_wav(16_000, 1, &[0; 16]);
        assert!(validate_frame(&wav[..20]).is_err());
    }

    #[test]
    fn test_merge_concatenates_pcm() {
        let a = make_test_wav(16_000, 1, &[1, 2]);
        let b = make_test_wav(16_000, 1, &[3, 4, 5]);
        let ia = validate_frame(&a).unwrap();
        let ib = validate_frame(&b).unwrap();

        let merged = merge_frames(&[(a, ia), (b, ib)]).unwrap();
        let info = validate_frame(&merged).unwrap();
        assert_eq!(info.data_len, 10);

        let pcm = &merged[info.data_offset..info.data_offset + info.data_len];
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0);

        let silence = vec![0u8; 64];
        assert_eq!(rms_level(&silence), 0);

        let loud: Vec<u8> = std::iter::repeat(i16::MAX)
            .take(32)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(rms_level(&loud), 100);
    }

    #[test]
    fn test_duration_ms() {
        // 16000 samples = 1 second
        let wav = make_test_wav(16_000, 1, &vec![0i16; 16_000]);
        let info = validate_frame(&wav).unwrap();
        assert_eq!(info.duration_ms(), 1000);
    }
}
