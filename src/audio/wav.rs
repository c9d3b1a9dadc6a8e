//! 16-bit PCM WAV encoding of decoded audio, the input format whisper-cli reads.

use anyhow::{bail, Result};
use tracing::debug;

const HEADER_LEN: usize = 44;
const BYTES_PER_SAMPLE: u16 = 2;
const FORMAT_PCM: u16 = 1;

/// Encodes mono `f32` samples in `[-1.0, 1.0]` as a canonical 16-bit WAV file.
pub fn pcm_f32_to_wav_bytes(samples: &[f32], sample_rate_hz: u32) -> Result<Vec<u8>> {
    if sample_rate_hz == 0 {
        bail!("Sample rate must be greater than zero");
    }

    let Some(data_len) = samples
        .len()
        .checked_mul(usize::from(BYTES_PER_SAMPLE))
        .and_then(|len| u32::try_from(len).ok())
        .filter(|len| len.checked_add(HEADER_LEN as u32).is_some())
    else {
        bail!("Audio too long for a WAV container");
    };

    let mut out = Vec::with_capacity(HEADER_LEN + data_len as usize);
    write_header(&mut out, sample_rate_hz, data_len);
    out.extend(samples.iter().flat_map(|&s| quantize(s).to_le_bytes()));

    debug!(
        "Encoded {:.2}s of audio as WAV ({} bytes)",
        samples.len() as f64 / f64::from(sample_rate_hz),
        out.len()
    );

    Ok(out)
}

fn quantize(sample: f32) -> i16 {
    (sample * f32::from(i16::MAX)).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn write_header(out: &mut Vec<u8>, sample_rate_hz: u32, data_len: u32) {
    let block_align = BYTES_PER_SAMPLE;
    let byte_rate = sample_rate_hz * u32::from(block_align);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(HEADER_LEN as u32 - 8 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate_hz.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&(BYTES_PER_SAMPLE * 8).to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_quantized_samples() {
        let samples = [0.0_f32, 0.5, -0.5, 1.0, -2.0];
        let bytes = pcm_f32_to_wav_bytes(&samples, 16_000).unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(bytes.len(), HEADER_LEN + samples.len() * 2);

        let riff_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(riff_len as usize, bytes.len() - 8);
        let rate = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        assert_eq!(rate, 16_000);

        let sample = |i: usize| i16::from_le_bytes([bytes[44 + 2 * i], bytes[45 + 2 * i]]);
        assert_eq!(sample(0), 0);
        assert!((16_000..17_000).contains(&sample(1)));
        assert_eq!(sample(3), i16::MAX);
        assert_eq!(sample(4), i16::MIN);
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let err = pcm_f32_to_wav_bytes(&[0.0], 0).unwrap_err();
        assert!(err.to_string().contains("Sample rate"));
    }

    #[test]
    fn decodes_back_through_symphonia() {
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 / 1600.0) - 0.5).collect();
        let wav = pcm_f32_to_wav_bytes(&samples, 16_000).unwrap();
        let decoded = crate::audio::decode_audio(wav, Some("clip.wav")).unwrap();
        assert_eq!(decoded.samples.len(), samples.len());
        assert_eq!(decoded.source_sample_rate, 16_000);
    }
}
