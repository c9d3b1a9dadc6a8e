//! Decoding of uploaded audio into 16 kHz mono f32 samples.

use std::io::Cursor;
use std::path::Path;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

/// Sample rate whisper models are trained on.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("unrecognised audio container: {0}")]
    Probe(String),
    #[error("no audio track found")]
    NoTrack,
    #[error("unsupported codec: {0}")]
    Codec(String),
    #[error("failed to decode audio: {0}")]
    Decode(String),
    #[error("audio contains no samples")]
    Empty,
    #[error("failed to resample audio: {0}")]
    Resample(String),
}

#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono samples at [`TARGET_SAMPLE_RATE`].
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
    pub source_channels: usize,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(TARGET_SAMPLE_RATE)
    }
}

/// Decode an uploaded file. The filename extension, if any, is used as a probe hint.
pub fn decode_audio(data: Vec<u8>, filename: Option<&str>) -> Result<DecodedAudio, AudioError> {
    if data.is_empty() {
        return Err(AudioError::Empty);
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
    {
        hint.with_extension(&ext.to_ascii_lowercase());
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Probe(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(AudioError::NoTrack)?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;
    let mut source_rate = None;
    let mut source_channels = codec_params.channels.map_or(1, |c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Codec(e.to_string()))?;

    let mut mono: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt frames are skipped rather than failing the whole file.
            Err(SymphoniaError::DecodeError(err)) => {
                debug!("Skipping undecodable packet: {}", err);
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        observe_rate(&mut source_rate, spec.rate)?;
        let channels = spec.channels.count().max(1);
        source_channels = channels;

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let samples = sample_buf.samples();

        if channels > 1 {
            mono.extend(
                samples
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        } else {
            mono.extend_from_slice(samples);
        }
    }

    let Some(source_rate) = source_rate.filter(|_| !mono.is_empty()) else {
        return Err(AudioError::Empty);
    };
    if codec_params.sample_rate.is_some_and(|declared| declared != source_rate) {
        debug!(
            "Container declares {:?}Hz but frames decode at {}Hz",
            codec_params.sample_rate, source_rate
        );
    }

    let samples = if source_rate != TARGET_SAMPLE_RATE {
        resample(&mono, source_rate, TARGET_SAMPLE_RATE)?
    } else {
        mono
    };

    debug!(
        "Decoded audio: {}Hz x{} -> {} samples @ {}Hz",
        source_rate,
        source_channels,
        samples.len(),
        TARGET_SAMPLE_RATE
    );

    Ok(DecodedAudio {
        samples,
        source_sample_rate: source_rate,
        source_channels,
    })
}

/// Records the rate of the first decoded frame and rejects streams whose
/// rate changes afterwards.
fn observe_rate(current: &mut Option<u32>, rate: u32) -> Result<u32, AudioError> {
    if rate == 0 {
        return Err(AudioError::Decode("frame reports a zero sample rate".into()));
    }
    match *current {
        Some(first) if first != rate => Err(AudioError::Decode(format!(
            "sample rate changes mid-stream ({first}Hz to {rate}Hz)"
        ))),
        Some(first) => Ok(first),
        None => {
            *current = Some(rate);
            Ok(rate)
        }
    }
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let expected_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(expected_len + RESAMPLE_CHUNK);

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK, 0.0);

        let resampled = resampler
            .process(&[input], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;

        if let Some(channel) = resampled.first() {
            output.extend_from_slice(channel);
        }
    }

    // Drop the zero padding added to the final chunk.
    output.truncate(expected_len);
    Ok(output)
}
