pub mod decode;
pub mod wav;

pub use decode::{decode_audio, AudioError, DecodedAudio, TARGET_SAMPLE_RATE};
pub use wav::pcm_f32_to_wav_bytes;
