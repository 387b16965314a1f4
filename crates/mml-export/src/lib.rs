//! WAV encoding for 32-bit IEEE-float PCM.

mod wav;

pub use wav::{decode_wav_f32, encode_wav_f32, WavError};
