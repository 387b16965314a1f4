//! RIFF/WAVE writer and reader for float32 renders.
//!
//! Fixed 44-byte header, format code 3 (IEEE float), 32 bits per
//! sample, little-endian interleaved channels.

use std::io::Write;

#[derive(Debug, PartialEq, Eq)]
pub enum WavError {
    /// Missing RIFF/WAVE magic or truncated header
    InvalidHeader,
    /// Format code or bit depth other than float32
    UnsupportedFormat,
    /// Data chunk shorter than its declared size
    TruncatedData,
}

impl std::fmt::Display for WavError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WavError::InvalidHeader => write!(f, "invalid WAV header"),
            WavError::UnsupportedFormat => write!(f, "unsupported WAV format (want float32)"),
            WavError::TruncatedData => write!(f, "truncated WAV data chunk"),
        }
    }
}

impl std::error::Error for WavError {}

/// Encode interleaved samples into a complete WAV byte vector.
pub fn encode_wav_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(44 + samples.len() * 4);
    write_wav_f32(&mut out, samples, sample_rate, channels).expect("Vec<u8> write cannot fail");
    out
}

/// Write a WAV stream to any sink.
pub fn write_wav_f32(
    w: &mut impl Write,
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
) -> std::io::Result<()> {
    let bits_per_sample: u16 = 32;
    let block_align = channels * (bits_per_sample / 8);
    let data_size = samples.len() as u32 * 4;

    write_riff_header(w, data_size)?;
    write_fmt_chunk(w, channels, sample_rate, block_align, bits_per_sample)?;
    write_data_chunk(w, samples, data_size)
}

/// Parse a float32 WAV produced by [`encode_wav_f32`] (or compatible).
/// Returns (samples, sample_rate, channels).
pub fn decode_wav_f32(data: &[u8]) -> Result<(Vec<f32>, u32, u16), WavError> {
    if data.len() < 44 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(WavError::InvalidHeader);
    }
    if &data[12..16] != b"fmt " {
        return Err(WavError::InvalidHeader);
    }
    let format_code = u16::from_le_bytes([data[20], data[21]]);
    let channels = u16::from_le_bytes([data[22], data[23]]);
    let sample_rate = u32::from_le_bytes([data[24], data[25], data[26], data[27]]);
    let bits = u16::from_le_bytes([data[34], data[35]]);
    if format_code != 3 || bits != 32 {
        return Err(WavError::UnsupportedFormat);
    }
    if &data[36..40] != b"data" {
        return Err(WavError::InvalidHeader);
    }
    let data_size = u32::from_le_bytes([data[40], data[41], data[42], data[43]]) as usize;
    let body = &data[44..];
    if body.len() < data_size {
        return Err(WavError::TruncatedData);
    }
    let samples = body[..data_size]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((samples, sample_rate, channels))
}

fn write_riff_header(w: &mut impl Write, data_size: u32) -> std::io::Result<()> {
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_size).to_le_bytes())?;
    w.write_all(b"WAVE")
}

fn write_fmt_chunk(
    w: &mut impl Write,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
) -> std::io::Result<()> {
    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&3u16.to_le_bytes())?;
    w.write_all(&channels.to_le_bytes())?;
    w.write_all(&sample_rate.to_le_bytes())?;
    w.write_all(&(sample_rate * block_align as u32).to_le_bytes())?;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&bits_per_sample.to_le_bytes())
}

fn write_data_chunk(w: &mut impl Write, samples: &[f32], data_size: u32) -> std::io::Result<()> {
    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;
    for s in samples {
        w.write_all(&s.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let wav = encode_wav_f32(&[0.0, 0.5, -0.5, 1.0], 48000, 2);
        assert_eq!(wav.len(), 44 + 16);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // Format code 3 = IEEE float.
        assert_eq!(u16::from_le_bytes([wav[20], wav[21]]), 3);
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 2);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 32);
    }

    #[test]
    fn encode_decode_round_trips_exactly() {
        let samples: Vec<f32> = (0..1000).map(|i| ((i as f32) * 0.01).sin()).collect();
        let wav = encode_wav_f32(&samples, 48000, 2);
        let (decoded, rate, channels) = decode_wav_f32(&wav).unwrap();
        assert_eq!(decoded, samples);
        assert_eq!(rate, 48000);
        assert_eq!(channels, 2);
        // And back again, byte for byte.
        assert_eq!(encode_wav_f32(&decoded, rate, channels), wav);
    }

    #[test]
    fn decode_rejects_non_float_formats() {
        let mut wav = encode_wav_f32(&[0.0; 4], 44100, 1);
        wav[20] = 1; // integer PCM
        assert_eq!(decode_wav_f32(&wav), Err(WavError::UnsupportedFormat));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_wav_f32(b"nope"), Err(WavError::InvalidHeader));
    }
}
