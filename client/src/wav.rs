//! WAV container assembly for raw PCM segments.

use std::io::Cursor;
use std::time::Duration;

use say_protocol::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};

pub const HEADER_LEN: usize = 44;

const DATA_MARKER: &[u8; 4] = b"data";

/// Payload of a WAV segment: everything after the `data` marker and its
/// size field. Input without a marker is returned whole.
pub fn strip_header(wav: &[u8]) -> &[u8] {
    if wav.len() <= 8 {
        return wav;
    }
    match (0..wav.len() - 8).find(|&i| &wav[i..i + 4] == DATA_MARKER) {
        Some(i) => &wav[i + 8..],
        None => wav,
    }
}

/// One canonical 44-byte PCM WAV (mono, 16-bit, 48 kHz) holding every
/// chunk's bytes in order.
pub fn build_container<T: AsRef<[u8]>>(pcm_chunks: &[T]) -> Vec<u8> {
    let data_len: usize = pcm_chunks.iter().map(|c| c.as_ref().len()).sum();
    let data_size = u32::try_from(data_len).unwrap_or(u32::MAX - 36);

    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * block_align as u32;

    let mut out = Vec::with_capacity(HEADER_LEN + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&CHANNELS.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    out.extend_from_slice(DATA_MARKER);
    out.extend_from_slice(&data_size.to_le_bytes());

    for chunk in pcm_chunks {
        out.extend_from_slice(chunk.as_ref());
    }
    out
}

/// Playing time of a WAV buffer according to its header.
pub fn duration(wav: &[u8]) -> Option<Duration> {
    let reader = hound::WavReader::new(Cursor::new(wav)).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(
        reader.duration() as f64 / spec.sample_rate as f64,
    ))
}
