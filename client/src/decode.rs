//! Segment decoding into 48 kHz mono float buffers.
//!
//! Decodes run on the blocking pool and may finish in any order. Every
//! submission carries a sequence number so the scheduler can restore
//! arrival order before anything reaches the output.

use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use rodio::source::UniformSourceIterator;
use rodio::Decoder;
use tokio::sync::mpsc;
use tracing::debug;

use say_protocol::{CHANNELS, SAMPLE_RATE};

use crate::error::DecodeError;
use crate::sniff::AudioFormat;

/// Decoded samples of one segment, ready to be scheduled once.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
}

impl PlaybackBuffer {
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// Signed 16-bit little-endian PCM. A dangling odd byte is ignored.
    pub fn from_pcm(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Length in seconds at the output rate.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Linear ramp over the first and last `fade_len` samples.
    pub fn apply_fades(&mut self, fade_len: usize) {
        let len = self.samples.len();
        for i in 0..fade_len.min(len) {
            let gain = i as f32 / fade_len as f32;
            self.samples[i] *= gain;
            self.samples[len - 1 - i] *= gain;
        }
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Decode one segment according to the run's format.
pub fn decode_segment(format: AudioFormat, bytes: Bytes) -> Result<PlaybackBuffer, DecodeError> {
    let buffer = match format {
        AudioFormat::Pcm => PlaybackBuffer::from_pcm(&bytes),
        AudioFormat::Wav | AudioFormat::Encoded(_) => {
            let decoder = Decoder::new(Cursor::new(bytes))?;
            let uniform = UniformSourceIterator::<_, f32>::new(decoder, CHANNELS, SAMPLE_RATE);
            PlaybackBuffer::from_samples(uniform.collect())
        }
    };
    if buffer.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(buffer)
}

/// A finished decode, tagged with its submission order.
#[derive(Debug)]
pub struct Decoded {
    pub seq: u64,
    pub result: Result<PlaybackBuffer, DecodeError>,
}

/// Runs decodes off the event loop and hands results back as they finish.
pub struct SegmentDecoder {
    tx: mpsc::UnboundedSender<Decoded>,
    rx: mpsc::UnboundedReceiver<Decoded>,
    in_flight: usize,
}

impl Default for SegmentDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentDecoder {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, in_flight: 0 }
    }

    pub fn submit(&mut self, seq: u64, format: AudioFormat, bytes: Bytes) {
        self.in_flight += 1;
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| decode_segment(format, bytes)))
                .unwrap_or(Err(DecodeError::Crashed));
            if tx.send(Decoded { seq, result }).is_err() {
                debug!("Decode {} finished after the run was dropped", seq);
            }
        });
    }

    /// Decodes submitted but not yet returned by [`next`](Self::next).
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Next finished decode. Pends forever when nothing is in flight.
    pub async fn next(&mut self) -> Option<Decoded> {
        if self.in_flight == 0 {
            return std::future::pending().await;
        }
        let decoded = self.rx.recv().await;
        if decoded.is_some() {
            self.in_flight -= 1;
        }
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::Codec;
    use crate::wav;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_pcm_conversion() {
        let buffer = PlaybackBuffer::from_pcm(&pcm(&[0, 16384, -32768, 32767]));
        assert_eq!(buffer.samples()[..3], [0.0, 0.5, -1.0]);
        assert!((buffer.samples()[3] - 1.0).abs() < 1e-4);

        assert_eq!(PlaybackBuffer::from_pcm(&[1, 0, 7]).len(), 1);
    }

    #[test]
    fn test_fades_ramp_both_ends() {
        let mut buffer = PlaybackBuffer::from_samples(vec![1.0; 10]);
        buffer.apply_fades(4);
        assert_eq!(
            buffer.samples(),
            &[0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 0.75, 0.5, 0.25, 0.0]
        );

        let mut short = PlaybackBuffer::from_samples(vec![1.0; 2]);
        short.apply_fades(240);
        assert!(short.samples().iter().all(|s| *s < 0.01));
    }

    #[test]
    fn test_duration_at_output_rate() {
        let buffer = PlaybackBuffer::from_samples(vec![0.0; 24000]);
        assert_eq!(buffer.duration(), 0.5);
    }

    #[test]
    fn test_decode_wav_segment() {
        let samples: Vec<i16> = (0..4800).map(|i| (i % 100) as i16 * 100).collect();
        let container = wav::build_container(&[pcm(&samples)]);

        let buffer = decode_segment(AudioFormat::Wav, Bytes::from(container)).unwrap();
        assert_eq!(buffer.len(), 4800);
        assert!((buffer.samples()[1] - 100.0 / 32768.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_failures() {
        let garbage = Bytes::from_static(b"definitely not audio data at all");
        assert!(matches!(
            decode_segment(AudioFormat::Encoded(Codec::Mp3), garbage),
            Err(DecodeError::Unsupported(_))
        ));
        assert!(matches!(
            decode_segment(AudioFormat::Pcm, Bytes::from_static(&[1])),
            Err(DecodeError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_decoder_reports_every_submission() {
        let mut decoder = SegmentDecoder::new();
        decoder.submit(0, AudioFormat::Pcm, Bytes::from(pcm(&[1, 2, 3])));
        decoder.submit(1, AudioFormat::Pcm, Bytes::from_static(&[]));
        assert_eq!(decoder.in_flight(), 2);

        let mut seen = Vec::new();
        while decoder.in_flight() > 0 {
            let decoded = decoder.next().await.unwrap();
            seen.push((decoded.seq, decoded.result.is_ok()));
        }
        seen.sort();
        assert_eq!(seen, vec![(0, true), (1, false)]);
    }
}
