//! The whole run as one file, for saving and for seekable replay.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use rodio::{Decoder, OutputStream, Sink};
use tracing::{info, warn};

use crate::error::ClientError;
use crate::sniff::AudioFormat;
use crate::state::AudioSegment;
use crate::wav;

#[derive(Debug, Clone, PartialEq)]
pub struct FinalAsset {
    pub format: AudioFormat,
    pub bytes: Bytes,
    pub segment_count: usize,
}

impl FinalAsset {
    /// Assemble every segment received so far. `None` when nothing arrived.
    pub fn finalize(format: Option<AudioFormat>, segments: &[AudioSegment]) -> Option<Self> {
        let format = format?;
        if segments.is_empty() {
            return None;
        }

        let bytes = match format {
            AudioFormat::Pcm => wav::build_container(&segments.iter().map(|s| &s.bytes).collect::<Vec<_>>()),
            AudioFormat::Wav => wav::build_container(
                &segments
                    .iter()
                    .map(|s| wav::strip_header(&s.bytes))
                    .collect::<Vec<_>>(),
            ),
            AudioFormat::Encoded(_) => segments.iter().flat_map(|s| s.bytes.iter().copied()).collect(),
        };

        info!(
            "Assembled {} asset from {} segments ({} bytes)",
            format,
            segments.len(),
            bytes.len()
        );
        Some(Self {
            format,
            bytes: Bytes::from(bytes),
            segment_count: segments.len(),
        })
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Playing time, when the container says so.
    pub fn duration(&self) -> Option<Duration> {
        match self.format {
            AudioFormat::Pcm | AudioFormat::Wav => wav::duration(&self.bytes),
            AudioFormat::Encoded(_) => None,
        }
    }

    /// Write the asset, adding the format's extension when `path` has none.
    pub fn save(&self, path: &Path) -> Result<PathBuf, ClientError> {
        let path = if path.extension().is_none() {
            path.with_extension(self.extension())
        } else {
            path.to_path_buf()
        };
        std::fs::write(&path, &self.bytes)?;
        info!("Audio saved to {}", path.display());
        Ok(path)
    }
}

/// Seekable playback of a finished asset.
pub struct AssetPlayer {
    _stream: OutputStream,
    sink: Sink,
}

impl AssetPlayer {
    pub fn open(asset: &FinalAsset, from: Duration) -> Result<Self, ClientError> {
        let (stream, handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&handle)?;
        sink.append(Decoder::new(Cursor::new(asset.bytes.clone()))?);

        let player = Self {
            _stream: stream,
            sink,
        };
        if !from.is_zero() {
            player.seek(from);
        }
        Ok(player)
    }

    pub fn seek(&self, to: Duration) {
        match self.sink.try_seek(to) {
            Ok(()) => info!("Seeked to {:.1}s", to.as_secs_f64()),
            Err(e) => warn!("Seek to {:.1}s failed: {}", to.as_secs_f64(), e),
        }
    }

    pub fn toggle_pause(&self) {
        if self.sink.is_paused() {
            self.sink.play();
        } else {
            self.sink.pause();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.sink.is_paused()
    }

    pub fn position(&self) -> Duration {
        self.sink.get_pos()
    }

    pub fn is_finished(&self) -> bool {
        self.sink.empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::Codec;

    fn segment(seq: u64, format: AudioFormat, bytes: Vec<u8>) -> AudioSegment {
        AudioSegment {
            chunk_index: seq as u32 + 1,
            seq,
            format,
            bytes: Bytes::from(bytes),
        }
    }

    #[test]
    fn test_nothing_to_assemble() {
        assert!(FinalAsset::finalize(None, &[]).is_none());
        assert!(FinalAsset::finalize(Some(AudioFormat::Pcm), &[]).is_none());
    }

    #[test]
    fn test_pcm_wrapped_once() {
        let segments = vec![
            segment(0, AudioFormat::Pcm, vec![1, 0, 2, 0]),
            segment(1, AudioFormat::Pcm, vec![3, 0]),
        ];
        let asset = FinalAsset::finalize(Some(AudioFormat::Pcm), &segments).unwrap();

        assert_eq!(asset.extension(), "wav");
        assert_eq!(asset.bytes.len(), wav::HEADER_LEN + 6);
        assert_eq!(wav::strip_header(&asset.bytes), [1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn test_wav_segments_rewrapped() {
        let segments = vec![
            segment(0, AudioFormat::Wav, wav::build_container(&[vec![1, 0]])),
            segment(1, AudioFormat::Wav, wav::build_container(&[vec![2, 0, 3, 0]])),
        ];
        let asset = FinalAsset::finalize(Some(AudioFormat::Wav), &segments).unwrap();

        assert_eq!(&asset.bytes[..4], b"RIFF");
        assert_eq!(wav::strip_header(&asset.bytes), [1, 0, 2, 0, 3, 0]);
        assert_eq!(asset.duration(), Some(Duration::from_secs_f64(3.0 / 48000.0)));
    }

    #[test]
    fn test_encoded_concatenated() {
        let segments = vec![
            segment(0, AudioFormat::Encoded(Codec::Mp3), vec![0xFF, 0xFB, 1]),
            segment(1, AudioFormat::Encoded(Codec::Mp3), vec![0xFF, 0xFB, 2]),
        ];
        let asset = FinalAsset::finalize(Some(AudioFormat::Encoded(Codec::Mp3)), &segments).unwrap();

        assert_eq!(asset.bytes.as_ref(), [0xFF, 0xFB, 1, 0xFF, 0xFB, 2]);
        assert_eq!(asset.extension(), "mp3");
        assert_eq!(asset.duration(), None);
    }

    #[test]
    fn test_ogg_saved_as_ogg() {
        let dir = std::env::temp_dir().join(format!("say-asset-ogg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let ogg = AudioFormat::Encoded(Codec::Ogg);
        let asset = FinalAsset::finalize(Some(ogg), &[segment(0, ogg, b"OggS\x00\x02".to_vec())]).unwrap();
        assert_eq!(asset.extension(), "ogg");
        assert_eq!(asset.save(&dir.join("article")).unwrap(), dir.join("article.ogg"));
    }

    #[test]
    fn test_save_adds_extension() {
        let dir = std::env::temp_dir().join(format!("say-asset-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let asset = FinalAsset::finalize(
            Some(AudioFormat::Pcm),
            &[segment(0, AudioFormat::Pcm, vec![0, 0])],
        )
        .unwrap();
        let saved = asset.save(&dir.join("article")).unwrap();
        assert_eq!(saved, dir.join("article.wav"));
        assert_eq!(std::fs::read(&saved).unwrap(), asset.bytes.as_ref());

        let kept = asset.save(&dir.join("custom.raw")).unwrap();
        assert_eq!(kept, dir.join("custom.raw"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
