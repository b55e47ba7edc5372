//! Audio container detection from leading bytes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// Headerless signed 16-bit little-endian mono at 48 kHz
    Pcm,
    /// RIFF/WAVE, one container per segment
    Wav,
    /// Compressed stream, decoded by the audio backend
    Encoded(Codec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Mp3,
    Ogg,
}

impl AudioFormat {
    /// File extension for the assembled download.
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Pcm | AudioFormat::Wav => "wav",
            AudioFormat::Encoded(Codec::Mp3) => "mp3",
            AudioFormat::Encoded(Codec::Ogg) => "ogg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Pcm => "pcm",
            AudioFormat::Wav => "wav",
            AudioFormat::Encoded(Codec::Mp3) => "mp3",
            AudioFormat::Encoded(Codec::Ogg) => "ogg",
        };
        f.write_str(name)
    }
}

/// Classify a segment by its signature. Anything unrecognised, including
/// buffers shorter than four bytes, is raw PCM.
pub fn detect(bytes: &[u8]) -> AudioFormat {
    match bytes {
        [a, b, c, d, ..] => match (*a, *b, *c, *d) {
            (b'R', b'I', b'F', b'F') => AudioFormat::Wav,
            (0xFF, second, _, _) if second & 0xE0 == 0xE0 => AudioFormat::Encoded(Codec::Mp3),
            (b'I', b'D', b'3', _) => AudioFormat::Encoded(Codec::Mp3),
            (b'O', b'g', b'g', b'S') => AudioFormat::Encoded(Codec::Ogg),
            _ => AudioFormat::Pcm,
        },
        _ => AudioFormat::Pcm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(detect(b"RIFF\x24\x00\x00\x00WAVE"), AudioFormat::Wav);
        assert_eq!(detect(&[0xFF, 0xFB, 0x90, 0x64]), AudioFormat::Encoded(Codec::Mp3));
        assert_eq!(detect(&[0xFF, 0xE3, 0x00, 0x00]), AudioFormat::Encoded(Codec::Mp3));
        assert_eq!(detect(b"ID3\x04\x00"), AudioFormat::Encoded(Codec::Mp3));
        assert_eq!(detect(b"OggS\x00\x02"), AudioFormat::Encoded(Codec::Ogg));
    }

    #[test]
    fn test_extension_follows_codec() {
        assert_eq!(detect(b"OggS\x00\x02").extension(), "ogg");
        assert_eq!(detect(b"ID3\x04\x00").extension(), "mp3");
        assert_eq!(detect(b"RIFF\x24\x00\x00\x00WAVE").extension(), "wav");
        assert_eq!(detect(&[0x12, 0x00]).extension(), "wav");
    }

    #[test]
    fn test_short_or_unknown_is_pcm() {
        assert_eq!(detect(&[]), AudioFormat::Pcm);
        assert_eq!(detect(b"RIF"), AudioFormat::Pcm);
        assert_eq!(detect(&[0xFF, 0x10, 0x00, 0x00]), AudioFormat::Pcm);
        assert_eq!(detect(&[0x12, 0x00, 0xF0, 0xFF]), AudioFormat::Pcm);
    }

    #[test]
    fn test_deterministic() {
        let bytes = [0xFF, 0xF3, 0x44, 0xC4];
        assert_eq!(detect(&bytes), detect(&bytes));
    }
}
