//! Newline framing of the relay byte stream.
//!
//! The relay forwards backend bytes untouched and interleaves its own JSON
//! control records, each on a line of its own. A reader therefore splits the
//! concatenated binary payloads on `\n` and classifies every line:
//!
//! - a [`ControlRecord`] (`chunkComplete` / `error`)
//! - a backend audio line `{"result":{"audioContent":"<base64>"}}`
//! - any other JSON value, which carries nothing playable
//! - anything that is not JSON, which is raw audio payload
//!
//! Once a raw run has started, every line up to the next control record or
//! audio line is payload, JSON-looking or blank ones included. The relay
//! writes exactly one `\n` between payload and the record that follows it;
//! that newline is dropped, every other newline in a raw run is kept.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::ControlRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlRecord),
    /// Decoded `audioContent` of one backend line
    Audio(Vec<u8>),
    /// Raw payload bytes, in stream order
    Raw(Vec<u8>),
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct AudioLine {
    result: AudioResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioResult {
    audio_content: String,
}

/// Incremental line splitter over the relay byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    // Inside a raw payload run only a control record or an audio line ends
    // the run; every other line is payload.
    raw_open: bool,
    // Newline that ended the last raw line. It is payload unless a control
    // record comes next, in which case it was the relay's separator.
    held_newline: bool,
    // No line seen yet since the last control record.
    chunk_start: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            raw_open: false,
            held_newline: false,
            chunk_start: true,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = self.pending[start..end].to_vec();
            start = end + 1;
            self.classify(line, true, &mut frames);
        }
        self.pending.drain(..start);
        frames
    }

    /// Flush an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let line = std::mem::take(&mut self.pending);
        if !line.is_empty() {
            self.classify(line, false, &mut frames);
        }
        if std::mem::take(&mut self.held_newline) {
            frames.push(Frame::Raw(vec![b'\n']));
        }
        frames
    }

    fn classify(&mut self, line: Vec<u8>, terminated: bool, out: &mut Vec<Frame>) {
        if let Ok(record) = serde_json::from_slice::<ControlRecord>(&line) {
            self.raw_open = false;
            self.held_newline = false;
            self.chunk_start = true;
            out.push(Frame::Control(record));
            return;
        }

        if let Some(audio) = audio_content(&line) {
            if std::mem::take(&mut self.held_newline) {
                out.push(Frame::Raw(vec![b'\n']));
            }
            self.raw_open = false;
            self.chunk_start = false;
            out.push(Frame::Audio(audio));
            return;
        }

        if !self.raw_open {
            if line.iter().all(u8::is_ascii_whitespace) {
                // Blank lines between JSON lines carry nothing; at the start
                // of a chunk they are payload.
                if !self.chunk_start {
                    return;
                }
            } else if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&line) {
                self.chunk_start = false;
                out.push(Frame::Other(value));
                return;
            }
        }

        let mut payload = Vec::with_capacity(line.len() + 1);
        if std::mem::take(&mut self.held_newline) {
            payload.push(b'\n');
        }
        payload.extend_from_slice(&line);
        self.raw_open = true;
        self.chunk_start = false;
        self.held_newline = terminated;
        if !payload.is_empty() {
            out.push(Frame::Raw(payload));
        }
    }
}

fn audio_content(line: &[u8]) -> Option<Vec<u8>> {
    let audio: AudioLine = serde_json::from_slice(line).ok()?;
    STANDARD.decode(audio.result.audio_content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_line(bytes: &[u8]) -> String {
        format!("{{\"result\":{{\"audioContent\":\"{}\"}}}}\n", STANDARD.encode(bytes))
    }

    #[test]
    fn test_lines_split_across_pushes() {
        let mut decoder = FrameDecoder::new();
        let line = audio_line(&[1, 2, 3, 4]);
        let (head, tail) = line.as_bytes().split_at(10);

        assert!(decoder.push(head).is_empty());
        let frames = decoder.push(tail);
        assert_eq!(frames, vec![Frame::Audio(vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_control_and_audio_interleaved() {
        let mut decoder = FrameDecoder::new();
        let mut stream = audio_line(&[9, 9]);
        stream.push_str("{\"chunkComplete\":1,\"totalChunks\":2}\n");
        stream.push_str("{\"error\":\"Chunk 2 failed: 503\",\"chunkIndex\":2}\n");

        let frames = decoder.push(stream.as_bytes());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Frame::Audio(vec![9, 9]));
        assert_eq!(
            frames[1],
            Frame::Control(ControlRecord::ChunkComplete { chunk_complete: 1, total_chunks: 2 })
        );
        assert!(matches!(
            frames[2],
            Frame::Control(ControlRecord::Error { chunk_index: Some(2), .. })
        ));
    }

    fn raw_bytes(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|f| match f {
                Frame::Raw(bytes) => bytes.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_non_json_is_raw_payload() {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(&[0x01, 0x02, b'\n', b'\n', 0x03]);
        assert_eq!(frames, vec![Frame::Raw(vec![0x01, 0x02]), Frame::Raw(vec![b'\n'])]);
        frames.extend(decoder.finish());
        assert_eq!(raw_bytes(&frames), vec![0x01, 0x02, b'\n', b'\n', 0x03]);
    }

    #[test]
    fn test_separator_before_record_is_not_payload() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![0x10, 0x00, b'\n', 0x20, b'\n', b'\n'];
        stream.extend_from_slice(b"{\"chunkComplete\":1,\"totalChunks\":1}\n");

        let frames = decoder.push(&stream);
        let (raw, control) = frames.split_at(frames.len() - 1);
        assert_eq!(raw_bytes(raw), vec![0x10, 0x00, b'\n', 0x20, b'\n']);
        assert!(matches!(control[0], Frame::Control(_)));
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_json_looking_lines_inside_raw_run() {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(&[1, 2, b'\n', b'5', b'\n', b' ', b'\n', 3, 4, b'\n']);
        frames.extend(decoder.finish());
        assert_eq!(
            raw_bytes(&frames),
            vec![1, 2, b'\n', b'5', b'\n', b' ', b'\n', 3, 4, b'\n']
        );
    }

    #[test]
    fn test_leading_blank_line_of_chunk_is_payload() {
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(b"{\"chunkComplete\":1,\"totalChunks\":2}\n\n\x07\n");
        assert!(matches!(frames.remove(0), Frame::Control(_)));
        frames.extend(decoder.finish());
        assert_eq!(raw_bytes(&frames), vec![b'\n', 0x07, b'\n']);
    }

    #[test]
    fn test_blank_lines_between_json_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"{\"unexpected\":true}\n\n\n{\"unexpected\":false}\n");
        assert_eq!(
            frames,
            vec![
                Frame::Other(serde_json::json!({"unexpected": true})),
                Frame::Other(serde_json::json!({"unexpected": false})),
            ]
        );
    }

    #[test]
    fn test_bad_base64_is_not_audio() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"{\"result\":{\"audioContent\":\"***\"}}\n");
        assert!(matches!(frames[0], Frame::Other(_)));
    }
}
