//! Splits long text into backend-sized chunks.
//!
//! Packing is greedy at three levels. Paragraphs (blank-line separated) are
//! joined with a blank line until the next one would overflow the limit. A
//! paragraph that is too long on its own is packed sentence by sentence, and
//! a sentence that is too long on its own is packed word by word. A single
//! word longer than the limit becomes its own oversized chunk.

use once_cell::sync::Lazy;
use regex::Regex;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid paragraph regex"));

// A run ending in terminal punctuation plus trailing whitespace, or the
// unterminated remainder of the text.
static SENTENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.!?]*[.!?]+\s*|[^.!?]+").expect("valid sentence regex"));

/// One backend request worth of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based position in the run
    pub index: u32,
    pub total: u32,
    pub content: String,
}

impl TextChunk {
    /// Number the pieces of a finished split.
    pub fn sequence(pieces: Vec<String>) -> Vec<TextChunk> {
        let total = pieces.len() as u32;
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| TextChunk {
                index: i as u32 + 1,
                total,
                content,
            })
            .collect()
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Paragraph,
    Sentence,
    Word,
}

impl Level {
    fn separator(self) -> &'static str {
        match self {
            Level::Paragraph => "\n\n",
            Level::Sentence | Level::Word => " ",
        }
    }

    fn finer(self) -> Option<Level> {
        match self {
            Level::Paragraph => Some(Level::Sentence),
            Level::Sentence => Some(Level::Word),
            Level::Word => None,
        }
    }

    fn pieces(self, text: &str) -> Vec<&str> {
        match self {
            Level::Paragraph => PARAGRAPH_BREAK.split(text).collect(),
            Level::Sentence => SENTENCE.find_iter(text).map(|m| m.as_str()).collect(),
            Level::Word => text.split_whitespace().collect(),
        }
    }
}

/// Chunk under construction at one level.
struct Pending {
    separator: &'static str,
    text: String,
    len: usize,
}

impl Pending {
    fn new(separator: &'static str) -> Self {
        Self {
            separator,
            text: String::new(),
            len: 0,
        }
    }

    fn fits(&self, len: usize, max_size: usize) -> bool {
        self.text.is_empty() || self.len + self.separator.len() + len <= max_size
    }

    fn push(&mut self, piece: &str, len: usize) {
        if !self.text.is_empty() {
            self.text.push_str(self.separator);
            self.len += self.separator.len();
        }
        self.text.push_str(piece);
        self.len += len;
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if !self.text.is_empty() {
            out.push(std::mem::take(&mut self.text));
        }
        self.len = 0;
    }
}

/// Split `text` into non-empty chunks of at most `max_size` characters.
///
/// Pure function of its inputs. Whitespace inside a paragraph is collapsed
/// to single spaces only where a paragraph had to be split further.
pub fn chunk_text(text: &str, max_size: usize) -> Vec<String> {
    let text = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    pack(&text, Level::Paragraph, max_size.max(1), &mut chunks);
    chunks
}

fn pack(text: &str, level: Level, max_size: usize, out: &mut Vec<String>) {
    let mut pending = Pending::new(level.separator());

    for piece in level.pieces(text) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let len = piece.chars().count();

        if len > max_size {
            if let Some(finer) = level.finer() {
                pending.flush(out);
                pack(piece, finer, max_size, out);
                continue;
            }
        }

        if !pending.fits(len, max_size) {
            pending.flush(out);
        }
        pending.push(piece, len);
    }

    pending.flush(out);
}
