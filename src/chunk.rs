//! Recursive character text splitter.
//!
//! Splits extracted text into overlapping chunks of at most `chunk_size`
//! characters. The splitter tries the coarsest separator first (blank line,
//! then newline, then space) and only falls back to finer ones for pieces
//! that are still too long; as a last resort it splits between characters.
//! Adjacent chunks share up to `chunk_overlap` characters of trailing context.
//!
//! Sizes are measured in Unicode scalar values, not bytes, so CJK text gets
//! the same chunk length as ASCII.

use std::collections::VecDeque;

const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

impl TextSplitter {
    /// `chunk_overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text` into trimmed, non-empty chunks in document order.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        // First separator that actually occurs; "" always matches.
        let (idx, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(s.as_str()))
            .map(|(i, s)| (i, s.as_str()))
            .unwrap_or((separators.len(), ""));
        let finer = separators.get(idx + 1..).unwrap_or(&[]);

        let mut out = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                out.extend(self.merge(&pending));
                pending.clear();
            }
            if finer.is_empty() {
                out.push(piece.trim().to_string());
            } else {
                out.extend(self.split_with(&piece, finer));
            }
        }
        if !pending.is_empty() {
            out.extend(self.merge(&pending));
        }
        out.retain(|c| !c.is_empty());
        out
    }

    /// Greedily pack small pieces into chunks, carrying overlap forward.
    fn merge(&self, pieces: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut chunks, &window);
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }
        push_joined(&mut chunks, &window);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split on `separator`, re-attaching it to the start of each following
/// piece so no characters are lost. An empty separator splits into chars.
fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(|c| c.to_string()).collect();
    }
    let mut pieces = Vec::new();
    for (i, part) in text.split(separator).enumerate() {
        let piece = if i == 0 {
            part.to_string()
        } else {
            format!("{}{}", separator, part)
        };
        if !piece.is_empty() {
            pieces.push(piece);
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = TextSplitter::new(500, 50).split("Hello, world!");
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        let splitter = TextSplitter::new(500, 50);
        assert!(splitter.split("").is_empty());
        assert!(splitter.split("  \n\n \n").is_empty());
    }

    #[test]
    fn chunks_respect_size() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = TextSplitter::new(50, 10).split(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(char_len(c) <= 50, "chunk too long: {:?}", c);
        }
    }

    #[test]
    fn adjacent_chunks_overlap() {
        let text = (0..100)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = TextSplitter::new(40, 12).split(&text);
        for pair in chunks.windows(2) {
            let last_word = pair[0].split(' ').next_back().unwrap();
            assert!(
                pair[1].contains(last_word),
                "expected {:?} to carry {:?}",
                pair[1],
                last_word
            );
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = "alpha beta gamma\n\ndelta epsilon zeta";
        let chunks = TextSplitter::new(20, 0).split(text);
        assert_eq!(chunks, vec!["alpha beta gamma", "delta epsilon zeta"]);
    }

    #[test]
    fn unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(25);
        let chunks = TextSplitter::new(10, 0).split(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "xxxxx");
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "数据湖".repeat(10);
        let chunks = TextSplitter::new(10, 0).split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| char_len(c) <= 10));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta ".repeat(30);
        let splitter = TextSplitter::new(30, 5);
        assert_eq!(splitter.split(&text), splitter.split(&text));
    }

    #[test]
    fn overlap_clamped() {
        let splitter = TextSplitter::new(5, 50);
        assert_eq!(splitter.chunk_overlap, 4);
        assert_eq!(splitter.chunk_size(), 5);
    }
}
