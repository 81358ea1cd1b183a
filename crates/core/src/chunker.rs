//! Fixed-size overlapping chunker.
//!
//! Units are Unicode scalar values (`char`s), never bytes, so a chunk
//! boundary can not split a multi-byte character.

use crate::{LorebookError, Result};

/// Default chunk length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    size: usize,
    overlap: usize,
}

impl ChunkConfig {
    /// # Errors
    /// [`LorebookError::InvalidConfiguration`] if `size == 0` or
    /// `overlap >= size` (the window would never advance).
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(LorebookError::InvalidConfiguration(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= size {
            return Err(LorebookError::InvalidConfiguration(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance between the starts of consecutive chunks.
    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }

    /// Split `text` into overlapping chunks.
    ///
    /// Every chunk is exactly `size` characters except possibly the last.
    /// Consecutive chunks share exactly `overlap` characters. Blank input
    /// yields no chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::with_capacity(chars.len() / self.stride() + 1);
        let mut start = 0;
        loop {
            let end = (start + self.size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += self.stride();
        }
        chunks
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Split `text` into chunks of at most `size` characters overlapping by `overlap`.
///
/// Deterministic: the same arguments always give the same sequence.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
    Ok(ChunkConfig::new(size, overlap)?.split(text))
}
