//! Word-stream wire encoding.
//!
//! Portal messages are sequences of untyped machine words. This module
//! provides the small writer/reader pair plus the [`Wire`] trait that typed
//! values use to serialise themselves into a frame's untyped area.
//!
//! Strings are encoded as a length word followed by the UTF-8 bytes packed
//! little-endian into as many words as needed.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

/// Decode error for the untyped word stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Not enough words left in the stream.
    Truncated,
    /// A word held a value outside the expected domain.
    InvalidValue,
    /// A string payload was not valid UTF-8.
    InvalidUtf8,
}

/// Append-only view over a frame's untyped words.
pub struct WordWriter<'a> {
    words: &'a mut Vec<u64>,
}

impl<'a> WordWriter<'a> {
    /// Wrap a word buffer for writing.
    pub fn new(words: &'a mut Vec<u64>) -> Self {
        Self { words }
    }

    /// Append a single word.
    pub fn push(&mut self, word: u64) {
        self.words.push(word);
    }

    /// Append `bytes`, packed little-endian, preceded by a length word.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push(bytes.len() as u64);
        for chunk in bytes.chunks(8) {
            let mut buf = [0u8; 8];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.push(u64::from_le_bytes(buf));
        }
    }
}

/// Cursor over a frame's untyped words.
pub struct WordReader<'a> {
    words: &'a [u64],
    pos: usize,
}

impl<'a> WordReader<'a> {
    /// Wrap a word slice for reading, starting at `pos`.
    pub fn new(words: &'a [u64], pos: usize) -> Self {
        Self { words, pos }
    }

    /// Number of unread words.
    pub fn remaining(&self) -> usize {
        self.words.len().saturating_sub(self.pos)
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read the next word.
    pub fn pop(&mut self) -> Result<u64, WireError> {
        let word = *self.words.get(self.pos).ok_or(WireError::Truncated)?;
        self.pos += 1;
        Ok(word)
    }

    /// Read a length word followed by that many packed bytes.
    pub fn pop_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.pop()? as usize;
        let words = len.div_ceil(8);
        if self.remaining() < words {
            return Err(WireError::Truncated);
        }
        let mut out = Vec::with_capacity(len);
        for i in 0..words {
            let chunk = self.words[self.pos + i].to_le_bytes();
            let take = (len - i * 8).min(8);
            out.extend_from_slice(&chunk[..take]);
        }
        self.pos += words;
        Ok(out)
    }
}

/// Types that can be carried in a frame's untyped words.
pub trait Wire: Sized {
    /// Serialise into the word stream.
    fn put(&self, w: &mut WordWriter<'_>);

    /// Deserialise from the word stream.
    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError>;
}

impl Wire for u64 {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(*self);
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        r.pop()
    }
}

impl Wire for usize {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(*self as u64);
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        Ok(r.pop()? as usize)
    }
}

impl Wire for u32 {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(u64::from(*self));
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        u32::try_from(r.pop()?).map_err(|_| WireError::InvalidValue)
    }
}

impl Wire for bool {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(u64::from(*self));
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        match r.pop()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidValue),
        }
    }
}

impl Wire for String {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push_bytes(self.as_bytes());
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        let bytes = r.pop_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }
}
