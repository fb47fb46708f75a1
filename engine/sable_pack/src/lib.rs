//! Byte-level persistence codecs.
//!
//! The binary-packed file form is a 256-entry byte-frequency header
//! (run-length encoded for zero runs) followed by Huffman-coded blocks,
//! each prefixed by a variable-length compact index. Base16 and base64 are
//! the textual encodings used for seeds and binary payloads embedded in
//! node trees.

mod base;
mod compact;
mod huffman;

pub use base::{base16_decode, base16_encode, base64_decode, base64_encode};
pub use compact::{read_compact_index, write_compact_index};
pub use huffman::{compress, decompress};

use thiserror::Error;

/// Decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    /// Stream ended before the declared layout was complete.
    #[error("packed stream truncated")]
    Truncated,
    /// A block declared a length past the end of the buffer.
    #[error("block length {length} overruns buffer at offset {offset}")]
    BlockOverrun { offset: usize, length: usize },
    /// A character outside the encoding alphabet.
    #[error("invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },
    /// Input length not valid for the encoding.
    #[error("input length {length} is not valid for this encoding")]
    BadLength { length: usize },
}
