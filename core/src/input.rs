//! The input abstraction the lexer reads through (component C3's `read`
//! callback) plus the small set of concrete implementations this crate
//! ships: a `&str`/`&[u8]` blanket impl for tests and an optional
//! `ropey`-backed implementation behind the `ropey` feature, matching the
//! teacher's own `ropey` feature flag.

use crate::length::Point;

/// Either UTF-8 or UTF-16 (little-endian); selected once at parse time.
/// A byte-order-mark code point (U+FEFF) at the very start of the document
/// is silently skipped by the lexer regardless of encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
}

/// Reads chunks of source text on demand. `read` is called with the current
/// byte offset and point; it returns the next chunk of bytes starting at
/// that offset, or an empty slice at end of input.
pub trait Input {
    fn read(&mut self, byte_offset: u32, point: Point) -> &[u8];
    fn encoding(&self) -> Encoding {
        Encoding::Utf8
    }
}

/// A whole in-memory string, read in one chunk. Used by tests and small
/// embedders that don't need incremental chunk delivery.
pub struct StrInput<'a> {
    bytes: &'a [u8],
}

impl<'a> StrInput<'a> {
    pub fn new(text: &'a str) -> Self {
        StrInput { bytes: text.as_bytes() }
    }
}

impl Input for StrInput<'_> {
    fn read(&mut self, byte_offset: u32, _point: Point) -> &[u8] {
        let offset = byte_offset as usize;
        if offset >= self.bytes.len() {
            &[]
        } else {
            &self.bytes[offset..]
        }
    }
}

/// Blanket impl so tests can hand a bare `&[u8]` to `Parser::parse`.
pub struct BytesInput<'a> {
    bytes: &'a [u8],
}

impl<'a> BytesInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BytesInput { bytes }
    }
}

impl Input for BytesInput<'_> {
    fn read(&mut self, byte_offset: u32, _point: Point) -> &[u8] {
        let offset = byte_offset as usize;
        if offset >= self.bytes.len() {
            &[]
        } else {
            &self.bytes[offset..]
        }
    }
}

#[cfg(feature = "ropey")]
pub mod ropey_input {
    use super::{Encoding, Input};
    use crate::length::Point;
    use ropey::RopeSlice;

    /// Reads a `ropey::Rope` chunk-by-chunk without flattening it into a
    /// single contiguous buffer, mirroring the teacher's `ropey` input impl.
    pub struct RopeInput<'a> {
        rope: RopeSlice<'a>,
        chunk: Option<(&'a str, usize)>,
    }

    impl<'a> RopeInput<'a> {
        pub fn new(rope: RopeSlice<'a>) -> Self {
            RopeInput { rope, chunk: None }
        }
    }

    impl Input for RopeInput<'_> {
        fn read(&mut self, byte_offset: u32, _point: Point) -> &[u8] {
            let offset = byte_offset as usize;
            if offset >= self.rope.len_bytes() {
                return &[];
            }
            let (chunk, chunk_byte_start, _, _) = self.rope.chunk_at_byte(offset);
            self.chunk = Some((chunk, chunk_byte_start));
            let local = offset - chunk_byte_start;
            chunk.as_bytes()[local..].as_ref()
        }

        fn encoding(&self) -> Encoding {
            Encoding::Utf8
        }
    }
}

#[cfg(feature = "ropey")]
pub use ropey_input::RopeInput;
