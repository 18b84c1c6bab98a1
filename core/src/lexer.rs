//! Component C3: a position-aware stream over the input, used by both the
//! internal (table-driven) and external scanners to produce leaf subtrees.
//! Mirrors `lexer.c`/`lexer.h`.

use crate::input::{Encoding, Input};
use crate::language::{Symbol, END_SYMBOL};
use crate::length::{Length, Point};
use crate::logger::LogType;
use crate::range::Range;

const BYTE_ORDER_MARK: i32 = 0xFEFF;

/// `lookahead` uses the same convention as `TSLexer`: `0` marks end of input,
/// `-1` marks an undecodable byte sequence, anything else is a Unicode
/// scalar value (or UTF-16 code unit for malformed surrogates).
pub struct Lexer<'a> {
    input: &'a mut dyn Input,
    encoding: Encoding,
    chunk: Vec<u8>,
    chunk_start: u32,
    past_last_range: bool,
    current_position: Length,
    pub(crate) token_start_position: Length,
    token_end_position: Option<Length>,
    lookahead: i32,
    lookahead_size: u32,
    included_ranges: Vec<Range>,
    current_included_range_index: usize,
    pub(crate) logger: Option<&'a mut dyn FnMut(LogType, &str)>,
    /// The symbol a `lex_fn`/external scanner found, set via
    /// `set_result_symbol` just before returning `true`. Mirrors
    /// `lexer->data.result_symbol`.
    result_symbol: Symbol,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a mut dyn Input, included_ranges: Vec<Range>) -> Self {
        let encoding = input.encoding();
        let mut lexer = Lexer {
            input,
            encoding,
            chunk: Vec::new(),
            chunk_start: 0,
            past_last_range: false,
            current_position: Length { bytes: u32::MAX, point: Point { row: 0, column: 0 } },
            token_start_position: Length::ZERO,
            token_end_position: None,
            lookahead: 0,
            lookahead_size: 0,
            included_ranges,
            current_included_range_index: 0,
            logger: None,
            result_symbol: END_SYMBOL,
        };
        lexer.goto(Length::ZERO);
        lexer
    }

    pub fn lookahead(&self) -> i32 {
        self.lookahead
    }

    pub fn current_position(&self) -> Length {
        self.current_position
    }

    pub fn result_symbol(&self) -> Symbol {
        self.result_symbol
    }

    pub fn set_result_symbol(&mut self, symbol: Symbol) {
        self.result_symbol = symbol;
    }

    fn log(&mut self, message: &str, character: i32) {
        if self.logger.is_none() {
            return;
        }
        let text = if (32..127).contains(&character) {
            format!("{message} character:'{}'", character as u8 as char)
        } else {
            format!("{message} character:{character}")
        };
        if let Some(logger) = self.logger.as_mut() {
            logger(LogType::Lex, &text);
        }
    }

    fn get_chunk(&mut self) {
        self.chunk_start = self.current_position.bytes;
        let bytes = self.input.read(self.chunk_start, self.current_position.point);
        self.chunk = bytes.to_vec();
    }

    fn get_lookahead(&mut self) {
        let position_in_chunk = (self.current_position.bytes - self.chunk_start) as usize;
        if position_in_chunk >= self.chunk.len() {
            self.lookahead_size = 1;
            self.lookahead = 0;
            return;
        }

        let slice = &self.chunk[position_in_chunk..];
        let (mut codepoint, mut size) = decode(slice, self.encoding);

        if codepoint == -1 && slice.len() < 4 {
            self.get_chunk();
            let (cp, sz) = decode(&self.chunk, self.encoding);
            codepoint = cp;
            size = sz;
        }

        self.lookahead = codepoint;
        self.lookahead_size = if codepoint == -1 { 1 } else { size };
    }

    fn goto(&mut self, mut position: Length) {
        let mut found = false;
        for (i, range) in self.included_ranges.iter().enumerate() {
            if range.end_byte > position.bytes {
                if range.start_byte > position.bytes {
                    position = Length { bytes: range.start_byte, point: range.start_point };
                }
                self.current_included_range_index = i;
                found = true;
                break;
            }
        }

        self.past_last_range = false;
        if !found {
            if let Some(last) = self.included_ranges.last() {
                position = Length { bytes: last.end_byte, point: last.end_point };
            }
            self.past_last_range = true;
            self.chunk = Vec::new();
            self.chunk_start = position.bytes;
        }

        self.token_start_position = position;
        self.token_end_position = None;
        self.current_position = position;

        if !self.chunk.is_empty()
            && (position.bytes < self.chunk_start
                || position.bytes >= self.chunk_start + self.chunk.len() as u32)
        {
            self.chunk = Vec::new();
            self.chunk_start = 0;
        }

        self.lookahead_size = 0;
        self.lookahead = 0;
    }

    pub fn reset(&mut self, position: Length) {
        if position.bytes != self.current_position.bytes {
            self.goto(position);
        }
    }

    pub fn set_included_ranges(&mut self, ranges: Vec<Range>) {
        self.included_ranges = if ranges.is_empty() { vec![Range::WHOLE_DOCUMENT] } else { ranges };
        let position = self.current_position;
        self.goto(position);
    }

    /// Called at the start of every token attempt: records `token_start_position`
    /// and fetches lookahead if the cache is cold, skipping a leading BOM.
    pub fn start(&mut self) {
        self.token_start_position = self.current_position;
        self.token_end_position = None;
        self.result_symbol = END_SYMBOL;
        if self.chunk.is_empty() {
            self.get_chunk();
        }
        if self.lookahead_size == 0 {
            self.get_lookahead();
        }
        if self.current_position.bytes == 0 && self.lookahead == BYTE_ORDER_MARK {
            self.advance(true);
        }
    }

    pub fn advance(&mut self, skip: bool) {
        if self.past_last_range {
            return;
        }

        if self.lookahead_size != 0 {
            self.current_position.bytes += self.lookahead_size;
            if self.lookahead == b'\n' as i32 {
                self.current_position.point.row += 1;
                self.current_position.point.column = 0;
            } else {
                self.current_position.point.column += self.lookahead_size;
            }
        }

        let current_range = self.included_ranges[self.current_included_range_index];
        if self.current_position.bytes == current_range.end_byte {
            self.current_included_range_index += 1;
            if self.current_included_range_index == self.included_ranges.len() {
                self.lookahead = 0;
                self.lookahead_size = 1;
                return;
            }
            let next_range = self.included_ranges[self.current_included_range_index];
            self.current_position = Length { bytes: next_range.start_byte, point: next_range.start_point };
        }

        if skip {
            self.log("skip", self.lookahead);
            self.token_start_position = self.current_position;
        } else {
            self.log("consume", self.lookahead);
        }

        if self.current_position.bytes >= self.chunk_start + self.chunk.len() as u32 {
            self.get_chunk();
        }
        self.get_lookahead();
    }

    pub fn advance_to_end(&mut self) {
        while self.lookahead != 0 {
            self.advance(false);
        }
    }

    pub fn mark_end(&mut self) {
        let current_range = self.included_ranges[self.current_included_range_index];
        if self.current_included_range_index > 0 && self.current_position.bytes == current_range.start_byte {
            let previous = self.included_ranges[self.current_included_range_index - 1];
            self.token_end_position = Some(Length { bytes: previous.end_byte, point: previous.end_point });
        } else {
            self.token_end_position = Some(self.current_position);
        }
    }

    /// Rewinds to the start of the current line and re-advances, returning
    /// how many columns were consumed. Used by external scanners that report
    /// column-sensitive tokens (e.g. significant indentation).
    pub fn get_column(&mut self) -> u32 {
        let goal_byte = self.current_position.bytes;
        self.current_position.bytes -= self.current_position.point.column;
        self.current_position.point.column = 0;

        if self.current_position.bytes < self.chunk_start {
            self.get_chunk();
        }

        let mut result = 0;
        while self.current_position.bytes < goal_byte {
            self.advance(false);
            result += 1;
        }
        result
    }

    pub fn is_at_included_range_start(&self) -> bool {
        let current_range = self.included_ranges[self.current_included_range_index];
        self.current_position.bytes == current_range.start_byte
    }

    /// Finalizes the token's end position and widens `lookahead_end_byte` to
    /// cover any extra byte consulted while decoding the final (possibly
    /// invalid) character, per §4.2's "lookahead end byte" invariant.
    pub fn finish(&mut self, lookahead_end_byte: &mut u32) {
        if self.token_end_position.is_none() {
            self.mark_end();
        }
        let mut end = self.current_position.bytes + 1;
        if self.lookahead == -1 {
            end += 1;
        }
        if end > *lookahead_end_byte {
            *lookahead_end_byte = end;
        }
    }

    pub fn token_range(&self) -> (Length, Length) {
        let end = self.token_end_position.unwrap_or(self.current_position);
        (self.token_start_position, end)
    }
}

/// Decodes one code point from the front of `bytes`, returning `(-1, 1)` on
/// an undecodable sequence. Hand-rolled: neither UTF-8 nor UTF-16 decoding
/// crates are part of this crate's dependency stack, and `std` doesn't
/// expose partial-buffer decoding.
fn decode(bytes: &[u8], encoding: Encoding) -> (i32, u32) {
    match encoding {
        Encoding::Utf8 => decode_utf8(bytes),
        Encoding::Utf16Le => decode_utf16le(bytes),
    }
}

fn decode_utf8(bytes: &[u8]) -> (i32, u32) {
    let Some(&first) = bytes.first() else { return (-1, 1) };

    let (len, mut codepoint) = if first < 0x80 {
        return (first as i32, 1);
    } else if first & 0xE0 == 0xC0 {
        (2, (first & 0x1F) as u32)
    } else if first & 0xF0 == 0xE0 {
        (3, (first & 0x0F) as u32)
    } else if first & 0xF8 == 0xF0 {
        (4, (first & 0x07) as u32)
    } else {
        return (-1, 1);
    };

    if bytes.len() < len {
        return (-1, 1);
    }

    for &b in &bytes[1..len] {
        if b & 0xC0 != 0x80 {
            return (-1, 1);
        }
        codepoint = (codepoint << 6) | (b & 0x3F) as u32;
    }

    match char::from_u32(codepoint) {
        Some(_) => (codepoint as i32, len as u32),
        None => (-1, 1),
    }
}

fn decode_utf16le(bytes: &[u8]) -> (i32, u32) {
    if bytes.len() < 2 {
        return (-1, 1);
    }
    let unit = u16::from_le_bytes([bytes[0], bytes[1]]);
    if (0xD800..0xDC00).contains(&unit) {
        if bytes.len() < 4 {
            return (-1, 2);
        }
        let low = u16::from_le_bytes([bytes[2], bytes[3]]);
        if !(0xDC00..0xE000).contains(&low) {
            return (-1, 2);
        }
        let codepoint = 0x10000 + ((unit as u32 - 0xD800) << 10) + (low as u32 - 0xDC00);
        (codepoint as i32, 4)
    } else if (0xDC00..0xE000).contains(&unit) {
        (-1, 2)
    } else {
        (unit as i32, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::StrInput;

    #[test]
    fn decode_ascii() {
        assert_eq!(decode_utf8(b"hello"), ('h' as i32, 1));
    }

    #[test]
    fn decode_multibyte() {
        let bytes = "é".as_bytes();
        let (cp, size) = decode_utf8(bytes);
        assert_eq!(cp, 'é' as i32);
        assert_eq!(size, 2);
    }

    #[test]
    fn decode_truncated_is_invalid() {
        let bytes = &"é".as_bytes()[..1];
        assert_eq!(decode_utf8(bytes), (-1, 1));
    }

    #[test]
    fn lexer_skips_leading_bom() {
        let mut input = StrInput::new("\u{feff}abc");
        let mut lexer = Lexer::new(&mut input, vec![Range::WHOLE_DOCUMENT]);
        lexer.start();
        assert_eq!(lexer.lookahead(), 'a' as i32);
    }

    #[test]
    fn lexer_advances_rows_on_newline() {
        let mut input = StrInput::new("a\nb");
        let mut lexer = Lexer::new(&mut input, vec![Range::WHOLE_DOCUMENT]);
        lexer.start();
        lexer.advance(false);
        assert_eq!(lexer.lookahead(), '\n' as i32);
        lexer.advance(false);
        assert_eq!(lexer.current_position().point.row, 1);
        assert_eq!(lexer.current_position().point.column, 0);
    }

    #[test]
    fn lexer_reports_eof() {
        let mut input = StrInput::new("a");
        let mut lexer = Lexer::new(&mut input, vec![Range::WHOLE_DOCUMENT]);
        lexer.start();
        lexer.advance(false);
        assert_eq!(lexer.lookahead(), 0);
    }
}
