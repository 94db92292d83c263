/*
 * Created on Tue Mar 12 2024
 *
 * This file is a part of Sable
 * Sable is a free and open-source Redis-compatible client runtime written
 * by Sayan Nandan ("the Author") with the vision to provide a fast, correct
 * and fully pipelined way to talk to modern key/value servers.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Byte framing primitives: a cursor over a borrowed buffer with CRLF-aware
//! reads and checked decimal parsing. Reads that can't complete leave the
//! cursor untouched so that the caller can retry the same read once more
//! bytes are in.

use {
    super::{ParseError, ParseResult},
    crate::util::compiler,
};

#[derive(Debug, PartialEq)]
/// A scanner over a borrowed byte buffer
pub struct Scanner<'a> {
    d: &'a [u8],
    __cursor: usize,
}

impl<'a> Scanner<'a> {
    /// Create a new scanner, starting at position 0
    pub const fn new(d: &'a [u8]) -> Self {
        Self { d, __cursor: 0 }
    }
    pub const fn buffer_len(&self) -> usize {
        self.d.len()
    }
    /// Returns the remaining number of bytes
    pub const fn remaining(&self) -> usize {
        self.buffer_len() - self.__cursor
    }
    /// Returns the current cursor position
    pub const fn cursor(&self) -> usize {
        self.__cursor
    }
    /// Returns true if the scanner has reached eof
    pub const fn eof(&self) -> bool {
        self.remaining() == 0
    }
    /// Returns true if the scanner has atleast `sizeof` bytes remaining
    pub const fn has_left(&self, sizeof: usize) -> bool {
        self.remaining() >= sizeof
    }
    /// Returns the buffer from the current position
    pub fn current_buffer(&self) -> &'a [u8] {
        &self.d[self.__cursor..]
    }
    /// Manually set the cursor position
    ///
    /// ## Safety
    /// The index must be valid
    pub unsafe fn set_cursor(&mut self, i: usize) {
        self.__cursor = i;
    }
    /// Increment the cursor by the given amount
    ///
    /// ## Safety
    /// The buffer must have atleast `by` remaining
    pub unsafe fn incr_cursor_by(&mut self, by: usize) {
        self.__cursor += by;
    }
}

impl<'a> Scanner<'a> {
    /// Return the byte at the cursor without advancing
    pub fn peek_first_byte(&self) -> Option<u8> {
        if self.eof() {
            None
        } else {
            Some(self.d[self.__cursor])
        }
    }
    /// Attempt to read the next byte
    pub fn try_next_byte(&mut self) -> Option<u8> {
        let ret = self.peek_first_byte();
        unsafe {
            // UNSAFE(@ohsayan): the peek already verified that we aren't at eof
            self.incr_cursor_by(ret.is_some() as usize)
        }
        ret
    }
    /// Attempt to read the next `len` bytes
    pub fn try_next_chunk(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.has_left(len) {
            let chunk = &self.d[self.__cursor..self.__cursor + len];
            unsafe {
                // UNSAFE(@ohsayan): verified len bytes above
                self.incr_cursor_by(len)
            }
            Some(chunk)
        } else {
            None
        }
    }
    /// Attempt to read the first CRLF terminated slice, advancing past the
    /// CRLF itself. The returned slice does not include the terminator.
    ///
    /// - A buffer that simply ends before the CRLF shows up returns
    ///   [`ParseError::NotEnough`] with the cursor untouched
    /// - A CR that is *not* followed by an LF is a framing violation and
    ///   returns [`ParseError::Malformed`]
    pub fn try_next_crlf_line(&mut self) -> ParseResult<&'a [u8]> {
        let start = self.__cursor;
        let mut i = start;
        while i < self.d.len() {
            if self.d[i] == b'\r' {
                return if i + 1 == self.d.len() {
                    // CR is the last byte we have; the LF may still be in flight
                    Err(ParseError::NotEnough)
                } else if self.d[i + 1] == b'\n' {
                    let line = &self.d[start..i];
                    unsafe {
                        // UNSAFE(@ohsayan): i + 2 is within the buffer (we looked at i + 1)
                        self.set_cursor(i + 2);
                    }
                    Ok(line)
                } else {
                    compiler::cold_rerr(ParseError::Malformed)
                };
            }
            i += 1;
        }
        Err(ParseError::NotEnough)
    }
    /// Read `len` payload bytes followed by the mandatory CRLF terminator.
    /// The cursor is only advanced when the payload *and* its terminator are
    /// fully buffered and well formed
    pub fn try_next_terminated_chunk(&mut self, len: usize) -> ParseResult<&'a [u8]> {
        let needed = match len.checked_add(2) {
            Some(needed) => needed,
            // a length this absurd can't ever frame
            None => return compiler::cold_rerr(ParseError::Malformed),
        };
        if !self.has_left(needed) {
            return Err(ParseError::NotEnough);
        }
        if self.d[self.__cursor + len] != b'\r' || self.d[self.__cursor + len + 1] != b'\n' {
            return compiler::cold_rerr(ParseError::Malformed);
        }
        let chunk = &self.d[self.__cursor..self.__cursor + len];
        unsafe {
            // UNSAFE(@ohsayan): verified len + 2 bytes above
            self.incr_cursor_by(len + 2)
        }
        Ok(chunk)
    }
}

/// Parse an ASCII decimal string into an unsigned 64-bit integer. Rejects
/// empty input, non-digit bytes and overflow
pub fn parse_unsigned(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut ret = 0u64;
    for byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        ret = ret.checked_mul(10)?;
        ret = ret.checked_add((byte & 0x0F) as u64)?;
    }
    Some(ret)
}

/// Parse an ASCII decimal string with at most one leading `-` into a signed
/// 64-bit integer. Rejects empty input, a bare `-`, non-digit bytes and
/// overflow
pub fn parse_signed(bytes: &[u8]) -> Option<i64> {
    let (neg, digits) = match bytes.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, bytes),
    };
    let magnitude = parse_unsigned(digits)?;
    if neg {
        // the magnitude of i64::MIN is one more than i64::MAX
        if magnitude > (i64::MAX as u64) + 1 {
            None
        } else {
            Some((magnitude as i64).wrapping_neg())
        }
    } else {
        if magnitude > i64::MAX as u64 {
            None
        } else {
            Some(magnitude as i64)
        }
    }
}
