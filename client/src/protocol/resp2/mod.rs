/*
 * Created on Wed Mar 13 2024
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

//! # The classic RESP2 codec
//!
//! RESP2 has five types, one per leading byte: `+` simple string, `-` error,
//! `:` integer, `$` bulk string and `*` array. Bulk strings and arrays have a
//! `-1` length sentinel for null, which is distinct from the empty form. The
//! decoder is streaming (see [`decode`]); the encoder writes the canonical
//! textual form back out.

#[cfg(test)]
mod tests;

use {
    super::{
        resp3::Resp3Value,
        scanner::{parse_signed, parse_unsigned, Scanner},
        ParseError, ParseResult, MAX_NESTING_DEPTH,
    },
    bytes::Bytes,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A fully decoded RESP2 value
pub enum Resp2Value {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    /// `None` is the `$-1` null sentinel, distinct from `Some("")`
    BulkString(Option<Bytes>),
    /// `None` is the `*-1` null sentinel, distinct from `Some(vec![])`
    Array(Option<Vec<Resp2Value>>),
}

impl Resp2Value {
    pub fn simple(s: impl AsRef<[u8]>) -> Self {
        Self::SimpleString(Bytes::copy_from_slice(s.as_ref()))
    }
    pub fn bulk(s: impl AsRef<[u8]>) -> Self {
        Self::BulkString(Some(Bytes::copy_from_slice(s.as_ref())))
    }
    pub const fn null_bulk() -> Self {
        Self::BulkString(None)
    }
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
    /// Lift self into the RESP3 value algebra (of which RESP2 is a strict
    /// subset): both null sentinels unify into [`Resp3Value::Null`]
    pub fn into_resp3(self) -> Resp3Value {
        match self {
            Self::SimpleString(s) => Resp3Value::SimpleString(s),
            Self::Error(e) => Resp3Value::SimpleError(e),
            Self::Integer(int) => Resp3Value::Number(int),
            Self::BulkString(Some(b)) => Resp3Value::BlobString(b),
            Self::BulkString(None) => Resp3Value::Null,
            Self::Array(Some(items)) => {
                Resp3Value::Array(items.into_iter().map(Self::into_resp3).collect())
            }
            Self::Array(None) => Resp3Value::Null,
        }
    }
}

/// Attempt to decode exactly one RESP2 value off the front of `buf`.
///
/// - `Ok(None)`: the buffer holds a prefix of a valid value; read more and
///   retry (nothing was consumed)
/// - `Ok(Some((value, consumed)))`: one complete value, and the number of
///   bytes it occupied so the caller can advance its buffer
/// - `Err(_)`: the stream is corrupt
pub fn decode(buf: &[u8]) -> ParseResult<Option<(Resp2Value, usize)>> {
    let mut scanner = Scanner::new(buf);
    match decode_value(&mut scanner, 0) {
        Ok(value) => Ok(Some((value, scanner.cursor()))),
        Err(ParseError::NotEnough) => Ok(None),
        Err(e) => Err(e),
    }
}

/// `depth` counts enclosing arrays: a token with 1000 aggregates above it
/// is the deepest we will go
fn decode_value(scanner: &mut Scanner, depth: usize) -> ParseResult<Resp2Value> {
    let tsymbol = scanner.try_next_byte().ok_or(ParseError::NotEnough)?;
    match tsymbol {
        b'+' => {
            let line = scanner.try_next_crlf_line()?;
            Ok(Resp2Value::SimpleString(Bytes::copy_from_slice(line)))
        }
        b'-' => {
            let line = scanner.try_next_crlf_line()?;
            Ok(Resp2Value::Error(Bytes::copy_from_slice(line)))
        }
        b':' => {
            let line = scanner.try_next_crlf_line()?;
            parse_signed(line)
                .map(Resp2Value::Integer)
                .ok_or(ParseError::CannotParseInteger)
        }
        b'$' => match decode_length(scanner)? {
            None => Ok(Resp2Value::BulkString(None)),
            Some(len) => {
                let payload = scanner.try_next_terminated_chunk(len)?;
                Ok(Resp2Value::BulkString(Some(Bytes::copy_from_slice(
                    payload,
                ))))
            }
        },
        b'*' => match decode_length(scanner)? {
            None => Ok(Resp2Value::Array(None)),
            Some(_) if depth >= MAX_NESTING_DEPTH => {
                Err(ParseError::TooDeeplyNestedAggregatedTypes)
            }
            Some(count) => {
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(decode_value(scanner, depth + 1)?);
                }
                Ok(Resp2Value::Array(Some(items)))
            }
        },
        _ => Err(ParseError::InvalidLeadingByte),
    }
}

/// Read a RESP2 length line: a decimal count, or the `-1` null sentinel
/// (`None`). Any other negative is malformed
fn decode_length(scanner: &mut Scanner) -> ParseResult<Option<usize>> {
    let line = scanner.try_next_crlf_line()?;
    if line == b"-1" {
        return Ok(None);
    }
    parse_unsigned(line)
        .map(|len| Some(len as usize))
        .ok_or(ParseError::Malformed)
}

/// Serialize `value` into its canonical wire form
pub fn encode(value: &Resp2Value, buf: &mut Vec<u8>) {
    match value {
        Resp2Value::SimpleString(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        Resp2Value::Error(e) => {
            buf.push(b'-');
            buf.extend_from_slice(e);
            buf.extend_from_slice(b"\r\n");
        }
        Resp2Value::Integer(int) => {
            buf.push(b':');
            buf.extend_from_slice(int.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Resp2Value::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        Resp2Value::BulkString(Some(payload)) => {
            buf.push(b'$');
            buf.extend_from_slice(payload.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(payload);
            buf.extend_from_slice(b"\r\n");
        }
        Resp2Value::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        Resp2Value::Array(Some(items)) => {
            buf.push(b'*');
            buf.extend_from_slice(items.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                encode(item, buf);
            }
        }
    }
}
