/*
 * Created on Sun Mar 17 2024
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

//! # The RESP3 token decoder
//!
//! RESP3 extends the classic protocol to 15 type identifiers, adding
//! out-of-band pushes, maps, sets, doubles, big numbers, verbatim strings and
//! attributes. The decoder here is a *single-step validator*: given whatever
//! has been buffered so far it either
//!
//! - returns `None`, meaning "need more bytes" (the buffer is untouched),
//! - returns one [`Resp3Token`] holding the exact byte view of one complete
//!   top-level token, or
//! - fails with a structured [`ParseError`].
//!
//! Validation is a full structural walk (every child of an aggregate is
//! checked), so anything downstream of a yielded token can lean on the frame
//! being well formed: [`Resp3Token::value`] and the child iterator never fail.


use {
    super::{
        scanner::{parse_signed, parse_unsigned, Scanner},
        ParseError, ParseResult, MAX_NESTING_DEPTH,
    },
    crate::util::Unwrappable,
    bytes::{Bytes, BytesMut},
};

consts! {
    SYM_NULL: u8 = b'_';
    SYM_BOOLEAN: u8 = b'#';
    SYM_NUMBER: u8 = b':';
    SYM_DOUBLE: u8 = b',';
    SYM_BIG_NUMBER: u8 = b'(';
    SYM_SIMPLE_STRING: u8 = b'+';
    SYM_SIMPLE_ERROR: u8 = b'-';
    SYM_BLOB_STRING: u8 = b'$';
    SYM_BLOB_ERROR: u8 = b'!';
    SYM_VERBATIM_STRING: u8 = b'=';
    SYM_ARRAY: u8 = b'*';
    SYM_MAP: u8 = b'%';
    SYM_SET: u8 = b'~';
    SYM_ATTRIBUTE: u8 = b'|';
    SYM_PUSH: u8 = b'>';
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// The 15 RESP3 type identifiers
pub enum Resp3Kind {
    Null,
    Boolean,
    Number,
    Double,
    BigNumber,
    SimpleString,
    SimpleError,
    BlobString,
    BlobError,
    VerbatimString,
    Array,
    Map,
    Set,
    Attribute,
    Push,
}

impl Resp3Kind {
    pub const fn from_leading_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            SYM_NULL => Self::Null,
            SYM_BOOLEAN => Self::Boolean,
            SYM_NUMBER => Self::Number,
            SYM_DOUBLE => Self::Double,
            SYM_BIG_NUMBER => Self::BigNumber,
            SYM_SIMPLE_STRING => Self::SimpleString,
            SYM_SIMPLE_ERROR => Self::SimpleError,
            SYM_BLOB_STRING => Self::BlobString,
            SYM_BLOB_ERROR => Self::BlobError,
            SYM_VERBATIM_STRING => Self::VerbatimString,
            SYM_ARRAY => Self::Array,
            SYM_MAP => Self::Map,
            SYM_SET => Self::Set,
            SYM_ATTRIBUTE => Self::Attribute,
            SYM_PUSH => Self::Push,
            _ => return None,
        })
    }
    pub const fn leading_byte(&self) -> u8 {
        match self {
            Self::Null => SYM_NULL,
            Self::Boolean => SYM_BOOLEAN,
            Self::Number => SYM_NUMBER,
            Self::Double => SYM_DOUBLE,
            Self::BigNumber => SYM_BIG_NUMBER,
            Self::SimpleString => SYM_SIMPLE_STRING,
            Self::SimpleError => SYM_SIMPLE_ERROR,
            Self::BlobString => SYM_BLOB_STRING,
            Self::BlobError => SYM_BLOB_ERROR,
            Self::VerbatimString => SYM_VERBATIM_STRING,
            Self::Array => SYM_ARRAY,
            Self::Map => SYM_MAP,
            Self::Set => SYM_SET,
            Self::Attribute => SYM_ATTRIBUTE,
            Self::Push => SYM_PUSH,
        }
    }
    /// Aggregates carry child tokens after their count line
    pub const fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Self::Array | Self::Map | Self::Set | Self::Attribute | Self::Push
        )
    }
    /// Map-like aggregates advertise N entries but carry 2N child tokens
    pub const fn is_map_like(&self) -> bool {
        matches!(self, Self::Map | Self::Attribute)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The fully structured form of a RESP3 token
pub enum Resp3Value {
    Null,
    Boolean(bool),
    Number(i64),
    Double(f64),
    /// The raw (optionally `-` signed) decimal digit string
    BigNumber(Bytes),
    SimpleString(Bytes),
    SimpleError(Bytes),
    BlobString(Bytes),
    BlobError(Bytes),
    VerbatimString { format: [u8; 3], data: Bytes },
    Array(Vec<Resp3Value>),
    Map(Vec<(Resp3Value, Resp3Value)>),
    Set(Vec<Resp3Value>),
    Attribute(Vec<(Resp3Value, Resp3Value)>),
    Push(Vec<Resp3Value>),
}

impl Resp3Value {
    /// Is this a protocol-level error reply?
    pub fn is_error(&self) -> bool {
        matches!(self, Self::SimpleError(_) | Self::BlobError(_))
    }
    pub fn error_message(&self) -> Option<&[u8]> {
        match self {
            Self::SimpleError(msg) | Self::BlobError(msg) => Some(msg),
            _ => None,
        }
    }
    /// The payload bytes of any string-flavored value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::SimpleString(b) | Self::BlobString(b) => Some(b),
            Self::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One complete, validated top-level token: its type identifier plus the
/// exact contiguous byte view off the wire (always CRLF terminated)
pub struct Resp3Token {
    kind: Resp3Kind,
    data: Bytes,
}

#[derive(Debug)]
/// A decode failure, with the input that produced it attached for
/// diagnostics
pub struct Resp3DecodeError {
    pub kind: ParseError,
    pub buffer: Bytes,
}

/// Attempt to take exactly one complete token off the front of `buffer`.
///
/// On success the token's bytes are split off the buffer (zero copy); on
/// "need more" the buffer is untouched; on failure the buffer's current
/// content is attached to the error. Errors raised by nested validation
/// propagate unchanged; the buffer view is only attached here, at depth 0
pub fn try_next_token(buffer: &mut BytesMut) -> Result<Option<Resp3Token>, Resp3DecodeError> {
    match validate_one(&buffer[..]) {
        Ok(None) => Ok(None),
        Ok(Some((kind, len))) => {
            let data = buffer.split_to(len).freeze();
            Ok(Some(Resp3Token { kind, data }))
        }
        Err(kind) => Err(Resp3DecodeError {
            kind,
            buffer: Bytes::copy_from_slice(&buffer[..]),
        }),
    }
}

/// Validate exactly one complete token at the front of `buf`, returning its
/// kind and total length in bytes. `Ok(None)` means "need more bytes"
pub fn validate_one(buf: &[u8]) -> ParseResult<Option<(Resp3Kind, usize)>> {
    let mut scanner = Scanner::new(buf);
    match validate_next(&mut scanner, 0) {
        Ok(kind) => Ok(Some((kind, scanner.cursor()))),
        Err(ParseError::NotEnough) => Ok(None),
        Err(e) => Err(e),
    }
}

/// `depth` counts enclosing aggregates: a token with 1000 aggregates above
/// it is the deepest we will go
fn validate_next(scanner: &mut Scanner, depth: usize) -> ParseResult<Resp3Kind> {
    let tsymbol = scanner.try_next_byte().ok_or(ParseError::NotEnough)?;
    let kind = Resp3Kind::from_leading_byte(tsymbol).ok_or(ParseError::InvalidLeadingByte)?;
    if kind.is_aggregate() && depth >= MAX_NESTING_DEPTH {
        return Err(ParseError::TooDeeplyNestedAggregatedTypes);
    }
    match kind {
        Resp3Kind::Null => {
            let line = scanner.try_next_crlf_line()?;
            if !line.is_empty() {
                return Err(ParseError::Malformed);
            }
        }
        Resp3Kind::Boolean => {
            let line = scanner.try_next_crlf_line()?;
            if line != b"t" && line != b"f" {
                return Err(ParseError::Malformed);
            }
        }
        Resp3Kind::Number => {
            let line = scanner.try_next_crlf_line()?;
            if parse_signed(line).is_none() {
                return Err(ParseError::CannotParseInteger);
            }
        }
        Resp3Kind::Double => {
            let line = scanner.try_next_crlf_line()?;
            parse_double(line)?;
        }
        Resp3Kind::BigNumber => {
            let line = scanner.try_next_crlf_line()?;
            validate_big_number(line)?;
        }
        Resp3Kind::SimpleString | Resp3Kind::SimpleError => {
            scanner.try_next_crlf_line()?;
        }
        Resp3Kind::BlobString | Resp3Kind::BlobError | Resp3Kind::VerbatimString => {
            let len_line = scanner.try_next_crlf_line()?;
            let len = parse_unsigned(len_line).ok_or(ParseError::Malformed)? as usize;
            let payload = scanner.try_next_terminated_chunk(len)?;
            if kind == Resp3Kind::VerbatimString && (payload.len() < 4 || payload[3] != b':') {
                return Err(ParseError::MissingColonInVerbatimString);
            }
        }
        Resp3Kind::Array | Resp3Kind::Set | Resp3Kind::Push => {
            let count_line = scanner.try_next_crlf_line()?;
            let count = parse_unsigned(count_line).ok_or(ParseError::Malformed)?;
            for _ in 0..count {
                validate_next(scanner, depth + 1)?;
            }
        }
        Resp3Kind::Map | Resp3Kind::Attribute => {
            let count_line = scanner.try_next_crlf_line()?;
            let count = parse_unsigned(count_line).ok_or(ParseError::Malformed)?;
            // one key and one value per advertised entry
            for _ in 0..count {
                validate_next(scanner, depth + 1)?;
                validate_next(scanner, depth + 1)?;
            }
        }
    }
    Ok(kind)
}

/// The textual double forms Redis emits: the usual decimal/exponent
/// renderings plus `inf`, `-inf` and `nan`
fn parse_double(line: &[u8]) -> ParseResult<f64> {
    core::str::from_utf8(line)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::CannotParseDouble)
}

/// A big number is a non-empty run of decimal digits with at most one
/// leading `-`
fn validate_big_number(line: &[u8]) -> ParseResult<()> {
    let digits = match line.split_first() {
        Some((b'-', rest)) => rest,
        _ => line,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::Malformed);
    }
    Ok(())
}

impl Resp3Token {
    pub const fn kind(&self) -> Resp3Kind {
        self.kind
    }
    /// The exact wire bytes of this token, trailing CRLF included
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    /// Test/diagnostic convenience: copy one token out of a plain slice.
    /// `Ok(None)` means the slice holds only a prefix of a token
    pub fn try_from_slice(buf: &[u8]) -> ParseResult<Option<Resp3Token>> {
        Ok(validate_one(buf)?.map(|(kind, len)| Resp3Token {
            kind,
            data: Bytes::copy_from_slice(&buf[..len]),
        }))
    }
    /// For aggregates, the advertised entry count (map-like aggregates count
    /// *pairs* here, matching the wire header)
    pub fn aggregate_len(&self) -> Option<usize> {
        if self.kind.is_aggregate() {
            let (count, _) = self.aggregate_header();
            Some(count)
        } else {
            None
        }
    }
    /// Iterate over the validated child tokens of an aggregate. For scalar
    /// tokens the iterator is simply empty. Consuming the iterator never
    /// fails: everything it walks was validated when the token was framed.
    /// Map-like aggregates yield their 2N children flat, in key, value order
    pub fn children(&self) -> Resp3Children<'_> {
        if self.kind.is_aggregate() {
            let (count, header_len) = self.aggregate_header();
            Resp3Children {
                token: self,
                cursor: header_len,
                remaining: if self.kind.is_map_like() {
                    count * 2
                } else {
                    count
                },
            }
        } else {
            Resp3Children {
                token: self,
                cursor: self.data.len(),
                remaining: 0,
            }
        }
    }
    /// Decode the aggregate header: `(entry count, header length)`
    fn aggregate_header(&self) -> (usize, usize) {
        debug_assert!(self.kind.is_aggregate());
        let mut scanner = Scanner::new(&self.data[1..]);
        unsafe {
            // UNSAFE(@ohsayan): the token was validated when it was framed
            let line = scanner.try_next_crlf_line().unsafe_unwrap();
            (parse_unsigned(line).unsafe_unwrap() as usize, 1 + scanner.cursor())
        }
    }
    /// Lazily produce the structured form of this token by re-walking the
    /// validated byte view
    pub fn value(&self) -> Resp3Value {
        let mut scanner = Scanner::new(&self.data);
        unsafe {
            // UNSAFE(@ohsayan): the token was validated when it was framed
            decode_value(&self.data, &mut scanner).unsafe_unwrap()
        }
    }
}

/// Decode one structured value off the scanner. `data` must be the `Bytes`
/// the scanner is walking so payloads can be sliced out without copying
fn decode_value(data: &Bytes, scanner: &mut Scanner) -> ParseResult<Resp3Value> {
    let tsymbol = scanner.try_next_byte().ok_or(ParseError::NotEnough)?;
    let kind = Resp3Kind::from_leading_byte(tsymbol).ok_or(ParseError::InvalidLeadingByte)?;
    let ret = match kind {
        Resp3Kind::Null => {
            scanner.try_next_crlf_line()?;
            Resp3Value::Null
        }
        Resp3Kind::Boolean => {
            let line = scanner.try_next_crlf_line()?;
            Resp3Value::Boolean(line == b"t")
        }
        Resp3Kind::Number => {
            let line = scanner.try_next_crlf_line()?;
            Resp3Value::Number(parse_signed(line).ok_or(ParseError::CannotParseInteger)?)
        }
        Resp3Kind::Double => {
            let line = scanner.try_next_crlf_line()?;
            Resp3Value::Double(parse_double(line)?)
        }
        Resp3Kind::BigNumber => {
            let start = scanner.cursor();
            let line = scanner.try_next_crlf_line()?;
            Resp3Value::BigNumber(data.slice(start..start + line.len()))
        }
        Resp3Kind::SimpleString | Resp3Kind::SimpleError => {
            let start = scanner.cursor();
            let line = scanner.try_next_crlf_line()?;
            let payload = data.slice(start..start + line.len());
            if kind == Resp3Kind::SimpleString {
                Resp3Value::SimpleString(payload)
            } else {
                Resp3Value::SimpleError(payload)
            }
        }
        Resp3Kind::BlobString | Resp3Kind::BlobError => {
            let len_line = scanner.try_next_crlf_line()?;
            let len = parse_unsigned(len_line).ok_or(ParseError::Malformed)? as usize;
            let start = scanner.cursor();
            scanner.try_next_terminated_chunk(len)?;
            let payload = data.slice(start..start + len);
            if kind == Resp3Kind::BlobString {
                Resp3Value::BlobString(payload)
            } else {
                Resp3Value::BlobError(payload)
            }
        }
        Resp3Kind::VerbatimString => {
            let len_line = scanner.try_next_crlf_line()?;
            let len = parse_unsigned(len_line).ok_or(ParseError::Malformed)? as usize;
            let start = scanner.cursor();
            let payload = scanner.try_next_terminated_chunk(len)?;
            if payload.len() < 4 || payload[3] != b':' {
                return Err(ParseError::MissingColonInVerbatimString);
            }
            Resp3Value::VerbatimString {
                format: [payload[0], payload[1], payload[2]],
                data: data.slice(start + 4..start + len),
            }
        }
        Resp3Kind::Array | Resp3Kind::Set | Resp3Kind::Push => {
            let count_line = scanner.try_next_crlf_line()?;
            let count = parse_unsigned(count_line).ok_or(ParseError::Malformed)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(data, scanner)?);
            }
            match kind {
                Resp3Kind::Array => Resp3Value::Array(items),
                Resp3Kind::Set => Resp3Value::Set(items),
                _ => Resp3Value::Push(items),
            }
        }
        Resp3Kind::Map | Resp3Kind::Attribute => {
            let count_line = scanner.try_next_crlf_line()?;
            let count = parse_unsigned(count_line).ok_or(ParseError::Malformed)? as usize;
            let mut pairs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = decode_value(data, scanner)?;
                let value = decode_value(data, scanner)?;
                pairs.push((key, value));
            }
            if kind == Resp3Kind::Map {
                Resp3Value::Map(pairs)
            } else {
                Resp3Value::Attribute(pairs)
            }
        }
    };
    Ok(ret)
}

#[derive(Debug)]
/// Iterator over the validated children of an aggregate token. See
/// [`Resp3Token::children`]
pub struct Resp3Children<'a> {
    token: &'a Resp3Token,
    cursor: usize,
    remaining: usize,
}

impl<'a> Iterator for Resp3Children<'a> {
    type Item = Resp3Token;
    fn next(&mut self) -> Option<Resp3Token> {
        if self.remaining == 0 {
            return None;
        }
        let sub = &self.token.data[self.cursor..];
        let (kind, len) = unsafe {
            // UNSAFE(@ohsayan): the parent was validated when it was framed,
            // so every child in the payload is a complete valid token
            validate_one(sub).unsafe_unwrap().unsafe_unwrap()
        };
        let data = self.token.data.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        self.remaining -= 1;
        Some(Resp3Token { kind, data })
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> ExactSizeIterator for Resp3Children<'a> {}
