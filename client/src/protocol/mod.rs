/*
 * Created on Mon Mar 11 2024
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

//! # The RESP wire protocol
//!
//! This module implements both generations of the Redis Serialization Protocol:
//! the classic five-type RESP2 form and the extended RESP3 form with its 15
//! type identifiers. The parsers here are *streaming* parsers: they operate on
//! whatever bytes have been buffered so far and either yield one complete
//! token, ask for more bytes, or fail with a structured error. The cursor is
//! never advanced for an incomplete token, so a caller can simply retry after
//! the next socket read.

// modules
pub mod resp2;
pub mod resp3;
pub mod scanner;

use {
    self::resp3::Resp3Value,
    crate::error::{Error, SableResult},
    bytes::Bytes,
    core::fmt,
};

consts! {
    /// The maximum aggregate nesting depth either codec will walk before
    /// giving up on the stream
    pub MAX_NESTING_DEPTH: usize = 1000;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// # Parser errors
///
/// Everything that can go wrong while framing a token off the wire. With the
/// exception of [`ParseError::NotEnough`] (which simply means "read more and
/// retry"), any of these renders the stream unrecoverable
pub enum ParseError {
    /// Didn't get the number of expected bytes. Not a failure; frame again
    /// once more data is in
    NotEnough,
    /// The leading type byte is not part of the protocol alphabet
    InvalidLeadingByte,
    /// The token is structurally invalid (bad length line, missing
    /// terminator, illegal payload)
    Malformed,
    /// Aggregate nesting went past [`MAX_NESTING_DEPTH`]
    TooDeeplyNestedAggregatedTypes,
    /// An integer token body did not parse as a signed 64-bit integer
    CannotParseInteger,
    /// A double token body did not parse as a 64-bit float
    CannotParseDouble,
    /// A big number token body is not an optionally-signed decimal string
    CannotParseBigNumber,
    /// A verbatim string payload is missing the `:` after its three byte
    /// format tag
    MissingColonInVerbatimString,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotEnough => "need more bytes",
            Self::InvalidLeadingByte => "invalid leading byte",
            Self::Malformed => "malformed token",
            Self::TooDeeplyNestedAggregatedTypes => "too deeply nested aggregated types",
            Self::CannotParseInteger => "cannot parse integer",
            Self::CannotParseDouble => "cannot parse double",
            Self::CannotParseBigNumber => "cannot parse big number",
            Self::MissingColonInVerbatimString => "missing colon in verbatim string",
        };
        f.write_str(msg)
    }
}

/// A generic result to indicate parsing errors through the [`ParseError`] enum
pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// An outbound command token: the verb plus its arguments, all opaque byte
/// blobs as far as the runtime is concerned. On the wire this is always a
/// RESP array of bulk strings, in both protocol generations
pub struct CommandToken {
    parts: Vec<Bytes>,
}

impl CommandToken {
    /// Start a new command with the given verb
    pub fn new(verb: impl AsRef<[u8]>) -> Self {
        Self {
            parts: vec![Bytes::copy_from_slice(verb.as_ref())],
        }
    }
    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }
    /// The command verb (the first token part)
    pub fn verb(&self) -> &[u8] {
        // a token is never constructed empty
        &self.parts[0]
    }
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
    /// Serialize self into the canonical wire form: an array of bulk strings
    pub(crate) fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(b'*');
        buf.extend_from_slice(self.parts.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        for part in &self.parts {
            buf.push(b'$');
            buf.extend_from_slice(part.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(part);
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// Conversion from the reply value algebra into concrete Rust types. Typed
/// command wrappers live outside the runtime and are expected to funnel
/// through this trait
pub trait FromValue: Sized {
    fn from_value(value: Resp3Value) -> SableResult<Self>;
}

impl FromValue for Resp3Value {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_: Resp3Value) -> SableResult<Self> {
        Ok(())
    }
}

impl FromValue for i64 {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::Number(int) => Ok(int),
            Resp3Value::SimpleString(ref b) | Resp3Value::BlobString(ref b) => {
                scanner::parse_signed(b).ok_or(Error::FailedValueConversion("i64"))
            }
            _ => Err(Error::FailedValueConversion("i64")),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::Double(dbl) => Ok(dbl),
            Resp3Value::Number(int) => Ok(int as f64),
            Resp3Value::SimpleString(ref b) | Resp3Value::BlobString(ref b) => {
                core::str::from_utf8(b)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error::FailedValueConversion("f64"))
            }
            _ => Err(Error::FailedValueConversion("f64")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::Boolean(b) => Ok(b),
            Resp3Value::Number(0) => Ok(false),
            Resp3Value::Number(1) => Ok(true),
            _ => Err(Error::FailedValueConversion("bool")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::SimpleString(b) | Resp3Value::BlobString(b) => Ok(b.to_vec()),
            Resp3Value::VerbatimString { data, .. } => Ok(data.to_vec()),
            _ => Err(Error::FailedValueConversion("Vec<u8>")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::SimpleString(ref b) | Resp3Value::BlobString(ref b) => {
                core::str::from_utf8(b)
                    .map(str::to_owned)
                    .map_err(|_| Error::FailedValueConversion("String"))
            }
            Resp3Value::VerbatimString { ref data, .. } => core::str::from_utf8(data)
                .map(str::to_owned)
                .map_err(|_| Error::FailedValueConversion("String")),
            Resp3Value::Number(int) => Ok(int.to_string()),
            Resp3Value::BigNumber(ref digits) => core::str::from_utf8(digits)
                .map(str::to_owned)
                .map_err(|_| Error::FailedValueConversion("String")),
            _ => Err(Error::FailedValueConversion("String")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Resp3Value) -> SableResult<Self> {
        match value {
            Resp3Value::Array(items) | Resp3Value::Set(items) | Resp3Value::Push(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            _ => Err(Error::FailedValueConversion("Vec<_>")),
        }
    }
}
