/*
 * Created on Sun Mar 10 2024
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

use {
    crate::protocol::ParseError,
    openssl::{error::ErrorStack as SslErrorStack, ssl::Error as SslError},
    std::{fmt, io::Error as IoError},
};

pub type SableResult<T> = Result<T, Error>;

#[derive(Debug)]
/// The client error type. Every failure surfaced by the runtime is one of
/// these variants; nothing is swallowed
pub enum Error {
    /// the peer sent bytes that don't frame as a protocol token; the stream
    /// is unrecoverable past this point
    Protocol(ParseError),
    /// an error reply from the server; the stream itself is healthy
    Server(String),
    /// the connection is (or just became) unusable
    ConnectionClosed,
    /// an internal invariant did not hold
    Assertion(String),
    /// a reply value could not be converted into the requested type
    FailedValueConversion(&'static str),
    /// the pool was closed
    PoolClosed,
    /// a lease request outlived its deadline
    TimedOutWaitingForConnection,
    /// the pool has no target addresses to connect to
    NoAvailableConnectionTargets,
    /// I/O error
    Io(IoError),
    /// TLS error
    Tls(SslError),
}

impl Error {
    /// If this is a server error reply, return its message
    pub fn server_error_message(&self) -> Option<&str> {
        match self {
            Self::Server(msg) => Some(msg),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(perr) => write!(f, "Protocol error: {}", perr),
            Self::Server(msg) => write!(f, "Server error: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Assertion(detail) => write!(f, "Assertion failure: {}", detail),
            Self::FailedValueConversion(target) => {
                write!(f, "Failed to convert the reply value into {}", target)
            }
            Self::PoolClosed => write!(f, "Pool closed"),
            Self::TimedOutWaitingForConnection => {
                write!(f, "Timed out waiting for a pooled connection")
            }
            Self::NoAvailableConnectionTargets => {
                write!(f, "No connection targets are available")
            }
            Self::Io(ioe) => write!(f, "I/O error: {}", ioe),
            Self::Tls(terr) => write!(f, "TLS error: {}", terr),
        }
    }
}

impl From<ParseError> for Error {
    fn from(perr: ParseError) -> Self {
        Self::Protocol(perr)
    }
}

impl From<IoError> for Error {
    fn from(ioe: IoError) -> Self {
        Self::Io(ioe)
    }
}

impl From<SslError> for Error {
    fn from(sslerr: SslError) -> Self {
        Self::Tls(sslerr)
    }
}

impl From<SslErrorStack> for Error {
    fn from(estack: SslErrorStack) -> Self {
        Self::Tls(estack.into())
    }
}
