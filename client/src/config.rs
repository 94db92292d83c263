/*
 * Created on Sun Mar 24 2024
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

//! Client configuration. Everything here is programmatic: there are no
//! config files, environment variables or CLI flags in the runtime itself.

use {
    crate::{cluster::NodeId, protocol::resp3::Resp3Value},
    std::{fmt, sync::Arc, time::Duration},
};

/// Callback run when an established connection closes without a `QUIT`
pub type CloseCallback = Arc<dyn Fn(&NodeId) + Send + Sync>;
/// Callback run for out-of-band push tokens that are not Pub/Sub traffic
/// (client tracking invalidations and friends). Delivered uninterpreted
pub type PushCallback = Arc<dyn Fn(Resp3Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which protocol generation a connection speaks. RESP3 connections send
/// `HELLO 3` during the handshake
pub enum ProtocolVersion {
    Resp2,
    Resp3,
}

#[derive(Clone)]
/// `AUTH` credentials. The username form requires a server that understands
/// two-argument `AUTH` (6.0 and up)
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password_only(password: impl Into<String>) -> Self {
        Self {
            username: None,
            password: password.into(),
        }
    }
    pub fn with_username(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log the password
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the pool bounds its connection count
pub enum CapacityMode {
    /// Hard cap on everything: leased + idle + connecting never exceeds N
    StrictMax(usize),
    /// Idle is capped at N; transient connections beyond that may be opened
    /// to satisfy load and are closed on return once idle is full
    PreservedMax(usize),
}

impl CapacityMode {
    /// May the pool start another connect given the current accounting?
    pub(crate) fn may_open(&self, leased: usize, idle: usize, connecting: usize) -> bool {
        match self {
            Self::StrictMax(cap) => leased + idle + connecting < *cap,
            Self::PreservedMax(cap) => leased + connecting < *cap,
        }
    }
    /// Should a returned connection go back into the idle bag?
    pub(crate) fn return_to_idle(&self, idle: usize) -> bool {
        match self {
            // the strict invariant was enforced when the connection opened
            Self::StrictMax(_) => true,
            Self::PreservedMax(cap) => idle < *cap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Exponential backoff pacing for reconnect attempts: attempt k waits
/// `initial · factor^(k-1)`. The counter is only reset by a successful
/// connect
pub struct RetryBackoff {
    pub initial: Duration,
    pub factor: u32,
}

impl RetryBackoff {
    pub const fn new(initial: Duration, factor: u32) -> Self {
        Self { initial, factor }
    }
    /// The delay before attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(self.factor.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, Default)]
/// TLS transport options, handed to the openssl connector
pub struct TlsOpts {
    /// CA bundle for peer verification
    pub ca_file: Option<String>,
    /// Client certificate chain (mutual TLS)
    pub cert_file: Option<String>,
    /// Private key for `cert_file`, PEM
    pub key_file: Option<String>,
    /// Skip peer verification. Never use outside a test bench
    pub accept_invalid_certs: bool,
}

#[derive(Clone)]
/// The full configuration surface of the runtime
pub struct ClientConfig {
    /// Seed server list. The pool round-robins new connects over this set;
    /// it can be swapped at runtime via the pool
    pub initial_addresses: Vec<NodeId>,
    /// Floor of connections the pool keeps open even when idle
    pub minimum_connections: usize,
    pub capacity_mode: CapacityMode,
    pub retry_backoff: RetryBackoff,
    /// Deadline for a single lease request
    pub retry_timeout: Duration,
    pub credentials: Option<Credentials>,
    /// Issued as `SELECT n` after authentication (skipped for 0)
    pub initial_database: Option<u32>,
    pub protocol: ProtocolVersion,
    /// Flush the socket after every command (default), or only on explicit
    /// flush calls
    pub auto_flush: bool,
    /// How long a graceful close waits for the `QUIT` reply
    pub graceful_close_deadline: Duration,
    pub tls: Option<TlsOpts>,
    pub on_unexpected_close: Option<CloseCallback>,
    pub on_push: Option<PushCallback>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_addresses: Vec::new(),
            minimum_connections: 0,
            capacity_mode: CapacityMode::StrictMax(8),
            retry_backoff: RetryBackoff::new(Duration::from_millis(100), 2),
            retry_timeout: Duration::from_secs(10),
            credentials: None,
            initial_database: None,
            protocol: ProtocolVersion::Resp2,
            auto_flush: true,
            graceful_close_deadline: Duration::from_secs(1),
            tls: None,
            on_unexpected_close: None,
            on_push: None,
        }
    }
}

impl ClientConfig {
    pub fn new(address: NodeId) -> Self {
        Self {
            initial_addresses: vec![address],
            ..Self::default()
        }
    }
    pub fn address(mut self, address: NodeId) -> Self {
        self.initial_addresses.push(address);
        self
    }
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
    pub fn initial_database(mut self, db: u32) -> Self {
        self.initial_database = Some(db);
        self
    }
    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }
    pub fn capacity_mode(mut self, mode: CapacityMode) -> Self {
        self.capacity_mode = mode;
        self
    }
    pub fn minimum_connections(mut self, min: usize) -> Self {
        self.minimum_connections = min;
        self
    }
    pub fn retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }
    pub fn auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }
    pub fn tls(mut self, tls: TlsOpts) -> Self {
        self.tls = Some(tls);
        self
    }
    pub fn on_unexpected_close(mut self, cb: CloseCallback) -> Self {
        self.on_unexpected_close = Some(cb);
        self
    }
    pub fn on_push(mut self, cb: PushCallback) -> Self {
        self.on_push = Some(cb);
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("initial_addresses", &self.initial_addresses)
            .field("minimum_connections", &self.minimum_connections)
            .field("capacity_mode", &self.capacity_mode)
            .field("retry_backoff", &self.retry_backoff)
            .field("retry_timeout", &self.retry_timeout)
            .field("credentials", &self.credentials)
            .field("initial_database", &self.initial_database)
            .field("protocol", &self.protocol)
            .field("auto_flush", &self.auto_flush)
            .field("graceful_close_deadline", &self.graceful_close_deadline)
            .field("tls", &self.tls)
            .field(
                "on_unexpected_close",
                &self.on_unexpected_close.as_ref().map(|_| "<callback>"),
            )
            .field("on_push", &self.on_push.as_ref().map(|_| "<callback>"))
            .finish()
    }
}
