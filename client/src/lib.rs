/*
 * Created on Fri Mar 08 2024
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

//! # Sable
//!
//! Sable is a non-blocking client runtime for Redis-style key/value
//! servers. The crate deliberately stays at the runtime layer: it frames
//! and validates both generations of the wire protocol (RESP2/RESP3),
//! pipelines commands over single connections with strict reply ordering,
//! pools connections with bounded capacity and exponential-backoff
//! reconnect, and routes keys to cluster shards via hash slots. Typed
//! command wrappers (`GET`, `HSET`, ...) are a layer for crates above this
//! one; down here a command is an opaque token and a reply is a value.
//!
//! The shortest path to a running command:
//!
//! ```no_run
//! use sable::{
//!     cluster::NodeId, config::ClientConfig, pool::ConnectionPool,
//!     protocol::CommandToken,
//! };
//!
//! # async fn demo() -> sable::error::SableResult<()> {
//! let pool = ConnectionPool::new(ClientConfig::new(NodeId::new("127.0.0.1", 6379)))?;
//! let reply = pool.execute(CommandToken::new("PING")).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod util;
// modules
pub mod cluster;
pub mod config;
pub mod error;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod stats;
// endof modules

pub use self::{
    config::ClientConfig,
    error::{Error, SableResult},
    net::Connection,
    pool::ConnectionPool,
    protocol::CommandToken,
};
