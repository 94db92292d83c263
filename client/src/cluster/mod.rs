/*
 * Created on Thu Mar 21 2024
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

//! # Cluster slot routing
//!
//! A clustered deployment shards its keyspace over 16384 hash slots. A key's
//! slot is the CRC16-XMODEM checksum of its *hash tag* modulo 16384, where
//! the hash tag is the part of the key between the first `{` and the next
//! `}` (if that substring is non-empty), and otherwise the whole key. Keys
//! that share a tag land on the same shard, which is what makes multi-key
//! operations possible in a cluster.
//!
//! The [`RoutingTable`] maps slot ranges onto shards and absorbs `MOVED`
//! redirections between full rebuilds; [`execute_clustered`] drives a
//! command through the table with transparent redirect handling.


use {
    crate::{
        error::{Error, SableResult},
        pool::ConnectionPool,
        protocol::{resp3::Resp3Value, CommandToken},
    },
    crc::{Crc, CRC_16_XMODEM},
    parking_lot::RwLock,
    std::{collections::HashMap, fmt, ops::RangeInclusive},
};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

consts! {
    /// The fixed number of hash slots in a cluster
    pub SLOT_COUNT: u16 = 16384;
    /// How many redirections we will chase for a single command before
    /// concluding that the cluster is unstable
    MAX_REDIRECTIONS: usize = 5;
}

/// Extract the hash tag of a key: the substring between the first `{` and
/// the next `}`, provided at least one byte sits between them. An empty
/// (`{}`) or unbalanced tag means the whole key participates in hashing
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|b| *b == b'{') {
        let rest = &key[open + 1..];
        if let Some(close) = rest.iter().position(|b| *b == b'}') {
            if close != 0 {
                return &rest[..close];
            }
        }
    }
    key
}

/// Compute the hash slot of a key
pub fn hash_slot(key: &[u8]) -> u16 {
    CRC16.checksum(hash_tag(key)) % SLOT_COUNT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A cluster hash slot, or the sentinel for "not yet known"
pub enum HashSlot {
    Known(u16),
    Unknown,
}

impl HashSlot {
    pub fn of_key(key: &[u8]) -> Self {
        Self::Known(hash_slot(key))
    }
    pub const fn value(&self) -> Option<u16> {
        match self {
            Self::Known(slot) => Some(*slot),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// One addressable server: an endpoint (hostname or address literal) plus a
/// port
pub struct NodeId {
    endpoint: String,
    port: u16,
}

impl NodeId {
    pub fn new(endpoint: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
        }
    }
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
    pub const fn port(&self) -> u16 {
        self.port
    }
    /// Parse an `endpoint:port` string (the form `MOVED`/`ASK` replies use)
    pub fn parse(s: &str) -> Option<Self> {
        let (endpoint, port) = s.rsplit_once(':')?;
        if endpoint.is_empty() {
            return None;
        }
        Some(Self::new(endpoint, port.parse().ok()?))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A shard: the master that owns a slot range plus its replicas
pub struct Shard {
    master: NodeId,
    replicas: Vec<NodeId>,
}

impl Shard {
    pub fn new(master: NodeId, replicas: Vec<NodeId>) -> Self {
        Self { master, replicas }
    }
    pub fn master(&self) -> &NodeId {
        &self.master
    }
    pub fn replicas(&self) -> &[NodeId] {
        &self.replicas
    }
}

#[derive(Debug, Clone)]
struct SlotRange {
    start: u16,
    end: u16,
    shard: Shard,
}

#[derive(Debug, Default)]
/// Maps slot ranges to shards. Lookups binary search the sorted range list;
/// `MOVED` redirections are absorbed into an overlay that wins over the
/// ranges until the next full rebuild
pub struct RoutingTable {
    ranges: Vec<SlotRange>,
    moved: HashMap<u16, NodeId>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Replace the table with a fresh set of slot ranges (clearing any
    /// redirection overlay)
    pub fn rebuild(&mut self, ranges: impl IntoIterator<Item = (RangeInclusive<u16>, Shard)>) {
        self.ranges = ranges
            .into_iter()
            .map(|(range, shard)| SlotRange {
                start: *range.start(),
                end: *range.end(),
                shard,
            })
            .collect();
        self.ranges.sort_by_key(|r| r.start);
        self.moved.clear();
    }
    /// Record a `MOVED` redirection observed for one slot
    pub fn note_moved(&mut self, slot: u16, node: NodeId) {
        self.moved.insert(slot, node);
    }
    /// The shard owning the given slot, per the range list
    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        let idx = self.ranges.partition_point(|r| r.start <= slot);
        if idx == 0 {
            return None;
        }
        let candidate = &self.ranges[idx - 1];
        (slot <= candidate.end).then_some(&candidate.shard)
    }
    /// The node a command for this slot should be sent to, honoring the
    /// redirection overlay
    pub fn node_for_slot(&self, slot: HashSlot) -> Option<NodeId> {
        let slot = slot.value()?;
        if let Some(node) = self.moved.get(&slot) {
            return Some(node.clone());
        }
        self.shard_for_slot(slot).map(|s| s.master().clone())
    }
    pub fn node_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.node_for_slot(HashSlot::of_key(key))
    }
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.moved.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A redirection parsed out of a server error reply
pub enum Redirection {
    Moved { slot: u16, node: NodeId },
    Ask { slot: u16, node: NodeId },
}

impl Redirection {
    /// Parse `MOVED <slot> <endpoint>:<port>` / `ASK <slot> <endpoint>:<port>`
    pub fn parse(message: &str) -> Option<Self> {
        let mut words = message.split_ascii_whitespace();
        let verb = words.next()?;
        let slot: u16 = words.next()?.parse().ok()?;
        if slot >= SLOT_COUNT {
            return None;
        }
        let node = NodeId::parse(words.next()?)?;
        match verb {
            "MOVED" => Some(Self::Moved { slot, node }),
            "ASK" => Some(Self::Ask { slot, node }),
            _ => None,
        }
    }
}

/// Is this server error a `CLUSTERDOWN` condition? Those are surfaced to
/// the caller untouched
pub fn is_cluster_down(message: &str) -> bool {
    message.starts_with("CLUSTERDOWN")
}

#[derive(Debug, Default)]
/// A shared routing table handle for concurrent callers
pub struct ClusterRouter {
    table: RwLock<RoutingTable>,
}

impl ClusterRouter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn rebuild(&self, ranges: impl IntoIterator<Item = (RangeInclusive<u16>, Shard)>) {
        self.table.write().rebuild(ranges)
    }
    pub fn note_moved(&self, slot: u16, node: NodeId) {
        self.table.write().note_moved(slot, node)
    }
    pub fn node_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.table.read().node_for_key(key)
    }
}

/// Run one command against the cluster, routing by `key` and chasing a
/// bounded number of `MOVED`/`ASK` hops. `MOVED` updates the routing
/// table; `ASK` sends a one-shot `ASKING` prelude and does not. Any other
/// server error (`CLUSTERDOWN` included) is surfaced to the caller
pub async fn execute_clustered(
    pool: &ConnectionPool,
    router: &ClusterRouter,
    key: &[u8],
    command: CommandToken,
) -> SableResult<Resp3Value> {
    let mut target = router.node_for_key(key);
    let mut asking = false;
    for _ in 0..MAX_REDIRECTIONS {
        let conn = match &target {
            Some(node) => pool.lease_to(node).await?,
            None => pool.lease().await?,
        };
        if asking {
            conn.execute(CommandToken::new("ASKING")).await?;
        }
        match conn.execute(command.clone()).await {
            Ok(value) => return Ok(value),
            Err(Error::Server(msg)) => match Redirection::parse(&msg) {
                Some(Redirection::Moved { slot, node }) => {
                    log::debug!("slot {slot} moved to {node}; retrying there");
                    router.note_moved(slot, node.clone());
                    target = Some(node);
                    asking = false;
                }
                Some(Redirection::Ask { node, .. }) => {
                    log::debug!("asked to retry on {node}");
                    target = Some(node);
                    asking = true;
                }
                None => return Err(Error::Server(msg)),
            },
            Err(e) => return Err(e),
        }
    }
    Err(Error::Assertion(format!(
        "{MAX_REDIRECTIONS} redirections chased for one command; giving up"
    )))
}
