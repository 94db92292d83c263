/*
 * Created on Thu Apr 18 2024
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

//! # The connection pool
//!
//! A bounded bag of connections over a mutable target-address set. Leasing
//! hands a caller exclusive possession of one connection until the guard is
//! dropped; a caller that needs multi-command atomicity (transactions,
//! subscriptions) simply keeps its lease for the duration.
//!
//! Capacity comes in two flavors (see [`CapacityMode`]): a strict cap on
//! everything the pool owns, or a preserved-idle cap that admits transient
//! overflow connections which are closed on return. Failed connects back
//! off exponentially and the counter only resets once a connect succeeds.
//! Waiters park FIFO and fail with `TimedOutWaitingForConnection` when
//! their deadline fires. All pool state sits behind one mutex; no lock is
//! ever held across an await point.

#[cfg(test)]
mod tests;

use {
    crate::{
        cluster::NodeId,
        config::{CapacityMode, ClientConfig, RetryBackoff},
        error::{Error, SableResult},
        net::{ConnState, Connection},
        protocol::{resp3::Resp3Value, CommandToken},
        stats,
        util::Unwrappable,
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        ops::Deref,
        sync::{Arc, Weak},
        time::Duration,
    },
    tokio::{sync::oneshot, time},
};

#[derive(Debug, Clone)]
/// A shareable handle onto one pool
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    /// per-connection config, with the pool's own close hook composed in
    conn_config: ClientConfig,
    minimum_connections: usize,
    capacity_mode: CapacityMode,
    backoff: RetryBackoff,
    retry_timeout: Duration,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    idle: VecDeque<Connection>,
    leased: usize,
    connecting: usize,
    // waiters receive a fully formed guard so that a lease raced against
    // its own timeout still finds its way back to the pool via Drop
    waiters: VecDeque<oneshot::Sender<PooledConnection>>,
    targets: Vec<NodeId>,
    rr_next: usize,
    backoff_attempt: u32,
    closed: bool,
}

impl PoolState {
    fn active(&self) -> usize {
        self.idle.len() + self.leased + self.connecting
    }
}

impl ConnectionPool {
    /// Build a pool from the given configuration and warm it up to the
    /// configured floor. Must be called within a tokio runtime; connects
    /// run as background tasks
    pub fn new(config: ClientConfig) -> SableResult<Self> {
        if config.initial_addresses.is_empty() {
            return Err(Error::NoAvailableConnectionTargets);
        }
        let user_close_cb = config.on_unexpected_close.clone();
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let weak = weak.clone();
            let mut conn_config = config.clone();
            conn_config.on_unexpected_close = Some(Arc::new(move |addr: &NodeId| {
                if let Some(cb) = &user_close_cb {
                    cb(addr);
                }
                if let Some(inner) = weak.upgrade() {
                    PoolInner::on_unexpected_close(&inner);
                }
            }));
            PoolInner {
                conn_config,
                minimum_connections: config.minimum_connections,
                capacity_mode: config.capacity_mode,
                backoff: config.retry_backoff,
                retry_timeout: config.retry_timeout,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    leased: 0,
                    connecting: 0,
                    waiters: VecDeque::new(),
                    targets: config.initial_addresses.clone(),
                    rr_next: 0,
                    backoff_attempt: 0,
                    closed: false,
                }),
            }
        });
        {
            let mut st = inner.state.lock();
            PoolInner::replenish_floor(&inner, &mut st);
        }
        Ok(Self { inner })
    }
    /// Lease one connection: an idle one if available, a fresh one if
    /// capacity allows, or park FIFO until one frees up. Fails with
    /// [`Error::TimedOutWaitingForConnection`] once `retry_timeout` fires
    pub async fn lease(&self) -> SableResult<PooledConnection> {
        let rx = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::PoolClosed);
            }
            if st.targets.is_empty() {
                return Err(Error::NoAvailableConnectionTargets);
            }
            while let Some(conn) = st.idle.pop_front() {
                if conn.is_ready() {
                    st.leased += 1;
                    return Ok(PooledConnection::new(self.inner.clone(), conn, false));
                }
                // a dead idle connection is just dropped from the books
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(tx);
            if self
                .inner
                .capacity_mode
                .may_open(st.leased, st.idle.len(), st.connecting)
            {
                st.connecting += 1;
                PoolInner::spawn_connect(&self.inner);
            }
            rx
        };
        match time::timeout(self.inner.retry_timeout, rx).await {
            Ok(Ok(guard)) => Ok(guard),
            Ok(Err(_)) => Err(Error::PoolClosed),
            Err(_elapsed) => Err(Error::TimedOutWaitingForConnection),
        }
    }
    /// Lease a connection to one specific node: a matching idle connection
    /// if there is one, else a transient connection opened outside the
    /// round-robin. Used by cluster redirection handling
    pub async fn lease_to(&self, node: &NodeId) -> SableResult<PooledConnection> {
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(pos) = st
                .idle
                .iter()
                .position(|c| c.is_ready() && c.addr() == node)
            {
                if let Some(conn) = st.idle.remove(pos) {
                    st.leased += 1;
                    return Ok(PooledConnection::new(self.inner.clone(), conn, false));
                }
            }
        }
        let conn = Connection::open(node, &self.inner.conn_config).await?;
        Ok(PooledConnection::new(self.inner.clone(), conn, true))
    }
    /// Lease, run one command, return the lease
    pub async fn execute(&self, command: CommandToken) -> SableResult<Resp3Value> {
        let conn = self.lease().await?;
        conn.execute(command).await
    }
    /// Swap the target-address set. Existing connections (leased or idle)
    /// are left alone; only future connects see the new set
    pub fn update_targets(&self, targets: Vec<NodeId>) {
        let mut st = self.inner.state.lock();
        st.targets = targets;
        st.rr_next = 0;
    }
    /// Close the pool: every parked waiter fails with [`Error::PoolClosed`],
    /// idle connections get a graceful `QUIT`, leased connections close
    /// when their guards return them
    pub fn close(&self) {
        let idle = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.waiters.clear();
            core::mem::take(&mut st.idle)
        };
        let deadline = self.inner.conn_config.graceful_close_deadline;
        for conn in idle {
            tokio::spawn(async move {
                let _ = conn.quit(deadline).await;
            });
        }
        log::debug!("pool closed");
    }
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }
    pub fn leased_count(&self) -> usize {
        self.inner.state.lock().leased
    }
}

impl PoolInner {
    /// Start one background connect. The caller must already have bumped
    /// `connecting`
    fn spawn_connect(inner: &Arc<PoolInner>) {
        let inner = inner.clone();
        tokio::spawn(Self::connect_loop(inner));
    }
    /// Keep attempting to connect (rotating over the target set, pacing by
    /// the shared backoff state) until success, pool close, or the target
    /// set empties out
    async fn connect_loop(inner: Arc<PoolInner>) {
        loop {
            let addr = {
                let mut st = inner.state.lock();
                if st.closed || st.targets.is_empty() {
                    st.connecting -= 1;
                    return;
                }
                let addr = st.targets[st.rr_next % st.targets.len()].clone();
                st.rr_next = st.rr_next.wrapping_add(1);
                addr
            };
            match Connection::open(&addr, &inner.conn_config).await {
                Ok(conn) => {
                    let mut st = inner.state.lock();
                    st.connecting -= 1;
                    st.backoff_attempt = 0;
                    if st.closed {
                        drop(st);
                        conn.close();
                    } else {
                        Self::deliver(&inner, &mut st, conn);
                    }
                    return;
                }
                Err(e) => {
                    stats::global().incr_connect_failures();
                    let delay = {
                        let mut st = inner.state.lock();
                        st.backoff_attempt = st.backoff_attempt.saturating_add(1);
                        inner.backoff.delay(st.backoff_attempt)
                    };
                    log::warn!("connect to {addr} failed: {e}; next attempt in {delay:?}");
                    time::sleep(delay).await;
                }
            }
        }
    }
    /// Hand a fresh connection to the oldest live waiter, or bank it as
    /// idle (subject to the capacity mode)
    fn deliver(inner: &Arc<PoolInner>, st: &mut PoolState, conn: Connection) {
        let mut conn = conn;
        while let Some(waiter) = st.waiters.pop_front() {
            st.leased += 1;
            match waiter.send(PooledConnection::new(inner.clone(), conn, false)) {
                Ok(()) => return,
                // that waiter timed out and went away; try the next one
                Err(guard) => {
                    st.leased -= 1;
                    conn = guard.into_inner();
                }
            }
        }
        if conn.is_ready() && inner.capacity_mode.return_to_idle(st.idle.len()) {
            st.idle.push_back(conn);
        } else {
            conn.close();
        }
    }
    /// A lease guard gave its connection back
    fn release(inner: &Arc<PoolInner>, conn: Connection, transient: bool) {
        let mut st = inner.state.lock();
        if !transient {
            st.leased = st.leased.saturating_sub(1);
        }
        if st.closed {
            drop(st);
            conn.close();
            return;
        }
        if !conn.is_ready() {
            // it died while leased; top the floor back up
            Self::replenish_floor(inner, &mut st);
            drop(st);
            conn.close();
            return;
        }
        let mut conn = conn;
        while let Some(waiter) = st.waiters.pop_front() {
            st.leased += 1;
            match waiter.send(PooledConnection::new(inner.clone(), conn, false)) {
                Ok(()) => return,
                Err(guard) => {
                    st.leased -= 1;
                    conn = guard.into_inner();
                }
            }
        }
        if inner.capacity_mode.return_to_idle(st.idle.len()) {
            st.idle.push_back(conn);
        } else {
            drop(st);
            conn.close();
        }
    }
    /// An established connection closed without a `QUIT`
    fn on_unexpected_close(inner: &Arc<PoolInner>) {
        let mut st = inner.state.lock();
        st.idle.retain(|c| c.state() != ConnState::Closed);
        if !st.closed {
            Self::replenish_floor(inner, &mut st);
            // the close may have freed capacity a parked waiter needs
            if !st.waiters.is_empty()
                && inner
                    .capacity_mode
                    .may_open(st.leased, st.idle.len(), st.connecting)
            {
                st.connecting += 1;
                Self::spawn_connect(inner);
            }
        }
    }
    /// Start as many connects as it takes to get back to the configured
    /// minimum
    fn replenish_floor(inner: &Arc<PoolInner>, st: &mut PoolState) {
        while !st.closed && !st.targets.is_empty() && st.active() < inner.minimum_connections {
            st.connecting += 1;
            Self::spawn_connect(inner);
        }
    }
}

#[derive(Debug)]
/// Exclusive possession of one pooled connection. Dereferences to
/// [`Connection`]; dropping the guard returns the connection to the pool
/// (or closes it, per the capacity mode)
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    conn: Option<Connection>,
    /// opened outside capacity accounting (cluster redirection retries)
    transient: bool,
}

impl PooledConnection {
    fn new(inner: Arc<PoolInner>, conn: Connection, transient: bool) -> Self {
        Self {
            inner,
            conn: Some(conn),
            transient,
        }
    }
    /// Take the connection out without returning it to the pool (the
    /// vacated guard's `Drop` is a no-op)
    fn into_inner(mut self) -> Connection {
        unsafe {
            // UNSAFE(@ohsayan): the guard was never vacated before this
            self.conn.take().unsafe_unwrap()
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        unsafe {
            // UNSAFE(@ohsayan): `conn` is only ever vacated on drop
            self.conn.as_ref().unsafe_unwrap()
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            PoolInner::release(&self.inner, conn, self.transient);
        }
    }
}
