/*
 * Created on Tue Apr 02 2024
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

//! # Connections
//!
//! A [`Connection`] is a cheap cloneable handle onto one transport channel.
//! The socket itself, the read buffer, the in-flight command FIFO and the
//! Pub/Sub subscription set are all owned by a single driver task spawned
//! when the connection opens; handles talk to it over an event channel and
//! get replies back through single-assignment slots. That one-task-owns-
//! everything shape is what makes the ordering contract trivial: commands
//! are written in the order their events arrive, and replies resolve the
//! FIFO strictly front-first.
//!
//! Lifecycle: `Connecting → Authenticating → Ready → Quiescing → Closed`.
//! Submissions are only accepted in `Ready` (the handshake itself uses an
//! internal path that also runs in `Authenticating`). A graceful close
//! writes `QUIT` and waits for the reply up to a deadline; a hard close
//! just tears the transport down.

pub mod pipeline;
pub mod pubsub;
mod tcp;
mod tls;

use {
    self::{
        pipeline::{CommandContext, CommandPipeline, ReplyHandle, ReplySlot},
        pubsub::{Intercept, MessageSink, PubSubRouter, SubscriptionTarget},
    },
    crate::{
        cluster::NodeId,
        config::{ClientConfig, CloseCallback, ProtocolVersion, PushCallback},
        error::{Error, SableResult},
        protocol::{resp2, resp3, resp3::Resp3Value, CommandToken, FromValue},
        stats,
        util::compiler,
    },
    bytes::{Buf, BytesMut},
    std::{
        fmt,
        sync::{
            atomic::{AtomicU64, AtomicU8, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
        net::TcpStream,
        sync::{mpsc, oneshot},
        time,
    },
    tokio_openssl::SslStream,
};

pub type IoResult<T> = Result<T, std::io::Error>;

const BUF_WRITE_CAP: usize = 16384;
const BUF_READ_CAP: usize = 16384;

/// This is a "marker trait" that ensures that no silly types are passed
/// into the connection driver
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl Socket for TcpStream {}
impl Socket for SslStream<TcpStream> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Where a connection is in its lifecycle
pub enum ConnState {
    /// transport being established
    Connecting = 0,
    /// transport up; handshake (`AUTH`/`HELLO`/`SELECT`) in progress
    Authenticating = 1,
    /// open for business
    Ready = 2,
    /// `QUIT` sent; draining, no new submissions
    Quiescing = 3,
    Closed = 4,
}

impl ConnState {
    const fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Authenticating,
            2 => Self::Ready,
            3 => Self::Quiescing,
            _ => Self::Closed,
        }
    }
}

static CONN_ID: AtomicU64 = AtomicU64::new(0);

/// Events a handle can send to its driver task
enum Event {
    Dispatch(CommandContext),
    Flush(oneshot::Sender<SableResult<()>>),
    SetAutoFlush(bool),
    Subscribe {
        target: SubscriptionTarget,
        sink: MessageSink,
        done: oneshot::Sender<SableResult<()>>,
    },
    Unsubscribe {
        target: SubscriptionTarget,
        done: oneshot::Sender<SableResult<()>>,
    },
    Quit(ReplySlot),
    Close,
}

#[derive(Clone)]
/// A handle onto one open connection. Cloning is cheap and every clone
/// talks to the same driver task
pub struct Connection {
    id: u64,
    addr: NodeId,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<Event>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Open a connection to `addr` and run the full handshake: transport,
    /// then `AUTH` (if credentials are configured), then `HELLO 3` (RESP3),
    /// then `SELECT` (if a non-zero initial database is configured). Any
    /// handshake failure closes the nascent connection and surfaces the
    /// error
    pub async fn open(addr: &NodeId, config: &ClientConfig) -> SableResult<Connection> {
        log::debug!("connecting to {addr}");
        let conn = match &config.tls {
            Some(opts) => {
                let stream = tls::connect(addr, opts).await?;
                Self::spawn_driver(stream, addr, config)
            }
            None => {
                let stream = tcp::connect(addr).await?;
                Self::spawn_driver(stream, addr, config)
            }
        };
        if let Err(e) = conn.handshake(config).await {
            log::debug!("handshake with {addr} failed: {e}");
            conn.close();
            return Err(e);
        }
        conn.state.store(ConnState::Ready as u8, Ordering::Release);
        stats::global().incr_connections_opened();
        log::debug!("connection {} to {addr} ready", conn.id);
        Ok(conn)
    }
    fn spawn_driver<S: Socket + 'static>(
        stream: S,
        addr: &NodeId,
        config: &ClientConfig,
    ) -> Connection {
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ConnState::Authenticating as u8));
        let id = CONN_ID.fetch_add(1, Ordering::Relaxed);
        let driver = Driver {
            socket: BufWriter::with_capacity(BUF_WRITE_CAP, stream),
            buffer: BytesMut::with_capacity(BUF_READ_CAP),
            events: events_rx,
            pipeline: CommandPipeline::new(),
            pubsub: PubSubRouter::new(),
            state: state.clone(),
            mode: config.protocol,
            auto_flush: config.auto_flush,
            on_unexpected_close: config.on_unexpected_close.clone(),
            on_push: config.on_push.clone(),
            addr: addr.clone(),
            id,
        };
        tokio::spawn(driver.run());
        Connection {
            id,
            addr: addr.clone(),
            state,
            events,
        }
    }
    async fn handshake(&self, config: &ClientConfig) -> SableResult<()> {
        if let Some(creds) = &config.credentials {
            let cmd = match &creds.username {
                Some(username) => CommandToken::new("AUTH").arg(username).arg(&creds.password),
                None => CommandToken::new("AUTH").arg(&creds.password),
            };
            self.execute_any(cmd).await?;
        }
        if config.protocol == ProtocolVersion::Resp3 {
            self.execute_any(CommandToken::new("HELLO").arg("3")).await?;
        }
        if let Some(db) = config.initial_database {
            if db != 0 {
                self.execute_any(CommandToken::new("SELECT").arg(db.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
    pub const fn id(&self) -> u64 {
        self.id
    }
    pub const fn addr(&self) -> &NodeId {
        &self.addr
    }
    pub fn state(&self) -> ConnState {
        ConnState::from_raw(self.state.load(Ordering::Acquire))
    }
    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }
    /// Submit one command and await its reply. Fails synchronously with
    /// [`Error::ConnectionClosed`] unless the connection is `Ready`
    pub async fn execute(&self, command: CommandToken) -> SableResult<Resp3Value> {
        if compiler::likely(self.is_ready()) {
            self.execute_any(command).await
        } else {
            Err(Error::ConnectionClosed)
        }
    }
    /// [`Connection::execute`] plus a typed conversion of the reply
    pub async fn execute_as<T: FromValue>(&self, command: CommandToken) -> SableResult<T> {
        T::from_value(self.execute(command).await?)
    }
    /// Submit one command *without* awaiting, returning the reply handle.
    /// This is how callers pipeline: dispatch a burst, then await the
    /// handles, which resolve in dispatch order
    pub fn dispatch(&self, command: CommandToken) -> SableResult<ReplyHandle> {
        if !self.is_ready() {
            return Err(Error::ConnectionClosed);
        }
        let (ctx, handle) = CommandContext::new(command);
        self.events
            .send(Event::Dispatch(ctx))
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(handle)
    }
    /// The internal submission path: also usable while authenticating
    async fn execute_any(&self, command: CommandToken) -> SableResult<Resp3Value> {
        let (ctx, handle) = CommandContext::new(command);
        self.events
            .send(Event::Dispatch(ctx))
            .map_err(|_| Error::ConnectionClosed)?;
        match handle.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
    /// Flush any buffered writes down the transport
    pub async fn flush(&self) -> SableResult<()> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Flush(tx))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
    /// Toggle flush-per-command. Turning it on flushes anything pending
    pub fn set_auto_flush(&self, auto_flush: bool) {
        let _ = self.events.send(Event::SetAutoFlush(auto_flush));
    }
    /// Register a Pub/Sub receiver, issuing the subscribe command if this
    /// target is new on this connection
    pub async fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: MessageSink,
    ) -> SableResult<()> {
        if !self.is_ready() {
            return Err(Error::ConnectionClosed);
        }
        let (done, rx) = oneshot::channel();
        self.events
            .send(Event::Subscribe { target, sink, done })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
    /// Drop a Pub/Sub receiver, issuing the unsubscribe command if it was
    /// registered
    pub async fn unsubscribe(&self, target: SubscriptionTarget) -> SableResult<()> {
        let (done, rx) = oneshot::channel();
        self.events
            .send(Event::Unsubscribe { target, done })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
    /// Graceful close: `QUIT`, await its reply up to `deadline`, then close
    /// the transport. Safe to call more than once
    pub async fn quit(&self, deadline: Duration) -> SableResult<()> {
        let (slot, rx) = oneshot::channel();
        if self.events.send(Event::Quit(slot)).is_err() {
            // driver already gone
            return Ok(());
        }
        let _ = time::timeout(deadline, rx).await;
        self.close();
        Ok(())
    }
    /// Hard close: tear the transport down without `QUIT`. In-flight
    /// commands fail with [`Error::ConnectionClosed`]
    pub fn close(&self) {
        let _ = self.events.send(Event::Close);
    }
}

/// How the driver loop ended
enum Exit {
    /// we closed: `Close` event, graceful drain, or all handles dropped
    Deliberate,
    /// the peer or the transport failed us
    Unexpected(Error),
}

/// The per-connection driver: sole owner of the socket, read buffer,
/// in-flight FIFO and subscription set
struct Driver<S: Socket> {
    socket: BufWriter<S>,
    buffer: BytesMut,
    events: mpsc::UnboundedReceiver<Event>,
    pipeline: CommandPipeline,
    pubsub: PubSubRouter,
    state: Arc<AtomicU8>,
    mode: ProtocolVersion,
    auto_flush: bool,
    on_unexpected_close: Option<CloseCallback>,
    on_push: Option<PushCallback>,
    addr: NodeId,
    id: u64,
}

async fn read_some<S: Socket>(
    socket: &mut BufWriter<S>,
    buffer: &mut BytesMut,
) -> IoResult<usize> {
    socket.read_buf(buffer).await
}

impl<S: Socket> Driver<S> {
    async fn run(mut self) {
        let exit = self.run_loop().await;
        self.shutdown(exit).await;
    }
    async fn run_loop(&mut self) -> Exit {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => match self.handle_event(event).await {
                        Ok(false) => {}
                        Ok(true) => return Exit::Deliberate,
                        Err(e) => return Exit::Unexpected(e),
                    },
                    // every handle is gone; nothing can ever be submitted
                    None => return Exit::Deliberate,
                },
                read = read_some(&mut self.socket, &mut self.buffer) => match read {
                    Ok(0) => {
                        return if self.state() == ConnState::Quiescing {
                            // the server hanging up after QUIT is the
                            // expected end of a graceful close
                            Exit::Deliberate
                        } else {
                            Exit::Unexpected(Error::ConnectionClosed)
                        };
                    }
                    Ok(_) => {
                        if let Err(e) = self.drain_inbound().await {
                            return Exit::Unexpected(e);
                        }
                    }
                    Err(e) => return Exit::Unexpected(Error::Io(e)),
                },
            }
        }
    }
    fn state(&self) -> ConnState {
        ConnState::from_raw(self.state.load(Ordering::Acquire))
    }
    /// Returns `Ok(true)` when the driver should exit deliberately
    async fn handle_event(&mut self, event: Event) -> SableResult<bool> {
        match event {
            Event::Dispatch(ctx) => {
                if compiler::unlikely(self.state() >= ConnState::Quiescing) {
                    ctx.fail(Error::ConnectionClosed);
                    return Ok(false);
                }
                self.write_command(ctx).await?;
            }
            Event::Flush(done) => match self.socket.flush().await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(e) => {
                    let _ = done.send(Err(Error::ConnectionClosed));
                    return Err(Error::Io(e));
                }
            },
            Event::SetAutoFlush(auto_flush) => {
                // leaving write-only mode must push out anything pending
                if auto_flush && !self.auto_flush {
                    self.socket.flush().await.map_err(Error::Io)?;
                }
                self.auto_flush = auto_flush;
            }
            Event::Subscribe { target, sink, done } => {
                let newly_added = self.pubsub.add(target.clone(), sink);
                if newly_added {
                    if let Err(e) = self.write_raw(target.subscribe_command()).await {
                        let _ = done.send(Err(Error::ConnectionClosed));
                        return Err(e);
                    }
                }
                let _ = done.send(Ok(()));
            }
            Event::Unsubscribe { target, done } => {
                if self.pubsub.remove(&target) {
                    if let Err(e) = self.write_raw(target.unsubscribe_command()).await {
                        let _ = done.send(Err(Error::ConnectionClosed));
                        return Err(e);
                    }
                }
                let _ = done.send(Ok(()));
            }
            Event::Quit(slot) => {
                log::debug!("connection {} quiescing", self.id);
                self.state
                    .store(ConnState::Quiescing as u8, Ordering::Release);
                let ctx = CommandContext {
                    token: CommandToken::new("QUIT"),
                    slot,
                };
                self.write_command(ctx).await?;
            }
            Event::Close => return Ok(true),
        }
        Ok(false)
    }
    async fn write_command(&mut self, ctx: CommandContext) -> SableResult<()> {
        let CommandContext { token, slot } = ctx;
        let mut out = Vec::with_capacity(64);
        token.encode_to(&mut out);
        if let Err(e) = self.socket.write_all(&out).await {
            // the command never made it onto the wire, so its slot must
            // not linger in the FIFO
            let _ = slot.send(Err(Error::ConnectionClosed));
            return Err(Error::Io(e));
        }
        self.pipeline.enqueue(slot);
        stats::global().incr_commands_dispatched();
        // the handshake and QUIT must hit the wire whatever the flush mode
        if self.auto_flush || self.state() != ConnState::Ready {
            self.socket.flush().await.map_err(Error::Io)?;
        }
        Ok(())
    }
    /// Write a command with no reply slot: the subscribe family, whose
    /// acknowledgements arrive as push-shaped frames, not replies
    async fn write_raw(&mut self, token: CommandToken) -> SableResult<()> {
        let mut out = Vec::with_capacity(64);
        token.encode_to(&mut out);
        self.socket.write_all(&out).await.map_err(Error::Io)?;
        if self.auto_flush {
            self.socket.flush().await.map_err(Error::Io)?;
        }
        Ok(())
    }
    /// Frame and route every complete token sitting in the read buffer
    async fn drain_inbound(&mut self) -> SableResult<()> {
        loop {
            let value = match self.mode {
                ProtocolVersion::Resp2 => match resp2::decode(&self.buffer) {
                    Ok(None) => break,
                    Ok(Some((value, consumed))) => {
                        self.buffer.advance(consumed);
                        value.into_resp3()
                    }
                    Err(e) => return Err(Error::Protocol(e)),
                },
                ProtocolVersion::Resp3 => match resp3::try_next_token(&mut self.buffer) {
                    Ok(None) => break,
                    Ok(Some(token)) => token.value(),
                    Err(e) => {
                        log::error!(
                            "connection {}: framing failed ({}) with {} bytes buffered",
                            self.id,
                            e.kind,
                            e.buffer.len()
                        );
                        return Err(Error::Protocol(e.kind));
                    }
                },
            };
            stats::global().incr_replies_received();
            self.route_inbound(value);
            // unsubscribe anything whose receiver went away mid-dispatch
            for target in self.pubsub.take_dead() {
                self.write_raw(target.unsubscribe_command()).await?;
            }
        }
        Ok(())
    }
    fn route_inbound(&mut self, value: Resp3Value) {
        let value = match self.pubsub.intercept(value) {
            Intercept::Consumed => return,
            Intercept::Pass(value) => value,
        };
        if matches!(value, Resp3Value::Push(_) | Resp3Value::Attribute(_)) {
            // out-of-band frames that must not consume a reply slot: pushes
            // that aren't pub/sub traffic (client tracking invalidations),
            // and attributes, which the server sends *in addition to* the
            // actual reply. Both go to the user uninterpreted
            match &self.on_push {
                Some(cb) => cb(value),
                None => log::warn!("connection {}: dropping out-of-band frame", self.id),
            }
            return;
        }
        let matched = match value {
            Resp3Value::SimpleError(msg) => self
                .pipeline
                .fail_next(Error::Server(String::from_utf8_lossy(&msg).into_owned())),
            Resp3Value::BlobError(msg) => self
                .pipeline
                .fail_next(Error::Server(String::from_utf8_lossy(&msg).into_owned())),
            value => self.pipeline.resolve_next(value),
        };
        if compiler::unlikely(!matched) {
            log::warn!("connection {}: reply with no command in flight", self.id);
        }
    }
    async fn shutdown(&mut self, exit: Exit) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        match exit {
            Exit::Deliberate => {
                self.pipeline.fail_all(|| Error::ConnectionClosed);
            }
            Exit::Unexpected(e) => {
                log::error!("connection {} to {} failed: {e}", self.id, self.addr);
                stats::global().incr_unexpected_closes();
                match e {
                    Error::Protocol(kind) => self.pipeline.fail_all(|| Error::Protocol(kind)),
                    _ => self.pipeline.fail_all(|| Error::ConnectionClosed),
                }
                if let Some(cb) = &self.on_unexpected_close {
                    cb(&self.addr);
                }
            }
        }
        let _ = self.socket.shutdown().await;
        // fail whatever raced into the event queue after the decision to
        // exit; nothing may be silently dropped
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::Dispatch(ctx) => ctx.fail(Error::ConnectionClosed),
                Event::Flush(done) => {
                    let _ = done.send(Err(Error::ConnectionClosed));
                }
                Event::Subscribe { done, .. } | Event::Unsubscribe { done, .. } => {
                    let _ = done.send(Err(Error::ConnectionClosed));
                }
                Event::Quit(slot) => {
                    let _ = slot.send(Err(Error::ConnectionClosed));
                }
                Event::SetAutoFlush(_) | Event::Close => {}
            }
        }
        log::debug!("connection {} to {} closed", self.id, self.addr);
    }
}
