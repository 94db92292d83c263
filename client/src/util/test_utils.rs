/*
 * Created on Sun Apr 14 2024
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

//! A miniature in-process server speaking just enough of the protocol for
//! the test suites: a handful of string/number commands, `AUTH`/`HELLO`/
//! `SELECT`/`QUIT`, Pub/Sub, and a couple of purpose-built failure knobs
//! (abrupt closes, forced `MOVED` redirections). Every test talks to a real
//! socket on localhost; nothing here mocks the transport.

use {
    crate::{
        cluster::NodeId,
        protocol::{resp2, resp2::Resp2Value},
    },
    bytes::{Buf, BytesMut},
    parking_lot::Mutex,
    std::{collections::HashMap, net::SocketAddr, sync::Arc},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
        task::JoinHandle,
    },
};

#[derive(Debug, Default)]
pub struct StubOptions {
    /// expected `AUTH` password; unauthenticated data commands are refused
    pub password: Option<String>,
    /// reply `-MOVED <slot> <addr>` to every data command
    pub moved_to: Option<(u16, String)>,
    /// reply `-CLUSTERDOWN The cluster is down` to every data command
    pub cluster_down: bool,
}

struct Shared {
    opts: StubOptions,
    kv: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    subscribers: Mutex<Vec<(Vec<u8>, mpsc::UnboundedSender<(Vec<u8>, Vec<u8>)>)>>,
}

pub struct StubServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl StubServer {
    pub async fn start() -> Self {
        Self::start_with(StubOptions::default()).await
    }
    pub async fn start_with(opts: StubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            opts,
            kv: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });
        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_conn(stream, accept_shared.clone()));
            }
        });
        Self {
            addr,
            shared,
            handle,
        }
    }
    pub fn node(&self) -> NodeId {
        NodeId::new(self.addr.ip().to_string(), self.addr.port())
    }
    /// Seed a key directly into the stub's table
    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.shared
            .kv
            .lock()
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn command_parts(value: Resp2Value) -> Option<Vec<Vec<u8>>> {
    match value {
        Resp2Value::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                Resp2Value::BulkString(Some(b)) => Some(b.to_vec()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

async fn handle_conn(mut stream: TcpStream, shared: Arc<Shared>) {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<(Vec<u8>, Vec<u8>)>();
    let mut buffer = BytesMut::with_capacity(4096);
    let mut session = Session {
        resp3: false,
        authed: shared.opts.password.is_none(),
    };
    loop {
        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                loop {
                    match resp2::decode(&buffer) {
                        Ok(None) => break,
                        Err(_) => return,
                        Ok(Some((value, consumed))) => {
                            buffer.advance(consumed);
                            let Some(parts) = command_parts(value) else {
                                return;
                            };
                            if !respond(&mut stream, &shared, &push_tx, &mut session, parts).await {
                                return;
                            }
                        }
                    }
                }
            }
            push = push_rx.recv() => {
                let Some((channel, payload)) = push else { return };
                if write_push(
                    &mut stream,
                    session.resp3,
                    &[b"message".to_vec(), channel, payload],
                )
                .await
                .is_err()
                {
                    return;
                }
            }
        }
    }
}

struct Session {
    resp3: bool,
    authed: bool,
}

async fn respond(
    stream: &mut TcpStream,
    shared: &Arc<Shared>,
    push_tx: &mpsc::UnboundedSender<(Vec<u8>, Vec<u8>)>,
    session: &mut Session,
    parts: Vec<Vec<u8>>,
) -> bool {
    let Some(verb) = parts.first().map(|v| v.to_ascii_uppercase()) else {
        return false;
    };
    let is_data_command = [
        &b"SET"[..],
        b"GET",
        b"DEL",
        b"INCR",
        b"DECR",
        b"INCRBY",
        b"DECRBY",
    ]
    .contains(&verb.as_slice());
    let r = if verb == b"PING" {
        write_simple(stream, b"PONG").await
    } else if verb == b"ECHO" && parts.len() == 2 {
        write_bulk(stream, session.resp3, Some(&parts[1])).await
    } else if verb == b"AUTH" {
        let given = parts.last().map(Vec::as_slice);
        let expected = shared.opts.password.as_deref().map(str::as_bytes);
        if expected.is_none() || given == expected {
            session.authed = true;
            write_simple(stream, b"OK").await
        } else {
            write_error(stream, b"WRONGPASS invalid username-password pair").await
        }
    } else if verb == b"SELECT" {
        write_simple(stream, b"OK").await
    } else if verb == b"HELLO" {
        session.resp3 = parts.get(1).map(Vec::as_slice) == Some(&b"3"[..]);
        if session.resp3 {
            stream.write_all(b"%1\r\n+proto\r\n:3\r\n").await
        } else {
            stream.write_all(b"*2\r\n$5\r\nproto\r\n:2\r\n").await
        }
    } else if verb == b"ATTRIB" {
        // test knob: an attribute frame riding in front of the real reply
        let ok = stream.write_all(b"|1\r\n+ttl\r\n:3600\r\n").await;
        if ok.is_err() {
            return false;
        }
        write_simple(stream, b"OK").await
    } else if verb == b"QUIT" {
        let _ = write_simple(stream, b"OK").await;
        let _ = stream.flush().await;
        return false;
    } else if verb == b"BYE" {
        // test knob: hang up without replying
        return false;
    } else if (verb == b"SUBSCRIBE" || verb == b"PSUBSCRIBE") && parts.len() >= 2 {
        let mut ok = Ok(());
        for channel in &parts[1..] {
            shared
                .subscribers
                .lock()
                .push((channel.clone(), push_tx.clone()));
            let ack = if verb == b"SUBSCRIBE" {
                b"subscribe".to_vec()
            } else {
                b"psubscribe".to_vec()
            };
            ok = write_sub_ack(stream, session.resp3, &ack, channel).await;
            if ok.is_err() {
                break;
            }
        }
        ok
    } else if (verb == b"UNSUBSCRIBE" || verb == b"PUNSUBSCRIBE") && parts.len() >= 2 {
        let mut ok = Ok(());
        for channel in &parts[1..] {
            shared.subscribers.lock().retain(|(ch, _)| ch != channel);
            let ack = if verb == b"UNSUBSCRIBE" {
                b"unsubscribe".to_vec()
            } else {
                b"punsubscribe".to_vec()
            };
            ok = write_sub_ack(stream, session.resp3, &ack, channel).await;
            if ok.is_err() {
                break;
            }
        }
        ok
    } else if verb == b"PUBLISH" && parts.len() == 3 {
        let mut delivered = 0i64;
        for (ch, tx) in shared.subscribers.lock().iter() {
            if ch == &parts[1] && tx.send((parts[1].clone(), parts[2].clone())).is_ok() {
                delivered += 1;
            }
        }
        write_int(stream, delivered).await
    } else if is_data_command {
        if !session.authed {
            write_error(stream, b"NOAUTH Authentication required").await
        } else if let Some((slot, addr)) = &shared.opts.moved_to {
            let msg = format!("MOVED {slot} {addr}");
            write_error(stream, msg.as_bytes()).await
        } else if shared.opts.cluster_down {
            write_error(stream, b"CLUSTERDOWN The cluster is down").await
        } else {
            data_command(stream, shared, session, &verb, &parts).await
        }
    } else {
        write_error(stream, b"ERR unknown command").await
    };
    r.is_ok()
}

async fn data_command(
    stream: &mut TcpStream,
    shared: &Arc<Shared>,
    session: &Session,
    verb: &[u8],
    parts: &[Vec<u8>],
) -> std::io::Result<()> {
    if verb == b"SET" && parts.len() == 3 {
        shared.kv.lock().insert(parts[1].clone(), parts[2].clone());
        write_simple(stream, b"OK").await
    } else if verb == b"GET" && parts.len() == 2 {
        let value = shared.kv.lock().get(&parts[1]).cloned();
        write_bulk(stream, session.resp3, value.as_deref()).await
    } else if verb == b"DEL" {
        let removed = {
            let mut kv = shared.kv.lock();
            let mut removed = 0i64;
            for key in &parts[1..] {
                removed += kv.remove(key).is_some() as i64;
            }
            removed
        };
        write_int(stream, removed).await
    } else if verb == b"INCR" || verb == b"DECR" || verb == b"INCRBY" || verb == b"DECRBY" {
        let by: i64 = if verb == b"INCR" {
            1
        } else if verb == b"DECR" {
            -1
        } else {
            let step: i64 = parts
                .get(2)
                .and_then(|p| std::str::from_utf8(p).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if verb == b"DECRBY" {
                -step
            } else {
                step
            }
        };
        let next = {
            let mut kv = shared.kv.lock();
            let current: i64 = kv
                .get(&parts[1])
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let next = current + by;
            kv.insert(parts[1].clone(), next.to_string().into_bytes());
            next
        };
        write_int(stream, next).await
    } else {
        write_error(stream, b"ERR wrong number of arguments").await
    }
}

async fn write_simple(stream: &mut TcpStream, s: &[u8]) -> std::io::Result<()> {
    let mut out = vec![b'+'];
    out.extend_from_slice(s);
    out.extend_from_slice(b"\r\n");
    stream.write_all(&out).await
}

async fn write_error(stream: &mut TcpStream, msg: &[u8]) -> std::io::Result<()> {
    let mut out = vec![b'-'];
    out.extend_from_slice(msg);
    out.extend_from_slice(b"\r\n");
    stream.write_all(&out).await
}

async fn write_int(stream: &mut TcpStream, int: i64) -> std::io::Result<()> {
    stream
        .write_all(format!(":{int}\r\n").as_bytes())
        .await
}

async fn write_bulk(
    stream: &mut TcpStream,
    resp3: bool,
    payload: Option<&[u8]>,
) -> std::io::Result<()> {
    match payload {
        None if resp3 => stream.write_all(b"_\r\n").await,
        None => stream.write_all(b"$-1\r\n").await,
        Some(payload) => {
            let mut out = format!("${}\r\n", payload.len()).into_bytes();
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
            stream.write_all(&out).await
        }
    }
}

async fn write_sub_ack(
    stream: &mut TcpStream,
    resp3: bool,
    kind: &[u8],
    channel: &[u8],
) -> std::io::Result<()> {
    let mut out = if resp3 {
        b">3\r\n".to_vec()
    } else {
        b"*3\r\n".to_vec()
    };
    out.extend_from_slice(format!("${}\r\n", kind.len()).as_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n", channel.len()).as_bytes());
    out.extend_from_slice(channel);
    out.extend_from_slice(b"\r\n:1\r\n");
    stream.write_all(&out).await
}

async fn write_push(
    stream: &mut TcpStream,
    resp3: bool,
    items: &[Vec<u8>],
) -> std::io::Result<()> {
    let mut out = if resp3 {
        format!(">{}\r\n", items.len()).into_bytes()
    } else {
        format!("*{}\r\n", items.len()).into_bytes()
    };
    for item in items {
        out.extend_from_slice(format!("${}\r\n", item.len()).as_bytes());
        out.extend_from_slice(item);
        out.extend_from_slice(b"\r\n");
    }
    stream.write_all(&out).await
}
