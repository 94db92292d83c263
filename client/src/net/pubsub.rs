/*
 * Created on Sun Apr 07 2024
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

//! # The Pub/Sub multiplexer
//!
//! Sits in front of the command pipeline and pulls server-pushed Pub/Sub
//! traffic out of the inbound stream before it can be (mis)taken for a
//! command reply. Everything else passes through untouched. In RESP2 the
//! server reuses plain arrays for pushes, so arrays are only intercepted
//! while subscriptions are active; RESP3 `Push` frames are always
//! out-of-band by construction.

use {
    crate::protocol::{resp3::Resp3Value, CommandToken},
    bytes::Bytes,
    std::collections::HashMap,
    tokio::sync::mpsc,
};

/// Where intercepted messages for one subscription go
pub type MessageSink = mpsc::UnboundedSender<PubSubMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// What a subscription is keyed on: an exact channel name, or a glob
/// pattern (`PSUBSCRIBE` semantics)
pub enum SubscriptionTarget {
    Channel(String),
    Pattern(String),
}

impl SubscriptionTarget {
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern(pattern.into())
    }
    pub fn name(&self) -> &str {
        match self {
            Self::Channel(name) | Self::Pattern(name) => name,
        }
    }
    pub(crate) fn subscribe_command(&self) -> CommandToken {
        match self {
            Self::Channel(name) => CommandToken::new("SUBSCRIBE").arg(name),
            Self::Pattern(pattern) => CommandToken::new("PSUBSCRIBE").arg(pattern),
        }
    }
    pub(crate) fn unsubscribe_command(&self) -> CommandToken {
        match self {
            Self::Channel(name) => CommandToken::new("UNSUBSCRIBE").arg(name),
            Self::Pattern(pattern) => CommandToken::new("PUNSUBSCRIBE").arg(pattern),
        }
    }
}

#[derive(Debug, Clone)]
/// One message delivered to a subscriber, in the server's send order
pub struct PubSubMessage {
    pub channel: String,
    /// Set iff this arrived through a pattern subscription
    pub pattern: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug)]
/// What the multiplexer decided about one inbound value
pub(crate) enum Intercept {
    /// Pub/Sub traffic; it was dispatched (or dropped) and must not reach
    /// the command pipeline
    Consumed,
    /// Not ours; forward to the command pipeline
    Pass(Resp3Value),
}

enum Shape {
    Message,
    PatternMessage,
    Ack,
    NotPubSub,
}

fn classify(items: &[Resp3Value]) -> Shape {
    let kind = match items.first().and_then(Resp3Value::as_bytes) {
        Some(kind) => kind,
        None => return Shape::NotPubSub,
    };
    if kind == b"message" && items.len() == 3 {
        Shape::Message
    } else if kind == b"pmessage" && items.len() == 4 {
        Shape::PatternMessage
    } else if items.len() == 3
        && (kind == b"subscribe"
            || kind == b"unsubscribe"
            || kind == b"psubscribe"
            || kind == b"punsubscribe")
    {
        Shape::Ack
    } else {
        Shape::NotPubSub
    }
}

fn stringify(value: &Resp3Value) -> Option<String> {
    value
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

fn payload_bytes(value: Resp3Value) -> Bytes {
    match value {
        Resp3Value::SimpleString(b) | Resp3Value::BlobString(b) => b,
        Resp3Value::VerbatimString { data, .. } => data,
        // pub/sub payloads are bulk strings; anything else is a server
        // quirk we refuse to guess about
        _ => Bytes::new(),
    }
}

#[derive(Debug)]
/// The subscription set of one connection. Owned and mutated only by the
/// connection's driver task
pub(crate) struct PubSubRouter {
    channels: HashMap<String, MessageSink>,
    patterns: HashMap<String, MessageSink>,
    dead: Vec<SubscriptionTarget>,
}

impl PubSubRouter {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            patterns: HashMap::new(),
            dead: Vec::new(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
    /// Register a receiver. Returns true if this target is new and a
    /// subscribe command should go out; re-adding replaces the sink
    pub fn add(&mut self, target: SubscriptionTarget, sink: MessageSink) -> bool {
        match target {
            SubscriptionTarget::Channel(name) => self.channels.insert(name, sink).is_none(),
            SubscriptionTarget::Pattern(pattern) => self.patterns.insert(pattern, sink).is_none(),
        }
    }
    /// Drop a receiver. Returns true if it existed and an unsubscribe
    /// command should go out
    pub fn remove(&mut self, target: &SubscriptionTarget) -> bool {
        match target {
            SubscriptionTarget::Channel(name) => self.channels.remove(name).is_some(),
            SubscriptionTarget::Pattern(pattern) => self.patterns.remove(pattern).is_some(),
        }
    }
    /// Subscriptions whose receivers went away mid-dispatch; the driver
    /// unsubscribes them
    pub fn take_dead(&mut self) -> Vec<SubscriptionTarget> {
        core::mem::take(&mut self.dead)
    }
    /// Look at one inbound value and either consume it as Pub/Sub traffic
    /// or hand it back for the command pipeline
    pub fn intercept(&mut self, value: Resp3Value) -> Intercept {
        let shape = match &value {
            Resp3Value::Push(items) => classify(items),
            Resp3Value::Array(items) if !self.is_empty() => classify(items),
            _ => Shape::NotPubSub,
        };
        let items = match shape {
            Shape::NotPubSub => return Intercept::Pass(value),
            Shape::Ack => {
                log::debug!("pub/sub subscription state change acknowledged");
                return Intercept::Consumed;
            }
            _ => match value {
                Resp3Value::Push(items) | Resp3Value::Array(items) => items,
                _ => unreachable!("classified value is an aggregate"),
            },
        };
        match shape {
            Shape::Message => self.dispatch_message(items),
            _ => self.dispatch_pattern_message(items),
        }
        Intercept::Consumed
    }
    /// `["message", channel, payload]`
    fn dispatch_message(&mut self, mut items: Vec<Resp3Value>) {
        let payload = payload_bytes(items.pop().unwrap_or(Resp3Value::Null));
        let channel = match items.pop().as_ref().and_then(stringify) {
            Some(channel) => channel,
            None => return,
        };
        let delivered = match self.channels.get(&channel) {
            Some(sink) => sink
                .send(PubSubMessage {
                    channel: channel.clone(),
                    pattern: None,
                    payload,
                })
                .is_ok(),
            None => {
                log::warn!("pub/sub message on {channel:?} has no receiver");
                return;
            }
        };
        if !delivered {
            self.channels.remove(&channel);
            self.dead.push(SubscriptionTarget::Channel(channel));
        }
    }
    /// `["pmessage", pattern, channel, payload]`
    fn dispatch_pattern_message(&mut self, mut items: Vec<Resp3Value>) {
        let payload = payload_bytes(items.pop().unwrap_or(Resp3Value::Null));
        let channel = match items.pop().as_ref().and_then(stringify) {
            Some(channel) => channel,
            None => return,
        };
        let pattern = match items.pop().as_ref().and_then(stringify) {
            Some(pattern) => pattern,
            None => return,
        };
        let delivered = match self.patterns.get(&pattern) {
            Some(sink) => sink
                .send(PubSubMessage {
                    channel,
                    pattern: Some(pattern.clone()),
                    payload,
                })
                .is_ok(),
            None => {
                log::warn!("pub/sub pmessage for {pattern:?} has no receiver");
                return;
            }
        };
        if !delivered {
            self.patterns.remove(&pattern);
            self.dead.push(SubscriptionTarget::Pattern(pattern));
        }
    }
}
