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

//! # The command pipeline
//!
//! One connection keeps exactly one of these: a FIFO of single-assignment
//! reply slots, one per command whose bytes have been handed to the socket.
//! The protocol has no request ids, so ordering *is* the correlation: the
//! head of the queue always belongs to the oldest unanswered command. The
//! queue is owned and mutated only by the connection's driver task.

use {
    crate::{
        error::{Error, SableResult},
        protocol::{resp3::Resp3Value, CommandToken},
    },
    std::collections::VecDeque,
    tokio::sync::oneshot,
};

/// The write half of a reply slot: assigned exactly once, with the reply
/// value or the failure
pub type ReplySlot = oneshot::Sender<SableResult<Resp3Value>>;
/// The read half of a reply slot, held by the submitting caller
pub type ReplyHandle = oneshot::Receiver<SableResult<Resp3Value>>;

#[derive(Debug)]
/// An outbound command coupled to its reply slot
pub struct CommandContext {
    pub(crate) token: CommandToken,
    pub(crate) slot: ReplySlot,
}

impl CommandContext {
    /// Couple a command to a fresh reply slot, handing the read half back
    /// to the caller
    pub fn new(token: CommandToken) -> (Self, ReplyHandle) {
        let (slot, handle) = oneshot::channel();
        (Self { token, slot }, handle)
    }
    /// Fail the slot without ever dispatching the command
    pub(crate) fn fail(self, e: Error) {
        let _ = self.slot.send(Err(e));
    }
}

#[derive(Debug)]
/// The in-flight FIFO. Replies resolve slots strictly in enqueue order;
/// nothing is ever reordered, coalesced or dropped
pub(crate) struct CommandPipeline {
    in_flight: VecDeque<ReplySlot>,
}

impl CommandPipeline {
    pub fn new() -> Self {
        Self {
            in_flight: VecDeque::new(),
        }
    }
    /// Append a slot for a command whose bytes just went downstream
    pub fn enqueue(&mut self, slot: ReplySlot) {
        self.in_flight.push_back(slot);
    }
    /// Resolve the oldest slot with a reply value. Returns false if there
    /// was no command in flight (the reply is unmatched)
    pub fn resolve_next(&mut self, value: Resp3Value) -> bool {
        match self.in_flight.pop_front() {
            Some(slot) => {
                // the caller may have stopped waiting; that's their business
                let _ = slot.send(Ok(value));
                true
            }
            None => false,
        }
    }
    /// Fail the oldest slot (server error replies land here). Returns false
    /// if there was no command in flight
    pub fn fail_next(&mut self, e: Error) -> bool {
        match self.in_flight.pop_front() {
            Some(slot) => {
                let _ = slot.send(Err(e));
                true
            }
            None => false,
        }
    }
    /// Fail every queued slot, oldest first. Used when the stream becomes
    /// unrecoverable; after this the queue is empty
    pub fn fail_all(&mut self, mut mk: impl FnMut() -> Error) {
        while let Some(slot) = self.in_flight.pop_front() {
            let _ = slot.send(Err(mk()));
        }
    }
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
