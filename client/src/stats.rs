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

//! Process-wide runtime statistics. Counters only; observation is the
//! caller's business. May be read/written from any thread

use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL: Statistics = Statistics::new();

/// The global statistics collector
pub fn global() -> &'static Statistics {
    &GLOBAL
}

#[derive(Debug)]
pub struct Statistics {
    connections_opened: AtomicU64,
    connect_failures: AtomicU64,
    commands_dispatched: AtomicU64,
    replies_received: AtomicU64,
    unexpected_closes: AtomicU64,
}

impl Statistics {
    const fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            unexpected_closes: AtomicU64::new(0),
        }
    }
    pub(crate) fn incr_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_commands_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_unexpected_closes(&self) {
        self.unexpected_closes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }
    pub fn commands_dispatched(&self) -> u64 {
        self.commands_dispatched.load(Ordering::Relaxed)
    }
    pub fn replies_received(&self) -> u64 {
        self.replies_received.load(Ordering::Relaxed)
    }
    pub fn unexpected_closes(&self) -> u64 {
        self.unexpected_closes.load(Ordering::Relaxed)
    }
}

cfg_test! {
    impl Statistics {
        /// Zero every counter. Tests that assert on deltas should read
        /// before and after instead; this is for tests that need a clean
        /// slate
        pub fn reset(&self) {
            self.connections_opened.store(0, Ordering::Relaxed);
            self.connect_failures.store(0, Ordering::Relaxed);
            self.commands_dispatched.store(0, Ordering::Relaxed);
            self.replies_received.store(0, Ordering::Relaxed);
            self.unexpected_closes.store(0, Ordering::Relaxed);
        }
    }
}
