/*
 * state.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Session states, flags and the counters shared with the manager.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Manager-assigned session identifier.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Resolve the URL, decide cache reuse, open or attach to a transport.
    Setup = 0,
    /// Send the request.
    Connected = 1,
    WaitForReply = 2,
    DataExchange = 3,
    DataTransferred = 4,
    Disconnected = 5,
    Error = 6,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::DataTransferred | SessionState::Disconnected | SessionState::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Setup => "setup",
            SessionState::Connected => "connected",
            SessionState::WaitForReply => "wait-for-reply",
            SessionState::DataExchange => "data-exchange",
            SessionState::DataTransferred => "data-transferred",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Setup,
            1 => SessionState::Connected,
            2 => SessionState::WaitForReply,
            3 => SessionState::DataExchange,
            4 => SessionState::DataTransferred,
            5 => SessionState::Disconnected,
            _ => SessionState::Error,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// Never use or create a cache entry.
    pub not_cached: bool,
    /// Cache in memory even when a cache directory is configured.
    pub memory_cache: bool,
    /// Keep the cache entry after the last session detaches.
    pub persistent: bool,
    /// Ask for ICY metadata and strip it from the body.
    pub icy_metadata: bool,
    pub no_proxy: bool,
    /// Send HEAD; no body is delivered.
    pub head_only: bool,
}

impl SessionFlags {
    pub const NOT_CACHED: u32 = 1;
    pub const MEMORY_CACHE: u32 = 1 << 1;
    pub const PERSISTENT: u32 = 1 << 2;
    pub const ICY_METADATA: u32 = 1 << 3;
    pub const NO_PROXY: u32 = 1 << 4;
    pub const HEAD_ONLY: u32 = 1 << 5;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            not_cached: bits & Self::NOT_CACHED != 0,
            memory_cache: bits & Self::MEMORY_CACHE != 0,
            persistent: bits & Self::PERSISTENT != 0,
            icy_metadata: bits & Self::ICY_METADATA != 0,
            no_proxy: bits & Self::NO_PROXY != 0,
            head_only: bits & Self::HEAD_ONLY != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut b = 0;
        if self.not_cached {
            b |= Self::NOT_CACHED;
        }
        if self.memory_cache {
            b |= Self::MEMORY_CACHE;
        }
        if self.persistent {
            b |= Self::PERSISTENT;
        }
        if self.icy_metadata {
            b |= Self::ICY_METADATA;
        }
        if self.no_proxy {
            b |= Self::NO_PROXY;
        }
        if self.head_only {
            b |= Self::HEAD_ONLY;
        }
        b
    }
}

/// Result of one `Session::fetch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    /// Bytes copied into the caller's buffer.
    Data(usize),
    /// Nothing available now; poll again after `retry_in`.
    Empty { retry_in: Duration },
    /// All data delivered (`DataTransferred`).
    Finished,
    /// Aborted or closed.
    Disconnected,
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_done: u64,
    pub total: Option<u64>,
    pub bytes_per_sec: u64,
    pub state: SessionState,
}

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Counters published by a session and read by the manager and other threads.
#[derive(Debug)]
pub struct SessionShared {
    id: SessionId,
    bytes_done: AtomicU64,
    total: AtomicU64,
    rate: AtomicU64,
    state: AtomicU8,
    abort: AtomicBool,
    max_rate: AtomicU64,
}

impl SessionShared {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            bytes_done: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            rate: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Setup as u8),
            abort: AtomicBool::new(false),
            max_rate: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn stats(&self) -> SessionStats {
        let total = self.total.load(Ordering::Acquire);
        SessionStats {
            bytes_done: self.bytes_done.load(Ordering::Acquire),
            total: (total != UNKNOWN_TOTAL).then_some(total),
            bytes_per_sec: self.rate.load(Ordering::Acquire),
            state: self.state(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_progress(&self, bytes_done: u64, total: Option<u64>) {
        self.bytes_done.store(bytes_done, Ordering::Release);
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Release);
    }

    pub(crate) fn set_rate(&self, bps: u64) {
        self.rate.store(bps, Ordering::Release);
    }

    /// Current rate, counted only while receiving body bytes.
    pub fn active_rate(&self) -> u64 {
        if self.state() == SessionState::DataExchange {
            self.rate.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Ask the session to abort; honoured at its next poll.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Per-session cap in bytes/s; 0 is unlimited.
    pub fn set_max_rate(&self, bps: u64) {
        self.max_rate.store(bps, Ordering::Release);
    }

    pub fn max_rate(&self) -> u64 {
        self.max_rate.load(Ordering::Acquire)
    }
}
