/*
 * mod.rs
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

//! Connection multiplexer: one physical transport shared by several sessions, each bound to
//! one stream at a time.
//!
//! The multiplexer owns the link and the [`StreamProvider`]. Whichever attached session polls
//! first reads the link for everybody; decoded events are routed by stream id into per-session
//! inboxes. The read half of the link has its own lock, so a session waiting on the link never
//! blocks a sibling's submit, reset or detach. Detaching the last session tears the transport
//! down; detaching any other session hands socket ownership to a sibling.

mod provider;

pub use provider::{
    error_to_string, MuxKind, MuxRole, QuicConnector, StreamEvents, StreamProvider,
    StreamProviderFactory, ERROR_CANCEL, ERROR_INTERNAL_ERROR, ERROR_NO_ERROR,
    ERROR_PROTOCOL_ERROR, ERROR_REFUSED_STREAM,
};

use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::net::AsyncStream;
use crate::protocol::http::RequestHead;
use crate::session::SessionId;

const READ_CHUNK: usize = 16 * 1024;

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Error)]
pub enum MuxError {
    #[error("stream refused by peer ({})", error_to_string(*.0))]
    Refused(u32),

    #[error("stream reset by peer ({})", error_to_string(*.0))]
    StreamReset(u32),

    #[error("multiplexer protocol error: {0}")]
    Protocol(String),

    #[error("multiplexed transport is gone")]
    TransportGone,

    #[error("session is not attached to this multiplexer")]
    NotAttached,

    #[error("multiplexed transport I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        MuxError::Io(Arc::new(e))
    }
}

/// Result of detaching a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Other sessions remain; socket ownership unchanged.
    Detached { remaining: usize },
    /// The detaching session owned the socket; ownership moved to `to`.
    HandedOver { to: SessionId },
    /// It was the last session: the transport is closed.
    TornDown,
}

/// Events drained from a session's inbox by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxRead {
    /// Status and header block, delivered once.
    pub headers: Option<(u16, Vec<(String, String)>)>,
    pub data: Bytes,
    /// The peer ended the stream.
    pub end: bool,
    /// The stream was refused or lost to a shutdown before any body byte: retry elsewhere.
    pub switch: bool,
}

impl MuxRead {
    pub fn is_empty(&self) -> bool {
        self.headers.is_none() && self.data.is_empty() && !self.end && !self.switch
    }
}

#[derive(Debug, Default)]
struct Inbox {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    headers_done: bool,
    headers_taken: bool,
    data: BytesMut,
    received: u64,
    end_stream: bool,
    closed: Option<u32>,
    switch: bool,
}

impl Inbox {
    fn has_news(&self) -> bool {
        (self.headers_done && !self.headers_taken)
            || !self.data.is_empty()
            || self.end_stream
            || self.closed.is_some()
            || self.switch
    }
}

#[derive(Debug)]
struct Slot {
    session: SessionId,
    stream_id: Option<u32>,
    /// Server role: finished and waiting for a peer-opened stream.
    awaiting: bool,
    inbox: Inbox,
}

/// Read side of the link, held only by the session currently reading for everybody.
struct LinkReader {
    half: ReadHalf<Box<dyn AsyncStream>>,
    buf: Vec<u8>,
}

struct MuxInner {
    /// Write side of the link; None once the transport is lost or closed.
    link: Option<WriteHalf<Box<dyn AsyncStream>>>,
    provider: Box<dyn StreamProvider>,
    slots: Vec<Slot>,
    owner: Option<SessionId>,
    /// Output taken from the provider but not yet written.
    pending_write: BytesMut,
}

impl MuxInner {
    fn slot_mut(&mut self, session: SessionId) -> Result<&mut Slot, MuxError> {
        self.slots
            .iter_mut()
            .find(|s| s.session == session)
            .ok_or(MuxError::NotAttached)
    }

    async fn flush(&mut self) -> Result<(), MuxError> {
        let out = self.provider.take_output();
        if !out.is_empty() {
            self.pending_write.extend_from_slice(&out);
        }
        if self.pending_write.is_empty() {
            return Ok(());
        }
        let link = self.link.as_mut().ok_or(MuxError::TransportGone)?;
        link.write_all(&self.pending_write).await?;
        link.flush().await?;
        self.pending_write.clear();
        Ok(())
    }

    fn lose_transport(&mut self) {
        self.link = None;
        for slot in &mut self.slots {
            if slot.stream_id.is_some() && !slot.inbox.end_stream && slot.inbox.closed.is_none() {
                if slot.inbox.received == 0 {
                    slot.inbox.switch = true;
                } else {
                    slot.inbox.closed = Some(ERROR_INTERNAL_ERROR);
                }
            }
        }
    }
}

/// Routes provider events into slot inboxes.
struct Dispatch<'a> {
    slots: &'a mut Vec<Slot>,
    role: MuxRole,
    shutting_down: bool,
    goaway: bool,
    unknown: Vec<u32>,
}

impl Dispatch<'_> {
    fn inbox(&mut self, stream_id: u32) -> Option<&mut Inbox> {
        if let Some(i) = self.slots.iter().position(|s| s.stream_id == Some(stream_id)) {
            return Some(&mut self.slots[i].inbox);
        }
        if self.role == MuxRole::Server {
            if let Some(i) = self.slots.iter().position(|s| s.awaiting) {
                let slot = &mut self.slots[i];
                debug!(target: "corriere::mux", session = slot.session, stream_id, "reassigning session to peer stream");
                slot.awaiting = false;
                slot.stream_id = Some(stream_id);
                slot.inbox = Inbox::default();
                return Some(&mut slot.inbox);
            }
        }
        if !self.unknown.contains(&stream_id) {
            self.unknown.push(stream_id);
        }
        None
    }
}

impl StreamEvents for Dispatch<'_> {
    fn header(&mut self, stream_id: u32, name: &str, value: &str) {
        if let Some(inbox) = self.inbox(stream_id) {
            if name == ":status" {
                inbox.status = value.trim().parse().ok();
            } else if !name.starts_with(':') {
                inbox.headers.push((name.to_string(), value.to_string()));
            }
        }
    }

    fn headers_complete(&mut self, stream_id: u32, end_stream: bool) {
        if let Some(inbox) = self.inbox(stream_id) {
            inbox.headers_done = true;
            inbox.end_stream |= end_stream;
        }
    }

    fn data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        if let Some(inbox) = self.inbox(stream_id) {
            inbox.data.extend_from_slice(data);
            inbox.received += data.len() as u64;
            inbox.end_stream |= end_stream;
        }
    }

    fn stream_closed(&mut self, stream_id: u32, error_code: u32) {
        let shutting_down = self.shutting_down || self.goaway;
        if let Some(inbox) = self.inbox(stream_id) {
            if error_code == ERROR_REFUSED_STREAM
                || (shutting_down && inbox.received == 0 && !inbox.end_stream)
            {
                inbox.switch = true;
            } else {
                inbox.closed = Some(error_code);
            }
        }
    }

    fn goaway(&mut self, last_stream_id: u32, error_code: u32) {
        info!(target: "corriere::mux", last_stream_id, error = error_to_string(error_code), "peer is shutting down");
        self.goaway = true;
        for slot in self.slots.iter_mut() {
            if let Some(id) = slot.stream_id {
                if id > last_stream_id && !slot.inbox.end_stream {
                    slot.inbox.switch = true;
                }
            }
        }
    }
}

/// One shared H2/H3 transport.
pub struct Multiplexer {
    id: u64,
    server_key: String,
    kind: MuxKind,
    role: MuxRole,
    shutdown: AtomicBool,
    torn_down: AtomicBool,
    attached: AtomicUsize,
    inner: Mutex<MuxInner>,
    /// Lock order: `reader` before `inner`.
    reader: Mutex<Option<LinkReader>>,
    /// Signalled after every read of the link.
    news: Notify,
    /// Runtime the multiplexer was created on, for releases from outside it.
    handle: Option<Handle>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("server_key", &self.server_key)
            .field("kind", &self.kind)
            .field("attached", &self.attached.load(Ordering::Relaxed))
            .finish()
    }
}

impl Multiplexer {
    pub fn new(
        server_key: impl Into<String>,
        role: MuxRole,
        link: Box<dyn AsyncStream>,
        provider: Box<dyn StreamProvider>,
    ) -> Arc<Self> {
        let kind = provider.kind();
        let id = NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed);
        let server_key = server_key.into();
        debug!(target: "corriere::mux", id, %server_key, kind = kind.alpn(), "new multiplexer");
        let (read_half, write_half) = tokio::io::split(link);
        Arc::new(Self {
            id,
            server_key,
            kind,
            role,
            shutdown: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            attached: AtomicUsize::new(0),
            inner: Mutex::new(MuxInner {
                link: Some(write_half),
                provider,
                slots: Vec::new(),
                owner: None,
                pending_write: BytesMut::new(),
            }),
            reader: Mutex::new(Some(LinkReader {
                half: read_half,
                buf: vec![0u8; READ_CHUNK],
            })),
            news: Notify::new(),
            handle: Handle::try_current().ok(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_key(&self) -> &str {
        &self.server_key
    }

    pub fn kind(&self) -> MuxKind {
        self.kind
    }

    pub fn session_count(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Can take new sessions.
    pub fn is_usable(&self) -> bool {
        !self.is_shutting_down() && !self.is_torn_down()
    }

    pub fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Returns the number of attached sessions.
    pub async fn attach(&self, session: SessionId) -> Result<usize, MuxError> {
        let mut inner = self.inner.lock().await;
        if inner.link.is_none() {
            return Err(MuxError::TransportGone);
        }
        if !inner.slots.iter().any(|s| s.session == session) {
            inner.slots.push(Slot {
                session,
                stream_id: None,
                awaiting: false,
                inbox: Inbox::default(),
            });
        }
        if inner.owner.is_none() {
            inner.owner = Some(session);
        }
        let n = inner.slots.len();
        self.attached.store(n, Ordering::Release);
        Ok(n)
    }

    /// Session currently owning the socket.
    pub async fn owner(&self) -> Option<SessionId> {
        self.inner.lock().await.owner
    }

    /// Open a stream for `session`'s request.
    pub async fn submit(
        &self,
        session: SessionId,
        head: &RequestHead,
        scheme: &str,
    ) -> Result<u32, MuxError> {
        if self.is_shutting_down() {
            return Err(MuxError::Refused(ERROR_REFUSED_STREAM));
        }
        let mut inner = self.inner.lock().await;
        if inner.link.is_none() {
            return Err(MuxError::TransportGone);
        }
        inner.slot_mut(session)?;
        let stream_id = inner
            .provider
            .submit_request(head, scheme, head.body.is_none())?;
        if let Some(body) = &head.body {
            let mut offset = 0;
            while offset < body.len() {
                let n = inner
                    .provider
                    .send(stream_id, &body[offset..], true)?;
                if n == 0 {
                    break;
                }
                offset += n;
            }
        }
        let slot = inner.slot_mut(session)?;
        slot.stream_id = Some(stream_id);
        slot.awaiting = false;
        slot.inbox = Inbox::default();
        inner.flush().await?;
        debug!(target: "corriere::mux", mux = self.id, session, stream_id, "request submitted");
        Ok(stream_id)
    }

    /// Server role: reply on the stream bound to `session`.
    pub async fn respond(
        &self,
        session: SessionId,
        status: u16,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<(), MuxError> {
        let mut inner = self.inner.lock().await;
        let stream_id = inner
            .slot_mut(session)?
            .stream_id
            .ok_or(MuxError::NotAttached)?;
        inner
            .provider
            .submit_response(stream_id, status, headers, body.is_none())?;
        if let Some(body) = body {
            inner.provider.send(stream_id, body, true)?;
        }
        inner.flush().await
    }

    /// Server role: the session finished its stream and can take the next peer-opened one.
    pub async fn await_reassignment(&self, session: SessionId) -> Result<(), MuxError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.slot_mut(session)?;
        slot.stream_id = None;
        slot.awaiting = true;
        slot.inbox = Inbox::default();
        Ok(())
    }

    /// Flush queued output, read what arrives within `wait`, and drain `session`'s inbox.
    pub async fn poll(&self, session: SessionId, wait: Duration) -> Result<MuxRead, MuxError> {
        let read_link = {
            let mut inner = self.inner.lock().await;
            if inner.link.is_some() {
                if let Err(e) = inner.flush().await {
                    warn!(target: "corriere::mux", mux = self.id, "write failed: {}", e);
                    inner.lose_transport();
                }
            }
            let ready = inner.slot_mut(session)?.inbox.has_news();
            !ready && inner.link.is_some() && inner.provider.wants_read()
        };
        if read_link {
            self.read_link(wait).await?;
        }
        let mut inner = self.inner.lock().await;
        Self::drain(&mut inner, session)
    }

    /// Read the link once and dispatch what arrived. When a sibling is already reading,
    /// wait up to `wait` for it to finish instead.
    async fn read_link(&self, wait: Duration) -> Result<(), MuxError> {
        let notified = self.news.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let mut reader = match self.reader.try_lock() {
            Ok(reader) => reader,
            Err(_) => {
                let _ = timeout(wait, notified).await;
                return Ok(());
            }
        };
        let Some(link) = reader.as_mut() else {
            return Ok(());
        };
        let read = timeout(wait, link.half.read(&mut link.buf)).await;
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let result = match read {
            Err(_) => Ok(()),
            Ok(Ok(0)) => {
                info!(target: "corriere::mux", mux = self.id, "peer closed the transport");
                self.torn_down.store(true, Ordering::Release);
                inner.lose_transport();
                Ok(())
            }
            Ok(Ok(n)) => {
                let mut dispatch = Dispatch {
                    slots: &mut inner.slots,
                    role: self.role,
                    shutting_down: self.shutdown.load(Ordering::Acquire),
                    goaway: false,
                    unknown: Vec::new(),
                };
                let res = inner.provider.data_received(&link.buf[..n], &mut dispatch);
                let goaway = dispatch.goaway;
                let unknown = std::mem::take(&mut dispatch.unknown);
                if goaway {
                    self.mark_shutdown();
                }
                for stream_id in unknown {
                    warn!(target: "corriere::mux", mux = self.id, stream_id, "event for unknown stream");
                    inner.provider.stream_reset(stream_id, ERROR_PROTOCOL_ERROR);
                }
                match res {
                    Err(e) => {
                        warn!(target: "corriere::mux", mux = self.id, "provider error: {}", e);
                        self.mark_shutdown();
                        inner.lose_transport();
                        Err(e)
                    }
                    Ok(()) => {
                        if let Err(e) = inner.flush().await {
                            warn!(target: "corriere::mux", mux = self.id, "write failed: {}", e);
                            inner.lose_transport();
                        }
                        Ok(())
                    }
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Ok(Err(e)) => {
                warn!(target: "corriere::mux", mux = self.id, "read failed: {}", e);
                self.torn_down.store(true, Ordering::Release);
                inner.lose_transport();
                Ok(())
            }
        };
        if inner.link.is_none() {
            *reader = None;
        }
        self.news.notify_waiters();
        result
    }

    fn drain(inner: &mut MuxInner, session: SessionId) -> Result<MuxRead, MuxError> {
        let link_gone = inner.link.is_none();
        let slot = inner.slot_mut(session)?;
        let inbox = &mut slot.inbox;
        let mut out = MuxRead::default();
        if inbox.switch {
            out.switch = true;
            slot.stream_id = None;
            slot.inbox = Inbox::default();
            return Ok(out);
        }
        if inbox.headers_done && !inbox.headers_taken {
            inbox.headers_taken = true;
            let status = inbox.status.unwrap_or(0);
            out.headers = Some((status, std::mem::take(&mut inbox.headers)));
        }
        if !inbox.data.is_empty() {
            out.data = inbox.data.split().freeze();
        }
        if inbox.end_stream {
            out.end = true;
        } else if let Some(code) = inbox.closed {
            if out.is_empty() {
                return Err(if code == ERROR_NO_ERROR {
                    MuxError::TransportGone
                } else {
                    MuxError::StreamReset(code)
                });
            }
        } else if link_gone && out.is_empty() && slot.stream_id.is_some() {
            return Err(MuxError::TransportGone);
        }
        Ok(out)
    }

    /// Reset `session`'s stream: CANCEL when aborting, NO_ERROR otherwise.
    pub async fn reset(&self, session: SessionId, abort: bool) -> Result<(), MuxError> {
        let mut inner = self.inner.lock().await;
        let slot = inner.slot_mut(session)?;
        let stream_id = match slot.stream_id.take() {
            Some(id) => id,
            None => return Ok(()),
        };
        let finished = slot.inbox.end_stream;
        slot.inbox = Inbox::default();
        if !finished {
            let code = if abort { ERROR_CANCEL } else { ERROR_NO_ERROR };
            debug!(target: "corriere::mux", mux = self.id, session, stream_id, code = error_to_string(code), "resetting stream");
            inner.provider.stream_reset(stream_id, code);
        }
        if inner.link.is_some() {
            inner.flush().await?;
        }
        Ok(())
    }

    pub async fn resume(&self, session: SessionId) -> Result<(), MuxError> {
        let mut inner = self.inner.lock().await;
        if let Some(stream_id) = inner.slot_mut(session)?.stream_id {
            inner.provider.resume_stream(stream_id);
            inner.flush().await?;
        }
        Ok(())
    }

    /// Remove `session`. The last one out closes the transport.
    pub async fn detach(&self, session: SessionId) -> DetachOutcome {
        let mut inner = self.inner.lock().await;
        let remaining = self.remove_slot(&mut inner, session);
        if remaining == 0 {
            inner.provider.shutdown();
            if inner.link.is_some() {
                let _ = inner.flush().await;
            }
            if let Some(mut link) = inner.link.take() {
                let _ = link.shutdown().await;
            }
            self.tear_down(&mut inner);
            return DetachOutcome::TornDown;
        }
        self.hand_over(&mut inner, session, remaining)
    }

    /// Detach from synchronous code, such as a session dropped on a thread outside the
    /// runtime. The detach runs on the runtime the multiplexer was created on; without one
    /// the slot is released in place and the link dropped without a goodbye.
    pub fn release(self: &Arc<Self>, session: SessionId) {
        match Handle::try_current().ok().or_else(|| self.handle.clone()) {
            Some(handle) => {
                let mux = Arc::clone(self);
                handle.spawn(async move {
                    mux.detach(session).await;
                });
            }
            None => match self.inner.try_lock() {
                Ok(mut inner) => match self.remove_slot(&mut inner, session) {
                    0 => {
                        inner.provider.shutdown();
                        inner.link = None;
                        self.tear_down(&mut inner);
                    }
                    remaining => {
                        self.hand_over(&mut inner, session, remaining);
                    }
                },
                Err(_) => {
                    warn!(target: "corriere::mux", mux = self.id, session, "multiplexer busy, session slot not released");
                }
            },
        }
    }

    /// Returns the number of sessions left.
    fn remove_slot(&self, inner: &mut MuxInner, session: SessionId) -> usize {
        if let Some(pos) = inner.slots.iter().position(|s| s.session == session) {
            let slot = inner.slots.remove(pos);
            if let Some(stream_id) = slot.stream_id {
                if !slot.inbox.end_stream && slot.inbox.closed.is_none() {
                    inner.provider.stream_reset(stream_id, ERROR_CANCEL);
                }
            }
        }
        let remaining = inner.slots.len();
        self.attached.store(remaining, Ordering::Release);
        remaining
    }

    fn tear_down(&self, inner: &mut MuxInner) {
        inner.owner = None;
        // A reader still inside its read window drops the half itself.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        self.torn_down.store(true, Ordering::Release);
        info!(target: "corriere::mux", mux = self.id, server = %self.server_key, "last session detached, transport closed");
    }

    fn hand_over(&self, inner: &mut MuxInner, session: SessionId, remaining: usize) -> DetachOutcome {
        if inner.owner == Some(session) {
            let to = inner.slots[0].session;
            inner.owner = Some(to);
            debug!(target: "corriere::mux", mux = self.id, from = session, to, "socket ownership handed over");
            return DetachOutcome::HandedOver { to };
        }
        DetachOutcome::Detached { remaining }
    }
}

/// A session's handle on its multiplexer.
#[derive(Debug, Clone)]
pub struct MuxStream {
    mux: Arc<Multiplexer>,
    session: SessionId,
}

impl MuxStream {
    pub fn new(mux: Arc<Multiplexer>, session: SessionId) -> Self {
        Self { mux, session }
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn kind(&self) -> MuxKind {
        self.mux.kind()
    }

    pub async fn submit(&self, head: &RequestHead, scheme: &str) -> Result<u32, MuxError> {
        self.mux.submit(self.session, head, scheme).await
    }

    pub async fn poll(&self, wait: Duration) -> Result<MuxRead, MuxError> {
        self.mux.poll(self.session, wait).await
    }

    pub async fn reset(&self, abort: bool) -> Result<(), MuxError> {
        self.mux.reset(self.session, abort).await
    }

    pub async fn resume(&self) -> Result<(), MuxError> {
        self.mux.resume(self.session).await
    }

    pub async fn detach(self) -> DetachOutcome {
        self.mux.detach(self.session).await
    }

    /// Detach without awaiting; see [`Multiplexer::release`].
    pub fn release(self) {
        self.mux.release(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::Method;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    /// Line codec: the peer sends `H id status`, `D id text`, `E id`, `C id code`, `G last`.
    struct LineProvider {
        next_id: u32,
        buf: Vec<u8>,
        out: BytesMut,
    }

    impl LineProvider {
        fn new() -> Self {
            Self {
                next_id: 1,
                buf: Vec::new(),
                out: BytesMut::new(),
            }
        }
    }

    impl StreamProvider for LineProvider {
        fn kind(&self) -> MuxKind {
            MuxKind::Http2
        }
        fn submit_request(&mut self, head: &RequestHead, _scheme: &str, _end: bool) -> Result<u32, MuxError> {
            let id = self.next_id;
            self.next_id += 2;
            self.out.extend_from_slice(format!("REQ {} {}\n", id, head.target).as_bytes());
            Ok(id)
        }
        fn submit_response(&mut self, id: u32, status: u16, _h: &[(String, String)], _end: bool) -> Result<(), MuxError> {
            self.out.extend_from_slice(format!("RSP {} {}\n", id, status).as_bytes());
            Ok(())
        }
        fn send(&mut self, _id: u32, data: &[u8], _end: bool) -> Result<usize, MuxError> {
            Ok(data.len())
        }
        fn data_received(&mut self, input: &[u8], ev: &mut dyn StreamEvents) -> Result<(), MuxError> {
            self.buf.extend_from_slice(input);
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
                let parts: Vec<&str> = line.splitn(3, ' ').collect();
                let id: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                match parts[0] {
                    "H" => {
                        ev.header(id, ":status", parts[2]);
                        ev.headers_complete(id, false);
                    }
                    "D" => ev.data(id, parts[2].as_bytes(), false),
                    "E" => ev.data(id, b"", true),
                    "C" => ev.stream_closed(id, parts[2].parse().unwrap()),
                    "G" => ev.goaway(id, 0),
                    _ => return Err(MuxError::Protocol(line.clone())),
                }
            }
            Ok(())
        }
        fn stream_reset(&mut self, id: u32, code: u32) {
            self.out.extend_from_slice(format!("RST {} {}\n", id, code).as_bytes());
        }
        fn resume_stream(&mut self, _id: u32) {}
        fn take_output(&mut self) -> Bytes {
            self.out.split().freeze()
        }
        fn shutdown(&mut self) {
            self.out.extend_from_slice(b"BYE\n");
        }
    }

    fn mux() -> (Arc<Multiplexer>, DuplexStream) {
        let (a, b) = duplex(4096);
        let m = Multiplexer::new("https://h:443", MuxRole::Client, Box::new(a), Box::new(LineProvider::new()));
        (m, b)
    }

    fn get(path: &str) -> RequestHead {
        RequestHead::new(Method::Get, path, "h")
    }

    async fn poll_until<F: Fn(&MuxRead) -> bool>(m: &Multiplexer, s: SessionId, f: F) -> MuxRead {
        let mut acc = MuxRead::default();
        let mut data = BytesMut::new();
        for _ in 0..50 {
            let r = m.poll(s, Duration::from_millis(20)).await.unwrap();
            if r.headers.is_some() {
                acc.headers = r.headers.clone();
            }
            data.extend_from_slice(&r.data);
            acc.end |= r.end;
            acc.switch |= r.switch;
            acc.data = data.clone().freeze();
            if f(&acc) {
                return acc;
            }
        }
        acc
    }

    #[tokio::test]
    async fn events_are_routed_by_stream_id() {
        let (m, peer) = mux();
        m.attach(10).await.unwrap();
        m.attach(20).await.unwrap();
        assert_eq!(m.submit(10, &get("/a"), "https").await.unwrap(), 1);
        assert_eq!(m.submit(20, &get("/b"), "https").await.unwrap(), 3);
        let (rd, mut wr) = tokio::io::split(peer);
        let mut lines = BufReader::new(rd).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "REQ 1 /a");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "REQ 3 /b");
        wr.write_all(b"H 3 200\nD 3 bee\nH 1 404\nE 3\nE 1\n").await.unwrap();

        let b = poll_until(&m, 20, |r| r.end).await;
        assert_eq!(b.headers.as_ref().unwrap().0, 200);
        assert_eq!(&b.data[..], b"bee");
        let a = poll_until(&m, 10, |r| r.end).await;
        assert_eq!(a.headers.as_ref().unwrap().0, 404);
        assert!(a.data.is_empty());
    }

    #[tokio::test]
    async fn refused_stream_switches_the_session() {
        let (m, mut peer) = mux();
        m.attach(1).await.unwrap();
        m.submit(1, &get("/x"), "https").await.unwrap();
        peer.write_all(b"C 1 7\n").await.unwrap();
        let r = poll_until(&m, 1, |r| r.switch).await;
        assert!(r.switch);
    }

    #[tokio::test]
    async fn goaway_switches_unprocessed_streams() {
        let (m, mut peer) = mux();
        m.attach(1).await.unwrap();
        m.attach(2).await.unwrap();
        m.submit(1, &get("/1"), "https").await.unwrap();
        m.submit(2, &get("/2"), "https").await.unwrap();
        peer.write_all(b"G 1\n").await.unwrap();
        let r = poll_until(&m, 2, |r| r.switch).await;
        assert!(r.switch);
        assert!(m.is_shutting_down());
        assert!(!m.is_usable());
        assert!(matches!(m.submit(1, &get("/again"), "https").await, Err(MuxError::Refused(_))));
    }

    #[tokio::test]
    async fn stream_error_is_not_a_switch() {
        let (m, mut peer) = mux();
        m.attach(1).await.unwrap();
        m.submit(1, &get("/x"), "https").await.unwrap();
        peer.write_all(b"D 1 ab\nC 1 2\n").await.unwrap();
        let mut saw_error = false;
        for _ in 0..50 {
            match m.poll(1, Duration::from_millis(20)).await {
                Err(MuxError::StreamReset(2)) => {
                    saw_error = true;
                    break;
                }
                Err(e) => panic!("unexpected {e}"),
                Ok(r) => assert!(!r.switch),
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn unknown_stream_is_reset_in_client_mode() {
        let (m, peer) = mux();
        m.attach(1).await.unwrap();
        let (rd, mut wr) = tokio::io::split(peer);
        wr.write_all(b"D 9 zz\n").await.unwrap();
        let r = m.poll(1, Duration::from_millis(50)).await.unwrap();
        assert!(r.is_empty());
        let mut lines = BufReader::new(rd).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "RST 9 1");
    }

    #[tokio::test]
    async fn server_mode_reassigns_awaiting_session() {
        let (a, mut peer) = duplex(4096);
        let m = Multiplexer::new("srv", MuxRole::Server, Box::new(a), Box::new(LineProvider::new()));
        m.attach(5).await.unwrap();
        m.await_reassignment(5).await.unwrap();
        peer.write_all(b"H 4 0\nE 4\n").await.unwrap();
        let r = poll_until(&m, 5, |r| r.end).await;
        assert!(r.headers.is_some());
        m.respond(5, 200, &[], Some(b"ok")).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"RSP 4 200\n");
    }

    #[tokio::test]
    async fn transport_survives_until_last_detach() {
        let (m, peer) = mux();
        m.attach(1).await.unwrap();
        m.attach(2).await.unwrap();
        assert_eq!(m.owner().await, Some(1));
        assert_eq!(m.detach(1).await, DetachOutcome::HandedOver { to: 2 });
        assert!(!m.is_torn_down());
        assert_eq!(m.owner().await, Some(2));
        assert_eq!(m.detach(2).await, DetachOutcome::TornDown);
        assert!(m.is_torn_down());
        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "BYE");
    }

    #[tokio::test]
    async fn waiting_reader_does_not_block_siblings() {
        let (m, _peer) = mux();
        m.attach(1).await.unwrap();
        m.attach(2).await.unwrap();
        m.attach(3).await.unwrap();
        m.submit(1, &get("/silent"), "https").await.unwrap();
        let reader = {
            let m = m.clone();
            tokio::spawn(async move { m.poll(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = Duration::from_millis(500);
        let r = tokio::time::timeout(quick, m.poll(2, Duration::from_millis(50)))
            .await
            .expect("sibling poll waited for the reader")
            .unwrap();
        assert!(r.is_empty());
        let submitted = tokio::time::timeout(quick, m.submit(3, &get("/next"), "https")).await;
        assert_eq!(submitted.expect("submit waited for the reader").unwrap(), 3);
        let outcome = tokio::time::timeout(quick, m.detach(2))
            .await
            .expect("detach waited for the reader");
        assert_eq!(outcome, DetachOutcome::Detached { remaining: 2 });
        reader.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_from_a_plain_thread_frees_the_slot() {
        let (m, _peer) = mux();
        m.attach(1).await.unwrap();
        m.attach(2).await.unwrap();
        for (session, left) in [(1, 1), (2, 0)] {
            let stream = MuxStream::new(m.clone(), session);
            std::thread::spawn(move || stream.release()).join().unwrap();
            for _ in 0..100 {
                if m.session_count() == left {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(m.session_count(), left);
        }
        for _ in 0..100 {
            if m.is_torn_down() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(m.is_torn_down());
    }

    #[tokio::test]
    async fn abort_sends_cancel() {
        let (m, peer) = mux();
        m.attach(1).await.unwrap();
        m.submit(1, &get("/x"), "https").await.unwrap();
        m.reset(1, true).await.unwrap();
        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "REQ 1 /x");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "RST 1 8");
    }
}
