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

//! Download session: the state machine for one resource fetch.
//!
//! `Setup → Connected → WaitForReply → DataExchange → DataTransferred`, with `Error` reachable
//! from any state and `Disconnected` after an abort. The same machine is driven three ways:
//! by the caller polling [`Session::fetch`], by [`Session::run`] looping until a terminal
//! state, or by [`Session::spawn`] on a dedicated tokio task.

mod exchange;
mod icy;
mod rate;
mod reply;
mod state;

pub use icy::IcyFilter;
pub use rate::RateWindow;
pub use state::{Fetched, SessionFlags, SessionId, SessionShared, SessionState, SessionStats};

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheReader};
use crate::error::FetchError;
use crate::manager::DownloadManager;
use crate::protocol::http::{H1ResponseHandler, Method, ReplyHeaders, Response, ResponseHandler};
use crate::transport::Transport;
use crate::uri::{ByteRange, UrlInfo};

const BODY_CHUNK: usize = 16 * 1024;
/// Read wait used by `run` and `spawn`, where blocking briefly is fine.
const THREAD_IO_WAIT: Duration = Duration::from_millis(100);
const MAX_AUTH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Off,
    Via,
    /// The proxy failed; this session goes direct.
    Bypassing,
}

/// Transport preferences carried from one `Setup` attempt to the next.
#[derive(Debug, Clone, Copy)]
struct TransportPref {
    quic: bool,
    quic_tried: bool,
    h2: bool,
    tls_fallback_used: bool,
}

impl Default for TransportPref {
    fn default() -> Self {
        Self {
            quic: true,
            quic_tried: false,
            h2: true,
            tls_fallback_used: false,
        }
    }
}

/// Where the session stands with its cache entry.
enum CacheRole {
    None,
    Writer,
    Reader(CacheReader),
}

#[derive(Debug, Default)]
struct AuthState {
    user: Option<String>,
    digest: Option<String>,
    /// The last request carried `digest`.
    sent: bool,
    /// Waiting for an asynchronous prompt.
    awaiting: bool,
    attempts: u32,
}

/// Reply being received, fed by the HTTP/1.1 parser or by multiplexer/backend events.
#[derive(Debug, Default)]
struct Incoming {
    status: Option<Response>,
    headers: ReplyHeaders,
    body: BytesMut,
    complete: bool,
}

impl H1ResponseHandler for Incoming {
    fn status(&mut self, code: u16, reason: Option<&str>) {
        self.status = Some(match reason {
            Some(r) => Response::with_reason(code, r),
            None => Response::new(code),
        });
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }

    fn body_chunk(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn trailer(&mut self, _name: &str, _value: &str) {}

    fn complete(&mut self) {
        self.complete = true;
    }
}

enum Step {
    Progress,
    Idle(Duration),
}

/// One logical fetch.
pub struct Session {
    id: SessionId,
    shared: Arc<SessionShared>,
    manager: DownloadManager,
    flags: SessionFlags,
    original_url: UrlInfo,
    url: UrlInfo,
    range: Option<ByteRange>,
    method: Method,
    extra_headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    state: SessionState,
    transport: Option<Transport>,
    pref: TransportPref,
    proxy: ProxyState,
    retries: u32,
    redirects: u32,
    auth: AuthState,
    cache: Option<Arc<CacheEntry>>,
    cache_role: CacheRole,
    cache_disabled: bool,
    revalidating: bool,
    head_fallback: bool,
    incoming: Incoming,
    /// The handler has seen `ok` and `start_body`.
    started: bool,
    reply_status: u16,
    reply_headers: ReplyHeaders,
    mime_type: Option<String>,
    /// Decoded body bytes not yet handed to the caller.
    pending: BytesMut,
    /// Bytes to drop after a restart, already delivered by the previous attempt.
    skip: u64,
    bytes_done: u64,
    total: Option<u64>,
    icy: Option<IcyFilter>,
    rate: RateWindow,
    last_activity: Instant,
    io_wait: Duration,
    scratch: Vec<u8>,
    error: Option<FetchError>,
    handler: Option<Box<dyn ResponseHandler>>,
}

impl Session {
    pub(crate) fn new(
        manager: DownloadManager,
        shared: Arc<SessionShared>,
        url: UrlInfo,
        flags: SessionFlags,
        range: Option<ByteRange>,
    ) -> Self {
        let now = Instant::now();
        let io_wait = manager.config().poll_interval();
        let mut auth = AuthState::default();
        if let (Some(user), Some(password)) = (&url.user, &url.password) {
            manager.register_credentials(&url.host, user, password);
        }
        auth.user = url.user.clone();
        Self {
            id: shared.id(),
            shared,
            manager,
            flags,
            original_url: url.clone(),
            url,
            range,
            method: if flags.head_only { Method::Head } else { Method::Get },
            extra_headers: Vec::new(),
            body: None,
            state: SessionState::Setup,
            transport: None,
            pref: TransportPref::default(),
            proxy: ProxyState::Off,
            retries: 0,
            redirects: 0,
            auth,
            cache: None,
            cache_role: CacheRole::None,
            cache_disabled: false,
            revalidating: false,
            head_fallback: false,
            incoming: Incoming::default(),
            started: false,
            reply_status: 0,
            reply_headers: ReplyHeaders::default(),
            mime_type: None,
            pending: BytesMut::new(),
            skip: 0,
            bytes_done: 0,
            total: None,
            icy: None,
            rate: RateWindow::new(now),
            last_activity: now,
            io_wait,
            scratch: vec![0u8; BODY_CHUNK],
            error: None,
            handler: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current URL (after redirects).
    pub fn url(&self) -> &str {
        self.url.canonical()
    }

    pub fn original_url(&self) -> &str {
        self.original_url.canonical()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    /// Handle for other threads: stats and abort.
    pub fn handle(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn reply_status(&self) -> u16 {
        self.reply_status
    }

    pub fn reply_headers(&self) -> &ReplyHeaders {
        &self.reply_headers
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Last ICY `StreamTitle`.
    pub fn icy_title(&self) -> Option<&str> {
        self.icy.as_ref().and_then(|f| f.title())
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn transport_kind(&self) -> Option<&'static str> {
        self.transport.as_ref().map(|t| t.kind())
    }

    /// Extra request header; replaces a default of the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .extra_headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.to_string(),
            None => self.extra_headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Method and optional body for the next request. Non-GET requests are never cached.
    pub fn set_method(&mut self, method: Method, body: Option<Vec<u8>>) {
        self.method = method;
        self.body = body;
    }

    pub fn set_handler(&mut self, handler: Box<dyn ResponseHandler>) {
        self.handler = Some(handler);
    }

    /// Per-session cap in bytes/s; 0 is unlimited.
    pub fn set_max_rate(&self, bps: u64) {
        self.shared.set_max_rate(bps);
    }

    /// Pull decoded body bytes into `buf`.
    pub async fn fetch(&mut self, buf: &mut [u8]) -> Result<Fetched, FetchError> {
        loop {
            if self.shared.abort_requested() && !self.state.is_terminal() {
                self.abort_now().await;
            }
            if !self.pending.is_empty() && !buf.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(Fetched::Data(n));
            }
            match self.state {
                SessionState::DataTransferred => return Ok(Fetched::Finished),
                SessionState::Disconnected => return Ok(Fetched::Disconnected),
                SessionState::Error => {
                    return Err(self.error.clone().unwrap_or(FetchError::Aborted));
                }
                _ => {}
            }
            match self.step().await {
                Ok(Step::Progress) => {}
                Ok(Step::Idle(retry_in)) => {
                    if let Some(e) = self.request_timed_out() {
                        self.fail(e).await;
                        continue;
                    }
                    if self.pending.is_empty() {
                        return Ok(Fetched::Empty { retry_in });
                    }
                }
                Err(e) => self.handle_failure(e).await,
            }
        }
    }

    /// Drive the session to a terminal state, handing every chunk to `sink`.
    pub async fn run<F: FnMut(&[u8])>(&mut self, mut sink: F) -> Result<SessionStats, FetchError> {
        self.io_wait = THREAD_IO_WAIT;
        let mut buf = vec![0u8; BODY_CHUNK];
        loop {
            match self.fetch(&mut buf).await? {
                Fetched::Data(n) => sink(&buf[..n]),
                Fetched::Empty { retry_in } => tokio::time::sleep(retry_in).await,
                Fetched::Finished | Fetched::Disconnected => return Ok(self.stats()),
            }
        }
    }

    /// Run on a dedicated task; the session is destroyed when it reaches a terminal state.
    pub fn spawn<F>(mut self, sink: F) -> JoinHandle<Result<SessionStats, FetchError>>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        tokio::spawn(async move { self.run(sink).await })
    }

    /// Stop now: reset the stream, give up the cache write, move to `Disconnected`.
    pub async fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.abort_now().await;
        }
    }

    /// Release the transport and cache entry without waiting for drop.
    pub async fn close(&mut self) {
        if !self.state.is_terminal() {
            self.abort_now().await;
        }
        if let Some(t) = self.transport.take() {
            self.discard_transport(t).await;
        }
        self.detach_cache(false);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(target: "corriere::session", session = self.id, from = %self.state, to = %state, url = %self.url.canonical(), "state change");
            self.state = state;
            self.shared.set_state(state);
        }
    }

    fn publish(&self) {
        self.shared.set_progress(self.bytes_done, self.total);
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn poll_interval(&self) -> Duration {
        self.manager.config().poll_interval()
    }

    fn request_timed_out(&self) -> Option<FetchError> {
        let limit = self.manager.config().request_timeout()?;
        if self.auth.awaiting && self.state == SessionState::Setup {
            return (self.last_activity.elapsed() > limit)
                .then(|| FetchError::Unauthorized(self.url.host.clone()));
        }
        let waiting = matches!(
            self.state,
            SessionState::WaitForReply | SessionState::DataExchange
        ) && !matches!(self.cache_role, CacheRole::Reader(_));
        (waiting && self.last_activity.elapsed() > limit).then_some(FetchError::Timeout("request"))
    }

    /// Delay before the next read if this session or the manager is over its cap.
    fn throttle(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let own = self.rate.delay_for(self.shared.max_rate(), now);
        self.shared.set_rate(self.rate.bytes_per_sec(now));
        let cap = self.manager.max_rate();
        let global = if cap > 0 {
            let total = self.manager.aggregate_rate();
            if total > cap {
                Duration::from_millis(((total - cap) * 1000 / cap).clamp(1, 1000))
            } else {
                Duration::ZERO
            }
        } else {
            Duration::ZERO
        };
        let delay = own.max(global);
        if delay.is_zero() {
            None
        } else {
            self.last_activity = now;
            Some(delay)
        }
    }

    /// Hand decoded bytes to the caller.
    fn deliver(&mut self, mut data: BytesMut) {
        if self.skip > 0 {
            let n = (self.skip as usize).min(data.len());
            data.advance(n);
            self.skip -= n as u64;
        }
        if data.is_empty() {
            return;
        }
        if let Some(h) = self.handler.as_mut() {
            h.body_chunk(&data);
        }
        let now = Instant::now();
        self.rate.record(data.len(), now);
        self.shared.set_rate(self.rate.bytes_per_sec(now));
        self.bytes_done += data.len() as u64;
        self.pending.unsplit(data);
        self.touch();
        self.publish();
    }

    fn caching_allowed(&self) -> bool {
        let cfg = self.manager.config();
        !self.flags.not_cached
            && !cfg.disable_cache
            && !self.cache_disabled
            && self.method == Method::Get
            && self.body.is_none()
    }

    /// Attach to the entry for the current URL, if caching applies.
    fn open_cache_entry(&mut self) {
        if self.cache.is_some() || !self.caching_allowed() {
            return;
        }
        let memory = self.flags.memory_cache || self.manager.config().memory_cache;
        match self
            .manager
            .find_or_create_entry(self.url.canonical(), self.range, memory)
        {
            Ok(entry) => {
                entry.attach(self.id);
                if self.flags.persistent {
                    entry.set_persistent(true);
                }
                self.cache = Some(entry);
            }
            Err(e) => {
                debug!(target: "corriere::session", session = self.id, "request will not be cached: {}", e);
                self.cache_disabled = true;
            }
        }
    }

    /// Give up the write lock (failed write when `success` is false) and detach.
    fn detach_cache(&mut self, success: bool) {
        let role = std::mem::replace(&mut self.cache_role, CacheRole::None);
        if let Some(entry) = self.cache.take() {
            if matches!(role, CacheRole::Writer) {
                if let Err(e) = entry.close_write(self.id, success) {
                    warn!(target: "corriere::session", session = self.id, "cache write not kept: {}", e);
                }
            }
            entry.detach(self.id);
            self.manager.release_entry(&entry);
        }
    }

    /// Stop writing to the entry (as a failed write) but stay attached.
    fn abandon_cache_write(&mut self) {
        if matches!(self.cache_role, CacheRole::Writer) {
            if let Some(entry) = &self.cache {
                if let Err(e) = entry.close_write(self.id, false) {
                    warn!(target: "corriere::cache", session = self.id, url = %self.url.canonical(), "abandoned write not closed cleanly, discarding: {}", e);
                    entry.mark_discard();
                }
            }
        }
        self.cache_role = CacheRole::None;
    }

    async fn discard_transport(&mut self, transport: Transport) {
        match transport {
            Transport::Raw(mut conn) => conn.shutdown().await,
            Transport::Multiplexed(stream) => {
                let _ = stream.reset(false).await;
                stream.detach().await;
            }
            Transport::External(mut backend) => backend.abort(),
        }
    }

    async fn abort_now(&mut self) {
        debug!(target: "corriere::session", session = self.id, url = %self.url.canonical(), "aborting");
        match self.transport.take() {
            Some(Transport::Multiplexed(stream)) => {
                let _ = stream.reset(true).await;
                stream.detach().await;
            }
            Some(Transport::Raw(mut conn)) => conn.shutdown().await,
            Some(Transport::External(mut backend)) => backend.abort(),
            None => {}
        }
        if let Some(entry) = &self.cache {
            if matches!(self.cache_role, CacheRole::Writer) {
                entry.mark_discard();
            }
        }
        self.detach_cache(false);
        self.pending.clear();
        self.set_state(SessionState::Disconnected);
        self.publish();
    }

    async fn fail(&mut self, e: FetchError) {
        warn!(target: "corriere::session", session = self.id, url = %self.url.canonical(), "session failed: {}", e);
        if let Some(t) = self.transport.take() {
            self.discard_transport(t).await;
        }
        if let Some(entry) = &self.cache {
            if self.reply_headers.no_store {
                entry.mark_discard();
            }
        }
        self.detach_cache(false);
        if let Some(h) = self.handler.as_mut() {
            h.failed(&e);
        }
        self.error = Some(e);
        self.set_state(SessionState::Error);
        self.publish();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.detach_cache(false);
        if let Some(Transport::Multiplexed(stream)) = self.transport.take() {
            stream.release();
        }
        self.manager.unregister(self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("url", &self.url.canonical())
            .field("state", &self.state)
            .field("bytes_done", &self.bytes_done)
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReadStatus;
    use crate::config::{EngineConfig, EngineInit};
    use crate::protocol::http::{ParseState, ResponseParser};

    fn session(flags: SessionFlags) -> (DownloadManager, Session) {
        let manager = DownloadManager::new(EngineConfig::default(), EngineInit::global()).unwrap();
        let s = manager
            .create_session("http://example.test/a.bin", flags, None)
            .unwrap();
        (manager, s)
    }

    #[test]
    fn incoming_collects_a_parsed_reply() {
        let mut parser = ResponseParser::new();
        let mut incoming = Incoming::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nETag: \"x\"\r\n\r\nhel"[..]);
        parser.receive(&mut buf, &mut incoming).unwrap();
        assert_eq!(parser.state(), ParseState::HeadersComplete);
        assert_eq!(incoming.status.as_ref().map(|r| r.code), Some(200));
        assert_eq!(incoming.headers.content_length, Some(5));
        assert_eq!(incoming.headers.etag.as_deref(), Some("\"x\""));
        parser.set_body_mode(Some(5), false, false, &mut incoming);
        buf.extend_from_slice(b"lo");
        parser.receive(&mut buf, &mut incoming).unwrap();
        assert_eq!(&incoming.body[..], b"hello");
        assert!(incoming.complete);
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let (_m, mut s) = session(SessionFlags::default());
        s.set_header("X-Trace", "1");
        s.set_header("x-trace", "2");
        s.set_header("Accept", "audio/*");
        assert_eq!(
            s.extra_headers,
            vec![
                ("X-Trace".to_string(), "2".to_string()),
                ("Accept".to_string(), "audio/*".to_string()),
            ]
        );
    }

    #[test]
    fn skipped_bytes_are_not_delivered_twice() {
        let (_m, mut s) = session(SessionFlags::default());
        s.skip = 4;
        s.deliver(BytesMut::from(&b"abc"[..]));
        assert!(s.pending.is_empty());
        s.deliver(BytesMut::from(&b"defgh"[..]));
        assert_eq!(&s.pending[..], b"efgh");
        assert_eq!(s.bytes_done, 4);
        assert_eq!(s.stats().bytes_done, 4);
    }

    #[test]
    fn head_only_sessions_send_head() {
        let (_m, s) = session(SessionFlags {
            head_only: true,
            ..SessionFlags::default()
        });
        assert_eq!(s.method, Method::Head);
        assert_eq!(s.state(), SessionState::Setup);
    }

    #[test]
    fn abandoned_write_releases_the_entry() {
        let (m, mut s) = session(SessionFlags::default());
        let entry = m
            .find_or_create_entry("http://example.test/a.bin", None, true)
            .unwrap();
        entry.attach(s.id);
        entry.open_for_write(s.id).unwrap();
        entry.write(s.id, b"part").unwrap();
        let mut reader = entry.open_for_read().unwrap();
        s.cache = Some(entry.clone());
        s.cache_role = CacheRole::Writer;

        s.abandon_cache_write();
        assert!(matches!(s.cache_role, CacheRole::None));
        assert_eq!(entry.writer(), None);
        assert!(entry.is_corrupted());
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), ReadStatus::WriterFailed);
        s.detach_cache(false);
    }

    #[test]
    fn non_get_requests_are_not_cached() {
        let (_m, mut s) = session(SessionFlags::default());
        assert!(s.caching_allowed());
        s.set_method(Method::Post, Some(b"q=1".to_vec()));
        assert!(!s.caching_allowed());
    }
}
