/*
 * exchange.rs
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

//! State-machine steps: transport setup, request, reply handling and body exchange.

use bytes::BytesMut;
use tracing::{debug, info, warn};

use super::reply::{classify, ReplyAction, ReplyContext};
use super::{CacheRole, Incoming, ProxyState, Session, SessionState, Step, TransportPref, MAX_AUTH_ATTEMPTS};
use crate::cache::{ReadStatus, Reuse};
use crate::error::FetchError;
use crate::manager::CredentialRequest;
use crate::mux::{Multiplexer, MuxError, MuxKind, MuxRole, MuxStream, ERROR_REFUSED_STREAM};
use crate::protocol::http::{Method, ParseState, ReplyHeaders, RequestHead, Response};
use crate::transport::{BackendEvent, NetStream, RawConnection, ReadOutcome, Transport};
use crate::uri::UrlInfo;

/// Result of one `Setup` attempt.
enum SetupOutcome {
    Connected(Transport),
    /// Served from the cache; the state is already `DataExchange`.
    FromCache,
    /// Waiting for an asynchronous credential prompt.
    Waiting,
    /// Try again with different transport preferences.
    Retry(TransportPref),
}

impl Session {
    pub(super) async fn step(&mut self) -> Result<Step, FetchError> {
        match self.state {
            SessionState::Setup => match self.setup().await? {
                SetupOutcome::Connected(transport) => {
                    debug!(target: "corriere::session", session = self.id, transport = transport.kind(), "connected");
                    self.transport = Some(transport);
                    self.set_state(SessionState::Connected);
                    Ok(Step::Progress)
                }
                SetupOutcome::FromCache => Ok(Step::Progress),
                SetupOutcome::Waiting => Ok(Step::Idle(self.poll_interval())),
                SetupOutcome::Retry(pref) => {
                    self.retries += 1;
                    if self.retries > self.manager.config().max_retries {
                        return Err(FetchError::RetriesExhausted(self.retries - 1));
                    }
                    self.pref = pref;
                    Ok(Step::Progress)
                }
            },
            SessionState::Connected => {
                self.send_request().await?;
                self.set_state(SessionState::WaitForReply);
                Ok(Step::Progress)
            }
            SessionState::WaitForReply => self.wait_reply().await,
            SessionState::DataExchange => self.exchange().await,
            _ => Ok(Step::Idle(self.poll_interval())),
        }
    }

    fn can_quic(&self, server_key: &str) -> bool {
        self.manager.config().http3
            && self.url.is_secure()
            && self.manager.quic_connector().is_some()
            && !self.manager.quic_failed(server_key)
    }

    fn proxy_applies(&self) -> bool {
        let cfg = self.manager.config();
        cfg.proxy.is_some()
            && !self.flags.no_proxy
            && !self.url.is_secure()
            && self.proxy != ProxyState::Bypassing
            && !self.manager.is_proxy_skipped(&self.url.server_key())
    }

    /// Decide between the cache and the network, then find or open a transport.
    async fn setup(&mut self) -> Result<SetupOutcome, FetchError> {
        if self.auth.awaiting {
            if self.manager.credentials_pending(&self.url.host) {
                return Ok(SetupOutcome::Waiting);
            }
            self.auth.awaiting = false;
            match self
                .manager
                .credential_for(&self.url.host, self.auth.user.as_deref())
            {
                Some((user, digest)) => {
                    self.auth.user = Some(user);
                    self.auth.digest = Some(digest);
                }
                None => return Err(FetchError::Unauthorized(self.url.host.clone())),
            }
        }

        self.incoming = Incoming::default();
        self.revalidating = false;
        self.open_cache_entry();
        if let Some(entry) = self.cache.clone() {
            let writer = entry.writer();
            if writer.is_some_and(|w| w != self.id) {
                // Follow another session's write as it progresses.
                match entry.open_for_read() {
                    Ok(reader) => {
                        self.start_cache_read(reader, 200);
                        return Ok(SetupOutcome::FromCache);
                    }
                    Err(e) => {
                        debug!(target: "corriere::session", session = self.id, "cannot follow cache write: {}", e);
                        self.detach_cache(false);
                        self.cache_disabled = true;
                    }
                }
            } else if entry.in_progress_elsewhere() && !entry.is_done() {
                debug!(target: "corriere::session", session = self.id, "entry written by another process; not caching");
                self.detach_cache(false);
                self.cache_disabled = true;
            } else if entry.is_done() && !entry.is_corrupted() {
                match entry.can_reuse(self.manager.config().reuse_policy) {
                    Reuse::Direct => match entry.open_for_read() {
                        Ok(reader) => {
                            info!(target: "corriere::session", session = self.id, url = %self.url.canonical(), "serving from cache");
                            self.start_cache_read(reader, 200);
                            return Ok(SetupOutcome::FromCache);
                        }
                        Err(e) => {
                            debug!(target: "corriere::session", session = self.id, "cached content unreadable: {}", e)
                        }
                    },
                    Reuse::Revalidate => self.revalidating = true,
                    Reuse::Refetch if entry.is_shared() => {
                        self.detach_cache(false);
                        self.cache_disabled = true;
                    }
                    Reuse::Refetch => {}
                }
            }
        }

        if let Some(backend) = self.manager.external_backend(&self.url) {
            return Ok(SetupOutcome::Connected(Transport::External(backend)));
        }

        let key = self.url.server_key();
        self.proxy = if self.proxy_applies() {
            ProxyState::Via
        } else if self.proxy == ProxyState::Bypassing {
            ProxyState::Bypassing
        } else {
            ProxyState::Off
        };

        match self.transport.take() {
            Some(Transport::Multiplexed(stream))
                if self.proxy != ProxyState::Via
                    && stream.multiplexer().server_key() == key
                    && stream.multiplexer().is_usable() =>
            {
                return Ok(SetupOutcome::Connected(Transport::Multiplexed(stream)));
            }
            Some(other) => self.discard_transport(other).await,
            None => {}
        }

        if self.proxy != ProxyState::Via {
            if let Some(mux) = self.manager.find_mux(&key) {
                if mux.attach(self.id).await.is_ok() {
                    return Ok(SetupOutcome::Connected(Transport::Multiplexed(
                        MuxStream::new(mux, self.id),
                    )));
                }
            }
            if self.pref.quic && self.can_quic(&key) {
                match self.open_quic(&key).await {
                    Ok(transport) => return Ok(SetupOutcome::Connected(transport)),
                    Err(e) => {
                        info!(target: "corriere::session", session = self.id, %key, "QUIC unavailable, using TCP: {}", e);
                        self.manager.mark_quic_failed(&key);
                        let mut pref = self.pref;
                        pref.quic = false;
                        pref.quic_tried = true;
                        return Ok(SetupOutcome::Retry(pref));
                    }
                }
            }
            if let Some(conn) = self.manager.take_connection(&key) {
                debug!(target: "corriere::session", session = self.id, %key, "reusing idle connection");
                return Ok(SetupOutcome::Connected(Transport::Raw(conn)));
            }
        }

        let cfg = self.manager.config();
        let (host, port, secure) = match (&cfg.proxy, self.proxy) {
            (Some(p), ProxyState::Via) => (p.host.clone(), p.port, false),
            _ => (self.url.host.clone(), self.url.port, self.url.is_secure()),
        };
        let factory = self.manager.stream_provider_factory();
        let offer_h2 = self.proxy != ProxyState::Via && self.pref.h2 && cfg.http2 && factory.is_some();
        let connect_timeout = cfg.connect_timeout();
        let channel = self.manager.secure_channel();
        let stream = match NetStream::open(&host, port, secure, offer_h2, channel.as_ref(), connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                if self.proxy != ProxyState::Via && !self.pref.quic_tried && self.can_quic(&key) {
                    let mut pref = self.pref;
                    pref.quic = true;
                    pref.quic_tried = true;
                    return Ok(SetupOutcome::Retry(pref));
                }
                return Err(e);
            }
        };

        if stream.negotiated_h2() {
            if let Some(factory) = factory {
                let provider = factory.create(MuxKind::Http2, MuxRole::Client);
                let mux = Multiplexer::new(key.clone(), MuxRole::Client, stream.into_boxed(), provider);
                self.manager.register_mux(mux.clone());
                mux.attach(self.id).await?;
                return Ok(SetupOutcome::Connected(Transport::Multiplexed(MuxStream::new(mux, self.id))));
            }
        }
        let conn_key = if self.proxy == ProxyState::Via {
            format!("proxy:{}:{}", host, port)
        } else {
            key
        };
        Ok(SetupOutcome::Connected(Transport::Raw(RawConnection::new(stream, conn_key))))
    }

    async fn open_quic(&mut self, key: &str) -> Result<Transport, FetchError> {
        let connector = self
            .manager
            .quic_connector()
            .ok_or_else(|| FetchError::Protocol("no QUIC connector".into()))?;
        let connect = connector.connect(&self.url.host, self.url.port);
        let (link, provider) = tokio::time::timeout(self.manager.config().connect_timeout(), connect)
            .await
            .map_err(|_| FetchError::Timeout("connect"))?
            .map_err(|e| FetchError::connect(&self.url.host, self.url.port, e))?;
        let mux = Multiplexer::new(key, MuxRole::Client, link, provider);
        self.manager.register_mux(mux.clone());
        mux.attach(self.id).await?;
        Ok(Transport::Multiplexed(MuxStream::new(mux, self.id)))
    }

    fn compose_request(&mut self) -> RequestHead {
        let via = self.proxy == ProxyState::Via;
        let target = if via {
            self.url.canonical().to_string()
        } else {
            self.url.path.clone()
        };
        let mut head = RequestHead::new(self.method, target, self.url.authority());
        head.set_header("User-Agent", self.manager.config().user_agent.as_str());
        head.set_header("Accept", "*/*");
        if matches!(self.transport, Some(Transport::Raw(_))) {
            head.set_header("Connection", "Keep-Alive");
        }
        if via {
            head.set_header("Proxy-Connection", "Keep-Alive");
        }
        if let Some(range) = self.range {
            head.set_header("Range", range.header_value());
        }
        if self.flags.icy_metadata {
            head.set_header("Icy-Metadata", "1");
        }
        if self.auth.digest.is_none() {
            if let Some((user, digest)) = self
                .manager
                .credential_for(&self.url.host, self.auth.user.as_deref())
            {
                self.auth.user = Some(user);
                self.auth.digest = Some(digest);
            }
        }
        self.auth.sent = false;
        if let Some(digest) = &self.auth.digest {
            head.set_header("Authorization", format!("Basic {}", digest));
            self.auth.sent = true;
        }
        if self.revalidating {
            if let Some(entry) = &self.cache {
                let (etag, last_modified) = entry.validators();
                if let Some(etag) = etag {
                    head.set_header("If-None-Match", etag);
                }
                if let Some(lm) = last_modified {
                    head.set_header("If-Modified-Since", lm);
                }
            }
        }
        for (name, value) in &self.extra_headers {
            head.set_header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            head.body(body.clone());
        }
        head
    }

    async fn send_request(&mut self) -> Result<(), FetchError> {
        let head = self.compose_request();
        debug!(target: "corriere::session", session = self.id, method = head.method.as_str(), target = %head.target, "sending request");
        let scheme = self.url.scheme.as_str();
        match self.transport.as_mut() {
            Some(Transport::Raw(conn)) => conn.send_request(&head).await?,
            Some(Transport::Multiplexed(stream)) => {
                stream.submit(&head, scheme).await?;
            }
            Some(Transport::External(backend)) => backend.start(&self.url, &head).await?,
            None => return Err(FetchError::Protocol("no transport".into())),
        }
        self.touch();
        Ok(())
    }

    /// Move a multiplexer read into `incoming`. Returns the header block when present.
    fn absorb_mux_read(&mut self, read: crate::mux::MuxRead) -> Result<Option<(u16, ReplyHeaders)>, FetchError> {
        if read.switch {
            return Err(FetchError::Mux(MuxError::Refused(ERROR_REFUSED_STREAM)));
        }
        let headers = read.headers.map(|(status, fields)| {
            let mut h = ReplyHeaders::default();
            for (name, value) in &fields {
                h.add(name, value);
            }
            (status, h)
        });
        self.incoming.body.extend_from_slice(&read.data);
        if read.end {
            self.incoming.complete = true;
        }
        Ok(headers)
    }

    fn absorb_backend_event(&mut self, event: BackendEvent) -> Option<(u16, ReplyHeaders)> {
        match event {
            BackendEvent::Reply { status, headers } => {
                let mut h = ReplyHeaders::default();
                for (name, value) in &headers {
                    h.add(name, value);
                }
                Some((status, h))
            }
            BackendEvent::Data(data) => {
                self.incoming.body.extend_from_slice(&data);
                None
            }
            BackendEvent::End => {
                self.incoming.complete = true;
                None
            }
        }
    }

    async fn wait_reply(&mut self) -> Result<Step, FetchError> {
        let wait = self.io_wait;
        let idle = self.poll_interval();
        let reply = match self.transport.as_mut() {
            Some(Transport::Raw(conn)) => {
                loop {
                    conn.parse(&mut self.incoming)?;
                    if conn.parser().state() == ParseState::HeadersComplete {
                        break;
                    }
                    match conn.read_some(wait).await? {
                        ReadOutcome::Data(_) => self.last_activity = std::time::Instant::now(),
                        ReadOutcome::Empty => return Ok(Step::Idle(idle)),
                        ReadOutcome::Closed => {
                            conn.parser().finish(&mut self.incoming)?;
                            return Err(FetchError::ConnectionClosed);
                        }
                    }
                }
                let status = self.incoming.status.clone().unwrap_or_else(|| Response::new(0));
                (status.code, std::mem::take(&mut self.incoming.headers), status.reason)
            }
            Some(Transport::Multiplexed(stream)) => {
                let read = stream.poll(wait).await?;
                if read.is_empty() {
                    return Ok(Step::Idle(idle));
                }
                self.touch();
                match self.absorb_mux_read(read)? {
                    Some((status, headers)) => (status, headers, None),
                    None if self.incoming.complete => return Err(FetchError::Protocol("stream ended without headers".into())),
                    None => return Ok(Step::Progress),
                }
            }
            Some(Transport::External(backend)) => match backend.next_event(wait).await? {
                None => return Ok(Step::Idle(idle)),
                Some(event) => {
                    self.touch();
                    match self.absorb_backend_event(event) {
                        Some((status, headers)) => (status, headers, None),
                        None => return Err(FetchError::Protocol("backend sent data before a reply".into())),
                    }
                }
            },
            None => return Err(FetchError::Protocol("no transport".into())),
        };
        let (status, headers, reason) = reply;
        let response = match reason {
            Some(r) => Response::with_reason(status, r),
            None => Response::new(status),
        };
        self.on_reply(response, headers).await
    }

    async fn on_reply(&mut self, response: Response, headers: ReplyHeaders) -> Result<Step, FetchError> {
        let status = response.code;
        let ctx = ReplyContext {
            head: self.method == Method::Head,
            via_proxy: self.proxy == ProxyState::Via,
            revalidating: self.revalidating,
            range_requested: self.range.is_some(),
        };
        debug!(target: "corriere::session", session = self.id, status, url = %self.url.canonical(), "reply");
        match classify(status, &headers, &self.url, ctx) {
            ReplyAction::Interim => {
                if let Some(Transport::Raw(conn)) = self.transport.as_mut() {
                    conn.next_reply();
                }
                self.incoming = Incoming::default();
                Ok(Step::Progress)
            }
            ReplyAction::Body => self.begin_body(response, headers).await,
            ReplyAction::NotModified => self.not_modified(headers).await,
            ReplyAction::Redirect { to, use_get } => self.redirect(to, use_get).await,
            ReplyAction::Authenticate => self.authenticate().await,
            ReplyAction::HeadFallback => {
                info!(target: "corriere::session", session = self.id, status, "HEAD rejected, retrying with GET");
                self.method = Method::Get;
                self.head_fallback = true;
                self.restart().await;
                Ok(Step::Progress)
            }
            ReplyAction::BypassProxy => {
                warn!(target: "corriere::session", session = self.id, "proxy failed with {}, going direct", status);
                self.proxy = ProxyState::Bypassing;
                self.restart().await;
                Ok(Step::Progress)
            }
            ReplyAction::Fail(e) => {
                self.reply_status = status;
                self.reply_headers = headers;
                if let Some(h) = self.handler.as_mut() {
                    h.error(response);
                }
                Err(e)
            }
        }
    }

    /// Drop the transport and go back to `Setup` for the current URL.
    async fn restart(&mut self) {
        match self.transport.take() {
            Some(Transport::Multiplexed(stream)) => {
                let _ = stream.reset(false).await;
                self.transport = Some(Transport::Multiplexed(stream));
            }
            Some(other) => self.discard_transport(other).await,
            None => {}
        }
        self.abandon_cache_write();
        self.incoming = Incoming::default();
        self.set_state(SessionState::Setup);
    }

    async fn begin_body(&mut self, response: Response, headers: ReplyHeaders) -> Result<Step, FetchError> {
        let status = response.code;
        let no_body = self.method == Method::Head || self.head_fallback || !response.has_body();
        if self.total.is_none() || self.skip == 0 {
            self.total = if no_body {
                Some(0)
            } else if headers.chunked || headers.is_icy {
                None
            } else {
                headers.total_size().or(headers.content_length)
            };
            if self.range.is_some() && status == 206 {
                self.total = headers.content_length;
            }
        }
        self.mime_type = headers.mime_type.clone();

        if let Some(entry) = self.cache.clone() {
            let cacheable = self.method == Method::Get
                && !no_body
                && (status == 200 || (status == 206 && self.range.is_some()))
                && !headers.is_icy
                && headers.icy_metaint.is_none();
            if headers.no_store {
                entry.mark_discard();
                self.detach_cache(false);
            } else if cacheable {
                let max_age = if headers.no_cache { Some(0) } else { headers.max_age };
                entry.set_server_headers(
                    headers.etag.as_deref(),
                    headers.last_modified.as_deref(),
                    max_age,
                    headers.must_revalidate,
                    false,
                );
                entry.set_mime_type(headers.mime_type.as_deref());
                entry.set_content_length(self.total);
                match entry.open_for_write(self.id) {
                    Ok(()) => self.cache_role = CacheRole::Writer,
                    Err(e) => {
                        debug!(target: "corriere::session", session = self.id, "not writing cache entry: {}", e);
                        self.cache_role = CacheRole::None;
                    }
                }
            } else {
                self.detach_cache(false);
            }
        }

        if self.flags.icy_metadata {
            if let Some(metaint) = headers.icy_metaint.filter(|m| *m > 0) {
                self.icy = Some(super::IcyFilter::new(metaint));
            }
        }

        if self.proxy == ProxyState::Bypassing {
            self.manager.add_proxy_skip(&self.url.server_key());
        }

        if !self.started {
            self.started = true;
            if let Some(h) = self.handler.as_mut() {
                h.ok(response);
                for (name, value) in &headers.all {
                    h.header(name, value);
                }
                h.start_body();
            }
        }
        if let Some(Transport::Raw(conn)) = self.transport.as_mut() {
            let length = if no_body { None } else { headers.content_length };
            conn.parser()
                .set_body_mode(length, headers.chunked, no_body, &mut self.incoming);
        } else if no_body {
            self.incoming.complete = true;
        }
        self.reply_status = status;
        self.reply_headers = headers;
        self.rate.reset(std::time::Instant::now());
        self.set_state(SessionState::DataExchange);
        self.publish();
        Ok(Step::Progress)
    }

    fn start_cache_read(&mut self, reader: crate::cache::CacheReader, status: u16) {
        let entry = reader.entry().clone();
        self.total = entry.content_length();
        self.mime_type = entry.mime_type();
        self.reply_status = status;
        self.cache_role = CacheRole::Reader(reader);
        let notify = !std::mem::replace(&mut self.started, true);
        if let Some(h) = self.handler.as_mut().filter(|_| notify) {
            h.ok(Response::new(status));
            if let Some(mime) = entry.mime_type() {
                h.header("Content-Type", &mime);
            }
            h.start_body();
        }
        self.rate.reset(std::time::Instant::now());
        self.set_state(SessionState::DataExchange);
        self.publish();
    }

    async fn not_modified(&mut self, headers: ReplyHeaders) -> Result<Step, FetchError> {
        let Some(entry) = self.cache.clone() else {
            return Err(FetchError::Status(304));
        };
        info!(target: "corriere::session", session = self.id, url = %self.url.canonical(), "not modified, serving from cache");
        entry.revalidated(headers.max_age, headers.must_revalidate);
        match self.transport.take() {
            Some(Transport::Raw(mut conn)) => {
                let reusable = !headers.connection_close && self.proxy != ProxyState::Via;
                conn.next_reply();
                if reusable {
                    self.manager.park_connection(conn);
                } else {
                    conn.shutdown().await;
                }
            }
            Some(Transport::Multiplexed(stream)) => self.transport = Some(Transport::Multiplexed(stream)),
            Some(other) => self.discard_transport(other).await,
            None => {}
        }
        self.reply_headers = headers;
        let reader = entry.open_for_read()?;
        self.start_cache_read(reader, 304);
        Ok(Step::Progress)
    }

    async fn redirect(&mut self, to: UrlInfo, use_get: bool) -> Result<Step, FetchError> {
        let max = self.manager.config().max_redirects;
        if self.redirects >= max {
            return Err(FetchError::RedirectLoop(max));
        }
        self.redirects += 1;
        info!(target: "corriere::session", session = self.id, from = %self.url.canonical(), to = %to.canonical(), "redirect");
        let same_server = to.server_key() == self.url.server_key();
        if !same_server {
            if let Some(t) = self.transport.take() {
                self.discard_transport(t).await;
            }
        }
        self.detach_cache(false);
        self.cache_disabled = false;
        if use_get {
            self.method = Method::Get;
            self.body = None;
        }
        if !same_server || to.host != self.url.host {
            self.auth = Default::default();
        }
        if let (Some(user), Some(password)) = (&to.user, &to.password) {
            self.manager.register_credentials(&to.host, user, password);
            self.auth.user = Some(user.clone());
        }
        self.url = to;
        self.restart().await;
        Ok(Step::Progress)
    }

    async fn authenticate(&mut self) -> Result<Step, FetchError> {
        let server = self.url.host.clone();
        self.auth.attempts += 1;
        if self.auth.attempts > MAX_AUTH_ATTEMPTS {
            return Err(FetchError::Unauthorized(server));
        }
        if self.auth.sent {
            if let Some(user) = self.auth.user.clone() {
                debug!(target: "corriere::session", session = self.id, %server, %user, "credentials rejected");
                self.manager.invalidate_credential(&server, &user);
            }
            self.auth.digest = None;
            self.auth.sent = false;
        }
        if let Some((user, digest)) = self.manager.credential_for(&server, self.auth.user.as_deref()) {
            self.auth.user = Some(user);
            self.auth.digest = Some(digest);
            self.restart().await;
            return Ok(Step::Progress);
        }
        match self
            .manager
            .request_credentials(&server, self.auth.user.as_deref(), self.url.is_secure())
        {
            CredentialRequest::Ready { username, digest } => {
                self.auth.user = Some(username);
                self.auth.digest = Some(digest);
                self.restart().await;
                Ok(Step::Progress)
            }
            CredentialRequest::Pending => {
                info!(target: "corriere::session", session = self.id, %server, "waiting for credentials");
                self.auth.awaiting = true;
                self.restart().await;
                self.touch();
                Ok(Step::Idle(self.poll_interval()))
            }
            CredentialRequest::Denied => Err(FetchError::Unauthorized(server)),
        }
    }

    async fn exchange(&mut self) -> Result<Step, FetchError> {
        if let Some(delay) = self.throttle() {
            return Ok(Step::Idle(delay));
        }
        if matches!(self.cache_role, CacheRole::Reader(_)) {
            return self.read_cache().await;
        }
        if !self.incoming.body.is_empty() {
            self.consume_body();
            return Ok(Step::Progress);
        }
        if self.incoming.complete {
            return self.finish_transfer().await;
        }

        let wait = self.io_wait;
        let idle = self.poll_interval();
        match self.transport.as_mut() {
            Some(Transport::Raw(conn)) => {
                conn.parse(&mut self.incoming)?;
                if self.incoming.body.is_empty() && !self.incoming.complete {
                    match conn.read_some(wait).await? {
                        ReadOutcome::Data(_) => {
                            self.last_activity = std::time::Instant::now();
                            conn.parse(&mut self.incoming)?;
                        }
                        ReadOutcome::Empty => return Ok(Step::Idle(idle)),
                        ReadOutcome::Closed => conn.parser().finish(&mut self.incoming)?,
                    }
                }
            }
            Some(Transport::Multiplexed(stream)) => {
                let read = stream.poll(wait).await?;
                if read.is_empty() {
                    return Ok(Step::Idle(idle));
                }
                self.touch();
                if read.switch && self.bytes_done == 0 {
                    return Err(FetchError::Mux(MuxError::Refused(ERROR_REFUSED_STREAM)));
                }
                if read.switch {
                    return Err(FetchError::Mux(MuxError::TransportGone));
                }
                self.absorb_mux_read(read)?;
            }
            Some(Transport::External(backend)) => match backend.next_event(wait).await? {
                None => return Ok(Step::Idle(idle)),
                Some(event) => {
                    self.touch();
                    if self.absorb_backend_event(event).is_some() {
                        return Err(FetchError::Protocol("second reply from backend".into()));
                    }
                }
            },
            None => return Err(FetchError::Protocol("no transport".into())),
        }
        self.consume_body();
        if self.incoming.complete && self.incoming.body.is_empty() {
            return self.finish_transfer().await;
        }
        Ok(Step::Progress)
    }

    /// Filter, cache and deliver everything in `incoming.body`.
    fn consume_body(&mut self) {
        let raw = self.incoming.body.split();
        if raw.is_empty() {
            return;
        }
        let data = match self.icy.as_mut() {
            Some(filter) => {
                let mut out = BytesMut::with_capacity(raw.len());
                filter.filter(&raw, &mut out);
                out
            }
            None => raw,
        };
        if matches!(self.cache_role, CacheRole::Writer) {
            if let Some(entry) = &self.cache {
                if let Err(e) = entry.write(self.id, &data) {
                    warn!(target: "corriere::session", session = self.id, "cache write failed, continuing uncached: {}", e);
                    self.abandon_cache_write();
                }
            }
        }
        self.deliver(data);
    }

    async fn read_cache(&mut self) -> Result<Step, FetchError> {
        let CacheRole::Reader(reader) = &mut self.cache_role else {
            return Ok(Step::Progress);
        };
        match reader.read(&mut self.scratch) {
            Ok(ReadStatus::Data(n)) => {
                let data = BytesMut::from(&self.scratch[..n]);
                self.deliver(data);
                Ok(Step::Progress)
            }
            Ok(ReadStatus::Pending) => Ok(Step::Idle(self.poll_interval())),
            Ok(ReadStatus::Eof) => {
                self.total = Some(self.bytes_done);
                self.finish_transfer().await
            }
            Ok(ReadStatus::WriterFailed) => {
                info!(target: "corriere::session", session = self.id, "cache writer failed, fetching from the network");
                self.refetch_uncached().await
            }
            Err(e) => {
                warn!(target: "corriere::session", session = self.id, "cache read failed, fetching from the network: {}", e);
                if let Some(entry) = &self.cache {
                    entry.mark_discard();
                }
                self.refetch_uncached().await
            }
        }
    }

    /// Restart from the network without the cache, skipping bytes already delivered.
    async fn refetch_uncached(&mut self) -> Result<Step, FetchError> {
        self.skip = self.bytes_done;
        self.detach_cache(false);
        self.cache_disabled = true;
        self.revalidating = false;
        self.restart().await;
        Ok(Step::Progress)
    }

    async fn finish_transfer(&mut self) -> Result<Step, FetchError> {
        if self.total.is_none() || self.method == Method::Head {
            self.total = Some(self.bytes_done);
        }
        let role = std::mem::replace(&mut self.cache_role, CacheRole::None);
        if matches!(role, CacheRole::Writer) {
            if let Some(entry) = &self.cache {
                if let Err(e) = entry.close_write(self.id, true) {
                    warn!(target: "corriere::session", session = self.id, "cache entry discarded: {}", e);
                }
            }
        }
        if let Some(h) = self.handler.as_mut() {
            h.end_body();
            h.complete();
        }
        match self.transport.take() {
            Some(Transport::Raw(mut conn)) => {
                let reusable = conn.parser().is_done()
                    && !self.reply_headers.connection_close
                    && !self.head_fallback
                    && self.proxy != ProxyState::Via;
                if reusable {
                    conn.next_reply();
                    self.manager.park_connection(conn);
                } else {
                    conn.shutdown().await;
                }
            }
            Some(Transport::Multiplexed(stream)) => {
                if self.head_fallback {
                    let _ = stream.reset(false).await;
                }
                self.transport = Some(Transport::Multiplexed(stream));
            }
            Some(Transport::External(_)) | None => {}
        }
        self.detach_cache(true);
        self.shared.set_rate(0);
        info!(target: "corriere::session", session = self.id, url = %self.url.canonical(), bytes = self.bytes_done, "transfer complete");
        self.set_state(SessionState::DataTransferred);
        self.publish();
        Ok(Step::Progress)
    }

    /// Retry transient failures within budget; otherwise move to `Error`.
    pub(super) async fn handle_failure(&mut self, e: FetchError) {
        if self.state.is_terminal() {
            return;
        }
        let tls_fallback = matches!(e, FetchError::Tls(_)) && self.pref.h2 && !self.pref.tls_fallback_used;
        let max = self.manager.config().max_retries;
        if e.is_transient() || tls_fallback {
            if self.retries < max {
                self.retries += 1;
                info!(target: "corriere::session", session = self.id, attempt = self.retries, url = %self.url.canonical(), "retrying after: {}", e);
                if tls_fallback {
                    self.pref.h2 = false;
                    self.pref.tls_fallback_used = true;
                }
                if let Some(t) = self.transport.take() {
                    self.discard_transport(t).await;
                }
                if matches!(self.cache_role, CacheRole::Reader(_)) {
                    self.cache_role = CacheRole::None;
                }
                self.abandon_cache_write();
                self.skip = self.bytes_done;
                self.incoming = Incoming::default();
                self.set_state(SessionState::Setup);
                return;
            }
            if self.retries > 0 {
                warn!(target: "corriere::session", session = self.id, "giving up after {} retries: {}", self.retries, e);
                self.fail(FetchError::RetriesExhausted(self.retries)).await;
                return;
            }
        }
        self.fail(e).await;
    }
}
