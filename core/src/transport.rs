/*
 * transport.rs
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

//! Transports a session can run over: a raw TCP/TLS connection speaking HTTP/1.1, a stream
//! on a shared [`Multiplexer`](crate::mux::Multiplexer), or an external protocol backend.

use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::FetchError;
use crate::mux::MuxStream;
use crate::net::{AsyncStream, BoxFuture, SecureChannel, SecureStream};
use crate::protocol::http::{H1ResponseHandler, RequestHead, ResponseParser};
use crate::uri::UrlInfo;

const READ_CHUNK: usize = 16 * 1024;

/// Unified stream: plain TCP or a secure channel. Implements AsyncRead + AsyncWrite.
pub enum NetStream {
    Plain(TcpStream),
    Secure(SecureStream),
}

impl NetStream {
    /// Open a TCP connection (and the secure channel when `secure`), bounded by `connect_timeout`.
    pub async fn open(
        host: &str,
        port: u16,
        secure: bool,
        offer_h2: bool,
        channel: &dyn SecureChannel,
        connect_timeout: Duration,
    ) -> Result<NetStream, FetchError> {
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let connect = async {
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| FetchError::connect(host, port, e))?;
            let _ = tcp.set_nodelay(true);
            if !secure {
                return Ok(NetStream::Plain(tcp));
            }
            let tls = channel.connect(host, tcp, offer_h2).await.map_err(|e| {
                if e.kind() == io::ErrorKind::InvalidData {
                    FetchError::Tls(e.to_string())
                } else {
                    FetchError::connect(host, port, e)
                }
            })?;
            Ok::<_, FetchError>(NetStream::Secure(tls))
        };
        timeout(connect_timeout, connect)
            .await
            .map_err(|_| FetchError::Timeout("connect"))?
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, NetStream::Secure(_))
    }

    /// True when ALPN selected `h2`.
    pub fn negotiated_h2(&self) -> bool {
        match self {
            NetStream::Secure(s) => s.alpn_protocol() == Some(b"h2".as_slice()),
            NetStream::Plain(_) => false,
        }
    }

    pub fn into_boxed(self) -> Box<dyn AsyncStream> {
        match self {
            NetStream::Plain(s) => Box::new(s),
            NetStream::Secure(s) => s.into_inner(),
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            NetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Secure(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            NetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Secure(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            NetStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NetStream::Secure(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            NetStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Secure(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Result of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing arrived within the wait.
    Empty,
    Closed,
}

/// One HTTP/1.1 connection owned by a single session at a time.
pub struct RawConnection {
    stream: NetStream,
    server_key: String,
    buf: BytesMut,
    parser: ResponseParser,
    requests: u32,
}

impl RawConnection {
    pub fn new(stream: NetStream, server_key: impl Into<String>) -> Self {
        Self {
            stream,
            server_key: server_key.into(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            parser: ResponseParser::new(),
            requests: 0,
        }
    }

    pub fn server_key(&self) -> &str {
        &self.server_key
    }

    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// Requests sent on this connection so far.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    /// Serialize and send a request; resets the parser for its reply.
    pub async fn send_request(&mut self, head: &RequestHead) -> io::Result<()> {
        let wire = head.to_http1();
        self.parser.reset();
        self.buf.clear();
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        self.requests += 1;
        Ok(())
    }

    /// Read whatever arrives within `wait` into the internal buffer.
    pub async fn read_some(&mut self, wait: Duration) -> io::Result<ReadOutcome> {
        self.buf.reserve(READ_CHUNK);
        match timeout(wait, self.stream.read_buf(&mut self.buf)).await {
            Err(_) => Ok(ReadOutcome::Empty),
            Ok(Ok(0)) => Ok(ReadOutcome::Closed),
            Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Feed buffered bytes to the response parser.
    pub fn parse<H: H1ResponseHandler>(&mut self, handler: &mut H) -> io::Result<()> {
        self.parser.receive(&mut self.buf, handler)
    }

    pub fn parser(&mut self) -> &mut ResponseParser {
        &mut self.parser
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Start over for an interim (1xx) reply on the same request.
    pub fn next_reply(&mut self) {
        self.parser.reset();
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    pub fn into_stream(self) -> NetStream {
        self.stream
    }
}

/// Events produced by an external protocol backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Reply {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Data(Bytes),
    End,
}

/// A non-HTTP fetcher registered with the manager. The session drives it with the same
/// timing as a network read: `next_event` returning `Ok(None)` means nothing is ready yet.
pub trait ExternalBackend: Send {
    fn start<'a>(
        &'a mut self,
        url: &'a UrlInfo,
        head: &'a RequestHead,
    ) -> BoxFuture<'a, io::Result<()>>;

    fn next_event(&mut self, wait: Duration) -> BoxFuture<'_, io::Result<Option<BackendEvent>>>;

    fn abort(&mut self);
}

/// Decides whether a URL is served by an external backend.
pub trait ExternalBackendFactory: Send + Sync {
    fn open(&self, url: &UrlInfo) -> Option<Box<dyn ExternalBackend>>;
}

/// What a session is connected through.
pub enum Transport {
    Raw(RawConnection),
    Multiplexed(MuxStream),
    External(Box<dyn ExternalBackend>),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Raw(_) => "http/1.1",
            Transport::Multiplexed(m) => m.kind().alpn(),
            Transport::External(_) => "external",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::RustlsChannel;
    use crate::config::EngineInit;
    use crate::protocol::http::Method;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect {
        status: u16,
        body: Vec<u8>,
        done: bool,
    }

    impl H1ResponseHandler for Collect {
        fn status(&mut self, code: u16, _reason: Option<&str>) {
            self.status = code;
        }
        fn header(&mut self, _name: &str, _value: &str) {}
        fn body_chunk(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn trailer(&mut self, _name: &str, _value: &str) {}
        fn complete(&mut self) {
            self.done = true;
        }
    }

    #[tokio::test]
    async fn raw_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 1024];
            let _ = sock.read(&mut req).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });
        let channel = RustlsChannel::new(EngineInit::global());
        let stream = NetStream::open(
            "127.0.0.1",
            port,
            false,
            false,
            &channel,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!stream.negotiated_h2());
        let mut conn = RawConnection::new(stream, "http://127.0.0.1");
        let head = RequestHead::new(Method::Get, "/", "127.0.0.1");
        conn.send_request(&head).await.unwrap();
        let mut collect = Collect::default();
        while !collect.done {
            match conn.read_some(Duration::from_millis(200)).await.unwrap() {
                ReadOutcome::Closed => break,
                _ => {}
            }
            conn.parse(&mut collect).unwrap();
            if conn.parser().state() == crate::protocol::http::ParseState::HeadersComplete {
                conn.parser().set_body_mode(Some(2), false, false, &mut collect);
                conn.parse(&mut collect).unwrap();
            }
        }
        assert_eq!(collect.status, 200);
        assert_eq!(collect.body, b"ok");
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let channel = RustlsChannel::new(EngineInit::global());
        let err = NetStream::open("127.0.0.1", port, false, false, &channel, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Connect { .. }));
    }
}
