/*
 * net.rs
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

//! Secure channel provider. The engine hands a connected `TcpStream` to a [`SecureChannel`]
//! and gets back an encrypted stream with the ALPN result; certificate verification is part of
//! the handshake and either accepts or rejects the peer.
//!
//! [`RustlsChannel`] is the default provider: platform roots first, then webpki-roots.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use crate::config::EngineInit;

/// Boxed future for object-safe async provider traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Byte stream usable as a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Encrypted stream returned by a secure channel provider.
pub struct SecureStream {
    inner: Box<dyn AsyncStream>,
    alpn: Option<Vec<u8>>,
}

impl SecureStream {
    pub fn new(inner: Box<dyn AsyncStream>, alpn: Option<Vec<u8>>) -> Self {
        Self { inner, alpn }
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn into_inner(self) -> Box<dyn AsyncStream> {
        self.inner
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Secure channel provider: handshake (with certificate verification) over a TCP stream.
pub trait SecureChannel: Send + Sync {
    /// `offer_h2` adds `h2` to the ALPN offer. A rejected certificate is an
    /// `io::ErrorKind::InvalidData` error.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        tcp: TcpStream,
        offer_h2: bool,
    ) -> BoxFuture<'a, io::Result<SecureStream>>;
}

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// TLS client config with the given ALPN protocols, in preference order.
pub fn client_config(alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(build_root_store())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Default provider backed by rustls.
pub struct RustlsChannel {
    init: Arc<EngineInit>,
}

impl RustlsChannel {
    pub fn new(init: Arc<EngineInit>) -> Self {
        Self { init }
    }
}

impl SecureChannel for RustlsChannel {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        tcp: TcpStream,
        offer_h2: bool,
    ) -> BoxFuture<'a, io::Result<SecureStream>> {
        Box::pin(async move {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;
            let connector = TlsConnector::from(self.init.tls_config(offer_h2));
            let tls = connector.connect(server_name, tcp).await?;
            let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
            Ok::<_, io::Error>(SecureStream::new(Box::new(tls), alpn))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_order_is_kept() {
        let cfg = client_config(&[b"h2", b"http/1.1"]);
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn h1_only_config_has_no_h2() {
        let init = EngineInit::global();
        assert!(!init.tls_config(false).alpn_protocols.contains(&b"h2".to_vec()));
        assert!(init.tls_config(true).alpn_protocols.contains(&b"h2".to_vec()));
    }
}
