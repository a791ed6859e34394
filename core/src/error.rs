/*
 * error.rs
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

//! Error taxonomy for the fetching engine.
//!
//! Every failure a session can surface is a [`FetchError`]. Errors are `Clone` so the terminal
//! error can be kept on the session and reported again to later callers (I/O errors are shared
//! behind an `Arc`).

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use crate::cache::CacheError;
pub use crate::mux::MuxError;

/// Broad class of a [`FetchError`], used for retry policy and for the FFI error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Protocol,
    Cache,
    HttpStatus,
    Resource,
    Aborted,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid URL: {0}")]
    Url(String),

    #[error("redirect loop: more than {0} redirects")]
    RedirectLoop(u32),

    #[error("redirect without Location header")]
    MissingLocation,

    #[error("authentication required for {0}")]
    Unauthorized(String),

    #[error("resource not found (HTTP {0})")]
    NotFound(u16),

    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("remote service error (HTTP {0})")]
    Service(u16),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("gave up after {0} retries")]
    RetriesExhausted(u32),

    #[error("out of memory")]
    OutOfMemory,

    #[error("session aborted")]
    Aborted,
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Connect { .. }
            | FetchError::ConnectionClosed
            | FetchError::Timeout(_)
            | FetchError::Io(_)
            | FetchError::Tls(_)
            | FetchError::RetriesExhausted(_) => ErrorCategory::Network,
            FetchError::Protocol(_) | FetchError::Mux(_) | FetchError::Url(_) => {
                ErrorCategory::Protocol
            }
            FetchError::Cache(CacheError::Io(e)) if is_disk_full(e) => ErrorCategory::Resource,
            FetchError::Cache(CacheError::OutOfMemory) => ErrorCategory::Resource,
            FetchError::Cache(_) => ErrorCategory::Cache,
            FetchError::RedirectLoop(_)
            | FetchError::MissingLocation
            | FetchError::Unauthorized(_)
            | FetchError::NotFound(_)
            | FetchError::RangeNotSatisfiable
            | FetchError::Service(_)
            | FetchError::Status(_) => ErrorCategory::HttpStatus,
            FetchError::OutOfMemory => ErrorCategory::Resource,
            FetchError::Aborted => ErrorCategory::Aborted,
        }
    }

    /// True for conditions that are retried locally before being surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::ConnectionClosed => true,
            FetchError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Interrupted
            ),
            FetchError::Mux(MuxError::Refused(_)) | FetchError::Mux(MuxError::TransportGone) => {
                true
            }
            _ => false,
        }
    }

    pub fn connect(host: &str, port: u16, source: io::Error) -> Self {
        FetchError::Connect {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => FetchError::ConnectionClosed,
            io::ErrorKind::TimedOut => FetchError::Timeout("network operation"),
            io::ErrorKind::OutOfMemory => FetchError::OutOfMemory,
            _ => FetchError::Io(Arc::new(e)),
        }
    }
}

fn is_disk_full(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}

pub type Result<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_connection_closed() {
        let e: FetchError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(e, FetchError::ConnectionClosed));
        assert!(e.is_transient());
        assert_eq!(e.category(), ErrorCategory::Network);
    }

    #[test]
    fn http_status_errors_are_not_retried() {
        for e in [
            FetchError::NotFound(404),
            FetchError::RangeNotSatisfiable,
            FetchError::Service(500),
            FetchError::RedirectLoop(4),
        ] {
            assert!(!e.is_transient());
            assert_eq!(e.category(), ErrorCategory::HttpStatus);
        }
    }

    #[test]
    fn refused_stream_is_transient() {
        let e = FetchError::Mux(MuxError::Refused(3));
        assert!(e.is_transient());
        assert_eq!(e.category(), ErrorCategory::Protocol);
    }
}
