/*
 * provider.rs
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

//! Outbound interface to the stream codec (HTTP/2 framing or HTTP/3 over QUIC). The engine
//! never frames bytes itself: it feeds transport input to a [`StreamProvider`], writes back
//! whatever output the provider queues, and receives per-stream events through
//! [`StreamEvents`].

use bytes::Bytes;
use std::io;

use super::MuxError;
use crate::net::{AsyncStream, BoxFuture};
use crate::protocol::http::RequestHead;

pub const ERROR_NO_ERROR: u32 = 0x0;
pub const ERROR_PROTOCOL_ERROR: u32 = 0x1;
pub const ERROR_INTERNAL_ERROR: u32 = 0x2;
pub const ERROR_REFUSED_STREAM: u32 = 0x7;
pub const ERROR_CANCEL: u32 = 0x8;

pub fn error_to_string(code: u32) -> &'static str {
    match code {
        ERROR_NO_ERROR => "NO_ERROR",
        ERROR_PROTOCOL_ERROR => "PROTOCOL_ERROR",
        ERROR_INTERNAL_ERROR => "INTERNAL_ERROR",
        0x3 => "FLOW_CONTROL_ERROR",
        0x5 => "STREAM_CLOSED",
        ERROR_REFUSED_STREAM => "REFUSED_STREAM",
        ERROR_CANCEL => "CANCEL",
        0xb => "ENHANCE_YOUR_CALM",
        0xd => "HTTP_1_1_REQUIRED",
        _ => "UNKNOWN",
    }
}

/// Protocol carried by a multiplexed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxKind {
    Http2,
    Http3,
}

impl MuxKind {
    pub fn alpn(self) -> &'static str {
        match self {
            MuxKind::Http2 => "h2",
            MuxKind::Http3 => "h3",
        }
    }
}

/// Which side opens streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Client,
    Server,
}

/// Stream events decoded by a provider from transport input.
pub trait StreamEvents {
    /// One header field; pseudo-headers (`:status`) included.
    fn header(&mut self, stream_id: u32, name: &str, value: &str);
    fn headers_complete(&mut self, stream_id: u32, end_stream: bool);
    fn data(&mut self, stream_id: u32, data: &[u8], end_stream: bool);
    /// Stream closed or reset by the peer; `error_code` 0 is a clean close.
    fn stream_closed(&mut self, stream_id: u32, error_code: u32);
    /// The peer is shutting the connection down; streams above `last_stream_id` were not
    /// processed.
    fn goaway(&mut self, last_stream_id: u32, error_code: u32);
}

/// Sans-I/O stream codec for one connection.
pub trait StreamProvider: Send {
    fn kind(&self) -> MuxKind;

    /// Open a stream carrying `head`. Returns the new stream id.
    fn submit_request(
        &mut self,
        head: &RequestHead,
        scheme: &str,
        end_stream: bool,
    ) -> Result<u32, MuxError>;

    /// Server role: answer a peer-opened stream.
    fn submit_response(
        &mut self,
        stream_id: u32,
        status: u16,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<(), MuxError>;

    /// Queue body bytes. Returns how many were accepted under flow control.
    fn send(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<usize, MuxError>;

    /// Feed bytes read from the transport.
    fn data_received(&mut self, input: &[u8], events: &mut dyn StreamEvents) -> Result<(), MuxError>;

    fn stream_reset(&mut self, stream_id: u32, error_code: u32);

    /// Resume a stream whose upload was paused by flow control.
    fn resume_stream(&mut self, stream_id: u32);

    /// Bytes to write to the transport; empty when nothing is queued.
    fn take_output(&mut self) -> Bytes;

    /// Start a graceful connection shutdown.
    fn shutdown(&mut self);

    fn wants_read(&self) -> bool {
        true
    }
}

/// Builds providers for connections where ALPN selected `h2`.
pub trait StreamProviderFactory: Send + Sync {
    fn create(&self, kind: MuxKind, role: MuxRole) -> Box<dyn StreamProvider>;
}

/// Opens QUIC connections; the returned stream carries the provider's datagrams.
pub trait QuicConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, io::Result<(Box<dyn AsyncStream>, Box<dyn StreamProvider>)>>;
}
