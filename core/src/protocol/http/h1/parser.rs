/*
 * parser.rs
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

//! HTTP/1.1 response push parser: status line, headers, body (Content-Length, chunked, or
//! read-until-close). Bytes may arrive split at any point; incomplete lines stay in the buffer
//! and parsing resumes on the next `receive`.

use bytes::Buf;
use bytes::BytesMut;
use std::io;

/// Longest status, header, chunk-size or trailer line accepted before the CRLF.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Callback for HTTP/1.1 response events.
pub trait H1ResponseHandler {
    fn status(&mut self, code: u16, reason: Option<&str>);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: &[u8]);
    fn trailer(&mut self, name: &str, value: &str);
    /// Body fully received (declared length reached, last chunk seen, or clean close).
    fn complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    StatusLine,
    Headers,
    /// Headers done; the caller must call `set_body_mode()` before feeding more bytes.
    HeadersComplete,
    Body,
    BodyUntilClose,
    ChunkSize,
    ChunkData,
    /// CRLF after a chunk's data.
    ChunkDataEnd,
    ChunkTrailer,
    Done,
}

/// Push parser for one HTTP/1.1 response. Feed bytes via `receive`.
pub struct ResponseParser {
    state: ParseState,
    /// Content-Length when known (-1 for chunked or read-until-close).
    content_length: i64,
    body_received: u64,
    chunk_remaining: u64,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            content_length: -1,
            body_received: 0,
            chunk_remaining: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    /// Decoded body bytes delivered so far.
    pub fn body_received(&self) -> u64 {
        self.body_received
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        buf.windows(2).position(|w| w == b"\r\n")
    }

    /// Next complete line (without CRLF), or None if more bytes are needed.
    fn take_line(buf: &mut BytesMut, what: &str) -> io::Result<Option<String>> {
        match Self::find_crlf(buf) {
            Some(n) => {
                let line = buf.split_to(n + 2);
                let s = std::str::from_utf8(&line[..n])
                    .map_err(|_| invalid(&format!("invalid {} UTF-8", what)))?;
                Ok(Some(s.to_string()))
            }
            None if buf.len() > MAX_LINE_LENGTH => Err(invalid(&format!("unterminated {}", what))),
            None => Ok(None),
        }
    }

    fn split_header(line: &str) -> Option<(&str, &str)> {
        let colon = line.find(':')?;
        Some((line[..colon].trim(), line[colon + 1..].trim()))
    }

    /// Consume and parse as much as possible from buf. Partial data remains in buf.
    pub fn receive<H: H1ResponseHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), io::Error> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let line = match Self::take_line(buf, "status line")? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    // Tolerate stray CRLF between pipelined responses.
                    if line.is_empty() {
                        continue;
                    }
                    let (code, reason) = parse_status_line(&line)?;
                    handler.status(code, reason);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line = match Self::take_line(buf, "header line")? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    if let Some((name, value)) = Self::split_header(&line) {
                        handler.header(name, value);
                    }
                }
                ParseState::HeadersComplete | ParseState::Done => return Ok(()),
                ParseState::Body => {
                    let remaining = (self.content_length as u64).saturating_sub(self.body_received);
                    let to_read = (remaining as usize).min(buf.len());
                    let chunk = buf.split_to(to_read);
                    handler.body_chunk(&chunk);
                    self.body_received += to_read as u64;
                    if self.body_received >= self.content_length as u64 {
                        self.state = ParseState::Done;
                        handler.complete();
                    }
                }
                ParseState::BodyUntilClose => {
                    let chunk = buf.split_to(buf.len());
                    self.body_received += chunk.len() as u64;
                    handler.body_chunk(&chunk);
                }
                ParseState::ChunkSize => {
                    let line = match Self::take_line(buf, "chunk header")? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    let hex = line.split(';').next().unwrap_or("").trim();
                    if hex.is_empty() {
                        return Err(invalid("empty chunk size"));
                    }
                    self.chunk_remaining = u64::from_str_radix(hex, 16)
                        .map_err(|_| invalid(&format!("bad chunk size {:?}", hex)))?;
                    self.state = if self.chunk_remaining == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }
                ParseState::ChunkData => {
                    let to_read = (self.chunk_remaining as usize).min(buf.len());
                    let chunk = buf.split_to(to_read);
                    handler.body_chunk(&chunk);
                    self.body_received += to_read as u64;
                    self.chunk_remaining -= to_read as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        if buf[0] != b'\r' {
                            return Err(invalid("missing CRLF after chunk data"));
                        }
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(invalid("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line = match Self::take_line(buf, "trailer")? {
                        Some(l) => l,
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.state = ParseState::Done;
                        handler.complete();
                    } else if let Some((name, value)) = Self::split_header(&line) {
                        handler.trailer(name, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Called once headers are received (state HeadersComplete). `None` with `chunked == false`
    /// reads until the peer closes. `no_body` is for HEAD requests and 1xx/204/304 replies.
    pub fn set_body_mode<H: H1ResponseHandler>(
        &mut self,
        content_length: Option<u64>,
        chunked: bool,
        no_body: bool,
        handler: &mut H,
    ) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        self.body_received = 0;
        if no_body || (!chunked && content_length == Some(0)) {
            self.content_length = 0;
            self.state = ParseState::Done;
            handler.complete();
        } else if chunked {
            self.content_length = -1;
            self.state = ParseState::ChunkSize;
        } else if let Some(cl) = content_length {
            self.content_length = cl as i64;
            self.state = ParseState::Body;
        } else {
            self.content_length = -1;
            self.state = ParseState::BodyUntilClose;
        }
    }

    /// The peer closed the connection. Completes a read-until-close body; any other unfinished
    /// state is an error.
    pub fn finish<H: H1ResponseHandler>(&mut self, handler: &mut H) -> io::Result<()> {
        match self.state {
            ParseState::Done => Ok(()),
            ParseState::BodyUntilClose => {
                self.state = ParseState::Done;
                handler.complete();
                Ok(())
            }
            ParseState::StatusLine if self.body_received == 0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            )),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-response",
            )),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `HTTP/1.1 200 OK`, `HTTP/1.0 404` or the SHOUTcast `ICY 200 OK`.
fn parse_status_line(line: &str) -> io::Result<(u16, Option<&str>)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") && version != "ICY" {
        return Err(invalid("malformed status line"));
    }
    let code = parts
        .next()
        .filter(|c| c.len() == 3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| invalid("malformed status code"))?;
    let reason = parts.next().map(str::trim).filter(|r| !r.is_empty());
    Ok((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        status: Option<(u16, Option<String>)>,
        headers: Vec<(String, String)>,
        trailers: Vec<(String, String)>,
        body: Vec<u8>,
        completed: usize,
    }

    impl H1ResponseHandler for Recorder {
        fn status(&mut self, code: u16, reason: Option<&str>) {
            self.status = Some((code, reason.map(str::to_string)));
        }
        fn header(&mut self, name: &str, value: &str) {
            self.headers.push((name.to_string(), value.to_string()));
        }
        fn body_chunk(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn trailer(&mut self, name: &str, value: &str) {
            self.trailers.push((name.to_string(), value.to_string()));
        }
        fn complete(&mut self) {
            self.completed += 1;
        }
    }

    /// Feed `pieces` one at a time, switching to body mode from the received headers.
    fn drive(pieces: &[&[u8]]) -> io::Result<(ResponseParser, Recorder)> {
        let mut parser = ResponseParser::new();
        let mut rec = Recorder::default();
        let mut buf = BytesMut::new();
        for piece in pieces {
            buf.extend_from_slice(piece);
            loop {
                parser.receive(&mut buf, &mut rec)?;
                if parser.state() != ParseState::HeadersComplete {
                    break;
                }
                let cl = rec
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.parse().ok());
                let chunked = rec
                    .headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.contains("chunked"));
                parser.set_body_mode(cl, chunked, false, &mut rec);
            }
        }
        Ok((parser, rec))
    }

    #[test]
    fn chunked_hello() {
        let (parser, rec) = drive(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        ])
        .unwrap();
        assert!(parser.is_done());
        assert_eq!(rec.body, b"hello");
        assert_eq!(parser.body_received(), 5);
        assert_eq!(rec.completed, 1);
        assert_eq!(rec.status, Some((200, Some("OK".to_string()))));
    }

    #[test]
    fn chunk_header_split_across_reads() {
        let (parser, rec) = drive(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1",
            b"0;ext=1\r",
            b"\n0123456789abcdef\r",
            b"\n0\r\nX-Sum: 1\r\n",
            b"\r\n",
        ])
        .unwrap();
        assert!(parser.is_done());
        assert_eq!(rec.body, b"0123456789abcdef");
        assert_eq!(rec.trailers, vec![("X-Sum".to_string(), "1".to_string())]);
    }

    #[test]
    fn bad_chunk_size_is_an_error() {
        let err = drive(&[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_chunk_crlf_is_an_error() {
        assert!(drive(&[b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabX\r\n"]).is_err());
    }

    #[test]
    fn unterminated_chunk_header_is_an_error() {
        let mut long = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        long.extend(std::iter::repeat(b'1').take(MAX_LINE_LENGTH + 1));
        let err = drive(&[&long]).err().unwrap();
        assert!(err.to_string().contains("unterminated chunk header"));
    }

    #[test]
    fn content_length_body_stops_at_length() {
        let (parser, rec) = drive(&[b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc"]).unwrap();
        assert!(parser.is_done());
        assert_eq!(rec.body, b"abc");
    }

    #[test]
    fn read_until_close() {
        let (mut parser, mut rec) = drive(&[b"ICY 200 OK\r\nicy-metaint: 8\r\n\r\nstream", b"ing"]).unwrap();
        assert_eq!(parser.state(), ParseState::BodyUntilClose);
        parser.finish(&mut rec).unwrap();
        assert!(parser.is_done());
        assert_eq!(rec.body, b"streaming");
        assert_eq!(parser.body_received(), 9);
        assert_eq!(rec.completed, 1);
    }

    #[test]
    fn close_mid_body_is_an_error() {
        let (mut parser, mut rec) = drive(&[b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"]).unwrap();
        assert_eq!(parser.finish(&mut rec).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn no_body_for_304() {
        let mut parser = ResponseParser::new();
        let mut rec = Recorder::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n"[..]);
        parser.receive(&mut buf, &mut rec).unwrap();
        parser.set_body_mode(None, false, true, &mut rec);
        assert!(parser.is_done());
        assert_eq!(rec.completed, 1);
    }

    #[test]
    fn malformed_status_line() {
        assert!(drive(&[b"FOO 200 OK\r\n"]).is_err());
        assert!(drive(&[b"HTTP/1.1 20 OK\r\n"]).is_err());
    }

    proptest! {
        #[test]
        fn chunked_decoding_ignores_read_boundaries(
            payload in proptest::collection::vec(any::<u8>(), 0..600),
            chunk in 1usize..64,
            split in 1usize..17,
        ) {
            let mut wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
            for part in payload.chunks(chunk) {
                wire.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
                wire.extend_from_slice(part);
                wire.extend_from_slice(b"\r\n");
            }
            wire.extend_from_slice(b"0\r\n\r\n");
            let pieces: Vec<&[u8]> = wire.chunks(split).collect();
            let (parser, rec) = drive(&pieces).unwrap();
            prop_assert!(parser.is_done());
            prop_assert_eq!(rec.body, payload);
        }
    }
}
