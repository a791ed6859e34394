/*
 * icy.rs
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

//! ICY (Shoutcast) in-band metadata removal.
//!
//! After every `metaint` payload bytes the server inserts a length byte `L` followed by
//! `16 * L` bytes of metadata such as `StreamTitle='...';`.

use bytes::BytesMut;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Payload { left: usize },
    Length,
    Metadata { left: usize },
}

#[derive(Debug)]
pub struct IcyFilter {
    metaint: usize,
    phase: Phase,
    meta: Vec<u8>,
    title: Option<String>,
}

impl IcyFilter {
    pub fn new(metaint: usize) -> Self {
        Self {
            metaint,
            phase: Phase::Payload { left: metaint },
            meta: Vec::new(),
            title: None,
        }
    }

    /// Append the payload bytes of `input` to `out`.
    pub fn filter(&mut self, mut input: &[u8], out: &mut BytesMut) {
        while !input.is_empty() {
            match self.phase {
                Phase::Payload { left } => {
                    let n = left.min(input.len());
                    out.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    self.phase = if n == left {
                        Phase::Length
                    } else {
                        Phase::Payload { left: left - n }
                    };
                }
                Phase::Length => {
                    let len = input[0] as usize * 16;
                    input = &input[1..];
                    self.meta.clear();
                    self.phase = if len == 0 {
                        Phase::Payload { left: self.metaint }
                    } else {
                        Phase::Metadata { left: len }
                    };
                }
                Phase::Metadata { left } => {
                    let n = left.min(input.len());
                    self.meta.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    if n == left {
                        self.parse_metadata();
                        self.phase = Phase::Payload { left: self.metaint };
                    } else {
                        self.phase = Phase::Metadata { left: left - n };
                    }
                }
            }
        }
    }

    fn parse_metadata(&mut self) {
        let text = String::from_utf8_lossy(&self.meta);
        let text = text.trim_end_matches('\0');
        if let Some(start) = text.find("StreamTitle='") {
            let rest = &text[start + "StreamTitle='".len()..];
            let end = rest.find("';").unwrap_or(rest.len());
            let title = rest[..end].to_string();
            debug!(target: "corriere::session", %title, "ICY title");
            self.title = Some(title);
        }
    }

    /// Last `StreamTitle` seen.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        let meta = b"StreamTitle='Song A';";
        let blocks = (meta.len() + 15) / 16;
        let mut v = b"abcd".to_vec();
        v.push(blocks as u8);
        v.extend_from_slice(meta);
        v.resize(5 + blocks * 16, 0);
        v.extend_from_slice(b"efgh");
        v.push(0);
        v.extend_from_slice(b"ij");
        v
    }

    #[test]
    fn strips_metadata() {
        let mut f = IcyFilter::new(4);
        let mut out = BytesMut::new();
        f.filter(&stream(), &mut out);
        assert_eq!(&out[..], b"abcdefghij");
        assert_eq!(f.title(), Some("Song A"));
    }

    #[test]
    fn byte_at_a_time() {
        let mut f = IcyFilter::new(4);
        let mut out = BytesMut::new();
        for b in stream() {
            f.filter(&[b], &mut out);
        }
        assert_eq!(&out[..], b"abcdefghij");
        assert_eq!(f.title(), Some("Song A"));
    }
}
