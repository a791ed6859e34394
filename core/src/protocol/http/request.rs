/*
 * request.rs
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

//! HTTP request head: method, target, ordered headers, optional body.
//!
//! Serialized to HTTP/1.1 by [`RequestHead::to_http1`]; multiplexed transports receive the
//! same head and map it to their own header representation.

use bytes::{BufMut, BytesMut};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Other(&'static str),
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(s) => s,
        }
    }
}

/// Request head. Header names keep the case they were given; lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Origin-form path, or absolute URL when talking to a proxy.
    pub target: String,
    /// Value for Host / :authority.
    pub authority: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            authority: authority.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    /// Add a header only if no header of that name exists yet.
    pub fn default_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.header(name).is_none() {
            self.headers.push((name.to_string(), value.into()));
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn body(&mut self, data: Vec<u8>) -> &mut Self {
        self.body = Some(data);
        self
    }

    /// Serialize request line, Host, headers and body. A body without Content-Length is sent
    /// with Content-Length computed here.
    pub fn to_http1(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_slice(b" HTTP/1.1\r\nHost: ");
        out.put_slice(self.authority.as_bytes());
        out.put_slice(b"\r\n");
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("host") {
                continue;
            }
            out.put_slice(k.as_bytes());
            out.put_slice(b": ");
            out.put_slice(v.as_bytes());
            out.put_slice(b"\r\n");
        }
        if let Some(body) = &self.body {
            if self.header("Content-Length").is_none() {
                out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
            }
        }
        out.put_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.put_slice(body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_replace_is_case_insensitive() {
        let mut req = RequestHead::new(Method::Get, "/", "h");
        req.set_header("User-Agent", "a");
        req.set_header("user-agent", "b");
        req.default_header("USER-AGENT", "c");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("User-Agent"), Some("b"));
    }

    #[test]
    fn http1_serialization() {
        let mut req = RequestHead::new(Method::Post, "/up?x=1", "h:8080");
        req.set_header("Accept", "*/*");
        req.body(b"abc".to_vec());
        let wire = req.to_http1();
        assert_eq!(
            &wire[..],
            &b"POST /up?x=1 HTTP/1.1\r\nHost: h:8080\r\nAccept: */*\r\nContent-Length: 3\r\n\r\nabc"[..]
        );
    }
}
