/*
 * response.rs
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

//! Response status and the reply headers the engine acts on.

/// Status of a received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub reason: Option<String>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 301 | 302 | 303 | 307 | 308)
    }

    /// 1xx, 204 and 304 never carry a body.
    pub fn has_body(&self) -> bool {
        !((100..200).contains(&self.code) || self.code == 204 || self.code == 304)
    }
}

/// `Content-Range: bytes a-b/total` or `bytes */total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub first: Option<u64>,
    pub last: Option<u64>,
    pub total: Option<u64>,
}

/// Interpreted reply headers. Every header is also kept verbatim in `all`.
#[derive(Debug, Clone, Default)]
pub struct ReplyHeaders {
    pub content_length: Option<u64>,
    pub mime_type: Option<String>,
    pub content_range: Option<ContentRange>,
    pub accept_ranges_none: bool,
    pub location: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub max_age: Option<u64>,
    pub must_revalidate: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub chunked: bool,
    pub connection_close: bool,
    pub icy_metaint: Option<usize>,
    pub is_icy: bool,
    pub www_authenticate: Option<String>,
    pub all: Vec<(String, String)>,
}

impl ReplyHeaders {
    pub fn add(&mut self, name: &str, value: &str) {
        self.all.push((name.to_string(), value.to_string()));
        let lname = name.to_ascii_lowercase();
        match lname.as_str() {
            "content-length" => self.content_length = value.trim().parse().ok(),
            "content-type" => {
                let mime = value.split(';').next().unwrap_or("").trim();
                if !mime.is_empty() {
                    self.mime_type = Some(mime.to_ascii_lowercase());
                }
            }
            "content-range" => self.content_range = parse_content_range(value),
            "accept-ranges" => self.accept_ranges_none = value.trim().eq_ignore_ascii_case("none"),
            "location" => self.location = Some(value.trim().to_string()),
            "etag" => self.etag = Some(value.trim().to_string()),
            "last-modified" => self.last_modified = Some(value.trim().to_string()),
            "cache-control" => self.parse_cache_control(value),
            "pragma" if value.to_ascii_lowercase().contains("no-cache") => self.no_cache = true,
            "transfer-encoding" => {
                self.chunked = value.to_ascii_lowercase().contains("chunked");
            }
            "connection" => {
                self.connection_close = value.to_ascii_lowercase().contains("close");
            }
            "www-authenticate" => self.www_authenticate = Some(value.trim().to_string()),
            _ if lname.starts_with("icy-") => {
                self.is_icy = true;
                if lname == "icy-metaint" {
                    self.icy_metaint = value.trim().parse().ok().filter(|n| *n > 0);
                }
            }
            _ => {}
        }
    }

    fn parse_cache_control(&mut self, value: &str) {
        for directive in value.split(',') {
            let d = directive.trim().to_ascii_lowercase();
            if let Some(age) = d.strip_prefix("max-age=") {
                self.max_age = age.trim_matches('"').parse().ok();
            } else if d == "must-revalidate" || d == "proxy-revalidate" {
                self.must_revalidate = true;
            } else if d == "no-cache" {
                self.no_cache = true;
            } else if d == "no-store" {
                self.no_store = true;
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.all
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Total resource size advertised by Content-Range, else Content-Length.
    pub fn total_size(&self) -> Option<u64> {
        self.content_range
            .and_then(|r| r.total)
            .or(self.content_length)
    }
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = spec.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let (first, last) = match range.trim() {
        "*" => (None, None),
        r => {
            let (a, b) = r.split_once('-')?;
            (Some(a.trim().parse().ok()?), Some(b.trim().parse().ok()?))
        }
    };
    Some(ContentRange { first, last, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_cut_at_parameters() {
        let mut h = ReplyHeaders::default();
        h.add("Content-Type", "Video/MP4; codecs=\"avc1\"");
        assert_eq!(h.mime_type.as_deref(), Some("video/mp4"));
    }

    #[test]
    fn content_range_forms() {
        let mut h = ReplyHeaders::default();
        h.add("Content-Range", "bytes 100-199/1000");
        assert_eq!(
            h.content_range,
            Some(ContentRange { first: Some(100), last: Some(199), total: Some(1000) })
        );
        h.add("Content-Length", "100");
        assert_eq!(h.total_size(), Some(1000));

        let mut star = ReplyHeaders::default();
        star.add("content-range", "bytes */42");
        assert_eq!(star.content_range.unwrap().total, Some(42));
        assert_eq!(star.content_range.unwrap().first, None);
    }

    #[test]
    fn cache_control_directives() {
        let mut h = ReplyHeaders::default();
        h.add("Cache-Control", "public, max-age=60, must-revalidate");
        assert_eq!(h.max_age, Some(60));
        assert!(h.must_revalidate);
        assert!(!h.no_store);
        h.add("Cache-Control", "no-store");
        assert!(h.no_store);
    }

    #[test]
    fn icy_headers() {
        let mut h = ReplyHeaders::default();
        h.add("icy-name", "radio");
        h.add("icy-metaint", "16000");
        assert!(h.is_icy);
        assert_eq!(h.icy_metaint, Some(16000));
    }

    #[test]
    fn body_expectations() {
        assert!(!Response::new(304).has_body());
        assert!(!Response::new(204).has_body());
        assert!(Response::new(200).has_body());
        assert!(Response::new(307).is_redirect());
    }
}
