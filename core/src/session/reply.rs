/*
 * reply.rs
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

//! What a session does with a reply status.

use crate::error::FetchError;
use crate::protocol::http::ReplyHeaders;
use crate::uri::UrlInfo;

#[derive(Debug, Clone)]
pub(crate) enum ReplyAction {
    /// Deliver the body.
    Body,
    /// Interim 1xx reply; wait for the final one.
    Interim,
    /// Serve the cached content.
    NotModified,
    Redirect { to: UrlInfo, use_get: bool },
    Authenticate,
    /// The server rejected HEAD; retry with GET.
    HeadFallback,
    /// The proxy failed; retry directly.
    BypassProxy,
    Fail(FetchError),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReplyContext {
    pub head: bool,
    pub via_proxy: bool,
    pub revalidating: bool,
    pub range_requested: bool,
}

pub(crate) fn classify(
    status: u16,
    headers: &ReplyHeaders,
    url: &UrlInfo,
    ctx: ReplyContext,
) -> ReplyAction {
    match status {
        100..=199 => ReplyAction::Interim,
        200 if ctx.range_requested && headers.accept_ranges_none => {
            ReplyAction::Fail(FetchError::RangeNotSatisfiable)
        }
        200..=299 => ReplyAction::Body,
        304 if ctx.revalidating => ReplyAction::NotModified,
        301 | 302 | 303 | 307 | 308 => {
            let location = match headers.location.as_deref() {
                Some(l) if !l.trim().is_empty() => l,
                _ => return ReplyAction::Fail(FetchError::MissingLocation),
            };
            match url.resolve(location) {
                Ok(to) => ReplyAction::Redirect {
                    to,
                    use_get: status == 303,
                },
                Err(e) => ReplyAction::Fail(e),
            }
        }
        401 => ReplyAction::Authenticate,
        400 | 501 if ctx.head => ReplyAction::HeadFallback,
        404 | 410 => ReplyAction::Fail(FetchError::NotFound(status)),
        416 => ReplyAction::Fail(FetchError::RangeNotSatisfiable),
        503 if ctx.via_proxy => ReplyAction::BypassProxy,
        500..=599 => ReplyAction::Fail(FetchError::Service(status)),
        _ => ReplyAction::Fail(FetchError::Status(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> UrlInfo {
        UrlInfo::parse("http://h/dir/a.mpd").unwrap()
    }

    fn with(name: &str, value: &str) -> ReplyHeaders {
        let mut h = ReplyHeaders::default();
        h.add(name, value);
        h
    }

    #[test]
    fn redirects_resolve_relative_locations() {
        let h = with("Location", "b.mpd");
        match classify(302, &h, &url(), ReplyContext::default()) {
            ReplyAction::Redirect { to, use_get } => {
                assert_eq!(to.canonical(), "http://h/dir/b.mpd");
                assert!(!use_get);
            }
            other => panic!("{:?}", other),
        }
        assert!(matches!(
            classify(303, &h, &url(), ReplyContext::default()),
            ReplyAction::Redirect { use_get: true, .. }
        ));
        assert!(matches!(
            classify(301, &ReplyHeaders::default(), &url(), ReplyContext::default()),
            ReplyAction::Fail(FetchError::MissingLocation)
        ));
    }

    #[test]
    fn status_mapping() {
        let h = ReplyHeaders::default();
        let ctx = ReplyContext::default();
        assert!(matches!(classify(206, &h, &url(), ctx), ReplyAction::Body));
        assert!(matches!(classify(100, &h, &url(), ctx), ReplyAction::Interim));
        assert!(matches!(classify(401, &h, &url(), ctx), ReplyAction::Authenticate));
        assert!(matches!(classify(410, &h, &url(), ctx), ReplyAction::Fail(FetchError::NotFound(410))));
        assert!(matches!(classify(416, &h, &url(), ctx), ReplyAction::Fail(FetchError::RangeNotSatisfiable)));
        assert!(matches!(classify(502, &h, &url(), ctx), ReplyAction::Fail(FetchError::Service(502))));
        assert!(matches!(classify(418, &h, &url(), ctx), ReplyAction::Fail(FetchError::Status(418))));
        assert!(matches!(classify(304, &h, &url(), ctx), ReplyAction::Fail(FetchError::Status(304))));
    }

    #[test]
    fn context_dependent_statuses() {
        let h = ReplyHeaders::default();
        let head = ReplyContext { head: true, ..Default::default() };
        assert!(matches!(classify(501, &h, &url(), head), ReplyAction::HeadFallback));
        let proxy = ReplyContext { via_proxy: true, ..Default::default() };
        assert!(matches!(classify(503, &h, &url(), proxy), ReplyAction::BypassProxy));
        let reval = ReplyContext { revalidating: true, ..Default::default() };
        assert!(matches!(classify(304, &h, &url(), reval), ReplyAction::NotModified));
        let ranged = ReplyContext { range_requested: true, ..Default::default() };
        let none = with("Accept-Ranges", "none");
        assert!(matches!(classify(200, &none, &url(), ranged), ReplyAction::Fail(FetchError::RangeNotSatisfiable)));
    }
}
