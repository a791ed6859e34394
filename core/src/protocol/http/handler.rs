/*
 * handler.rs
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

//! Observer for a session's response events (push model), alongside the pull-based
//! `Session::fetch`.
//!
//! Events: `ok`/`error` → `header` (×n) → `start_body` → `body_chunk` (×n) → `end_body` →
//! `complete`, or `failed` at any point. Redirects and authentication retries are followed
//! internally; only the final response is reported.

use crate::error::FetchError;
use crate::protocol::http::response::Response;

pub trait ResponseHandler: Send {
    /// Called when a successful (2xx) status is received, or when the resource is served from
    /// the cache (status 200 or 304).
    fn ok(&mut self, response: Response);

    /// Called when an error status (4xx, 5xx) is received.
    fn error(&mut self, response: Response);

    /// Called for each response header. Name may repeat for multi-value headers.
    fn header(&mut self, name: &str, value: &str);

    fn start_body(&mut self);

    /// Called for each decoded chunk of body data, in order.
    fn body_chunk(&mut self, data: &[u8]);

    fn end_body(&mut self);

    fn complete(&mut self);

    /// Called once when the session enters its error state.
    fn failed(&mut self, error: &FetchError);
}
