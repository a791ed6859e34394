/*
 * mod.rs
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

//! HTTP protocol pieces used by download sessions.
//!
//! - HTTP/1.1: state-machine response parser fed from a `BytesMut`, resumable at any byte.
//! - Request heads are protocol-neutral; HTTP/1.1 serializes them directly, multiplexed
//!   transports hand them to their stream provider.
//! - Reply headers are interpreted once into [`ReplyHeaders`] for cache and policy decisions.

mod handler;
mod request;
mod response;

pub mod h1;

pub use h1::{H1ResponseHandler, ParseState, ResponseParser};
pub use handler::ResponseHandler;
pub use request::{Method, RequestHead};
pub use response::{ContentRange, ReplyHeaders, Response};
