/*
 * lib.rs
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

//! Corriere core: a resource-fetching engine.
//!
//! - [`manager::DownloadManager`] owns everything sessions share: cache, credentials, proxy
//!   skip list, multiplexers and idle connections.
//! - [`session::Session`] fetches one resource through a small state machine, from the cache
//!   or over HTTP/1.1, a multiplexed stream, or an external backend.
//! - [`cache`] keeps entries on disk or in memory, shared between sessions and processes.
//! - [`mux`] shares one HTTP/2 or HTTP/3 connection between sessions.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod manager;
pub mod mux;
pub mod net;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod uri;

pub use config::{EngineConfig, EngineInit, ProxyConfig, ReusePolicy};
pub use error::{ErrorCategory, FetchError};
pub use manager::{CredentialRequest, DownloadManager};
pub use session::{Fetched, Session, SessionFlags, SessionId, SessionState, SessionStats};
pub use uri::{ByteRange, UrlInfo};
