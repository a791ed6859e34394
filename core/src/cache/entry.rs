/*
 * entry.rs
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

//! One cached resource: content (disk file or memory blob), validators, freshness, the single
//! writer and the sessions attached to it.

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::lock::{NamedLock, ENTRY_LOCK_SPIN};
use super::memory::MemoryBlob;
use super::metadata::{CacheMetadata, Condition};
use super::{unix_now, CacheError};
use crate::config::ReusePolicy;
use crate::session::SessionId;
use crate::uri::ByteRange;

const DEFAULT_EXTENSION: &str = ".dat";
const MAX_EXTENSION_LEN: usize = 6;

/// Where an entry keeps its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Disk,
    Memory,
}

/// What a session may do with an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    /// Serve from the entry without contacting the server.
    Direct,
    /// Send the validators; a 304 serves from the entry.
    Revalidate,
    Refetch,
}

/// Files backing a disk entry.
#[derive(Debug, Clone)]
pub struct EntryPaths {
    pub content: PathBuf,
    pub metadata: PathBuf,
    pub lock: PathBuf,
}

impl EntryPaths {
    pub fn new(dir: &Path, url: &str, range: Option<ByteRange>) -> Self {
        let stem = format!("cache_{}", cache_key(url, range));
        let content = dir.join(format!("{}{}", stem, url_extension(url)));
        let metadata = dir.join(format!("{}.json", stem));
        let lock = dir.join(format!("{}.json.lock", stem));
        Self {
            content,
            metadata,
            lock,
        }
    }
}

/// SHA-1 hex of the URL, plus the range when there is one.
pub fn cache_key(url: &str, range: Option<ByteRange>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    if let Some(r) = range {
        hasher.update(format!(" {}-{}", r.start, r.end.map(|e| e.to_string()).unwrap_or_default()));
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Extension of the URL's last path segment when it is short enough, else `.dat`.
pub fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let segment = match path.split_once('/') {
        Some((_, p)) => p.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    match segment.rfind('.') {
        Some(i) => {
            let ext = &segment[i..];
            if ext.len() > 1
                && ext.len() < MAX_EXTENSION_LEN
                && ext[1..].chars().all(|c| c.is_ascii_alphanumeric())
            {
                ext.to_ascii_lowercase()
            } else {
                DEFAULT_EXTENSION.to_string()
            }
        }
        None => DEFAULT_EXTENSION.to_string(),
    }
}

#[derive(Debug, Default)]
struct EntryState {
    content_length: Option<u64>,
    /// Valid-byte watermark.
    written: u64,
    mime_type: Option<String>,
    server_etag: Option<String>,
    server_last_modified: Option<String>,
    disk_etag: Option<String>,
    disk_last_modified: Option<String>,
    max_age: Option<u64>,
    must_revalidate: bool,
    no_store: bool,
    created: i64,
    writer: Option<SessionId>,
    sessions: Vec<SessionId>,
    registered: bool,
    done: bool,
    corrupted: bool,
    deleted: bool,
    discard: bool,
    persistent: bool,
    write_failed: bool,
    in_progress_elsewhere: bool,
    shared: bool,
    file: Option<File>,
}

/// A cached resource shared by every session fetching the same URL and range.
#[derive(Debug)]
pub struct CacheEntry {
    url: String,
    range: Option<ByteRange>,
    paths: Option<EntryPaths>,
    pid: u32,
    state: Mutex<EntryState>,
    blob: Mutex<MemoryBlob>,
}

impl CacheEntry {
    /// Memory-backed entry.
    pub fn in_memory(url: &str, range: Option<ByteRange>, pid: u32) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            range,
            paths: None,
            pid,
            state: Mutex::new(EntryState {
                created: unix_now(),
                registered: true,
                ..Default::default()
            }),
            blob: Mutex::new(MemoryBlob::new()),
        })
    }

    /// Disk entry: read and validate the metadata record, recreating it when corrupted and
    /// unused by other processes. Corruption of an entry another process still uses is an error.
    pub fn open_disk(
        dir: &Path,
        url: &str,
        range: Option<ByteRange>,
        pid: u32,
    ) -> Result<Arc<Self>, CacheError> {
        let paths = EntryPaths::new(dir, url, range);
        let _lock = NamedLock::acquire(&paths.lock, pid, ENTRY_LOCK_SPIN)?;
        let now = unix_now();
        let mut state = EntryState {
            created: now,
            ..Default::default()
        };
        let mut meta = match CacheMetadata::load(&paths.metadata) {
            Ok(Some(meta)) => meta,
            Ok(None) => CacheMetadata::new(url, range, now),
            Err(e) => {
                warn!(target: "corriere::cache", url, "unreadable metadata: {}", e);
                CacheMetadata {
                    no_cache: true,
                    ..CacheMetadata::new(url, range, now)
                }
            }
        };
        let others = meta.prune_users(pid);
        if paths.content.exists() || meta.content_length.is_some() || meta.no_cache {
            match meta.check(url, range, &paths.content, pid) {
                Condition::Valid(size) => {
                    state.content_length = Some(size);
                    state.written = size;
                    state.done = true;
                    state.mime_type = meta.mime_type.clone();
                    state.disk_etag = meta.etag.clone();
                    state.server_etag = meta.etag.clone();
                    state.disk_last_modified = meta.last_modified.clone();
                    state.server_last_modified = meta.last_modified.clone();
                    state.max_age = meta.max_age;
                    state.must_revalidate = meta.must_revalidate;
                    state.created = meta.created;
                }
                Condition::InProgress(writer) => {
                    debug!(target: "corriere::cache", url, writer, "entry being written by another process");
                    state.in_progress_elsewhere = true;
                }
                Condition::Corrupted(reason) if !others => {
                    info!(target: "corriere::cache", url, %reason, "corrupted entry with no other users, recreating");
                    let _ = fs::remove_file(&paths.content);
                    let hits = meta.num_hits;
                    meta = CacheMetadata::new(url, range, now);
                    meta.num_hits = hits;
                }
                Condition::Corrupted(reason) => {
                    info!(target: "corriere::cache", url, %reason, "incompatible entry in use elsewhere, not caching");
                    return Err(CacheError::Corrupted(reason));
                }
            }
        }
        state.shared = others;
        state.registered = true;
        meta.last_hit = now;
        meta.num_hits += 1;
        meta.users.insert(pid);
        meta.save(&paths.metadata)?;
        Ok(Arc::new(Self {
            url: url.to_string(),
            range,
            paths: Some(paths),
            pid,
            state: Mutex::new(state),
            blob: Mutex::new(MemoryBlob::new()),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    pub fn storage(&self) -> StorageKind {
        if self.paths.is_some() {
            StorageKind::Disk
        } else {
            StorageKind::Memory
        }
    }

    pub fn paths(&self) -> Option<&EntryPaths> {
        self.paths.as_ref()
    }

    /// Returns the number of attached sessions.
    pub fn attach(&self, session: SessionId) -> usize {
        let mut st = self.state.lock();
        if !st.sessions.contains(&session) {
            st.sessions.push(session);
        }
        if !st.registered {
            st.registered = true;
            if let Err(e) = self.update_metadata(|m| {
                m.users.insert(self.pid);
            }) {
                warn!(target: "corriere::cache", url = %self.url, "failed to mark entry in use: {}", e);
            }
        }
        st.sessions.len()
    }

    /// Returns the number of sessions still attached. An unfinished write by `session` is
    /// aborted; the last detach releases this process' usage marker.
    pub fn detach(&self, session: SessionId) -> usize {
        let mut st = self.state.lock();
        if st.writer == Some(session) {
            warn!(target: "corriere::cache", url = %self.url, "writer detached before closing, discarding");
            self.fail_write(&mut st);
        }
        st.sessions.retain(|&s| s != session);
        let remaining = st.sessions.len();
        if remaining == 0 && st.registered {
            st.registered = false;
            self.release(&mut st);
        }
        remaining
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Take the write lock. Fails if another session writes, or another process does.
    pub fn open_for_write(&self, session: SessionId) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        match st.writer {
            Some(w) if w == session => return Ok(()),
            Some(_) => return Err(CacheError::WriteLocked),
            None => {}
        }
        if st.in_progress_elsewhere {
            return Err(CacheError::WriteLocked);
        }
        match &self.paths {
            Some(paths) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&paths.content)?;
                st.file = Some(file);
                let pid = self.pid;
                self.update_metadata(|m| {
                    m.in_write = Some(pid);
                    m.content_length = None;
                    m.no_cache = false;
                    m.to_delete = false;
                })?;
                info!(target: "corriere::cache", url = %self.url, file = %paths.content.display(), "opened for write");
            }
            None => {
                self.blob.lock().reset(st.content_length)?;
                debug!(target: "corriere::cache", url = %self.url, "memory entry opened for write");
            }
        }
        st.writer = Some(session);
        st.written = 0;
        st.done = false;
        st.corrupted = false;
        st.deleted = false;
        st.discard = false;
        st.write_failed = false;
        st.disk_etag = None;
        st.disk_last_modified = None;
        Ok(())
    }

    /// Append content; only the writer may call this.
    pub fn write(&self, session: SessionId, data: &[u8]) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        if st.writer != Some(session) {
            return Err(CacheError::WriteLocked);
        }
        let res = match st.file.as_mut() {
            Some(file) => file.write_all(data).map_err(CacheError::from),
            None => self.blob.lock().append(data),
        };
        match res {
            Ok(()) => {
                st.written += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                warn!(target: "corriere::cache", url = %self.url, "cache write failed: {}", e);
                self.fail_write(&mut st);
                Err(e)
            }
        }
    }

    /// Release the write lock. On success an unknown length becomes the bytes written; a
    /// known length that does not match is a failed write.
    pub fn close_write(&self, session: SessionId, success: bool) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        if st.writer != Some(session) {
            return Ok(());
        }
        let mismatch = match st.content_length {
            Some(expected) if success && expected != st.written => Some(CacheError::LengthMismatch {
                expected,
                found: st.written,
            }),
            _ => None,
        };
        if success && mismatch.is_none() {
            return self.finish_write(&mut st);
        }
        self.fail_write(&mut st);
        match mismatch {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close_file(&self, st: &mut EntryState) {
        if let Some(mut file) = st.file.take() {
            if let Err(e) = file.flush() {
                warn!(target: "corriere::cache", url = %self.url, "flush failed: {}", e);
            }
        }
        st.writer = None;
    }

    /// Complete a successful write. If the metadata record cannot be updated the write
    /// counts as failed, so no process is left trusting a stale `in_write` marker.
    fn finish_write(&self, st: &mut EntryState) -> Result<(), CacheError> {
        self.close_file(st);
        if st.content_length.is_none() {
            st.content_length = Some(st.written);
        }
        st.done = true;
        st.disk_etag = st.server_etag.clone();
        st.disk_last_modified = st.server_last_modified.clone();
        st.created = unix_now();
        let snapshot = (
            st.server_etag.clone(),
            st.server_last_modified.clone(),
            st.mime_type.clone(),
            st.content_length,
            st.max_age,
            st.must_revalidate,
            st.no_store,
            st.created,
        );
        if let Err(e) = self.update_metadata(|m| {
            m.etag = snapshot.0.clone();
            m.last_modified = snapshot.1.clone();
            m.mime_type = snapshot.2.clone();
            m.content_length = snapshot.3;
            m.max_age = snapshot.4;
            m.must_revalidate = snapshot.5;
            m.no_cache = snapshot.6;
            m.created = snapshot.7;
            m.in_write = None;
        }) {
            warn!(target: "corriere::cache", url = %self.url, "failed to flush metadata, discarding entry: {}", e);
            self.fail_write(st);
            return Err(e);
        }
        info!(target: "corriere::cache", url = %self.url, bytes = st.written, "cache write complete");
        Ok(())
    }

    /// Give up the write: readers see the failure and the entry is discarded.
    fn fail_write(&self, st: &mut EntryState) {
        self.close_file(st);
        st.done = false;
        st.corrupted = true;
        st.discard = true;
        st.write_failed = true;
        if let Err(e) = self.update_metadata(|m| {
            m.in_write = None;
            m.content_length = None;
        }) {
            warn!(target: "corriere::cache", url = %self.url, "failed to flush metadata: {}", e);
        }
    }

    /// Read-modify-write of the metadata record under the entry lock. No-op for memory entries.
    fn update_metadata<F: FnOnce(&mut CacheMetadata)>(&self, f: F) -> Result<(), CacheError> {
        let paths = match &self.paths {
            Some(p) => p,
            None => return Ok(()),
        };
        let _lock = NamedLock::acquire(&paths.lock, self.pid, ENTRY_LOCK_SPIN)?;
        let mut meta = CacheMetadata::load(&paths.metadata)
            .ok()
            .flatten()
            .unwrap_or_else(|| CacheMetadata::new(&self.url, self.range, unix_now()));
        meta.prune_users(self.pid);
        f(&mut meta);
        meta.save(&paths.metadata)
    }

    /// Drop this process' usage marker; delete the files if they are to be discarded and
    /// nobody else uses them.
    fn release(&self, st: &mut EntryState) {
        let paths = match &self.paths {
            Some(p) => p,
            None => {
                if st.discard && !st.persistent {
                    self.blob.lock().clear();
                    st.deleted = true;
                }
                return;
            }
        };
        let lock = match NamedLock::acquire(&paths.lock, self.pid, ENTRY_LOCK_SPIN) {
            Ok(l) => l,
            Err(e) => {
                warn!(target: "corriere::cache", url = %self.url, "cannot release entry: {}", e);
                return;
            }
        };
        let mut meta = match CacheMetadata::load(&paths.metadata) {
            Ok(Some(m)) => m,
            _ => return,
        };
        meta.users.remove(&self.pid);
        let others = meta.prune_users(self.pid);
        let delete = st.discard || meta.to_delete;
        if delete && !others {
            debug!(target: "corriere::cache", url = %self.url, "deleting entry files");
            let _ = fs::remove_file(&paths.content);
            let _ = fs::remove_file(&paths.metadata);
            st.deleted = true;
            drop(lock);
            return;
        }
        if st.discard {
            meta.to_delete = true;
        }
        if let Err(e) = meta.save(&paths.metadata) {
            warn!(target: "corriere::cache", url = %self.url, "failed to save metadata: {}", e);
        }
    }

    /// Reader positioned at the start of the content.
    pub fn open_for_read(self: &Arc<Self>) -> Result<CacheReader, CacheError> {
        let st = self.state.lock();
        if st.deleted || (st.corrupted && st.writer.is_none()) {
            return Err(CacheError::Corrupted("entry not readable".into()));
        }
        let file = match &self.paths {
            Some(paths) => Some(File::open(&paths.content)?),
            None => {
                if self.blob.lock().is_invalidated() {
                    return Err(CacheError::Invalidated);
                }
                None
            }
        };
        Ok(CacheReader {
            entry: Arc::clone(self),
            file,
            offset: 0,
        })
    }

    /// Complete and valid.
    pub fn is_done(&self) -> bool {
        let mut st = self.state.lock();
        if st.in_progress_elsewhere {
            self.refresh_foreign(&mut st);
        }
        st.done && !st.corrupted
    }

    /// Pick up the result of another process' write.
    fn refresh_foreign(&self, st: &mut EntryState) {
        let paths = match &self.paths {
            Some(p) => p,
            None => return,
        };
        let _lock = match NamedLock::acquire(&paths.lock, self.pid, ENTRY_LOCK_SPIN) {
            Ok(l) => l,
            Err(_) => return,
        };
        if let Ok(Some(meta)) = CacheMetadata::load(&paths.metadata) {
            match meta.check(&self.url, self.range, &paths.content, self.pid) {
                Condition::InProgress(_) => {}
                Condition::Valid(size) => {
                    st.in_progress_elsewhere = false;
                    st.done = true;
                    st.written = size;
                    st.content_length = Some(size);
                    st.disk_etag = meta.etag.clone();
                    st.server_etag = meta.etag;
                    st.disk_last_modified = meta.last_modified.clone();
                    st.server_last_modified = meta.last_modified;
                    st.mime_type = meta.mime_type;
                    st.max_age = meta.max_age;
                    st.must_revalidate = meta.must_revalidate;
                    st.created = meta.created;
                }
                Condition::Corrupted(_) => {
                    st.in_progress_elsewhere = false;
                    st.corrupted = true;
                }
            }
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.state.lock().corrupted
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// A session of this process is writing.
    pub fn is_writing(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn writer(&self) -> Option<SessionId> {
        self.state.lock().writer
    }

    pub fn in_progress_elsewhere(&self) -> bool {
        self.state.lock().in_progress_elsewhere
    }

    /// Another live process uses the entry.
    pub fn is_shared(&self) -> bool {
        self.state.lock().shared
    }

    /// Freshness decision for an entry that is done.
    pub fn can_reuse(&self, policy: ReusePolicy) -> Reuse {
        let st = self.state.lock();
        if st.corrupted || st.deleted || !st.done {
            return Reuse::Refetch;
        }
        if let Some(ext) = self.external_state() {
            return ext;
        }
        let age = unix_now().saturating_sub(st.created);
        match st.max_age {
            Some(0) if st.must_revalidate => Reuse::Refetch,
            Some(0) => Reuse::Revalidate,
            Some(max_age) if age < max_age as i64 => Reuse::Direct,
            _ if st.must_revalidate => Reuse::Revalidate,
            _ if policy == ReusePolicy::AllowDirect => Reuse::Direct,
            _ => Reuse::Revalidate,
        }
    }

    fn external_state(&self) -> Option<Reuse> {
        if self.paths.is_some() {
            return None;
        }
        let blob = self.blob.lock();
        if blob.is_invalidated() {
            Some(Reuse::Refetch)
        } else if blob.is_external() {
            Some(Reuse::Direct)
        } else {
            None
        }
    }

    /// `(If-None-Match, If-Modified-Since)` values for revalidation.
    pub fn validators(&self) -> (Option<String>, Option<String>) {
        let st = self.state.lock();
        if !st.done || st.corrupted {
            return (None, None);
        }
        (st.disk_etag.clone(), st.disk_last_modified.clone())
    }

    /// Record validators and freshness from a reply.
    pub fn set_server_headers(
        &self,
        etag: Option<&str>,
        last_modified: Option<&str>,
        max_age: Option<u64>,
        must_revalidate: bool,
        no_store: bool,
    ) {
        let mut st = self.state.lock();
        st.server_etag = etag.map(str::to_string);
        st.server_last_modified = last_modified.map(str::to_string);
        st.max_age = max_age;
        st.must_revalidate = must_revalidate;
        st.no_store = no_store;
        if no_store {
            st.discard = true;
        }
    }

    pub fn set_mime_type(&self, mime: Option<&str>) {
        self.state.lock().mime_type = mime.map(str::to_string);
    }

    pub fn mime_type(&self) -> Option<String> {
        self.state.lock().mime_type.clone()
    }

    pub fn set_content_length(&self, len: Option<u64>) {
        self.state.lock().content_length = len;
    }

    pub fn content_length(&self) -> Option<u64> {
        self.state.lock().content_length
    }

    /// Valid-byte watermark.
    pub fn written(&self) -> u64 {
        self.state.lock().written
    }

    /// A 304 confirmed the stored content: restart the freshness clock.
    pub fn revalidated(&self, max_age: Option<u64>, must_revalidate: bool) {
        let mut st = self.state.lock();
        st.created = unix_now();
        if max_age.is_some() {
            st.max_age = max_age;
        }
        st.must_revalidate = must_revalidate;
        let (created, max_age) = (st.created, st.max_age);
        if let Err(e) = self.update_metadata(|m| {
            m.created = created;
            m.max_age = max_age;
            m.must_revalidate = must_revalidate;
        }) {
            warn!(target: "corriere::cache", url = %self.url, "failed to refresh metadata: {}", e);
        }
    }

    /// Delete the content once no session (or process) uses it.
    pub fn mark_discard(&self) {
        self.state.lock().discard = true;
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.state.lock().persistent = persistent;
    }

    pub fn is_persistent(&self) -> bool {
        self.state.lock().persistent
    }

    /// Serve externally owned content; memory entries only.
    pub fn set_external(&self, content: Bytes) -> Result<(), CacheError> {
        if self.paths.is_some() {
            return Err(CacheError::Metadata("external content needs a memory entry".into()));
        }
        let mut st = self.state.lock();
        if st.writer.is_some() {
            return Err(CacheError::WriteLocked);
        }
        let len = content.len() as u64;
        self.blob.lock().set_external(content);
        st.written = len;
        st.content_length = Some(len);
        st.done = true;
        st.corrupted = false;
        st.created = unix_now();
        Ok(())
    }

    /// The collaborator withdrew external content; readers fail from now on.
    pub fn invalidate_external(&self) {
        let mut st = self.state.lock();
        self.blob.lock().invalidate();
        st.done = false;
        st.corrupted = true;
    }

    fn read_chunk(&self, file: Option<&mut File>, offset: u64, buf: &mut [u8]) -> Result<ReadStatus, CacheError> {
        let st = self.state.lock();
        if st.write_failed && st.writer.is_none() && !st.done {
            return Ok(ReadStatus::WriterFailed);
        }
        if offset < st.written {
            let limit = st.written;
            let want = ((limit - offset) as usize).min(buf.len());
            let n = match file {
                Some(f) => {
                    drop(st);
                    f.read(&mut buf[..want])?
                }
                None => self.blob.lock().read_at(offset, limit, &mut buf[..want])?,
            };
            return Ok(if n == 0 {
                ReadStatus::Pending
            } else {
                ReadStatus::Data(n)
            });
        }
        if st.done {
            Ok(ReadStatus::Eof)
        } else if st.writer.is_some() || st.in_progress_elsewhere {
            Ok(ReadStatus::Pending)
        } else {
            Ok(ReadStatus::WriterFailed)
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Data(usize),
    /// At the watermark of an in-progress write.
    Pending,
    Eof,
    /// The writer gave up; the content is incomplete.
    WriterFailed,
}

/// Sequential reader that never passes the entry's watermark.
#[derive(Debug)]
pub struct CacheReader {
    entry: Arc<CacheEntry>,
    file: Option<File>,
    offset: u64,
}

impl CacheReader {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, CacheError> {
        let status = self.entry.read_chunk(self.file.as_mut(), self.offset, buf)?;
        if let ReadStatus::Data(n) = status {
            self.offset += n as u64;
        }
        Ok(status)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut CacheReader) -> (Vec<u8>, ReadStatus) {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match reader.read(&mut buf).unwrap() {
                ReadStatus::Data(n) => out.extend_from_slice(&buf[..n]),
                other => return (out, other),
            }
        }
    }

    #[test]
    fn extension_rules() {
        assert_eq!(url_extension("http://h/a/seg1.m4s?x=.verylong"), ".m4s");
        assert_eq!(url_extension("http://h/a/index.html"), ".dat");
        assert_eq!(url_extension("http://h/a/noext"), ".dat");
        assert_eq!(url_extension("http://h"), ".dat");
        assert_eq!(url_extension("http://h/x.JSON"), ".json");
    }

    #[test]
    fn range_changes_the_key() {
        let a = cache_key("http://h/a", None);
        let b = cache_key("http://h/a", Some(ByteRange::new(0, Some(99))));
        assert_ne!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn single_writer() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        e.attach(1);
        e.attach(2);
        e.open_for_write(1).unwrap();
        assert!(matches!(e.open_for_write(2), Err(CacheError::WriteLocked)));
        assert!(matches!(e.write(2, b"x"), Err(CacheError::WriteLocked)));
        e.close_write(1, true).unwrap();
        e.open_for_write(2).unwrap();
    }

    #[test]
    fn progressive_reader_stops_at_watermark() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        e.attach(1);
        e.attach(2);
        e.open_for_write(1).unwrap();
        e.write(1, b"hello").unwrap();
        let mut r = e.open_for_read().unwrap();
        let (got, status) = read_all(&mut r);
        assert_eq!(got, b"hello");
        assert_eq!(status, ReadStatus::Pending);
        e.write(1, b" world").unwrap();
        e.close_write(1, true).unwrap();
        let (got, status) = read_all(&mut r);
        assert_eq!(got, b" world");
        assert_eq!(status, ReadStatus::Eof);
        assert_eq!(e.content_length(), Some(11));
    }

    #[test]
    fn failed_writer_is_seen_by_readers() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        e.attach(1);
        e.open_for_write(1).unwrap();
        e.write(1, b"par").unwrap();
        let mut r = e.open_for_read().unwrap();
        let _ = read_all(&mut r);
        e.close_write(1, false).unwrap();
        assert_eq!(r.read(&mut [0u8; 4]).unwrap(), ReadStatus::WriterFailed);
        assert!(e.is_corrupted());
    }

    #[test]
    fn length_mismatch_fails_the_write() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        e.attach(1);
        e.set_content_length(Some(10));
        e.open_for_write(1).unwrap();
        e.write(1, b"short").unwrap();
        assert!(matches!(
            e.close_write(1, true),
            Err(CacheError::LengthMismatch { expected: 10, found: 5 })
        ));
        assert!(!e.is_done());
    }

    #[test]
    fn detaching_writer_releases_the_lock() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        assert_eq!(e.attach(1), 1);
        assert_eq!(e.attach(2), 2);
        e.open_for_write(1).unwrap();
        assert_eq!(e.detach(1), 1);
        assert_eq!(e.writer(), None);
        e.open_for_write(2).unwrap();
    }

    #[test]
    fn reuse_decisions() {
        let e = CacheEntry::in_memory("http://h/a", None, 1);
        e.attach(1);
        assert_eq!(e.can_reuse(ReusePolicy::AllowDirect), Reuse::Refetch);
        e.set_server_headers(Some("\"e\""), None, Some(60), false, false);
        e.open_for_write(1).unwrap();
        e.write(1, b"x").unwrap();
        e.close_write(1, true).unwrap();
        assert_eq!(e.can_reuse(ReusePolicy::Revalidate), Reuse::Direct);
        e.set_server_headers(Some("\"e\""), None, Some(0), false, false);
        assert_eq!(e.can_reuse(ReusePolicy::AllowDirect), Reuse::Revalidate);
        e.set_server_headers(Some("\"e\""), None, None, false, false);
        assert_eq!(e.can_reuse(ReusePolicy::AllowDirect), Reuse::Direct);
        assert_eq!(e.can_reuse(ReusePolicy::Revalidate), Reuse::Revalidate);
        e.set_server_headers(Some("\"e\""), None, None, true, false);
        assert_eq!(e.can_reuse(ReusePolicy::AllowDirect), Reuse::Revalidate);
        e.set_server_headers(Some("\"e\""), None, Some(0), true, false);
        assert_eq!(e.can_reuse(ReusePolicy::AllowDirect), Reuse::Refetch);
        assert_eq!(e.validators(), (Some("\"e\"".to_string()), None));
    }

    #[test]
    fn disk_entry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let e = CacheEntry::open_disk(dir.path(), "http://h/v.mp4", None, pid).unwrap();
        e.attach(7);
        e.set_server_headers(Some("\"v1\""), None, Some(3600), false, false);
        e.open_for_write(7).unwrap();
        e.write(7, b"0123456789").unwrap();
        e.close_write(7, true).unwrap();
        assert_eq!(e.detach(7), 0);
        drop(e);

        let again = CacheEntry::open_disk(dir.path(), "http://h/v.mp4", None, pid).unwrap();
        assert!(again.is_done());
        assert_eq!(again.content_length(), Some(10));
        assert_eq!(again.can_reuse(ReusePolicy::Revalidate), Reuse::Direct);
        let meta = CacheMetadata::load(&again.paths().unwrap().metadata).unwrap().unwrap();
        assert_eq!(meta.num_hits, 2);
        let mut r = again.open_for_read().unwrap();
        let (got, status) = read_all(&mut r);
        assert_eq!(got, b"0123456789");
        assert_eq!(status, ReadStatus::Eof);
    }

    #[test]
    fn unwritable_metadata_fails_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let e = CacheEntry::open_disk(dir.path(), "http://h/m.bin", None, pid).unwrap();
        e.attach(3);
        e.open_for_write(3).unwrap();
        e.write(3, b"payload").unwrap();
        let mut r = e.open_for_read().unwrap();
        let _ = read_all(&mut r);
        let paths = e.paths().unwrap().clone();
        fs::remove_file(&paths.metadata).unwrap();
        fs::create_dir(&paths.metadata).unwrap();

        assert!(e.close_write(3, true).is_err());
        assert_eq!(e.writer(), None);
        assert!(!e.is_done());
        assert!(e.is_corrupted());
        assert_eq!(r.read(&mut [0u8; 4]).unwrap(), ReadStatus::WriterFailed);
    }

    #[test]
    fn corrupted_disk_entry_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let paths = EntryPaths::new(dir.path(), "http://h/c.bin", None);
        fs::write(&paths.content, b"abc").unwrap();
        let mut meta = CacheMetadata::new("http://h/c.bin", None, 1);
        meta.content_length = Some(99);
        meta.save(&paths.metadata).unwrap();
        let e = CacheEntry::open_disk(dir.path(), "http://h/c.bin", None, pid).unwrap();
        assert!(!e.is_done());
        assert!(!paths.content.exists());
    }

    #[test]
    fn discarded_disk_entry_is_deleted_on_last_detach() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        let e = CacheEntry::open_disk(dir.path(), "http://h/d.ts", None, pid).unwrap();
        e.attach(1);
        e.open_for_write(1).unwrap();
        e.write(1, b"partial").unwrap();
        let paths = e.paths().unwrap().clone();
        assert_eq!(e.detach(1), 0);
        assert!(!paths.content.exists());
        assert!(!paths.metadata.exists());
        assert!(e.is_deleted());
    }
}
