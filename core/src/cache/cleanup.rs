/*
 * cleanup.rs
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

//! Disk cache eviction.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::entry::EntryPaths;
use super::lock::NamedLock;
use super::metadata::CacheMetadata;
use super::CacheError;

const DIR_LOCK_NAME: &str = ".lock";
const DIR_LOCK_SPIN: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Candidate {
    metadata: PathBuf,
    content: PathBuf,
    size: u64,
    hits: u32,
    last_hit: i64,
    created: i64,
}

/// Every metadata record in `dir`, with the total size of all content.
fn gather(dir: &Path) -> Result<(Vec<Candidate>, u64), CacheError> {
    let mut candidates = Vec::new();
    let mut total = 0u64;
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !name.starts_with("cache_") || !name.ends_with(".json") {
            continue;
        }
        let mut meta = match CacheMetadata::load(&path) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                debug!(target: "corriere::cache", file = %path.display(), "skipping record: {}", e);
                continue;
            }
        };
        let content = EntryPaths::new(dir, &meta.url, meta.range).content;
        let size = meta
            .content_length
            .or_else(|| fs::metadata(&content).ok().map(|m| m.len()))
            .unwrap_or(0);
        total += size;
        // 0 is never a live pid: every remaining user counts.
        if meta.prune_users(0) {
            continue;
        }
        candidates.push(Candidate {
            metadata: path,
            content,
            size,
            hits: meta.num_hits.saturating_sub(1),
            last_hit: meta.last_hit,
            created: meta.created,
        });
    }
    candidates.sort_by_key(|c| (c.hits, c.last_hit, c.created, c.size));
    Ok((candidates, total))
}

fn remove(c: &Candidate) {
    if let Err(e) = fs::remove_file(&c.content) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "corriere::cache", file = %c.content.display(), "failed to delete: {}", e);
        }
    }
    let _ = fs::remove_file(&c.metadata);
}

/// Delete unused entries, least hit and least recently hit first, until the total content
/// size fits `max_size`. Returns the resulting total. Another process already cleaning is
/// not an error; the current total is returned unchanged.
pub fn evict(dir: &Path, max_size: u64, pid: u32) -> Result<u64, CacheError> {
    let _lock = match NamedLock::acquire(&dir.join(DIR_LOCK_NAME), pid, DIR_LOCK_SPIN) {
        Ok(l) => l,
        Err(CacheError::LockTimeout(_)) => return Ok(max_size),
        Err(e) => return Err(e),
    };
    let (candidates, mut total) = gather(dir)?;
    let mut evicted = 0usize;
    for c in &candidates {
        if total <= max_size {
            break;
        }
        remove(c);
        total = total.saturating_sub(c.size);
        evicted += 1;
    }
    if evicted > 0 {
        info!(target: "corriere::cache", evicted, total, max_size, "cache cleanup");
    }
    Ok(total)
}

/// Delete every entry no live process uses. Returns the number removed.
pub fn remove_unused(dir: &Path, pid: u32) -> Result<usize, CacheError> {
    let _lock = NamedLock::acquire(&dir.join(DIR_LOCK_NAME), pid, DIR_LOCK_SPIN)?;
    let (candidates, _) = gather(dir)?;
    for c in &candidates {
        remove(c);
    }
    Ok(candidates.len())
}
