/*
 * memory.rs
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

//! In-memory content storage for cache entries.

use bytes::Bytes;

use super::CacheError;

/// Smallest initial allocation for a memory entry.
pub const MIN_MEMORY_CAPACITY: usize = 81920;

/// Growable content blob, or a reference to content owned by a collaborator.
#[derive(Debug, Default)]
pub struct MemoryBlob {
    data: Vec<u8>,
    external: Option<Bytes>,
    invalidated: bool,
}

impl MemoryBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new write, sized for the announced length.
    pub fn reset(&mut self, content_length: Option<u64>) -> Result<(), CacheError> {
        self.data = Vec::new();
        self.external = None;
        self.invalidated = false;
        let want = content_length
            .map(|l| (l as usize).max(MIN_MEMORY_CAPACITY))
            .unwrap_or(MIN_MEMORY_CAPACITY);
        self.data
            .try_reserve_exact(want)
            .map_err(|_| CacheError::OutOfMemory)
    }

    /// Append, doubling the allocation when full.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        if self.external.is_some() {
            return Err(CacheError::WriteLocked);
        }
        let needed = self.data.len() + chunk.len();
        if needed > self.data.capacity() {
            let mut cap = self.data.capacity().max(MIN_MEMORY_CAPACITY);
            while cap < needed {
                cap *= 2;
            }
            self.data
                .try_reserve_exact(cap - self.data.len())
                .map_err(|_| CacheError::OutOfMemory)?;
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        match &self.external {
            Some(b) => b.len(),
            None => self.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Copy from `offset` into `buf`, never past `limit`.
    pub fn read_at(&self, offset: u64, limit: u64, buf: &mut [u8]) -> Result<usize, CacheError> {
        if self.invalidated {
            return Err(CacheError::Invalidated);
        }
        let src: &[u8] = match &self.external {
            Some(b) => b,
            None => &self.data,
        };
        let end = (limit as usize).min(src.len());
        let start = offset as usize;
        if start >= end {
            return Ok(0);
        }
        let n = (end - start).min(buf.len());
        buf[..n].copy_from_slice(&src[start..start + n]);
        Ok(n)
    }

    /// Reference external content instead of copying it.
    pub fn set_external(&mut self, content: Bytes) {
        self.data = Vec::new();
        self.external = Some(content);
        self.invalidated = false;
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// The collaborator withdrew its content.
    pub fn invalidate(&mut self) {
        self.external = None;
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.external = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_capacity_has_a_floor() {
        let mut b = MemoryBlob::new();
        b.reset(Some(10)).unwrap();
        assert!(b.capacity() >= MIN_MEMORY_CAPACITY);
        b.reset(Some(200_000)).unwrap();
        assert!(b.capacity() >= 200_000);
    }

    #[test]
    fn growth_doubles() {
        let mut b = MemoryBlob::new();
        b.reset(None).unwrap();
        let cap = b.capacity();
        b.append(&vec![1u8; cap + 1]).unwrap();
        assert!(b.capacity() >= cap * 2);
        assert_eq!(b.len(), cap + 1);
    }

    #[test]
    fn reads_stop_at_limit() {
        let mut b = MemoryBlob::new();
        b.reset(None).unwrap();
        b.append(b"abcdef").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(b.read_at(2, 4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"cd");
        assert_eq!(b.read_at(4, 4, &mut buf).unwrap(), 0);
    }

    #[test]
    fn external_content_and_invalidation() {
        let mut b = MemoryBlob::new();
        b.set_external(Bytes::from_static(b"xyz"));
        assert!(b.is_external());
        let mut buf = [0u8; 3];
        assert_eq!(b.read_at(0, 3, &mut buf).unwrap(), 3);
        assert!(b.append(b"more").is_err());
        b.invalidate();
        assert!(matches!(b.read_at(0, 3, &mut buf), Err(CacheError::Invalidated)));
    }
}
