// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batching of parsed RPSL objects for chunked repository writes.
//!
//! Snapshot ingestion parses objects on a worker pool and persists them in
//! fixed-size chunks to amortize the round-trip to the store. The
//! [`ObjectBatcher`] collects parsed objects and releases a chunk whenever
//! at least `chunk_size` are buffered; the remainder is drained once the
//! stream ends.
//!
//! # Example
//!
//! ```
//! use nrtm_mirror::batch::ObjectBatcher;
//! use nrtm_mirror::rpsl;
//!
//! let mut batcher = ObjectBatcher::new(2);
//! batcher.push(rpsl::parse("route: 192.0.2.0/24\n").unwrap());
//! assert!(batcher.take_chunk().is_none());
//!
//! batcher.push(rpsl::parse("route: 198.51.100.0/24\n").unwrap());
//! assert_eq!(batcher.take_chunk().unwrap().len(), 2);
//! ```

use crate::rpsl::RpslObject;

/// Collects parsed objects and hands them out in `chunk_size` chunks.
///
/// Not internally synchronized: pipelines guard it with an async mutex,
/// with parser workers appending and a single drainer removing chunks.
pub struct ObjectBatcher {
    chunk_size: usize,
    objects: Vec<RpslObject>,
}

impl ObjectBatcher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            objects: Vec::with_capacity(chunk_size.saturating_mul(2)),
        }
    }

    pub fn push(&mut self, object: RpslObject) {
        self.objects.push(object);
    }

    /// Remove and return exactly one chunk, but only if a full chunk is
    /// available.
    pub fn take_chunk(&mut self) -> Option<Vec<RpslObject>> {
        if self.objects.len() < self.chunk_size {
            return None;
        }
        let rest = self.objects.split_off(self.chunk_size);
        Some(std::mem::replace(&mut self.objects, rest))
    }

    /// Remove and return everything that is buffered.
    pub fn drain_all(&mut self) -> Vec<RpslObject> {
        std::mem::take(&mut self.objects)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
