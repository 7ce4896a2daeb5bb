/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pinning backend and address-space monitoring seams.
//!
//! The cache never talks to hardware directly: it pins page runs through
//! `PinningBackend` and learns about unmapped address ranges from an
//! `InvalidationQueue` fed by whoever watches the address space. Invalidation
//! arrives as a queued message and is drained by the cache at its own entry
//! points, so no notifier ever runs cache code under a foreign lock.

use std::sync::mpsc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::PinError;
use crate::tid_pairs::TidWord;

/// What kind of memory a buffer lives in; selects the pinning granularity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    System,
    Device,
}

/// A half-open byte range `[start, start + len)` of virtual address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddrRange {
    pub start: u64,
    pub len: u64,
}

impl AddrRange {
    pub fn new(start: u64, len: u64) -> Self {
        AddrRange { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Rounds outward to `page_size` alignment on both edges.
    pub fn round_to(&self, page_size: u64) -> AddrRange {
        let start = self.start & !(page_size - 1);
        let end = (self.end() + page_size - 1) & !(page_size - 1);
        AddrRange {
            start,
            len: end - start,
        }
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn contains(&self, other: &AddrRange) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }
}

impl std::fmt::Display for AddrRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, +{})", self.start, self.len)
    }
}

/// Outcome of a pin request. The backend may pin fewer bytes than asked;
/// `pinned_len` is the contiguous prefix actually covered by `words`.
#[derive(Debug, Clone)]
pub struct PinGrant {
    pub pinned_len: u64,
    pub words: Vec<TidWord>,
}

/// Pins and unpins page runs, producing hardware descriptor words.
///
/// Implementations are shared across the cache and the driver, so all
/// methods take `&self`.
pub trait PinningBackend: Send + Sync {
    /// Pins `[addr, addr + len)`. Partial success is not an error: the grant
    /// records how much of the prefix was pinned.
    fn pin(&self, addr: u64, len: u64, kind: MemoryKind) -> Result<PinGrant, PinError>;

    /// Releases the descriptor words of a previous grant. Never fails;
    /// backends log and swallow teardown anomalies.
    fn unpin(&self, words: &[TidWord]);

    /// Largest length a single `pin` call can cover.
    fn max_pinnable_len(&self, kind: MemoryKind) -> u64;
}

/// Receives ranges the address-space monitor declared gone.
pub struct InvalidationQueue {
    rx: mpsc::Receiver<AddrRange>,
}

impl InvalidationQueue {
    /// Drains everything queued so far without blocking.
    pub fn drain(&self) -> Vec<AddrRange> {
        let mut out = Vec::new();
        while let Ok(range) = self.rx.try_recv() {
            out.push(range);
        }
        out
    }
}

/// Handle given to the address-space monitor; cloneable and thread-safe.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<AddrRange>,
}

impl MonitorHandle {
    /// Reports that `range` was unmapped or remapped. Delivery is
    /// best-effort; a dropped cache just discards the message.
    pub fn invalidate(&self, range: AddrRange) {
        let _ = self.tx.send(range);
    }
}

/// Builds the monitor-to-cache invalidation channel.
pub fn invalidation_channel() -> (MonitorHandle, InvalidationQueue) {
    let (tx, rx) = mpsc::channel();
    (MonitorHandle { tx }, InvalidationQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_rounding() {
        let r = AddrRange::new(0x1234, 100).round_to(4096);
        assert_eq!(r.start, 0x1000);
        assert_eq!(r.end(), 0x2000);

        // Already aligned ranges are unchanged.
        let r = AddrRange::new(0x2000, 8192).round_to(4096);
        assert_eq!(r, AddrRange::new(0x2000, 8192));
    }

    #[test]
    fn test_range_overlap() {
        let a = AddrRange::new(0x1000, 0x1000);
        let b = AddrRange::new(0x1800, 0x1000);
        let c = AddrRange::new(0x2000, 0x1000);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(AddrRange::new(0x1000, 0x3000).contains(&b));
    }

    #[test]
    fn test_invalidation_channel_drains_in_order() {
        let (handle, queue) = invalidation_channel();
        handle.invalidate(AddrRange::new(0x1000, 4096));
        handle.invalidate(AddrRange::new(0x5000, 4096));
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].start, 0x1000);
        assert!(queue.drain().is_empty());
    }
}
