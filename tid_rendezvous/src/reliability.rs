/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Packet sequence numbers and replay buffers.
//!
//! PSNs live in a 24-bit space with a bounded in-flight window. A batch of
//! sequence numbers is reserved whole or not at all, and a batch never
//! crosses a 2048-sequence generation boundary; callers clamp with
//! [`PsnWindow::clamp_to_generation`] before reserving. Every data packet
//! pairs with a replay buffer from a fixed pool so it can be retransmitted
//! until acknowledged.

use std::collections::HashMap;

const PSN_MASK: u32 = 0xffffff;
const GENERATION_SIZE: u32 = 0x800;

/// A contiguous run of reserved sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsnReservation {
    pub start_psn: u32,
    pub count: u32,
}

/// Per-flow sequence number allocator.
#[derive(Debug)]
pub struct PsnWindow {
    next_psn: u32,
    inflight: u32,
    window: u32,
}

impl PsnWindow {
    pub fn new(initial_psn: u32, window: u32) -> Self {
        PsnWindow {
            next_psn: initial_psn & PSN_MASK,
            inflight: 0,
            window,
        }
    }

    pub fn next_psn(&self) -> u32 {
        self.next_psn
    }

    pub fn available(&self) -> u32 {
        self.window - self.inflight
    }

    pub fn in_flight(&self) -> u32 {
        self.inflight
    }

    /// Truncates `count` so the batch stays inside the current 2048-psn
    /// generation.
    pub fn clamp_to_generation(&self, count: u32) -> u32 {
        count.min(GENERATION_SIZE - (self.next_psn & (GENERATION_SIZE - 1)))
    }

    /// Reserves `count` consecutive sequence numbers, whole or not at all.
    pub fn reserve(&mut self, count: u32) -> Option<PsnReservation> {
        if count == 0 || self.available() < count {
            return None;
        }
        debug_assert!(count <= self.clamp_to_generation(count));
        let start_psn = self.next_psn;
        self.next_psn = (self.next_psn + count) & PSN_MASK;
        self.inflight += count;
        Some(PsnReservation { start_psn, count })
    }

    /// Gives back the unused tail of the most recent reservation, before
    /// any newer reservation was taken.
    pub fn cancel_tail(&mut self, reservation: &mut PsnReservation, count: u32) {
        debug_assert!(count <= reservation.count);
        reservation.count -= count;
        self.next_psn = self.next_psn.wrapping_sub(count) & PSN_MASK;
        self.inflight = self.inflight.saturating_sub(count);
    }

    /// Retires `count` acknowledged sequence numbers.
    pub fn complete(&mut self, count: u32) {
        debug_assert!(self.inflight >= count);
        self.inflight = self.inflight.saturating_sub(count);
    }
}

/// One retransmission buffer, paired with a PSN once registered.
#[derive(Debug)]
pub struct ReplayBuffer {
    pub payload: Vec<u8>,
}

impl ReplayBuffer {
    fn reset(&mut self) {
        self.payload.clear();
    }
}

/// Fixed pool of replay buffers; exhaustion is a retryable condition.
#[derive(Debug)]
pub struct ReplayPool {
    free: Vec<ReplayBuffer>,
    registered: HashMap<u32, ReplayBuffer>,
}

impl ReplayPool {
    pub fn new(capacity: usize, payload_capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| ReplayBuffer {
                payload: Vec::with_capacity(payload_capacity),
            })
            .collect();
        ReplayPool {
            free,
            registered: HashMap::with_capacity(capacity),
        }
    }

    pub fn allocate(&mut self) -> Option<ReplayBuffer> {
        self.free.pop()
    }

    /// Returns an unregistered buffer to the pool.
    pub fn cancel(&mut self, mut replay: ReplayBuffer) {
        replay.reset();
        self.free.push(replay);
    }

    /// Records `replay` as the retransmission source for `psn`.
    pub fn register(&mut self, psn: u32, replay: ReplayBuffer) {
        debug_assert!(!self.registered.contains_key(&(psn & PSN_MASK)));
        self.registered.insert(psn & PSN_MASK, replay);
    }

    /// Looks up the retransmission source for `psn`.
    pub fn replay_for(&self, psn: u32) -> Option<&ReplayBuffer> {
        self.registered.get(&(psn & PSN_MASK))
    }

    /// Acknowledges one PSN, recycling its buffer. Returns whether a
    /// registration existed.
    pub fn release(&mut self, psn: u32) -> bool {
        match self.registered.remove(&(psn & PSN_MASK)) {
            Some(mut replay) => {
                replay.reset();
                self.free.push(replay);
                true
            }
            None => false,
        }
    }

    /// Acknowledges a contiguous PSN run.
    pub fn release_batch(&mut self, start_psn: u32, count: u32) -> u32 {
        let mut released = 0;
        for i in 0..count {
            if self.release((start_psn + i) & PSN_MASK) {
                released += 1;
            }
        }
        released
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_all_or_none() {
        let mut window = PsnWindow::new(0x100, 8);
        let r = window.reserve(8).unwrap();
        assert_eq!(r, PsnReservation { start_psn: 0x100, count: 8 });
        assert_eq!(window.available(), 0);
        // Nothing left: even a single psn is refused.
        assert!(window.reserve(1).is_none());
        window.complete(8);
        assert_eq!(window.available(), 8);
    }

    #[test]
    fn test_generation_clamp() {
        let mut window = PsnWindow::new(0x7fe, 64);
        // Two sequences left in this generation.
        assert_eq!(window.clamp_to_generation(32), 2);
        let r = window.reserve(2).unwrap();
        assert_eq!(r.start_psn, 0x7fe);
        // Fresh generation: full batches again.
        assert_eq!(window.next_psn(), 0x800);
        assert_eq!(window.clamp_to_generation(32), 32);
    }

    #[test]
    fn test_psn_space_wraps_at_24_bits() {
        let mut window = PsnWindow::new(0xffffff, 16);
        let r = window.reserve(1).unwrap();
        assert_eq!(r.start_psn, 0xffffff);
        assert_eq!(window.next_psn(), 0);
    }

    #[test]
    fn test_cancel_tail_rewinds() {
        let mut window = PsnWindow::new(0x10, 32);
        let mut r = window.reserve(8).unwrap();
        window.cancel_tail(&mut r, 3);
        assert_eq!(r.count, 5);
        assert_eq!(window.next_psn(), 0x15);
        assert_eq!(window.in_flight(), 5);
    }

    #[test]
    fn test_replay_pool_exhaustion_and_release() {
        let mut pool = ReplayPool::new(2, 64);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        pool.register(10, a);
        pool.register(11, b);
        assert!(pool.replay_for(10).is_some());
        assert_eq!(pool.release_batch(10, 2), 2);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.registered_count(), 0);
        assert!(!pool.release(10));
    }
}
