/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! SDMA work entries: bounded packet batches with explicit lifecycle.
//!
//! A work entry moves Free -> PendingSubmit (packets added) -> Queued
//! (slot assigned) -> Complete or Error, and is recycled to the pool only
//! once any replay buffer still pointing into its bounce buffer has been
//! retired.

use std::collections::VecDeque;

use tracing::debug;

use crate::device::DescriptorBatch;
use crate::device::PacketDescriptor;
use crate::reliability::PsnReservation;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkEntryState {
    Free,
    PendingSubmit,
    Queued,
    Complete,
    Error,
}

#[derive(Debug)]
pub struct WorkEntry {
    state: WorkEntryState,
    pub batch: DescriptorBatch,
    pub reservation: Option<PsnReservation>,
    /// Staging copy of the payload when the source may mutate before the
    /// DMA drains.
    pub bounce_buf: Vec<u8>,
    pub use_bounce_buf: bool,
    /// A replay buffer still references the bounce buffer contents.
    pub bounce_busy: bool,
    pub slot: Option<usize>,
    pub error_code: Option<u32>,
    max_packets: u32,
}

impl WorkEntry {
    fn new(max_packets: u32, bounce_capacity: usize) -> Self {
        WorkEntry {
            state: WorkEntryState::Free,
            batch: DescriptorBatch::default(),
            reservation: None,
            bounce_buf: Vec::with_capacity(bounce_capacity),
            use_bounce_buf: false,
            bounce_busy: false,
            slot: None,
            error_code: None,
            max_packets,
        }
    }

    pub fn state(&self) -> WorkEntryState {
        self.state
    }

    pub fn packet_count(&self) -> usize {
        self.batch.packets.len()
    }

    pub fn has_room(&self) -> bool {
        self.batch.packets.len() < self.max_packets as usize
    }

    pub fn payload_bytes(&self) -> u64 {
        self.batch.payload_bytes()
    }

    pub fn add_packet(&mut self, packet: PacketDescriptor) {
        debug_assert!(self.has_room());
        debug_assert!(matches!(
            self.state,
            WorkEntryState::Free | WorkEntryState::PendingSubmit
        ));
        self.state = WorkEntryState::PendingSubmit;
        self.batch.packets.push(packet);
    }

    pub fn mark_queued(&mut self, slot: usize) {
        debug_assert_eq!(self.state, WorkEntryState::PendingSubmit);
        self.state = WorkEntryState::Queued;
        self.slot = Some(slot);
    }

    pub fn mark_complete(&mut self) {
        debug_assert_eq!(self.state, WorkEntryState::Queued);
        self.state = WorkEntryState::Complete;
    }

    pub fn mark_error(&mut self, code: u32) {
        debug_assert_eq!(self.state, WorkEntryState::Queued);
        self.state = WorkEntryState::Error;
        self.error_code = Some(code);
    }

    /// Whether the entry has fully drained and can go back to the pool.
    pub fn ready_to_recycle(&self) -> bool {
        matches!(
            self.state,
            WorkEntryState::Complete | WorkEntryState::Error
        ) && !self.bounce_busy
    }

    fn reset(&mut self) {
        self.state = WorkEntryState::Free;
        self.batch.packets.clear();
        self.reservation = None;
        self.bounce_buf.clear();
        self.use_bounce_buf = false;
        self.bounce_busy = false;
        self.slot = None;
        self.error_code = None;
    }
}

/// Fixed pool of work entries shared by all transfers on an endpoint.
#[derive(Debug)]
pub struct WorkEntryPool {
    free: Vec<WorkEntry>,
}

impl WorkEntryPool {
    pub fn new(capacity: usize, max_packets: u32, bounce_capacity: usize) -> Self {
        WorkEntryPool {
            free: (0..capacity)
                .map(|_| WorkEntry::new(max_packets, bounce_capacity))
                .collect(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Next work entry for a transfer: prefer recycling the transfer's
    /// oldest drained entry, then the pool, bounded by the per-transfer
    /// cap. `None` is a retryable shortage.
    pub fn next_for_transfer(
        &mut self,
        queued: &mut VecDeque<WorkEntry>,
        max_per_transfer: usize,
    ) -> Option<WorkEntry> {
        if let Some(front) = queued.front() {
            if front.ready_to_recycle() {
                let mut entry = queued.pop_front()?;
                debug!(slot = ?entry.slot, "recycling drained work entry in place");
                entry.reset();
                return Some(entry);
            }
        }
        if queued.len() < max_per_transfer {
            return self.free.pop();
        }
        None
    }

    pub fn recycle(&mut self, mut entry: WorkEntry) {
        debug_assert!(entry.state == WorkEntryState::Free || entry.ready_to_recycle());
        entry.reset();
        self.free.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(psn: u32, bytes: u32) -> PacketDescriptor {
        PacketDescriptor {
            psn,
            dst_addr: 0,
            bytes,
            tid: None,
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut pool = WorkEntryPool::new(1, 4, 1024);
        let mut queued = VecDeque::new();
        let mut entry = pool.next_for_transfer(&mut queued, 8).unwrap();
        assert_eq!(entry.state(), WorkEntryState::Free);

        entry.add_packet(packet(1, 512));
        entry.add_packet(packet(2, 512));
        assert_eq!(entry.state(), WorkEntryState::PendingSubmit);
        assert_eq!(entry.payload_bytes(), 1024);

        entry.mark_queued(3);
        assert!(!entry.ready_to_recycle());
        entry.mark_complete();
        assert!(entry.ready_to_recycle());
        pool.recycle(entry);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_bounce_dependency_blocks_recycle() {
        let mut pool = WorkEntryPool::new(1, 4, 1024);
        let mut queued = VecDeque::new();
        let mut entry = pool.next_for_transfer(&mut queued, 8).unwrap();
        entry.add_packet(packet(1, 64));
        entry.mark_queued(0);
        entry.bounce_busy = true;
        entry.mark_complete();
        assert!(!entry.ready_to_recycle());
        entry.bounce_busy = false;
        assert!(entry.ready_to_recycle());
    }

    #[test]
    fn test_recycle_prefers_transfer_queue() {
        let mut pool = WorkEntryPool::new(2, 4, 0);
        let mut queued: VecDeque<WorkEntry> = VecDeque::new();

        let mut first = pool.next_for_transfer(&mut queued, 2).unwrap();
        first.add_packet(packet(1, 64));
        first.mark_queued(0);
        first.mark_complete();
        queued.push_back(first);

        // The drained front entry is reused before the pool shrinks.
        let entry = pool.next_for_transfer(&mut queued, 2).unwrap();
        assert_eq!(entry.state(), WorkEntryState::Free);
        assert_eq!(pool.free_count(), 1);
        assert!(queued.is_empty());
    }

    #[test]
    fn test_per_transfer_cap() {
        let mut pool = WorkEntryPool::new(4, 4, 0);
        let mut queued: VecDeque<WorkEntry> = VecDeque::new();
        for slot in 0..2 {
            let mut entry = pool.next_for_transfer(&mut queued, 2).unwrap();
            entry.add_packet(packet(slot as u32, 64));
            entry.mark_queued(slot);
            queued.push_back(entry);
        }
        // Cap reached and nothing drained: retry later.
        assert!(pool.next_for_transfer(&mut queued, 2).is_none());
        assert_eq!(pool.free_count(), 2);
    }
}
