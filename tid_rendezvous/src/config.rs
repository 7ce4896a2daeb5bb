/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tunable parameters for the TID cache and the rendezvous engine.

use serde::Deserialize;
use serde::Serialize;

/// Represents rendezvous engine configuration.
///
/// One instance is shared by the cache, the registration driver, and the
/// engine for a given endpoint; every field has a hardware-motivated default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// `page_size` - Granularity of system-memory pinning, in bytes.
    pub page_size: u64,
    /// `device_page_size` - Granularity of device-memory pinning, in bytes.
    pub device_page_size: u64,
    /// `max_cached_regions` - Upper bound on concurrently cached regions,
    /// matching the hardware expected-receive table size.
    pub max_cached_regions: usize,
    /// `packet_mtu` - Maximum payload bytes carried by one data packet.
    pub packet_mtu: u64,
    /// `tid_eligible_min_bytes` - Minimum transfer length for the
    /// hardware-assisted receive path; shorter transfers go eager.
    pub tid_eligible_min_bytes: u64,
    /// `max_tid_pairs_per_cts` - Maximum coalesced descriptor pairs carried
    /// by a single CTS frame.
    pub max_tid_pairs_per_cts: usize,
    /// `sdma_max_packets_per_entry` - Packet batch bound for one SDMA work
    /// entry.
    pub sdma_max_packets_per_entry: u32,
    /// `sdma_max_entries_per_transfer` - How many work entries one transfer
    /// may hold before it must wait for completions to recycle them.
    pub sdma_max_entries_per_transfer: usize,
    /// `sdma_bounce_buf_bytes` - Capacity of each work entry's bounce buffer.
    pub sdma_bounce_buf_bytes: usize,
    /// `sdma_work_entries` - Size of the per-endpoint work entry pool.
    pub sdma_work_entries: usize,
    /// `replay_pool_size` - Number of preallocated replay buffers per
    /// endpoint.
    pub replay_pool_size: usize,
    /// `psn_window` - Maximum packets in flight per flow before PSN
    /// reservation starts failing.
    pub psn_window: u32,
    /// `initial_psn` - Starting packet sequence number, 24 bits.
    pub initial_psn: u32,
    /// `shm_fifo_depth` - Capacity of the intranode frame FIFO.
    pub shm_fifo_depth: usize,
    /// `pio_credit_block_bytes` - Bytes covered by one PIO credit.
    pub pio_credit_block_bytes: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            device_page_size: 65536,
            max_cached_regions: 2048,
            packet_mtu: 8192,
            tid_eligible_min_bytes: 15 * 4096,
            max_tid_pairs_per_cts: 512,
            sdma_max_packets_per_entry: 32,
            sdma_max_entries_per_transfer: 8,
            sdma_bounce_buf_bytes: 8192 * 32,
            sdma_work_entries: 256,
            replay_pool_size: 2048,
            psn_window: 2048,
            initial_psn: rand::random::<u32>() & 0xffffff,
            shm_fifo_depth: 1024,
            pio_credit_block_bytes: 64,
        }
    }
}

impl RendezvousConfig {
    /// Pinning granularity for the given memory kind.
    pub fn page_size_for(&self, kind: crate::pinning::MemoryKind) -> u64 {
        match kind {
            crate::pinning::MemoryKind::System => self.page_size,
            crate::pinning::MemoryKind::Device => self.device_page_size,
        }
    }
}

impl std::fmt::Display for RendezvousConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RendezvousConfig {{ page_size: {}, device_page_size: {}, max_cached_regions: {}, packet_mtu: {}, tid_eligible_min_bytes: {}, sdma_max_packets_per_entry: {}, replay_pool_size: {}, psn_window: {}, initial_psn: 0x{:x} }}",
            self.page_size,
            self.device_page_size,
            self.max_cached_regions,
            self.packet_mtu,
            self.tid_eligible_min_bytes,
            self.sdma_max_packets_per_entry,
            self.replay_pool_size,
            self.psn_window,
            self.initial_psn,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RendezvousConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.max_cached_regions, 2048);
        assert!(config.initial_psn <= 0xffffff);
        let shown = config.to_string();
        assert!(shown.contains("packet_mtu: 8192"));
    }
}
