/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hardware queue seams: DMA submission, PIO credits, device variants.
//!
//! The engine drives hardware exclusively through these interfaces, so the
//! cache and the coalescer stay variant-agnostic and tests run against
//! simulated queues.

use serde::Deserialize;
use serde::Serialize;

use crate::tid_pairs::TidWord;

/// Remote placement mode for a TID packet: the small mode addresses
/// offsets in 4-byte units, the large mode in 64-byte units for offsets
/// past the 15-bit boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetMode {
    Small,
    Large,
}

impl OffsetMode {
    pub const SMALL_UNIT_SHIFT: u32 = 2;
    pub const LARGE_UNIT_SHIFT: u32 = 6;
    const MODE_BOUNDARY_SHIFT: u32 = 15;

    /// Chooses the mode for a byte offset and converts it to offset units.
    pub fn encode(byte_offset: u64) -> (OffsetMode, u32) {
        if (byte_offset >> Self::SMALL_UNIT_SHIFT) < (1 << Self::MODE_BOUNDARY_SHIFT) {
            (OffsetMode::Small, (byte_offset >> Self::SMALL_UNIT_SHIFT) as u32)
        } else {
            (OffsetMode::Large, (byte_offset >> Self::LARGE_UNIT_SHIFT) as u32)
        }
    }
}

/// TID addressing for one packet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TidAddressing {
    pub word: TidWord,
    pub mode: OffsetMode,
    /// Offset into the pair's pages, in mode units.
    pub offset_units: u32,
}

/// One packet inside a DMA descriptor batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDescriptor {
    pub psn: u32,
    /// Absolute destination address at the remote endpoint.
    pub dst_addr: u64,
    pub bytes: u32,
    /// Present on hardware-assisted (expected receive) packets.
    pub tid: Option<TidAddressing>,
}

/// A batch of packets submitted as one DMA request.
#[derive(Debug, Clone, Default)]
pub struct DescriptorBatch {
    pub packets: Vec<PacketDescriptor>,
}

impl DescriptorBatch {
    pub fn payload_bytes(&self) -> u64 {
        self.packets.iter().map(|p| u64::from(p.bytes)).sum()
    }
}

/// Terminal status of a submitted batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete,
    Error(u32),
}

/// Raised by queue submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// No fill slot free; retry after completions drain.
    #[error("submission queue full")]
    WouldBlock,

    /// The device rejected the descriptor outright. Not recoverable.
    #[error("device fault: {0}")]
    Fault(String),
}

/// DMA submission queue with completion polling.
///
/// Completions are reported FIFO by fill slot, matching the hardware ring.
pub trait SubmissionQueue: Send + Sync {
    fn available_slots(&self) -> usize;

    /// Submits one batch, returning its fill slot.
    fn submit(&self, batch: DescriptorBatch) -> Result<usize, SubmitError>;

    /// Drains finished slots.
    fn poll_completions(&self) -> Vec<(usize, CompletionStatus)>;
}

/// Store-credit gate for programmed-IO sends.
///
/// The credit state is a cached shadow of a hardware counter; when it looks
/// short the engine refreshes once and re-checks before giving up.
pub trait PioQueue: Send + Sync {
    /// Credits visible in the cached shadow.
    fn credits_available(&self) -> u32;

    /// Synchronizes the shadow with the hardware counter.
    fn refresh_credits(&self);

    /// Writes one frame, consuming `credits` credits.
    fn write(&self, frame: crate::engine::WireFrame, credits: u32) -> Result<(), SubmitError>;
}

/// Hardware generation, chosen at init from the device info.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceVariant {
    Wfr,
    Jkr,
}

impl DeviceVariant {
    /// Header size in 32-bit words for one data packet.
    pub fn header_dwords(self) -> u32 {
        match self {
            // PBC + LRH + BTH + KDETH.
            DeviceVariant::Wfr => 2 + 2 + 3 + 9,
            // The newer generation carries a 16B LRH.
            DeviceVariant::Jkr => 2 + 4 + 3 + 9,
        }
    }

    /// PIO credits needed for a header plus `payload_bytes` of payload,
    /// one credit per 64-byte block.
    pub fn credits_needed(self, payload_bytes: u64, credit_block_bytes: u64) -> u32 {
        let header_bytes = u64::from(self.header_dwords()) * 4;
        let blocks = (header_bytes + payload_bytes).div_ceil(credit_block_bytes);
        blocks as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_mode_selection() {
        // Small mode holds 15 bits of 4-byte units.
        let (mode, units) = OffsetMode::encode(0x100);
        assert_eq!(mode, OffsetMode::Small);
        assert_eq!(units, 0x40);

        let boundary = (1u64 << 15) << OffsetMode::SMALL_UNIT_SHIFT;
        let (mode, _) = OffsetMode::encode(boundary - 4);
        assert_eq!(mode, OffsetMode::Small);
        let (mode, units) = OffsetMode::encode(boundary);
        assert_eq!(mode, OffsetMode::Large);
        assert_eq!(units, (boundary >> 6) as u32);
    }

    #[test]
    fn test_credit_sizing() {
        // A bare header fits one 64-byte credit on the older generation.
        assert_eq!(DeviceVariant::Wfr.credits_needed(0, 64), 1);
        // 8 KB of payload plus the header.
        assert_eq!(DeviceVariant::Wfr.credits_needed(8192, 64), 129);
        assert!(
            DeviceVariant::Jkr.credits_needed(0, 64) >= DeviceVariant::Wfr.credits_needed(0, 64)
        );
    }
}
