/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rendezvous work-queue engine.
//!
//! One engine per endpoint, driven by cooperative polling. Every operation
//! that can hit a transient shortage (credits, sequence numbers, replay
//! buffers, queue slots) is a deferred work item in a per-type pending
//! queue; a work function either finishes or returns `Retry` and is run
//! again on a later [`RendezvousEngine::progress`] poll. Work functions
//! are idempotent given the transfer's byte counters, so a retry never
//! resends bytes.
//!
//! Receive side: an RTS picks the intranode, eager, or hardware-assisted
//! (expected receive) path, registers TIDs as needed, and answers with one
//! or more CTS frames. Send side: each CTS opens a segment that is pushed
//! through the shared-memory FIFO, programmed IO, or the DMA engine until
//! the transfer's byte counter drains to zero.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::cache::EndpointId;
use crate::cache::TidCache;
use crate::config::RendezvousConfig;
use crate::device::DeviceVariant;
use crate::device::OffsetMode;
use crate::device::PacketDescriptor;
use crate::device::PioQueue;
use crate::device::SubmitError;
use crate::device::SubmissionQueue;
use crate::device::TidAddressing;
use crate::error::RegistrationError;
use crate::error::TransferError;
use crate::pinning::AddrRange;
use crate::pinning::MemoryKind;
use crate::registration::RegistrationDriver;
use crate::reliability::PsnWindow;
use crate::reliability::ReplayPool;
use crate::sdma::WorkEntry;
use crate::sdma::WorkEntryPool;
use crate::shm::ShmFifo;
use crate::tid_pairs::TidWord;

/// Request-to-send: the origin announces a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtsMessage {
    pub transfer_id: u64,
    pub origin: EndpointId,
    pub src: Vec<AddrRange>,
    pub dst_addr: u64,
    pub dst_kind: MemoryKind,
    pub len: u64,
    pub is_intranode: bool,
    /// Bytes delivered inline with the RTS (transfer tail).
    pub immediate_len: u32,
}

/// Clear-to-send: the target tells the origin where and how to place one
/// contiguous span. A transfer may produce several of these when TID
/// registration covers it piecewise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtsMessage {
    pub transfer_id: u64,
    pub target: EndpointId,
    pub dst_addr: u64,
    pub len: u64,
    /// Present on the hardware-assisted path.
    pub tid_pairs: Vec<TidWord>,
    /// Byte offset of `dst_addr` into the first pair.
    pub tid_offset: u32,
    /// Extra bytes the origin must add to its byte counter to cover the
    /// target's 64-byte alignment adjustment.
    pub origin_byte_counter_adjust: u32,
}

/// Header of one data packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHeader {
    pub transfer_id: u64,
    pub psn: u32,
    pub dst_addr: u64,
    pub bytes: u32,
    pub tid: Option<TidAddressing>,
}

/// Everything the engine puts on a wire-like medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireFrame {
    Cts(CtsMessage),
    Data(DataHeader),
    Ack { start_psn: u32, count: u32 },
}

/// Deferred work categories, drained in declaration order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkType {
    TidSetup,
    Pio,
    Shm,
    Sdma,
    PendingCompletion,
}

const WORK_TYPE_COUNT: usize = 5;

/// How many settled transfer outcomes stay queryable after the transfer
/// itself is dropped.
const RECENT_OUTCOME_CAP: usize = 32;

/// Result of one work function invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WorkOutcome {
    Done,
    Retry,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WorkItem {
    TidSetup { transfer: u64 },
    SendCts { transfer: u64 },
    SendCtsIntranode { transfer: u64 },
    DputPio { transfer: u64, segment: u32 },
    DputShm { transfer: u64, segment: u32 },
    DputSdma { transfer: u64, segment: u32 },
    PendingCompletion { transfer: u64, segment: u32 },
}

impl WorkItem {
    fn transfer(self) -> u64 {
        match self {
            WorkItem::TidSetup { transfer }
            | WorkItem::SendCts { transfer }
            | WorkItem::SendCtsIntranode { transfer }
            | WorkItem::DputPio { transfer, .. }
            | WorkItem::DputShm { transfer, .. }
            | WorkItem::DputSdma { transfer, .. }
            | WorkItem::PendingCompletion { transfer, .. } => transfer,
        }
    }

    fn work_type(self) -> WorkType {
        match self {
            WorkItem::TidSetup { .. } => WorkType::TidSetup,
            WorkItem::SendCts { .. } | WorkItem::DputPio { .. } => WorkType::Pio,
            WorkItem::SendCtsIntranode { .. } | WorkItem::DputShm { .. } => WorkType::Shm,
            WorkItem::DputSdma { .. } => WorkType::Sdma,
            WorkItem::PendingCompletion { .. } => WorkType::PendingCompletion,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Complete,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    Origin,
    Target,
}

/// One contiguous span the origin must place, opened by a CTS.
#[derive(Debug)]
struct Segment {
    dst_addr: u64,
    len: u64,
    /// Bytes handed to a send mechanism so far.
    programmed: u64,
    tid_pairs: Vec<TidWord>,
    tid_idx: usize,
    /// Bytes consumed of the current pair, seeded with the CTS pair
    /// offset.
    tid_consumed: u64,
    /// A batch that could not be finished or submitted last poll.
    pending_entry: Option<WorkEntry>,
    entries: VecDeque<WorkEntry>,
}

struct Transfer {
    id: u64,
    peer: EndpointId,
    role: Role,
    state: TransferState,
    kind: MemoryKind,
    len: u64,
    /// Bytes not yet accounted for: programmed-and-confirmed on the
    /// origin, received on the target. Strictly decreasing; the transfer
    /// finishes exactly when it reaches zero.
    byte_counter: u64,
    intranode: bool,
    /// Target: destination range still awaiting TID registration.
    tid_remaining: Option<AddrRange>,
    /// Target: pending 64-byte alignment adjustment for the first CTS.
    alignment_adjust: u32,
    /// Target: registered ranges to release at completion.
    registered: Vec<AddrRange>,
    pending_cts: VecDeque<CtsMessage>,
    segments: HashMap<u32, Segment>,
    next_segment: u32,
    failed_code: Option<u32>,
}

impl Transfer {
    fn drained(&self) -> bool {
        self.segments.values().all(|seg| {
            seg.pending_entry.is_none() && seg.entries.iter().all(|e| e.ready_to_recycle())
        })
    }
}

/// The per-endpoint rendezvous engine.
pub struct RendezvousEngine {
    endpoint: EndpointId,
    config: RendezvousConfig,
    variant: DeviceVariant,
    driver: RegistrationDriver,
    psn: PsnWindow,
    replays: ReplayPool,
    sdma_queue: Arc<dyn SubmissionQueue>,
    pio: Arc<dyn PioQueue>,
    shm: Arc<ShmFifo>,
    work_entries: WorkEntryPool,
    pending: [VecDeque<WorkItem>; WORK_TYPE_COUNT],
    transfers: HashMap<u64, Transfer>,
    /// Fill slot -> (transfer, segment) for completion routing.
    slot_map: HashMap<usize, (u64, u32)>,
    next_transfer_id: u64,
    completed: Vec<(u64, Result<(), TransferError>)>,
    /// Bounded ring of settled outcomes for late state queries.
    recent: VecDeque<(u64, TransferState)>,
}

impl RendezvousEngine {
    pub fn new(
        endpoint: EndpointId,
        config: RendezvousConfig,
        variant: DeviceVariant,
        cache: Arc<TidCache>,
        sdma_queue: Arc<dyn SubmissionQueue>,
        pio: Arc<dyn PioQueue>,
        shm: Arc<ShmFifo>,
    ) -> Self {
        let psn = PsnWindow::new(config.initial_psn, config.psn_window);
        let replays = ReplayPool::new(config.replay_pool_size, config.packet_mtu as usize);
        let work_entries = WorkEntryPool::new(
            config.sdma_work_entries,
            config.sdma_max_packets_per_entry,
            config.sdma_bounce_buf_bytes,
        );
        let driver = RegistrationDriver::new(cache, config.clone());
        RendezvousEngine {
            endpoint,
            config,
            variant,
            driver,
            psn,
            replays,
            sdma_queue,
            pio,
            shm,
            work_entries,
            pending: Default::default(),
            transfers: HashMap::new(),
            slot_map: HashMap::new(),
            next_transfer_id: 1,
            completed: Vec::new(),
            recent: VecDeque::with_capacity(RECENT_OUTCOME_CAP),
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn driver(&self) -> &RegistrationDriver {
        &self.driver
    }

    pub fn transfer_state(&self, id: u64) -> Option<TransferState> {
        self.transfers.get(&id).map(|t| t.state).or_else(|| {
            self.recent
                .iter()
                .rev()
                .find(|(tid, _)| *tid == id)
                .map(|(_, state)| *state)
        })
    }

    /// Transfers still holding engine state.
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn transfer_byte_counter(&self, id: u64) -> Option<u64> {
        self.transfers.get(&id).map(|t| t.byte_counter)
    }

    /// Drains finished transfers recorded since the last call.
    pub fn take_completed(&mut self) -> Vec<(u64, Result<(), TransferError>)> {
        std::mem::take(&mut self.completed)
    }

    /// Replay buffers awaiting acknowledgment.
    pub fn replay_backlog(&self) -> usize {
        self.replays.registered_count()
    }

    /// Sequence numbers reserved but not yet retired.
    pub fn psn_in_flight(&self) -> u32 {
        self.psn.in_flight()
    }

    fn pending_count(&self) -> usize {
        self.pending.iter().map(|q| q.len()).sum()
    }

    /// Whether any deferred work or live transfer remains.
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
            && self
                .transfers
                .values()
                .all(|t| t.state != TransferState::Active)
    }

    /// Origin side: announce a transfer and get the RTS to deliver.
    pub fn post_send(
        &mut self,
        peer: EndpointId,
        src: AddrRange,
        kind: MemoryKind,
        dst_addr: u64,
        dst_kind: MemoryKind,
        is_intranode: bool,
        immediate_len: u32,
    ) -> RtsMessage {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        let transfer = Transfer {
            id,
            peer,
            role: Role::Origin,
            state: TransferState::Active,
            kind,
            len: src.len,
            byte_counter: src.len - u64::from(immediate_len),
            intranode: is_intranode,
            tid_remaining: None,
            alignment_adjust: 0,
            registered: Vec::new(),
            pending_cts: VecDeque::new(),
            segments: HashMap::new(),
            next_segment: 0,
            failed_code: None,
        };
        debug!(transfer = id, %peer, len = src.len, "posting rendezvous send");
        self.transfers.insert(id, transfer);
        RtsMessage {
            transfer_id: id,
            origin: self.endpoint,
            src: vec![src],
            dst_addr,
            dst_kind,
            len: src.len,
            is_intranode,
            immediate_len,
        }
    }

    /// Target side: classify an incoming RTS and answer with CTS frames.
    pub fn handle_rts(&mut self, rts: RtsMessage) {
        let payload_len = rts.len - u64::from(rts.immediate_len);
        let mut transfer = Transfer {
            id: rts.transfer_id,
            peer: rts.origin,
            role: Role::Target,
            state: TransferState::Active,
            kind: rts.dst_kind,
            len: rts.len,
            byte_counter: payload_len,
            intranode: rts.is_intranode,
            tid_remaining: None,
            alignment_adjust: 0,
            registered: Vec::new(),
            pending_cts: VecDeque::new(),
            segments: HashMap::new(),
            next_segment: 0,
            failed_code: None,
        };

        let item = if rts.is_intranode {
            transfer.pending_cts.push_back(CtsMessage {
                transfer_id: rts.transfer_id,
                target: self.endpoint,
                dst_addr: rts.dst_addr,
                len: payload_len,
                tid_pairs: Vec::new(),
                tid_offset: 0,
                origin_byte_counter_adjust: 0,
            });
            WorkItem::SendCtsIntranode {
                transfer: rts.transfer_id,
            }
        } else if self.tid_eligible(&rts) {
            let adjust = (rts.dst_addr & 63) as u32;
            transfer.alignment_adjust = adjust;
            transfer.byte_counter = payload_len + u64::from(adjust);
            transfer.tid_remaining = Some(AddrRange::new(
                rts.dst_addr - u64::from(adjust),
                payload_len + u64::from(adjust),
            ));
            WorkItem::TidSetup {
                transfer: rts.transfer_id,
            }
        } else {
            transfer.pending_cts.push_back(CtsMessage {
                transfer_id: rts.transfer_id,
                target: self.endpoint,
                dst_addr: rts.dst_addr,
                len: payload_len,
                tid_pairs: Vec::new(),
                tid_offset: 0,
                origin_byte_counter_adjust: 0,
            });
            WorkItem::SendCts {
                transfer: rts.transfer_id,
            }
        };

        debug!(
            transfer = rts.transfer_id,
            origin = %rts.origin,
            len = rts.len,
            path = ?item.work_type(),
            "handling rendezvous RTS"
        );
        self.transfers.insert(rts.transfer_id, transfer);
        self.run_or_queue(item);
    }

    /// Origin side: a CTS opens one send segment.
    pub fn handle_cts(&mut self, cts: CtsMessage) {
        let Some(transfer) = self.transfers.get_mut(&cts.transfer_id) else {
            warn!(transfer = cts.transfer_id, "CTS for unknown transfer");
            return;
        };
        transfer.byte_counter += u64::from(cts.origin_byte_counter_adjust);

        let segment_id = transfer.next_segment;
        transfer.next_segment += 1;
        let tid = !cts.tid_pairs.is_empty();
        transfer.segments.insert(
            segment_id,
            Segment {
                dst_addr: cts.dst_addr,
                len: cts.len,
                programmed: 0,
                tid_pairs: cts.tid_pairs,
                tid_idx: 0,
                tid_consumed: u64::from(cts.tid_offset),
                pending_entry: None,
                entries: VecDeque::new(),
            },
        );

        let item = if transfer.intranode {
            WorkItem::DputShm {
                transfer: cts.transfer_id,
                segment: segment_id,
            }
        } else if tid || cts.len > self.config.packet_mtu {
            WorkItem::DputSdma {
                transfer: cts.transfer_id,
                segment: segment_id,
            }
        } else {
            WorkItem::DputPio {
                transfer: cts.transfer_id,
                segment: segment_id,
            }
        };
        debug!(
            transfer = cts.transfer_id,
            segment = segment_id,
            len = cts.len,
            tid,
            path = ?item.work_type(),
            "handling rendezvous CTS"
        );
        self.run_or_queue(item);
    }

    /// Target side: account one arrived data packet.
    pub fn handle_data(&mut self, header: DataHeader) {
        let Some(transfer) = self.transfers.get_mut(&header.transfer_id) else {
            warn!(transfer = header.transfer_id, "data for unknown transfer");
            return;
        };
        let bytes = u64::from(header.bytes);
        debug_assert!(transfer.byte_counter >= bytes);
        transfer.byte_counter = transfer.byte_counter.saturating_sub(bytes);
    }

    /// Origin side: retire acknowledged sequence numbers.
    pub fn handle_ack(&mut self, start_psn: u32, count: u32) {
        let released = self.replays.release_batch(start_psn, count);
        self.psn.complete(released);
    }

    /// One cooperative poll: apply device completions, then retry pending
    /// work in type order, then settle finished transfers.
    pub fn progress(&mut self) {
        self.apply_completions();
        for queue_index in 0..WORK_TYPE_COUNT {
            let rounds = self.pending[queue_index].len();
            for _ in 0..rounds {
                let Some(item) = self.pending[queue_index].pop_front() else {
                    break;
                };
                if self.run_work(item) == WorkOutcome::Retry {
                    self.pending[queue_index].push_back(item);
                }
            }
        }
        self.settle_transfers();
    }

    fn run_or_queue(&mut self, item: WorkItem) {
        if self.run_work(item) == WorkOutcome::Retry {
            self.pending[item.work_type() as usize].push_back(item);
        }
        self.settle_transfers();
    }

    fn queue(&mut self, item: WorkItem) {
        self.pending[item.work_type() as usize].push_back(item);
    }

    fn run_work(&mut self, item: WorkItem) -> WorkOutcome {
        let id = item.transfer();
        let Some(mut transfer) = self.transfers.remove(&id) else {
            return WorkOutcome::Done;
        };
        let outcome = match item {
            WorkItem::TidSetup { .. } => self.work_tid_setup(&mut transfer),
            WorkItem::SendCts { .. } => self.work_send_cts(&mut transfer),
            WorkItem::SendCtsIntranode { .. } => self.work_send_cts_intranode(&mut transfer),
            WorkItem::DputPio { segment, .. } => self.work_dput_pio(&mut transfer, segment),
            WorkItem::DputShm { segment, .. } => self.work_dput_shm(&mut transfer, segment),
            WorkItem::DputSdma { segment, .. } => self.work_dput_sdma(&mut transfer, segment),
            WorkItem::PendingCompletion { segment, .. } => {
                self.work_pending_completion(&mut transfer, segment)
            }
        };
        self.transfers.insert(id, transfer);
        outcome
    }

    fn tid_eligible(&self, rts: &RtsMessage) -> bool {
        if rts.is_intranode
            || rts.src.len() != 1
            || rts.len - u64::from(rts.immediate_len) < self.config.tid_eligible_min_bytes
            || self.driver.cache().is_owner_disabled(self.endpoint)
        {
            return false;
        }
        // A misaligned destination needs immediate data to patch the
        // realigned prefix.
        let misalignment = rts.dst_addr & 63;
        misalignment == 0 || u64::from(rts.immediate_len) >= misalignment
    }

    /// Register TIDs for the uncovered destination range and emit a CTS
    /// for whatever prefix was covered. Partial coverage requeues; denial
    /// falls back to the eager path for the remainder.
    fn work_tid_setup(&mut self, transfer: &mut Transfer) -> WorkOutcome {
        let Some(remaining) = transfer.tid_remaining else {
            return WorkOutcome::Done;
        };
        if self.driver.cache().is_owner_disabled(self.endpoint) {
            return self.tid_fallback(transfer, remaining);
        }

        let page_size = self.config.page_size_for(transfer.kind);
        let request_len = remaining
            .len
            .min(self.config.max_tid_pairs_per_cts as u64 * page_size);
        let request = AddrRange::new(remaining.start, request_len);

        let block = match self
            .driver
            .register_for_rendezvous(self.endpoint, request, transfer.kind)
        {
            Ok(block) => block,
            Err(err @ RegistrationError::Denied { .. }) => {
                debug!(transfer = transfer.id, %err, "TID denied; falling back to eager path");
                return self.tid_fallback(transfer, remaining);
            }
            Err(err) => {
                // The driver already retried through the dead and LRU
                // lists; the remainder goes out eagerly.
                warn!(transfer = transfer.id, %err, "TID registration failed; falling back");
                return self.tid_fallback(transfer, remaining);
            }
        };

        let covered = block.covered_len(request);
        if covered == 0 {
            self.driver
                .release_range(self.endpoint, block.target, transfer.kind);
            return WorkOutcome::Retry;
        }
        transfer.registered.push(block.target);

        let adjust = transfer.alignment_adjust;
        transfer.alignment_adjust = 0;
        transfer.pending_cts.push_back(CtsMessage {
            transfer_id: transfer.id,
            target: self.endpoint,
            dst_addr: remaining.start,
            len: covered,
            tid_pairs: block.pairs,
            tid_offset: block.offset,
            origin_byte_counter_adjust: adjust,
        });
        self.queue(WorkItem::SendCts {
            transfer: transfer.id,
        });

        if covered >= remaining.len {
            transfer.tid_remaining = None;
            WorkOutcome::Done
        } else {
            transfer.tid_remaining = Some(AddrRange::new(
                remaining.start + covered,
                remaining.len - covered,
            ));
            WorkOutcome::Retry
        }
    }

    /// Abandon the hardware path for the rest of the transfer; the
    /// remainder goes out as one eager CTS.
    fn tid_fallback(&mut self, transfer: &mut Transfer, remaining: AddrRange) -> WorkOutcome {
        let adjust = transfer.alignment_adjust;
        transfer.alignment_adjust = 0;
        transfer.tid_remaining = None;
        transfer.pending_cts.push_back(CtsMessage {
            transfer_id: transfer.id,
            target: self.endpoint,
            dst_addr: remaining.start,
            len: remaining.len,
            tid_pairs: Vec::new(),
            tid_offset: 0,
            origin_byte_counter_adjust: adjust,
        });
        self.queue(WorkItem::SendCts {
            transfer: transfer.id,
        });
        WorkOutcome::Done
    }

    /// Sends the front pending CTS over PIO: credit check with one
    /// refresh, then PSN and replay acquisition, then the write. Any
    /// shortage puts everything back and retries.
    fn work_send_cts(&mut self, transfer: &mut Transfer) -> WorkOutcome {
        let Some(cts) = transfer.pending_cts.pop_front() else {
            return WorkOutcome::Done;
        };

        let payload_bytes = (cts.tid_pairs.len() * 4 + 32) as u64;
        let needed = self
            .variant
            .credits_needed(payload_bytes, self.config.pio_credit_block_bytes);
        if self.pio.credits_available() < needed {
            self.pio.refresh_credits();
            if self.pio.credits_available() < needed {
                transfer.pending_cts.push_front(cts);
                return WorkOutcome::Retry;
            }
        }
        let Some(mut reservation) = self.psn.reserve(1) else {
            transfer.pending_cts.push_front(cts);
            return WorkOutcome::Retry;
        };
        let Some(replay) = self.replays.allocate() else {
            self.psn.cancel_tail(&mut reservation, 1);
            transfer.pending_cts.push_front(cts);
            return WorkOutcome::Retry;
        };

        let psn = reservation.start_psn;
        match self.pio.write(WireFrame::Cts(cts.clone()), needed) {
            Ok(()) => {
                self.replays.register(psn, replay);
                WorkOutcome::Done
            }
            Err(SubmitError::WouldBlock) => {
                self.replays.cancel(replay);
                self.psn.cancel_tail(&mut reservation, 1);
                transfer.pending_cts.push_front(cts);
                WorkOutcome::Retry
            }
            Err(SubmitError::Fault(msg)) => {
                error!(
                    transfer = transfer.id,
                    psn,
                    pairs = cts.tid_pairs.len(),
                    dst_addr = cts.dst_addr,
                    len = cts.len,
                    msg,
                    "PIO write fault sending CTS"
                );
                std::process::abort();
            }
        }
    }

    /// Intranode CTS: no credits or sequence numbers, just ring space.
    fn work_send_cts_intranode(&mut self, transfer: &mut Transfer) -> WorkOutcome {
        let Some(cts) = transfer.pending_cts.pop_front() else {
            return WorkOutcome::Done;
        };
        match self.shm.try_push(WireFrame::Cts(cts.clone())) {
            Ok(()) => WorkOutcome::Done,
            Err(_) => {
                transfer.pending_cts.push_front(cts);
                WorkOutcome::Retry
            }
        }
    }

    /// Eager intranode data: MTU-sized frames through the FIFO.
    fn work_dput_shm(&mut self, transfer: &mut Transfer, segment_id: u32) -> WorkOutcome {
        let Some(segment) = transfer.segments.get_mut(&segment_id) else {
            return WorkOutcome::Done;
        };
        while segment.programmed < segment.len {
            let bytes = (segment.len - segment.programmed).min(self.config.packet_mtu) as u32;
            let header = DataHeader {
                transfer_id: transfer.id,
                psn: 0,
                dst_addr: segment.dst_addr + segment.programmed,
                bytes,
                tid: None,
            };
            match self.shm.try_push(WireFrame::Data(header)) {
                Ok(()) => {
                    segment.programmed += u64::from(bytes);
                    transfer.byte_counter = transfer.byte_counter.saturating_sub(u64::from(bytes));
                }
                Err(_) => return WorkOutcome::Retry,
            }
        }
        transfer.segments.remove(&segment_id);
        WorkOutcome::Done
    }

    /// Eager internode data over PIO, one packet per credit-checked write.
    fn work_dput_pio(&mut self, transfer: &mut Transfer, segment_id: u32) -> WorkOutcome {
        let Some(segment) = transfer.segments.get_mut(&segment_id) else {
            return WorkOutcome::Done;
        };
        while segment.programmed < segment.len {
            let bytes = (segment.len - segment.programmed).min(self.config.packet_mtu) as u32;
            let needed = self
                .variant
                .credits_needed(u64::from(bytes), self.config.pio_credit_block_bytes);
            if self.pio.credits_available() < needed {
                self.pio.refresh_credits();
                if self.pio.credits_available() < needed {
                    return WorkOutcome::Retry;
                }
            }
            let Some(mut reservation) = self.psn.reserve(1) else {
                return WorkOutcome::Retry;
            };
            let Some(replay) = self.replays.allocate() else {
                self.psn.cancel_tail(&mut reservation, 1);
                return WorkOutcome::Retry;
            };
            let psn = reservation.start_psn;
            let header = DataHeader {
                transfer_id: transfer.id,
                psn,
                dst_addr: segment.dst_addr + segment.programmed,
                bytes,
                tid: None,
            };
            match self.pio.write(WireFrame::Data(header), needed) {
                Ok(()) => {
                    self.replays.register(psn, replay);
                    segment.programmed += u64::from(bytes);
                    transfer.byte_counter = transfer.byte_counter.saturating_sub(u64::from(bytes));
                }
                Err(SubmitError::WouldBlock) => {
                    self.replays.cancel(replay);
                    self.psn.cancel_tail(&mut reservation, 1);
                    return WorkOutcome::Retry;
                }
                Err(SubmitError::Fault(msg)) => {
                    error!(
                        transfer = transfer.id,
                        segment = segment_id,
                        psn,
                        dst_addr = segment.dst_addr + segment.programmed,
                        bytes,
                        msg,
                        "PIO write fault sending data"
                    );
                    std::process::abort();
                }
            }
        }
        transfer.segments.remove(&segment_id);
        WorkOutcome::Done
    }

    /// DMA data path, with or without TID addressing. Builds bounded
    /// packet batches inside work entries: the whole PSN batch is
    /// reserved up front, replay buffers are taken per packet (a
    /// shortfall keeps the packets already added and flushes), and the
    /// batch is clamped at the 4 GiB destination wrap and the PSN
    /// generation boundary.
    fn work_dput_sdma(&mut self, transfer: &mut Transfer, segment_id: u32) -> WorkOutcome {
        let Some(segment) = transfer.segments.get_mut(&segment_id) else {
            return WorkOutcome::Done;
        };
        let mtu = self.config.packet_mtu;
        let page_size = self.config.page_size_for(transfer.kind);

        while segment.programmed < segment.len || segment.pending_entry.is_some() {
            // Flush a batch stranded by a full queue first.
            if let Some(entry) = segment.pending_entry.take() {
                if entry.packet_count() > 0 {
                    match Self::submit_entry(
                        &self.sdma_queue,
                        &mut self.slot_map,
                        transfer.id,
                        segment_id,
                        segment,
                        entry,
                    ) {
                        WorkOutcome::Done => {}
                        WorkOutcome::Retry => return WorkOutcome::Retry,
                    }
                    continue;
                }
                segment.pending_entry = Some(entry);
            }
            if segment.programmed >= segment.len {
                break;
            }

            if self.sdma_queue.available_slots() == 0 {
                return WorkOutcome::Retry;
            }
            let mut entry = match segment.pending_entry.take() {
                Some(entry) => entry,
                None => match self.work_entries.next_for_transfer(
                    &mut segment.entries,
                    self.config.sdma_max_entries_per_transfer,
                ) {
                    Some(entry) => entry,
                    None => return WorkOutcome::Retry,
                },
            };

            // Span bounded by the distance to the next 4 GiB destination
            // offset boundary.
            let rbuf = segment.dst_addr + segment.programmed;
            let to_wrap = 0x1_0000_0000 - (rbuf & 0xFFFF_FFFF);
            let span = (segment.len - segment.programmed).min(to_wrap);
            let mut packet_count =
                (span.div_ceil(mtu) as u32).min(self.config.sdma_max_packets_per_entry);
            packet_count = self.psn.clamp_to_generation(packet_count);

            let Some(mut reservation) = self.psn.reserve(packet_count) else {
                segment.pending_entry = Some(entry);
                return WorkOutcome::Retry;
            };

            entry.use_bounce_buf = segment.tid_pairs.is_empty();
            let mut span_left = span;
            let mut added: u32 = 0;
            for i in 0..reservation.count {
                if span_left == 0 {
                    break;
                }
                let mut bytes = span_left.min(mtu);
                let tid = if segment.tid_pairs.is_empty() {
                    None
                } else {
                    let Some(&pair) = segment.tid_pairs.get(segment.tid_idx) else {
                        break;
                    };
                    let pair_bytes = pair.len_bytes(page_size);
                    let pair_left = pair_bytes - segment.tid_consumed;
                    bytes = bytes.min(pair_left);
                    let (mode, offset_units) = OffsetMode::encode(segment.tid_consumed);
                    Some(TidAddressing {
                        word: pair,
                        mode,
                        offset_units,
                    })
                };
                let Some(replay) = self.replays.allocate() else {
                    // Keep what we have; the shortfall flushes below.
                    break;
                };
                let psn = (reservation.start_psn + i) & 0xffffff;
                self.replays.register(psn, replay);
                entry.add_packet(PacketDescriptor {
                    psn,
                    dst_addr: rbuf + (span - span_left),
                    bytes: bytes as u32,
                    tid,
                });
                if let Some(tid) = tid {
                    let pair_bytes = tid.word.len_bytes(page_size);
                    segment.tid_consumed += bytes;
                    if segment.tid_consumed >= pair_bytes {
                        segment.tid_idx += 1;
                        segment.tid_consumed = 0;
                    }
                }
                segment.programmed += bytes;
                span_left -= bytes;
                added += 1;
                if !entry.has_room() {
                    break;
                }
            }

            if added < reservation.count {
                let unused = reservation.count - added;
                self.psn.cancel_tail(&mut reservation, unused);
            }
            if added == 0 {
                segment.pending_entry = Some(entry);
                return WorkOutcome::Retry;
            }
            entry.reservation = Some(reservation);
            entry.bounce_busy = entry.use_bounce_buf;

            match Self::submit_entry(
                &self.sdma_queue,
                &mut self.slot_map,
                transfer.id,
                segment_id,
                segment,
                entry,
            ) {
                WorkOutcome::Done => {}
                WorkOutcome::Retry => return WorkOutcome::Retry,
            }
        }

        self.queue(WorkItem::PendingCompletion {
            transfer: transfer.id,
            segment: segment_id,
        });
        WorkOutcome::Done
    }

    /// Hands a finished batch to the device. `Retry` leaves the entry
    /// parked on the segment with its packets intact.
    fn submit_entry(
        sdma_queue: &Arc<dyn SubmissionQueue>,
        slot_map: &mut HashMap<usize, (u64, u32)>,
        transfer_id: u64,
        segment_id: u32,
        segment: &mut Segment,
        mut entry: WorkEntry,
    ) -> WorkOutcome {
        match sdma_queue.submit(entry.batch.clone()) {
            Ok(slot) => {
                entry.mark_queued(slot);
                slot_map.insert(slot, (transfer_id, segment_id));
                segment.entries.push_back(entry);
                WorkOutcome::Done
            }
            Err(SubmitError::WouldBlock) => {
                segment.pending_entry = Some(entry);
                WorkOutcome::Retry
            }
            Err(SubmitError::Fault(msg)) => {
                error!(
                    transfer = transfer_id,
                    segment = segment_id,
                    packets = entry.packet_count(),
                    payload = entry.payload_bytes(),
                    reservation = ?entry.reservation,
                    msg,
                    "DMA submission fault"
                );
                std::process::abort();
            }
        }
    }

    /// Waits out the segment's queued batches, recycling entries as they
    /// drain.
    fn work_pending_completion(&mut self, transfer: &mut Transfer, segment_id: u32) -> WorkOutcome {
        let Some(segment) = transfer.segments.get_mut(&segment_id) else {
            return WorkOutcome::Done;
        };
        if segment.pending_entry.is_some() || segment.programmed < segment.len {
            // The data path still owes packets; let it run first.
            self.queue(WorkItem::DputSdma {
                transfer: transfer.id,
                segment: segment_id,
            });
            return WorkOutcome::Retry;
        }
        if !segment.entries.iter().all(|e| e.ready_to_recycle()) {
            return WorkOutcome::Retry;
        }
        for entry in segment.entries.drain(..) {
            self.work_entries.recycle(entry);
        }
        transfer.segments.remove(&segment_id);
        WorkOutcome::Done
    }

    /// Routes device completions to their work entries and drains the
    /// transfer's byte counter. Replay buffers and sequence numbers are
    /// retired by [`RendezvousEngine::handle_ack`], not here: a local
    /// completion only means the device read the source, and the packets
    /// must stay replayable until the peer acknowledges them.
    fn apply_completions(&mut self) {
        for (slot, status) in self.sdma_queue.poll_completions() {
            let Some((transfer_id, segment_id)) = self.slot_map.remove(&slot) else {
                warn!(slot, "completion for unknown fill slot");
                continue;
            };
            let Some(transfer) = self.transfers.get_mut(&transfer_id) else {
                continue;
            };
            let Some(segment) = transfer.segments.get_mut(&segment_id) else {
                continue;
            };
            for entry in segment.entries.iter_mut() {
                if entry.slot != Some(slot) {
                    continue;
                }
                entry.bounce_busy = false;
                match status {
                    crate::device::CompletionStatus::Complete => {
                        let bytes = entry.payload_bytes();
                        debug_assert!(transfer.byte_counter >= bytes);
                        transfer.byte_counter = transfer.byte_counter.saturating_sub(bytes);
                        entry.mark_complete();
                    }
                    crate::device::CompletionStatus::Error(code) => {
                        error!(
                            transfer = transfer_id,
                            segment = segment_id,
                            slot,
                            code,
                            "DMA error completion"
                        );
                        // Failed packets are never acknowledged; their
                        // replays and sequence numbers come back here.
                        if let Some(reservation) = entry.reservation.take() {
                            let released = self
                                .replays
                                .release_batch(reservation.start_psn, reservation.count);
                            self.psn.complete(released);
                        }
                        transfer.failed_code = Some(code);
                        entry.mark_error(code);
                    }
                }
            }
        }
    }

    /// Finishes transfers whose byte counters drained (or that failed and
    /// fully quiesced), releasing any TID registrations they held and
    /// dropping them from the live table. The outcome goes to the
    /// completion list and the recent-outcome ring.
    fn settle_transfers(&mut self) {
        let ready: Vec<u64> = self
            .transfers
            .values()
            .filter(|t| t.state == TransferState::Active)
            .filter(|t| {
                if t.failed_code.is_some() {
                    t.drained()
                } else {
                    t.byte_counter == 0
                        && t.segments.is_empty()
                        && t.pending_cts.is_empty()
                        && t.tid_remaining.is_none()
                }
            })
            .map(|t| t.id)
            .collect();

        for id in ready {
            let Some(mut transfer) = self.transfers.remove(&id) else {
                continue;
            };
            for range in transfer.registered.drain(..) {
                self.driver.release_range(self.endpoint, range, transfer.kind);
            }
            let outcome = match transfer.failed_code {
                Some(code) => {
                    self.completed.push((
                        id,
                        Err(TransferError::DeviceError {
                            transfer_id: id,
                            code,
                        }),
                    ));
                    TransferState::Failed
                }
                None => {
                    debug!(
                        transfer = id,
                        role = ?transfer.role,
                        peer = %transfer.peer,
                        len = transfer.len,
                        "transfer complete"
                    );
                    self.completed.push((id, Ok(())));
                    TransferState::Complete
                }
            };
            if self.recent.len() == RECENT_OUTCOME_CAP {
                self.recent.pop_front();
            }
            self.recent.push_back((id, outcome));
        }
    }

    /// Tears the endpoint down: evicts and purges its cached regions and
    /// reports cache statistics.
    pub fn shutdown(&mut self) {
        self.driver.cache().purge_owner(Some(self.endpoint));
        self.driver.cache().shutdown();
    }
}
