/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Simulated pinning backend and device queues.
//!
//! These stand in for the driver and hardware in tests: the backend hands
//! out descriptor words the way the real driver does (half-run couples
//! sharing an index), the DMA queue completes on demand, and the PIO gate
//! models the shadow/hardware credit split.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::device::CompletionStatus;
use crate::device::DescriptorBatch;
use crate::device::PioQueue;
use crate::device::SubmitError;
use crate::device::SubmissionQueue;
use crate::engine::WireFrame;
use crate::error::PinError;
use crate::pinning::MemoryKind;
use crate::pinning::PinGrant;
use crate::pinning::PinningBackend;
use crate::tid_pairs::TidCtrl;
use crate::tid_pairs::TidWord;

const SYSTEM_PAGE: u64 = 4096;
const DEVICE_PAGE: u64 = 65536;
const MAX_RUN_PAGES: u64 = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct BackendState {
    next_idx: u32,
    pinned_pages: u64,
    live: Vec<(u32, u32)>, // (raw word, pages)
    pin_calls: u64,
    unpin_calls: u64,
}

/// Pinning backend with a configurable per-call length cap and a total
/// descriptor budget.
pub struct SimBackend {
    state: Mutex<BackendState>,
    max_pinnable: u64,
    capacity_pages: Option<u64>,
}

impl Default for SimBackend {
    fn default() -> Self {
        SimBackend {
            state: Mutex::new(BackendState {
                next_idx: 0,
                pinned_pages: 0,
                live: Vec::new(),
                pin_calls: 0,
                unpin_calls: 0,
            }),
            max_pinnable: u64::MAX,
            capacity_pages: None,
        }
    }
}

impl SimBackend {
    /// Caps how many bytes one pin call may cover.
    pub fn with_max_pinnable(max_pinnable: u64) -> Self {
        SimBackend {
            max_pinnable,
            ..Default::default()
        }
    }

    /// Caps the per-call length and the total pages pinned at once.
    pub fn with_limits(max_pinnable: u64, capacity_pages: u64) -> Self {
        SimBackend {
            max_pinnable,
            capacity_pages: Some(capacity_pages),
            ..Default::default()
        }
    }

    fn page_size(kind: MemoryKind) -> u64 {
        match kind {
            MemoryKind::System => SYSTEM_PAGE,
            MemoryKind::Device => DEVICE_PAGE,
        }
    }

    /// Live descriptor words.
    pub fn pinned_words(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn pinned_pages(&self) -> u64 {
        lock(&self.state).pinned_pages
    }

    pub fn pin_calls(&self) -> u64 {
        lock(&self.state).pin_calls
    }

    pub fn unpin_calls(&self) -> u64 {
        lock(&self.state).unpin_calls
    }
}

impl PinningBackend for SimBackend {
    fn pin(&self, _addr: u64, len: u64, kind: MemoryKind) -> Result<PinGrant, PinError> {
        let page_size = Self::page_size(kind);
        let mut state = lock(&self.state);
        state.pin_calls += 1;

        let requested_pages = len.div_ceil(page_size);
        let budget = match self.capacity_pages {
            Some(capacity) => capacity.saturating_sub(state.pinned_pages),
            None => u64::MAX,
        };
        let grant_pages = requested_pages
            .min(budget)
            .min(self.max_pinnable / page_size);
        if grant_pages == 0 {
            return Err(PinError::NoResources);
        }

        // Descriptors come out as half-run couples sharing an index, the
        // shape the coalescer expects.
        let mut words = Vec::new();
        let mut left = grant_pages;
        while left > 0 {
            let run = left.min(MAX_RUN_PAGES);
            let idx = state.next_idx;
            state.next_idx = (state.next_idx + 1) & 0x3FF;
            if run == 1 {
                let word = TidWord::new(1, TidCtrl::First, idx);
                state.live.push((word.raw(), 1));
                words.push(word);
            } else {
                let first = (run + 1) / 2;
                let second = run - first;
                let word = TidWord::new(first as u32, TidCtrl::First, idx);
                state.live.push((word.raw(), first as u32));
                words.push(word);
                let word = TidWord::new(second as u32, TidCtrl::Second, idx);
                state.live.push((word.raw(), second as u32));
                words.push(word);
            }
            left -= run;
        }
        state.pinned_pages += grant_pages;
        Ok(PinGrant {
            pinned_len: grant_pages * page_size,
            words,
        })
    }

    fn unpin(&self, words: &[TidWord]) {
        let mut state = lock(&self.state);
        state.unpin_calls += 1;
        for word in words {
            if let Some(pos) = state.live.iter().position(|(raw, _)| *raw == word.raw()) {
                let (_, pages) = state.live.swap_remove(pos);
                state.pinned_pages = state.pinned_pages.saturating_sub(u64::from(pages));
            }
        }
    }

    fn max_pinnable_len(&self, _kind: MemoryKind) -> u64 {
        self.max_pinnable
    }
}

struct QueueState {
    next_slot: usize,
    in_flight: VecDeque<(usize, DescriptorBatch)>,
    completions: VecDeque<(usize, CompletionStatus)>,
    submitted: Vec<DescriptorBatch>,
}

/// DMA queue that completes only when the test says so.
pub struct SimSdmaQueue {
    state: Mutex<QueueState>,
    depth: usize,
}

impl SimSdmaQueue {
    pub fn new(depth: usize) -> Self {
        SimSdmaQueue {
            state: Mutex::new(QueueState {
                next_slot: 0,
                in_flight: VecDeque::new(),
                completions: VecDeque::new(),
                submitted: Vec::new(),
            }),
            depth,
        }
    }

    /// Completes every in-flight batch successfully, returning them in
    /// submission order so the test can deliver the packets.
    pub fn complete_all(&self) -> Vec<DescriptorBatch> {
        let mut state = lock(&self.state);
        let mut batches = Vec::new();
        while let Some((slot, batch)) = state.in_flight.pop_front() {
            state.completions.push_back((slot, CompletionStatus::Complete));
            batches.push(batch);
        }
        batches
    }

    /// Fails the oldest in-flight batch with `code`.
    pub fn fail_next(&self, code: u32) -> Option<DescriptorBatch> {
        let mut state = lock(&self.state);
        let (slot, batch) = state.in_flight.pop_front()?;
        state.completions.push_back((slot, CompletionStatus::Error(code)));
        Some(batch)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Every batch ever submitted, for inspection.
    pub fn submitted(&self) -> Vec<DescriptorBatch> {
        lock(&self.state).submitted.clone()
    }
}

impl SubmissionQueue for SimSdmaQueue {
    fn available_slots(&self) -> usize {
        self.depth - lock(&self.state).in_flight.len()
    }

    fn submit(&self, batch: DescriptorBatch) -> Result<usize, SubmitError> {
        let mut state = lock(&self.state);
        if state.in_flight.len() >= self.depth {
            return Err(SubmitError::WouldBlock);
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        state.in_flight.push_back((slot, batch.clone()));
        state.submitted.push(batch);
        Ok(slot)
    }

    fn poll_completions(&self) -> Vec<(usize, CompletionStatus)> {
        lock(&self.state).completions.drain(..).collect()
    }
}

struct PioState {
    shadow: u32,
    hardware: u32,
}

/// PIO gate with the shadow/hardware credit split: writes consume both
/// counters, replenishment lands on the hardware side and becomes visible
/// after a refresh.
pub struct SimPio {
    state: Mutex<PioState>,
    frames: Mutex<Vec<WireFrame>>,
}

impl SimPio {
    pub fn new(credits: u32) -> Self {
        SimPio {
            state: Mutex::new(PioState {
                shadow: credits,
                hardware: credits,
            }),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Starts with a stale shadow so the first check comes up short.
    pub fn with_stale_shadow(shadow: u32, hardware: u32) -> Self {
        SimPio {
            state: Mutex::new(PioState { shadow, hardware }),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Replenishes hardware credits (the send FIFO drained).
    pub fn add_credits(&self, credits: u32) {
        lock(&self.state).hardware += credits;
    }

    pub fn take_frames(&self) -> Vec<WireFrame> {
        std::mem::take(&mut *lock(&self.frames))
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }
}

impl PioQueue for SimPio {
    fn credits_available(&self) -> u32 {
        lock(&self.state).shadow
    }

    fn refresh_credits(&self) {
        let mut state = lock(&self.state);
        state.shadow = state.hardware;
    }

    fn write(&self, frame: WireFrame, credits: u32) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if state.shadow < credits {
            return Err(SubmitError::WouldBlock);
        }
        state.shadow -= credits;
        state.hardware -= credits;
        lock(&self.frames).push(frame);
        Ok(())
    }
}
