/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Intranode frame FIFO.
//!
//! Models the shared-memory ring used between endpoints on one node. No
//! credits or sequence numbers on this path; a full ring is simply a
//! retryable condition for the sender.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::device::SubmitError;
use crate::engine::WireFrame;

pub struct ShmFifo {
    frames: Mutex<VecDeque<WireFrame>>,
    capacity: usize,
}

impl ShmFifo {
    pub fn new(capacity: usize) -> Self {
        ShmFifo {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WireFrame>> {
        match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueues one frame; `WouldBlock` when the ring is full.
    pub fn try_push(&self, frame: WireFrame) -> Result<(), SubmitError> {
        let mut frames = self.lock();
        if frames.len() >= self.capacity {
            return Err(SubmitError::WouldBlock);
        }
        frames.push_back(frame);
        Ok(())
    }

    /// Dequeues the oldest frame, receiver side.
    pub fn try_pop(&self) -> Option<WireFrame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WireFrame;

    #[test]
    fn test_fifo_order_and_backpressure() {
        let fifo = ShmFifo::new(2);
        fifo.try_push(WireFrame::Ack { start_psn: 1, count: 1 }).unwrap();
        fifo.try_push(WireFrame::Ack { start_psn: 2, count: 1 }).unwrap();
        assert!(matches!(
            fifo.try_push(WireFrame::Ack { start_psn: 3, count: 1 }),
            Err(SubmitError::WouldBlock)
        ));

        match fifo.try_pop() {
            Some(WireFrame::Ack { start_psn, .. }) => assert_eq!(start_psn, 1),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(fifo.len(), 1);
    }
}
