/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! TID expected-receive cache and rendezvous data-placement engine.
//!
//! This crate implements the receive-side machinery of a rendezvous
//! protocol for a high-performance fabric NIC:
//!
//! - `cache`: an interval cache of pinned memory regions keyed by address
//!   range, with use counts, LRU reuse, and monitor-driven invalidation.
//! - `tid_pairs`: the packed hardware descriptor words and the pair
//!   coalescer that halves descriptor counts.
//! - `registration`: the driver that turns arbitrary byte ranges into
//!   descriptor blocks, stitching cached regions and fresh pins together.
//! - `engine`: the per-endpoint work-queue engine handling RTS/CTS
//!   exchange and pushing data through shared memory, programmed IO, or
//!   the DMA engine, with PSN reliability and replay buffers.
//!
//! Everything hardware-facing sits behind the traits in `pinning` and
//! `device`, so the whole protocol runs against the simulated queues in
//! `test_utils`.

pub mod cache;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod pinning;
pub mod registration;
pub mod reliability;
pub mod sdma;
pub mod shm;
pub mod test_utils;
pub mod tid_pairs;

pub use cache::EndpointId;
pub use cache::FindResult;
pub use cache::TidCache;
pub use config::RendezvousConfig;
pub use engine::RendezvousEngine;
pub use error::CacheError;
pub use error::RegistrationError;
pub use error::TransferError;
pub use pinning::AddrRange;
pub use pinning::MemoryKind;
pub use registration::DescriptorBlock;
pub use registration::RegistrationDriver;
pub use tid_pairs::TidWord;
