/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error taxonomy for the cache, the registration driver, and the engine.
//!
//! Resource exhaustion is always a retryable condition surfaced to the
//! caller; it is never looped on internally. Foreign-owner conflicts are a
//! permanent per-endpoint denial, not a transient failure.

use crate::cache::EndpointId;

/// Raised by the pinning backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PinError {
    /// The backend has no descriptor resources left; retryable after
    /// eviction frees some.
    #[error("no pinning resources available")]
    NoResources,

    /// The request can never succeed (bad address, unsupported memory).
    #[error("pin rejected: {0}")]
    Rejected(String),
}

/// Raised by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache is at capacity and the dead list had nothing to flush.
    #[error("cache full: {cached} regions cached, limit {limit}")]
    ResourceExhausted { cached: usize, limit: usize },

    /// A concurrent insert claimed an overlapping range between the
    /// capacity check and the map insert.
    #[error("conflicting insert for range [{base:#x}, +{len})")]
    Conflict { base: u64, len: u64 },

    /// The pinning backend failed.
    #[error(transparent)]
    Pin(#[from] PinError),
}

/// Raised by the registration driver.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The range hit a region owned by a different endpoint. The caller's
    /// hardware receive path is disabled from here on.
    #[error("range [{base:#x}, +{len}) is registered to endpoint {owner}")]
    Denied {
        base: u64,
        len: u64,
        owner: EndpointId,
    },

    /// Out of cache or backend resources; retry after eviction.
    #[error("registration resources exhausted")]
    Exhausted,

    /// The backend rejected the range outright.
    #[error(transparent)]
    Pin(#[from] PinError),
}

/// Raised when a transfer cannot make forward progress at all.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The device reported an error completion for a submitted batch.
    #[error("device error completion for transfer {transfer_id} (code {code})")]
    DeviceError { transfer_id: u64, code: u32 },

    /// The transfer references an endpoint the engine no longer tracks.
    #[error("unknown transfer {0}")]
    UnknownTransfer(u64),
}
