/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Interval cache of pinned memory regions.
//!
//! Regions live in a generation-counted slot arena and are indexed by an
//! ordered map whose comparator treats overlapping ranges as equal, so a
//! single lookup classifies a query range against whatever it intersects.
//! Active ranges in the map are always disjoint, which keeps that comparator
//! a total order in practice.
//!
//! Unused regions (use count zero) sit on an LRU list and stay pinned for
//! reuse. Invalidated regions move to a dead list and are unpinned on the
//! next eviction pass, with the actual unpin happening after the cache lock
//! is released.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RendezvousConfig;
use crate::error::CacheError;
use crate::pinning::AddrRange;
use crate::pinning::InvalidationQueue;
use crate::pinning::MemoryKind;
use crate::pinning::PinningBackend;
use crate::tid_pairs;
use crate::tid_pairs::TidWord;

/// Identifies the endpoint that registered a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub u32);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle to a cached region; stale handles are detected by the
/// generation counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

/// One pinned, cached region.
#[derive(Debug)]
pub struct Region {
    /// The pinned range. May be a prefix of what the caller asked for when
    /// the backend granted a partial pin.
    pub range: AddrRange,
    pub owner: EndpointId,
    pub kind: MemoryKind,
    /// Raw descriptor words as granted by the backend.
    pub words: Vec<TidWord>,
    /// Coalesced pair words, regenerated once at insert.
    pub pairs: Vec<TidWord>,
    use_count: u32,
    in_map: bool,
}

impl Region {
    pub fn use_count(&self) -> u32 {
        self.use_count
    }
}

/// Result of classifying a query range against the cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FindResult {
    /// Nothing in the cache intersects the range.
    NotFound,
    /// A cached region fully contains the range.
    Found(RegionId),
    /// A cached region covers the start of the range but ends inside it.
    OverlapLeft(RegionId),
    /// A cached region starts inside the range.
    OverlapRight(RegionId),
    /// The intersecting region belongs to a different endpoint.
    InUse(RegionId),
}

/// Running counters, reported once at shutdown.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub searches: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub notifications: u64,
    pub evictions: u64,
}

/// Map key ordered by address with all overlapping ranges comparing equal.
/// Sound as a total order only while keyed ranges are pairwise disjoint,
/// which the insert path guarantees.
#[derive(Debug, Copy, Clone)]
struct RangeKey(AddrRange);

impl PartialEq for RangeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RangeKey {}

impl PartialOrd for RangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.end() <= other.0.start {
            Ordering::Less
        } else if self.0.start >= other.0.end() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

struct Slot {
    generation: u32,
    region: Option<Region>,
}

struct CacheState {
    map: BTreeMap<RangeKey, RegionId>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    lru: VecDeque<RegionId>,
    dead: Vec<RegionId>,
    max_regions: usize,
    stats: CacheStats,
    invalidations: InvalidationQueue,
    /// Endpoints permanently denied the hardware receive path after a
    /// foreign-owner hit.
    disabled: HashSet<EndpointId>,
}

impl CacheState {
    /// Map entries plus dead entries: everything still holding descriptors.
    fn pinned_count(&self) -> usize {
        self.map.len() + self.dead.len()
    }

    fn is_full(&self) -> bool {
        self.pinned_count() >= self.max_regions
    }

    fn region(&self, id: RegionId) -> Option<&Region> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.region.as_ref()
    }

    fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.region.as_mut()
    }

    fn alloc(&mut self, region: Region) -> RegionId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.region = Some(region);
                RegionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    region: Some(region),
                });
                RegionId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn release_slot(&mut self, id: RegionId) -> Option<Region> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let region = slot.region.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(region)
    }

    /// Drains the monitor queue, closing every intersecting region.
    fn apply_invalidations(&mut self) {
        // Split borrow: the receiver is drained before the map is touched.
        let ranges = self.invalidations.drain();
        for range in ranges {
            self.stats.notifications += 1;
            self.close_range(range, "monitor");
        }
    }

    /// Moves every region intersecting `range` from the map to the dead
    /// list, regardless of use count.
    fn close_range(&mut self, range: AddrRange, why: &str) {
        loop {
            let Some((&key, &id)) = self.map.get_key_value(&RangeKey(range)) else {
                break;
            };
            self.map.remove(&key);
            let mut drop_from_lru = false;
            if let Some(region) = self.region_mut(id) {
                region.in_map = false;
                if region.use_count > 0 {
                    // Another holder still references the pages; the close
                    // proceeds anyway and the holder's release tolerates it.
                    warn!(
                        range = %region.range,
                        use_count = region.use_count,
                        why,
                        "invalidating region still in use"
                    );
                } else {
                    drop_from_lru = true;
                }
            }
            if drop_from_lru {
                self.lru.retain(|lid| *lid != id);
            }
            self.dead.push(id);
            self.stats.deletes += 1;
        }
    }

    /// Detaches all dead regions from the arena; caller unpins them after
    /// dropping the lock.
    fn detach_dead(&mut self) -> Vec<Region> {
        let dead: Vec<RegionId> = self.dead.drain(..).collect();
        dead.into_iter()
            .filter_map(|id| self.release_slot(id))
            .collect()
    }

    /// Pops one LRU region out of the map and arena, oldest first.
    fn detach_lru_front(&mut self) -> Option<Region> {
        loop {
            let id = self.lru.pop_front()?;
            // Stale ids can linger after a purge; skip them.
            let Some(region) = self.region(id) else {
                continue;
            };
            debug_assert_eq!(region.use_count, 0);
            let key = RangeKey(region.range);
            self.map.remove(&key);
            return self.release_slot(id);
        }
    }
}

/// The shared TID cache for one device context.
pub struct TidCache {
    state: Mutex<CacheState>,
    backend: Arc<dyn PinningBackend>,
    config: RendezvousConfig,
}

impl TidCache {
    pub fn new(
        config: RendezvousConfig,
        backend: Arc<dyn PinningBackend>,
        invalidations: InvalidationQueue,
    ) -> Self {
        TidCache {
            state: Mutex::new(CacheState {
                map: BTreeMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                lru: VecDeque::new(),
                dead: Vec::new(),
                max_regions: config.max_cached_regions,
                stats: CacheStats::default(),
                invalidations,
                disabled: HashSet::new(),
            }),
            backend,
            config,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn unpin_detached(&self, detached: Vec<Region>) -> usize {
        let count = detached.len();
        for region in &detached {
            debug!(range = %region.range, owner = %region.owner, "unpinning evicted region");
            self.backend.unpin(&region.words);
        }
        count
    }

    /// Classifies `range` against the cache for `owner`.
    ///
    /// A hit owned by a different endpoint permanently disables the
    /// hardware receive path for `owner`; the engine consults
    /// [`TidCache::is_owner_disabled`] before attempting TID setup.
    pub fn find(&self, owner: EndpointId, range: AddrRange) -> FindResult {
        self.classify(owner, range, true)
    }

    /// Classification for release paths. A foreign-owner hit still reports
    /// `InUse` but does not disable `owner`: the releasing endpoint is
    /// giving references back, not contending for the range.
    pub fn find_for_release(&self, owner: EndpointId, range: AddrRange) -> FindResult {
        self.classify(owner, range, false)
    }

    fn classify(&self, owner: EndpointId, range: AddrRange, disable_on_foreign: bool) -> FindResult {
        let mut state = self.lock_state();
        state.apply_invalidations();
        state.stats.searches += 1;

        let hit = state
            .map
            .get_key_value(&RangeKey(range))
            .map(|(key, id)| (key.0, *id));
        let Some((entry_range, id)) = hit else {
            state.stats.misses += 1;
            return FindResult::NotFound;
        };

        let entry_owner = state.region(id).map(|region| region.owner);
        let Some(entry_owner) = entry_owner else {
            state.stats.misses += 1;
            return FindResult::NotFound;
        };
        if entry_owner != owner {
            if disable_on_foreign && state.disabled.insert(owner) {
                warn!(
                    %owner,
                    holder = %entry_owner,
                    range = %entry_range,
                    "range already registered to another endpoint; disabling hardware receive path"
                );
            }
            return FindResult::InUse(id);
        }
        if entry_range.contains(&range) {
            state.stats.hits += 1;
            FindResult::Found(id)
        } else if entry_range.start <= range.start {
            FindResult::OverlapLeft(id)
        } else {
            FindResult::OverlapRight(id)
        }
    }

    pub fn is_owner_disabled(&self, owner: EndpointId) -> bool {
        self.lock_state().disabled.contains(&owner)
    }

    /// Runs `f` against a live region, if the handle is still valid.
    pub fn with_region<R>(&self, id: RegionId, f: impl FnOnce(&Region) -> R) -> Option<R> {
        let state = self.lock_state();
        state.region(id).map(f)
    }

    /// Pins `range` and inserts it as a new region with one reference held
    /// by the caller.
    ///
    /// If the cache is at capacity, the dead list (never the LRU list) is
    /// flushed first. The backend may grant a shorter pin; the region then
    /// records the granted prefix and the caller sees it via
    /// [`TidCache::with_region`].
    pub fn insert_and_pin(
        &self,
        owner: EndpointId,
        range: AddrRange,
        kind: MemoryKind,
    ) -> Result<RegionId, CacheError> {
        let page_size = self.config.page_size_for(kind);

        let detached = {
            let mut state = self.lock_state();
            state.apply_invalidations();
            if state.is_full() {
                state.detach_dead()
            } else {
                Vec::new()
            }
        };
        self.unpin_detached(detached);

        {
            let state = self.lock_state();
            if state.is_full() {
                return Err(CacheError::ResourceExhausted {
                    cached: state.pinned_count(),
                    limit: state.max_regions,
                });
            }
            if state.map.contains_key(&RangeKey(range)) {
                return Err(CacheError::Conflict {
                    base: range.start,
                    len: range.len,
                });
            }
        }

        // Pin with no lock held.
        let pin_len = range.len.min(self.backend.max_pinnable_len(kind));
        let grant = self.backend.pin(range.start, pin_len, kind)?;

        let mut state = self.lock_state();
        if state.is_full() || state.map.contains_key(&RangeKey(range)) {
            // Lost a race while pinning; undo and let the caller restart.
            drop(state);
            self.backend.unpin(&grant.words);
            return Err(CacheError::Conflict {
                base: range.start,
                len: range.len,
            });
        }

        let pinned = AddrRange::new(range.start, grant.pinned_len);
        let pairs = tid_pairs::coalesce(&grant.words, grant.pinned_len, page_size);
        let id = state.alloc(Region {
            range: pinned,
            owner,
            kind,
            words: grant.words,
            pairs,
            use_count: 1,
            in_map: true,
        });
        state.map.insert(RangeKey(pinned), id);
        state.stats.inserts += 1;
        debug!(range = %pinned, %owner, requested = range.len, "cached pinned region");
        Ok(id)
    }

    /// Takes a reference on a region; 0 -> 1 removes it from the LRU list.
    pub fn increment_use(&self, id: RegionId) {
        let mut state = self.lock_state();
        let Some(region) = state.region_mut(id) else {
            return;
        };
        region.use_count += 1;
        let first = region.use_count == 1 && region.in_map;
        if first {
            state.lru.retain(|lid| *lid != id);
        }
    }

    /// Drops a reference; the transition to zero appends the region to the
    /// LRU list (dead regions stay off it). Returns the new count.
    pub fn decrement_use(&self, id: RegionId) -> u32 {
        let mut state = self.lock_state();
        let Some(region) = state.region_mut(id) else {
            return 0;
        };
        debug_assert!(region.use_count > 0);
        region.use_count = region.use_count.saturating_sub(1);
        let count = region.use_count;
        let park = count == 0 && region.in_map;
        if park {
            state.lru.push_back(id);
        }
        count
    }

    /// Explicitly invalidates every region intersecting `range`, moving it
    /// to the dead list regardless of use count.
    pub fn invalidate(&self, range: AddrRange) {
        let mut state = self.lock_state();
        state.apply_invalidations();
        state.close_range(range, "deregistration");
    }

    /// Drains the dead list and optionally the LRU list, unpinning the
    /// detached regions after the lock is released. Returns how many
    /// regions were evicted.
    pub fn evict(&self, allow_lru: bool, evict_all: bool) -> usize {
        let detached = {
            let mut state = self.lock_state();
            state.apply_invalidations();
            let mut detached = state.detach_dead();
            if allow_lru {
                if evict_all {
                    while let Some(region) = state.detach_lru_front() {
                        detached.push(region);
                    }
                } else {
                    if let Some(region) = state.detach_lru_front() {
                        detached.push(region);
                    }
                    while state.is_full() {
                        match state.detach_lru_front() {
                            Some(region) => detached.push(region),
                            None => break,
                        }
                    }
                }
            }
            state.stats.evictions += detached.len() as u64;
            detached
        };
        self.unpin_detached(detached)
    }

    /// Force-evicts every region belonging to `owner` (all owners when
    /// `None`), ignoring use counts. Teardown only.
    pub fn purge_owner(&self, owner: Option<EndpointId>) -> usize {
        let detached = {
            let mut state = self.lock_state();
            state.apply_invalidations();
            let victims: Vec<RegionId> = state
                .map
                .values()
                .copied()
                .filter(|id| match (owner, state.region(*id)) {
                    (Some(owner), Some(region)) => region.owner == owner,
                    (None, Some(_)) => true,
                    (_, None) => false,
                })
                .collect();
            let mut detached = Vec::with_capacity(victims.len());
            for id in victims {
                let Some(region) = state.region(id) else {
                    continue;
                };
                if region.use_count > 0 {
                    warn!(
                        range = %region.range,
                        owner = %region.owner,
                        use_count = region.use_count,
                        "purging region still in use"
                    );
                }
                let key = RangeKey(region.range);
                state.map.remove(&key);
                state.lru.retain(|lid| *lid != id);
                if let Some(region) = state.release_slot(id) {
                    detached.push(region);
                }
                state.stats.deletes += 1;
            }
            detached.extend(state.detach_dead());
            detached
        };
        self.unpin_detached(detached)
    }

    /// Evicts everything and reports lifetime statistics.
    pub fn shutdown(&self) {
        self.evict(true, true);
        let purged = self.purge_owner(None);
        let stats = self.stats();
        info!(
            searches = stats.searches,
            hits = stats.hits,
            misses = stats.misses,
            inserts = stats.inserts,
            deletes = stats.deletes,
            notifications = stats.notifications,
            evictions = stats.evictions,
            purged,
            "tid cache shutdown"
        );
    }

    pub fn stats(&self) -> CacheStats {
        self.lock_state().stats
    }

    /// Number of regions still holding descriptors (active plus dead).
    pub fn pinned_count(&self) -> usize {
        self.lock_state().pinned_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinning::invalidation_channel;
    use crate::test_utils::SimBackend;

    fn cache_with_backend(max_regions: usize) -> (TidCache, Arc<SimBackend>) {
        let backend = Arc::new(SimBackend::default());
        let mut config = RendezvousConfig::default();
        config.max_cached_regions = max_regions;
        let (_handle, queue) = invalidation_channel();
        (
            TidCache::new(config, backend.clone(), queue),
            backend,
        )
    }

    const PAGE: u64 = 4096;
    const EP: EndpointId = EndpointId(1);

    #[test]
    fn test_find_classification() {
        let (cache, _backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 8 * PAGE), MemoryKind::System)
            .unwrap();

        // Fully contained.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x10000 + PAGE, 2 * PAGE)),
            FindResult::Found(id)
        );
        // Entry covers the query start but not its end.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x10000 + 4 * PAGE, 8 * PAGE)),
            FindResult::OverlapLeft(id)
        );
        // Entry begins inside the query.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x10000 - 2 * PAGE, 4 * PAGE)),
            FindResult::OverlapRight(id)
        );
        // Disjoint.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x40000, PAGE)),
            FindResult::NotFound
        );
    }

    #[test]
    fn test_foreign_owner_disables_endpoint() {
        let (cache, _backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();

        let other = EndpointId(2);
        assert!(!cache.is_owner_disabled(other));
        assert_eq!(
            cache.find(other, AddrRange::new(0x10000, PAGE)),
            FindResult::InUse(id)
        );
        assert!(cache.is_owner_disabled(other));
        assert!(!cache.is_owner_disabled(EP));
    }

    #[test]
    fn test_release_lookup_reports_foreign_hit_without_disable() {
        let (cache, _backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();

        let other = EndpointId(2);
        assert_eq!(
            cache.find_for_release(other, AddrRange::new(0x10000, PAGE)),
            FindResult::InUse(id)
        );
        assert!(!cache.is_owner_disabled(other));
    }

    #[test]
    fn test_use_count_drives_lru() {
        let (cache, backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();

        // In use: LRU eviction must not touch it.
        assert_eq!(cache.evict(true, true), 0);

        assert_eq!(cache.decrement_use(id), 0);
        // Reclaimed by LRU eviction now.
        assert_eq!(cache.evict(true, true), 1);
        assert_eq!(cache.pinned_count(), 0);
        assert_eq!(backend.pinned_words(), 0);
    }

    #[test]
    fn test_reuse_skips_lru_eviction() {
        let (cache, _backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();
        cache.decrement_use(id);
        // Taken back into use before any eviction ran.
        cache.increment_use(id);
        assert_eq!(cache.evict(true, true), 0);
        assert_eq!(cache.pinned_count(), 1);
    }

    #[test]
    fn test_invalidate_in_use_region_goes_dead() {
        let (cache, backend) = cache_with_backend(16);
        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();

        cache.invalidate(AddrRange::new(0x10000, 4 * PAGE));
        // Gone from the map immediately even though use_count == 1.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x10000, PAGE)),
            FindResult::NotFound
        );
        // Still pinned until an eviction pass drains the dead list.
        assert!(backend.pinned_words() > 0);
        assert_eq!(cache.evict(false, false), 1);
        assert_eq!(backend.pinned_words(), 0);

        // Late release of the stale handle is harmless.
        assert_eq!(cache.decrement_use(id), 0);
    }

    #[test]
    fn test_monitor_invalidation_message() {
        let backend: Arc<SimBackend> = Arc::new(SimBackend::default());
        let (handle, queue) = invalidation_channel();
        let cache = TidCache::new(RendezvousConfig::default(), backend, queue);

        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 4 * PAGE), MemoryKind::System)
            .unwrap();
        cache.decrement_use(id);

        handle.invalidate(AddrRange::new(0x10000, PAGE));
        // Drained at the next entry point.
        assert_eq!(
            cache.find(EP, AddrRange::new(0x10000, PAGE)),
            FindResult::NotFound
        );
        assert_eq!(cache.stats().notifications, 1);
    }

    #[test]
    fn test_capacity_bound_and_dead_flush() {
        let (cache, _backend) = cache_with_backend(2);
        let a = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, PAGE), MemoryKind::System)
            .unwrap();
        let _b = cache
            .insert_and_pin(EP, AddrRange::new(0x20000, PAGE), MemoryKind::System)
            .unwrap();

        // Full, nothing dead: exhausted.
        match cache.insert_and_pin(EP, AddrRange::new(0x30000, PAGE), MemoryKind::System) {
            Err(CacheError::ResourceExhausted { cached: 2, limit: 2 }) => {}
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }

        // A dead region is flushed to make room; LRU is not consulted.
        cache.decrement_use(a);
        cache.invalidate(AddrRange::new(0x10000, PAGE));
        cache
            .insert_and_pin(EP, AddrRange::new(0x30000, PAGE), MemoryKind::System)
            .unwrap();
        assert_eq!(cache.pinned_count(), 2);
    }

    #[test]
    fn test_purge_ignores_use_counts() {
        let (cache, backend) = cache_with_backend(16);
        let other = EndpointId(2);
        cache
            .insert_and_pin(EP, AddrRange::new(0x10000, PAGE), MemoryKind::System)
            .unwrap();
        cache
            .insert_and_pin(other, AddrRange::new(0x20000, PAGE), MemoryKind::System)
            .unwrap();

        assert_eq!(cache.purge_owner(Some(EP)), 1);
        assert_eq!(cache.pinned_count(), 1);
        assert_eq!(cache.purge_owner(None), 1);
        assert_eq!(cache.pinned_count(), 0);
        assert_eq!(backend.pinned_words(), 0);
    }

    #[test]
    fn test_randomized_workload_drains_clean() {
        use rand::rngs::SmallRng;
        use rand::Rng;
        use rand::SeedableRng;

        let (cache, backend) = cache_with_backend(16);
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let base = 0x100000u64;
        // Disjoint slots, 16 pages apart, so inserts never conflict.
        let mut held: Vec<Option<(RegionId, AddrRange)>> = vec![None; 8];

        for _ in 0..256 {
            let slot = rng.gen_range(0..held.len());
            match held[slot].take() {
                Some((id, range)) => {
                    cache.decrement_use(id);
                    cache.invalidate(range);
                }
                None => {
                    let len = u64::from(rng.gen_range(1..=8u32)) * PAGE;
                    let range = AddrRange::new(base + slot as u64 * 16 * PAGE, len);
                    match cache.insert_and_pin(EP, range, MemoryKind::System) {
                        Ok(id) => held[slot] = Some((id, range)),
                        Err(_) => {
                            cache.evict(true, false);
                        }
                    }
                }
            }
            if rng.gen_bool(0.1) {
                cache.evict(false, false);
            }
        }

        for (id, _) in held.into_iter().flatten() {
            cache.decrement_use(id);
        }
        cache.evict(true, true);
        assert_eq!(cache.pinned_count(), 0);
        assert_eq!(backend.pinned_words(), 0);
        assert_eq!(backend.pinned_pages(), 0);
    }

    #[test]
    fn test_partial_pin_records_prefix() {
        let backend = Arc::new(SimBackend::with_max_pinnable(10 * PAGE));
        let (_handle, queue) = invalidation_channel();
        let cache = TidCache::new(RendezvousConfig::default(), backend, queue);

        let id = cache
            .insert_and_pin(EP, AddrRange::new(0x10000, 19 * PAGE), MemoryKind::System)
            .unwrap();
        let range = cache.with_region(id, |r| r.range).unwrap();
        assert_eq!(range.len, 10 * PAGE);
    }
}
