// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::RwLock;

use crate::coordinator::CoordinatorClient;
use crate::proto::metapb;
use crate::region::EpochCompare;
use crate::region::Region;
use crate::region::RegionVerId;
use crate::Error;
use crate::Key;
use crate::Result;

/// A cached region and the instant it stops being served.
///
/// Every install stamps a fresh, jittered lifetime. An expired entry is not
/// evicted eagerly; it just stops answering lookups, which sends the next
/// lookup through the coordinator, and the descriptor that comes back
/// replaces it via `install_region`.
struct CachedRegion {
    region: Arc<Region>,
    /// `None` when expiry is disabled (zero TTL configured).
    expires_at: Option<Instant>,
}

impl CachedRegion {
    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

struct RegionCacheMap {
    /// The entries themselves, keyed by incarnation. Entries leave through
    /// `invalidate_region` or by being superseded in `install_region`;
    /// expiry alone never removes one.
    ver_id_to_region: HashMap<RegionVerId, CachedRegion>,
    /// The ordered index for predecessor search by start key. Ranges of the
    /// indexed regions are pairwise disjoint at all times.
    key_to_ver_id: BTreeMap<Key, RegionVerId>,
    /// Which incarnation currently holds each region id. A reused id after
    /// splits or merges maps to a different `RegionVerId`.
    id_to_ver_id: HashMap<u64, RegionVerId>,
}

impl RegionCacheMap {
    fn new() -> RegionCacheMap {
        RegionCacheMap {
            ver_id_to_region: HashMap::new(),
            key_to_ver_id: BTreeMap::new(),
            id_to_ver_id: HashMap::new(),
        }
    }

    /// The ver ids of cached regions intersecting `[start_key, end_key)`,
    /// collected by scanning backwards from `end_key`. Relies on the
    /// non-overlap invariant. An empty `end_key` means "+inf".
    fn overlapping(&self, start_key: &[u8], end_key: Key) -> Vec<RegionVerId> {
        let mut overlapping = Vec::new();
        let mut search_range = {
            if end_key.is_empty() {
                self.key_to_ver_id.range(..)
            } else {
                self.key_to_ver_id.range(..end_key)
            }
        };
        while let Some((_, ver_id_in_cache)) = search_range.next_back() {
            let Some(cached) = self.ver_id_to_region.get(ver_id_in_cache) else {
                continue;
            };
            let end_key_in_cache = cached.region.region.end_key.as_slice();
            let overlaps = end_key_in_cache.is_empty() || end_key_in_cache > start_key;
            if overlaps {
                overlapping.push(ver_id_in_cache.clone());
            } else {
                break;
            }
        }
        overlapping
    }

    fn remove(&mut self, ver_id: &RegionVerId) {
        let Some(removed) = self.ver_id_to_region.remove(ver_id) else {
            return;
        };
        self.key_to_ver_id.remove(&removed.region.start_key());
        self.id_to_ver_id.remove(&removed.region.id());
    }
}

/// The client-side key-to-region index.
///
/// Lookups are served from an ordered map keyed by region start key; misses
/// read through to the coordinator with single-flight deduplication, so any
/// number of concurrent lookups into the same unknown gap issue one scan.
pub struct RegionCache<C> {
    region_cache: RwLock<RegionCacheMap>,
    /// In-flight read-throughs, keyed by the unknown gap's lower bound (the
    /// start key of the nearest cached predecessor, or the empty key).
    in_flight_by_gap: Mutex<HashMap<Key, Arc<Notify>>>,
    coordinator: Arc<C>,
    ttl: Duration,
    ttl_jitter: Duration,
}

impl<C> RegionCache<C> {
    pub fn new_with_ttl(
        coordinator: Arc<C>,
        region_cache_ttl: Duration,
        region_cache_ttl_jitter: Duration,
    ) -> RegionCache<C> {
        RegionCache {
            region_cache: RwLock::new(RegionCacheMap::new()),
            in_flight_by_gap: Mutex::new(HashMap::new()),
            coordinator,
            ttl: region_cache_ttl,
            ttl_jitter: region_cache_ttl_jitter,
        }
    }

    /// The lifetime stamped on an entry being installed now. Jitter spreads
    /// the expiry of entries installed together, so a whole table warmed in
    /// one burst does not turn into a re-scan burst later.
    fn entry_deadline(&self) -> Option<Instant> {
        if self.ttl.is_zero() {
            return None;
        }
        let jitter_ms = u64::try_from(self.ttl_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        Some(Instant::now() + self.ttl + jitter)
    }
}

impl<C: CoordinatorClient> RegionCache<C> {
    /// Retrieve the region owning `key`. If there's no entry, query the
    /// coordinator and update the cache.
    pub async fn get_region_by_key(&self, key: &Key) -> Result<Arc<Region>> {
        loop {
            // Fast path: cache hit.
            let gap_bound = {
                let region_cache_guard = self.region_cache.read().await;
                let predecessor = region_cache_guard.key_to_ver_id.range(..=key).next_back();
                if let Some((start_key, candidate_ver_id)) = predecessor {
                    if let Some(cached) =
                        region_cache_guard.ver_id_to_region.get(candidate_ver_id)
                    {
                        if cached.is_fresh() && cached.region.contains(key) {
                            return Ok(cached.region.clone());
                        }
                    }
                    start_key.clone()
                } else {
                    Key::EMPTY
                }
            };

            // Slow path: join an in-flight read-through for this gap, or
            // become the loader.
            let (notify, should_fetch) = {
                let mut in_flight = self.in_flight_by_gap.lock().await;
                match in_flight.entry(gap_bound.clone()) {
                    std::collections::hash_map::Entry::Occupied(e) => (e.get().clone(), false),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let notify = Arc::new(Notify::new());
                        e.insert(notify.clone());
                        (notify, true)
                    }
                }
            };

            if !should_fetch {
                notify.notified().await;
                continue;
            }

            // We won the loader slot, but the cache may have been filled
            // between our miss and now; look once more before paying for a
            // scan.
            {
                let region_cache_guard = self.region_cache.read().await;
                if let Some((_, ver_id)) =
                    region_cache_guard.key_to_ver_id.range(..=key).next_back()
                {
                    if let Some(cached) = region_cache_guard.ver_id_to_region.get(ver_id) {
                        if cached.is_fresh() && cached.region.contains(key) {
                            let mut in_flight = self.in_flight_by_gap.lock().await;
                            in_flight.remove(&gap_bound);
                            drop(in_flight);
                            notify.notify_waiters();
                            return Ok(cached.region.clone());
                        }
                    }
                }
            }

            // Fetch from the coordinator without holding any cache locks.
            let fetched = self.read_through_region_by_key(key).await;

            // The marker comes out before anyone wakes, so a woken waiter
            // that still misses can claim the loader slot itself.
            let mut in_flight = self.in_flight_by_gap.lock().await;
            in_flight.remove(&gap_bound);
            drop(in_flight);
            notify.notify_waiters();
            return fetched;
        }
    }

    /// Force read through (query the coordinator) and update the cache.
    pub async fn read_through_region_by_key(&self, key: &Key) -> Result<Arc<Region>> {
        let start: Vec<u8> = key.clone().into();
        let end: Vec<u8> = key.next_key().into();
        let mut regions = self
            .coordinator
            .clone()
            .scan_regions(start, end, 1)
            .await?;
        let Some(region) = regions.drain(..).next() else {
            return Err(Error::RegionForKeyNotFound {
                key: key.clone().into(),
            });
        };
        if !region.contains(key) {
            return Err(Error::RegionForKeyNotFound {
                key: key.clone().into(),
            });
        }
        let region = Arc::new(region);
        self.install_region(region.clone()).await;
        Ok(region)
    }

    /// Install `region`, atomically replacing any cached region overlapping
    /// its range.
    ///
    /// The replacement only happens when `region`'s epoch supersedes every
    /// overlapping entry; a stale descriptor arriving late (e.g. a slow
    /// refresh racing a server-pushed update) leaves the cache untouched.
    /// Returns whether the region is now present in the cache.
    pub async fn install_region(&self, region: Arc<Region>) -> bool {
        let expires_at = self.entry_deadline();
        // No `.await` below this lock; the three index maps must change as
        // one unit.
        let mut cache = self.region_cache.write().await;

        let ver_id = region.ver_id();
        let epoch = region.epoch();

        let mut to_be_removed: HashSet<RegionVerId> = HashSet::new();

        if let Some(cached_ver_id) = cache.id_to_ver_id.get(&region.id()) {
            if cached_ver_id == &ver_id {
                // Same incarnation confirmed by the coordinator: renew its
                // lifetime.
                if let Some(cached) = cache.ver_id_to_region.get_mut(&ver_id) {
                    cached.expires_at = expires_at;
                }
                return true;
            }
            to_be_removed.insert(cached_ver_id.clone());
        }

        let overlapping = cache.overlapping(&region.region.start_key, region.end_key());
        to_be_removed.extend(overlapping);

        for stale_ver_id in &to_be_removed {
            let Some(cached) = cache.ver_id_to_region.get(stale_ver_id) else {
                continue;
            };
            if !epoch.is_newer_than(&cached.region.epoch()) {
                // The incoming descriptor does not supersede what we have.
                return false;
            }
        }

        for stale_ver_id in to_be_removed {
            cache.remove(&stale_ver_id);
        }

        cache
            .key_to_ver_id
            .insert(region.start_key(), ver_id.clone());
        cache.id_to_ver_id.insert(region.id(), ver_id.clone());
        cache
            .ver_id_to_region
            .insert(ver_id, CachedRegion { region, expires_at });
        true
    }

    /// Publish a leader hint for the cached region, if still present.
    pub async fn update_leader(&self, ver_id: RegionVerId, leader: metapb::Replica) {
        let expires_at = self.entry_deadline();
        let mut cache = self.region_cache.write().await;
        let Some(cached) = cache.ver_id_to_region.get_mut(&ver_id) else {
            return;
        };
        // Regions are immutable once published: swap in a fresh snapshot.
        // A store just vouched for this region, so its lifetime renews too.
        let mut updated = (*cached.region).clone();
        updated.leader = Some(leader);
        cached.region = Arc::new(updated);
        cached.expires_at = expires_at;
    }

    /// Drop the cached region if it is still present under this exact
    /// incarnation. A newer region installed concurrently is left alone.
    pub async fn invalidate_region(&self, ver_id: RegionVerId) {
        let mut cache = self.region_cache.write().await;
        cache.remove(&ver_id);
    }
}
