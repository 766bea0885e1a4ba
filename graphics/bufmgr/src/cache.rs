//! Size-class caches and the release policy
//!
//! Released objects are kept in buckets indexed by floor(log2(pages)).
//! The inactive buckets hold objects that are idle and can be handed out
//! without waiting. The active buckets (one per tiling mode) hold objects
//! that may still be referenced by an outstanding request; reusing one of
//! those means the first CPU access or tiling change may block on the GPU.
//! Objects past the last bucket go to a single large list.
//!
//! Within a bucket, entries are keyed by insertion order, so the most
//! recently released object has the highest key.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::bo::{BoId, CacheLink, ListId, RqLink};
use crate::kernel::{GemDevice, Madvise, Tiling};
use crate::kgem::{CreateFlags, Kgem};
use crate::tiling::{aligned_height, surface_size, untiled_pitch};
use crate::{cache_bucket, BoDomain, BoFlags, NUM_CACHE_BUCKETS, PAGE_SIZE};

type Bucket = BTreeMap<u64, BoId>;

pub(crate) struct Cache {
    inactive: [Bucket; NUM_CACHE_BUCKETS],
    active: [[Bucket; 3]; NUM_CACHE_BUCKETS],
    large: Bucket,
    next_key: u64,
    /// Inactive objects that keep a CPU mapping
    pub mapped: usize,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inactive: core::array::from_fn(|_| Bucket::new()),
            active: core::array::from_fn(|_| core::array::from_fn(|_| Bucket::new())),
            large: Bucket::new(),
            next_key: 0,
            mapped: 0,
        }
    }

    fn list(&self, list: ListId) -> &Bucket {
        match list {
            ListId::Inactive(bucket) => &self.inactive[bucket],
            ListId::Active(bucket, tiling) => &self.active[bucket][tiling.index()],
            ListId::Large => &self.large,
        }
    }

    fn list_mut(&mut self, list: ListId) -> &mut Bucket {
        match list {
            ListId::Inactive(bucket) => &mut self.inactive[bucket],
            ListId::Active(bucket, tiling) => &mut self.active[bucket][tiling.index()],
            ListId::Large => &mut self.large,
        }
    }

    /// Insert as the most recently used entry
    pub fn insert(&mut self, list: ListId, id: BoId) -> CacheLink {
        let key = self.next_key;
        self.next_key += 1;
        self.list_mut(list).insert(key, id);
        CacheLink { list, key }
    }

    pub fn remove(&mut self, link: CacheLink) -> Option<BoId> {
        self.list_mut(link.list).remove(&link.key)
    }

    pub fn is_empty(&self, list: ListId) -> bool {
        self.list(list).is_empty()
    }

    /// Entries from the most to the least recently released
    pub fn newest_first(&self, list: ListId) -> Vec<BoId> {
        self.list(list).values().rev().copied().collect()
    }

    /// Entries from the least to the most recently released
    pub fn oldest_first(&self, list: ListId) -> Vec<BoId> {
        self.list(list).values().copied().collect()
    }

    pub fn len(&self, list: ListId) -> usize {
        self.list(list).len()
    }

    /// Every list, inactive buckets first
    pub fn all_lists() -> impl Iterator<Item = ListId> {
        let inactive = (0..NUM_CACHE_BUCKETS).map(ListId::Inactive);
        let active = (0..NUM_CACHE_BUCKETS)
            .flat_map(|bucket| Tiling::ALL.into_iter().map(move |t| ListId::Active(bucket, t)));
        inactive.chain(active).chain(core::iter::once(ListId::Large))
    }
}

/// List an object of `bucket` goes to while it may still be busy
fn active_list(bucket: usize, tiling: Tiling) -> ListId {
    if bucket < NUM_CACHE_BUCKETS {
        ListId::Active(bucket, tiling)
    } else {
        ListId::Large
    }
}

impl<D: GemDevice> Kgem<D> {
    pub(crate) fn cache_add(&mut self, id: BoId, list: ListId) {
        let link = self.cache.insert(list, id);
        let bo = &mut self.bos[id];
        debug_assert!(bo.link.is_none());
        debug_assert_eq!(bo.refcnt, 0);
        bo.link = Some(link);
        if matches!(list, ListId::Inactive(_)) && bo.map.is_some() {
            self.cache.mapped += 1;
        }
    }

    pub(crate) fn cache_remove(&mut self, id: BoId) {
        let bo = &mut self.bos[id];
        if let Some(link) = bo.link.take() {
            self.cache.remove(link);
            if matches!(link.list, ListId::Inactive(_)) && bo.map.is_some() {
                self.cache.mapped -= 1;
            }
        }
    }

    /// Take a cached object out of its list so it can be handed out again
    fn take_from_cache(&mut self, id: BoId) {
        self.cache_remove(id);
        let bo = &mut self.bos[id];
        if bo.rq == Some(RqLink::Flushing) {
            bo.rq = None;
            self.requests.flushing.retain(|&flushing| flushing != id);
        }
        bo.delta = 0;
        bo.stamp = None;
    }

    fn unmap(&mut self, id: BoId) {
        let bo = &mut self.bos[id];
        if let Some(ptr) = bo.map.take() {
            log::trace!("releasing GTT mapping of handle={}", bo.handle);
            self.device.munmap(bo.handle, ptr, bo.size);
            if matches!(bo.link, Some(CacheLink { list: ListId::Inactive(_), .. })) {
                self.cache.mapped -= 1;
            }
        }
    }

    /// Close the kernel object and drop every piece of bookkeeping
    pub(crate) fn free(&mut self, id: BoId) {
        let bo = &self.bos[id];
        debug_assert_eq!(bo.refcnt, 0);
        debug_assert!(bo.exec.is_none());
        debug_assert!(bo.proxy.is_none());
        log::trace!("free handle={}", bo.handle);

        self.unmap(id);
        self.cache_remove(id);
        self.detach_request(id);
        if let Some(bo) = self.bos.remove(id) {
            self.device.close(bo.handle);
        }
    }

    /// Mark an idle object reclaimable; false if its pages are already gone
    pub(crate) fn set_purgeable(&mut self, id: BoId) -> bool {
        let bo = &mut self.bos[id];
        debug_assert!(bo.exec.is_none());
        if bo.flags.contains(BoFlags::PURGED) {
            return true;
        }
        match self.device.madvise(bo.handle, Madvise::DontNeed) {
            Ok(retained) => {
                bo.flags |= BoFlags::PURGED;
                self.need_purge |= !retained;
                retained
            }
            Err(_) => true,
        }
    }

    /// Revive a purged object; false if the kernel discarded its pages
    pub(crate) fn clear_purgeable(&mut self, id: BoId) -> bool {
        let bo = &mut self.bos[id];
        debug_assert!(bo.flags.contains(BoFlags::PURGED));
        match self.device.madvise(bo.handle, Madvise::WillNeed) {
            Ok(retained) => {
                bo.flags.set(BoFlags::PURGED, !retained);
                self.need_purge |= !retained;
                retained
            }
            Err(_) => false,
        }
    }

    fn is_retained(&mut self, id: BoId) -> bool {
        let bo = &self.bos[id];
        if !bo.flags.contains(BoFlags::PURGED) {
            return true;
        }
        self.device
            .madvise(bo.handle, Madvise::DontNeed)
            .unwrap_or(false)
    }

    pub(crate) fn move_to_inactive(&mut self, id: BoId) {
        let bo = &mut self.bos[id];
        debug_assert!(bo.is_reusable());
        debug_assert!(bo.rq.is_none() && bo.exec.is_none());
        debug_assert!(!bo.needs_flush());
        debug_assert!(bo.proxy.is_none() && bo.io.is_none());

        let bucket = bo.bucket();
        if bucket >= NUM_CACHE_BUCKETS {
            self.free(id);
            return;
        }
        if bo.map.is_some() && bo.size as u64 > self.limits.aperture_mappable / 2 {
            self.unmap(id);
        }
        self.bos[id].stamp = None;
        self.cache_add(id, ListId::Inactive(bucket));
        self.need_expire = true;
    }

    /// Release policy, run when the last reference to an object is dropped
    pub(crate) fn destroy(&mut self, id: BoId) {
        let bo = &mut self.bos[id];
        debug_assert_eq!(bo.refcnt, 0);
        debug_assert!(bo.link.is_none());

        if let Some(target) = bo.proxy {
            self.destroy_proxy(id, target);
            return;
        }

        if bo.io.take().is_some() {
            log::trace!("transferring partial handle={} to the cache", bo.handle);
            bo.flags |= BoFlags::REUSABLE;
        }

        if self.wedged || !bo.is_reusable() || bo.is_pinned() {
            log::trace!("handle={} not reusable", bo.handle);
            // Still referenced by the batch being built; commit closes it
            if bo.exec.is_none() {
                self.free(id);
            }
            return;
        }

        if bo.rq.is_some() {
            log::trace!("handle={} -> active", bo.handle);
            let list = active_list(bo.bucket(), bo.tiling);
            self.cache_add(id, list);
            return;
        }
        debug_assert!(bo.exec.is_none());

        if bo.needs_flush() {
            let busy = self.device.busy(bo.handle).unwrap_or(false);
            if busy {
                log::trace!("handle={} -> flushing", bo.handle);
                bo.rq = Some(RqLink::Flushing);
                let list = active_list(bo.bucket(), bo.tiling);
                self.requests.flushing.push_back(id);
                self.cache_add(id, list);
                return;
            }
            bo.flags.remove(BoFlags::NEEDS_FLUSH);
            bo.domain = BoDomain::None;
        }

        if !self.set_purgeable(id) {
            log::debug!("handle={} lost its pages, closing", self.bos[id].handle);
            self.free(id);
            return;
        }

        log::trace!("handle={} -> inactive", self.bos[id].handle);
        self.move_to_inactive(id);
    }

    /// Find a linear object of at least `num_pages` in the cache
    pub(crate) fn search_linear_cache(&mut self, num_pages: usize, flags: CreateFlags) -> Option<BoId> {
        if num_pages >= self.limits.max_cache_size / PAGE_SIZE {
            return None;
        }
        let bucket = cache_bucket(num_pages);
        if bucket >= NUM_CACHE_BUCKETS {
            return None;
        }

        let use_active = !flags.contains(CreateFlags::INACTIVE);
        let inactive = ListId::Inactive(bucket);

        if !use_active && self.cache.is_empty(inactive) {
            if flags.contains(CreateFlags::NO_RETIRE) {
                return None;
            }
            if !self.need_retire || !self.retire() {
                return None;
            }
            if self.cache.is_empty(inactive) {
                log::trace!("inactive bucket {} still empty after retire", bucket);
                return None;
            }
        }

        let want_map = flags.contains(CreateFlags::GTT_MAP);
        if !use_active && want_map {
            for id in self.cache.newest_first(inactive) {
                let bo = &self.bos[id];
                if bo.map.is_none() || num_pages > bo.num_pages() {
                    continue;
                }
                if bo.is_purged() && !self.clear_purgeable(id) {
                    self.free(id);
                    continue;
                }
                if self.bos[id].tiling.is_tiled() && !self.retile(id, Tiling::None, 0) {
                    continue;
                }

                self.take_from_cache(id);
                self.bos[id].pitch = 0;
                log::trace!("found handle={} in the mapped linear cache", self.bos[id].handle);
                return Some(id);
            }

            if flags.contains(CreateFlags::EXACT) {
                return None;
            }
        }

        let list = if use_active {
            ListId::Active(bucket, Tiling::None)
        } else {
            inactive
        };
        let mut first = None;
        for id in self.cache.newest_first(list) {
            let bo = &self.bos[id];
            debug_assert_eq!(bo.refcnt, 0);
            debug_assert_eq!(bo.rq.is_some(), use_active);
            // Released mid-batch; the batch being built still references it
            if num_pages > bo.num_pages() || bo.exec.is_some() {
                continue;
            }
            if bo.is_purged() && !self.clear_purgeable(id) {
                self.free(id);
                continue;
            }

            let bo = &self.bos[id];
            if bo.tiling.is_tiled() {
                if want_map || first.is_some() {
                    continue;
                }
                if !self.retile(id, Tiling::None, 0) {
                    continue;
                }
            }

            // Keep mappings for the callers that asked for one
            if self.bos[id].map.is_some() != want_map {
                if first.is_some() {
                    break;
                }
                first = Some(id);
                continue;
            }

            first = Some(id);
            break;
        }

        let id = first?;
        self.take_from_cache(id);
        self.bos[id].pitch = 0;
        log::trace!(
            "found handle={} ({} pages) in the linear {} cache",
            self.bos[id].handle,
            self.bos[id].num_pages(),
            if use_active { "active" } else { "inactive" }
        );
        Some(id)
    }

    /// Change the tiling of a cached object in place
    fn retile(&mut self, id: BoId, tiling: Tiling, pitch: u32) -> bool {
        let bo = &mut self.bos[id];
        debug_assert!(!bo.is_pinned());
        match self.device.set_tiling(bo.handle, tiling, pitch) {
            Ok(actual) if actual == tiling => {
                bo.tiling = tiling;
                bo.pitch = pitch;
                true
            }
            Ok(actual) => {
                bo.tiling = actual;
                false
            }
            Err(err) => {
                log::debug!("set_tiling on handle={} failed: {}", bo.handle, err);
                false
            }
        }
    }

    /// Find a cached object for a `width`x`height` surface
    ///
    /// The inactive buckets are searched first. Objects that may still be
    /// busy are only considered when `reuse_active` is set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn search_2d(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
        tiling: Tiling,
        size: usize,
        pitch: u32,
        flags: CreateFlags,
        reuse_active: bool,
    ) -> Option<BoId> {
        let num_pages = size / PAGE_SIZE;
        let bucket = cache_bucket(num_pages);
        let scanout = flags.contains(CreateFlags::SCANOUT);

        if bucket >= NUM_CACHE_BUCKETS {
            if !reuse_active {
                return None;
            }
            return self.search_large(width, height, bpp, pitch, scanout);
        }

        if flags.contains(CreateFlags::GTT_MAP) {
            if let Some(id) = self.search_mapped(bucket, num_pages, tiling, pitch) {
                return Some(id);
            }
        }

        if let Some(id) = self.search_inactive(bucket, num_pages, tiling, pitch, reuse_active) {
            return Some(id);
        }

        if !reuse_active {
            return None;
        }
        self.search_active(width, height, bpp, tiling, bucket, num_pages, pitch, flags)
    }

    fn search_large(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
        pitch: u32,
        scanout: bool,
    ) -> Option<BoId> {
        let tiled_height = aligned_height(self.limits.gen, height, Tiling::Y) as usize;
        let linear_pitch = untiled_pitch(width, bpp, scanout);

        for id in self.cache.newest_first(ListId::Large) {
            let bo = &mut self.bos[id];
            debug_assert!(!bo.is_purged());
            let candidate_pitch = if bo.tiling.is_tiled() {
                if bo.pitch < pitch {
                    continue;
                }
                bo.pitch
            } else {
                linear_pitch
            };
            if candidate_pitch as usize * tiled_height > bo.size {
                continue;
            }

            bo.pitch = candidate_pitch;
            self.take_from_cache(id);
            log::trace!("found handle={} in the large cache", self.bos[id].handle);
            return Some(id);
        }
        None
    }

    /// Prefer an idle object that already has a CPU mapping
    fn search_mapped(
        &mut self,
        bucket: usize,
        num_pages: usize,
        tiling: Tiling,
        pitch: u32,
    ) -> Option<BoId> {
        let list = ListId::Inactive(bucket);
        loop {
            let mut any_mapped = false;
            for id in self.cache.newest_first(list) {
                let bo = &self.bos[id];
                if bo.map.is_none() {
                    continue;
                }
                any_mapped = true;
                if num_pages > bo.num_pages() {
                    continue;
                }
                if bo.tiling != tiling || (tiling.is_tiled() && bo.pitch != pitch) {
                    continue;
                }
                if bo.is_purged() && !self.clear_purgeable(id) {
                    self.free(id);
                    continue;
                }

                self.take_from_cache(id);
                self.bos[id].pitch = pitch;
                log::trace!("found handle={} in the mapped cache", self.bos[id].handle);
                return Some(id);
            }

            if !any_mapped || !self.retire() {
                return None;
            }
        }
    }

    fn search_inactive(
        &mut self,
        bucket: usize,
        num_pages: usize,
        tiling: Tiling,
        pitch: u32,
        reuse_active: bool,
    ) -> Option<BoId> {
        let mut bucket = bucket;
        let mut retry = (NUM_CACHE_BUCKETS - bucket).min(3);
        let mut retired = reuse_active;

        loop {
            for id in self.cache.newest_first(ListId::Inactive(bucket)) {
                let bo = &self.bos[id];
                debug_assert!(bo.is_reusable());
                if num_pages > bo.num_pages() {
                    continue;
                }

                if bo.tiling != tiling || (tiling.is_tiled() && bo.pitch != pitch) {
                    if !self.retile(id, tiling, pitch) {
                        self.free(id);
                        continue;
                    }
                    self.unmap(id);
                }

                if self.bos[id].is_purged() && !self.clear_purgeable(id) {
                    self.free(id);
                    continue;
                }

                self.take_from_cache(id);
                let bo = &mut self.bos[id];
                bo.tiling = tiling;
                bo.pitch = pitch;
                log::trace!(
                    "from inactive: pitch={}, tiling={:?}, handle={}",
                    bo.pitch,
                    bo.tiling,
                    bo.handle
                );
                return Some(id);
            }

            // A retirement may have refilled this bucket
            if !retired && !self.requests.outstanding.is_empty() {
                retired = true;
                if self.retire() {
                    continue;
                }
            }

            retry -= 1;
            if retry == 0 {
                return None;
            }
            bucket += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn search_active(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
        tiling: Tiling,
        bucket: usize,
        num_pages: usize,
        pitch: u32,
        flags: CreateFlags,
    ) -> Option<BoId> {
        let gen = self.limits.gen;
        let exact = flags.contains(CreateFlags::EXACT);
        let scanout = flags.contains(CreateFlags::SCANOUT);

        let mut bucket = bucket;
        let mut retry = NUM_CACHE_BUCKETS - bucket;
        if retry > 3 && !flags.contains(CreateFlags::TEMPORARY) {
            retry = 3;
        }

        loop {
            let tiled_height = aligned_height(gen, height, tiling) as usize;
            for id in self.cache.newest_first(ListId::Active(bucket, tiling)) {
                let bo = &self.bos[id];
                debug_assert_eq!(bo.tiling, tiling);
                if tiling.is_tiled() && gen < 40 {
                    if bo.pitch < pitch || bo.pitch as usize * tiled_height > bo.size {
                        continue;
                    }
                } else {
                    if bo.num_pages() < num_pages {
                        continue;
                    }
                    if tiling.is_tiled() && bo.pitch != pitch && !self.retile(id, tiling, pitch) {
                        continue;
                    }
                    self.bos[id].pitch = pitch;
                }

                self.take_from_cache(id);
                log::trace!(
                    "from active: pitch={}, tiling={:?}, handle={}",
                    self.bos[id].pitch,
                    tiling,
                    self.bos[id].handle
                );
                return Some(id);
            }

            retry -= 1;
            if retry == 0 || !exact {
                break;
            }

            if gen >= 40 {
                for other in Tiling::ALL.into_iter().filter(|&other| other != tiling) {
                    for id in self.cache.newest_first(ListId::Active(bucket, other)) {
                        if self.bos[id].num_pages() < num_pages {
                            continue;
                        }
                        if !self.retile(id, tiling, pitch) {
                            continue;
                        }
                        self.take_from_cache(id);
                        log::trace!("from active, retiled: handle={}", self.bos[id].handle);
                        return Some(id);
                    }
                }
            }

            bucket += 1;
            if bucket >= NUM_CACHE_BUCKETS {
                break;
            }
        }

        if exact {
            return None;
        }

        // Accept a near-miss with a less demanding tiling
        let linear_pitch = untiled_pitch(width, bpp, scanout);
        let relaxed = self.limits.has_relaxed_fencing;
        let (size, _) = surface_size(gen, relaxed, scanout, width, height, bpp, tiling)?;
        let bucket = cache_bucket(size / PAGE_SIZE);
        if bucket >= NUM_CACHE_BUCKETS {
            return None;
        }
        for lower in Tiling::ALL.into_iter().filter(|&lower| lower < tiling).rev() {
            let tiled_height = aligned_height(gen, height, lower) as usize;
            for id in self.cache.newest_first(ListId::Active(bucket, lower)) {
                let bo = &mut self.bos[id];
                let candidate_pitch = if bo.tiling.is_tiled() {
                    if bo.pitch < pitch {
                        continue;
                    }
                    bo.pitch
                } else {
                    linear_pitch
                };
                if candidate_pitch as usize * tiled_height > bo.size {
                    continue;
                }

                bo.pitch = candidate_pitch;
                self.take_from_cache(id);
                log::trace!("from active, near miss: handle={}", self.bos[id].handle);
                return Some(id);
            }
        }

        None
    }

    /// Close the GTT mappings of the least recently used inactive objects
    pub(crate) fn trim_mappings(&mut self) {
        let limit = self.config.policy.max_cached_maps;
        if self.cache.mapped < limit {
            return;
        }
        if self.need_purge {
            self.purge_cache();
        }

        'buckets: for bucket in 0..NUM_CACHE_BUCKETS {
            for id in self.cache.oldest_first(ListId::Inactive(bucket)) {
                if self.cache.mapped < limit {
                    break 'buckets;
                }
                if self.bos[id].map.is_none() {
                    continue;
                }
                log::trace!("discarding cached mapping of handle={}", self.bos[id].handle);
                self.unmap(id);
                if !self.bos[id].is_purged() && !self.set_purgeable(id) {
                    self.free(id);
                }
            }
        }
    }

    /// Close inactive objects whose pages were reclaimed by the kernel
    pub fn purge_cache(&mut self) {
        for bucket in 0..NUM_CACHE_BUCKETS {
            for id in self.cache.oldest_first(ListId::Inactive(bucket)) {
                if !self.is_retained(id) {
                    log::debug!("purging handle={}", self.bos[id].handle);
                    self.free(id);
                }
            }
        }
        self.need_purge = false;
    }

    /// Age the inactive cache and close entries idle for the grace period
    ///
    /// Meant to be called from an idle timer. The first pass stamps new
    /// entries, so an object is closed at the earliest by the second call
    /// made at least the grace period later. Returns true while more work
    /// remains, false once the cache is idle.
    pub fn expire_cache(&mut self) -> bool {
        self.reap();
        self.retire();
        if self.wedged {
            self.cleanup();
        }
        self.expire_partials();
        if self.need_purge {
            self.purge_cache();
        }

        let now = Instant::now();
        let grace = self.config.policy.inactive_grace;
        let preserve = self.config.policy.map_preserve;

        let mut stamped = false;
        let mut idle = !self.need_retire;
        for bucket in 0..NUM_CACHE_BUCKETS {
            let list = ListId::Inactive(bucket);
            idle &= self.cache.is_empty(list);
            for id in self.cache.newest_first(list) {
                let bo = &mut self.bos[id];
                if bo.stamp.is_some() {
                    stamped = true;
                    break;
                }
                bo.stamp = Some(now);
            }
        }
        if idle {
            log::debug!("expire_cache: idle");
            self.need_expire = false;
            return false;
        }
        let cutoff = match now.checked_sub(grace) {
            Some(cutoff) if stamped => cutoff,
            _ => return true,
        };

        let mut count = 0;
        let mut bytes = 0;
        let mut idle = !self.need_retire;
        for bucket in 0..NUM_CACHE_BUCKETS {
            for id in self.cache.oldest_first(ListId::Inactive(bucket)) {
                let bo = &self.bos[id];
                let stamp = bo.stamp.unwrap_or(now);
                if stamp > cutoff {
                    idle = false;
                    break;
                }

                // Mapped entries stay where they are, still the oldest
                if bo.map.is_some() && stamp + preserve > cutoff {
                    idle = false;
                    continue;
                }
                count += 1;
                bytes += bo.size;
                log::trace!("expiring handle={}", bo.handle);
                self.free(id);
            }
        }

        log::debug!(
            "expire_cache: expired {} objects, {} bytes, idle? {}",
            count,
            bytes,
            idle
        );
        self.need_expire = !idle;
        !idle
    }

    /// Drop every cached object
    ///
    /// Waits for the outstanding requests, retires them and closes all
    /// idle objects. Used at shutdown and after a hang.
    pub fn cleanup_cache(&mut self) {
        self.reap();
        if let Some(anchor) = self.requests.outstanding.back().and_then(|rq| rq.anchor) {
            log::debug!("cleanup_cache: syncing on the last request");
            let handle = self.bos[anchor].handle;
            if let Err(err) = self.device.set_domain(handle, crate::Domain::GTT, crate::Domain::GTT) {
                log::debug!("cleanup_cache: sync on handle={} failed: {}", handle, err);
            }
        }

        self.retire();
        self.cleanup();
        self.expire_partials();

        for list in Cache::all_lists() {
            for id in self.cache.oldest_first(list) {
                if self.bos[id].exec.is_none() {
                    self.free(id);
                }
            }
        }

        self.need_purge = false;
        self.need_expire = false;
    }

    /// Objects held by the caches, busy ones included
    pub fn cached_objects(&self) -> usize {
        Cache::all_lists().map(|list| self.cache.len(list)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(arena: &mut crate::bo::BoArena, handle: u32) -> BoId {
        arena.insert(crate::bo::Bo::new(handle, PAGE_SIZE))
    }

    #[test]
    fn test_bucket_order() {
        let mut arena = crate::bo::BoArena::default();
        let (a, b, c) = (id(&mut arena, 1), id(&mut arena, 2), id(&mut arena, 3));

        let mut cache = Cache::new();
        let list = ListId::Inactive(0);
        let link_a = cache.insert(list, a);
        cache.insert(list, b);
        cache.insert(list, c);

        assert_eq!(cache.newest_first(list), vec![c, b, a]);
        assert_eq!(cache.oldest_first(list), vec![a, b, c]);

        assert_eq!(cache.remove(link_a), Some(a));
        assert_eq!(cache.oldest_first(list), vec![b, c]);
        assert_eq!(cache.len(list), 2);
    }

    #[test]
    fn test_lists_are_independent() {
        let mut arena = crate::bo::BoArena::default();
        let a = id(&mut arena, 1);

        let mut cache = Cache::new();
        cache.insert(ListId::Active(3, Tiling::X), a);
        assert!(cache.is_empty(ListId::Active(3, Tiling::None)));
        assert!(cache.is_empty(ListId::Inactive(3)));
        assert!(!cache.is_empty(ListId::Active(3, Tiling::X)));
        assert_eq!(Cache::all_lists().count(), NUM_CACHE_BUCKETS * 4 + 1);
    }

    #[test]
    fn test_active_list_for_large_objects() {
        assert_eq!(active_list(2, Tiling::Y), ListId::Active(2, Tiling::Y));
        assert_eq!(active_list(NUM_CACHE_BUCKETS, Tiling::X), ListId::Large);
    }
}
