//! Buffer objects
//!
//! Every buffer object lives in a slot of [`BoArena`] and is addressed by a
//! generation-checked [`BoId`]. Callers hold a [`BoRef`], which owns one
//! reference; dropping it queues the reference for release so that the
//! cache policy runs on the next call into the owning context.

use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use spin::Mutex;

use crate::kernel::{Handle, Tiling};
use crate::partial::BufferFlags;
use crate::{cache_bucket, num_pages};

bitflags! {
    /// Independent state flags of a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoFlags: u32 {
        /// May re-enter the cache when the last reference is released
        const REUSABLE = 1 << 0;
        /// Exempt from retiling and from cache return
        const PINNED = 1 << 1;
        /// Written by the GPU in the current batch
        const DIRTY = 1 << 2;
        /// A GPU write is not yet visible to other consumers
        const NEEDS_FLUSH = 1 << 3;
        /// Marked reclaimable with the kernel; contents are undefined
        const PURGED = 1 << 4;
    }
}

/// Last domain the object was moved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoDomain {
    #[default]
    None,
    Cpu,
    Gtt,
    Gpu,
}

/// Stable, generation-checked address of a buffer object slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoId {
    index: u32,
    generation: u32,
}

/// Which kind of outstanding work keeps the object busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RqLink {
    /// Member of the request with this id
    Request(u64),
    /// Released while a GPU write was still being flushed
    Flushing,
}

/// Place of the object in the current batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecSlot {
    /// Index into the exec object list
    Object(usize),
    /// A proxy whose target has been referenced by a batch
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    Inactive(usize),
    Active(usize, Tiling),
    Large,
}

/// Position of a cached object in one of the free lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CacheLink {
    pub list: ListId,
    pub key: u64,
}

/// CPU staging memory of a partial buffer
#[derive(Debug)]
pub(crate) struct IoBuffer {
    pub mem: Vec<u8>,
    /// Bytes handed out so far
    pub used: usize,
    /// Write and in-place bits the buffer was created with; empty for
    /// download buffers
    pub write: BufferFlags,
    /// Staged data has not been written to the object yet
    pub need_io: bool,
}

/// One GPU-addressable allocation
#[derive(Debug)]
pub struct Bo {
    pub(crate) handle: Handle,
    pub(crate) unique_id: u32,
    pub(crate) size: usize,
    pub(crate) tiling: Tiling,
    pub(crate) pitch: u32,
    pub(crate) refcnt: u32,
    pub(crate) flags: BoFlags,
    pub(crate) domain: BoDomain,
    pub(crate) presumed_offset: u64,
    /// Byte offset of a proxy inside its target
    pub(crate) delta: u32,
    pub(crate) proxy: Option<BoId>,
    pub(crate) exec: Option<ExecSlot>,
    pub(crate) rq: Option<RqLink>,
    pub(crate) link: Option<CacheLink>,
    pub(crate) map: Option<*mut u8>,
    /// When the object entered the inactive list, set by the expiry pass
    pub(crate) stamp: Option<Instant>,
    pub(crate) io: Option<Box<IoBuffer>>,
    /// Proxy into a partial buffer
    pub(crate) is_io: bool,
}

impl Bo {
    pub(crate) fn new(handle: Handle, size: usize) -> Self {
        Self {
            handle,
            unique_id: 0,
            size,
            tiling: Tiling::None,
            pitch: 0,
            refcnt: 1,
            flags: BoFlags::REUSABLE,
            domain: BoDomain::None,
            presumed_offset: 0,
            delta: 0,
            proxy: None,
            exec: None,
            rq: None,
            link: None,
            map: None,
            stamp: None,
            io: None,
            is_io: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_pages(&self) -> usize {
        num_pages(self.size)
    }

    pub fn tiling(&self) -> Tiling {
        self.tiling
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn refcount(&self) -> u32 {
        self.refcnt
    }

    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    pub fn domain(&self) -> BoDomain {
        self.domain
    }

    pub fn presumed_offset(&self) -> u64 {
        self.presumed_offset
    }

    /// Offset of a proxy inside its target
    pub fn delta(&self) -> u32 {
        self.delta
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn is_reusable(&self) -> bool {
        self.flags.contains(BoFlags::REUSABLE)
    }

    pub fn is_pinned(&self) -> bool {
        self.flags.contains(BoFlags::PINNED)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(BoFlags::DIRTY)
    }

    pub fn needs_flush(&self) -> bool {
        self.flags.contains(BoFlags::NEEDS_FLUSH)
    }

    pub fn is_purged(&self) -> bool {
        self.flags.contains(BoFlags::PURGED)
    }

    /// Referenced by the batch under construction
    pub fn in_batch(&self) -> bool {
        self.exec.is_some()
    }

    /// Possibly still referenced by a submitted, unretired batch
    pub fn in_request(&self) -> bool {
        self.rq.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub(crate) fn bucket(&self) -> usize {
        cache_bucket(self.num_pages())
    }

    pub(crate) fn exec_index(&self) -> Option<usize> {
        match self.exec {
            Some(ExecSlot::Object(index)) => Some(index),
            _ => None,
        }
    }
}

struct Slot {
    generation: u32,
    bo: Option<Bo>,
}

/// Slot storage for buffer objects
#[derive(Default)]
pub(crate) struct BoArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl BoArena {
    pub fn insert(&mut self, bo: Bo) -> BoId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.bo.is_none());
            slot.bo = Some(bo);
            return BoId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            bo: Some(bo),
        });
        BoId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: BoId) -> Option<&Bo> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.bo.as_ref())
    }

    pub fn get_mut(&mut self, id: BoId) -> Option<&mut Bo> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.bo.as_mut())
    }

    /// Remove an object; its id is never valid again
    pub fn remove(&mut self, id: BoId) -> Option<Bo> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let bo = slot.bo.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(bo)
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

impl Index<BoId> for BoArena {
    type Output = Bo;

    fn index(&self, id: BoId) -> &Bo {
        match self.get(id) {
            Some(bo) => bo,
            None => panic!("stale buffer object {:?}", id),
        }
    }
}

impl IndexMut<BoId> for BoArena {
    fn index_mut(&mut self, id: BoId) -> &mut Bo {
        match self.get_mut(id) {
            Some(bo) => bo,
            None => panic!("stale buffer object {:?}", id),
        }
    }
}

/// References dropped by callers, waiting to be released
pub(crate) type ReleaseQueue = Mutex<Vec<BoId>>;

/// An owned reference to a buffer object
///
/// Obtained from the allocation calls of [`crate::Kgem`]. A `BoRef` is not
/// `Clone`; take another reference with [`crate::Kgem::bo_reference`].
/// Dropping it (or passing it to [`crate::Kgem::bo_release`]) gives the
/// reference back, and the last release hands the object to the cache.
pub struct BoRef {
    id: BoId,
    releases: Option<Arc<ReleaseQueue>>,
}

impl BoRef {
    pub(crate) fn new(id: BoId, releases: &Arc<ReleaseQueue>) -> Self {
        Self {
            id,
            releases: Some(Arc::clone(releases)),
        }
    }

    pub fn id(&self) -> BoId {
        self.id
    }

    pub(crate) fn belongs_to(&self, releases: &Arc<ReleaseQueue>) -> bool {
        self.releases
            .as_ref()
            .map_or(false, |queue| Arc::ptr_eq(queue, releases))
    }

    /// Give up ownership without queueing a release
    pub(crate) fn into_id(mut self) -> BoId {
        self.releases = None;
        self.id
    }
}

impl Drop for BoRef {
    fn drop(&mut self) {
        if let Some(queue) = self.releases.take() {
            queue.lock().push(self.id);
        }
    }
}

impl core::fmt::Debug for BoRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("BoRef").field(&self.id).finish()
    }
}
