//! Device context
//!
//! [`Kgem`] owns the buffer objects, the caches, the outstanding requests
//! and the batch under construction of one device. Every operation runs on
//! the thread that owns the context; references dropped elsewhere are only
//! queued and processed on the next call.

use std::sync::Arc;

use bitflags::bitflags;

use crate::batch::{Batch, RelocDomains};
use crate::bo::{Bo, BoArena, BoId, BoRef, ReleaseQueue};
use crate::cache::Cache;
use crate::config::{CachePolicy, DeviceConfig, Limits};
use crate::kernel::{Domain, GemDevice, Handle, Ring, Tiling};
use crate::request::Requests;
use crate::tiling::{self, CanCreate};
use crate::{
    num_pages, page_align, BoDomain, BoFlags, Error, Result, BLT_SRC_TILED, BLT_WRITE_ALPHA,
    BLT_WRITE_RGB, MAX_SHORT, XY_SRC_COPY_BLT_CMD,
};

bitflags! {
    /// Placement hints of an allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateFlags: u32 {
        /// The requested tiling is mandatory, do not accept a near miss
        const EXACT = 1 << 0;
        /// Only accept idle objects, never stall on the GPU
        const INACTIVE = 1 << 1;
        /// The caller is going to map the object
        const GTT_MAP = 1 << 2;
        /// The object will be scanned out
        const SCANOUT = 1 << 3;
        /// Short-lived object; look further for a cached fit
        const TEMPORARY = 1 << 4;
        /// Do not retire requests while searching the cache
        const NO_RETIRE = 1 << 5;
    }
}

/// Intended CPU access of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    ReadWrite,
}

/// Buffer manager of one device
pub struct Kgem<D: GemDevice> {
    pub(crate) device: D,
    pub(crate) config: DeviceConfig,
    pub(crate) limits: Limits,

    pub(crate) bos: BoArena,
    pub(crate) releases: Arc<ReleaseQueue>,
    pub(crate) cache: Cache,
    pub(crate) requests: Requests,
    pub(crate) batch: Batch,
    /// Partial buffers open for sub-allocation, most free space first
    pub(crate) partials: Vec<BoId>,
    next_unique_id: u32,

    pub(crate) wedged: bool,
    pub(crate) need_expire: bool,
    pub(crate) need_purge: bool,
    pub(crate) need_retire: bool,
}

impl<D: GemDevice> Kgem<D> {
    pub fn new(mut device: D, config: DeviceConfig) -> Self {
        let limits = Limits::probe(&mut device, &config);
        log::info!(
            "bufmgr: gen {}, aperture {} KiB (mappable {} KiB), {} fences, llc? {}, relaxed fencing? {}",
            limits.gen,
            limits.aperture_total / 1024,
            limits.aperture_mappable / 1024,
            limits.fence_max,
            limits.has_llc,
            limits.has_relaxed_fencing
        );
        log::info!(
            "bufmgr: max object {} KiB, max gpu {} KiB, max cpu {} KiB, large {} KiB, partial {} KiB",
            limits.max_object_size / 1024,
            limits.max_gpu_size / 1024,
            limits.max_cpu_size / 1024,
            limits.large_object_size / 1024,
            limits.partial_buffer_size / 1024
        );

        let batch = Batch::new(limits.max_batch_size);
        let mut kgem = Self {
            device,
            config,
            limits,
            bos: BoArena::default(),
            releases: Arc::new(ReleaseQueue::new(Vec::new())),
            cache: Cache::new(),
            requests: Requests::new(),
            batch,
            partials: Vec::new(),
            next_unique_id: 0,
            wedged: false,
            need_expire: false,
            need_purge: false,
            need_retire: false,
        };

        // A hung GPU from a previous client reports itself here
        if let Err(err) = kgem.device.throttle() {
            if err.errno == syscall::error::EIO {
                kgem.wedge();
            } else {
                log::warn!("bufmgr: initial throttle failed: {}", err);
            }
        }
        kgem
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.config.policy
    }

    /// Change which allocations may reuse objects that are possibly busy
    pub fn set_policy(&mut self, policy: CachePolicy) {
        log::debug!("bufmgr: cache policy {:?}", policy);
        self.config.policy = policy;
    }

    /// Acceleration is permanently disabled after a GPU hang
    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    /// Buffer objects currently tracked, cached ones included
    pub fn live_objects(&self) -> usize {
        self.bos.len()
    }

    /// Process references dropped since the last call
    pub(crate) fn reap(&mut self) {
        let released = core::mem::take(&mut *self.releases.lock());
        for id in released {
            self.unref(id);
        }
    }

    pub(crate) fn unref(&mut self, id: BoId) {
        let bo = &mut self.bos[id];
        debug_assert!(bo.refcnt > 0, "double release of handle={}", bo.handle);
        bo.refcnt -= 1;
        if bo.refcnt == 0 {
            self.destroy(id);
        }
    }

    /// Wrap an object holding exactly one reference for the caller
    pub(crate) fn hand_out(&mut self, id: BoId) -> BoRef {
        self.next_unique_id = self.next_unique_id.wrapping_add(1);
        if self.next_unique_id == 0 {
            self.next_unique_id = 1;
        }
        let bo = &mut self.bos[id];
        debug_assert_eq!(bo.refcnt, 1);
        bo.unique_id = self.next_unique_id;
        BoRef::new(id, &self.releases)
    }

    /// Object whose handle backs `id`
    pub(crate) fn target_of(&self, id: BoId) -> BoId {
        self.bos[id].proxy.unwrap_or(id)
    }

    /// A hung GPU runs nothing, so nothing is busy once wedged
    pub(crate) fn kernel_busy(&mut self, handle: Handle) -> bool {
        if self.wedged {
            return false;
        }
        self.device.busy(handle).unwrap_or(false)
    }

    /// Create a kernel object holding one reference
    pub(crate) fn create_object(&mut self, size: usize) -> Option<BoId> {
        debug_assert_eq!(size, page_align(size));
        match self.device.create(size) {
            Ok(handle) => {
                log::trace!("created handle={} of {} bytes", handle, size);
                Some(self.bos.insert(Bo::new(handle, size)))
            }
            Err(err) => {
                log::debug!("create of {} bytes failed: {}", size, err);
                None
            }
        }
    }

    /// View of `length` bytes of `target` starting at `offset`
    ///
    /// A proxy of a proxy points at the underlying object directly.
    pub(crate) fn create_proxy_id(&mut self, target: BoId, offset: usize, length: usize) -> Option<BoId> {
        let (target, offset) = match self.bos[target].proxy {
            Some(base) => (base, offset + self.bos[target].delta as usize),
            None => (target, offset),
        };

        let bo = &self.bos[target];
        if length == 0 || offset + length > bo.size {
            log::debug!(
                "proxy [{}, {}) out of range of handle={} ({} bytes)",
                offset,
                offset + length,
                bo.handle,
                bo.size
            );
            return None;
        }

        let mut proxy = Bo::new(bo.handle, length);
        proxy.flags = bo.flags & BoFlags::DIRTY;
        proxy.tiling = bo.tiling;
        proxy.pitch = bo.pitch;
        proxy.presumed_offset = bo.presumed_offset;
        proxy.is_io = bo.io.is_some();
        proxy.delta = offset as u32;
        proxy.proxy = Some(target);
        log::trace!("proxy of handle={} at {}+{}", bo.handle, offset, length);

        self.bos[target].refcnt += 1;
        Some(self.bos.insert(proxy))
    }

    /// Allocate a linear object of at least `size` bytes
    ///
    /// Idle cached objects are preferred; objects that may still be busy
    /// are only reused when the cache policy allows it and the call does
    /// not ask for [`CreateFlags::INACTIVE`].
    pub fn create_linear(&mut self, size: usize, flags: CreateFlags) -> Option<BoRef> {
        if self.wedged {
            return None;
        }
        self.alloc_linear(size, flags).map(|id| self.hand_out(id))
    }

    pub(crate) fn alloc_linear(&mut self, size: usize, flags: CreateFlags) -> Option<BoId> {
        self.reap();
        if size == 0 || size > self.limits.max_object_size {
            log::debug!("create_linear: unsupported size {}", size);
            return None;
        }
        let size = page_align(size);
        let pages = num_pages(size);

        let mut found = self.search_linear_cache(pages, flags | CreateFlags::INACTIVE);
        if found.is_none() && !flags.contains(CreateFlags::INACTIVE) && self.config.policy.linear_reuse_active {
            found = self.search_linear_cache(pages, flags);
        }
        if let Some(id) = found {
            self.bos[id].refcnt = 1;
            return Some(id);
        }

        self.create_object(size)
    }

    /// Allocate a `width`x`height` surface of `bpp` bits per pixel
    ///
    /// `tiling` is a preference; the layout actually used may differ and is
    /// reported by [`Bo::tiling`]. Returns `None` when the surface is larger
    /// than the device can address or the kernel refuses the allocation.
    pub fn create_2d(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
        tiling: Tiling,
        flags: CreateFlags,
    ) -> Option<BoRef> {
        if self.wedged {
            return None;
        }
        self.reap();
        if width == 0 || height == 0 || width > MAX_SHORT || height > MAX_SHORT {
            log::debug!("create_2d: unsupported size {}x{}", width, height);
            return None;
        }
        if bpp == 0 || bpp % 8 != 0 {
            log::debug!("create_2d: unsupported bpp {}", bpp);
            return None;
        }

        let gen = self.limits.gen;
        let choice = tiling::choose_tiling(gen, tiling, width, height, bpp);
        let mut flags = flags;
        if choice.exact {
            flags |= CreateFlags::EXACT;
        }
        let tiling = choice.tiling;
        let scanout = flags.contains(CreateFlags::SCANOUT);
        let relaxed = self.limits.has_relaxed_fencing;
        let Some((size, pitch)) =
            tiling::surface_size(gen, relaxed, scanout, width, height, bpp, tiling)
        else {
            log::debug!("create_2d: no valid pitch for {}x{}x{}", width, height, bpp);
            return None;
        };
        if size > self.limits.max_object_size {
            log::debug!(
                "create_2d: {} bytes exceeds the maximum of {}",
                size,
                self.limits.max_object_size
            );
            return None;
        }
        log::trace!(
            "create_2d: {}x{}x{} tiling={:?} size={} pitch={} flags={:?}",
            width,
            height,
            bpp,
            tiling,
            size,
            pitch,
            flags
        );

        let reuse_active =
            !flags.contains(CreateFlags::INACTIVE) && self.config.policy.surface_reuse_active;
        if let Some(id) = self.search_2d(width, height, bpp, tiling, size, pitch, flags, reuse_active) {
            self.bos[id].refcnt = 1;
            return Some(self.hand_out(id));
        }

        let id = self.create_object(size)?;
        let handle = self.bos[id].handle;
        let mut pitch = pitch;
        if tiling.is_tiled() {
            let actual = match self.device.set_tiling(handle, tiling, pitch) {
                Ok(actual) => actual,
                Err(err) => {
                    log::debug!("set_tiling on new handle={} failed: {}", handle, err);
                    Tiling::None
                }
            };
            if actual != tiling {
                // The pitch has to follow the layout the kernel kept
                match tiling::surface_size(gen, relaxed, scanout, width, height, bpp, actual) {
                    Some((needed, actual_pitch)) if needed <= size => pitch = actual_pitch,
                    _ => {
                        log::debug!("create_2d: handle={} unusable as {:?}", handle, actual);
                        self.bos[id].refcnt = 0;
                        self.free(id);
                        return None;
                    }
                }
            }
            self.bos[id].tiling = actual;
        }
        self.bos[id].pitch = pitch;
        Some(self.hand_out(id))
    }

    /// Where a surface of this shape could live, if anywhere
    pub fn can_create_2d(&self, width: u32, height: u32, depth: u32) -> CanCreate {
        tiling::can_create_2d(&self.limits, width, height, depth)
    }

    /// Linear view of `length` bytes of `bo` starting at `offset`
    ///
    /// The proxy shares the kernel handle of `bo` and keeps it alive.
    pub fn create_proxy(&mut self, bo: &BoRef, offset: usize, length: usize) -> Option<BoRef> {
        debug_assert!(bo.belongs_to(&self.releases));
        if self.wedged {
            return None;
        }
        self.reap();
        let id = self.create_proxy_id(bo.id(), offset, length)?;
        Some(self.hand_out(id))
    }

    pub fn bo(&self, bo: &BoRef) -> &Bo {
        &self.bos[bo.id()]
    }

    /// Take another reference
    pub fn bo_reference(&mut self, bo: &BoRef) -> BoRef {
        let id = bo.id();
        self.bos[id].refcnt += 1;
        BoRef::new(id, &self.releases)
    }

    /// Give a reference back now rather than on the next call
    pub fn bo_release(&mut self, bo: BoRef) {
        self.reap();
        let id = bo.into_id();
        self.unref(id);
    }

    /// Keep the object out of the caches and away from retiling
    pub fn pin(&mut self, bo: &BoRef) {
        let id = self.target_of(bo.id());
        self.bos[id].flags |= BoFlags::PINNED;
    }

    /// Copy `data` to the start of the object
    ///
    /// Fails with [`Error::Busy`] while the GPU still uses the object.
    pub fn bo_write(&mut self, bo: &BoRef, data: &[u8]) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        self.reap();
        let id = bo.id();
        if data.len() > self.bos[id].size {
            return Err(Error::InvalidParameter);
        }
        let offset = self.bos[id].delta as usize;
        let target = self.target_of(id);
        let handle = self.bos[target].handle;
        debug_assert!(!self.bos[target].is_purged());

        if self.kernel_busy(handle) {
            log::debug!("bo_write: handle={} is busy", handle);
            return Err(Error::Busy);
        }
        self.device.pwrite(handle, offset, data)?;

        self.bo_retire(target);
        let bo = &mut self.bos[target];
        bo.domain = BoDomain::None;
        bo.flags.remove(BoFlags::NEEDS_FLUSH);
        Ok(())
    }

    /// Copy the start of the object into `dst`
    ///
    /// Submits the batch if it references the object.
    pub fn bo_read(&mut self, bo: &BoRef, dst: &mut [u8]) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        self.reap();
        let id = bo.id();
        if dst.len() > self.bos[id].size {
            return Err(Error::InvalidParameter);
        }
        let offset = self.bos[id].delta as usize;
        let target = self.target_of(id);
        self.bo_submit(target);
        if self.wedged {
            return Err(Error::Wedged);
        }

        let handle = self.bos[target].handle;
        self.device.pread(handle, offset, dst)?;
        self.bo_retire(target);
        Ok(())
    }

    /// Map the object through the GTT
    ///
    /// The batch is submitted first if it references the object, and the
    /// call waits until the GPU is done with it. The mapping stays valid
    /// until the object is closed; it is kept when the object is cached.
    pub fn bo_map(&mut self, bo: &BoRef, access: MapAccess) -> Result<*mut u8> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        self.reap();
        let id = bo.id();
        let delta = self.bos[id].delta as usize;
        let target = self.target_of(id);
        self.bo_submit(target);
        if self.wedged {
            return Err(Error::Wedged);
        }

        let ptr = match self.bos[target].map {
            Some(ptr) => ptr,
            None => {
                self.trim_mappings();
                let bo = &self.bos[target];
                let (handle, size) = (bo.handle, bo.size);
                let ptr = self.device.mmap_gtt(handle, size)?;
                log::trace!("mapped handle={} ({} bytes)", handle, size);
                self.bos[target].map = Some(ptr);
                ptr
            }
        };

        if self.bos[target].domain != BoDomain::Gtt {
            let write = match access {
                MapAccess::Read => Domain::empty(),
                MapAccess::ReadWrite => {
                    // Let completed work drop out of the request first
                    if self.bos[target].is_dirty() || self.bos[target].rq.is_some() {
                        self.retire();
                    }
                    Domain::GTT
                }
            };
            let handle = self.bos[target].handle;
            self.device.set_domain(handle, Domain::GTT, write)?;
            self.bo_retire(target);
            self.bos[target].domain = BoDomain::Gtt;
        }

        Ok(ptr.wrapping_add(delta))
    }

    /// Wait for the GPU and move the object to the CPU domain
    pub fn bo_sync_cpu(&mut self, bo: &BoRef) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        self.reap();
        let target = self.target_of(bo.id());
        self.bo_submit(target);
        if self.wedged {
            return Err(Error::Wedged);
        }

        if self.bos[target].domain != BoDomain::Cpu {
            let handle = self.bos[target].handle;
            self.device.set_domain(handle, Domain::CPU, Domain::CPU)?;
            self.bo_retire(target);
            self.bos[target].domain = BoDomain::Cpu;
        }
        Ok(())
    }

    /// Make pending GPU writes to the object visible to other clients
    pub fn bo_flush(&mut self, bo: &BoRef) {
        let target = self.target_of(bo.id());
        if !self.bos[target].needs_flush() {
            return;
        }
        self.bo_submit(target);
        if self.wedged {
            return;
        }
        // The busy query makes the kernel emit the flush
        let handle = self.bos[target].handle;
        let busy = self.kernel_busy(handle);
        log::trace!("bo_flush: handle={}, busy? {}", handle, busy);
        self.bos[target].flags.remove(BoFlags::NEEDS_FLUSH);
    }

    /// Whether the object may still be in use by the GPU
    ///
    /// Polls the kernel and retires the request once the object is idle.
    pub fn is_busy(&mut self, bo: &BoRef) -> bool {
        self.reap();
        let target = self.target_of(bo.id());
        if self.bos[target].rq.is_none() {
            return false;
        }
        if self.bos[target].exec.is_some() {
            return true;
        }
        let handle = self.bos[target].handle;
        if !self.kernel_busy(handle) {
            self.bo_retire(target);
        }
        self.bos[target].rq.is_some()
    }

    /// Copy `src` into a new linear object with the given pitch
    ///
    /// The copy is emitted as a blit into the current batch, so the new
    /// object is only valid once that batch executes.
    pub fn replace_bo(
        &mut self,
        src: &BoRef,
        width: u32,
        height: u32,
        pitch: u32,
        bpp: u32,
    ) -> Option<BoRef> {
        if self.wedged {
            return None;
        }
        log::debug!(
            "replace_bo: handle={} -> {}x{} pitch={} bpp={}",
            self.bos[src.id()].handle,
            width,
            height,
            pitch,
            bpp
        );
        let dst = self.create_linear(pitch as usize * height as usize, CreateFlags::empty())?;
        self.bos[dst.id()].pitch = pitch;

        self.set_mode(Ring::Blt);
        if !self.check_batch(8) || !self.check_reloc(2) || !self.check_many_bo_fenced(&[src, &dst]) {
            self.submit();
            self.set_mode(Ring::Blt);
        }

        let src_bo = &self.bos[self.target_of(src.id())];
        let mut br00 = XY_SRC_COPY_BLT_CMD;
        let mut br13 = pitch;
        let mut src_pitch = src_bo.pitch;
        if self.limits.gen >= 40 && src_bo.tiling.is_tiled() {
            br00 |= BLT_SRC_TILED;
            src_pitch >>= 2;
        }
        br13 |= 0xcc << 16;
        match bpp {
            8 => {}
            16 => br13 |= 1 << 24,
            _ => {
                br00 |= BLT_WRITE_ALPHA | BLT_WRITE_RGB;
                br13 |= 3 << 24;
            }
        }

        let emitted = self
            .emit(&[br00, br13, 0, height << 16 | width])
            .and_then(|()| self.emit_reloc(Some(&dst), RelocDomains::write(Domain::RENDER).fenced(), 0))
            .and_then(|()| self.emit(&[0, src_pitch]))
            .and_then(|()| self.emit_reloc(Some(src), RelocDomains::read(Domain::RENDER).fenced(), 0));
        if let Err(err) = emitted {
            log::warn!("replace_bo: failed to emit the copy: {}", err);
            return None;
        }
        Some(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn kgem() -> Kgem<SimDevice> {
        Kgem::new(SimDevice::default(), DeviceConfig::new(60))
    }

    #[test]
    fn test_unique_ids_increase() {
        let mut kgem = kgem();
        let a = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
        let b = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
        assert!(kgem.bo(&b).unique_id() > kgem.bo(&a).unique_id());
        assert_ne!(kgem.bo(&a).handle(), kgem.bo(&b).handle());
    }

    #[test]
    fn test_linear_size_is_page_aligned() {
        let mut kgem = kgem();
        let bo = kgem.create_linear(10_000, CreateFlags::empty()).unwrap();
        assert_eq!(kgem.bo(&bo).size(), 3 * 4096);
        assert_eq!(kgem.bo(&bo).refcount(), 1);
        assert!(kgem.create_linear(0, CreateFlags::empty()).is_none());
    }

    #[test]
    fn test_proxy_of_proxy_collapses() {
        let mut kgem = kgem();
        let base = kgem.create_linear(65536, CreateFlags::empty()).unwrap();
        let outer = kgem.create_proxy(&base, 1024, 4096).unwrap();
        let inner = kgem.create_proxy(&outer, 256, 512).unwrap();

        assert_eq!(kgem.bo(&inner).delta(), 1280);
        assert_eq!(kgem.bo(&inner).handle(), kgem.bo(&base).handle());
        assert_eq!(kgem.bo(&base).refcount(), 3);
        assert!(!kgem.bo(&inner).is_reusable());

        drop(inner);
        drop(outer);
        kgem.reap();
        assert_eq!(kgem.bo(&base).refcount(), 1);
    }

    #[test]
    fn test_proxy_out_of_range() {
        let mut kgem = kgem();
        let base = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
        assert!(kgem.create_proxy(&base, 4000, 200).is_none());
        assert!(kgem.create_proxy(&base, 0, 0).is_none());
    }

    #[test]
    fn test_create_2d_rejects_bad_shapes() {
        let mut kgem = kgem();
        assert!(kgem.create_2d(0, 10, 32, Tiling::None, CreateFlags::empty()).is_none());
        assert!(kgem.create_2d(MAX_SHORT + 1, 10, 32, Tiling::None, CreateFlags::empty()).is_none());
        assert!(kgem.create_2d(10, 10, 12, Tiling::None, CreateFlags::empty()).is_none());
    }

    #[test]
    fn test_create_2d_tiled_sets_kernel_tiling() {
        let mut kgem = kgem();
        let bo = kgem.create_2d(1024, 768, 32, Tiling::X, CreateFlags::empty()).unwrap();
        let handle = kgem.bo(&bo).handle();
        assert_eq!(kgem.bo(&bo).tiling(), Tiling::X);
        assert_eq!(kgem.bo(&bo).pitch() % 512, 0);
        assert_eq!(kgem.device().object_tiling(handle), Some((Tiling::X, kgem.bo(&bo).pitch())));
    }

    #[test]
    fn test_reference_and_release() {
        let mut kgem = kgem();
        let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
        let other = kgem.bo_reference(&bo);
        assert_eq!(kgem.bo(&bo).refcount(), 2);
        kgem.bo_release(other);
        assert_eq!(kgem.bo(&bo).refcount(), 1);
    }

    #[test]
    fn test_write_read_through_proxy() {
        let mut kgem = kgem();
        let base = kgem.create_linear(8192, CreateFlags::empty()).unwrap();
        let proxy = kgem.create_proxy(&base, 4096, 16).unwrap();
        kgem.bo_write(&proxy, &[7; 16]).unwrap();

        let mut out = [0u8; 4112];
        kgem.bo_read(&base, &mut out).unwrap();
        assert!(out[..4096].iter().all(|&b| b == 0));
        assert!(out[4096..].iter().all(|&b| b == 7));
        assert_eq!(kgem.bo_write(&proxy, &[0; 17]), Err(Error::InvalidParameter));
    }
}
