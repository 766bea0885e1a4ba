//! Partial buffers
//!
//! Small uploads and downloads share linear objects. Each caller gets a
//! proxy into a shared buffer; upload data is staged in CPU memory and
//! written to the object when the batch that reads it is submitted. The
//! list of open buffers is kept sorted by decreasing free space, so the
//! emptiest buffer is offered first.

use bitflags::bitflags;

use crate::bo::{BoArena, BoId, BoRef, ExecSlot, IoBuffer};
use crate::kernel::GemDevice;
use crate::kgem::{CreateFlags, Kgem};
use crate::{align, num_pages, page_align, BoDomain, BoFlags, Error, Result};

bitflags! {
    /// Intended use of a partial buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// Data flows from the CPU to the GPU
        const WRITE = 1 << 0;
        /// The caller writes the buffer in place rather than staging it
        const INPLACE = 1 << 1;
        /// Last use of the data; a staged upload buffer may be recycled
        const LAST = 1 << 2;

        const WRITE_INPLACE = Self::WRITE.bits() | Self::INPLACE.bits();
    }
}

/// Sub-allocations inside a partial buffer are aligned to this
const PARTIAL_ALIGN: usize = 64;

fn io_of(bos: &BoArena, id: BoId) -> &IoBuffer {
    match bos[id].io.as_deref() {
        Some(io) => io,
        None => panic!("buffer object {:?} is not a partial buffer", id),
    }
}

impl<D: GemDevice> Kgem<D> {
    fn io(&self, id: BoId) -> &IoBuffer {
        io_of(&self.bos, id)
    }

    fn io_mut(&mut self, id: BoId) -> &mut IoBuffer {
        match self.bos[id].io.as_deref_mut() {
            Some(io) => io,
            None => panic!("buffer object {:?} is not a partial buffer", id),
        }
    }

    fn free_space(&self, id: BoId) -> usize {
        self.bos[id].size - self.io(id).used
    }

    fn sort_partials(&mut self) {
        let mut partials = core::mem::take(&mut self.partials);
        partials.sort_by_key(|&id| core::cmp::Reverse(self.free_space(id)));
        self.partials = partials;
    }

    /// Allocate `size` bytes of a shared buffer
    ///
    /// Returns a proxy whose contents are reached through
    /// [`Kgem::buffer_data`] and [`Kgem::buffer_data_mut`].
    pub fn create_buffer(&mut self, size: usize, flags: BufferFlags) -> Option<BoRef> {
        if self.wedged {
            return None;
        }
        self.reap();
        debug_assert!(size > 0);
        if size == 0 || size > self.limits.max_object_size {
            return None;
        }

        let mut flags = flags;
        if self.limits.has_llc {
            flags.remove(BufferFlags::INPLACE);
        }
        log::trace!("create_buffer: size={}, flags={:?}", size, flags);

        let mut found = None;
        for id in self.partials.clone() {
            let handle = self.bos[id].handle;
            let bytes = self.bos[id].size;
            let idle = self.bos[id].rq.is_none() && self.bos[id].refcnt == 1;
            let (write, used) = {
                let io = self.io(id);
                (io.write, io.used)
            };

            // Recycle a staged upload buffer for a download
            if flags == BufferFlags::LAST && write == BufferFlags::WRITE && size <= bytes {
                log::trace!("reusing write buffer handle={} for a read of {} bytes", handle, size);
                let upload = self.device.pwrite(handle, 0, &io_of(&self.bos, id).mem[..used]);
                if let Err(err) = upload {
                    log::warn!("partial upload to handle={} failed: {}", handle, err);
                }
                let io = self.io_mut(id);
                io.need_io = false;
                io.write = BufferFlags::empty();
                io.used = size;
                found = Some((id, 0));
                break;
            }

            if flags.contains(BufferFlags::WRITE) {
                if !write.contains(BufferFlags::WRITE) || (write - flags).contains(BufferFlags::INPLACE) {
                    continue;
                }
            } else if write.contains(BufferFlags::WRITE) {
                continue;
            }

            if used > 0 && idle {
                self.io_mut(id).used = 0;
            }

            let io = self.io_mut(id);
            if io.used + size <= bytes {
                let offset = io.used;
                io.used += size;
                log::trace!("reusing partial handle={} at offset {}", handle, offset);
                found = Some((id, offset));
                break;
            }
            // The list is sorted, nothing further down has more room
            break;
        }

        let (base, offset) = match found {
            Some(found) => found,
            None => (self.alloc_partial(size, flags)?, 0),
        };

        let io = self.io_mut(base);
        io.used = align(io.used, PARTIAL_ALIGN);
        self.sort_partials();
        self.create_proxy_id(base, offset, size).map(|id| self.hand_out(id))
    }

    fn alloc_partial(&mut self, size: usize, flags: BufferFlags) -> Option<BoId> {
        let partial_size = self.limits.partial_buffer_size;
        let max_cache = self.limits.max_cache_size;
        let mut alloc = align(2 * size, partial_size);
        if alloc > max_cache {
            alloc = align(size, partial_size);
        }
        if alloc > max_cache {
            alloc = page_align(size);
        }
        let pages = alloc / crate::PAGE_SIZE;
        let write = flags.contains(BufferFlags::WRITE);

        let mut cached = None;
        if !write {
            cached = self.search_linear_cache(pages, CreateFlags::empty());
        }
        if cached.is_none() {
            cached = self.search_linear_cache(pages, CreateFlags::INACTIVE);
        }
        let id = match cached {
            Some(id) => {
                log::trace!("reusing handle={} for a partial buffer", self.bos[id].handle);
                self.bos[id].refcnt = 1;
                id
            }
            None => self.create_object(alloc)?,
        };

        let bo = &mut self.bos[id];
        bo.flags.remove(BoFlags::REUSABLE);
        bo.io = Some(Box::new(IoBuffer {
            mem: vec![0; bo.size],
            used: size,
            write: flags & BufferFlags::WRITE_INPLACE,
            need_io: write,
        }));
        log::debug!(
            "new partial buffer handle={} ({} pages, write? {})",
            bo.handle,
            bo.num_pages(),
            write
        );
        self.partials.insert(0, id);
        Some(id)
    }

    /// Shared buffer for a `width`x`height` image
    ///
    /// Rows are padded to an even count while allocating so that accesses
    /// to the last pair of rows stay inside the buffer; the padding is
    /// given back afterwards.
    pub fn create_buffer_2d(
        &mut self,
        width: u32,
        height: u32,
        bpp: u32,
        flags: BufferFlags,
    ) -> Option<BoRef> {
        debug_assert!(width > 0 && height > 0);
        let stride = align(align(width as usize, 2) * bpp as usize / 8, 4);
        let bo = self.create_buffer(stride * align(height as usize, 2), flags)?;
        let id = bo.id();

        if height & 1 == 1 {
            let Some(base) = self.bos[id].proxy else {
                return None;
            };
            let min = align(self.bos[id].delta as usize + height as usize * stride, PARTIAL_ALIGN);
            if self.io(base).used != min {
                log::trace!("trimming partial buffer from {} to {}", self.io(base).used, min);
                self.io_mut(base).used = min;
                self.sort_partials();
            }
            self.bos[id].size -= stride;
        }

        self.bos[id].pitch = stride as u32;
        Some(bo)
    }

    /// Copy a rectangle of a CPU image into a fresh upload buffer
    #[allow(clippy::too_many_arguments)]
    pub fn upload_source_image(
        &mut self,
        data: &[u8],
        stride: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Option<BoRef> {
        if width == 0 || height == 0 {
            return None;
        }
        let cpp = (bpp / 8) as usize;
        let row = width as usize * cpp;
        let last = (y + height - 1) as usize * stride + x as usize * cpp + row;
        if last > data.len() {
            log::debug!("upload_source_image: source too short ({} < {})", data.len(), last);
            return None;
        }

        let bo = self.create_buffer_2d(width, height, bpp, BufferFlags::WRITE_INPLACE)?;
        let pitch = self.bos[bo.id()].pitch as usize;
        let dst = self.buffer_data_mut(&bo)?;
        for line in 0..height as usize {
            let src = (y as usize + line) * stride + x as usize * cpp;
            dst[line * pitch..line * pitch + row].copy_from_slice(&data[src..src + row]);
        }
        Some(bo)
    }

    fn partial_of(&self, bo: &BoRef) -> Option<(BoId, usize, usize)> {
        let proxy = &self.bos[bo.id()];
        let base = proxy.proxy?;
        if !proxy.is_io {
            return None;
        }
        Some((base, proxy.delta as usize, proxy.size))
    }

    /// CPU view of a partial buffer proxy
    pub fn buffer_data(&self, bo: &BoRef) -> Option<&[u8]> {
        let (base, offset, len) = self.partial_of(bo)?;
        Some(&self.io(base).mem[offset..offset + len])
    }

    pub fn buffer_data_mut(&mut self, bo: &BoRef) -> Option<&mut [u8]> {
        let (base, offset, len) = self.partial_of(bo)?;
        Some(&mut self.io_mut(base).mem[offset..offset + len])
    }

    /// Stage `data` at the start of an upload buffer proxy
    pub fn buffer_write(&mut self, bo: &BoRef, data: &[u8]) -> Result<()> {
        let (base, offset, len) = self.partial_of(bo).ok_or(Error::InvalidParameter)?;
        if data.len() > len {
            return Err(Error::InvalidParameter);
        }
        let io = self.io_mut(base);
        if !io.write.contains(BufferFlags::WRITE) {
            return Err(Error::InvalidParameter);
        }
        io.mem[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Whether the proxy's buffer is written in place by the caller
    pub fn buffer_is_inplace(&self, bo: &BoRef) -> bool {
        self.partial_of(bo)
            .map_or(false, |(base, _, _)| self.io(base).write.contains(BufferFlags::INPLACE))
    }

    /// Fetch what the GPU wrote into a download buffer proxy
    ///
    /// Submits the batch referencing the buffer if needed and waits for
    /// it; afterwards [`Kgem::buffer_data`] returns the GPU's results.
    pub fn buffer_read_sync(&mut self, bo: &BoRef) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        let (base, offset, len) = self.partial_of(bo).ok_or(Error::InvalidParameter)?;
        if self.bos[base].exec.is_some() {
            self.submit();
        }

        let handle = self.bos[base].handle;
        let io = match self.bos[base].io.as_deref_mut() {
            Some(io) => io,
            None => return Err(Error::InvalidParameter),
        };
        self.device
            .pread(handle, offset, &mut io.mem[offset..offset + len])?;

        self.bo_retire(base);
        self.bos[base].domain = BoDomain::None;
        Ok(())
    }

    /// Upload staged data of every partial buffer used by the batch being
    /// submitted, and take those buffers off the shared list
    pub(crate) fn finish_partials(&mut self) {
        for id in self.partials.clone() {
            let bo = &self.bos[id];
            if bo.exec.is_none() {
                continue;
            }
            let io = self.io(id);
            if !io.write.contains(BufferFlags::WRITE) || io.used == 0 {
                self.decouple_partial(id);
                continue;
            }

            let used = io.used;
            if bo.refcnt == 1 && bo.num_pages() > 1 && used < bo.size / 2 {
                let flags = CreateFlags::INACTIVE | CreateFlags::NO_RETIRE;
                if let Some(shrink) = self.search_linear_cache(num_pages(used), flags) {
                    if self.shrink_partial(id, shrink) {
                        self.decouple_partial(id);
                        continue;
                    }
                }
            }

            let handle = self.bos[id].handle;
            log::trace!("uploading partial handle={} ({}/{})", handle, used, self.bos[id].size);
            let upload = self.device.pwrite(handle, 0, &io_of(&self.bos, id).mem[..used]);
            if let Err(err) = upload {
                log::warn!("partial upload to handle={} failed: {}", handle, err);
            }
            self.io_mut(id).need_io = false;
            self.decouple_partial(id);
        }
    }

    /// Move the staged contents of a mostly empty buffer into a smaller
    /// object and point the batch at it instead
    fn shrink_partial(&mut self, id: BoId, shrink: BoId) -> bool {
        let used = self.io(id).used;
        let new_handle = self.bos[shrink].handle;
        let upload = self.device.pwrite(new_handle, 0, &io_of(&self.bos, id).mem[..used]);
        if let Err(err) = upload {
            log::warn!("partial upload to handle={} failed: {}", new_handle, err);
            self.free(shrink);
            return false;
        }

        let old_handle = self.bos[id].handle;
        let presumed = self.bos[shrink].presumed_offset;
        log::debug!(
            "shrinking partial handle={} ({} bytes) to handle={} ({} bytes)",
            old_handle,
            self.bos[id].size,
            new_handle,
            self.bos[shrink].size
        );
        for reloc in self.batch.relocs.iter_mut() {
            if reloc.target_handle == old_handle {
                reloc.target_handle = new_handle;
                reloc.presumed_offset = presumed;
                self.batch.words[reloc.offset as usize / 4] =
                    reloc.delta.wrapping_add(presumed as u32);
            }
        }

        let Some(index) = self.bos[id].exec_index() else {
            return false;
        };
        let exec = &mut self.batch.exec[index];
        exec.handle = new_handle;
        exec.offset = presumed;
        self.batch.exec_ids[index] = shrink;
        self.batch.aperture -= self.bos[id].num_pages() as u64;
        self.batch.aperture += self.bos[shrink].num_pages() as u64;

        let dirty = self.bos[id].is_dirty();
        self.bos[shrink].exec = Some(ExecSlot::Object(index));
        self.bos[shrink].flags.set(BoFlags::NEEDS_FLUSH, dirty);
        self.attach(shrink);

        self.detach_request(id);
        let bo = &mut self.bos[id];
        bo.exec = None;
        bo.flags.remove(BoFlags::DIRTY | BoFlags::NEEDS_FLUSH);
        self.io_mut(id).used = 0;
        true
    }

    fn decouple_partial(&mut self, id: BoId) {
        log::trace!("releasing partial handle={}", self.bos[id].handle);
        self.partials.retain(|&partial| partial != id);
        self.unref(id);
    }

    /// Give the tail of a partial buffer back when its last allocation is
    /// released unused
    fn delete_partial(&mut self, proxy: BoId, base: BoId) {
        if !self.partials.contains(&base) {
            return;
        }
        let bo = &self.bos[proxy];
        let (delta, size) = (bo.delta as usize, bo.size);
        let io = self.io_mut(base);
        if align(delta + size, PARTIAL_ALIGN) == io.used {
            io.used = delta;
            self.sort_partials();
        }
    }

    pub(crate) fn destroy_proxy(&mut self, id: BoId, target: BoId) {
        let bo = &self.bos[id];
        if bo.is_io && (bo.exec.is_none() || self.bos[target].rq.is_none()) {
            self.delete_partial(id, target);
        }
        self.bos.remove(id);
        self.unref(target);
    }

    /// Drop idle partial buffers nobody holds a proxy into
    pub(crate) fn retire_partials(&mut self) {
        for id in self.partials.clone() {
            let bo = &self.bos[id];
            if bo.rq.is_some() || bo.refcnt != 1 {
                continue;
            }
            debug_assert!(bo.exec.is_none());
            log::trace!("retiring partial handle={}, used {}/{}", bo.handle, self.io(id).used, bo.size);
            self.decouple_partial(id);
        }
    }

    pub(crate) fn expire_partials(&mut self) {
        self.retire_partials();
    }

    /// Number of shared buffers open for sub-allocation
    pub fn partial_buffers(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_inplace_flags() {
        assert_eq!(
            BufferFlags::WRITE_INPLACE,
            BufferFlags::WRITE | BufferFlags::INPLACE
        );
        let buffer = BufferFlags::WRITE_INPLACE;
        assert!((buffer - BufferFlags::WRITE).contains(BufferFlags::INPLACE));
        assert!(!(buffer - BufferFlags::WRITE_INPLACE).contains(BufferFlags::INPLACE));
    }
}
