//! Batch builder
//!
//! Command words are appended from the bottom of the batch while indirect
//! state (surface descriptors) is allocated downward from the top. Every
//! address inside the stream is recorded as a relocation; adding one makes
//! its target part of the exec list, so the kernel always sees every
//! object the batch references.

use crate::bo::{BoId, BoRef, ExecSlot};
use crate::kernel::{Domain, ExecFlags, ExecObject, GemDevice, Handle, Relocation, Ring};
use crate::kgem::Kgem;
use crate::tiling::fenced_size;
use crate::{Error, Result, MI_BATCH_BUFFER_END, MI_NOOP, PAGE_SIZE};

/// Hard size of the exec object list
pub const EXEC_SIZE: usize = 256;
/// Hard size of the relocation list
pub const RELOC_SIZE: usize = 384;

const BATCH_RESERVED: usize = 1;
const RELOC_RESERVED: usize = 4;
const EXEC_RESERVED: usize = 1;

/// Resource of the current batch that ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Batch,
    Relocations,
    Exec,
    Fences,
    Aperture,
}

impl core::fmt::Display for Capacity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Capacity::Batch => write!(f, "command space"),
            Capacity::Relocations => write!(f, "relocations"),
            Capacity::Exec => write!(f, "exec objects"),
            Capacity::Fences => write!(f, "fence registers"),
            Capacity::Aperture => write!(f, "aperture"),
        }
    }
}

/// Domains of one relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelocDomains {
    pub read: Domain,
    pub write: Domain,
    /// Access goes through a fence register (tiled blits before gen4)
    pub fenced: bool,
}

impl RelocDomains {
    /// The GPU only reads the target
    pub fn read(domains: Domain) -> Self {
        Self {
            read: domains,
            write: Domain::empty(),
            fenced: false,
        }
    }

    /// The GPU writes the target
    pub fn write(domain: Domain) -> Self {
        Self {
            read: domain,
            write: domain,
            fenced: false,
        }
    }

    pub fn fenced(mut self) -> Self {
        self.fenced = true;
        self
    }

    pub fn with_read(mut self, domains: Domain) -> Self {
        self.read |= domains;
        self
    }
}

pub(crate) struct Batch {
    pub words: Vec<u32>,
    /// Command words used, from the bottom
    pub nbatch: usize,
    /// Lowest word used by indirect state, from the top
    pub surface: usize,
    pub exec: Vec<ExecObject>,
    /// Object of each exec entry
    pub exec_ids: Vec<BoId>,
    pub relocs: Vec<Relocation>,
    /// Proxies referenced by this batch
    pub proxies: Vec<BoId>,
    pub nfence: u32,
    /// Aperture footprint in pages
    pub aperture: u64,
    /// Fence regions in use, in bytes
    pub aperture_fenced: u64,
    pub mode: Option<Ring>,
    pub ring: Ring,
}

impl Batch {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            words: vec![0; max_batch_size],
            nbatch: 0,
            surface: max_batch_size,
            exec: Vec::with_capacity(EXEC_SIZE),
            exec_ids: Vec::with_capacity(EXEC_SIZE),
            relocs: Vec::with_capacity(RELOC_SIZE),
            proxies: Vec::new(),
            nfence: 0,
            aperture: 0,
            aperture_fenced: 0,
            mode: None,
            ring: Ring::default(),
        }
    }

    pub fn reset(&mut self) {
        self.nbatch = 0;
        self.surface = self.words.len();
        self.exec.clear();
        self.exec_ids.clear();
        self.relocs.clear();
        self.proxies.clear();
        self.nfence = 0;
        self.aperture = 0;
        self.aperture_fenced = 0;
        self.mode = None;
    }

    pub fn has_surfaces(&self) -> bool {
        self.surface != self.words.len()
    }

    /// Terminate the stream, padding it to an even number of words
    pub fn end(&mut self) -> usize {
        self.words[self.nbatch] = MI_BATCH_BUFFER_END;
        self.nbatch += 1;
        if self.nbatch & 1 == 1 {
            self.words[self.nbatch] = MI_NOOP;
            self.nbatch += 1;
        }
        self.nbatch
    }

    /// Size in bytes of the object the stream is uploaded to, and how far
    /// the surface region moves down to get there
    ///
    /// A batch with surface state is packed into one or two pages when
    /// both regions fit; relocations into the surface region are moved
    /// along with it.
    pub fn compact(&mut self) -> (usize, usize) {
        if !self.has_surfaces() {
            return (self.nbatch * 4, 0);
        }

        let full = self.words.len() * 4;
        let dwords = self.words.len() - self.surface + self.nbatch;
        let size = if dwords > 2048 {
            full
        } else if dwords > 1024 {
            2 * PAGE_SIZE
        } else {
            PAGE_SIZE
        };
        if size >= full {
            return (full, 0);
        }

        let shrink = full - size;
        for reloc in self.relocs.iter_mut() {
            if reloc.target_handle == 0 && reloc.read_domains == Domain::INSTRUCTION {
                reloc.delta -= shrink as u32;
            }
            if reloc.offset as usize >= size {
                reloc.offset -= shrink as u64;
            }
        }
        (size, shrink)
    }

    /// Point relocations against the batch itself at the uploaded object
    pub fn fixup_self_relocs(&mut self, handle: Handle, presumed_offset: u64, shrink: usize) {
        let command_end = self.nbatch * 4;
        for reloc in self.relocs.iter_mut() {
            if reloc.target_handle != 0 {
                continue;
            }
            reloc.target_handle = handle;
            reloc.presumed_offset = presumed_offset;

            let mut offset = reloc.offset as usize;
            if offset >= command_end {
                offset += shrink;
            }
            self.words[offset / 4] = reloc.delta.wrapping_add(presumed_offset as u32);
        }
    }

    /// Upload the stream into the anchor object of `size` bytes
    pub fn write<D: GemDevice>(
        &self,
        device: &mut D,
        handle: Handle,
        size: usize,
    ) -> syscall::error::Result<()> {
        if !self.has_surfaces() {
            return device.pwrite(handle, 0, &dwords_to_bytes(&self.words[..self.nbatch]));
        }

        // Conjoint command and surface pages go up in one piece
        if self.surface < self.nbatch + PAGE_SIZE / 4 {
            debug_assert_eq!(size, self.words.len() * 4);
            return device.pwrite(handle, 0, &dwords_to_bytes(&self.words));
        }

        device.pwrite(handle, 0, &dwords_to_bytes(&self.words[..self.nbatch]))?;
        let full = self.words.len() * 4;
        let offset = self.surface * 4 - (full - size);
        debug_assert!(self.nbatch * 4 <= offset);
        device.pwrite(handle, offset, &dwords_to_bytes(&self.words[self.surface..]))
    }

    #[cfg(feature = "debug-logging")]
    pub fn dump(&self, errno: i32) {
        log::error!(
            "batch[{:?}/{:?}]: nbatch={} surface={} nreloc={} nexec={} nfence={} aperture={}: errno={}",
            self.mode,
            self.ring,
            self.nbatch,
            self.surface,
            self.relocs.len(),
            self.exec.len(),
            self.nfence,
            self.aperture,
            errno
        );
        for (i, exec) in self.exec.iter().enumerate() {
            log::error!(
                "exec[{}] = handle:{}, presumed offset: {:#x}, relocs: {}, fenced: {}",
                i,
                exec.handle,
                exec.offset,
                exec.relocation_count,
                exec.flags.contains(ExecFlags::NEEDS_FENCE)
            );
        }
        for (i, reloc) in self.relocs.iter().enumerate() {
            log::error!(
                "reloc[{}] = pos:{}, target:{}, delta:{}, read:{:?}, write:{:?}, offset:{:#x}",
                i,
                reloc.offset,
                reloc.target_handle,
                reloc.delta,
                reloc.read_domains,
                reloc.write_domain,
                reloc.presumed_offset
            );
        }
    }
}

pub(crate) fn dwords_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

impl<D: GemDevice> Kgem<D> {
    /// Ring of the batch under construction, if one was selected
    pub fn mode(&self) -> Option<Ring> {
        self.batch.mode
    }

    /// Select the ring for the next commands
    ///
    /// A non-empty batch built for another ring is submitted first.
    pub fn set_mode(&mut self, ring: Ring) {
        if self.batch.mode == Some(ring) {
            return;
        }
        if self.batch.nbatch > 0 && self.batch.ring != ring {
            log::debug!("switching ring {:?} -> {:?}, submitting", self.batch.ring, ring);
            self.submit();
        }
        self.batch.mode = Some(ring);
        self.batch.ring = ring;
    }

    /// Room for `num_dwords` more command words
    pub fn check_batch(&self, num_dwords: usize) -> bool {
        self.batch.nbatch + num_dwords + BATCH_RESERVED <= self.batch.surface
    }

    /// Room for `n` more relocations
    pub fn check_reloc(&self, n: usize) -> bool {
        self.batch.relocs.len() + n <= RELOC_SIZE - RELOC_RESERVED
    }

    /// Room for `n` more exec objects
    pub fn check_exec(&self, n: usize) -> bool {
        self.batch.exec.len() + n <= EXEC_SIZE - EXEC_RESERVED
    }

    /// Room for `num_dwords` command words plus `num_surfaces` surface
    /// descriptors, each carrying one relocation
    pub fn check_batch_with_surfaces(&self, num_dwords: usize, num_surfaces: usize) -> bool {
        let Some(limit) = self.batch.surface.checked_sub(num_surfaces * 8) else {
            return false;
        };
        self.batch.nbatch + num_dwords + BATCH_RESERVED <= limit && self.check_reloc(num_surfaces)
    }

    /// Whether all of `bos` fit into the aperture and exec budget
    pub fn check_bo(&self, bos: &[&BoRef]) -> bool {
        let mut num_pages = 0u64;
        let mut num_exec = 0;
        for bo in bos {
            let bo = &self.bos[self.target_of(bo.id())];
            if bo.exec.is_some() {
                continue;
            }
            num_pages += bo.num_pages() as u64;
            num_exec += 1;
        }
        if num_pages == 0 {
            return true;
        }

        self.batch.aperture <= self.limits.aperture_low
            && self.batch.aperture + num_pages <= self.limits.aperture_high
            && self.batch.exec.len() + num_exec < EXEC_SIZE - EXEC_RESERVED
    }

    /// Like [`Kgem::check_bo`] for one object accessed through a fence
    pub fn check_bo_fenced(&self, bo: &BoRef) -> bool {
        let bo = &self.bos[self.target_of(bo.id())];
        let needs_fence = self.limits.gen < 40 && bo.tiling.is_tiled();

        if let Some(index) = bo.exec_index() {
            if needs_fence && !self.batch.exec[index].flags.contains(ExecFlags::NEEDS_FENCE) {
                if self.batch.nfence >= self.limits.fence_max {
                    return false;
                }
                let size = self.batch.aperture_fenced + fenced_size(self.limits.gen, bo.size) as u64;
                if size > self.limits.aperture_mappable {
                    return false;
                }
            }
            return true;
        }

        if self.batch.aperture > self.limits.aperture_low {
            return false;
        }
        if self.batch.exec.len() >= EXEC_SIZE - EXEC_RESERVED - 1 {
            return false;
        }
        if needs_fence && self.batch.nfence >= self.limits.fence_max {
            return false;
        }
        self.batch.aperture + bo.num_pages() as u64 <= self.limits.aperture_high
    }

    /// Whether all of `bos`, each accessed through a fence, fit together
    pub fn check_many_bo_fenced(&self, bos: &[&BoRef]) -> bool {
        let gen = self.limits.gen;
        let mut num_fence = 0;
        let mut num_exec = 0;
        let mut num_pages = 0u64;
        let mut fenced = 0u64;

        for bo in bos {
            let bo = &self.bos[self.target_of(bo.id())];
            let needs_fence = gen < 40 && bo.tiling.is_tiled();
            if let Some(index) = bo.exec_index() {
                if needs_fence && !self.batch.exec[index].flags.contains(ExecFlags::NEEDS_FENCE) {
                    fenced += fenced_size(gen, bo.size) as u64;
                    num_fence += 1;
                }
                continue;
            }

            num_pages += bo.num_pages() as u64;
            num_exec += 1;
            if needs_fence {
                fenced += fenced_size(gen, bo.size) as u64;
                num_fence += 1;
            }
        }

        if fenced + self.batch.aperture_fenced > self.limits.aperture_mappable {
            return false;
        }
        if self.batch.nfence + num_fence > self.limits.fence_max {
            return false;
        }
        if num_pages == 0 {
            return true;
        }

        self.batch.aperture <= self.limits.aperture_low
            && self.batch.aperture + num_pages <= self.limits.aperture_high
            && self.batch.exec.len() + num_exec < EXEC_SIZE - EXEC_RESERVED
    }

    /// Append command words
    ///
    /// Fails with [`Capacity::Batch`] when they do not fit; the caller must
    /// submit and start over.
    pub fn emit(&mut self, words: &[u32]) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        if !self.check_batch(words.len()) {
            return Err(Error::NoSpace(Capacity::Batch));
        }
        let start = self.batch.nbatch;
        self.batch.words[start..start + words.len()].copy_from_slice(words);
        self.batch.nbatch += words.len();
        Ok(())
    }

    /// Make room for `num_dwords` words, submitting the batch if needed
    ///
    /// Returns the position the words will be written at.
    pub fn reserve(&mut self, num_dwords: usize) -> Result<usize> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        if !self.check_batch(num_dwords) {
            self.submit();
            if self.wedged {
                return Err(Error::Wedged);
            }
            if !self.check_batch(num_dwords) {
                return Err(Error::NoSpace(Capacity::Batch));
            }
        }
        Ok(self.batch.nbatch)
    }

    /// Position of the next command word
    pub fn position(&self) -> usize {
        self.batch.nbatch
    }

    /// Overwrite one word of the batch, e.g. with the value returned by
    /// [`Kgem::add_reloc`]
    pub fn set_dword(&mut self, pos: usize, value: u32) {
        debug_assert!(pos < self.batch.nbatch || pos >= self.batch.surface);
        self.batch.words[pos] = value;
    }

    pub(crate) fn add_exec(&mut self, id: BoId) -> usize {
        let index = self.batch.exec.len();
        debug_assert!(index < EXEC_SIZE);

        let bo = &mut self.bos[id];
        debug_assert!(bo.exec.is_none() && bo.proxy.is_none());
        debug_assert!(!bo.is_purged());
        self.batch.exec.push(ExecObject {
            handle: bo.handle,
            offset: bo.presumed_offset,
            ..Default::default()
        });
        self.batch.exec_ids.push(id);
        self.batch.aperture += bo.num_pages() as u64;
        bo.exec = Some(ExecSlot::Object(index));
        log::trace!("exec[{}] = handle={}", index, bo.handle);

        self.attach(id);
        index
    }

    /// Add an object to the batch without a relocation
    pub fn add_bo(&mut self, bo: &BoRef) -> Result<()> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        let id = self.target_of(bo.id());
        if self.bos[id].exec.is_none() {
            if !self.check_exec(1) {
                return Err(Error::NoSpace(Capacity::Exec));
            }
            if !self.check_aperture(id) {
                return Err(Error::NoSpace(Capacity::Aperture));
            }
            self.add_exec(id);
        }
        Ok(())
    }

    /// Whether `id` can join the batch without leaving the aperture budget
    fn check_aperture(&self, id: BoId) -> bool {
        self.batch.aperture + self.bos[id].num_pages() as u64 <= self.limits.aperture_high
    }

    /// Record a relocation for the word at `pos`
    ///
    /// `target` of `None` refers to the batch itself (indirect state).
    /// Returns the value to store at `pos`: the target's presumed address
    /// plus `delta`.
    pub fn add_reloc(
        &mut self,
        pos: usize,
        target: Option<&BoRef>,
        domains: RelocDomains,
        delta: u32,
    ) -> Result<u32> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        if self.batch.relocs.len() >= RELOC_SIZE {
            return Err(Error::NoSpace(Capacity::Relocations));
        }

        let mut reloc = Relocation {
            offset: (pos * 4) as u64,
            delta,
            read_domains: domains.read,
            write_domain: domains.write,
            ..Default::default()
        };

        let Some(target) = target else {
            debug_assert!(domains.write.is_empty());
            self.batch.relocs.push(reloc);
            return Ok(delta);
        };

        let mut id = target.id();
        let mut delta = delta;
        if let Some(base) = self.bos[id].proxy {
            delta += self.bos[id].delta;
            id = base;
        }

        let gen = self.limits.gen;
        let bo = &self.bos[id];
        debug_assert!(!bo.is_purged());
        let in_batch = bo.exec.is_some();
        if !in_batch && self.batch.exec.len() >= EXEC_SIZE - EXEC_RESERVED {
            return Err(Error::NoSpace(Capacity::Exec));
        }
        if !in_batch && !self.check_aperture(id) {
            return Err(Error::NoSpace(Capacity::Aperture));
        }
        let fenced = bo.exec_index().map_or(false, |index| {
            self.batch.exec[index].flags.contains(ExecFlags::NEEDS_FENCE)
        });
        let take_fence = gen < 40 && domains.fenced && bo.tiling.is_tiled() && !fenced;
        if take_fence && self.batch.nfence >= self.limits.fence_max {
            return Err(Error::NoSpace(Capacity::Fences));
        }

        if target.id() != id {
            let proxy = target.id();
            if self.bos[proxy].exec.is_none() {
                self.bos[proxy].exec = Some(ExecSlot::Proxy);
                self.batch.proxies.push(proxy);
            }
        }

        let index = match self.bos[id].exec_index() {
            Some(index) => index,
            None => self.add_exec(id),
        };
        if gen < 40 && domains.fenced {
            if take_fence {
                self.batch.aperture_fenced += fenced_size(gen, self.bos[id].size) as u64;
                self.batch.nfence += 1;
            }
            self.batch.exec[index].flags |= ExecFlags::NEEDS_FENCE;
        }

        let bo = &mut self.bos[id];
        reloc.delta = delta;
        reloc.target_handle = bo.handle;
        reloc.presumed_offset = bo.presumed_offset;
        if !domains.write.is_empty() {
            bo.flags |= crate::BoFlags::NEEDS_FLUSH | crate::BoFlags::DIRTY;
        }
        self.batch.relocs.push(reloc);

        Ok(delta.wrapping_add(bo.presumed_offset as u32))
    }

    /// Append one relocated address as the next command word
    pub fn emit_reloc(
        &mut self,
        target: Option<&BoRef>,
        domains: RelocDomains,
        delta: u32,
    ) -> Result<()> {
        if !self.check_batch(1) {
            return Err(Error::NoSpace(Capacity::Batch));
        }
        let pos = self.batch.nbatch;
        let value = self.add_reloc(pos, target, domains, delta)?;
        self.batch.words[pos] = value;
        self.batch.nbatch += 1;
        Ok(())
    }

    /// Copy indirect state into the top of the batch
    ///
    /// Returns the word offset of the state inside the batch; relocations
    /// inside it are added with [`Kgem::add_reloc`] at that offset.
    pub fn alloc_surface(&mut self, state: &[u32]) -> Result<u32> {
        if self.wedged {
            return Err(Error::Wedged);
        }
        let len = crate::align(state.len(), 2);
        let fits = self
            .batch
            .surface
            .checked_sub(len)
            .map_or(false, |surface| self.batch.nbatch + BATCH_RESERVED <= surface);
        if !fits {
            return Err(Error::NoSpace(Capacity::Batch));
        }

        self.batch.surface -= len;
        let start = self.batch.surface;
        self.batch.words[start..start + state.len()].copy_from_slice(state);
        self.batch.words[start + state.len()..start + len].fill(0);
        Ok(start as u32)
    }

    /// Forget which objects the current batch has written
    pub fn clear_dirty(&mut self) {
        for &id in &self.batch.exec_ids {
            self.bos[id].flags.remove(crate::BoFlags::DIRTY);
        }
    }

    /// Command words used so far
    pub fn batch_used(&self) -> usize {
        self.batch.nbatch
    }

    pub fn num_exec(&self) -> usize {
        self.batch.exec.len()
    }

    pub fn num_relocs(&self) -> usize {
        self.batch.relocs.len()
    }

    pub fn num_fences(&self) -> u32 {
        self.batch.nfence
    }

    /// Aperture pages referenced by the current batch
    pub fn aperture_pages(&self) -> u64 {
        self.batch.aperture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_pads_to_even() {
        let mut batch = Batch::new(64);
        batch.words[0] = 0xdead;
        batch.nbatch = 1;
        assert_eq!(batch.end(), 2);
        assert_eq!(batch.words[1], MI_BATCH_BUFFER_END);

        let mut batch = Batch::new(64);
        batch.nbatch = 2;
        assert_eq!(batch.end(), 4);
        assert_eq!(batch.words[2], MI_BATCH_BUFFER_END);
        assert_eq!(batch.words[3], MI_NOOP);
    }

    #[test]
    fn test_compact_without_surfaces() {
        let mut batch = Batch::new(4096);
        batch.nbatch = 10;
        assert_eq!(batch.compact(), (40, 0));
    }

    #[test]
    fn test_compact_into_one_page() {
        let mut batch = Batch::new(4096);
        batch.nbatch = 100;
        batch.surface = 4096 - 16;
        batch.relocs.push(Relocation {
            offset: (4096 - 16 + 1) * 4,
            read_domains: Domain::INSTRUCTION,
            delta: (4096 - 16) * 4,
            ..Default::default()
        });
        batch.relocs.push(Relocation {
            offset: 8,
            target_handle: 5,
            ..Default::default()
        });

        let (size, shrink) = batch.compact();
        assert_eq!(size, PAGE_SIZE);
        assert_eq!(shrink, 3 * PAGE_SIZE);
        assert_eq!(batch.relocs[0].offset, ((4096 - 16 + 1) * 4 - 3 * 4096) as u64);
        assert_eq!(batch.relocs[0].delta, ((4096 - 16) * 4 - 3 * 4096) as u32);
        assert_eq!(batch.relocs[1].offset, 8);

        batch.fixup_self_relocs(9, 0x1000, shrink);
        assert_eq!(batch.relocs[0].target_handle, 9);
        assert_eq!(
            batch.words[4096 - 16 + 1],
            ((4096 - 16) * 4 - 3 * 4096 + 0x1000) as u32
        );
    }

    #[test]
    fn test_compact_large_surface_region() {
        let mut batch = Batch::new(4096);
        batch.nbatch = 1500;
        batch.surface = 4096 - 1000;
        assert_eq!(batch.compact(), (4096 * 4, 0));

        let mut batch = Batch::new(4096);
        batch.nbatch = 1000;
        batch.surface = 4096 - 500;
        assert_eq!(batch.compact(), (2 * PAGE_SIZE, 2 * PAGE_SIZE));
    }

    #[test]
    fn test_reloc_domains() {
        let write = RelocDomains::write(Domain::RENDER).fenced();
        assert_eq!(write.read, Domain::RENDER);
        assert_eq!(write.write, Domain::RENDER);
        assert!(write.fenced);

        let read = RelocDomains::read(Domain::SAMPLER).with_read(Domain::RENDER);
        assert!(read.write.is_empty());
        assert_eq!(read.read, Domain::SAMPLER | Domain::RENDER);
    }

    #[test]
    fn test_dwords_to_bytes() {
        assert_eq!(dwords_to_bytes(&[0x0403_0201, 5]), vec![1, 2, 3, 4, 5, 0, 0, 0]);
    }
}
