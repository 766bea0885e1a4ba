//! Simulated GEM device
//!
//! `SimDevice` keeps every object in host memory and models the parts of
//! the kernel the buffer manager depends on: object storage, GTT placement
//! and relocation patching, in-order request completion, purgeable pages,
//! and injectable failures (busy/hung execution, failed allocations). A
//! clone shares the same state, so a test can keep one handle for
//! inspection while the other is owned by [`crate::Kgem`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use syscall::error::{Error, Result, EINVAL, EIO, ENOENT, ENOMEM};

use crate::kernel::{
    Aperture, Domain, ExecBuffer, GemDevice, Handle, Madvise, Param, Relocation, Ring, Tiling,
};

/// First GTT offset handed out to objects
const GTT_BASE: u64 = 0x10000;

/// Number of calls made into the device, per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub creates: u64,
    pub closes: u64,
    pub set_tiling: u64,
    pub get_aperture: u64,
    pub get_param: u64,
    pub pwrites: u64,
    pub preads: u64,
    pub mmaps: u64,
    pub set_domains: u64,
    pub busy_queries: u64,
    pub madvises: u64,
    pub exec_attempts: u64,
    pub execs: u64,
    pub throttles: u64,
}

impl SimStats {
    /// Total number of kernel calls, excluding `munmap`
    pub fn total(&self) -> u64 {
        self.creates
            + self.closes
            + self.set_tiling
            + self.get_aperture
            + self.get_param
            + self.pwrites
            + self.preads
            + self.mmaps
            + self.set_domains
            + self.busy_queries
            + self.madvises
            + self.exec_attempts
            + self.throttles
    }
}

/// A successfully executed batch
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub ring: Ring,
    pub handles: Vec<Handle>,
    /// Command words after relocation patching
    pub batch: Vec<u32>,
    pub relocs: Vec<Relocation>,
    pub seqno: u64,
}

struct SimObject {
    data: Box<[u8]>,
    tiling: Tiling,
    stride: u32,
    gtt_offset: u64,
    last_seqno: u64,
    purgeable: bool,
    purged: bool,
}

struct SimState {
    objects: BTreeMap<Handle, SimObject>,
    next_handle: Handle,
    next_offset: u64,

    seqno: u64,
    completed: u64,
    auto_complete: bool,
    hung: bool,

    aperture: Aperture,
    num_fences: i32,
    relaxed_fencing: bool,
    has_llc: Option<bool>,

    exec_errors: VecDeque<i32>,
    throttle_errors: VecDeque<i32>,
    create_failures: usize,
    drop_purgeable: bool,
    refused_tiling: bool,

    stats: SimStats,
    executed: Vec<ExecRecord>,
}

/// Shared handle to a simulated device
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024)
    }
}

impl SimDevice {
    /// Create a device with an aperture of `aperture_size` bytes
    pub fn new(aperture_size: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                objects: BTreeMap::new(),
                next_handle: 1,
                next_offset: GTT_BASE,
                seqno: 0,
                completed: 0,
                auto_complete: true,
                hung: false,
                aperture: Aperture {
                    size: aperture_size,
                    available: aperture_size,
                },
                num_fences: 16,
                relaxed_fencing: true,
                has_llc: None,
                exec_errors: VecDeque::new(),
                throttle_errors: VecDeque::new(),
                create_failures: 0,
                drop_purgeable: false,
                refused_tiling: false,
                stats: SimStats::default(),
                executed: Vec::new(),
            })),
        }
    }

    pub fn with_fences(self, fences: i32) -> Self {
        self.state.lock().num_fences = fences;
        self
    }

    pub fn with_relaxed_fencing(self, relaxed: bool) -> Self {
        self.state.lock().relaxed_fencing = relaxed;
        self
    }

    pub fn with_llc(self, has_llc: bool) -> Self {
        self.state.lock().has_llc = Some(has_llc);
        self
    }

    /// Complete every batch as soon as it is executed (the default)
    pub fn set_auto_complete(&self, auto: bool) {
        let mut state = self.state.lock();
        state.auto_complete = auto;
        if auto {
            state.completed = state.seqno;
        }
    }

    /// Complete the oldest outstanding batch; returns false if none is left
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        if state.completed < state.seqno {
            state.completed += 1;
            true
        } else {
            false
        }
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        state.completed = state.seqno;
    }

    /// Number of executed batches the GPU has not finished yet
    pub fn pending(&self) -> u64 {
        let state = self.state.lock();
        state.seqno - state.completed
    }

    /// Fail the next `count` execbuffer calls with `errno`
    pub fn fail_exec(&self, errno: i32, count: usize) {
        let mut state = self.state.lock();
        state.exec_errors.extend(core::iter::repeat(errno).take(count));
    }

    /// Fail the next throttle call with `errno`
    pub fn fail_throttle(&self, errno: i32) {
        self.state.lock().throttle_errors.push_back(errno);
    }

    /// Fail the next `count` object creations
    pub fn fail_creates(&self, count: usize) {
        self.state.lock().create_failures += count;
    }

    /// Hang the GPU: execution, throttling and domain changes report EIO
    pub fn hang(&self) {
        self.state.lock().hung = true;
    }

    /// Keep every object linear, whatever tiling is asked for
    pub fn refuse_tiling(&self, refuse: bool) {
        self.state.lock().refused_tiling = refuse;
    }

    /// Reclaim pages of purgeable objects immediately when they are advised
    pub fn set_drop_purgeable(&self, drop: bool) {
        self.state.lock().drop_purgeable = drop;
    }

    /// Reclaim the pages of every object currently marked purgeable
    pub fn reclaim_purgeable(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for obj in state.objects.values_mut() {
            if obj.purgeable && !obj.purged {
                obj.purged = true;
                obj.data.fill(0);
                count += 1;
            }
        }
        count
    }

    /// Reclaim the pages of one purgeable object
    pub fn reclaim(&self, handle: Handle) -> bool {
        let mut state = self.state.lock();
        match state.objects.get_mut(&handle) {
            Some(obj) if obj.purgeable && !obj.purged => {
                obj.purged = true;
                obj.data.fill(0);
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Number of open objects
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn object_exists(&self, handle: Handle) -> bool {
        self.state.lock().objects.contains_key(&handle)
    }

    pub fn object_tiling(&self, handle: Handle) -> Option<(Tiling, u32)> {
        self.state
            .lock()
            .objects
            .get(&handle)
            .map(|obj| (obj.tiling, obj.stride))
    }

    pub fn object_size(&self, handle: Handle) -> Option<usize> {
        self.state.lock().objects.get(&handle).map(|obj| obj.data.len())
    }

    /// Copy of the bytes backing an object
    pub fn object_data(&self, handle: Handle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&handle)
            .map(|obj| obj.data.to_vec())
    }

    pub fn executed(&self) -> Vec<ExecRecord> {
        self.state.lock().executed.clone()
    }

    pub fn last_exec(&self) -> Option<ExecRecord> {
        self.state.lock().executed.last().cloned()
    }
}

impl SimState {
    fn object(&mut self, handle: Handle) -> Result<&mut SimObject> {
        self.objects.get_mut(&handle).ok_or(Error::new(ENOENT))
    }

    /// Block until the last batch touching `handle` has completed
    fn wait(&mut self, handle: Handle) -> Result<()> {
        if self.hung {
            return Err(Error::new(EIO));
        }
        let last = self.object(handle)?.last_seqno;
        if last > self.completed {
            self.completed = last;
        }
        Ok(())
    }

    fn execute(&mut self, exec: &mut ExecBuffer<'_>) -> Result<u64> {
        let reloc_total: usize = exec
            .objects
            .iter()
            .map(|obj| obj.relocation_count as usize)
            .sum();
        if exec.objects.is_empty() || reloc_total != exec.relocs.len() {
            return Err(Error::new(EINVAL));
        }

        // Place every object in the GTT
        for obj in exec.objects.iter_mut() {
            let next_offset = self.next_offset;
            let sim = self.object(obj.handle)?;
            if sim.purged {
                return Err(Error::new(EINVAL));
            }
            if sim.gtt_offset == 0 {
                sim.gtt_offset = next_offset;
                let len = sim.data.len() as u64;
                self.next_offset += len.max(4096);
            }
            obj.offset = self.object(obj.handle)?.gtt_offset;
        }

        // Patch relocations, object by object
        let mut relocs = exec.relocs.iter();
        for obj in exec.objects.iter() {
            for reloc in relocs.by_ref().take(obj.relocation_count as usize) {
                let target = exec
                    .objects
                    .iter()
                    .find(|candidate| candidate.handle == reloc.target_handle)
                    .ok_or(Error::new(EINVAL))?;
                let value = (target.offset as u32).wrapping_add(reloc.delta);
                let data = &mut self.object(obj.handle)?.data;
                let at = reloc.offset as usize;
                if at + 4 > data.len() {
                    return Err(Error::new(EINVAL));
                }
                data[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
        }

        self.seqno += 1;
        let seqno = self.seqno;
        for obj in exec.objects.iter() {
            self.object(obj.handle)?.last_seqno = seqno;
        }
        if self.auto_complete {
            self.completed = seqno;
        }
        Ok(seqno)
    }
}

impl GemDevice for SimDevice {
    fn create(&mut self, size: usize) -> Result<Handle> {
        let mut state = self.state.lock();
        state.stats.creates += 1;
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(Error::new(ENOMEM));
        }
        if size == 0 || size as u64 > state.aperture.size {
            return Err(Error::new(EINVAL));
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(
            handle,
            SimObject {
                data: vec![0; size].into_boxed_slice(),
                tiling: Tiling::None,
                stride: 0,
                gtt_offset: 0,
                last_seqno: 0,
                purgeable: false,
                purged: false,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) {
        let mut state = self.state.lock();
        state.stats.closes += 1;
        if state.objects.remove(&handle).is_none() {
            log::warn!("sim: close of unknown handle {}", handle);
        }
    }

    fn set_tiling(&mut self, handle: Handle, tiling: Tiling, stride: u32) -> Result<Tiling> {
        let mut state = self.state.lock();
        state.stats.set_tiling += 1;
        let tiling = if state.refused_tiling { Tiling::None } else { tiling };
        let obj = state.object(handle)?;
        obj.tiling = tiling;
        obj.stride = if tiling.is_tiled() { stride } else { 0 };
        Ok(tiling)
    }

    fn get_aperture(&mut self) -> Result<Aperture> {
        let mut state = self.state.lock();
        state.stats.get_aperture += 1;
        Ok(state.aperture)
    }

    fn get_param(&mut self, param: Param) -> Result<i32> {
        let mut state = self.state.lock();
        state.stats.get_param += 1;
        match param {
            Param::NumFencesAvail => Ok(state.num_fences),
            Param::HasRelaxedFencing => Ok(state.relaxed_fencing as i32),
            Param::HasLlc => state
                .has_llc
                .map(|llc| llc as i32)
                .ok_or(Error::new(EINVAL)),
        }
    }

    fn pwrite(&mut self, handle: Handle, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.pwrites += 1;
        let obj = state.object(handle)?;
        let end = offset.checked_add(data.len()).ok_or(Error::new(EINVAL))?;
        if end > obj.data.len() {
            return Err(Error::new(EINVAL));
        }
        obj.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn pread(&mut self, handle: Handle, offset: usize, dst: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.preads += 1;
        let obj = state.object(handle)?;
        let end = offset.checked_add(dst.len()).ok_or(Error::new(EINVAL))?;
        if end > obj.data.len() {
            return Err(Error::new(EINVAL));
        }
        dst.copy_from_slice(&obj.data[offset..end]);
        Ok(())
    }

    fn mmap_gtt(&mut self, handle: Handle, size: usize) -> Result<*mut u8> {
        let mut state = self.state.lock();
        state.stats.mmaps += 1;
        let obj = state.object(handle)?;
        if size > obj.data.len() {
            return Err(Error::new(EINVAL));
        }
        // The boxed slice never moves while the object is open
        Ok(obj.data.as_mut_ptr())
    }

    fn munmap(&mut self, _handle: Handle, _ptr: *mut u8, _size: usize) {}

    fn set_domain(&mut self, handle: Handle, _read: Domain, _write: Domain) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.set_domains += 1;
        state.wait(handle)
    }

    fn busy(&mut self, handle: Handle) -> Result<bool> {
        let mut state = self.state.lock();
        state.stats.busy_queries += 1;
        let completed = state.completed;
        let obj = state.object(handle)?;
        Ok(obj.last_seqno > completed)
    }

    fn madvise(&mut self, handle: Handle, advice: Madvise) -> Result<bool> {
        let mut state = self.state.lock();
        state.stats.madvises += 1;
        let reclaim = state.drop_purgeable;
        let obj = state.object(handle)?;
        match advice {
            Madvise::DontNeed => {
                obj.purgeable = true;
                if reclaim && !obj.purged {
                    obj.purged = true;
                    obj.data.fill(0);
                }
            }
            Madvise::WillNeed => {
                obj.purgeable = false;
            }
        }
        Ok(!obj.purged)
    }

    fn execbuffer2(&mut self, exec: &mut ExecBuffer<'_>) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.exec_attempts += 1;
        if state.hung {
            return Err(Error::new(EIO));
        }
        if let Some(errno) = state.exec_errors.pop_front() {
            return Err(Error::new(errno));
        }

        let seqno = state.execute(exec)?;
        state.stats.execs += 1;

        let batch_handle = exec.objects[exec.objects.len() - 1].handle;
        let start = exec.batch_start as usize;
        let end = start + exec.batch_len as usize;
        let batch = state.object(batch_handle)?.data[start..end]
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        let record = ExecRecord {
            ring: exec.ring,
            handles: exec.objects.iter().map(|obj| obj.handle).collect(),
            batch,
            relocs: exec.relocs.to_vec(),
            seqno,
        };
        state.executed.push(record);
        Ok(())
    }

    fn throttle(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.throttles += 1;
        if let Some(errno) = state.throttle_errors.pop_front() {
            return Err(Error::new(errno));
        }
        if state.hung {
            return Err(Error::new(EIO));
        }
        // Waiting for the backlog lets the oldest batch finish
        if state.completed < state.seqno {
            state.completed += 1;
        }
        Ok(())
    }
}
