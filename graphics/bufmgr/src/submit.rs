//! Batch submission
//!
//! Submitting closes the batch, uploads it into a fresh anchor object,
//! executes it and turns the current request into an outstanding one.
//! Contention is retried after throttling; any other failure of the kernel
//! wedges the context, after which every entry point fails fast.

use syscall::error::{EAGAIN, EBUSY, EINTR, EIO};

use crate::batch::{Capacity, EXEC_SIZE, RELOC_SIZE};
use crate::bo::{BoId, ExecSlot, ListId, RqLink};
use crate::kernel::{ExecBuffer, ExecObject, GemDevice};
use crate::kgem::{CreateFlags, Kgem};
use crate::{BoDomain, BoFlags, NUM_CACHE_BUCKETS};

impl<D: GemDevice> Kgem<D> {
    /// Execute the batch under construction
    ///
    /// Does nothing for an empty batch. Failures are not reported to the
    /// caller: a busy device is waited for, a hung one wedges the context.
    pub fn submit(&mut self) {
        self.reap();
        if self.batch.nbatch == 0 {
            return;
        }
        if self.wedged {
            log::debug!("submit: wedged, discarding {} words", self.batch.nbatch);
            self.cleanup();
            self.reset();
            return;
        }

        let overflow = self.overflow();
        debug_assert!(overflow.is_none(), "batch over its {:?} budget", overflow);
        if let Some(capacity) = overflow {
            log::error!("submit: batch exceeds its {} budget, dropping it", capacity);
            self.reset();
            return;
        }

        let batch_end = self.batch.end();
        self.finish_partials();
        let (size, shrink) = self.batch.compact();
        log::debug!(
            "submit: ring={:?} nbatch={} surface={} nreloc={} nexec={} nfence={} aperture={} size={}",
            self.batch.ring,
            batch_end,
            self.batch.words.len() - self.batch.surface,
            self.batch.relocs.len(),
            self.batch.exec.len(),
            self.batch.nfence,
            self.batch.aperture,
            size
        );

        let Some(anchor) = self.alloc_linear(size, CreateFlags::INACTIVE) else {
            log::warn!("submit: no object for a {} byte batch, dropping it", size);
            self.reset();
            return;
        };
        self.add_anchor(anchor);

        let handle = self.bos[anchor].handle;
        let presumed = self.bos[anchor].presumed_offset;
        self.batch.fixup_self_relocs(handle, presumed, shrink);
        match self.batch.write(&mut self.device, handle, size) {
            Ok(()) => self.execute(batch_end),
            Err(err) => {
                log::error!("submit: failed to upload the batch: {}", err);
                self.wedge();
            }
        }

        self.commit();
        self.retire();
        if self.wedged {
            self.cleanup();
        }
        self.reset();
    }

    /// The first budget the batch has outgrown, checked before the anchor
    /// takes its reserved exec slot
    fn overflow(&self) -> Option<Capacity> {
        if self.batch.relocs.len() > RELOC_SIZE {
            Some(Capacity::Relocations)
        } else if self.batch.exec.len() >= EXEC_SIZE {
            Some(Capacity::Exec)
        } else if self.batch.nfence > self.limits.fence_max {
            Some(Capacity::Fences)
        } else if self.batch.aperture > self.limits.aperture_high {
            Some(Capacity::Aperture)
        } else {
            None
        }
    }

    /// Append the anchor as the last exec object, owner of every relocation
    fn add_anchor(&mut self, anchor: BoId) {
        let index = self.batch.exec.len();
        let bo = &mut self.bos[anchor];
        self.batch.exec.push(ExecObject {
            handle: bo.handle,
            relocation_count: self.batch.relocs.len() as u32,
            offset: bo.presumed_offset,
            ..Default::default()
        });
        self.batch.exec_ids.push(anchor);
        self.batch.aperture += bo.num_pages() as u64;
        bo.exec = Some(ExecSlot::Object(index));
        bo.rq = Some(RqLink::Request(self.requests.current.id));
        self.requests.current.anchor = Some(anchor);
    }

    fn execute(&mut self, batch_end: usize) {
        loop {
            let ret = {
                let mut exec = ExecBuffer {
                    objects: &mut self.batch.exec,
                    relocs: &self.batch.relocs,
                    batch_start: 0,
                    batch_len: (batch_end * 4) as u32,
                    ring: self.batch.ring,
                };
                self.device.execbuffer2(&mut exec)
            };

            match ret {
                Ok(()) => return,
                Err(err) if err.errno == EBUSY => {
                    log::debug!("execbuffer: device busy, throttling");
                    self.throttle();
                    if self.wedged {
                        return;
                    }
                }
                Err(err) if err.errno == EINTR || err.errno == EAGAIN => continue,
                Err(err) => {
                    log::error!("execbuffer failed: {}", err);
                    #[cfg(feature = "debug-logging")]
                    self.batch.dump(err.errno);
                    self.wedge();
                    return;
                }
            }
        }
    }

    /// Record where the kernel placed each object and queue the request
    fn commit(&mut self) {
        let wedged = self.wedged;
        let exec_ids = core::mem::take(&mut self.batch.exec_ids);
        for (index, id) in exec_ids.into_iter().enumerate() {
            let offset = self.batch.exec[index].offset;
            let bo = &mut self.bos[id];
            bo.presumed_offset = offset;
            bo.exec = None;

            if bo.refcnt == 0 && (wedged || !bo.is_reusable()) {
                log::trace!("commit: closing released handle={}", bo.handle);
                self.free(id);
                continue;
            }
            bo.domain = BoDomain::Gpu;
            bo.flags.remove(BoFlags::DIRTY);
        }
        // Proxies keep their mark; it tells their release that a batch used them
        self.batch.proxies.clear();

        let rq = self.requests.open();
        log::debug!("commit: request {} with {} buffers", rq.id, rq.buffers.len());
        self.requests.outstanding.push_back(rq);
        self.need_retire = true;
    }

    /// Start a new batch, dropping whatever the current one still references
    pub(crate) fn reset(&mut self) {
        let buffers = core::mem::take(&mut self.requests.current.buffers);
        for id in buffers {
            let bo = &mut self.bos[id];
            bo.rq = None;
            bo.exec = None;
            bo.flags.remove(BoFlags::DIRTY);
            bo.domain = BoDomain::None;
            if bo.refcnt == 0 {
                self.free(id);
            }
        }
        for id in core::mem::take(&mut self.batch.proxies) {
            if let Some(bo) = self.bos.get_mut(id) {
                bo.exec = None;
            }
        }
        self.requests.current.anchor = None;
        self.batch.reset();
    }

    /// Forget every outstanding request and close what nobody references
    ///
    /// Used once the device has hung; nothing is waited for.
    pub(crate) fn cleanup(&mut self) {
        let mut closed = 0;
        while let Some(rq) = self.requests.outstanding.pop_front() {
            for id in rq.buffers {
                let bo = &mut self.bos[id];
                bo.rq = None;
                bo.domain = BoDomain::None;
                bo.flags.remove(BoFlags::NEEDS_FLUSH);
                if bo.refcnt == 0 {
                    self.free(id);
                    closed += 1;
                }
            }
            if let Some(anchor) = rq.anchor {
                let bo = &mut self.bos[anchor];
                bo.rq = None;
                bo.refcnt -= 1;
                if bo.refcnt == 0 {
                    self.free(anchor);
                    closed += 1;
                }
            }
        }

        while let Some(id) = self.requests.flushing.pop_front() {
            self.bos[id].rq = None;
            self.bos[id].flags.remove(BoFlags::NEEDS_FLUSH);
            self.free(id);
            closed += 1;
        }

        for bucket in 0..NUM_CACHE_BUCKETS {
            for id in self.cache.oldest_first(ListId::Inactive(bucket)) {
                self.free(id);
                closed += 1;
            }
        }

        self.need_retire = false;
        log::debug!("cleanup: closed {} objects", closed);
    }

    /// Wait for the submission backlog to drain
    ///
    /// An EIO from the kernel means the GPU hung and wedges the context.
    pub fn throttle(&mut self) {
        if self.wedged {
            return;
        }
        match self.device.throttle() {
            Ok(()) => {}
            Err(err) if err.errno == EIO => self.wedge(),
            Err(err) => log::warn!("throttle failed: {}", err),
        }
    }

    pub(crate) fn wedge(&mut self) {
        if !self.wedged {
            log::error!("GPU hang detected, disabling acceleration");
            self.wedged = true;
        }
    }

    /// Submit the batch if it references `id`
    pub(crate) fn bo_submit(&mut self, id: BoId) {
        if self.bos[id].exec.is_some() {
            self.submit();
        }
    }
}
