//! Outstanding requests
//!
//! A request is one submitted batch: its anchor (the object holding the
//! command words) plus every object the batch referenced. Requests retire
//! strictly in submission order, and a request is complete once its anchor
//! is idle, because the GPU processes batches on a ring in order.

use std::collections::{BTreeSet, VecDeque};

use crate::bo::{BoId, ListId, RqLink};
use crate::kernel::GemDevice;
use crate::kgem::Kgem;
use crate::{BoDomain, BoFlags, NUM_CACHE_BUCKETS};

pub(crate) struct Request {
    pub id: u64,
    /// Object holding the command stream, owns one reference
    pub anchor: Option<BoId>,
    pub buffers: BTreeSet<BoId>,
}

impl Request {
    fn new(id: u64) -> Self {
        Self {
            id,
            anchor: None,
            buffers: BTreeSet::new(),
        }
    }
}

pub(crate) struct Requests {
    /// Request of the batch under construction
    pub current: Request,
    /// Submitted requests, oldest first
    pub outstanding: VecDeque<Request>,
    /// Released objects whose last GPU write is still being flushed
    pub flushing: VecDeque<BoId>,
    next_id: u64,
}

impl Requests {
    pub fn new() -> Self {
        Self {
            current: Request::new(0),
            outstanding: VecDeque::new(),
            flushing: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Close the current request and open a fresh one
    pub fn open(&mut self) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        core::mem::replace(&mut self.current, Request::new(id))
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut Request> {
        if self.current.id == id {
            return Some(&mut self.current);
        }
        self.outstanding.iter_mut().find(|rq| rq.id == id)
    }

    fn remove(&mut self, bo: BoId, link: RqLink) {
        match link {
            RqLink::Request(id) => {
                if let Some(rq) = self.find_mut(id) {
                    rq.buffers.remove(&bo);
                }
            }
            RqLink::Flushing => self.flushing.retain(|&flushing| flushing != bo),
        }
    }
}

impl<D: GemDevice> Kgem<D> {
    /// Make the object a member of the current request
    pub(crate) fn attach(&mut self, id: BoId) {
        self.detach_request(id);
        self.requests.current.buffers.insert(id);
        self.bos[id].rq = Some(RqLink::Request(self.requests.current.id));
    }

    pub(crate) fn detach_request(&mut self, id: BoId) {
        if let Some(link) = self.bos[id].rq.take() {
            self.requests.remove(id, link);
        }
    }

    fn cache_active(&mut self, id: BoId) {
        let bo = &self.bos[id];
        let bucket = bo.bucket();
        let list = if bucket < NUM_CACHE_BUCKETS {
            ListId::Active(bucket, bo.tiling)
        } else {
            ListId::Large
        };
        self.cache_add(id, list);
    }

    /// Retire completed requests, oldest first
    ///
    /// Stops at the first request whose anchor is still busy. Members of a
    /// retired request lose their request link; the ones nobody references
    /// any more go back through the release policy. Returns true if any
    /// object was moved to the inactive cache. Once wedged, outstanding
    /// requests are dropped without asking the kernel.
    pub fn retire(&mut self) -> bool {
        self.reap();
        if self.wedged {
            if !self.requests.outstanding.is_empty() || !self.requests.flushing.is_empty() {
                self.cleanup();
            }
            return false;
        }
        let mut retired = false;

        while let Some(&id) = self.requests.flushing.front() {
            let handle = self.bos[id].handle;
            if self.kernel_busy(handle) {
                break;
            }
            self.requests.flushing.pop_front();

            let bo = &mut self.bos[id];
            debug_assert_eq!(bo.refcnt, 0);
            bo.rq = None;
            bo.flags.remove(BoFlags::NEEDS_FLUSH);
            bo.domain = BoDomain::None;
            log::trace!("handle={} finished flushing", bo.handle);

            self.cache_remove(id);
            if self.bos[id].is_reusable() && self.set_purgeable(id) {
                self.move_to_inactive(id);
                retired = true;
            } else {
                self.free(id);
            }
        }

        while let Some(anchor) = self.requests.outstanding.front().map(|rq| rq.anchor) {
            if let Some(anchor) = anchor {
                let handle = self.bos[anchor].handle;
                if self.kernel_busy(handle) {
                    break;
                }
            }
            let Some(rq) = self.requests.outstanding.pop_front() else {
                break;
            };
            log::debug!("retiring request {} ({} buffers)", rq.id, rq.buffers.len());

            for id in rq.buffers {
                let handle = self.bos[id].handle;
                let needs_flush = self.bos[id].needs_flush() && self.kernel_busy(handle);

                let bo = &mut self.bos[id];
                bo.rq = None;
                bo.flags.set(BoFlags::NEEDS_FLUSH, needs_flush);
                if !needs_flush {
                    bo.domain = BoDomain::None;
                }
                if bo.refcnt > 0 {
                    continue;
                }

                if !bo.is_reusable() {
                    log::trace!("closing non-reusable handle={}", handle);
                    self.cache_remove(id);
                    self.free(id);
                    continue;
                }

                if needs_flush {
                    log::trace!("handle={} -> flushing", handle);
                    self.bos[id].rq = Some(RqLink::Flushing);
                    self.requests.flushing.push_back(id);
                    if self.bos[id].link.is_none() {
                        self.cache_active(id);
                    }
                    continue;
                }

                self.cache_remove(id);
                if self.set_purgeable(id) {
                    self.move_to_inactive(id);
                    retired = true;
                } else {
                    self.free(id);
                }
            }

            if let Some(anchor) = rq.anchor {
                let bo = &mut self.bos[anchor];
                bo.rq = None;
                bo.domain = BoDomain::None;
                bo.refcnt -= 1;
                debug_assert_eq!(bo.refcnt, 0);
                if self.set_purgeable(anchor) {
                    self.move_to_inactive(anchor);
                    retired = true;
                } else {
                    self.free(anchor);
                }
            }
        }

        self.retire_partials();
        self.need_retire = !self.requests.outstanding.is_empty();
        log::trace!("retire: retired? {}, outstanding {}", retired, self.requests.outstanding.len());
        retired
    }

    /// Bring an idle object's request bookkeeping up to date
    pub(crate) fn bo_retire(&mut self, id: BoId) {
        if self.bos[id].rq.is_some() {
            self.retire();
        }
        if self.bos[id].exec.is_none() {
            self.detach_request(id);
            self.bos[id].flags.remove(BoFlags::NEEDS_FLUSH);
        }
    }

    /// Number of submitted requests not yet retired
    pub fn outstanding_requests(&self) -> usize {
        self.requests.outstanding.len()
    }
}
