//! Command-submission kernel interface
//!
//! The buffer manager never talks to a kernel ABI directly. Everything it
//! needs from the kernel goes through [`GemDevice`], which mirrors the GEM
//! ioctls: object create/close, tiling, aperture queries, pread/pwrite, GTT
//! mappings with domain tracking, busy queries, purgeability advice,
//! execbuffer2 and throttle. Failures are reported as kernel errnos.

use bitflags::bitflags;
use syscall::error::Result;

/// Kernel-assigned object handle; 0 is never a valid handle
pub type Handle = u32;

/// Hardware tiling layout of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Tiling {
    #[default]
    None = 0,
    X = 1,
    Y = 2,
}

impl Tiling {
    pub const ALL: [Tiling; 3] = [Tiling::None, Tiling::X, Tiling::Y];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_tiled(self) -> bool {
        self != Tiling::None
    }
}

bitflags! {
    /// GPU cache domains used for relocations and CPU access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Domain: u32 {
        const CPU = 0x01;
        const RENDER = 0x02;
        const SAMPLER = 0x04;
        const COMMAND = 0x08;
        const INSTRUCTION = 0x10;
        const VERTEX = 0x20;
        const GTT = 0x40;
    }
}

bitflags! {
    /// Per-object execution flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExecFlags: u64 {
        /// The object must be accessed through a fence register
        const NEEDS_FENCE = 1 << 0;
    }
}

/// Command ring a batch executes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ring {
    #[default]
    Render = 1,
    Bsd = 2,
    Blt = 3,
}

/// Driver parameters that can be queried from the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    NumFencesAvail,
    HasRelaxedFencing,
    HasLlc,
}

/// Purgeability advice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Madvise {
    /// Backing pages are needed again
    WillNeed,
    /// Backing pages may be reclaimed under memory pressure
    DontNeed,
}

/// GTT aperture sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aperture {
    pub size: u64,
    pub available: u64,
}

/// One object referenced by a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecObject {
    pub handle: Handle,
    /// Number of entries of the relocation list owned by this object
    pub relocation_count: u32,
    pub alignment: u64,
    /// Presumed GTT offset on input, actual placement on output
    pub offset: u64,
    pub flags: ExecFlags,
}

/// Patch instruction for one address inside a command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relocation {
    /// Byte offset into the command buffer
    pub offset: u64,
    pub target_handle: Handle,
    pub delta: u32,
    pub read_domains: Domain,
    pub write_domain: Domain,
    pub presumed_offset: u64,
}

/// Arguments of one execbuffer2 call
///
/// The relocation list is owned by the objects in order: the first
/// `objects[0].relocation_count` entries belong to the first object, and so
/// on. The batch itself is always the last object.
#[derive(Debug)]
pub struct ExecBuffer<'a> {
    pub objects: &'a mut [ExecObject],
    pub relocs: &'a [Relocation],
    pub batch_start: u32,
    /// Length of the command stream in bytes
    pub batch_len: u32,
    pub ring: Ring,
}

/// Kernel operations needed by the buffer manager
pub trait GemDevice {
    /// Create an object of `size` bytes
    fn create(&mut self, size: usize) -> Result<Handle>;

    /// Close an object; the handle may be reused afterwards
    fn close(&mut self, handle: Handle);

    /// Change the tiling of an object and return the tiling now in effect
    fn set_tiling(&mut self, handle: Handle, tiling: Tiling, stride: u32) -> Result<Tiling>;

    fn get_aperture(&mut self) -> Result<Aperture>;

    fn get_param(&mut self, param: Param) -> Result<i32>;

    /// Copy `data` into the object at `offset`
    fn pwrite(&mut self, handle: Handle, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy `dst.len()` bytes starting at `offset` out of the object
    fn pread(&mut self, handle: Handle, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Map the object through the GTT aperture
    fn mmap_gtt(&mut self, handle: Handle, size: usize) -> Result<*mut u8>;

    fn munmap(&mut self, handle: Handle, ptr: *mut u8, size: usize);

    /// Move the object into the given domains, waiting for the GPU if needed
    fn set_domain(&mut self, handle: Handle, read: Domain, write: Domain) -> Result<()>;

    /// Non-blocking query of outstanding GPU activity on the object
    fn busy(&mut self, handle: Handle) -> Result<bool>;

    /// Advise the kernel about the object's backing pages; returns whether
    /// the pages are still retained
    fn madvise(&mut self, handle: Handle, advice: Madvise) -> Result<bool>;

    fn execbuffer2(&mut self, exec: &mut ExecBuffer<'_>) -> Result<()>;

    /// Wait for the submission backlog to drain; EIO means the GPU hung
    fn throttle(&mut self) -> Result<()>;
}
