//! GEM buffer manager for Intel 2D acceleration
//!
//! This crate is the memory and command-submission core of an accelerated
//! 2D driver. It owns every GPU buffer object the rasterizer touches, keeps
//! released objects in size-class caches so that kernel allocations are
//! amortized across frames, and assembles command batches with their
//! relocation tables before handing them to the kernel.
//!
//! # Architecture
//!
//! - [`kernel`]: the contract with the command-submission kernel interface
//!   ([`GemDevice`]) and its wire structures
//! - [`bo`]: buffer object slots and the owning [`BoRef`] handle
//! - `cache`: inactive/active size-class buckets and the eviction policy
//! - `request`: outstanding requests and in-order retirement
//! - [`batch`]: command words, relocations and capacity checks
//! - `submit`: execution, busy retry, hang detection and cache ageing
//! - `partial`: shared upload/download buffers carved into proxies
//! - [`compose`]: fork-join CPU pixel composition
//! - [`sim`]: an in-memory kernel used by the test-suite
//!
//! # Usage
//!
//! ```ignore
//! use bufmgr::{DeviceConfig, Kgem, CreateFlags, Tiling, RelocDomains, Domain};
//!
//! let mut kgem = Kgem::new(device, DeviceConfig::new(60));
//! let dst = kgem.create_2d(800, 600, 32, Tiling::X, CreateFlags::empty())?;
//!
//! if !kgem.check_batch(8) || !kgem.check_reloc(2) || !kgem.check_bo_fenced(&dst) {
//!     kgem.submit();
//! }
//! kgem.emit(&[cmd, br13, 0, extent])?;
//! kgem.emit_reloc(Some(&dst), RelocDomains::write(Domain::RENDER).fenced(), 0)?;
//! kgem.submit();
//! ```

pub mod batch;
pub mod bo;
mod cache;
pub mod compose;
pub mod config;
pub mod kernel;
mod kgem;
mod partial;
mod request;
pub mod sim;
mod submit;
pub mod tiling;

pub use batch::{Capacity, RelocDomains};
pub use bo::{Bo, BoDomain, BoFlags, BoId, BoRef};
pub use compose::ComposePool;
pub use config::{CachePolicy, DeviceConfig, Limits};
pub use kernel::{
    Aperture, Domain, ExecBuffer, ExecFlags, ExecObject, GemDevice, Handle, Madvise, Param,
    Relocation, Ring, Tiling,
};
pub use kgem::{CreateFlags, Kgem, MapAccess};
pub use partial::BufferFlags;
pub use tiling::{CanCreate, TilingChoice};

/// Page granularity of every kernel allocation
pub const PAGE_SIZE: usize = 4096;

/// Number of size-class buckets, indexed by floor(log2(pages))
pub const NUM_CACHE_BUCKETS: usize = 16;

/// Largest dimension the blitter can address
pub const MAX_SHORT: u32 = 32767;

/// End-of-batch marker
pub const MI_BATCH_BUFFER_END: u32 = 0xA << 23;

/// No-op padding word
pub const MI_NOOP: u32 = 0;

/// Blitter source copy command header
pub const XY_SRC_COPY_BLT_CMD: u32 = (2 << 29) | (0x53 << 22) | 6;
pub const BLT_WRITE_ALPHA: u32 = 1 << 21;
pub const BLT_WRITE_RGB: u32 = 1 << 20;
pub const BLT_SRC_TILED: u32 = 1 << 15;

/// Result type for buffer manager operations
pub type Result<T> = core::result::Result<T, Error>;

/// Buffer manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device hung; acceleration is disabled for this context
    Wedged,
    /// Kernel allocation failed
    OutOfMemory,
    /// The object is still in use by the GPU
    Busy,
    /// The current batch cannot take more of the given resource
    NoSpace(Capacity),
    /// Request exceeds what the device can address
    TooLarge,
    /// Invalid parameter
    InvalidParameter,
    /// Unexpected kernel failure, carrying the errno
    Kernel(i32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Wedged => write!(f, "GPU is wedged"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Busy => write!(f, "Buffer object is busy"),
            Error::NoSpace(what) => write!(f, "Batch is full: {}", what),
            Error::TooLarge => write!(f, "Object too large for device"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::Kernel(errno) => write!(f, "Kernel error: errno {}", errno),
        }
    }
}

impl From<syscall::error::Error> for Error {
    fn from(err: syscall::error::Error) -> Self {
        match err.errno {
            syscall::error::EBUSY => Error::Busy,
            syscall::error::EIO => Error::Wedged,
            syscall::error::ENOMEM => Error::OutOfMemory,
            syscall::error::EINVAL => Error::InvalidParameter,
            errno => Error::Kernel(errno),
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub(crate) const fn align(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub(crate) const fn page_align(value: usize) -> usize {
    align(value, PAGE_SIZE)
}

#[inline]
pub(crate) const fn num_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Size-class bucket of an object spanning `num_pages` pages
#[inline]
pub(crate) fn cache_bucket(num_pages: usize) -> usize {
    debug_assert!(num_pages > 0);
    (usize::BITS - 1 - num_pages.leading_zeros()) as usize
}
