//! Fork-join CPU composition
//!
//! Fallback paths composite pixels on the CPU. Large images are split into
//! bands of rows and each band is processed on its own scoped thread; the
//! call returns once every band is done. Workers only ever see the pixel
//! slices they are handed, never the buffer manager.

use crate::{Error, Result};

/// Images with fewer rows per worker than this stay on the calling thread
const MIN_ROWS_PER_BAND: usize = 16;

/// Bounded pool of composition workers
#[derive(Debug, Clone, Copy)]
pub struct ComposePool {
    workers: usize,
}

impl ComposePool {
    /// Pool of `workers` threads, one per CPU if 0
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        log::debug!("compose: {} workers", workers);
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f(y, row)` on each of `height` rows of `width` pixels
    ///
    /// Rows are `stride` pixels apart in `dst`.
    pub fn for_each_row<F>(&self, dst: &mut [u32], stride: usize, width: usize, height: usize, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [u32]) + Sync,
    {
        if height == 0 || width == 0 {
            return Ok(());
        }
        if width > stride || dst.len() < (height - 1) * stride + width {
            return Err(Error::InvalidParameter);
        }
        let end = (height * stride).min(dst.len());
        let dst = &mut dst[..end];

        let bands = self.workers.min(height / MIN_ROWS_PER_BAND).max(1);
        if bands == 1 {
            run_band(dst, 0, stride, width, &f);
            return Ok(());
        }

        let rows_per_band = height.div_ceil(bands);
        let f = &f;
        std::thread::scope(|s| {
            for (i, band) in dst.chunks_mut(rows_per_band * stride).enumerate() {
                s.spawn(move || run_band(band, i * rows_per_band, stride, width, f));
            }
        });
        Ok(())
    }

    /// Composite premultiplied ARGB `src` over `dst`
    pub fn blend_over(
        &self,
        dst: &mut [u32],
        dst_stride: usize,
        src: &[u32],
        src_stride: usize,
        width: usize,
        height: usize,
    ) -> Result<()> {
        if height == 0 || width == 0 {
            return Ok(());
        }
        if width > src_stride || src.len() < (height - 1) * src_stride + width {
            return Err(Error::InvalidParameter);
        }
        self.for_each_row(dst, dst_stride, width, height, |y, row| {
            let src = &src[y * src_stride..y * src_stride + width];
            for (d, &s) in row.iter_mut().zip(src) {
                *d = over(s, *d);
            }
        })
    }

    /// Fill a rectangle with one pixel value
    pub fn fill(&self, dst: &mut [u32], stride: usize, width: usize, height: usize, pixel: u32) -> Result<()> {
        self.for_each_row(dst, stride, width, height, |_, row| row.fill(pixel))
    }
}

impl Default for ComposePool {
    fn default() -> Self {
        Self::new(0)
    }
}

fn run_band<F>(band: &mut [u32], first_row: usize, stride: usize, width: usize, f: &F)
where
    F: Fn(usize, &mut [u32]),
{
    for (i, row) in band.chunks_mut(stride).enumerate() {
        f(first_row + i, &mut row[..width]);
    }
}

/// a * b / 255, rounded
#[inline]
fn mul_un8(a: u32, b: u32) -> u32 {
    let t = a * b + 0x80;
    ((t >> 8) + t) >> 8
}

#[inline]
fn over(src: u32, dst: u32) -> u32 {
    let ia = 255 - (src >> 24);
    if ia == 0 {
        return src;
    }
    let mut out = 0;
    for shift in [0, 8, 16, 24] {
        let s = (src >> shift) & 0xff;
        let d = (dst >> shift) & 0xff;
        out |= (s + mul_un8(d, ia)).min(255) << shift;
    }
    out
}
