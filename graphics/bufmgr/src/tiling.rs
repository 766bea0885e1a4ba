//! Tile geometry and surface layout rules

use bitflags::bitflags;

use crate::config::Limits;
use crate::kernel::Tiling;
use crate::{page_align, MAX_SHORT};

/// Result of [`choose_tiling`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingChoice {
    pub tiling: Tiling,
    /// The hardware requires exactly this tiling; callers must not
    /// fall back to another layout
    pub exact: bool,
}

impl TilingChoice {
    fn preferred(tiling: Tiling) -> Self {
        Self {
            tiling,
            exact: false,
        }
    }

    fn exact(tiling: Tiling) -> Self {
        Self {
            tiling,
            exact: true,
        }
    }
}

bitflags! {
    /// Where an object of a given shape can be placed
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CanCreate: u32 {
        const CPU = 1 << 0;
        const GPU = 1 << 1;
        const LARGE = 1 << 2;
    }
}

/// Tile width in bytes and height in rows used for pitch/size alignment
fn tile_dims(gen: u32, scanout: bool, bpp: u32, tiling: Tiling) -> (u32, u32) {
    let untiled_width = if scanout { 64 } else { 4 * bpp / 8 };
    if gen <= 30 {
        match tiling {
            Tiling::None => (untiled_width, 4),
            _ if gen < 30 => (512, 16),
            _ => (512, 8),
        }
    } else {
        match tiling {
            Tiling::None => (untiled_width, 2),
            Tiling::X => (512, 8),
            Tiling::Y => (128, 32),
        }
    }
}

fn align_to(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

/// Byte size and pitch of a `width`x`height` surface
///
/// Returns `None` when the blitter cannot address the pitch. On hardware
/// without relaxed fencing a tiled surface occupies a whole power-of-two
/// fence region.
pub fn surface_size(
    gen: u32,
    relaxed_fencing: bool,
    scanout: bool,
    width: u32,
    height: u32,
    bpp: u32,
    tiling: Tiling,
) -> Option<(usize, u32)> {
    debug_assert!(width <= MAX_SHORT && height <= MAX_SHORT);

    let (tile_width, tile_height) = tile_dims(gen, scanout, bpp, tiling);
    let mut pitch = align_to(width * bpp / 8, tile_width);
    let height = align_to(height, tile_height) as usize;
    if gen >= 40 {
        return Some((page_align(pitch as usize * height), pitch));
    }

    if tiling.is_tiled() {
        if pitch > 8192 {
            return None;
        }
        pitch = pitch.max(tile_width).next_power_of_two();
    } else if pitch >= 32768 {
        return None;
    }

    let size = pitch as usize * height;
    if relaxed_fencing || !tiling.is_tiled() {
        return Some((page_align(size), pitch));
    }

    let mut fence = if gen < 30 { 512 * 1024 } else { 1024 * 1024 };
    while fence < size {
        fence *= 2;
    }
    Some((fence, pitch))
}

/// Height rounded up to the tile height of `tiling`
pub fn aligned_height(gen: u32, height: u32, tiling: Tiling) -> u32 {
    let tile_height = if gen <= 30 {
        match tiling {
            Tiling::None => 1,
            _ if gen < 30 => 16,
            _ => 8,
        }
    } else {
        match tiling {
            Tiling::None => 2,
            Tiling::X => 8,
            Tiling::Y => 32,
        }
    };
    align_to(height, tile_height)
}

/// Pitch of an untiled surface
pub fn untiled_pitch(width: u32, bpp: u32, scanout: bool) -> u32 {
    let bytes = align_to(width, 4) * bpp / 8;
    align_to(bytes, if scanout { 64 } else { 4 })
}

/// Size of the fence region covering a tiled object on pre-gen4 hardware
pub fn fenced_size(gen: u32, size: usize) -> usize {
    debug_assert!(gen < 40);
    let mut fence = if gen < 30 { 512 * 1024 } else { 1024 * 1024 };
    while fence < size {
        fence *= 2;
    }
    fence
}

/// Pick the tiling for a surface, given the caller's preference
///
/// Tiling is dropped for shapes where it costs more than it saves, and
/// forced (marked exact) where the hardware cannot handle the surface
/// untiled.
pub fn choose_tiling(gen: u32, tiling: Tiling, width: u32, height: u32, bpp: u32) -> TilingChoice {
    let row_bits = width * bpp;

    if gen < 40 {
        if tiling.is_tiled() && row_bits > 8192 * 8 {
            log::trace!("choose_tiling: pitch too large for tiling [{}]", row_bits / 8);
            return TilingChoice::preferred(Tiling::None);
        }
    } else if row_bits > (MAX_SHORT - 512) * 8 {
        log::trace!("choose_tiling: large pitch [{}], forcing X", row_bits / 8);
        return TilingChoice::exact(if tiling.is_tiled() { tiling } else { Tiling::X });
    } else if tiling.is_tiled() && (width | height) > 8192 {
        log::trace!("choose_tiling: large tiled buffer [{}x{}], forcing X", width, height);
        return TilingChoice::exact(Tiling::X);
    }

    let mut tiling = tiling;
    if tiling.is_tiled() && height == 1 {
        return TilingChoice::preferred(Tiling::None);
    }
    if tiling == Tiling::Y && height <= 16 {
        tiling = Tiling::X;
    }
    if tiling.is_tiled() && row_bits > 8 * (4096 - 64) {
        // TLB miss between lines
        return TilingChoice::exact(tiling);
    }
    if tiling == Tiling::X && height < 4 {
        return TilingChoice::preferred(Tiling::None);
    }
    if tiling == Tiling::X && row_bits <= 8 * 512 / 2 {
        return TilingChoice::preferred(Tiling::None);
    }
    if tiling == Tiling::Y && row_bits <= 8 * 128 / 2 {
        return TilingChoice::preferred(Tiling::None);
    }
    if tiling.is_tiled() && align_to(height, 2) * align_to(row_bits, 8 * 64) <= 4096 * 8 {
        return TilingChoice::preferred(Tiling::None);
    }
    if tiling.is_tiled() && row_bits >= 8 * 4096 / 2 {
        // TLB near-miss between lines
        return TilingChoice::exact(tiling);
    }

    TilingChoice::preferred(tiling)
}

/// Bits per pixel used to store a drawable of `depth`
pub fn bits_per_pixel(depth: u32) -> u32 {
    match depth {
        0..=8 => 8,
        9..=16 => 16,
        _ => 32,
    }
}

/// Capacity pre-check for a `width`x`height` surface of `depth`
///
/// Empty when the surface cannot be created at all.
pub fn can_create_2d(limits: &Limits, width: u32, height: u32, depth: u32) -> CanCreate {
    if depth < 8 {
        log::debug!("can_create_2d: unhandled depth {}", depth);
        return CanCreate::empty();
    }
    if width > MAX_SHORT || height > MAX_SHORT {
        log::debug!("can_create_2d: unhandled size {}x{}", width, height);
        return CanCreate::empty();
    }
    let bpp = bits_per_pixel(depth);
    let mut flags = CanCreate::empty();

    let untiled = surface_size(limits.gen, false, false, width, height, bpp, Tiling::None)
        .map_or(0, |(size, _)| size);
    if untiled > 0 && untiled <= limits.max_cpu_size {
        flags |= CanCreate::CPU | CanCreate::GPU;
    }
    if untiled > limits.large_object_size {
        flags |= CanCreate::LARGE;
    }
    if untiled > limits.max_object_size {
        log::debug!(
            "can_create_2d: too large (untiled) {} > {}",
            untiled,
            limits.max_object_size
        );
        return CanCreate::empty();
    }

    let choice = choose_tiling(limits.gen, Tiling::X, width, height, bpp);
    let tiled = surface_size(limits.gen, false, false, width, height, bpp, choice.tiling)
        .map_or(0, |(size, _)| size);
    if tiled > 0 && tiled <= limits.max_gpu_size {
        flags |= CanCreate::GPU;
    }
    if tiled > limits.large_object_size {
        flags |= CanCreate::LARGE;
    }
    if tiled > limits.max_object_size {
        log::debug!(
            "can_create_2d: too large (tiled) {} > {}",
            tiled,
            limits.max_object_size
        );
        return CanCreate::empty();
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untiled_800x600_gen6() {
        let (size, pitch) = surface_size(60, true, false, 800, 600, 32, Tiling::None).unwrap();
        assert_eq!(pitch, 3200);
        assert_eq!(size, 1_921_024);
    }

    #[test]
    fn test_tiled_pitch_alignment() {
        let (_, pitch) = surface_size(60, true, false, 800, 600, 32, Tiling::X).unwrap();
        assert_eq!(pitch % 512, 0);
        let (_, pitch) = surface_size(60, true, false, 800, 600, 32, Tiling::Y).unwrap();
        assert_eq!(pitch % 128, 0);
    }

    #[test]
    fn test_fence_region_without_relaxed_fencing() {
        let (size, pitch) = surface_size(30, false, false, 800, 600, 32, Tiling::X).unwrap();
        assert_eq!(pitch, 4096);
        assert_eq!(size, 4 * 1024 * 1024);
        assert!(size.is_power_of_two());

        let (relaxed, _) = surface_size(30, true, false, 800, 600, 32, Tiling::X).unwrap();
        assert_eq!(relaxed, 4096 * 600);
    }

    #[test]
    fn test_pitch_limits_pre_gen4() {
        assert!(surface_size(30, true, false, 4096, 16, 32, Tiling::X).is_none());
        assert!(surface_size(30, true, false, 8192, 16, 32, Tiling::None).is_none());
        assert!(surface_size(60, true, false, 8192, 16, 32, Tiling::None).is_some());
    }

    #[test]
    fn test_choose_tiling() {
        assert_eq!(
            choose_tiling(60, Tiling::X, 1024, 1, 32),
            TilingChoice::preferred(Tiling::None)
        );
        assert_eq!(choose_tiling(60, Tiling::Y, 1024, 8, 32).tiling, Tiling::X);
        assert_eq!(
            choose_tiling(60, Tiling::X, 64, 64, 32),
            TilingChoice::preferred(Tiling::None)
        );
        assert_eq!(
            choose_tiling(60, Tiling::X, 1024, 768, 32),
            TilingChoice::exact(Tiling::X)
        );
        assert_eq!(
            choose_tiling(60, Tiling::X, 800, 600, 16),
            TilingChoice::preferred(Tiling::X)
        );
        assert_eq!(
            choose_tiling(60, Tiling::None, 20000, 4, 32),
            TilingChoice::exact(Tiling::X)
        );
    }

    #[test]
    fn test_aligned_height() {
        assert_eq!(aligned_height(60, 601, Tiling::None), 602);
        assert_eq!(aligned_height(60, 601, Tiling::X), 608);
        assert_eq!(aligned_height(60, 601, Tiling::Y), 608);
        assert_eq!(aligned_height(22, 601, Tiling::X), 608);
        assert_eq!(aligned_height(30, 601, Tiling::None), 601);
    }

    #[test]
    fn test_fenced_size() {
        assert_eq!(fenced_size(22, 4096), 512 * 1024);
        assert_eq!(fenced_size(30, 4096), 1024 * 1024);
        assert_eq!(fenced_size(30, 3 * 1024 * 1024), 4 * 1024 * 1024);
    }
}
