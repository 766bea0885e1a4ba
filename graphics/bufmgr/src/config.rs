//! Device description and derived limits

use std::time::Duration;

use crate::kernel::{GemDevice, Param};
use crate::PAGE_SIZE;

/// Default aperture assumed when the kernel cannot be queried
const DEFAULT_APERTURE: u64 = 64 * 1024 * 1024;

/// Objects this large or larger bypass the linear cache
const DEFAULT_MAX_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Command buffer size in dwords
const DEFAULT_BATCH_DWORDS: usize = 4 * 1024;

/// Static description of the device a buffer manager drives
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Hardware generation times ten (22 for 865G, 30 for 915, 60 for SNB...)
    pub gen: u32,
    /// CPU-mappable part of the aperture in bytes; 0 means "all of it"
    pub aperture_mappable: u64,
    /// Installed RAM in bytes; 0 means unknown
    pub total_ram: u64,
    /// Override the last-level-cache probe
    pub has_llc: Option<bool>,
    /// Largest object the linear cache will hold
    pub max_cache_size: usize,
    /// Cache reuse policy
    pub policy: CachePolicy,
}

impl DeviceConfig {
    pub fn new(gen: u32) -> Self {
        Self {
            gen,
            aperture_mappable: 0,
            total_ram: 0,
            has_llc: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            policy: CachePolicy::default(),
        }
    }

    pub fn aperture_mappable(mut self, bytes: u64) -> Self {
        self.aperture_mappable = bytes;
        self
    }

    pub fn total_ram(mut self, bytes: u64) -> Self {
        self.total_ram = bytes;
        self
    }

    pub fn has_llc(mut self, llc: bool) -> Self {
        self.has_llc = Some(llc);
        self
    }

    pub fn max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Size of the command buffer in dwords
    pub fn batch_dwords(&self) -> usize {
        // 865G cannot execute a batch spanning multiple pages
        if self.gen == 22 {
            PAGE_SIZE / 4
        } else {
            DEFAULT_BATCH_DWORDS
        }
    }
}

/// Caller-visible cache reuse policy
///
/// Allocation always looks at the inactive buckets first. Objects in the
/// active buckets may still be referenced by an unretired batch, and using
/// one means the first CPU access or tiling change can stall on the GPU.
/// These switches select which allocations may accept that stall; a
/// `CreateFlags::INACTIVE` on an individual call always wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Linear allocations may reuse active objects
    pub linear_reuse_active: bool,
    /// 2D allocations may reuse active objects
    pub surface_reuse_active: bool,
    /// Inactive objects untouched for this long are closed by expiry
    pub inactive_grace: Duration,
    /// Extra time mapped inactive objects are preserved for
    pub map_preserve: Duration,
    /// Number of GTT mappings kept open on inactive objects
    pub max_cached_maps: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            linear_reuse_active: false,
            surface_reuse_active: true,
            inactive_grace: Duration::from_secs(10),
            map_preserve: Duration::from_secs(10),
            max_cached_maps: 512,
        }
    }
}

/// Limits derived from the device description and kernel queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub gen: u32,
    pub has_llc: bool,
    pub has_relaxed_fencing: bool,

    /// Total aperture in bytes
    pub aperture_total: u64,
    /// Aperture pages a batch may reference before check_* start failing
    pub aperture_low: u64,
    /// Hard upper bound on the aperture pages referenced by one batch
    pub aperture_high: u64,
    pub aperture_mappable: u64,

    pub fence_max: u32,
    pub max_batch_size: usize,
    pub partial_buffer_size: usize,
    pub max_cache_size: usize,

    pub max_object_size: usize,
    pub max_gpu_size: usize,
    pub max_cpu_size: usize,
    pub large_object_size: usize,
}

impl Limits {
    /// Probe the device and derive every limit
    pub fn probe<D: GemDevice>(device: &mut D, config: &DeviceConfig) -> Self {
        let gen = config.gen;

        let has_relaxed_fencing = if gen < 40 {
            device
                .get_param(Param::HasRelaxedFencing)
                .map(|value| value > 0)
                .unwrap_or(false)
        } else {
            true
        };

        let has_llc = match config.has_llc {
            Some(llc) => llc,
            None => match device.get_param(Param::HasLlc) {
                Ok(value) => value > 0,
                Err(_) => {
                    log::debug!("bufmgr: no HAS_LLC param, assuming from generation");
                    gen >= 60
                }
            },
        };

        let aperture_total = match device.get_aperture() {
            Ok(aperture) => aperture.size,
            Err(err) => {
                log::warn!("bufmgr: aperture query failed: {}", err);
                DEFAULT_APERTURE
            }
        };

        let mut aperture_mappable = config.aperture_mappable;
        if aperture_mappable == 0 || aperture_mappable > aperture_total {
            aperture_mappable = aperture_total;
        }

        let aperture_high = aperture_total * 3 / 4;
        let aperture_low = aperture_total / 3;

        let mut partial_buffer_size = 64 * 1024;
        while (partial_buffer_size as u64) < aperture_mappable >> 10 {
            partial_buffer_size *= 2;
        }

        let max_cache_size = config.max_cache_size;
        let mut max_object_size = (2 * aperture_total / 3) as usize;
        let mut max_gpu_size = if has_llc {
            max_object_size
        } else {
            max_cache_size
        };
        if gen < 40 {
            // Fenced blits need the whole object inside the mappable aperture
            max_gpu_size = ((aperture_mappable / 2).min(aperture_low)) as usize;
        }

        let total_ram = if config.total_ram == 0 {
            aperture_total
        } else {
            config.total_ram
        } as usize;
        max_object_size = max_object_size.min(total_ram / 2);
        max_gpu_size = max_gpu_size.min(total_ram / 4);

        let half_gpu_max = max_gpu_size / 2;
        let mut max_cpu_size = if gen >= 40 {
            half_gpu_max
        } else {
            max_object_size
        };

        let mut large_object_size = max_cache_size.min(max_gpu_size);
        if has_llc {
            large_object_size = large_object_size.min(max_cpu_size);
        } else {
            max_cpu_size = 0;
        }

        let fence_max = match device.get_param(Param::NumFencesAvail) {
            Ok(fences) if fences - 2 >= 0 => (fences - 2) as u32,
            // minimum safe value for all hardware
            _ => 5,
        };

        Self {
            gen,
            has_llc,
            has_relaxed_fencing,
            aperture_total,
            aperture_low: aperture_low / PAGE_SIZE as u64,
            aperture_high: aperture_high / PAGE_SIZE as u64,
            aperture_mappable,
            fence_max,
            max_batch_size: config.batch_dwords(),
            partial_buffer_size,
            max_cache_size,
            max_object_size,
            max_gpu_size,
            max_cpu_size,
            large_object_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    #[test]
    fn test_limits_snb() {
        let mut dev = SimDevice::new(256 * 1024 * 1024).with_fences(16);
        let limits = Limits::probe(&mut dev, &DeviceConfig::new(60));

        assert!(limits.has_llc);
        assert!(limits.has_relaxed_fencing);
        assert_eq!(limits.fence_max, 14);
        assert_eq!(limits.aperture_high, 256 * 1024 * 1024 * 3 / 4 / 4096);
        assert_eq!(limits.aperture_low, 256 * 1024 * 1024 / 3 / 4096);
        assert_eq!(limits.partial_buffer_size, 256 * 1024);
        assert_eq!(limits.max_batch_size, 4096);
        assert!(limits.max_object_size <= 128 * 1024 * 1024);
    }

    #[test]
    fn test_limits_gen2() {
        let mut dev = SimDevice::new(64 * 1024 * 1024)
            .with_fences(0)
            .with_relaxed_fencing(false)
            .with_llc(false);
        let limits = Limits::probe(&mut dev, &DeviceConfig::new(22));

        assert!(!limits.has_llc);
        assert!(!limits.has_relaxed_fencing);
        assert_eq!(limits.fence_max, 5);
        assert_eq!(limits.max_batch_size, 1024);
        assert_eq!(limits.max_cpu_size, 0);
        assert!(limits.max_gpu_size <= limits.aperture_mappable as usize / 2);
    }
}
