use bufmgr::batch::RELOC_SIZE;
use bufmgr::sim::SimDevice;
use bufmgr::{
    BoDomain, BufferFlags, CanCreate, Capacity, CreateFlags, DeviceConfig, Domain, Error, Kgem,
    RelocDomains, Ring, Tiling,
};
use syscall::error::{EBUSY, EIO};

fn setup() -> (SimDevice, Kgem<SimDevice>) {
    let dev = SimDevice::default();
    let kgem = Kgem::new(dev.clone(), DeviceConfig::new(60));
    (dev, kgem)
}

#[test]
fn test_linear_reuse_returns_same_handle() {
    let (dev, mut kgem) = setup();

    let first = kgem.create_linear(10_000, CreateFlags::empty()).unwrap();
    let handle = kgem.bo(&first).handle();
    assert_eq!(kgem.bo(&first).refcount(), 1);
    drop(first);

    let second = kgem.create_linear(10_000, CreateFlags::empty()).unwrap();
    assert_eq!(kgem.bo(&second).handle(), handle);
    assert_eq!(kgem.bo(&second).refcount(), 1);
    assert!(!kgem.bo(&second).is_purged());
    assert_eq!(dev.stats().creates, 1);
}

#[test]
fn test_untiled_surface_pitch() {
    let (_dev, mut kgem) = setup();

    let bo = kgem.create_2d(800, 600, 32, Tiling::None, CreateFlags::empty()).unwrap();
    let bo = kgem.bo(&bo);
    assert_eq!(bo.tiling(), Tiling::None);
    assert_eq!(bo.pitch(), 3200);
    assert!(bo.size() >= 3200 * 600);
    assert_eq!(bo.size() % 4096, 0);
}

#[test]
fn test_relocation_table_exhaustion() {
    let (dev, mut kgem) = setup();
    let target = kgem.create_linear(4096, CreateFlags::empty()).unwrap();

    let mut count = 0;
    while kgem.check_reloc(1) {
        kgem.emit_reloc(Some(&target), RelocDomains::read(Domain::SAMPLER), 0).unwrap();
        count += 1;
    }
    assert_eq!(count, RELOC_SIZE - 4);

    // Past the pre-check the hard limit still holds
    while kgem.num_relocs() < RELOC_SIZE {
        kgem.emit_reloc(Some(&target), RelocDomains::read(Domain::SAMPLER), 0).unwrap();
    }
    assert_eq!(
        kgem.emit_reloc(Some(&target), RelocDomains::read(Domain::SAMPLER), 0),
        Err(Error::NoSpace(Capacity::Relocations))
    );
    assert_eq!(kgem.num_relocs(), RELOC_SIZE);

    kgem.submit();
    assert!(!kgem.is_wedged());
    assert_eq!(dev.stats().execs, 1);
    assert_eq!(dev.last_exec().unwrap().relocs.len(), RELOC_SIZE);
    assert_eq!(kgem.num_relocs(), 0);
}

#[test]
fn test_busy_retry_is_invisible() {
    let (dev, mut kgem) = setup();
    let throttles = dev.stats().throttles;
    dev.fail_exec(EBUSY, 3);

    kgem.emit(&[0]).unwrap();
    kgem.submit();

    assert!(!kgem.is_wedged());
    let stats = dev.stats();
    assert_eq!(stats.exec_attempts, 4);
    assert_eq!(stats.execs, 1);
    assert_eq!(stats.throttles, throttles + 3);
}

#[test]
fn test_device_error_wedges_and_cleans_up() {
    let (dev, mut kgem) = setup();

    let cached = kgem.create_linear(65536, CreateFlags::empty()).unwrap();
    let held = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    let released = kgem.create_linear(8192, CreateFlags::empty()).unwrap();
    drop(cached);
    kgem.retire();
    assert_eq!(kgem.cached_objects(), 1);

    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&held), RelocDomains::write(Domain::RENDER), 0).unwrap();
    kgem.emit_reloc(Some(&released), RelocDomains::read(Domain::RENDER), 0).unwrap();
    drop(released);

    dev.fail_exec(EIO, 1);
    kgem.submit();

    assert!(kgem.is_wedged());
    assert_eq!(kgem.cached_objects(), 0);
    assert_eq!(dev.live_objects(), 1);
    assert!(dev.object_exists(kgem.bo(&held).handle()));

    let before = dev.stats();
    assert!(kgem.create_linear(4096, CreateFlags::empty()).is_none());
    assert!(kgem.create_2d(64, 64, 32, Tiling::X, CreateFlags::empty()).is_none());
    assert!(kgem.create_buffer(64, BufferFlags::WRITE).is_none());
    assert!(kgem.create_proxy(&held, 0, 64).is_none());
    assert_eq!(kgem.emit(&[0]), Err(Error::Wedged));
    assert_eq!(
        kgem.emit_reloc(Some(&held), RelocDomains::read(Domain::RENDER), 0),
        Err(Error::Wedged)
    );
    assert_eq!(kgem.bo_write(&held, &[1, 2, 3]), Err(Error::Wedged));
    kgem.throttle();
    kgem.submit();
    assert_eq!(dev.stats(), before);
}

#[test]
fn test_proxy_shares_bytes_with_base() {
    let (_dev, mut kgem) = setup();
    let base = kgem.create_linear(65536, CreateFlags::empty()).unwrap();
    let proxy = kgem.create_proxy(&base, 1024, 256).unwrap();
    assert_eq!(kgem.bo(&proxy).handle(), kgem.bo(&base).handle());
    assert_eq!(kgem.bo(&proxy).size(), 256);

    let pattern: Vec<u8> = (0..1280).map(|i| i as u8).collect();
    kgem.bo_write(&base, &pattern).unwrap();
    let mut out = [0u8; 256];
    kgem.bo_read(&proxy, &mut out).unwrap();
    assert_eq!(&out[..], &pattern[1024..1280]);

    kgem.bo_write(&proxy, &[0xab; 256]).unwrap();
    let mut out = vec![0u8; 1280];
    kgem.bo_read(&base, &mut out).unwrap();
    assert_eq!(&out[..1024], &pattern[..1024]);
    assert!(out[1024..].iter().all(|&b| b == 0xab));
}

#[test]
fn test_refcount_reaches_cache_once() {
    let (dev, mut kgem) = setup();
    let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    let other = kgem.bo_reference(&bo);
    assert_eq!(kgem.bo(&bo).refcount(), 2);

    drop(other);
    kgem.retire();
    assert_eq!(kgem.bo(&bo).refcount(), 1);
    assert_eq!(kgem.cached_objects(), 0);

    drop(bo);
    kgem.retire();
    assert_eq!(kgem.cached_objects(), 1);
    assert_eq!(dev.live_objects(), 1);
    assert_eq!(dev.stats().closes, 0);
}

#[test]
fn test_no_reuse_while_busy() {
    let (dev, mut kgem) = setup();
    dev.set_auto_complete(false);

    let busy = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    let handle = kgem.bo(&busy).handle();
    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&busy), RelocDomains::write(Domain::RENDER), 0).unwrap();
    kgem.submit();
    assert!(kgem.is_busy(&busy));
    drop(busy);

    let fresh = kgem.create_linear(4096, CreateFlags::INACTIVE).unwrap();
    assert_ne!(kgem.bo(&fresh).handle(), handle);
    assert!(!kgem.bo(&fresh).in_request());

    dev.complete_all();
    assert!(kgem.retire());
    let reused = kgem.create_linear(4096, CreateFlags::INACTIVE).unwrap();
    assert!(!kgem.bo(&reused).in_request());
    assert!(!kgem.is_busy(&reused));
}

#[test]
fn test_requests_retire_in_order() {
    let (dev, mut kgem) = setup();
    dev.set_auto_complete(false);

    let bos: Vec<_> = (0..3)
        .map(|_| kgem.create_linear(4096, CreateFlags::empty()).unwrap())
        .collect();
    for bo in &bos {
        kgem.emit(&[0]).unwrap();
        kgem.emit_reloc(Some(bo), RelocDomains::read(Domain::RENDER), 0).unwrap();
        kgem.submit();
    }
    assert_eq!(kgem.outstanding_requests(), 3);
    assert!(bos.iter().all(|bo| kgem.bo(bo).in_request()));

    assert!(dev.complete_next());
    kgem.retire();
    assert_eq!(kgem.outstanding_requests(), 2);
    assert!(!kgem.bo(&bos[0]).in_request());
    assert!(kgem.bo(&bos[1]).in_request());
    assert!(kgem.bo(&bos[2]).in_request());

    dev.complete_all();
    kgem.retire();
    assert_eq!(kgem.outstanding_requests(), 0);
}

#[test]
fn test_empty_flush_is_idempotent() {
    let (dev, mut kgem) = setup();
    let before = dev.stats();
    kgem.submit();
    kgem.set_mode(Ring::Blt);
    kgem.set_mode(Ring::Render);
    kgem.submit();
    assert_eq!(dev.stats(), before);
    assert_eq!(kgem.outstanding_requests(), 0);
}

#[test]
fn test_ring_switch_submits() {
    let (dev, mut kgem) = setup();
    kgem.set_mode(Ring::Render);
    kgem.emit(&[0]).unwrap();
    kgem.set_mode(Ring::Blt);
    assert_eq!(dev.stats().execs, 1);
    assert_eq!(dev.last_exec().unwrap().ring, Ring::Render);
    assert_eq!(kgem.mode(), Some(Ring::Blt));
    assert_eq!(kgem.batch_used(), 0);
}

#[test]
fn test_throttle_eio_is_sticky() {
    let (dev, mut kgem) = setup();
    let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    dev.hang();
    kgem.throttle();
    assert!(kgem.is_wedged());

    let before = dev.stats();
    assert!(kgem.create_linear(4096, CreateFlags::empty()).is_none());
    assert_eq!(kgem.bo_map(&bo, bufmgr::MapAccess::Read), Err(Error::Wedged));
    assert_eq!(kgem.reserve(4), Err(Error::Wedged));
    assert_eq!(dev.stats(), before);
}

#[test]
fn test_fence_budget() {
    let dev = SimDevice::new(256 * 1024 * 1024).with_fences(4);
    let mut kgem = Kgem::new(dev.clone(), DeviceConfig::new(30));
    assert_eq!(kgem.limits().fence_max, 2);

    let surfaces: Vec<_> = (0..3)
        .map(|_| kgem.create_2d(1024, 768, 32, Tiling::X, CreateFlags::empty()).unwrap())
        .collect();
    assert!(surfaces.iter().all(|bo| kgem.bo(bo).tiling() == Tiling::X));
    assert!(!kgem.check_many_bo_fenced(&[&surfaces[0], &surfaces[1], &surfaces[2]]));
    assert!(kgem.check_many_bo_fenced(&[&surfaces[0], &surfaces[1]]));

    let fenced = RelocDomains::write(Domain::RENDER).fenced();
    for bo in &surfaces[..2] {
        assert!(kgem.check_bo_fenced(bo));
        kgem.emit_reloc(Some(bo), fenced, 0).unwrap();
    }
    assert_eq!(kgem.num_fences(), 2);
    assert!(!kgem.check_bo_fenced(&surfaces[2]));
    // Already fenced objects need no further register
    assert!(kgem.check_bo_fenced(&surfaces[0]));
    kgem.emit_reloc(Some(&surfaces[0]), fenced, 0).unwrap();
    assert_eq!(
        kgem.emit_reloc(Some(&surfaces[2]), fenced, 0),
        Err(Error::NoSpace(Capacity::Fences))
    );

    kgem.submit();
    assert_eq!(kgem.num_fences(), 0);
    assert!(kgem.check_bo_fenced(&surfaces[2]));
}

#[test]
fn test_aperture_and_exec_budget() {
    let dev = SimDevice::new(16 * 1024 * 1024);
    let mut kgem = Kgem::new(dev.clone(), DeviceConfig::new(60));
    let size = 5 * 1024 * 1024;
    let a = kgem.create_linear(size, CreateFlags::empty()).unwrap();
    let b = kgem.create_linear(size, CreateFlags::empty()).unwrap();
    let c = kgem.create_linear(size, CreateFlags::empty()).unwrap();

    assert!(kgem.check_bo(&[&a, &b]));
    assert!(!kgem.check_bo(&[&a, &b, &c]));

    kgem.add_bo(&a).unwrap();
    kgem.add_bo(&b).unwrap();
    assert_eq!(kgem.aperture_pages(), 2 * 1280);
    assert!(!kgem.check_bo(&[&c]));
    assert!(kgem.check_bo(&[&a]));
    assert!(kgem.aperture_pages() <= kgem.limits().aperture_high);

    // Skipping the check does not get the object past the budget either
    assert_eq!(kgem.add_bo(&c), Err(Error::NoSpace(Capacity::Aperture)));
    assert_eq!(
        kgem.emit_reloc(Some(&c), RelocDomains::read(Domain::SAMPLER), 0),
        Err(Error::NoSpace(Capacity::Aperture))
    );
    assert!(!kgem.bo(&c).in_batch());

    kgem.emit(&[0]).unwrap();
    kgem.submit();
    assert!(!kgem.is_wedged());
    let record = dev.last_exec().unwrap();
    assert_eq!(record.handles.len(), 3);
    assert!(!record.handles.contains(&kgem.bo(&c).handle()));
}

#[test]
fn test_exec_list_limit() {
    let (dev, mut kgem) = setup();
    let mut bos = Vec::new();
    while kgem.check_exec(1) {
        let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
        kgem.add_bo(&bo).unwrap();
        bos.push(bo);
    }
    assert_eq!(bos.len(), bufmgr::batch::EXEC_SIZE - 1);

    let extra = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    assert_eq!(kgem.add_bo(&extra), Err(Error::NoSpace(Capacity::Exec)));

    kgem.emit(&[0]).unwrap();
    kgem.submit();
    assert!(!kgem.is_wedged());
    assert_eq!(dev.last_exec().unwrap().handles.len(), bufmgr::batch::EXEC_SIZE);
}

#[test]
fn test_surface_state_is_relocated() {
    let (dev, mut kgem) = setup();
    let state = [1u32, 2, 3, 4, 5, 6, 7, 8];
    assert!(kgem.check_batch_with_surfaces(2, 1));
    let offset = kgem.alloc_surface(&state).unwrap();
    assert_eq!(offset, 4096 - 8);

    let pos = kgem.position();
    kgem.emit(&[0]).unwrap();
    let value = kgem
        .add_reloc(pos, None, RelocDomains::read(Domain::INSTRUCTION), offset * 4)
        .unwrap();
    kgem.set_dword(pos, value);
    kgem.submit();

    let record = dev.last_exec().unwrap();
    let anchor = *record.handles.last().unwrap();
    let data = dev.object_data(anchor).unwrap();
    assert_eq!(data.len(), 4096);

    // The surface region was packed against the end of a single page
    let packed = 4096 - state.len() * 4;
    let words: Vec<u32> = data[packed..]
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    assert_eq!(words, state);
    assert_eq!(record.relocs[0].target_handle, anchor);
    assert_eq!(record.relocs[0].delta, packed as u32);
    let anchor_offset = record.batch[0] - packed as u32;
    assert_ne!(anchor_offset, 0);
    assert_eq!(anchor_offset % 4096, 0);
}

#[test]
fn test_replace_bo_emits_blit() {
    let (dev, mut kgem) = setup();
    let src = kgem.create_2d(64, 64, 32, Tiling::None, CreateFlags::empty()).unwrap();
    let dst = kgem.replace_bo(&src, 64, 64, 512, 32).unwrap();

    assert_eq!(kgem.bo(&dst).pitch(), 512);
    assert!(kgem.bo(&dst).size() >= 512 * 64);
    assert_eq!(kgem.mode(), Some(Ring::Blt));
    assert_eq!(kgem.num_relocs(), 2);
    assert_eq!(kgem.batch_used(), 8);

    kgem.submit();
    let record = dev.last_exec().unwrap();
    assert_eq!(record.ring, Ring::Blt);
    assert_eq!(
        record.batch[0],
        bufmgr::XY_SRC_COPY_BLT_CMD | bufmgr::BLT_WRITE_ALPHA | bufmgr::BLT_WRITE_RGB
    );
    assert_eq!(record.batch[3], 64 << 16 | 64);
    assert_eq!(record.batch[6], kgem.bo(&src).pitch());
}

#[test]
fn test_can_create_2d() {
    let (_dev, kgem) = setup();
    let flags = kgem.can_create_2d(800, 600, 24);
    assert!(flags.contains(CanCreate::CPU | CanCreate::GPU));
    assert!(!flags.contains(CanCreate::LARGE));
    assert!(kgem.can_create_2d(800, 600, 4).is_empty());
    assert!(kgem.can_create_2d(40_000, 16, 32).is_empty());
}

#[test]
fn test_failed_create_does_not_wedge() {
    let (dev, mut kgem) = setup();
    dev.fail_creates(1);
    assert!(kgem.create_linear(4096, CreateFlags::empty()).is_none());
    assert!(!kgem.is_wedged());
    assert!(kgem.create_linear(4096, CreateFlags::empty()).is_some());
}

#[test]
fn test_sync_cpu_waits_for_gpu() {
    let (dev, mut kgem) = setup();
    dev.set_auto_complete(false);
    let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&bo), RelocDomains::write(Domain::RENDER), 0).unwrap();
    assert!(kgem.bo(&bo).is_dirty());

    kgem.bo_sync_cpu(&bo).unwrap();
    assert_eq!(dev.stats().execs, 1);
    assert_eq!(dev.pending(), 0);
    assert_eq!(kgem.bo(&bo).domain(), BoDomain::Cpu);
    assert!(!kgem.bo(&bo).in_request());
    assert!(!kgem.bo(&bo).needs_flush());
}

#[test]
fn test_flush_clears_pending_write() {
    let (dev, mut kgem) = setup();
    dev.set_auto_complete(false);
    let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&bo), RelocDomains::write(Domain::RENDER), 0).unwrap();
    kgem.clear_dirty();
    assert!(!kgem.bo(&bo).is_dirty());

    kgem.submit();
    assert!(kgem.bo(&bo).needs_flush());
    kgem.bo_flush(&bo);
    assert!(!kgem.bo(&bo).needs_flush());
    assert_eq!(dev.executed().len(), 1);
}

#[test]
fn test_wedged_context_stops_polling() {
    let (dev, mut kgem) = setup();
    dev.set_auto_complete(false);
    let bo = kgem.create_linear(4096, CreateFlags::empty()).unwrap();
    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&bo), RelocDomains::write(Domain::RENDER), 0).unwrap();
    kgem.submit();
    assert_eq!(kgem.outstanding_requests(), 1);

    dev.fail_throttle(EIO);
    kgem.throttle();
    assert!(kgem.is_wedged());

    let queries = dev.stats().busy_queries;
    assert!(!kgem.retire());
    assert_eq!(kgem.outstanding_requests(), 0);
    assert!(!kgem.is_busy(&bo));
    kgem.bo_flush(&bo);
    assert!(!kgem.bo(&bo).in_request());
    assert_eq!(dev.stats().busy_queries, queries);
}

#[test]
fn test_refused_tiling_gets_linear_pitch() {
    let (dev, mut kgem) = setup();
    dev.refuse_tiling(true);
    let bo = kgem.create_2d(200, 200, 32, Tiling::X, CreateFlags::empty()).unwrap();
    let handle = kgem.bo(&bo).handle();

    assert_eq!(kgem.bo(&bo).tiling(), Tiling::None);
    assert_eq!(kgem.bo(&bo).pitch(), 800);
    assert!(kgem.bo(&bo).size() >= 800 * 200);
    assert_eq!(dev.object_tiling(handle), Some((Tiling::None, 0)));
}
