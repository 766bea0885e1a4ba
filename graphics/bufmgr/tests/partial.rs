use bufmgr::sim::SimDevice;
use bufmgr::{BufferFlags, DeviceConfig, Domain, GemDevice, Kgem, RelocDomains};

fn setup() -> (SimDevice, Kgem<SimDevice>) {
    let dev = SimDevice::default();
    let kgem = Kgem::new(dev.clone(), DeviceConfig::new(60));
    (dev, kgem)
}

#[test]
fn test_small_uploads_share_one_object() {
    let (dev, mut kgem) = setup();
    let a = kgem.create_buffer(100, BufferFlags::WRITE).expect("first upload buffer");
    let b = kgem.create_buffer(100, BufferFlags::WRITE).expect("second upload buffer");

    assert_eq!(kgem.bo(&a).handle(), kgem.bo(&b).handle());
    assert_eq!(kgem.bo(&a).delta(), 0);
    assert_eq!(kgem.bo(&b).delta(), 128);
    assert_eq!(kgem.partial_buffers(), 1);
    assert_eq!(dev.stats().creates, 1);

    kgem.buffer_write(&a, &[1; 100]).unwrap();
    kgem.buffer_write(&b, &[2; 100]).unwrap();
    assert!(kgem.buffer_write(&b, &[3; 101]).is_err());

    // Staged only; nothing reaches the object before submission
    let handle = kgem.bo(&a).handle();
    assert!(dev.object_data(handle).unwrap()[..100].iter().all(|&x| x == 0));

    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&a), RelocDomains::read(Domain::SAMPLER), 0).unwrap();
    kgem.emit_reloc(Some(&b), RelocDomains::read(Domain::SAMPLER), 0).unwrap();
    assert_eq!(kgem.num_exec(), 1);
    kgem.submit();

    let data = dev.object_data(handle).unwrap();
    assert!(data[..100].iter().all(|&x| x == 1));
    assert!(data[128..228].iter().all(|&x| x == 2));
    assert_eq!(kgem.partial_buffers(), 0);

    // The second reloc was offset by the proxy's position in the buffer
    let record = dev.last_exec().unwrap();
    assert_eq!(record.relocs[1].delta, 128);
    assert_eq!(record.batch[2], record.batch[1] + 128);
}

#[test]
fn test_released_tail_is_given_back() {
    let (_dev, mut kgem) = setup();
    let a = kgem.create_buffer(100, BufferFlags::WRITE).unwrap();
    let handle = kgem.bo(&a).handle();
    drop(a);

    let b = kgem.create_buffer(100, BufferFlags::WRITE).unwrap();
    assert_eq!(kgem.bo(&b).handle(), handle);
    assert_eq!(kgem.bo(&b).delta(), 0);
}

#[test]
fn test_uploads_and_downloads_do_not_mix() {
    let (_dev, mut kgem) = setup();
    let upload = kgem.create_buffer(64, BufferFlags::WRITE).unwrap();
    let download = kgem.create_buffer(64, BufferFlags::empty()).unwrap();

    assert_ne!(kgem.bo(&upload).handle(), kgem.bo(&download).handle());
    assert_eq!(kgem.partial_buffers(), 2);
    assert!(kgem.buffer_write(&download, &[1; 8]).is_err());
}

#[test]
fn test_download_reads_back_gpu_results() {
    let (dev, mut kgem) = setup();
    let bo = kgem.create_buffer(64, BufferFlags::empty()).unwrap();
    let handle = kgem.bo(&bo).handle();

    kgem.emit(&[0]).unwrap();
    kgem.emit_reloc(Some(&bo), RelocDomains::write(Domain::RENDER), 0).unwrap();
    kgem.submit();

    // Stand in for the GPU writing its results
    let mut gpu = dev.clone();
    gpu.pwrite(handle, 0, &[9; 64]).unwrap();

    kgem.buffer_read_sync(&bo).unwrap();
    assert_eq!(kgem.buffer_data(&bo).unwrap(), &[9u8; 64][..]);
    assert!(!kgem.is_busy(&bo));
}

#[test]
fn test_upload_source_image_copies_rectangle() {
    let (_dev, mut kgem) = setup();
    let (width, height, stride) = (8usize, 4usize, 32usize);
    let image: Vec<u8> = (0..stride * height).map(|i| i as u8).collect();
    assert_eq!(image.len(), width * 4 * height);

    let bo = kgem.upload_source_image(&image, stride, 2, 1, 4, 2, 32).unwrap();
    assert_eq!(kgem.bo(&bo).pitch(), 16);

    let data = kgem.buffer_data(&bo).unwrap();
    assert_eq!(&data[..16], &image[stride + 8..stride + 24]);
    assert_eq!(&data[16..32], &image[2 * stride + 8..2 * stride + 24]);

    assert!(kgem.upload_source_image(&image, stride, 0, 0, 0, 4, 32).is_none());
    assert!(kgem.upload_source_image(&image, stride, 6, 3, 4, 2, 32).is_none());
}

#[test]
fn test_odd_height_trims_padding_row() {
    let (_dev, mut kgem) = setup();
    let bo = kgem.create_buffer_2d(10, 3, 32, BufferFlags::WRITE).unwrap();
    assert_eq!(kgem.bo(&bo).pitch(), 40);
    assert_eq!(kgem.bo(&bo).size(), 3 * 40);

    // The next allocation starts right after the trimmed image
    let next = kgem.create_buffer(16, BufferFlags::WRITE).unwrap();
    assert_eq!(kgem.bo(&next).delta(), 128);
}

#[test]
fn test_inplace_buffers_without_llc() {
    let dev = SimDevice::default().with_llc(false);
    let mut kgem = Kgem::new(dev.clone(), DeviceConfig::new(40));
    assert!(!kgem.limits().has_llc);

    let inplace = kgem.create_buffer(64, BufferFlags::WRITE_INPLACE).unwrap();
    let staged = kgem.create_buffer(64, BufferFlags::WRITE).unwrap();
    assert!(kgem.buffer_is_inplace(&inplace));
    assert!(!kgem.buffer_is_inplace(&staged));
    assert_ne!(kgem.bo(&inplace).handle(), kgem.bo(&staged).handle());
    assert_eq!(kgem.partial_buffers(), 2);
}
