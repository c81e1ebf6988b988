//! Record allocator behaviour against the host device.

mod common;

use glam::Vec3;
use rtcore::alloc::{BlockAllocator, InternedBlockAllocator};
use rtcore::device::host::{HostDevice, HostDeviceConfig};
use rtcore::device::{DeviceRef, RayTracingDevice};
use rtcore::records::{GpuRecord, InstanceRecord, LightRecord, MaterialRecord};
use rtcore::Error;
use std::sync::Arc;
use surface_params::{MaterialType, SurfaceParams};

#[test]
fn test_capacity_exceeded() {
    let (_, device) = common::host_device();
    let mut alloc = BlockAllocator::<MaterialRecord>::new(&device, "materials", 4, 2).unwrap();
    for _ in 0..4 {
        alloc.allocate().unwrap();
    }
    match alloc.allocate() {
        Err(Error::CapacityExceeded { capacity }) => assert_eq!(capacity, 4),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert_eq!(alloc.live_count(), 4);
}

#[test]
fn test_free_slot_is_reused() {
    let (_, device) = common::host_device();
    let mut alloc = BlockAllocator::<MaterialRecord>::new(&device, "materials", 4, 1).unwrap();
    let a = alloc.allocate().unwrap();
    let _b = alloc.allocate().unwrap();
    alloc.free(a).unwrap();
    let c = alloc.allocate().unwrap();
    assert_eq!(c.index(), a.index(), "freed slot should be reissued first");
    assert_ne!(c.generation(), a.generation());
    assert!(matches!(alloc.get(a), Err(Error::StaleHandle { .. })));
    assert!(alloc.get(c).is_ok());
}

#[test]
fn test_upload_visible_at_slot_stride() {
    let (_, device) = common::host_device();
    let mut alloc = BlockAllocator::<MaterialRecord>::new(&device, "materials", 8, 2).unwrap();
    let _first = alloc.insert(MaterialRecord::new(MaterialType::Lambert, SurfaceParams::default())).unwrap();
    let rec = MaterialRecord::new(MaterialType::Metal, SurfaceParams::metal(Vec3::ONE, 0.2));
    let slot = alloc.insert(rec).unwrap();
    alloc.upload(1).unwrap();

    // Host device addresses are `(buffer id << 32) | offset`
    let addr = alloc.replica_address(1).unwrap();
    let buffer = rtcore::device::BufferId((addr.0 >> 32) as u32);
    let offset = (addr.0 & 0xffff_ffff) + slot.index() as u64 * alloc.block_stride() as u64;
    let bytes = device
        .read_buffer(buffer, offset, MaterialRecord::WIRE_SIZE as u64)
        .unwrap();
    assert_eq!(bytes, bytemuck::bytes_of(&rec));

    // Replica 0 was never uploaded
    let other = alloc.replica_address(0).unwrap();
    let zeros = device
        .read_buffer(rtcore::device::BufferId((other.0 >> 32) as u32), 0, 16)
        .unwrap();
    assert!(zeros.iter().all(|&b| b == 0));
}

#[test]
fn test_interning_shares_slots() {
    let (_, device) = common::host_device();
    let mut lights = InternedBlockAllocator::<LightRecord>::new(&device, "lights", 4, 1).unwrap();
    let warm = LightRecord::point(Vec3::new(0.0, 2.0, 0.0), Vec3::new(1.0, 0.9, 0.8), 3.0);
    let cool = LightRecord::point(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.8, 0.9, 1.0), 3.0);

    let a = lights.lookup_or_insert(&warm).unwrap();
    let b = lights.lookup_or_insert(&warm).unwrap();
    let c = lights.lookup_or_insert(&cool).unwrap();
    assert_eq!(a, b);
    assert_ne!(a.index(), c.index());
    assert_eq!(lights.live_count(), 2);
    assert_eq!(lights.ref_count(a).unwrap(), 2);

    assert!(!lights.release(a).unwrap());
    assert!(lights.release(b).unwrap());
    assert_eq!(lights.live_count(), 1);

    // Released value is looked up afresh
    let d = lights.lookup_or_insert(&warm).unwrap();
    assert_eq!(lights.ref_count(d).unwrap(), 1);
}

fn device_with_alignment(alignment: u32) -> DeviceRef {
    let mut capabilities = HostDevice::default_capabilities();
    capabilities.min_storage_buffer_offset_alignment = alignment;
    Arc::new(HostDevice::new(HostDeviceConfig {
        capabilities,
        ..Default::default()
    }))
}

#[test]
fn test_stride_matches_device_layout() {
    let device = device_with_alignment(16);
    let m = BlockAllocator::<MaterialRecord>::new(&device, "m", 2, 1).unwrap();
    let i = BlockAllocator::<InstanceRecord>::new(&device, "i", 2, 1).unwrap();
    let l = BlockAllocator::<LightRecord>::new(&device, "l", 2, 1).unwrap();
    assert_eq!(m.block_stride(), MaterialRecord::WIRE_SIZE);
    assert_eq!(i.block_stride(), InstanceRecord::WIRE_SIZE);
    assert_eq!(l.block_stride(), LightRecord::WIRE_SIZE);
    for stride in [m.block_stride(), i.block_stride(), l.block_stride()] {
        assert_eq!(stride % 16, 0, "stride {stride} not 16-byte aligned");
    }
}

#[test]
fn test_stride_mismatch_detected() {
    // 80-byte material records pad to 256 on a 256-aligned device
    let device = device_with_alignment(256);
    match BlockAllocator::<MaterialRecord>::new(&device, "m", 2, 1) {
        Err(Error::StrideMismatch { expected, actual, .. }) => {
            assert_eq!(expected, 80);
            assert_eq!(actual, 256);
        }
        other => panic!("expected StrideMismatch, got {other:?}"),
    }
}
