//! Value-deduplicating block allocator.

use std::collections::HashMap;
use std::ops::Range;

use crate::device::{DeviceAddress, DeviceRef};
use crate::records::GpuRecord;
use crate::util::{Error, Result};

use super::{BlockAllocator, SlotHandle};

/// Block allocator that stores each distinct value once.
///
/// Values are compared by their full bit pattern, padding included, so two
/// records that differ only in a NaN payload or a padding byte are distinct.
/// Interned records are immutable; there is no `get_mut`.
pub struct InternedBlockAllocator<T: GpuRecord> {
    blocks: BlockAllocator<T>,
    lookup: HashMap<Box<[u8]>, SlotHandle>,
    ref_counts: Vec<u32>,
}

impl<T: GpuRecord> InternedBlockAllocator<T> {
    pub fn new(device: &DeviceRef, label: &str, capacity: u32, frames: usize) -> Result<Self> {
        Ok(Self {
            blocks: BlockAllocator::new(device, label, capacity, frames)?,
            lookup: HashMap::new(),
            ref_counts: vec![0; capacity as usize],
        })
    }

    /// Slot holding a bit-identical value (reference count + 1), or a new one.
    pub fn lookup_or_insert(&mut self, value: &T) -> Result<SlotHandle> {
        let key = bytemuck::bytes_of(value);
        if let Some(&handle) = self.lookup.get(key) {
            self.ref_counts[handle.index() as usize] += 1;
            return Ok(handle);
        }
        let handle = self.blocks.insert(*value)?;
        self.lookup.insert(key.into(), handle);
        self.ref_counts[handle.index() as usize] = 1;
        Ok(handle)
    }

    /// Drop one reference. Returns `true` when this freed the slot.
    pub fn release(&mut self, handle: SlotHandle) -> Result<bool> {
        let value = *self.blocks.get(handle)?;
        let count = &mut self.ref_counts[handle.index() as usize];
        *count -= 1;
        if *count > 0 {
            return Ok(false);
        }
        self.lookup.remove(bytemuck::bytes_of(&value));
        self.blocks.free(handle)?;
        Ok(true)
    }

    pub fn ref_count(&self, handle: SlotHandle) -> Result<u32> {
        if !self.blocks.is_live(handle) {
            return Err(Error::StaleHandle {
                index: handle.index(),
                generation: handle.generation(),
            });
        }
        Ok(self.ref_counts[handle.index() as usize])
    }

    pub fn get(&self, handle: SlotHandle) -> Result<&T> {
        self.blocks.get(handle)
    }

    /// Number of distinct live values.
    pub fn live_count(&self) -> u32 {
        self.blocks.live_count()
    }

    pub fn upload(&self, frame: usize) -> Result<()> {
        self.blocks.upload(frame)
    }

    pub fn upload_range(&self, frame: usize, range: Range<u32>) -> Result<()> {
        self.blocks.upload_range(frame, range)
    }

    pub fn replica_address(&self, frame: usize) -> Result<DeviceAddress> {
        self.blocks.replica_address(frame)
    }

    pub fn block_stride(&self) -> usize {
        self.blocks.block_stride()
    }

    pub fn capacity(&self) -> u32 {
        self.blocks.capacity()
    }

    pub fn frames(&self) -> usize {
        self.blocks.frames()
    }

    pub fn high_water(&self) -> u32 {
        self.blocks.high_water()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostDevice;
    use crate::records::LightRecord;
    use glam::Vec3;
    use std::sync::Arc;

    fn lights(capacity: u32) -> InternedBlockAllocator<LightRecord> {
        let device: DeviceRef = Arc::new(HostDevice::default());
        InternedBlockAllocator::new(&device, "lights", capacity, 2).unwrap()
    }

    #[test]
    fn test_equal_values_share_a_slot() {
        let mut alloc = lights(4);
        let light = LightRecord::point(Vec3::Y, Vec3::ONE, 10.0);
        let a = alloc.lookup_or_insert(&light).unwrap();
        let b = alloc.lookup_or_insert(&light).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.ref_count(a).unwrap(), 2);
        assert_eq!(alloc.live_count(), 1);

        assert!(!alloc.release(a).unwrap());
        assert!(alloc.release(b).unwrap());
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn test_distinct_values_get_distinct_slots() {
        let mut alloc = lights(4);
        let a = alloc.lookup_or_insert(&LightRecord::point(Vec3::Y, Vec3::ONE, 1.0)).unwrap();
        let b = alloc.lookup_or_insert(&LightRecord::point(Vec3::Y, Vec3::ONE, 2.0)).unwrap();
        assert_ne!(a.index(), b.index());
    }

    #[test]
    fn test_released_value_reinserted_fresh() {
        let mut alloc = lights(2);
        let light = LightRecord::directional(Vec3::Y, Vec3::ONE, 3.0);
        let a = alloc.lookup_or_insert(&light).unwrap();
        assert!(alloc.release(a).unwrap());
        assert!(alloc.release(a).is_err());

        let b = alloc.lookup_or_insert(&light).unwrap();
        assert_eq!(alloc.ref_count(b).unwrap(), 1);
        assert!(alloc.ref_count(a).is_err());
    }

    #[test]
    fn test_capacity_counts_distinct_values() {
        let mut alloc = lights(1);
        let light = LightRecord::point(Vec3::ZERO, Vec3::ONE, 1.0);
        for _ in 0..10 {
            alloc.lookup_or_insert(&light).unwrap();
        }
        let other = LightRecord::point(Vec3::X, Vec3::ONE, 1.0);
        assert!(matches!(
            alloc.lookup_or_insert(&other),
            Err(Error::CapacityExceeded { capacity: 1 })
        ));
    }
}
