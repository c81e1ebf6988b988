//! Fixed-slot record allocator with per-frame device replicas.

use std::ops::Range;

use crate::device::{BufferUsage, DeviceAddress, DeviceBuffer, DeviceRef};
use crate::records::GpuRecord;
use crate::util::{align_up, Error, Result};

/// Slot reference handed out by an allocator.
///
/// `index` is what device programs see; `generation` detects use after free.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    /// Shader-visible slot index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Fixed-capacity array of `T` records mirrored into `frames` device buffers.
///
/// The CPU staging array is the source of truth. Device replica `f` is only
/// updated by [`upload`](Self::upload) / [`upload_range`](Self::upload_range)
/// for frame `f`, so a frame still in flight on the device keeps reading its
/// own copy.
pub struct BlockAllocator<T: GpuRecord> {
    label: String,
    staging: Vec<T>,
    generations: Vec<u32>,
    live: Vec<bool>,
    /// LIFO: the most recently freed slot is reissued first
    free: Vec<u32>,
    replicas: Vec<DeviceBuffer>,
    stride: usize,
    high_water: u32,
}

impl<T: GpuRecord> BlockAllocator<T> {
    /// Allocate staging and `frames` device replicas of `capacity` records.
    ///
    /// Fails with [`Error::StrideMismatch`] when `T` padded to the device's
    /// storage offset alignment is not the stride device programs index by.
    pub fn new(device: &DeviceRef, label: &str, capacity: u32, frames: usize) -> Result<Self> {
        let alignment = device.capabilities().min_storage_buffer_offset_alignment as u64;
        let stride = align_up(std::mem::size_of::<T>() as u64, alignment) as usize;
        if stride != T::WIRE_SIZE {
            return Err(Error::StrideMismatch {
                record: T::NAME,
                expected: T::WIRE_SIZE,
                actual: stride,
            });
        }
        if frames == 0 {
            return Err(Error::other(format!("{label}: at least one frame in flight is required")));
        }

        let bytes = capacity as u64 * stride as u64;
        let replicas = (0..frames)
            .map(|f| DeviceBuffer::new(device, &format!("{label}[{f}]"), bytes, BufferUsage::Storage))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(label, record = T::NAME, capacity, frames, stride, "block allocator created");

        Ok(Self {
            label: label.to_string(),
            staging: vec![T::zeroed(); capacity as usize],
            generations: vec![0; capacity as usize],
            live: vec![false; capacity as usize],
            free: (0..capacity).rev().collect(),
            replicas,
            stride,
            high_water: 0,
        })
    }

    /// Take a free slot. The record starts zeroed.
    pub fn allocate(&mut self) -> Result<SlotHandle> {
        let index = self.free.pop().ok_or(Error::CapacityExceeded {
            capacity: self.capacity(),
        })?;
        self.live[index as usize] = true;
        self.high_water = self.high_water.max(index + 1);
        Ok(SlotHandle {
            index,
            generation: self.generations[index as usize],
        })
    }

    /// Allocate and fill in one step.
    pub fn insert(&mut self, value: T) -> Result<SlotHandle> {
        let handle = self.allocate()?;
        self.staging[handle.index as usize] = value;
        Ok(handle)
    }

    /// Return a slot to the free list. The handle (and copies of it) go stale.
    pub fn free(&mut self, handle: SlotHandle) -> Result<()> {
        self.check(handle)?;
        let i = handle.index as usize;
        self.live[i] = false;
        self.generations[i] = self.generations[i].wrapping_add(1);
        self.staging[i] = T::zeroed();
        self.free.push(handle.index);
        Ok(())
    }

    pub fn get(&self, handle: SlotHandle) -> Result<&T> {
        self.check(handle)?;
        Ok(&self.staging[handle.index as usize])
    }

    /// Mutable view into the staging array; visible on the device after the next upload.
    pub fn get_mut(&mut self, handle: SlotHandle) -> Result<&mut T> {
        self.check(handle)?;
        Ok(&mut self.staging[handle.index as usize])
    }

    pub fn is_live(&self, handle: SlotHandle) -> bool {
        self.check(handle).is_ok()
    }

    fn check(&self, handle: SlotHandle) -> Result<()> {
        let i = handle.index as usize;
        let current = self.generations.get(i).copied();
        if current != Some(handle.generation) || !self.live[i] {
            return Err(Error::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            });
        }
        Ok(())
    }

    /// Copy the whole staging array into replica `frame`.
    pub fn upload(&self, frame: usize) -> Result<()> {
        self.upload_range(frame, 0..self.capacity())
    }

    /// Copy slots `[range.start, range.end)` into replica `frame`.
    pub fn upload_range(&self, frame: usize, range: Range<u32>) -> Result<()> {
        let replica = self.replica(frame)?;
        if range.start > range.end || range.end > self.capacity() {
            return Err(Error::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                capacity: self.capacity(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }
        let records = &self.staging[range.start as usize..range.end as usize];
        let offset = range.start as u64 * self.stride as u64;
        tracing::trace!(label = %self.label, frame, start = range.start, end = range.end, "upload");

        if self.stride == std::mem::size_of::<T>() {
            replica.write(offset, bytemuck::cast_slice(records))
        } else {
            let mut packed = vec![0u8; records.len() * self.stride];
            for (dst, rec) in packed.chunks_exact_mut(self.stride).zip(records) {
                let src = bytemuck::bytes_of(rec);
                dst[..src.len()].copy_from_slice(src);
            }
            replica.write(offset, &packed)
        }
    }

    fn replica(&self, frame: usize) -> Result<&DeviceBuffer> {
        self.replicas.get(frame).ok_or(Error::FrameOutOfRange {
            frame,
            frames: self.replicas.len(),
        })
    }

    /// Device address of replica `frame`, bound into dispatches.
    pub fn replica_address(&self, frame: usize) -> Result<DeviceAddress> {
        Ok(self.replica(frame)?.address())
    }

    /// Byte distance between consecutive records on the device.
    #[inline]
    pub fn block_stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.staging.len() as u32
    }

    #[inline]
    pub fn live_count(&self) -> u32 {
        self.capacity() - self.free.len() as u32
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.replicas.len()
    }

    /// One past the highest slot index ever handed out; uploads of
    /// `0..high_water()` cover every record that was ever live.
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T: GpuRecord> std::fmt::Debug for BlockAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("label", &self.label)
            .field("record", &T::NAME)
            .field("capacity", &self.capacity())
            .field("live", &self.live_count())
            .field("frames", &self.frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::{HostDevice, HostDeviceConfig};
    use crate::records::{LightRecord, MaterialRecord};
    use bytemuck::Zeroable;
    use glam::Vec3;
    use std::sync::Arc;

    fn device() -> DeviceRef {
        Arc::new(HostDevice::default())
    }

    #[test]
    fn test_capacity_exceeded() {
        let device = device();
        let mut alloc = BlockAllocator::<LightRecord>::new(&device, "lights", 4, 1).unwrap();
        for _ in 0..4 {
            alloc.allocate().unwrap();
        }
        assert!(matches!(alloc.allocate(), Err(Error::CapacityExceeded { capacity: 4 })));
    }

    #[test]
    fn test_freed_slot_reissued_first() {
        let device = device();
        let mut alloc = BlockAllocator::<LightRecord>::new(&device, "lights", 8, 1).unwrap();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        alloc.free(a).unwrap();
        let c = alloc.allocate().unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let device = device();
        let mut alloc = BlockAllocator::<LightRecord>::new(&device, "lights", 2, 1).unwrap();
        let a = alloc.allocate().unwrap();
        alloc.free(a).unwrap();
        assert!(matches!(alloc.free(a), Err(Error::StaleHandle { .. })));
        let _b = alloc.allocate().unwrap();
        assert!(alloc.get(a).is_err());
        assert!(!alloc.is_live(a));
    }

    #[test]
    fn test_upload_is_per_frame() {
        let device = device();
        let mut alloc = BlockAllocator::<LightRecord>::new(&device, "lights", 4, 2).unwrap();
        let h = alloc
            .insert(LightRecord::point(Vec3::ONE, Vec3::ONE, 2.0))
            .unwrap();
        alloc.upload(1).unwrap();

        let stride = alloc.block_stride() as u64;
        let read = |frame: usize| -> LightRecord {
            let buf = &alloc.replicas[frame];
            bytemuck::pod_read_unaligned(&buf.read(h.index() as u64 * stride, stride).unwrap())
        };
        assert_eq!(read(1), *alloc.get(h).unwrap());
        assert_eq!(read(0), LightRecord::zeroed());
    }

    #[test]
    fn test_upload_range_bounds() {
        let device = device();
        let alloc = BlockAllocator::<MaterialRecord>::new(&device, "materials", 4, 1).unwrap();
        assert!(matches!(alloc.upload_range(0, 2..5), Err(Error::RangeOutOfBounds { .. })));
        assert!(matches!(alloc.upload(3), Err(Error::FrameOutOfRange { frame: 3, frames: 1 })));
        alloc.upload_range(0, 1..1).unwrap();
    }

    #[test]
    fn test_stride_mismatch() {
        let mut caps = HostDevice::default_capabilities();
        caps.min_storage_buffer_offset_alignment = 256;
        let device: DeviceRef = Arc::new(HostDevice::new(HostDeviceConfig {
            capabilities: caps,
            ..Default::default()
        }));
        let err = BlockAllocator::<MaterialRecord>::new(&device, "materials", 4, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::StrideMismatch {
                expected: 80,
                actual: 256,
                ..
            }
        ));
    }

    #[test]
    fn test_live_count_and_high_water() {
        let device = device();
        let mut alloc = BlockAllocator::<LightRecord>::new(&device, "lights", 8, 1).unwrap();
        let handles: Vec<_> = (0..5).map(|_| alloc.allocate().unwrap()).collect();
        alloc.free(handles[1]).unwrap();
        assert_eq!(alloc.live_count(), 4);
        assert_eq!(alloc.high_water(), 5);
    }
}
