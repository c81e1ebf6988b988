//! Acceleration structure builds.
//!
//! Every build is the same sequence: size query, allocate storage + scratch,
//! create the structure, submit a one-shot build, block on its fence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::device::{
    AccelGeometry, AccelHandle, AccelInstance, AccelLevel, BufferUsage, DeviceBuffer, DeviceRef,
    DeviceStatus, FenceStatus, TriangleGeometry,
};
use crate::util::{Error, Result, Transform3x4};

use super::{BottomLevelInput, BottomLevelStructure, Instance, TopLevelStructure};

/// Bound on a single build's fence wait.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AccelerationStructureBuilder {
    device: DeviceRef,
    build_timeout: Duration,
}

impl AccelerationStructureBuilder {
    pub fn new(device: &DeviceRef) -> Self {
        Self {
            device: device.clone(),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Build the structure for one mesh.
    #[tracing::instrument(skip_all, fields(triangles = input.triangle_count))]
    pub fn build_bottom_level(&self, input: &BottomLevelInput) -> Result<Arc<BottomLevelStructure>> {
        if input.triangle_count == 0 || input.vertex_count == 0 {
            return Err(Error::EmptyGeometry);
        }
        let geometry = AccelGeometry::Triangles(TriangleGeometry {
            vertex_address: input.vertex_address,
            vertex_stride: input.vertex_stride,
            vertex_count: input.vertex_count,
            index_address: input.index_address,
            triangle_count: input.triangle_count,
            transform: input.transform,
        });
        let (handle, storage) = self.build(AccelLevel::Bottom, &geometry)?;
        let address = match self.device.accel_address(handle) {
            Ok(address) => address,
            Err(status) => {
                self.device.destroy_accel(handle);
                return Err(Error::device("accel_address", status));
            }
        };
        Ok(Arc::new(BottomLevelStructure {
            device: self.device.clone(),
            handle,
            address,
            triangle_count: input.triangle_count,
            _storage: storage,
        }))
    }

    /// Flatten `instances` into device records and build the top level.
    #[tracing::instrument(skip_all, fields(instances = instances.len()))]
    pub fn build_top_level(&self, instances: &[Instance]) -> Result<TopLevelStructure> {
        let mut records = Vec::with_capacity(instances.len());
        let mut referenced: Vec<Arc<BottomLevelStructure>> = Vec::new();
        let mut seen: HashSet<*const BottomLevelStructure> = HashSet::new();
        for (index, inst) in instances.iter().enumerate() {
            if inst.custom_index > AccelInstance::MAX_FIELD {
                return Err(Error::InstanceFieldOverflow {
                    field: "custom index",
                    value: inst.custom_index,
                });
            }
            if inst.dispatch_offset > AccelInstance::MAX_FIELD {
                return Err(Error::InstanceFieldOverflow {
                    field: "dispatch offset",
                    value: inst.dispatch_offset,
                });
            }
            let blas = inst.blas.upgrade().ok_or(Error::DanglingInstance { index })?;
            records.push(AccelInstance::new(
                Transform3x4::from_mat4(&inst.transform),
                inst.custom_index,
                inst.mask,
                inst.dispatch_offset,
                0,
                blas.address(),
            ));
            if seen.insert(Arc::as_ptr(&blas)) {
                referenced.push(blas);
            }
        }

        let instance_buffer = DeviceBuffer::with_data(
            &self.device,
            "tlas instances",
            bytemuck::cast_slice(&records),
            BufferUsage::AccelInput,
        )?;
        let geometry = AccelGeometry::Instances {
            address: instance_buffer.address(),
            count: records.len() as u32,
        };
        let (handle, storage) = self.build(AccelLevel::Top, &geometry)?;
        tracing::debug!(instances = records.len(), blas = referenced.len(), "top level built");

        Ok(TopLevelStructure {
            device: self.device.clone(),
            handle,
            instance_count: records.len() as u32,
            _storage: storage,
            _instances: instance_buffer,
            referenced,
        })
    }

    fn build(&self, level: AccelLevel, geometry: &AccelGeometry) -> Result<(AccelHandle, DeviceBuffer)> {
        let sizes = self
            .device
            .accel_build_sizes(geometry)
            .map_err(Error::BuildSizeQueryFailed)?;
        let label = match level {
            AccelLevel::Bottom => "blas",
            AccelLevel::Top => "tlas",
        };
        let storage = DeviceBuffer::new(&self.device, label, sizes.storage_size, BufferUsage::AccelStorage)?;
        let scratch = DeviceBuffer::new(&self.device, "accel scratch", sizes.scratch_size, BufferUsage::Scratch)?;

        let handle = self
            .device
            .create_accel(level, storage.id(), storage.size())
            .map_err(Error::DeviceBuildFailed)?;

        if let Err(err) = self.submit_and_wait(handle, geometry, &scratch) {
            self.device.destroy_accel(handle);
            return Err(err);
        }
        Ok((handle, storage))
    }

    fn submit_and_wait(&self, handle: AccelHandle, geometry: &AccelGeometry, scratch: &DeviceBuffer) -> Result<()> {
        let fence = self
            .device
            .submit_accel_build(handle, geometry, scratch.id())
            .map_err(Error::DeviceBuildFailed)?;
        match self.device.wait_for_fence(fence, self.build_timeout) {
            Ok(FenceStatus::Signaled) => Ok(()),
            Ok(FenceStatus::TimedOut) => {
                tracing::warn!(timeout = ?self.build_timeout, "acceleration structure build timed out");
                Err(Error::DeviceBuildFailed(DeviceStatus::TIMEOUT))
            }
            Err(status) => Err(Error::DeviceBuildFailed(status)),
        }
    }
}
