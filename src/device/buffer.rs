//! Owned device buffer.

use crate::util::{Error, Result};

use super::{BufferDesc, BufferId, BufferUsage, DeviceAddress, DeviceRef};

/// Buffer destroyed on drop.
pub struct DeviceBuffer {
    device: DeviceRef,
    id: BufferId,
    size: u64,
    address: DeviceAddress,
}

impl DeviceBuffer {
    /// Create a buffer of `size` bytes (at least 1; devices reject empty buffers).
    pub fn new(device: &DeviceRef, label: &str, size: u64, usage: BufferUsage) -> Result<Self> {
        let size = size.max(1);
        let id = device
            .create_buffer(&BufferDesc { label, size, usage })
            .map_err(|s| Error::device("create_buffer", s))?;
        let address = match device.buffer_address(id) {
            Ok(address) => address,
            Err(s) => {
                device.destroy_buffer(id);
                return Err(Error::device("buffer_address", s));
            }
        };
        Ok(Self {
            device: device.clone(),
            id,
            size,
            address,
        })
    }

    /// Create and fill in one go.
    pub fn with_data(device: &DeviceRef, label: &str, data: &[u8], usage: BufferUsage) -> Result<Self> {
        let buffer = Self::new(device, label, data.len() as u64, usage)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.device
            .write_buffer(self.id, offset, data)
            .map_err(|s| Error::device("write_buffer", s))
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.device
            .read_buffer(self.id, offset, len)
            .map_err(|s| Error::device("read_buffer", s))
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.id);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("address", &self.address)
            .finish()
    }
}
