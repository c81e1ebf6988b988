//! Storage image readback.

use std::time::Duration;

use crate::device::{
    BufferUsage, DeviceBuffer, DeviceRef, DeviceResult, DeviceStatus, FenceStatus, ImageCopyLayout, ImageFormat,
    ImageId,
};
use crate::util::{pixel_count, Error, Result};

use super::FloatImage;

/// Storage image destroyed on drop.
pub(crate) struct RenderTarget {
    device: DeviceRef,
    id: ImageId,
    width: u32,
    height: u32,
}

impl RenderTarget {
    pub fn new(device: &DeviceRef, width: u32, height: u32) -> Result<Self> {
        let format = ImageFormat::Rgba32Float;
        if !device.capabilities().supports_storage_format(format) {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
        let id = device
            .create_storage_image(width, height, format)
            .map_err(|s| match s {
                DeviceStatus::FORMAT_NOT_SUPPORTED => Error::UnsupportedFormat(format!("{format:?}")),
                s => Error::device("create_storage_image", s),
            })?;
        Ok(Self {
            device: device.clone(),
            id,
            width,
            height,
        })
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Copy to a host-visible buffer and unpack to tight rows.
    pub fn read(&self, timeout: Duration) -> Result<FloatImage> {
        let layout = self
            .device
            .image_copy_layout(self.id)
            .map_err(|s| Error::device("image_copy_layout", s))?;
        let buffer = DeviceBuffer::new(&self.device, "readback", layout.size, BufferUsage::Readback)?;
        let fence = self
            .device
            .submit_image_copy(self.id, buffer.id())
            .map_err(|s| Error::device("image copy", s))?;
        copy_finished(self.device.wait_for_fence(fence, timeout), timeout)?;
        let bytes = buffer.read(0, layout.size)?;
        unpack_rows(&bytes, &layout, self.width, self.height)
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.device.destroy_image(self.id);
    }
}

/// A copy fence that times out, either way the device reports it, is a readback timeout.
fn copy_finished(wait: DeviceResult<FenceStatus>, timeout: Duration) -> Result<()> {
    match wait {
        Ok(FenceStatus::Signaled) => Ok(()),
        Ok(FenceStatus::TimedOut) | Err(DeviceStatus::TIMEOUT) => Err(Error::ReadbackTimeout(timeout)),
        Err(s) => Err(Error::device("image copy", s)),
    }
}

/// Strip row padding from an RGBA32F copy.
pub fn unpack_rows(bytes: &[u8], layout: &ImageCopyLayout, width: u32, height: u32) -> Result<FloatImage> {
    let row_bytes = width as usize * 16;
    let pitch = layout.row_pitch as usize;
    if pitch < row_bytes || layout.rows < height || bytes.len() < pitch * (height as usize).saturating_sub(1) + row_bytes {
        return Err(Error::other(format!(
            "readback layout (pitch {pitch}, {} rows, {} bytes) too small for {width}x{height}",
            layout.rows,
            bytes.len()
        )));
    }
    let len = pixel_count(width, height)
        .ok_or_else(|| Error::other(format!("image extent {width}x{height} overflows")))?;
    let mut pixels = Vec::with_capacity(len);
    for y in 0..height as usize {
        let row = &bytes[y * pitch..y * pitch + row_bytes];
        pixels.extend(row.chunks_exact(16).map(bytemuck::pod_read_unaligned::<[f32; 4]>));
    }
    Ok(FloatImage { width, height, pixels })
}
