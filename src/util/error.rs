//! Error types for rtcore.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceStatus;

/// Main error type for rtcore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Device lacks ray tracing pipelines or acceleration structures
    #[error("Hardware ray tracing is not supported on '{0}'")]
    RayTracingUnsupported(String),

    /// Device recursion depth too low for primary + shadow rays
    #[error("Ray recursion depth {supported} is below the required {required}")]
    RecursionUnsupported { required: u32, supported: u32 },

    /// Device reports a capability value the dispatch table cannot be laid out with
    #[error("Invalid device capability: {0}")]
    InvalidCapability(String),

    /// Render target format cannot be used as a storage image
    #[error("Unsupported storage image format: {0}")]
    UnsupportedFormat(String),

    /// Block allocator has no free slots
    #[error("Block allocator capacity exceeded ({capacity} slots)")]
    CapacityExceeded { capacity: u32 },

    /// Handle refers to a slot that was freed (and maybe reissued)
    #[error("Stale slot handle: index {index}, generation {generation}")]
    StaleHandle { index: u32, generation: u32 },

    /// Padded record stride disagrees with the device-side layout
    #[error("Record '{record}' stride mismatch: device expects {expected} bytes, padded stride is {actual}")]
    StrideMismatch {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Frame replica index out of range
    #[error("Frame {frame} out of range ({frames} frames in flight)")]
    FrameOutOfRange { frame: usize, frames: usize },

    /// Slot range out of bounds for an upload
    #[error("Slot range {start}..{end} out of bounds (capacity: {capacity})")]
    RangeOutOfBounds { start: u32, end: u32, capacity: u32 },

    /// Device refused to report acceleration structure sizes
    #[error("Acceleration structure size query failed: {0}")]
    BuildSizeQueryFailed(DeviceStatus),

    /// Acceleration structure build failed on the device
    #[error("Acceleration structure build failed: {0}")]
    DeviceBuildFailed(DeviceStatus),

    /// Mesh with no triangles
    #[error("Geometry has no triangles")]
    EmptyGeometry,

    /// Instance references a bottom-level structure that was dropped
    #[error("Instance {index} references a destroyed bottom-level structure")]
    DanglingInstance { index: usize },

    /// Instance field does not fit the packed 24-bit device layout
    #[error("Instance {field} {value} does not fit in 24 bits")]
    InstanceFieldOverflow { field: &'static str, value: u32 },

    /// Pipeline creation failed
    #[error("Ray tracing pipeline creation failed: {0}")]
    PipelineCreationFailed(DeviceStatus),

    /// Generic device call failure
    #[error("Device call '{op}' failed: {status}")]
    Device { op: &'static str, status: DeviceStatus },

    /// Batch fence did not signal in time
    #[error("Batch {batch}/{total} did not complete within {timeout:?}")]
    BatchTimeout {
        batch: u32,
        total: u32,
        timeout: Duration,
    },

    /// Device was lost while rendering
    #[error("Device lost during {0}")]
    DeviceLost(&'static str),

    /// Readback copy did not finish in time
    #[error("Image readback did not complete within {0:?}")]
    ReadbackTimeout(Duration),

    /// Render parameters rejected before any work was issued
    #[error("Invalid render parameters: {0}")]
    InvalidRenderParams(String),

    /// Scene input rejected
    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    /// Image encoding or file write failed
    #[error("Failed to write image {path}: {message}")]
    ImageWrite { path: PathBuf, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization error
    #[error("Config error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid render parameters error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidRenderParams(msg.into())
    }

    /// Wrap a raw device status, promoting device loss.
    pub fn device(op: &'static str, status: DeviceStatus) -> Self {
        if status == DeviceStatus::DEVICE_LOST {
            Self::DeviceLost(op)
        } else {
            Self::Device { op, status }
        }
    }

    /// User-facing hint for errors the caller can act on.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::BatchTimeout { .. } => Some("reduce batch size and retry"),
            Error::ReadbackTimeout(_) => Some("reduce the image size and retry"),
            Error::DeviceLost(_) => Some("recreate the device and retry"),
            Error::CapacityExceeded { .. } => Some("raise the allocator capacity"),
            Error::RayTracingUnsupported(_) | Error::RecursionUnsupported { .. } => {
                Some("fall back to a non ray traced renderer")
            }
            _ => None,
        }
    }
}

/// Result type alias for rtcore operations.
pub type Result<T> = std::result::Result<T, Error>;
