//! Utility types shared by every rtcore module.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Transform3x4`], [`align_up`] - Device layout helpers

mod error;
mod math;

pub use error::*;
pub use math::*;
