//! Renderer configuration and per-render parameters.
//!
//! Both are plain serde structs with defaults for every field, so a JSON file
//! only needs the keys it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{Error, Result};

/// Long-lived renderer settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Device replicas per record table
    pub frames_in_flight: usize,
    pub instance_capacity: u32,
    pub light_capacity: u32,
    pub material_capacity: u32,
    /// Requested pipeline recursion depth, capped at the device limit
    pub max_recursion_depth: u32,
    /// Bound on each batch fence wait
    pub batch_timeout_ms: u64,
    /// Bound on each image readback copy
    pub readback_timeout_ms: u64,
    /// Bound on each acceleration structure build
    pub build_timeout_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            instance_capacity: 4096,
            light_capacity: 256,
            material_capacity: 1024,
            max_recursion_depth: 2,
            batch_timeout_ms: 1_000,
            readback_timeout_ms: 100_000,
            build_timeout_ms: 10_000,
        }
    }
}

impl RendererConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn readback_timeout(&self) -> Duration {
        Duration::from_millis(self.readback_timeout_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Final image encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// 8-bit PNG, tone mapped
    #[default]
    Ldr,
    /// Linear float: Radiance `.hdr` or OpenEXR by extension
    Hdr,
}

/// One render request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParams {
    pub width: u32,
    pub height: u32,
    /// Total samples per pixel; a multiple of `batch_size`
    pub samples: u32,
    /// Samples per pixel per dispatch
    pub batch_size: u32,
    /// Path segments per sample
    pub max_depth: u32,
    pub denoise: bool,
    /// Exposure multiplier applied before LDR tone mapping
    pub exposure: f32,
    pub output: PathBuf,
    pub output_kind: OutputKind,
    /// Also write raw radiance (and albedo/normal when present)
    pub write_all_intermediate: bool,
    /// Render albedo/normal targets even without denoising
    pub aux_buffers: bool,
    /// Radiance of rays leaving the scene
    pub background: [f32; 3],
    pub seed: u32,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            samples: 256,
            batch_size: 64,
            max_depth: 4,
            denoise: false,
            exposure: 1.0,
            output: PathBuf::from("render.png"),
            output_kind: OutputKind::Ldr,
            write_all_intermediate: false,
            aux_buffers: false,
            background: [0.0; 3],
            seed: 0,
        }
    }
}

impl RenderParams {
    /// Reject parameters before any device work is issued.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_params(format!(
                "image extent {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_params("batch size must be at least 1"));
        }
        if self.samples == 0 || self.samples % self.batch_size != 0 {
            return Err(Error::invalid_params(format!(
                "samples ({}) must be a positive multiple of batch size ({})",
                self.samples, self.batch_size
            )));
        }
        if self.max_depth == 0 {
            return Err(Error::invalid_params("max depth must be at least 1"));
        }
        if !self.exposure.is_finite() || self.exposure <= 0.0 {
            return Err(Error::invalid_params(format!("exposure {} must be positive", self.exposure)));
        }
        if self.output.as_os_str().is_empty() {
            return Err(Error::invalid_params("output path is empty"));
        }
        Ok(())
    }

    pub fn total_batches(&self) -> u32 {
        self.samples.checked_div(self.batch_size).unwrap_or(0)
    }

    /// Albedo and normal targets are rendered.
    pub fn wants_aux(&self) -> bool {
        self.denoise || self.aux_buffers
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        let p = RenderParams::default();
        p.validate().unwrap();
        assert_eq!(p.total_batches(), 4);
    }

    #[test]
    fn test_rejects_bad_params() {
        let bad = [
            RenderParams { width: 0, ..Default::default() },
            RenderParams { batch_size: 0, ..Default::default() },
            RenderParams { samples: 100, batch_size: 64, ..Default::default() },
            RenderParams { max_depth: 0, ..Default::default() },
            RenderParams { exposure: 0.0, ..Default::default() },
        ];
        for p in bad {
            assert!(matches!(p.validate(), Err(Error::InvalidRenderParams(_))), "{p:?}");
        }
    }

    #[test]
    fn test_partial_json() {
        let p: RenderParams = serde_json::from_str(r#"{"samples": 32, "batch_size": 8, "output_kind": "hdr"}"#).unwrap();
        assert_eq!(p.total_batches(), 4);
        assert_eq!(p.output_kind, OutputKind::Hdr);
        assert_eq!(p.width, 640);
    }

    #[test]
    fn test_config_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = RendererConfig {
            batch_timeout_ms: 50,
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        let back = RendererConfig::load(&path).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.batch_timeout(), Duration::from_millis(50));
    }
}
