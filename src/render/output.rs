//! Host-side images and the disk writer.

use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgb32FImage, RgbImage};

use crate::util::{pixel_count, Error, Result};

use super::OutputKind;

/// Linear RGBA float image, row-major, tightly packed.
#[derive(Clone, Debug, PartialEq)]
pub struct FloatImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
}

impl FloatImage {
    /// Black image; fails when the extent does not fit in memory.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let len = pixel_count(width, height)
            .ok_or_else(|| Error::other(format!("image extent {width}x{height} overflows")))?;
        Ok(Self {
            width,
            height,
            pixels: vec![[0.0; 4]; len],
        })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Mean of the RGB channels over the whole image.
    pub fn mean_rgb(&self) -> [f32; 3] {
        let n = self.pixels.len().max(1) as f32;
        let mut sum = [0.0f32; 3];
        for p in &self.pixels {
            for c in 0..3 {
                sum[c] += p[c];
            }
        }
        sum.map(|s| s / n)
    }

    fn rgb_f32(&self) -> Vec<f32> {
        self.pixels.iter().flat_map(|p| [p[0], p[1], p[2]]).collect()
    }
}

/// Writes finished images; failures are reported, not retried.
pub trait ImageWriter: Send + Sync {
    fn write(&self, path: &Path, image: &FloatImage, kind: OutputKind, exposure: f32) -> Result<()>;
}

/// Extended Reinhard on exposure-scaled radiance, then sRGB encoding.
pub fn tone_map(image: &FloatImage, exposure: f32) -> Vec<u8> {
    image
        .pixels
        .iter()
        .flat_map(|p| [p[0], p[1], p[2]].map(|c| encode_srgb(reinhard(c * exposure))))
        .collect()
}

#[inline]
fn reinhard(c: f32) -> f32 {
    let c = c.max(0.0);
    if !c.is_finite() {
        return 1.0;
    }
    c / (1.0 + c)
}

#[inline]
fn encode_srgb(linear: f32) -> u8 {
    let s = if linear <= 0.003_130_8 {
        linear * 12.92
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    };
    (s.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// `image`-crate writer: PNG for LDR, Radiance HDR or OpenEXR for HDR.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileImageWriter;

impl ImageWriter for FileImageWriter {
    fn write(&self, path: &Path, image: &FloatImage, kind: OutputKind, exposure: f32) -> Result<()> {
        let fail = |message: String| Error::ImageWrite {
            path: path.to_path_buf(),
            message,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let result = match kind {
            OutputKind::Ldr => {
                let buf = RgbImage::from_raw(image.width, image.height, tone_map(image, exposure))
                    .ok_or_else(|| fail("pixel buffer does not match extent".into()))?;
                buf.save_with_format(path, ImageFormat::Png)
            }
            OutputKind::Hdr => {
                let buf = Rgb32FImage::from_raw(image.width, image.height, image.rgb_f32())
                    .ok_or_else(|| fail("pixel buffer does not match extent".into()))?;
                buf.save_with_format(path, hdr_format(path))
            }
        };
        result.map_err(|e| fail(e.to_string()))?;
        tracing::info!(path = %path.display(), ?kind, "image written");
        Ok(())
    }
}

fn hdr_format(path: &Path) -> ImageFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("hdr") => ImageFormat::Hdr,
        _ => ImageFormat::OpenExr,
    }
}

/// `dir/stem.<suffix>.exr` next to the final image.
pub fn intermediate_path(output: &Path, suffix: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "render".into());
    output.with_file_name(format!("{stem}.{suffix}.exr"))
}

/// Hidden sibling a file is written to before it is moved into place.
/// Keeps the extension so format selection sees the same path kind.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "render".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial{ext}"))
}

/// Output files of one render, published all together or not at all.
///
/// Each write lands in a staging file; [`commit`](Self::commit) renames them
/// over their destinations. A failed write or rename removes everything
/// staged or already published, as does dropping an uncommitted set.
#[derive(Default)]
pub(crate) struct StagedOutputs {
    staged: Vec<(PathBuf, PathBuf)>,
}

impl StagedOutputs {
    pub fn write(
        &mut self,
        writer: &dyn ImageWriter,
        path: &Path,
        image: &FloatImage,
        kind: OutputKind,
        exposure: f32,
    ) -> Result<()> {
        let staging = staging_path(path);
        self.staged.push((staging.clone(), path.to_path_buf()));
        writer.write(&staging, image, kind, exposure)
    }

    /// Move every staged file to its destination, in write order.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        let staged = std::mem::take(&mut self.staged);
        let mut published = Vec::with_capacity(staged.len());
        for (i, (staging, dest)) in staged.iter().enumerate() {
            if let Err(e) = std::fs::rename(staging, dest) {
                for path in published.iter().chain(staged[i..].iter().map(|(s, _)| s)) {
                    remove_quietly(path);
                }
                return Err(Error::ImageWrite {
                    path: dest.clone(),
                    message: e.to_string(),
                });
            }
            published.push(dest.clone());
        }
        Ok(published)
    }
}

impl Drop for StagedOutputs {
    fn drop(&mut self) {
        for (staging, _) in &self.staged {
            remove_quietly(staging);
        }
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed unpublished output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove unpublished output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_map_range() {
        let mut img = FloatImage::new(2, 1).unwrap();
        img.pixels[0] = [0.0, 0.0, 0.0, 1.0];
        img.pixels[1] = [1000.0, f32::INFINITY, -1.0, 1.0];
        let ldr = tone_map(&img, 1.0);
        assert_eq!(ldr.len(), 6);
        assert_eq!(&ldr[..3], &[0, 0, 0]);
        assert!(ldr[3] >= 254);
        assert_eq!(ldr[4], 255);
        assert_eq!(ldr[5], 0);
    }

    #[test]
    fn test_exposure_brightens() {
        let mut img = FloatImage::new(1, 1).unwrap();
        img.pixels[0] = [0.2, 0.2, 0.2, 1.0];
        assert!(tone_map(&img, 4.0)[0] > tone_map(&img, 1.0)[0]);
    }

    #[test]
    fn test_intermediate_path() {
        let p = intermediate_path(Path::new("out/final.png"), "albedo");
        assert_eq!(p, Path::new("out/final.albedo.exr"));
    }

    #[test]
    fn test_write_png_and_exr() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = FloatImage::new(4, 3).unwrap();
        img.pixels.iter_mut().for_each(|p| *p = [0.5, 0.25, 1.0, 1.0]);

        let png = dir.path().join("a.png");
        FileImageWriter.write(&png, &img, OutputKind::Ldr, 1.0).unwrap();
        let loaded = image::open(&png).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (4, 3));

        let exr = dir.path().join("a.exr");
        FileImageWriter.write(&exr, &img, OutputKind::Hdr, 1.0).unwrap();
        let loaded = image::open(&exr).unwrap().to_rgb32f();
        assert!((loaded.get_pixel(1, 1)[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_staging_keeps_extension() {
        let p = staging_path(Path::new("out/final.hdr"));
        assert_eq!(p, Path::new("out/.final.hdr.partial.hdr"));
        assert_eq!(hdr_format(&p), ImageFormat::Hdr);
    }

    #[test]
    fn test_staged_outputs_publish_together() {
        let dir = tempfile::tempdir().unwrap();
        let img = FloatImage::new(2, 2).unwrap();
        let a = dir.path().join("a.exr");
        let b = dir.path().join("b.png");

        let mut staged = StagedOutputs::default();
        staged.write(&FileImageWriter, &a, &img, OutputKind::Hdr, 1.0).unwrap();
        staged.write(&FileImageWriter, &b, &img, OutputKind::Ldr, 1.0).unwrap();
        assert!(!a.exists() && !b.exists());

        assert_eq!(staged.commit().unwrap(), vec![a.clone(), b.clone()]);
        assert!(a.exists() && b.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_failed_commit_removes_published() {
        let dir = tempfile::tempdir().unwrap();
        let img = FloatImage::new(2, 2).unwrap();
        let a = dir.path().join("a.exr");
        // A directory in the way makes the last rename fail
        let blocked = dir.path().join("blocked");
        std::fs::create_dir(&blocked).unwrap();

        let mut staged = StagedOutputs::default();
        staged.write(&FileImageWriter, &a, &img, OutputKind::Hdr, 1.0).unwrap();
        staged.write(&FileImageWriter, &blocked, &img, OutputKind::Ldr, 1.0).unwrap();
        assert!(matches!(staged.commit(), Err(Error::ImageWrite { .. })));

        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(left, vec![blocked]);
    }

    #[test]
    fn test_dropped_outputs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let img = FloatImage::new(2, 2).unwrap();
        let mut staged = StagedOutputs::default();
        staged
            .write(&FileImageWriter, &dir.path().join("a.png"), &img, OutputKind::Ldr, 1.0)
            .unwrap();
        drop(staged);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
