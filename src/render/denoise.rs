//! Post-render denoising.
//!
//! The render loop only knows the [`Denoiser`] trait. [`BilateralDenoiser`]
//! is a CPU joint bilateral filter guided by the albedo and normal targets;
//! an ML denoiser plugs in through the same seam.

use rayon::prelude::*;

use crate::util::{Error, Result};

use super::FloatImage;

pub trait Denoiser: Send + Sync {
    fn name(&self) -> &str;

    /// Filter `color` in place. Guide images match its extent when present.
    fn denoise(&self, color: &mut FloatImage, albedo: Option<&FloatImage>, normal: Option<&FloatImage>) -> Result<()>;
}

/// Leaves the image untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl Denoiser for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn denoise(&self, _color: &mut FloatImage, _albedo: Option<&FloatImage>, _normal: Option<&FloatImage>) -> Result<()> {
        Ok(())
    }
}

/// Joint bilateral filter.
#[derive(Clone, Copy, Debug)]
pub struct BilateralDenoiser {
    pub radius: u32,
    pub sigma_spatial: f32,
    /// Luminance-difference falloff
    pub sigma_color: f32,
    pub sigma_albedo: f32,
    /// Exponent on the normal dot product
    pub normal_power: f32,
}

impl Default for BilateralDenoiser {
    fn default() -> Self {
        Self {
            radius: 3,
            sigma_spatial: 2.0,
            sigma_color: 0.6,
            sigma_albedo: 0.1,
            normal_power: 32.0,
        }
    }
}

#[inline]
fn luminance(p: &[f32; 4]) -> f32 {
    0.2126 * p[0] + 0.7152 * p[1] + 0.0722 * p[2]
}

#[inline]
fn dist2(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    (0..3).map(|c| (a[c] - b[c]) * (a[c] - b[c])).sum()
}

fn check_extent(color: &FloatImage, guide: Option<&FloatImage>, what: &str) -> Result<()> {
    match guide {
        Some(g) if (g.width, g.height) != (color.width, color.height) => Err(Error::other(format!(
            "{what} guide is {}x{}, color is {}x{}",
            g.width, g.height, color.width, color.height
        ))),
        _ => Ok(()),
    }
}

impl Denoiser for BilateralDenoiser {
    fn name(&self) -> &str {
        "bilateral"
    }

    #[tracing::instrument(skip_all, fields(width = color.width, height = color.height))]
    fn denoise(&self, color: &mut FloatImage, albedo: Option<&FloatImage>, normal: Option<&FloatImage>) -> Result<()> {
        check_extent(color, albedo, "albedo")?;
        check_extent(color, normal, "normal")?;

        let (w, h) = (color.width as i64, color.height as i64);
        let r = self.radius as i64;
        let inv_s = 1.0 / (2.0 * self.sigma_spatial * self.sigma_spatial);
        let inv_c = 1.0 / (2.0 * self.sigma_color * self.sigma_color);
        let inv_a = 1.0 / (2.0 * self.sigma_albedo * self.sigma_albedo);
        let src = &color.pixels;

        let filtered: Vec<[f32; 4]> = (0..src.len())
            .into_par_iter()
            .map(|i| {
                let (x, y) = (i as i64 % w, i as i64 / w);
                let center = &src[i];
                let lc = luminance(center);
                let mut acc = [0.0f32; 3];
                let mut wsum = 0.0f32;
                for dy in -r..=r {
                    let sy = y + dy;
                    if sy < 0 || sy >= h {
                        continue;
                    }
                    for dx in -r..=r {
                        let sx = x + dx;
                        if sx < 0 || sx >= w {
                            continue;
                        }
                        let j = (sy * w + sx) as usize;
                        let p = &src[j];
                        let dl = luminance(p) - lc;
                        let mut weight = (-((dx * dx + dy * dy) as f32) * inv_s - dl * dl * inv_c).exp();
                        if let Some(a) = albedo {
                            weight *= (-dist2(&a.pixels[i], &a.pixels[j]) * inv_a).exp();
                        }
                        if let Some(n) = normal {
                            let (a, b) = (&n.pixels[i], &n.pixels[j]);
                            let d = (a[0] * b[0] + a[1] * b[1] + a[2] * b[2]).max(0.0);
                            weight *= d.powf(self.normal_power);
                        }
                        for c in 0..3 {
                            acc[c] += p[c] * weight;
                        }
                        wsum += weight;
                    }
                }
                if wsum > 0.0 {
                    [acc[0] / wsum, acc[1] / wsum, acc[2] / wsum, center[3]]
                } else {
                    *center
                }
            })
            .collect();

        color.pixels = filtered;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(width: u32, height: u32) -> FloatImage {
        let mut img = FloatImage::new(width, height).unwrap();
        for (i, p) in img.pixels.iter_mut().enumerate() {
            let v = if i % 2 == 0 { 0.3 } else { 0.7 };
            *p = [v, v, v, 1.0];
        }
        img
    }

    fn variance(img: &FloatImage) -> f32 {
        let mean = img.mean_rgb()[0];
        img.pixels.iter().map(|p| (p[0] - mean) * (p[0] - mean)).sum::<f32>() / img.pixels.len() as f32
    }

    #[test]
    fn test_bilateral_reduces_variance() {
        let mut img = noisy(16, 16);
        let before = variance(&img);
        let mean = img.mean_rgb()[0];
        BilateralDenoiser::default().denoise(&mut img, None, None).unwrap();
        assert!(variance(&img) < before * 0.5);
        assert!((img.mean_rgb()[0] - mean).abs() < 0.05);
    }

    #[test]
    fn test_normal_edges_preserved() {
        // Left half faces +z, right half faces +x; brightness differs per half.
        let (w, h) = (8u32, 4u32);
        let mut color = FloatImage::new(w, h).unwrap();
        let mut normal = FloatImage::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) as usize;
                if x < w / 2 {
                    color.pixels[i] = [0.1, 0.1, 0.1, 1.0];
                    normal.pixels[i] = [0.0, 0.0, 1.0, 0.0];
                } else {
                    color.pixels[i] = [0.9, 0.9, 0.9, 1.0];
                    normal.pixels[i] = [1.0, 0.0, 0.0, 0.0];
                }
            }
        }
        BilateralDenoiser::default()
            .denoise(&mut color, None, Some(&normal))
            .unwrap();
        assert!((color.pixel(3, 1)[0] - 0.1).abs() < 1e-4);
        assert!((color.pixel(4, 1)[0] - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_guide_extent_mismatch() {
        let mut img = noisy(4, 4);
        let guide = FloatImage::new(2, 2).unwrap();
        assert!(BilateralDenoiser::default()
            .denoise(&mut img, Some(&guide), None)
            .is_err());
    }

    #[test]
    fn test_passthrough() {
        let mut img = noisy(2, 2);
        let copy = img.clone();
        Passthrough.denoise(&mut img, None, None).unwrap();
        assert_eq!(img, copy);
    }
}
