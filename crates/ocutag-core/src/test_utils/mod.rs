//! Synthetic images for tests and benchmarks.
//!
//! All renderers are deterministic: noise and textures are drawn from a seeded
//! `ChaCha8Rng`.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

mod qr_symbol;
mod scene;

pub use qr_symbol::qr_symbol_modules;
pub use scene::{BRIGHT, DARK, TagScene};

use crate::image::OwnedImage;
use nalgebra::Vector2;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Add zero-mean Gaussian noise to every pixel.
pub fn add_gaussian_noise(image: &mut OwnedImage, sigma: f64, seed: u64) {
    let Ok(normal) = Normal::new(0.0, sigma) else {
        return;
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for y in 0..image.height {
        for p in image.row_mut(y) {
            let noisy = f64::from(*p) + normal.sample(&mut rng);
            *p = noisy.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Checkerboard junction at sub-pixel position `corner`.
///
/// The top-left and bottom-right quadrants are `dark`, the others `bright`. Pixels
/// straddling an edge get their exact area coverage.
#[must_use]
pub fn render_junction(width: usize, height: usize, corner: Vector2<f64>, dark: u8, bright: u8) -> OwnedImage {
    const SS: usize = 16;
    let mut image = OwnedImage::new(width, height, 0);
    for y in 0..height {
        for x in 0..width {
            let mut dark_count = 0usize;
            for sy in 0..SS {
                for sx in 0..SS {
                    let px = x as f64 - 0.5 + (sx as f64 + 0.5) / SS as f64;
                    let py = y as f64 - 0.5 + (sy as f64 + 0.5) / SS as f64;
                    if (px < corner.x) == (py < corner.y) {
                        dark_count += 1;
                    }
                }
            }
            let t = dark_count as f64 / (SS * SS) as f64;
            let value = t * f64::from(dark) + (1.0 - t) * f64::from(bright);
            image.set(x, y, value.round() as u8);
        }
    }
    image
}

/// Smooth random texture built from a handful of sinusoids.
#[must_use]
pub fn textured_image(width: usize, height: usize, seed: u64) -> OwnedImage {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let waves: Vec<(f64, f64, f64, f64)> = (0..8)
        .map(|_| {
            let angle = rng.gen_range(0.0..std::f64::consts::TAU);
            let period = rng.gen_range(9.0..31.0);
            let phase = rng.gen_range(0.0..std::f64::consts::TAU);
            let amplitude = rng.gen_range(8.0..20.0);
            let k = std::f64::consts::TAU / period;
            (k * angle.cos(), k * angle.sin(), phase, amplitude)
        })
        .collect();

    let mut image = OwnedImage::new(width, height, 0);
    for y in 0..height {
        for x in 0..width {
            let v = waves.iter().fold(128.0, |acc, &(kx, ky, phase, amplitude)| {
                acc + amplitude * (kx * x as f64 + ky * y as f64 + phase).sin()
            });
            image.set(x, y, v.round().clamp(0.0, 255.0) as u8);
        }
    }
    image
}

/// Render a square module grid (`1` = dark) with a bright quiet zone.
///
/// `modules` is row-major with `side * side` entries; every module covers
/// `module_px` x `module_px` pixels and the quiet zone is `quiet_zone` modules wide.
#[must_use]
pub fn render_module_grid(modules: &[u8], side: usize, module_px: usize, quiet_zone: usize) -> OwnedImage {
    let extent = (side + 2 * quiet_zone) * module_px;
    let mut image = OwnedImage::new(extent, extent, BRIGHT);
    for my in 0..side {
        for mx in 0..side {
            if modules.get(my * side + mx) != Some(&1) {
                continue;
            }
            let (x0, y0) = ((mx + quiet_zone) * module_px, (my + quiet_zone) * module_px);
            for y in y0..y0 + module_px {
                for x in x0..x0 + module_px {
                    image.set(x, y, DARK);
                }
            }
        }
    }
    image
}

/// Maximum distance between corresponding corners.
#[must_use]
pub fn compute_corner_error(detected: &[Vector2<f64>; 4], ground_truth: &[Vector2<f64>; 4]) -> f64 {
    detected
        .iter()
        .zip(ground_truth)
        .map(|(d, g)| (d - g).norm())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_junction_is_symmetric_at_pixel_corner() {
        let img = render_junction(16, 16, Vector2::new(7.5, 7.5), 0, 200);
        assert_eq!(img.get(7, 7), 0);
        assert_eq!(img.get(8, 7), 200);
        assert_eq!(img.get(8, 8), 0);
    }

    #[test]
    fn test_noise_is_deterministic() {
        let mut a = OwnedImage::new(8, 8, 100);
        let mut b = OwnedImage::new(8, 8, 100);
        add_gaussian_noise(&mut a, 3.0, 5);
        add_gaussian_noise(&mut b, 3.0, 5);
        assert_eq!(a.data, b.data);
    }
}
