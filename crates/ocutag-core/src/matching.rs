//! Patch matching with the zero-mean sum of squared differences.
//!
//! Used to follow tag corners from one frame to the next (coarse to fine over image
//! pyramids) and to find tag points of one stereo camera in the other.

use crate::corner::refine_corner;
use crate::image::{ImagePyramid, ImageView};
use multiversion::multiversion;
use nalgebra::Vector2;

/// Patch size of the stereo matcher.
pub const STEREO_PATCH_SIZE: usize = 15;

/// Halving steps of the sub-pixel search.
const SUB_PIXEL_ITERATIONS: usize = 4;

/// Search radius on every layer finer than the coarsest one.
const FINE_LAYER_RADIUS: usize = 2;

/// Zero-mean SSD between two equally sized patches.
#[multiversion(targets(
    "x86_64+avx2+bmi1+bmi2+popcnt+lzcnt",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
#[must_use]
pub fn zero_mean_ssd(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f32::MAX;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f32>() / n as f32;
    let mean_b = b.iter().sum::<f32>() / n as f32;
    let offset = mean_a - mean_b;
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x - y - offset;
            d * d
        })
        .sum()
}

/// Sample a square patch centred at `center`, clamping samples at the image border.
///
/// Returns false if the centre itself lies outside the image.
pub fn sample_patch(image: &ImageView, center: Vector2<f64>, size: usize, patch: &mut [f32]) -> bool {
    if !image.contains(center.x, center.y) {
        return false;
    }
    if image.interpolate_patch(center.x, center.y, size, patch) {
        return true;
    }
    let half = (size / 2) as f64;
    for r in 0..size {
        for c in 0..size {
            let x = center.x + c as f64 - half;
            let y = center.y + r as f64 - half;
            patch[r * size + c] = image.interpolate_clamped(x, y) as f32;
        }
    }
    true
}

/// Best match of a patch around `point_a` in `image_b`, searched around `predicted_b`.
///
/// The integer grid within `radius` is searched first, then `sub_pixel_iterations`
/// halving steps refine the location. Returns the location and its cost.
#[must_use]
pub fn track_point_zssd(
    image_a: &ImageView,
    image_b: &ImageView,
    point_a: Vector2<f64>,
    predicted_b: Vector2<f64>,
    patch_size: usize,
    radius: usize,
    sub_pixel_iterations: usize,
) -> Option<(Vector2<f64>, f32)> {
    let area = patch_size * patch_size;
    let mut reference = vec![0.0f32; area];
    let mut candidate = vec![0.0f32; area];
    if !sample_patch(image_a, point_a, patch_size, &mut reference) {
        return None;
    }

    let mut cost_at = |p: Vector2<f64>| -> Option<f32> {
        sample_patch(image_b, p, patch_size, &mut candidate).then(|| zero_mean_ssd(&reference, &candidate))
    };

    let r = radius as i32;
    let mut best: Option<(Vector2<f64>, f32)> = None;
    for dy in -r..=r {
        for dx in -r..=r {
            let p = predicted_b + Vector2::new(f64::from(dx), f64::from(dy));
            if let Some(cost) = cost_at(p) {
                if best.is_none_or(|(_, c)| cost < c) {
                    best = Some((p, cost));
                }
            }
        }
    }
    let (mut location, mut cost) = best?;

    let mut step = 0.5;
    for _ in 0..sub_pixel_iterations {
        let center = location;
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let p = center + Vector2::new(f64::from(dx), f64::from(dy)) * step;
                if let Some(c) = cost_at(p) {
                    if c < cost {
                        cost = c;
                        location = p;
                    }
                }
            }
        }
        step *= 0.5;
    }

    Some((location, cost))
}

#[inline]
fn to_coarser(p: Vector2<f64>, levels: usize) -> Vector2<f64> {
    (0..levels).fold(p, |q, _| (q - Vector2::new(0.5, 0.5)) * 0.5)
}

#[inline]
fn to_finer(p: Vector2<f64>) -> Vector2<f64> {
    p * 2.0 + Vector2::new(0.5, 0.5)
}

/// Track points from `previous` into `current`, coarse to fine.
///
/// Each point starts at its prediction on the coarsest shared layer with a search
/// radius of `coarsest_radius`; finer layers search a small neighbourhood of the
/// upsampled estimate. Returns `None` if any point is lost.
#[must_use]
pub fn track_points_pyramid(
    previous: &ImagePyramid,
    current: &ImagePyramid,
    previous_points: &[Vector2<f64>],
    predicted_points: &[Vector2<f64>],
    patch_size: usize,
    coarsest_radius: usize,
) -> Option<Vec<Vector2<f64>>> {
    if previous_points.len() != predicted_points.len() {
        return None;
    }
    let layers = previous.len().min(current.len());
    if layers == 0 {
        return None;
    }
    let coarsest = layers - 1;

    previous_points
        .iter()
        .zip(predicted_points)
        .map(|(&from, &predicted)| {
            let mut estimate = to_coarser(predicted, coarsest);
            for level in (0..=coarsest).rev() {
                let image_a = previous.layer(level)?;
                let image_b = current.layer(level)?;
                let point_a = to_coarser(from, level);
                let radius = if level == coarsest { coarsest_radius } else { FINE_LAYER_RADIUS };
                let sub_pixel = if level == 0 { SUB_PIXEL_ITERATIONS } else { 0 };
                let (location, _) =
                    track_point_zssd(&image_a, &image_b, point_a, estimate, patch_size, radius, sub_pixel)?;
                estimate = if level == 0 { location } else { to_finer(location) };
            }
            Some(estimate)
        })
        .collect()
}

/// Locate a point of `image_a` in `image_b` near its predicted location.
///
/// The patch match is followed by a corner refinement (window 2) which is kept only
/// if it succeeds. Returns the location and its distance to the prediction.
#[must_use]
pub fn verify_stereo_location(
    image_a: &ImageView,
    image_b: &ImageView,
    location_a: Vector2<f64>,
    predicted_b: Vector2<f64>,
    radius: usize,
) -> Option<(Vector2<f64>, f64)> {
    let (mut location, _) = track_point_zssd(
        image_a,
        image_b,
        location_a,
        predicted_b,
        STEREO_PATCH_SIZE,
        radius,
        SUB_PIXEL_ITERATIONS,
    )?;
    if let Some(refined) = refine_corner(image_b, location, 2) {
        location = refined;
    }
    Some((location, (location - predicted_b).norm()))
}

/// Locate several points at once.
///
/// Fails as soon as the summed distance to the predictions exceeds
/// `max_average_error` times the number of points.
#[must_use]
pub fn verify_stereo_locations(
    image_a: &ImageView,
    image_b: &ImageView,
    locations_a: &[Vector2<f64>],
    predicted_b: &[Vector2<f64>],
    radius: usize,
    max_average_error: f64,
) -> Option<Vec<Vector2<f64>>> {
    if locations_a.is_empty() || locations_a.len() != predicted_b.len() {
        return None;
    }
    let max_sum = max_average_error * locations_a.len() as f64;
    let mut sum = 0.0;
    let mut out = Vec::with_capacity(locations_a.len());
    for (&a, &b) in locations_a.iter().zip(predicted_b) {
        let (location, error) = verify_stereo_location(image_a, image_b, a, b, radius)?;
        sum += error;
        if sum > max_sum {
            return None;
        }
        out.push(location);
    }
    Some(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{render_junction, textured_image};

    #[test]
    fn test_zero_mean_ssd_ignores_offset() {
        let a: Vec<f32> = (0..49).map(|i| i as f32).collect();
        let b: Vec<f32> = a.iter().map(|v| v + 30.0).collect();
        assert!(zero_mean_ssd(&a, &b) < 1e-3);
        let c: Vec<f32> = a.iter().rev().copied().collect();
        assert!(zero_mean_ssd(&a, &c) > 1.0);
    }

    #[test]
    fn test_track_shifted_texture() {
        let a = textured_image(96, 96, 7);
        let shift = Vector2::new(3.0, -2.0);
        let b = textured_image_shifted(&a, 3, -2);
        let point = Vector2::new(48.0, 48.0);
        let (found, _) = track_point_zssd(&a.view(), &b.view(), point, point, 7, 4, 4).unwrap();
        assert!((found - (point + shift)).norm() < 0.3, "{found:?}");
    }

    #[test]
    fn test_pyramid_tracking_large_motion() {
        let a = textured_image(256, 256, 11);
        let b = textured_image_shifted(&a, 9, 6);
        let pa = ImagePyramid::new(&a.view(), 4);
        let pb = ImagePyramid::new(&b.view(), 4);
        let points = [Vector2::new(100.0, 120.0), Vector2::new(150.0, 90.0)];
        let tracked = track_points_pyramid(&pa, &pb, &points, &points, 7, 2).unwrap();
        for (p, t) in points.iter().zip(&tracked) {
            assert!((t - (p + Vector2::new(9.0, 6.0))).norm() < 0.6, "{t:?}");
        }
    }

    #[test]
    fn test_stereo_verification_on_junction() {
        let a = render_junction(64, 64, Vector2::new(30.0, 32.0), 30, 220);
        let b = render_junction(64, 64, Vector2::new(33.4, 31.2), 30, 220);
        let (location, error) =
            verify_stereo_location(&a.view(), &b.view(), Vector2::new(30.0, 32.0), Vector2::new(32.0, 32.0), 5)
                .unwrap();
        assert!((location - Vector2::new(33.4, 31.2)).norm() < 0.3);
        assert!((error - (location - Vector2::new(32.0, 32.0)).norm()).abs() < 1e-12);

        let far = verify_stereo_locations(
            &a.view(),
            &b.view(),
            &[Vector2::new(30.0, 32.0)],
            &[Vector2::new(32.0, 32.0)],
            5,
            0.5,
        );
        assert!(far.is_none());
    }

    fn textured_image_shifted(src: &crate::image::OwnedImage, dx: i32, dy: i32) -> crate::image::OwnedImage {
        let mut out = crate::image::OwnedImage::new(src.width, src.height, 0);
        for y in 0..src.height as i32 {
            for x in 0..src.width as i32 {
                let sx = (x - dx).clamp(0, src.width as i32 - 1) as usize;
                let sy = (y - dy).clamp(0, src.height as i32 - 1) as usize;
                out.set(x as usize, y as usize, src.get(sx, sy));
            }
        }
        out
    }
}
