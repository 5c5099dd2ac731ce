//! Sobel gradients and line segment extraction for edge-based quad detection.
//!
//! Segments are grown from strong gradient seeds over pixels whose gradient
//! orientation agrees with the region (polarity-aware, full 360 degrees), then fitted
//! with a magnitude-weighted principal axis. Each segment is directed so that the
//! bright side lies to its left in image coordinates: walking along the border of a
//! dark blob follows its segments clockwise on screen.

#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use crate::image::ImageView;
use multiversion::multiversion;
use nalgebra::{Matrix2, SymmetricEigen, Vector2};
use rayon::prelude::*;
use std::collections::VecDeque;

/// Gradient data for a single pixel.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Gradient {
    /// Gradient in x-direction.
    pub gx: i16,
    /// Gradient in y-direction.
    pub gy: i16,
    /// L1 gradient magnitude.
    pub mag: u16,
}

/// Compute Sobel gradients for the entire image.
///
/// Returns a dense `width * height` array; the one pixel border is left zero.
#[must_use]
pub fn compute_sobel(img: &ImageView) -> Vec<Gradient> {
    let w = img.width;
    let h = img.height;
    let mut grads = vec![Gradient::default(); w * h];
    if w < 3 || h < 3 {
        return grads;
    }

    grads
        .par_chunks_mut(w)
        .enumerate()
        .skip(1)
        .take(h - 2)
        .for_each(|(y, row)| {
            sobel_row(img.get_row(y - 1), img.get_row(y), img.get_row(y + 1), row);
        });

    grads
}

// Gx: [-1 0 1; -2 0 2; -1 0 1]
// Gy: [-1 -2 -1; 0 0 0; 1 2 1]
#[multiversion(targets(
    "x86_64+avx2+bmi1+bmi2+popcnt+lzcnt",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn sobel_row(r0: &[u8], r1: &[u8], r2: &[u8], out: &mut [Gradient]) {
    let w = out.len();
    for x in 1..w - 1 {
        let p00 = i16::from(r0[x - 1]);
        let p10 = i16::from(r0[x]);
        let p20 = i16::from(r0[x + 1]);
        let p01 = i16::from(r1[x - 1]);
        let p21 = i16::from(r1[x + 1]);
        let p02 = i16::from(r2[x - 1]);
        let p12 = i16::from(r2[x]);
        let p22 = i16::from(r2[x + 1]);

        let gx = -p00 + p20 - 2 * p01 + 2 * p21 - p02 + p22;
        let gy = -p00 - 2 * p10 - p20 + p02 + 2 * p12 + p22;

        out[x] = Gradient {
            gx,
            gy,
            mag: gx.unsigned_abs() + gy.unsigned_abs(),
        };
    }
}

/// A fitted line segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineSegment {
    /// Start point.
    pub start: Vector2<f64>,
    /// End point.
    pub end: Vector2<f64>,
    /// Unit normal pointing from the dark to the bright side.
    pub normal: Vector2<f64>,
    /// Number of supporting pixels.
    pub support: usize,
}

impl LineSegment {
    /// Segment length in pixels.
    #[must_use]
    pub fn length(&self) -> f64 {
        (self.end - self.start).norm()
    }

    /// Unit direction from start to end.
    #[must_use]
    pub fn direction(&self) -> Vector2<f64> {
        (self.end - self.start).normalize()
    }

    /// Signed distance of a point to the infinite line (positive on the bright side).
    #[must_use]
    pub fn signed_distance(&self, p: &Vector2<f64>) -> f64 {
        (p - self.start).dot(&self.normal)
    }
}

/// Intersection of the infinite lines through two segments.
#[must_use]
pub fn line_intersection(a: &LineSegment, b: &LineSegment) -> Option<Vector2<f64>> {
    let da = a.end - a.start;
    let db = b.end - b.start;
    let denom = da.x * db.y - da.y * db.x;
    if denom.abs() < 1e-9 * da.norm() * db.norm() {
        return None;
    }
    let t = ((b.start.x - a.start.x) * db.y - (b.start.y - a.start.y) * db.x) / denom;
    Some(a.start + da * t)
}

/// Parameters of the segment extractor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineParams {
    /// Minimal Sobel L1 magnitude of a supporting pixel (default: 40).
    pub magnitude_threshold: u16,
    /// Maximal orientation difference to the region, radians (default: 22.5 degrees).
    pub angle_tolerance: f64,
    /// Minimal segment length in pixels (default: 8).
    pub min_length: f64,
    /// Segments with an endpoint closer than this to the image border are dropped (default: 10).
    pub border: usize,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            magnitude_threshold: 40,
            angle_tolerance: 22.5_f64.to_radians(),
            min_length: 8.0,
            border: 10,
        }
    }
}

/// Extract line segments from a gradient image by region growing.
#[must_use]
pub fn extract_line_segments(
    grads: &[Gradient],
    width: usize,
    height: usize,
    params: &LineParams,
) -> Vec<LineSegment> {
    let mut segments = Vec::new();
    if width < 5 || height < 5 || grads.len() < width * height {
        return segments;
    }

    // Seeds ordered by decreasing magnitude so regions start on the crisp edge centre.
    let mut seeds: Vec<usize> = (0..width * height)
        .filter(|&i| grads[i].mag >= params.magnitude_threshold)
        .collect();
    seeds.sort_unstable_by(|&a, &b| grads[b].mag.cmp(&grads[a].mag).then(a.cmp(&b)));

    let cos_tolerance = params.angle_tolerance.cos();
    let mut used = vec![false; width * height];
    let mut region: Vec<usize> = Vec::with_capacity(1024);
    let mut queue: VecDeque<usize> = VecDeque::with_capacity(1024);

    for seed in seeds {
        if used[seed] {
            continue;
        }
        region.clear();
        queue.clear();

        let g = grads[seed];
        let mut sum = unit(g);
        let mut region_dir = sum;
        used[seed] = true;
        queue.push_back(seed);

        while let Some(idx) = queue.pop_front() {
            region.push(idx);
            let x = idx % width;
            let y = idx / width;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i32 + dx;
                    let ny = y as i32 + dy;
                    if nx < 1 || ny < 1 || nx >= width as i32 - 1 || ny >= height as i32 - 1 {
                        continue;
                    }
                    let nidx = ny as usize * width + nx as usize;
                    if used[nidx] || grads[nidx].mag < params.magnitude_threshold {
                        continue;
                    }
                    let u = unit(grads[nidx]);
                    if u.dot(&region_dir) >= cos_tolerance {
                        used[nidx] = true;
                        queue.push_back(nidx);
                        sum += u;
                        if sum.norm_squared() > 1e-12 {
                            region_dir = sum.normalize();
                        }
                    }
                }
            }
        }

        if let Some(segment) = fit_segment(&region, grads, width, region_dir) {
            if segment.length() >= params.min_length && inside_border(&segment, width, height, params.border) {
                segments.push(segment);
            }
        }
    }

    segments
}

fn unit(g: Gradient) -> Vector2<f64> {
    let v = Vector2::new(f64::from(g.gx), f64::from(g.gy));
    let n = v.norm();
    if n > 0.0 { v / n } else { v }
}

fn inside_border(segment: &LineSegment, width: usize, height: usize, border: usize) -> bool {
    let b = border as f64;
    let ok = |p: &Vector2<f64>| {
        p.x >= b && p.y >= b && p.x < width as f64 - b && p.y < height as f64 - b
    };
    ok(&segment.start) && ok(&segment.end)
}

/// Magnitude-weighted principal axis fit of a region.
fn fit_segment(
    region: &[usize],
    grads: &[Gradient],
    width: usize,
    region_dir: Vector2<f64>,
) -> Option<LineSegment> {
    if region.len() < 4 {
        return None;
    }

    let mut weight_sum = 0.0;
    let mut centroid = Vector2::zeros();
    for &idx in region {
        let w = f64::from(grads[idx].mag);
        centroid += Vector2::new((idx % width) as f64, (idx / width) as f64) * w;
        weight_sum += w;
    }
    if weight_sum <= 0.0 {
        return None;
    }
    centroid /= weight_sum;

    let mut cov = Matrix2::zeros();
    for &idx in region {
        let w = f64::from(grads[idx].mag);
        let d = Vector2::new((idx % width) as f64, (idx / width) as f64) - centroid;
        cov += d * d.transpose() * w;
    }
    cov /= weight_sum;

    let eigen = SymmetricEigen::new(cov);
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    // Thick regions are blobs or curved edges, not lines.
    if eigen.eigenvalues[minor].max(0.0).sqrt() > 1.5
        || eigen.eigenvalues[major] < 4.0 * eigen.eigenvalues[minor].max(1e-9)
    {
        return None;
    }

    // Bright side on the left: direction is the normal rotated by +90 degrees.
    let mut direction: Vector2<f64> = eigen.eigenvectors.column(major).into_owned();
    let wanted = Vector2::new(-region_dir.y, region_dir.x);
    if direction.dot(&wanted) < 0.0 {
        direction = -direction;
    }
    let normal = Vector2::new(direction.y, -direction.x);

    let (mut lo, mut hi) = (f64::MAX, f64::MIN);
    for &idx in region {
        let p = Vector2::new((idx % width) as f64, (idx / width) as f64);
        let t = (p - centroid).dot(&direction);
        lo = lo.min(t);
        hi = hi.max(t);
    }

    Some(LineSegment {
        start: centroid + direction * lo,
        end: centroid + direction * hi,
        normal,
        support: region.len(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::OwnedImage;

    fn dark_square(size: usize, x0: usize, y0: usize, side: usize) -> OwnedImage {
        let mut img = OwnedImage::new(size, size, 200);
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.set(x, y, 40);
            }
        }
        img
    }

    #[test]
    fn test_sobel_vertical_edge() {
        let mut img = OwnedImage::new(8, 8, 0);
        for y in 0..8 {
            for x in 4..8 {
                img.set(x, y, 100);
            }
        }
        let grads = compute_sobel(&img.view());
        let g = grads[3 * 8 + 4];
        assert_eq!(g.gx, 400);
        assert_eq!(g.gy, 0);
        assert_eq!(grads[0].mag, 0);
    }

    #[test]
    fn test_square_yields_four_directed_segments() {
        let img = dark_square(100, 30, 30, 40);
        let grads = compute_sobel(&img.view());
        let segments = extract_line_segments(&grads, 100, 100, &LineParams::default());
        assert_eq!(segments.len(), 4, "{segments:?}");

        for s in &segments {
            assert!(s.length() > 30.0);
            // Normals of a dark square point outwards.
            let mid = (s.start + s.end) * 0.5;
            let outward = mid - Vector2::new(49.5, 49.5);
            assert!(s.normal.dot(&outward) > 0.0);
            assert!(s.signed_distance(&Vector2::new(49.5, 49.5)) < -15.0);
        }
    }

    #[test]
    fn test_intersection() {
        let a = LineSegment {
            start: Vector2::new(0.0, 0.0),
            end: Vector2::new(10.0, 0.0),
            normal: Vector2::new(0.0, -1.0),
            support: 10,
        };
        let b = LineSegment {
            start: Vector2::new(12.0, 2.0),
            end: Vector2::new(12.0, 12.0),
            normal: Vector2::new(1.0, 0.0),
            support: 10,
        };
        let p = line_intersection(&a, &b).unwrap();
        assert!((p - Vector2::new(12.0, 0.0)).norm() < 1e-12);
        assert!(line_intersection(&a, &a).is_none());
    }
}
