//! Sub-pixel corner refinement (Förstner operator).
//!
//! The corner `c` minimizes `E(c) = sum_p (grad I_p . (p - c))^2` over a Gaussian
//! weighted window. Each iteration samples a bilinear patch centred on the current
//! estimate, solves the 2x2 normal equations for the shift and moves the estimate. The
//! refinement fails when a shift leaves the window, the estimate approaches the image
//! border, the window has no gradient, or the iteration budget runs out.
//!
//! Every gradient enters the tensor with weight `w / |grad I|`. Pixels along an edge
//! then count by contrast instead of squared contrast, which keeps sharp (box filtered)
//! edges from pulling the estimate toward their brighter side.

use crate::image::ImageView;
use nalgebra::{Matrix2, Vector2};

const MAX_ITERATIONS: usize = 100;
const MIN_STEP: f64 = 0.01;
const MIN_ERROR: f64 = 1e-6;
const MIN_GRADIENT: f64 = 1e-9;

/// Finite-difference kernel used for the gradients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GradientKernel {
    /// `[-1 +1]` on 2x2 cells, window of `2 * neighbors` pixels.
    #[default]
    Forward,
    /// `[-1 0 +1]`, window of `2 * neighbors + 1` pixels.
    Central,
}

impl GradientKernel {
    fn window_size(self, neighbors: usize) -> usize {
        match self {
            Self::Forward => 2 * neighbors,
            Self::Central => 2 * neighbors + 1,
        }
    }

    fn buffer_size(self, neighbors: usize) -> usize {
        match self {
            Self::Forward => 2 * neighbors + 1,
            Self::Central => 2 * neighbors + 3,
        }
    }

    /// Offset of the first gradient sample from the patch centre.
    fn origin(self, neighbors: usize) -> f64 {
        match self {
            Self::Forward => 0.5 - neighbors as f64,
            Self::Central => -(neighbors as f64),
        }
    }

    /// Gradient of window cell `(x, y)`.
    ///
    /// Forward differences are averaged over a 2x2 cell so both components sit at
    /// the cell centre.
    #[inline]
    fn gradient(self, buffer: &[f32], size: usize, x: usize, y: usize) -> (f64, f64) {
        match self {
            Self::Forward => {
                let i = y * size + x;
                let (a, b) = (buffer[i], buffer[i + 1]);
                let (c, d) = (buffer[i + size], buffer[i + size + 1]);
                (f64::from((b - a) + (d - c)) * 0.5, f64::from((c - a) + (d - b)) * 0.5)
            }
            Self::Central => {
                let i = (y + 1) * size + x + 1;
                (
                    f64::from(buffer[i + 1] - buffer[i - 1]) * 0.5,
                    f64::from(buffer[i + size] - buffer[i - size]) * 0.5,
                )
            }
        }
    }
}

/// Outcome of a successful corner refinement.
#[derive(Clone, Debug, PartialEq)]
pub struct RefinedCorner {
    /// Refined location.
    pub position: Vector2<f64>,
    /// Normalized sum of the window gradients (points from dark to bright).
    ///
    /// Zero when the gradients cancel, as on a symmetric checkerboard junction.
    pub direction: Vector2<f64>,
    /// Squared shift of each iteration.
    pub errors: Vec<f64>,
}

/// Refine a corner with the default forward kernel.
///
/// `neighbors` is the half window size in pixels (2 or 3 in practice).
#[must_use]
pub fn refine_corner(image: &ImageView, corner: Vector2<f64>, neighbors: usize) -> Option<Vector2<f64>> {
    refine_corner_with(image, corner, neighbors, GradientKernel::Forward).map(|r| r.position)
}

/// Refine a corner and report its gradient direction and per-iteration errors.
#[must_use]
pub fn refine_corner_with(
    image: &ImageView,
    corner: Vector2<f64>,
    neighbors: usize,
    kernel: GradientKernel,
) -> Option<RefinedCorner> {
    if neighbors == 0 {
        return None;
    }
    let window = kernel.window_size(neighbors);
    let buffer_size = kernel.buffer_size(neighbors);
    if image.width < buffer_size || image.height < buffer_size {
        return None;
    }

    let origin = kernel.origin(neighbors);
    let weights = gaussian_weights(window, origin, neighbors);
    let mut buffer = vec![0.0f32; buffer_size * buffer_size];

    let half = (buffer_size / 2) as f64;
    let right = (image.width - buffer_size / 2 - 1) as f64;
    let bottom = (image.height - buffer_size / 2 - 1) as f64;
    let inside = |p: Vector2<f64>| p.x >= half && p.x < right && p.y >= half && p.y < bottom;

    let mut refined = corner;
    if !inside(refined) {
        return None;
    }

    let max_squared_shift = 0.81 * (neighbors * neighbors) as f64;
    let mut step = 1.0;
    let mut errors: Vec<f64> = Vec::with_capacity(16);
    let mut successful = true;
    let mut gradient_sum = Vector2::<f64>::zeros();
    let mut magnitude_sum = 0.0;

    loop {
        if !image.interpolate_patch(refined.x, refined.y, buffer_size, &mut buffer) {
            successful = false;
            break;
        }

        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();
        gradient_sum = Vector2::zeros();
        magnitude_sum = 0.0;

        for y in 0..window {
            let py = origin + y as f64;
            for x in 0..window {
                let (gx, gy) = kernel.gradient(&buffer, buffer_size, x, y);
                let magnitude = gx.hypot(gy);
                if magnitude < MIN_GRADIENT {
                    continue;
                }
                gradient_sum += Vector2::new(gx, gy);
                magnitude_sum += magnitude;

                let w = weights[y * window + x] / magnitude;
                let gxx = w * gx * gx;
                let gxy = w * gx * gy;
                let gyy = w * gy * gy;
                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 1)] += gyy;

                let px = origin + x as f64;
                b.x += gxx * px + gxy * py;
                b.y += gxy * px + gyy * py;
            }
        }
        a[(1, 0)] = a[(0, 1)];

        let Some(update) = solve_2x2(&a, &b) else {
            break;
        };

        // Squared shift stands in for E(c), which is costly to evaluate.
        let error = update.norm_squared();
        let previous = errors.last().copied();
        errors.push(error);

        if error > max_squared_shift {
            successful = false;
            break;
        }
        if previous.is_some_and(|p| error >= p) {
            step *= 0.5;
        }

        refined += update * step;
        if !inside(refined) {
            successful = false;
            break;
        }

        if errors.len() >= MAX_ITERATIONS || step <= MIN_STEP || error < MIN_ERROR {
            break;
        }
    }

    if magnitude_sum < MIN_GRADIENT || errors.is_empty() {
        return None;
    }

    let direction = if gradient_sum.norm() > 1e-6 * magnitude_sum {
        gradient_sum.normalize()
    } else {
        Vector2::zeros()
    };

    (successful && errors.len() < MAX_ITERATIONS).then_some(RefinedCorner {
        position: refined,
        direction,
        errors,
    })
}

/// Separable Gaussian over the sample offsets `origin + i`, with sigma `neighbors / sqrt(2)`.
fn gaussian_weights(window: usize, origin: f64, neighbors: usize) -> Vec<f64> {
    let inv = 1.0 / neighbors as f64;
    let profile: Vec<f64> = (0..window)
        .map(|i| {
            let f = (origin + i as f64) * inv;
            (-(f * f)).exp()
        })
        .collect();
    let mut weights = Vec::with_capacity(window * window);
    for wy in &profile {
        weights.extend(profile.iter().map(|wx| wy * wx));
    }
    weights
}

fn solve_2x2(a: &Matrix2<f64>, b: &Vector2<f64>) -> Option<Vector2<f64>> {
    let det = a.determinant();
    if det.abs() <= f64::EPSILON * a.norm_squared().max(1.0) {
        return None;
    }
    Some(Vector2::new(
        (a[(1, 1)] * b.x - a[(0, 1)] * b.y) / det,
        (a[(0, 0)] * b.y - a[(1, 0)] * b.x) / det,
    ))
}
