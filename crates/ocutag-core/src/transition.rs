//! Bresenham traversal and dark/bright transitions along scanlines.
//!
//! These are the pixel-level primitives of the finder-pattern scan: an integer line
//! walker, a short history of intensity deltas that lets slow ramps count as an
//! edge, and searches for the next pixel on the other side of a threshold.

#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use crate::image::ImageView;
use nalgebra::Vector2;

// ============================================================================
// Bresenham
// ============================================================================

/// Integer line walker.
///
/// The walker only stores the step state; the current position is owned by the
/// caller so that several searches can continue the same line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bresenham {
    dx: i32,
    dy: i32,
    sx: i32,
    sy: i32,
    err: i32,
}

impl Bresenham {
    /// Walker for the line from `(x0, y0)` towards `(x1, y1)`.
    #[must_use]
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        Self {
            dx,
            dy,
            sx: if x0 < x1 { 1 } else { -1 },
            sy: if y0 < y1 { 1 } else { -1 },
            err: dx + dy,
        }
    }

    /// False for a line of zero length.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.dx != 0 || self.dy != 0
    }

    /// Advance `(x, y)` by one pixel. The line continues past its end point.
    pub fn step(&mut self, x: &mut i32, y: &mut i32) {
        let e2 = 2 * self.err;
        if e2 >= self.dy {
            self.err += self.dy;
            *x += self.sx;
        }
        if e2 <= self.dx {
            self.err += self.dx;
            *y += self.sy;
        }
    }
}

// ============================================================================
// Row transitions
// ============================================================================

/// The last five intensity deltas of a row scan, newest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionHistory {
    deltas: [i32; 5],
}

impl TransitionHistory {
    /// Empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of the newest `n` deltas.
    #[must_use]
    pub fn sum(&self, n: usize) -> i32 {
        self.deltas.iter().take(n).sum()
    }

    /// Record a new delta, forgetting the oldest one.
    pub fn push(&mut self, delta: i32) {
        self.deltas.rotate_right(1);
        self.deltas[0] = delta;
    }

    /// Forget all deltas.
    pub fn reset(&mut self) {
        self.deltas = [0; 5];
    }

    /// True if `delta` alone or together with up to five previous deltas exceeds the
    /// threshold in the direction of `sign`. Longer runs need a larger total:
    /// `threshold * (3 + k) / 4` for a run of `k + 1` deltas, `k >= 2`.
    fn exceeds(&self, delta: i32, sign: i32, threshold: i32) -> bool {
        let run = |k: usize| sign * (delta + self.sum(k));
        sign * delta > threshold
            || run(1) > threshold
            || (2..=5).any(|k| run(k) > threshold * (k as i32 + 3) / 4)
    }
}

/// True if pixel `x` of `row` starts a dark run. Records the delta in `history`.
///
/// `x` must be at least 1.
pub fn is_transition_to_black(row: &[u8], x: usize, history: &mut TransitionHistory, threshold: i32) -> bool {
    let delta = i32::from(row[x]) - i32::from(row[x - 1]);
    let result = history.exceeds(delta, -1, threshold);
    history.push(delta);
    result
}

/// True if pixel `x` of `row` starts a bright run. Records the delta in `history`.
///
/// `x` must be at least 1.
pub fn is_transition_to_white(row: &[u8], x: usize, history: &mut TransitionHistory, threshold: i32) -> bool {
    let delta = i32::from(row[x]) - i32::from(row[x - 1]);
    let result = history.exceeds(delta, 1, threshold);
    history.push(delta);
    result
}

// ============================================================================
// Directional search
// ============================================================================

/// Outcome of [`find_next_pixel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelTransition {
    /// Horizontal distance between the start and `first_outside`.
    pub columns: u32,
    /// Vertical distance between the start and `first_outside`.
    pub rows: u32,
    /// Last pixel of the run that contains the start.
    pub last_inside: (u32, u32),
    /// First pixel on the other side of the threshold.
    pub first_outside: (u32, u32),
}

/// Walk from `(x, y)` along `bresenham` until a pixel of the requested class appears.
///
/// With `FIND_BLACK` the search stops at the first pixel below `threshold`, otherwise
/// at the first pixel at or above it. At most `max_steps` pixels are visited. Returns
/// `None` if the line leaves the image or the step budget runs out.
#[must_use]
pub fn find_next_pixel<const FIND_BLACK: bool>(
    image: &ImageView,
    x: u32,
    y: u32,
    bresenham: &mut Bresenham,
    max_steps: u32,
    threshold: u32,
) -> Option<PixelTransition> {
    let matches = |v: u8| {
        if FIND_BLACK {
            u32::from(v) < threshold
        } else {
            u32::from(v) >= threshold
        }
    };

    let (mut cx, mut cy) = (x as i32, y as i32);
    let mut last = (x, y);
    for _ in 0..max_steps {
        bresenham.step(&mut cx, &mut cy);
        let value = image.pixel_checked(cx, cy)?;
        let current = (cx as u32, cy as u32);
        if matches(value) {
            return Some(PixelTransition {
                columns: current.0.abs_diff(x),
                rows: current.1.abs_diff(y),
                last_inside: last,
                first_outside: current,
            });
        }
        last = current;
    }
    None
}

/// Location where the intensity crosses `threshold` between two neighbouring pixels.
///
/// Linear interpolation of the two pixel values; falls back to the midpoint when both
/// values are equal.
#[must_use]
pub fn transition_point_subpixel(image: &ImageView, inside: (u32, u32), outside: (u32, u32), threshold: u32) -> Vector2<f64> {
    let p_in = Vector2::new(f64::from(inside.0), f64::from(inside.1));
    let p_out = Vector2::new(f64::from(outside.0), f64::from(outside.1));
    let v_in = f64::from(image.get_pixel(inside.0 as usize, inside.1 as usize));
    let v_out = f64::from(image.get_pixel(outside.0 as usize, outside.1 as usize));

    if (v_out - v_in).abs() < f64::EPSILON {
        return (p_in + p_out) * 0.5;
    }
    let t = ((f64::from(threshold) - v_in) / (v_out - v_in)).clamp(0.0, 1.0);
    p_in + (p_out - p_in) * t
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bresenham_diagonal() {
        let mut line = Bresenham::new(0, 0, 4, 2);
        assert!(line.is_valid());
        let (mut x, mut y) = (0, 0);
        let mut visited = Vec::new();
        for _ in 0..4 {
            line.step(&mut x, &mut y);
            visited.push((x, y));
        }
        assert_eq!(visited.last(), Some(&(4, 2)));
        assert!(visited.windows(2).all(|w| (w[1].0 - w[0].0).abs() <= 1 && (w[1].1 - w[0].1).abs() <= 1));
        assert!(!Bresenham::new(3, 3, 3, 3).is_valid());
    }

    #[test]
    fn test_sharp_and_ramped_transitions() {
        let sharp = [200u8, 200, 40, 40];
        let mut history = TransitionHistory::new();
        assert!(!is_transition_to_black(&sharp, 1, &mut history, 30));
        assert!(is_transition_to_black(&sharp, 2, &mut history, 30));

        // Steps of 12 are invisible on their own but a run of four exceeds 30 * 6 / 4.
        let ramp = [200u8, 188, 176, 164, 152, 140];
        let mut history = TransitionHistory::new();
        let fired: Vec<bool> = (1..ramp.len())
            .map(|x| is_transition_to_black(&ramp, x, &mut history, 30))
            .collect();
        assert_eq!(fired, vec![false, false, false, true, true]);

        let mut history = TransitionHistory::new();
        assert!(!is_transition_to_white(&ramp, 1, &mut history, 30));
        let rising = [40u8, 200];
        assert!(is_transition_to_white(&rising, 1, &mut TransitionHistory::new(), 30));
    }

    #[test]
    fn test_noise_does_not_cancel_a_falling_run() {
        let row = [200u8, 180, 185, 165, 150];
        let mut history = TransitionHistory::new();
        let fired: Vec<bool> = (1..row.len())
            .map(|x| is_transition_to_black(&row, x, &mut history, 30))
            .collect();
        assert!(fired[3]);
    }

    #[test]
    fn test_find_next_pixel_and_subpixel_point() {
        let mut data = vec![20u8; 16];
        data[10..].fill(220);
        let img = ImageView::new(&data, 16, 1, 16).unwrap();

        let mut line = Bresenham::new(2, 0, 15, 0);
        let t = find_next_pixel::<false>(&img, 2, 0, &mut line, 20, 120).unwrap();
        assert_eq!(t.first_outside, (10, 0));
        assert_eq!(t.last_inside, (9, 0));
        assert_eq!(t.columns, 8);
        assert_eq!(t.rows, 0);

        let p = transition_point_subpixel(&img, t.last_inside, t.first_outside, 120);
        assert!((p.x - 9.5).abs() < 1e-9);

        let mut short = Bresenham::new(2, 0, 15, 0);
        assert!(find_next_pixel::<false>(&img, 2, 0, &mut short, 5, 120).is_none());
        let mut outward = Bresenham::new(12, 0, 20, 0);
        assert!(find_next_pixel::<true>(&img, 12, 0, &mut outward, 10, 120).is_none());
    }
}
