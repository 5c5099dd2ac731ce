//! QR finder-pattern detection.
//!
//! A finder pattern is the 7x7 module target in three corners of a QR symbol:
//! a dark ring, a bright ring and a dark 3x3 centre. Every scanline crossing the
//! centre shows dark/bright runs with the ratio 1:1:3:1:1.
//!
//! # Pipeline
//!
//! 1. **Row scan**: transitions found with a short delta history, runs checked
//!    against the 1:1:3:1:1 ratio.
//! 2. **Neighbourhood check**: eight scanlines through the candidate centre must show
//!    the same structure; the sixteen outer edge points are kept.
//! 3. **Corners**: four edge lines through the edge points, intersected.
//! 4. **Merging and refinement**: duplicates from neighbouring rows are merged, the
//!    survivors get their edges re-fitted from perpendicular edge searches.
//!
//! Corners of a pattern are counter-clockwise in the y-down image, the same order as
//! [`crate::quad::Quad`].

#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

use crate::config::FinderPatternConfig;
use crate::image::ImageView;
use crate::quad::Quad;
use crate::transition::{
    Bresenham, TransitionHistory, find_next_pixel, is_transition_to_black, is_transition_to_white,
    transition_point_subpixel,
};
use nalgebra::Vector2;
use rayon::prelude::*;

/// Images below this size in either dimension cannot hold a finder pattern.
pub const MIN_IMAGE_SIZE: usize = 21;

/// Relative deviation allowed between the closest edge point and its three partners
/// at 90 degree steps, on squared distances.
const EDGE_POINT_DISTANCE_TOLERANCE: f64 = 2.25;

/// Number of support points per edge during refinement.
const MAX_SUPPORT_POINTS: usize = 11;

// ============================================================================
// FinderPattern
// ============================================================================

/// A detected finder pattern.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FinderPattern {
    /// Centre with sub-pixel accuracy.
    pub position: Vector2<f64>,
    /// Outer diameter measured on the detecting row, in pixels.
    pub length: f64,
    /// Intensity of the centre pixel.
    pub center_intensity: u32,
    /// Threshold separating dark from bright modules around this pattern.
    pub gray_threshold: u32,
    /// Sum of squared-distance asymmetries of the edge points. Lower is better.
    pub symmetry_score: f64,
    /// Outer corners, counter-clockwise.
    pub corners: [Vector2<f64>; 4],
    /// Dominant edge direction, unit length, within 45 degrees of +x.
    pub orientation: Vector2<f64>,
    /// Module size in pixels.
    pub module_size: f64,
}

impl FinderPattern {
    /// True for dark-on-bright patterns.
    #[must_use]
    pub fn is_normal_reflectance(&self) -> bool {
        self.center_intensity <= self.gray_threshold
    }

    /// Scan order: descending y, then descending x.
    #[must_use]
    pub fn comes_before(&self, other: &Self) -> bool {
        self.scan_order(other) == std::cmp::Ordering::Less
    }

    fn scan_order(&self, other: &Self) -> std::cmp::Ordering {
        other
            .position
            .y
            .total_cmp(&self.position.y)
            .then(other.position.x.total_cmp(&self.position.x))
    }
}

/// Index triplet `[top_left, bottom_left, top_right]` into a finder pattern list.
pub type IndexTriplet = [usize; 3];

// ============================================================================
// Geometry helpers
// ============================================================================

/// An infinite 2D line.
#[derive(Clone, Copy, Debug)]
struct Line {
    point: Vector2<f64>,
    /// Unit direction.
    direction: Vector2<f64>,
}

impl Default for Line {
    fn default() -> Self {
        Self {
            point: Vector2::zeros(),
            direction: Vector2::new(1.0, 0.0),
        }
    }
}

impl Line {
    fn through(a: Vector2<f64>, b: Vector2<f64>) -> Option<Self> {
        let d = b - a;
        let n = d.norm();
        (n > f64::EPSILON).then(|| Self {
            point: a,
            direction: d / n,
        })
    }

    fn normal(&self) -> Vector2<f64> {
        perpendicular(&self.direction)
    }

    fn sqr_distance(&self, p: &Vector2<f64>) -> f64 {
        let d = self.normal().dot(&(p - self.point));
        d * d
    }

    fn intersection(&self, other: &Self) -> Option<Vector2<f64>> {
        let denom = cross(&self.direction, &other.direction);
        if denom.abs() < 1e-9 {
            return None;
        }
        let t = cross(&(other.point - self.point), &other.direction) / denom;
        Some(self.point + self.direction * t)
    }

    /// Total least squares fit.
    fn fit(points: &[Vector2<f64>]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
        let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
        for p in points {
            let d = p - mean;
            sxx += d.x * d.x;
            sxy += d.x * d.y;
            syy += d.y * d.y;
        }
        if sxx + syy < f64::EPSILON {
            return None;
        }
        let angle = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        Some(Self {
            point: mean,
            direction: Vector2::new(angle.cos(), angle.sin()),
        })
    }
}

/// Counter-clockwise perpendicular `(-y, x)`.
fn perpendicular(v: &Vector2<f64>) -> Vector2<f64> {
    Vector2::new(-v.y, v.x)
}

fn cross(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Centre, orientation and module size of a pattern with the given corners.
///
/// The orientation starts from the edge midpoint with the largest x and adds the
/// other three midpoints rotated onto it.
fn orientation_and_module_size(corners: &[Vector2<f64>; 4]) -> Option<(Vector2<f64>, Vector2<f64>, f64)> {
    let center = corners.iter().fold(Vector2::zeros(), |acc, c| acc + c) * 0.25;
    let midpoints: [Vector2<f64>; 4] = std::array::from_fn(|i| (corners[i] + corners[(i + 1) & 3]) * 0.5 - center);

    let max_index = (0..4)
        .max_by(|&a, &b| midpoints[a].x.total_cmp(&midpoints[b].x))
        .unwrap_or(0);
    let sum = midpoints[max_index] + perpendicular(&midpoints[(max_index + 1) & 3])
        - midpoints[(max_index + 2) & 3]
        - perpendicular(&midpoints[(max_index + 3) & 3]);

    let length = sum.norm();
    if length < f64::EPSILON {
        return None;
    }
    // Four half-widths of 3.5 modules each.
    Some((center, sum / length, length / 14.0))
}

// ============================================================================
// Detection
// ============================================================================

/// Detect finder patterns in a grayscale image.
///
/// Rows are scanned in parallel for images at least `config.parallel_min_height`
/// rows high. The result is ordered by [`FinderPattern::comes_before`]; patterns
/// closer than `config.min_distance` are merged, keeping the more symmetric one.
#[must_use]
pub fn detect_finder_patterns(image: &ImageView, config: &FinderPatternConfig) -> Vec<FinderPattern> {
    if image.width < MIN_IMAGE_SIZE || image.height < MIN_IMAGE_SIZE {
        return Vec::new();
    }
    let _span = tracing::info_span!("finder_patterns").entered();

    let border = config.row_border.min(image.height / 2);
    let rows = border..image.height - border;
    let mut candidates: Vec<FinderPattern> = if image.height >= config.parallel_min_height {
        rows.into_par_iter()
            .flat_map_iter(|y| detect_finder_patterns_in_row(image, y, config.transition_threshold))
            .collect()
    } else {
        rows.flat_map(|y| detect_finder_patterns_in_row(image, y, config.transition_threshold))
            .collect()
    };
    candidates.sort_by(FinderPattern::scan_order);

    let min_sq = config.min_distance * config.min_distance;
    let mut merged: Vec<FinderPattern> = Vec::new();
    for candidate in candidates {
        match merged
            .iter_mut()
            .find(|p| (p.position - candidate.position).norm_squared() < min_sq)
        {
            Some(existing) => {
                if candidate.symmetry_score < existing.symmetry_score {
                    *existing = candidate;
                }
            }
            None => merged.push(candidate),
        }
    }

    for pattern in &mut merged {
        if !refine_finder_pattern_location(image, pattern) {
            tracing::debug!(x = pattern.position.x, y = pattern.position.y, "finder pattern refinement failed");
        }
    }

    merged
}

/// Run-length bounds derived from the first dark run of a candidate.
#[derive(Clone, Copy, Debug)]
struct SegmentBounds {
    black_min: u32,
    black_max: u32,
    white_min: u32,
    white_max: u32,
    center_min: u32,
    center_max: u32,
}

impl SegmentBounds {
    fn from_first_segment(s1: u32) -> Self {
        let black_min = (s1 * 384 / 512).max(1);
        let black_max = (s1 + 3).max(s1 * 640 / 512);
        let white_min = (s1 * 384 / 512).max(1);
        let white_max = (s1 + 6).max(s1 * 640 / 512);
        let center_min = ((3 * black_min as i32 - 6).max(1) as u32).max(black_min * 1280 / 512);
        let center_max = black_max * 1664 / 512;
        Self {
            black_min,
            black_max,
            white_min,
            white_max,
            center_min,
            center_max,
        }
    }

    /// Looser bounds for scanlines in arbitrary directions.
    fn widened(&self) -> Self {
        let lo = |v: u32| v * 307 / 512;
        let hi = |v: u32| v * 1280 / 512;
        Self {
            black_min: lo(self.black_min),
            black_max: hi(self.black_max),
            white_min: lo(self.white_min),
            white_max: hi(self.white_max),
            center_min: lo(self.center_min),
            center_max: hi(self.center_max),
        }
    }
}

/// Average dark and bright intensity of a 1:1:3:1:1 run and the pixel on either side.
///
/// Returns the midpoint, or `None` if the contrast is too weak.
fn determine_threshold(row: &[u8], start: usize, sizes: [usize; 5]) -> Option<u32> {
    let mut sum_black = 0u32;
    let mut sum_white = u32::from(row[start - 1]);
    let mut x = start;
    for (i, &size) in sizes.iter().enumerate() {
        let sum: u32 = row[x..x + size].iter().map(|&v| u32::from(v)).sum();
        if i % 2 == 0 {
            sum_black += sum;
        } else {
            sum_white += sum;
        }
        x += size;
    }
    sum_white += u32::from(row[x]);

    let avg_black = sum_black / (sizes[0] + sizes[2] + sizes[4]) as u32;
    let avg_white = sum_white / (sizes[1] + sizes[3] + 2) as u32;
    if avg_black + 2 >= avg_white {
        return None;
    }
    Some((avg_black + avg_white + 1) / 2)
}

/// Scan a single row for finder patterns.
///
/// Runs that fail a ratio test are recycled: the scan restarts from the run that
/// could still begin a valid pattern instead of the end of the rejected one.
fn detect_finder_patterns_in_row(image: &ImageView, y: usize, transition_threshold: i32) -> Vec<FinderPattern> {
    let width = image.width;
    let row = image.get_row(y);
    let mut found = Vec::new();
    let mut history = TransitionHistory::new();

    let seek_black = |x: &mut usize, history: &mut TransitionHistory| {
        history.reset();
        while *x < width && !is_transition_to_black(row, *x, history, transition_threshold) {
            *x += 1;
        }
        *x < width
    };
    let seek_white = |x: &mut usize, history: &mut TransitionHistory| {
        history.reset();
        while *x < width && !is_transition_to_white(row, *x, history, transition_threshold) {
            *x += 1;
        }
        *x < width
    };

    let mut x = 1usize;
    if !seek_black(&mut x, &mut history) {
        return found;
    }
    let mut s1_start = x;
    let mut s2_start: Option<usize> = None;

    while x < width {
        let s2 = match s2_start {
            Some(s) => s,
            None => {
                if !seek_white(&mut x, &mut history) {
                    break;
                }
                s2_start = Some(x);
                x
            }
        };
        let s1_size = (s2 - s1_start) as u32;
        let bounds = SegmentBounds::from_first_segment(s1_size);

        if !seek_black(&mut x, &mut history) {
            break;
        }
        let s2_size = (x - s2) as u32;
        if s2_size < bounds.white_min || s2_size > bounds.white_max {
            s1_start = x;
            s2_start = None;
            continue;
        }
        let s3_start = x;

        if !seek_white(&mut x, &mut history) {
            break;
        }
        let s3_size = (x - s3_start) as u32;
        let s4_start = x;
        if s3_size < bounds.center_min || s3_size > bounds.center_max {
            s1_start = s3_start;
            s2_start = Some(s4_start);
            x = s4_start;
            continue;
        }

        if !seek_black(&mut x, &mut history) {
            break;
        }
        let s4_size = (x - s4_start) as u32;
        if s4_size < bounds.white_min || s4_size > bounds.white_max {
            if s4_size < s3_size * 384 / 512 || s4_size > s3_size * 640 / 512 {
                s1_start = x;
                s2_start = None;
            } else {
                s1_start = s3_start;
                s2_start = Some(s4_start);
                x = s4_start;
            }
            continue;
        }
        let s5_start = x;

        if !seek_white(&mut x, &mut history) {
            break;
        }
        let s5_size = (x - s5_start) as u32;

        if (bounds.black_min..=bounds.black_max).contains(&s5_size) {
            let sizes = [
                s1_size as usize,
                s2_size as usize,
                s3_size as usize,
                s4_size as usize,
                s5_size as usize,
            ];
            if let Some(pattern) = candidate_from_row(image, y, s1_start, s3_start, s4_start, x, sizes, &bounds) {
                found.push(pattern);
            }
        }

        // Whatever the outcome, the centre run may start the next pattern.
        s1_start = s3_start;
        s2_start = Some(s4_start);
        x = s4_start;
    }

    found
}

/// Verify a 1:1:3:1:1 run found on row `y` and build the pattern.
#[allow(clippy::too_many_arguments)]
fn candidate_from_row(
    image: &ImageView,
    y: usize,
    s1_start: usize,
    s3_start: usize,
    s4_start: usize,
    end: usize,
    sizes: [usize; 5],
    bounds: &SegmentBounds,
) -> Option<FinderPattern> {
    let row = image.get_row(y);
    let x_center = (s3_start + s4_start + 1) / 2;
    let center_intensity = u32::from(row[x_center]);
    let threshold = determine_threshold(row, s1_start, sizes)?;
    if center_intensity >= threshold {
        tracing::trace!(x = x_center, y, "finder candidate rejected: bright centre");
        return None;
    }

    let diameter = end - s1_start;
    let reach = (diameter * 3 + 2) / 4;
    if x_center < reach || y < reach || x_center + reach >= image.width || y + reach >= image.height {
        return None;
    }

    let Some((symmetry_score, edge_points)) =
        check_finder_pattern_in_neighborhood(image, x_center as u32, y as u32, threshold, &bounds.widened())
    else {
        tracing::trace!(x = x_center, y, "finder candidate rejected: neighbourhood");
        return None;
    };

    let corners = estimate_finder_pattern_corners(x_center, y, &edge_points)?;
    let (position, orientation, module_size) = orientation_and_module_size(&corners)?;
    Some(FinderPattern {
        position,
        length: diameter as f64,
        center_intensity,
        gray_threshold: threshold,
        symmetry_score,
        corners,
        orientation,
        module_size,
    })
}

/// Scan eight lines through the centre in 22.5 degree steps.
///
/// Edge point `i` and `i + 8` lie on opposite sides of the same line; the points run
/// counter-clockwise starting at +x. Returns the symmetry score and the sixteen outer
/// edge points.
fn check_finder_pattern_in_neighborhood(
    image: &ImageView,
    x_center: u32,
    y_center: u32,
    threshold: u32,
    bounds: &SegmentBounds,
) -> Option<(f64, [Vector2<f64>; 16])> {
    let mut edge_points = [Vector2::zeros(); 16];
    for i in 0..8 {
        let angle = (i as f64 * 22.5).to_radians();
        let (top, bottom) = check_finder_pattern_directional(image, x_center, y_center, angle, threshold, bounds)?;
        edge_points[i] = top;
        edge_points[i + 8] = bottom;
    }

    let center = Vector2::new(f64::from(x_center), f64::from(y_center));
    let mut score = 0.0;
    let mut min_sq = f64::MAX;
    let mut max_sq = 0.0f64;
    for i in 0..8 {
        let d0 = (edge_points[i] - center).norm_squared();
        let d1 = (edge_points[i + 8] - center).norm_squared();
        score += (d0 - d1).abs();
        min_sq = min_sq.min(d0.min(d1));
        max_sq = max_sq.max(d0.max(d1));
    }
    if min_sq <= 0.0 || min_sq / max_sq < 0.15 {
        return None;
    }

    // The centre block must be entirely dark.
    let radius = ((min_sq.sqrt() / 7.0).round() as i32).max(2);
    let (cx, cy) = (x_center as i32, y_center as i32);
    if cx < radius || cy < radius || cx + radius >= image.width as i32 || cy + radius >= image.height as i32 {
        return None;
    }
    for yy in cy - radius..=cy + radius {
        let row = image.get_row(yy as usize);
        if row[(cx - radius) as usize..=(cx + radius) as usize]
            .iter()
            .any(|&v| u32::from(v) >= threshold)
        {
            return None;
        }
    }

    Some((score, edge_points))
}

/// Check the dark/bright/dark structure along one line in both directions.
fn check_finder_pattern_directional(
    image: &ImageView,
    x_center: u32,
    y_center: u32,
    angle: f64,
    threshold: u32,
    bounds: &SegmentBounds,
) -> Option<(Vector2<f64>, Vector2<f64>)> {
    // Angles grow counter-clockwise on screen, so y flips.
    let reach = image.width.max(image.height).max(10_000) as f64;
    let dx = (angle.cos() * reach).round() as i32;
    let dy = (-angle.sin() * reach).round() as i32;
    let (cx, cy) = (x_center as i32, y_center as i32);
    let mut line_top = Bresenham::new(cx, cy, cx + dx, cy + dy);
    let mut line_bottom = Bresenham::new(cx, cy, cx - dx, cy - dy);
    if !line_top.is_valid() || !line_bottom.is_valid() {
        return None;
    }

    // Dark centre square.
    let half = (bounds.center_max + 1) / 2 + 1;
    let tolerance = (bounds.center_max * 179 / 512).max(1);
    let top = find_next_pixel::<false>(image, x_center, y_center, &mut line_top, half, threshold)?;
    let bottom = find_next_pixel::<false>(image, x_center, y_center, &mut line_bottom, half, threshold)?;
    let top_sq = top.columns * top.columns + top.rows * top.rows;
    let bottom_sq = bottom.columns * bottom.columns + bottom.rows * bottom.rows;
    if top_sq.abs_diff(bottom_sq) > tolerance * tolerance {
        return None;
    }
    // Both runs include the centre pixel.
    let cols = (top.columns + bottom.columns).saturating_sub(1);
    let rows = (top.rows + bottom.rows).saturating_sub(1);
    let center_sq = cols * cols + rows * rows;
    if center_sq < bounds.center_min * bounds.center_min || center_sq > bounds.center_max * bounds.center_max {
        return None;
    }

    let run_ok = |columns: u32, rows: u32, min: u32, max: u32| {
        let l = (columns + rows) * (columns + rows);
        l >= min * min && l <= max * max
    };

    // Bright ring.
    let (tx, ty) = top.first_outside;
    let (bx, by) = bottom.first_outside;
    let top = find_next_pixel::<true>(image, tx, ty, &mut line_top, bounds.white_max + 1, threshold)?;
    let bottom = find_next_pixel::<true>(image, bx, by, &mut line_bottom, bounds.white_max + 1, threshold)?;
    if !run_ok(top.columns, top.rows, bounds.white_min, bounds.white_max)
        || !run_ok(bottom.columns, bottom.rows, bounds.white_min, bounds.white_max)
    {
        return None;
    }

    // Dark outer ring.
    let (tx, ty) = top.first_outside;
    let (bx, by) = bottom.first_outside;
    let top = find_next_pixel::<false>(image, tx, ty, &mut line_top, bounds.black_max + 1, threshold)?;
    let bottom = find_next_pixel::<false>(image, bx, by, &mut line_bottom, bounds.black_max + 1, threshold)?;
    if !run_ok(top.columns, top.rows, bounds.black_min, bounds.black_max)
        || !run_ok(bottom.columns, bottom.rows, bounds.black_min, bounds.black_max)
    {
        return None;
    }

    Some((
        transition_point_subpixel(image, top.last_inside, top.first_outside, threshold),
        transition_point_subpixel(image, bottom.last_inside, bottom.first_outside, threshold),
    ))
}

/// Corners from the sixteen outer edge points.
///
/// The edge point closest to the centre and its partners at 90, 180 and 270 degrees
/// anchor one side each; every side line runs through the anchor's two neighbours.
fn estimate_finder_pattern_corners(x_center: usize, y_center: usize, edge_points: &[Vector2<f64>; 16]) -> Option<[Vector2<f64>; 4]> {
    let n = edge_points.len();
    let center = Vector2::new(x_center as f64, y_center as f64);
    let sq = |i: usize| (edge_points[i] - center).norm_squared();

    let closest = (0..n).min_by(|&a, &b| sq(a).total_cmp(&sq(b)))?;
    let anchors: [usize; 4] = std::array::from_fn(|k| (closest + k * n / 4) % n);
    let max_sq = sq(closest) * (1.0 + EDGE_POINT_DISTANCE_TOLERANCE);
    if anchors[1..].iter().any(|&i| sq(i) >= max_sq) {
        return None;
    }

    let module = ((edge_points[anchors[0]] - edge_points[anchors[2]]).norm()
        + (edge_points[anchors[1]] - edge_points[anchors[3]]).norm())
        / 14.0;
    let max_line_sq = (0.5 * module) * (0.5 * module);

    let mut lines = [Line::default(); 4];
    for (line, &anchor) in lines.iter_mut().zip(&anchors) {
        let next = edge_points[(anchor + 1) % n];
        let prev = edge_points[(anchor + n - 1) % n];
        *line = Line::through(next, prev)?;
        if line.sqr_distance(&edge_points[anchor]) > max_line_sq {
            return None;
        }
    }

    let mut corners = [Vector2::zeros(); 4];
    for k in 0..4 {
        corners[k] = lines[k].intersection(&lines[(k + 1) & 3])?;
    }
    Quad::new(corners).is_ccw().then_some(corners)
}

// ============================================================================
// Refinement
// ============================================================================

/// Re-fit the four edges of a pattern from perpendicular edge searches.
///
/// Every edge gets up to eleven support points: from a point on the current edge the
/// search goes outwards if the pixel is dark and inwards otherwise, and the threshold
/// crossing is interpolated. A least-squares line through the support points is then
/// re-fitted a few times against the positions the points should have between the two
/// neighbouring edges. Edges with fewer than two support points keep their estimate.
///
/// Returns `false` and leaves the pattern untouched if the refined corners are not
/// counter-clockwise.
pub fn refine_finder_pattern_location(image: &ImageView, pattern: &mut FinderPattern) -> bool {
    let corners = pattern.corners;
    let threshold = pattern.gray_threshold;

    // Edge k runs from corner k to corner k + 1.
    let mut lines = [Line::default(); 4];
    for (k, line) in lines.iter_mut().enumerate() {
        let Some(l) = Line::through(corners[k], corners[(k + 1) & 3]) else {
            return false;
        };
        *line = l;
    }

    let max_search = (pattern.module_size * 0.25).round().max(1.0) as u32;
    let divisions = (MAX_SUPPORT_POINTS + 1) as f64;

    for i in 0..4 {
        let edge = corners[(i + 1) & 3] - corners[i];
        let outward = perpendicular(&edge);
        let step = edge / divisions;

        let mut points = Vec::with_capacity(MAX_SUPPORT_POINTS);
        let mut step_indices = Vec::with_capacity(MAX_SUPPORT_POINTS);
        for k in 0..MAX_SUPPORT_POINTS {
            let p = corners[i] + step * (k + 1) as f64;
            let (px, py) = (p.x.round() as i32, p.y.round() as i32);
            let Some(value) = image.pixel_checked(px, py) else {
                continue;
            };

            let transition = if u32::from(value) < threshold {
                let target = p + outward;
                let mut line = Bresenham::new(px, py, target.x.round() as i32, target.y.round() as i32);
                line.is_valid()
                    .then(|| find_next_pixel::<false>(image, px as u32, py as u32, &mut line, max_search, threshold))
                    .flatten()
                    .map(|t| (t.last_inside, t.first_outside))
            } else {
                let target = p - outward;
                let mut line = Bresenham::new(px, py, target.x.round() as i32, target.y.round() as i32);
                line.is_valid()
                    .then(|| find_next_pixel::<true>(image, px as u32, py as u32, &mut line, max_search, threshold))
                    .flatten()
                    .map(|t| (t.first_outside, t.last_inside))
            };

            if let Some((dark, bright)) = transition {
                points.push(transition_point_subpixel(image, dark, bright, threshold));
                step_indices.push(k);
            }
        }

        let Some(mut line) = Line::fit(&points) else {
            continue;
        };

        let prev = lines[(i + 3) & 3];
        let next = lines[(i + 1) & 3];
        let mut projected = vec![Vector2::zeros(); points.len()];
        for _ in 0..5 {
            let (Some(a), Some(b)) = (line.intersection(&prev), line.intersection(&next)) else {
                break;
            };
            let step = (b - a) / divisions;
            let normal = line.normal();
            for ((out, p), &k) in projected.iter_mut().zip(&points).zip(&step_indices) {
                let q = a + step * (k + 1) as f64;
                *out = q + normal * normal.dot(&(p - q));
            }
            let Some(new_line) = Line::fit(&projected) else {
                break;
            };
            let converged = new_line.normal().dot(&normal).abs() >= 1.0 - 1e-12;
            line = new_line;
            if converged {
                break;
            }
        }
        lines[i] = line;
    }

    let mut refined = [Vector2::zeros(); 4];
    for k in 0..4 {
        let Some(c) = lines[(k + 3) & 3].intersection(&lines[k]) else {
            return false;
        };
        refined[k] = c;
    }
    if !Quad::new(refined).is_ccw() {
        return false;
    }
    let Some((position, orientation, module_size)) = orientation_and_module_size(&refined) else {
        return false;
    };

    pattern.position = position;
    pattern.corners = refined;
    pattern.orientation = orientation;
    pattern.module_size = module_size;
    true
}

// ============================================================================
// Triplets
// ============================================================================

/// True if one side of `a` and the opposite side lie along two sides of `b`.
///
/// Side lines of `b` that diverge more than 35 degrees from the direction `a -> b`
/// are skipped. Corners count as on a line within `|ab| * distance_tolerance`.
#[must_use]
pub fn is_parallel(a: &FinderPattern, b: &FinderPattern, distance_tolerance: f64) -> bool {
    let ab = b.position - a.position;
    let length = ab.norm();
    if length < f64::EPSILON {
        return false;
    }
    let direction = ab / length;
    let max_sq = (length * distance_tolerance) * (length * distance_tolerance);
    let min_cos = 35.0f64.to_radians().cos();

    let lines_b: Vec<Option<Line>> = (0..4)
        .map(|n| Line::through(b.corners[n], b.corners[(n + 1) & 3]))
        .collect();

    for n in 0..4 {
        let (Some(line), Some(opposite)) = (lines_b[n], lines_b[(n + 2) & 3]) else {
            continue;
        };
        if direction.dot(&line.direction).abs() <= min_cos {
            continue;
        }
        let near = |line: &Line, c: usize| line.sqr_distance(&a.corners[c & 3]) < max_sq;
        if (0..4).any(|i| near(&line, i) && near(&line, i + 1) && near(&opposite, i + 2) && near(&opposite, i + 3)) {
            return true;
        }
    }
    false
}

/// True if the direction `a -> b` runs along a diagonal of both patterns.
#[must_use]
pub fn is_diagonal(a: &FinderPattern, b: &FinderPattern, angle_tolerance: f64) -> bool {
    let ab = b.position - a.position;
    let length = ab.norm();
    if length < f64::EPSILON {
        return false;
    }
    let direction = ab / length;
    let min_cos = angle_tolerance.cos().abs();

    let along_diagonal = |p: &FinderPattern| {
        [p.corners[2] - p.corners[0], p.corners[3] - p.corners[1]]
            .iter()
            .any(|d| d.try_normalize(f64::EPSILON).is_some_and(|d| d.dot(&direction).abs() >= min_cos))
    };
    along_diagonal(a) && along_diagonal(b)
}

/// Find triplets of finder patterns that may belong to one QR symbol.
///
/// In a valid triplet the top-left pattern is side-by-side with both others, which
/// are diagonal to each other. Each triplet is returned as
/// `[top_left, bottom_left, top_right]`.
#[must_use]
pub fn extract_index_triplets(patterns: &[FinderPattern], config: &FinderPatternConfig) -> Vec<IndexTriplet> {
    let mut triplets = Vec::new();
    if patterns.len() < 3 {
        return triplets;
    }

    let angle_tolerance = config.angle_tolerance_deg.to_radians();
    let parallel_cos = angle_tolerance.cos();
    let perpendicular_cos = angle_tolerance.sin();
    let compatible = |a: &FinderPattern, b: &FinderPattern| {
        let c = a.orientation.dot(&b.orientation).abs();
        let orientation_ok = c >= parallel_cos || c <= perpendicular_cos;
        let larger = a.module_size.max(b.module_size);
        let module_ok = (a.module_size - b.module_size).abs() <= larger * config.module_size_scale_tolerance;
        orientation_ok && module_ok && a.is_normal_reflectance() == b.is_normal_reflectance()
    };
    let relation = |a: &FinderPattern, b: &FinderPattern| -> Option<bool> {
        let parallel = is_parallel(a, b, config.distance_scale_tolerance);
        let diagonal = is_diagonal(a, b, angle_tolerance);
        // Exactly one of the two must hold; `Some(true)` means parallel.
        (parallel != diagonal).then_some(parallel)
    };

    for a in 0..patterns.len() - 2 {
        for b in a + 1..patterns.len() - 1 {
            let (pa, pb) = (&patterns[a], &patterns[b]);
            if !compatible(pa, pb) {
                continue;
            }
            let Some(parallel_ab) = relation(pa, pb) else {
                continue;
            };
            for c in b + 1..patterns.len() {
                let pc = &patterns[c];
                if !compatible(pa, pc) || !compatible(pb, pc) {
                    continue;
                }
                let (Some(parallel_ac), Some(parallel_bc)) = (relation(pa, pc), relation(pb, pc)) else {
                    continue;
                };

                let (top_left, mut others) = match (parallel_ab, parallel_ac, parallel_bc) {
                    (true, true, false) => (a, [b, c]),
                    (true, false, true) => (b, [c, a]),
                    (false, true, true) => (c, [a, b]),
                    _ => continue,
                };

                let origin = patterns[top_left].position;
                let d0 = patterns[others[0]].position - origin;
                let d1 = patterns[others[1]].position - origin;
                if cross(&d0, &d1) >= 0.0 {
                    others.swap(0, 1);
                }
                triplets.push([top_left, others[0], others[1]]);
            }
        }
    }
    triplets
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::OwnedImage;
    use crate::test_utils::{BRIGHT, DARK, render_module_grid};

    /// A lone finder pattern (7x7 modules) with a quiet zone.
    fn single_pattern(module_px: usize) -> OwnedImage {
        let mut modules = vec![0u8; 49];
        for y in 0..7 {
            for x in 0..7 {
                let ring = x == 0 || y == 0 || x == 6 || y == 6;
                let center = (2..=4).contains(&x) && (2..=4).contains(&y);
                modules[y * 7 + x] = u8::from(ring || center);
            }
        }
        render_module_grid(&modules, 7, module_px, 4)
    }

    #[test]
    fn test_threshold_requires_contrast() {
        let row = [BRIGHT, DARK, BRIGHT, DARK, DARK, DARK, BRIGHT, DARK, BRIGHT];
        let t = determine_threshold(&row, 1, [1, 1, 3, 1, 1]).unwrap();
        assert_eq!(t, (u32::from(DARK) + u32::from(BRIGHT) + 1) / 2);

        let flat = [100u8; 9];
        assert!(determine_threshold(&flat, 1, [1, 1, 3, 1, 1]).is_none());
    }

    #[test]
    fn test_segment_bounds() {
        let b = SegmentBounds::from_first_segment(8);
        assert_eq!((b.black_min, b.black_max), (6, 11));
        assert_eq!((b.white_min, b.white_max), (6, 14));
        assert_eq!((b.center_min, b.center_max), (15, 35));
    }

    #[test]
    fn test_detects_single_pattern() {
        let module_px = 8;
        let img = single_pattern(module_px);
        let patterns = detect_finder_patterns(&img.view(), &FinderPatternConfig::default());
        assert_eq!(patterns.len(), 1);

        let p = &patterns[0];
        let expected = (4.0 + 3.5) * module_px as f64 - 0.5;
        assert!((p.position.x - expected).abs() < 0.75, "x = {}", p.position.x);
        assert!((p.position.y - expected).abs() < 0.75, "y = {}", p.position.y);
        assert!((p.module_size - module_px as f64).abs() < 0.5, "module = {}", p.module_size);
        assert!(p.is_normal_reflectance());
        assert!(Quad::new(p.corners).is_ccw());

        let outer = 4.0 * module_px as f64 - 0.5;
        for c in &p.corners {
            let dx = (c.x - outer).abs().min((c.x - outer - 7.0 * module_px as f64).abs());
            let dy = (c.y - outer).abs().min((c.y - outer - 7.0 * module_px as f64).abs());
            assert!(dx < 1.0 && dy < 1.0, "corner {c:?}");
        }
        assert!(p.orientation.x > 0.99);
    }

    #[test]
    fn test_rejects_plain_squares_and_small_images() {
        let modules = vec![1u8; 49];
        let img = render_module_grid(&modules, 7, 8, 4);
        assert!(detect_finder_patterns(&img.view(), &FinderPatternConfig::default()).is_empty());

        let tiny = OwnedImage::new(20, 40, 128);
        assert!(detect_finder_patterns(&tiny.view(), &FinderPatternConfig::default()).is_empty());
    }

    #[test]
    fn test_parallel_scan_matches_sequential() {
        let img = single_pattern(10);
        let sequential = detect_finder_patterns(&img.view(), &FinderPatternConfig::default());
        let config = FinderPatternConfig::builder().parallel_min_height(1).build();
        let parallel = detect_finder_patterns(&img.view(), &config);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_line_fit_and_intersection() {
        let points = [Vector2::new(0.0, 1.0), Vector2::new(1.0, 2.0), Vector2::new(2.0, 3.0)];
        let line = Line::fit(&points).unwrap();
        assert!(line.sqr_distance(&Vector2::new(5.0, 6.0)) < 1e-18);
        let vertical = Line::through(Vector2::new(3.0, 0.0), Vector2::new(3.0, 1.0)).unwrap();
        let p = line.intersection(&vertical).unwrap();
        assert!((p - Vector2::new(3.0, 4.0)).norm() < 1e-12);
    }

    fn synthetic(position: Vector2<f64>, half: f64) -> FinderPattern {
        let corners = [
            position + Vector2::new(-half, -half),
            position + Vector2::new(-half, half),
            position + Vector2::new(half, half),
            position + Vector2::new(half, -half),
        ];
        FinderPattern {
            position,
            length: 2.0 * half,
            center_intensity: 20,
            gray_threshold: 120,
            symmetry_score: 0.0,
            corners,
            orientation: Vector2::new(1.0, 0.0),
            module_size: 2.0 * half / 7.0,
        }
    }

    #[test]
    fn test_triplet_order() {
        let tl = synthetic(Vector2::new(50.0, 50.0), 14.0);
        let bl = synthetic(Vector2::new(50.0, 150.0), 14.0);
        let tr = synthetic(Vector2::new(150.0, 50.0), 14.0);
        assert!(is_parallel(&tl, &bl, 0.175));
        assert!(is_diagonal(&bl, &tr, 9f64.to_radians()));
        assert!(!is_diagonal(&tl, &tr, 9f64.to_radians()));

        let patterns = vec![tr, bl, tl];
        let triplets = extract_index_triplets(&patterns, &FinderPatternConfig::default());
        assert_eq!(triplets, vec![[2, 1, 0]]);
    }
}
