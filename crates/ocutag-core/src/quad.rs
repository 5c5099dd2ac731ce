//! Quad detection from line segments.
//!
//! 1. Sobel gradients and directed line segments ([`crate::lines`]).
//! 2. L-shapes: pairs of segments where one ends where the next starts, at a sharp enough angle.
//!    Both segments must agree on which side is dark.
//! 3. Non-maximum suppression of near-duplicate L-shapes.
//! 4. Closed 4-cycles of L-shapes sharing their segments.
//! 5. Winding and shape validation.
//! 6. Sub-pixel refinement of all four corners.
//!
//! Quads with only two or three visible corners are not recovered.

#![allow(clippy::cast_sign_loss)]

use crate::corner::refine_corner;
use crate::image::ImageView;
use crate::lines::{LineParams, LineSegment, compute_sobel, extract_line_segments, line_intersection};
use bumpalo::Bump;
use bumpalo::collections::Vec as BumpVec;
use nalgebra::Vector2;
use std::collections::HashSet;

/// Four image points ordered counter-clockwise in a y-down image.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Quad {
    /// Corner locations.
    pub corners: [Vector2<f64>; 4],
}

impl Quad {
    /// Create a quad from its corners.
    #[must_use]
    pub fn new(corners: [Vector2<f64>; 4]) -> Self {
        Self { corners }
    }

    /// True if every consecutive edge pair turns the same way (cross product <= 0).
    #[must_use]
    pub fn is_ccw(&self) -> bool {
        (0..4).all(|i| {
            let a = self.corners[(i + 1) & 3] - self.corners[i];
            let b = self.corners[(i + 2) & 3] - self.corners[(i + 1) & 3];
            a.x * b.y - a.y * b.x <= 0.0
        })
    }

    /// Corner order reversed, keeping corner 0 in place.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let c = &self.corners;
        Self::new([c[0], c[3], c[2], c[1]])
    }

    /// Cyclic shift so that corner `start` becomes corner 0.
    #[must_use]
    pub fn rotated(&self, start: usize) -> Self {
        Self::new(std::array::from_fn(|i| self.corners[(start + i) & 3]))
    }

    /// Length of edge `i` (from corner `i` to corner `i + 1`).
    #[must_use]
    pub fn edge_length(&self, i: usize) -> f64 {
        (self.corners[(i + 1) & 3] - self.corners[i & 3]).norm()
    }

    /// Shortest edge length.
    #[must_use]
    pub fn min_edge_length(&self) -> f64 {
        (0..4).map(|i| self.edge_length(i)).fold(f64::MAX, f64::min)
    }

    /// Longest edge length.
    #[must_use]
    pub fn max_edge_length(&self) -> f64 {
        (0..4).map(|i| self.edge_length(i)).fold(0.0, f64::max)
    }

    /// Mean of the corners.
    #[must_use]
    pub fn center(&self) -> Vector2<f64> {
        self.corners.iter().fold(Vector2::zeros(), |acc, c| acc + c) * 0.25
    }
}

/// Half size of the corner refinement window for a quad of the given minimal edge length.
#[must_use]
pub fn corner_search_window(min_edge_length: f64) -> usize {
    if min_edge_length < 50.0 {
        2
    } else if min_edge_length < 100.0 {
        3
    } else {
        4
    }
}

/// Corner hypothesis made from two directed segments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LShape {
    /// Segment arriving at the corner.
    pub first: usize,
    /// Segment leaving the corner.
    pub second: usize,
    /// Intersection of both segments' lines.
    pub corner: Vector2<f64>,
    /// Unit bisector pointing between both arms.
    pub bisector: Vector2<f64>,
    /// Sum of both segment lengths.
    pub strength: f64,
    /// True if the corner belongs to a dark region on a bright background.
    pub dark_inside: bool,
}

/// Parameters of the quad detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuadParams {
    /// Segment extraction parameters.
    pub lines: LineParams,
    /// Minimal angle between the arms of an L-shape, radians (default: 30 degrees).
    pub min_corner_angle: f64,
    /// Maximal distance between an arm's endpoint and the corner (default: 5 px).
    pub endpoint_tolerance: f64,
    /// L-shapes closer than this are duplicates (default: 2 px).
    pub nms_distance: f64,
    /// L-shapes with bisectors closer than this are duplicates (default: 10 degrees).
    pub nms_angle: f64,
    /// Minimal distance between neighbouring corners (default: 8 px).
    pub min_side: f64,
    /// Refine corners and reject quads whose refinement fails (default: true).
    pub refine_corners: bool,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            lines: LineParams::default(),
            min_corner_angle: 30.0_f64.to_radians(),
            endpoint_tolerance: 5.0,
            nms_distance: 2.0,
            nms_angle: 10.0_f64.to_radians(),
            min_side: 8.0,
            refine_corners: true,
        }
    }
}

/// Detect quads in a grayscale image.
///
/// The arena holds per-call scratch buffers and can be reset by the caller afterwards.
#[must_use]
pub fn detect_quads(arena: &Bump, img: &ImageView, params: &QuadParams) -> Vec<Quad> {
    let _span = tracing::info_span!("quad_detection").entered();

    let grads = compute_sobel(img);
    let segments = extract_line_segments(&grads, img.width, img.height, &params.lines);
    let lshapes = detect_lshapes(arena, &segments, params);
    let lshapes = suppress_lshapes(arena, &lshapes, params);

    let mut quads = Vec::new();
    for quad in quads_from_lshapes(&lshapes, segments.len(), params) {
        if !params.refine_corners {
            quads.push(quad);
            continue;
        }
        let window = corner_search_window(quad.min_edge_length());
        let mut refined = quad.corners;
        let mut ok = true;
        for c in &mut refined {
            match refine_corner(img, *c, window) {
                Some(p) => *c = p,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        let refined = Quad::new(refined);
        if ok && refined.is_ccw() && refined.min_edge_length() >= params.min_side {
            quads.push(refined);
        } else {
            tracing::trace!(center = ?quad.center(), "quad rejected: corner refinement failed");
        }
    }

    tracing::debug!(
        segments = segments.len(),
        lshapes = lshapes.len(),
        quads = quads.len(),
        "quad detection finished"
    );
    quads
}

/// Pair segments into L-shapes.
pub fn detect_lshapes<'a>(arena: &'a Bump, segments: &[LineSegment], params: &QuadParams) -> BumpVec<'a, LShape> {
    let max_dot = params.min_corner_angle.cos();
    let mut out = BumpVec::new_in(arena);

    for (i, a) in segments.iter().enumerate() {
        let da = a.direction();
        for (j, b) in segments.iter().enumerate() {
            if i == j {
                continue;
            }
            let db = b.direction();
            if da.dot(&db).abs() >= max_dot {
                continue;
            }
            // b turns towards the dark side of a for dark regions, away from it for bright ones.
            let cross = da.x * db.y - da.y * db.x;
            let Some(corner) = line_intersection(a, b) else {
                continue;
            };
            let tolerance = params
                .endpoint_tolerance
                .max(0.15 * a.length().min(b.length()));
            if (corner - a.end).norm() > tolerance || (corner - b.start).norm() > tolerance {
                continue;
            }
            let bisector = db - da;
            let norm = bisector.norm();
            if norm < f64::EPSILON {
                continue;
            }
            out.push(LShape {
                first: i,
                second: j,
                corner,
                bisector: bisector / norm,
                strength: a.length() + b.length(),
                dark_inside: cross > 0.0,
            });
        }
    }
    out
}

/// Keep the strongest of near-identical L-shapes.
pub fn suppress_lshapes<'a>(arena: &'a Bump, lshapes: &[LShape], params: &QuadParams) -> BumpVec<'a, LShape> {
    let mut order: BumpVec<usize> = BumpVec::from_iter_in(0..lshapes.len(), arena);
    order.sort_by(|&a, &b| lshapes[b].strength.total_cmp(&lshapes[a].strength));

    let cos_angle = params.nms_angle.cos();
    let nms_sq = params.nms_distance * params.nms_distance;
    let mut kept: BumpVec<LShape> = BumpVec::new_in(arena);
    for &idx in &order {
        let l = &lshapes[idx];
        let duplicate = kept.iter().any(|k| {
            (k.corner - l.corner).norm_squared() <= nms_sq && k.bisector.dot(&l.bisector) >= cos_angle
        });
        if !duplicate {
            kept.push(*l);
        }
    }
    kept
}

/// Walk closed 4-cycles of L-shapes.
#[must_use]
pub fn quads_from_lshapes(lshapes: &[LShape], segment_count: usize, params: &QuadParams) -> Vec<Quad> {
    // Reverse index: segment -> L-shapes starting with it.
    let mut by_first: Vec<Vec<usize>> = vec![Vec::new(); segment_count];
    for (i, l) in lshapes.iter().enumerate() {
        if l.first < segment_count {
            by_first[l.first].push(i);
        }
    }

    let min_side_sq = params.min_side * params.min_side;
    let far_enough = |a: &LShape, b: &LShape| (a.corner - b.corner).norm_squared() >= min_side_sq;

    let mut visited: HashSet<[usize; 4]> = HashSet::new();
    let mut quads = Vec::new();

    for (i0, l0) in lshapes.iter().enumerate() {
        for &i1 in &by_first[l0.second] {
            let l1 = &lshapes[i1];
            if l1.dark_inside != l0.dark_inside || !far_enough(l0, l1) {
                continue;
            }
            for &i2 in &by_first[l1.second] {
                let l2 = &lshapes[i2];
                if i2 == i0 || l2.dark_inside != l0.dark_inside || !far_enough(l1, l2) {
                    continue;
                }
                for &i3 in &by_first[l2.second] {
                    let l3 = &lshapes[i3];
                    if l3.second != l0.first
                        || l3.dark_inside != l0.dark_inside
                        || !far_enough(l2, l3)
                        || !far_enough(l3, l0)
                    {
                        continue;
                    }
                    let mut key = [i0, i1, i2, i3];
                    key.sort_unstable();
                    if !visited.insert(key) {
                        continue;
                    }
                    if let Some(quad) = validate_quad([l0.corner, l1.corner, l2.corner, l3.corner]) {
                        quads.push(quad);
                    }
                }
            }
        }
    }
    quads
}

/// Bring a corner cycle into counter-clockwise order and check its shape.
#[must_use]
pub fn validate_quad(corners: [Vector2<f64>; 4]) -> Option<Quad> {
    let mut quad = Quad::new(corners);
    if !quad.is_ccw() {
        quad = quad.reversed();
        if !quad.is_ccw() {
            return None;
        }
    }

    // Opposite sides must point in opposite directions.
    let c = &quad.corners;
    let e0 = c[1] - c[0];
    let e1 = c[2] - c[1];
    let e2 = c[3] - c[2];
    let e3 = c[0] - c[3];
    if e0.dot(&e2) >= 0.0 || e1.dot(&e3) >= 0.0 {
        return None;
    }

    // Loose squareness: perspective may distort, but not beyond this ratio.
    if quad.max_edge_length() > 10.0 * quad.min_edge_length() {
        return None;
    }
    Some(quad)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::OwnedImage;

    fn square_image(size: usize, x0: usize, y0: usize, side: usize, dark_inside: bool) -> OwnedImage {
        let (fg, bg) = if dark_inside { (30, 210) } else { (210, 30) };
        let mut img = OwnedImage::new(size, size, bg);
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.set(x, y, fg);
            }
        }
        img
    }

    #[test]
    fn test_ccw_invariant() {
        let q = Quad::new([
            Vector2::new(0.0, 0.0),
            Vector2::new(0.0, 10.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(10.0, 0.0),
        ]);
        assert!(q.is_ccw());
        assert!(!q.reversed().is_ccw());
        assert_eq!(q.rotated(2).corners[0], Vector2::new(10.0, 10.0));
        assert!(q.rotated(3).is_ccw());
    }

    #[test]
    fn test_self_intersecting_rejected() {
        let bow_tie = [
            Vector2::new(0.0, 0.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(0.0, 10.0),
            Vector2::new(10.0, 0.0),
        ];
        assert!(validate_quad(bow_tie).is_none());
    }

    #[test]
    fn test_detects_dark_square() {
        let img = square_image(120, 35, 40, 50, true);
        let arena = Bump::new();
        let quads = detect_quads(&arena, &img.view(), &QuadParams::default());
        assert_eq!(quads.len(), 1, "{quads:?}");
        let q = &quads[0];
        assert!(q.is_ccw());
        let expected = [
            Vector2::new(34.5, 39.5),
            Vector2::new(34.5, 89.5),
            Vector2::new(84.5, 89.5),
            Vector2::new(84.5, 39.5),
        ];
        for e in expected {
            let best = q.corners.iter().map(|c| (c - e).norm()).fold(f64::MAX, f64::min);
            assert!(best < 0.5, "corner {e:?} missing in {q:?}");
        }
    }

    #[test]
    fn test_detects_bright_square() {
        let img = square_image(120, 30, 30, 45, false);
        let arena = Bump::new();
        let quads = detect_quads(&arena, &img.view(), &QuadParams::default());
        assert_eq!(quads.len(), 1);
        assert!(quads[0].is_ccw());
    }

    #[test]
    fn test_square_near_border_ignored() {
        let img = square_image(100, 3, 3, 40, true);
        let arena = Bump::new();
        assert!(detect_quads(&arena, &img.view(), &QuadParams::default()).is_empty());
    }

    #[test]
    fn test_search_window() {
        assert_eq!(corner_search_window(20.0), 2);
        assert_eq!(corner_search_window(60.0), 3);
        assert_eq!(corner_search_window(150.0), 4);
    }
}
