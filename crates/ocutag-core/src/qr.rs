//! QR symbol detection.
//!
//! Builds on [`crate::finder`]: each triplet of finder patterns is turned into a
//! module grid by fitting a homography from code coordinates (modules, origin at the
//! outer corner of the top-left finder) to image pixels.
//!
//! # Pipeline
//!
//! 1. Provisional version from finder distances and module sizes.
//! 2. Initial homography from the twelve finder corners.
//! 3. Version information (versions 7 and up) and timing patterns as gates.
//! 4. Homography refinement from alignment-pattern centres.
//! 5. Format information (error correction level and mask) and module sampling.
//!
//! Payload decoding (Reed-Solomon, unmasking) is left to the caller.

#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use crate::camera::Camera;
use crate::config::FinderPatternConfig;
use crate::finder::{FinderPattern, detect_finder_patterns, extract_index_triplets};
use crate::homography::Homography;
use crate::image::{ImageView, invert};
use crate::pnp::{RefineParams, refine_pose};
use crate::pose::{Pose, pose_from_planar_points};
use crate::transition::{Bresenham, find_next_pixel, transition_point_subpixel};
use nalgebra::{Vector2, Vector3};

/// Smallest frame the detector looks at (one version-1 symbol without quiet zone).
pub const MIN_IMAGE_SIZE: usize = 29;

/// Highest QR version.
pub const MAX_VERSION: u32 = 40;

/// Mask applied to the encoded format information.
pub const FORMAT_MASK: u32 = 0b101_0100_0001_0010;

const FORMAT_GENERATOR: u32 = 0b101_0011_0111;
const VERSION_GENERATOR: u32 = 0b1_1111_0010_0101;

/// Number of modules along one side of a symbol.
#[must_use]
pub const fn modules_per_side(version: u32) -> usize {
    17 + 4 * version as usize
}

// ============================================================================
// Format and version codes
// ============================================================================

/// Error correction level of a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCorrection {
    /// About 7 % of codewords recoverable.
    Low,
    /// About 15 %.
    Medium,
    /// About 25 %.
    Quartile,
    /// About 30 %.
    High,
}

impl ErrorCorrection {
    /// Level from the two format bits.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b01 => Self::Low,
            0b00 => Self::Medium,
            0b11 => Self::Quartile,
            _ => Self::High,
        }
    }

    /// The two format bits of this level.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Low => 0b01,
            Self::Medium => 0b00,
            Self::Quartile => 0b11,
            Self::High => 0b10,
        }
    }

    /// Share of recoverable codewords in percent.
    #[must_use]
    pub fn recovery_percent(self) -> u32 {
        match self {
            Self::Low => 7,
            Self::Medium => 15,
            Self::Quartile => 25,
            Self::High => 30,
        }
    }
}

/// Remainder of the polynomial division of `value` by `generator` over GF(2).
fn bch_remainder(mut value: u32, generator: u32) -> u32 {
    let generator_bits = 32 - generator.leading_zeros();
    while value != 0 && 32 - value.leading_zeros() >= generator_bits {
        let shift = (32 - value.leading_zeros()) - generator_bits;
        value ^= generator << shift;
    }
    value
}

/// Masked 15-bit format code of the 5-bit `format` (error correction bits, mask).
#[must_use]
pub fn encode_format(format: u32) -> u32 {
    let shifted = (format & 0b1_1111) << 10;
    (shifted | bch_remainder(shifted, FORMAT_GENERATOR)) ^ FORMAT_MASK
}

/// 18-bit version code.
#[must_use]
pub fn encode_version(version: u32) -> u32 {
    let shifted = (version & 0b11_1111) << 12;
    shifted | bch_remainder(shifted, VERSION_GENERATOR)
}

/// Nearest codeword among `candidates`, if unique and closer than `max_distance`.
fn decode_nearest(raw: u32, candidates: impl Iterator<Item = (u32, u32)>, max_distance: u32) -> Option<u32> {
    let mut best = None;
    let mut best_distance = u32::MAX;
    let mut ambiguous = false;
    for (value, code) in candidates {
        let distance = (raw ^ code).count_ones();
        if distance < best_distance {
            best = Some(value);
            best_distance = distance;
            ambiguous = false;
        } else if distance == best_distance {
            ambiguous = true;
        }
    }
    (!ambiguous && best_distance < max_distance).then_some(best).flatten()
}

/// 5-bit format from a masked 15-bit code with up to three bit errors.
#[must_use]
pub fn decode_format(raw: u32) -> Option<u32> {
    decode_nearest(raw, (0..32).map(|f| (f, encode_format(f))), 4)
}

/// Version from an 18-bit code with up to three bit errors.
#[must_use]
pub fn decode_version(raw: u32) -> Option<u32> {
    decode_nearest(raw, (7..=MAX_VERSION).map(|v| (v, encode_version(v))), 4)
}

/// Centres of the alignment patterns as `(x, y)` modules, ordered by y then x.
///
/// Version 1 has none; positions overlapping a finder pattern are skipped.
#[must_use]
pub fn alignment_pattern_positions(version: u32) -> Vec<(usize, usize)> {
    if !(2..=MAX_VERSION).contains(&version) {
        return Vec::new();
    }
    let size = modules_per_side(version);
    let count = (version / 7 + 2) as usize;
    let step = if version == 32 {
        26
    } else {
        (4 * version as usize + 2 * count + 1) / (2 * count - 2) * 2
    };

    let mut axis = vec![6; count];
    for (k, a) in axis.iter_mut().skip(1).rev().enumerate() {
        *a = size - 7 - k * step;
    }

    let last = axis[count - 1];
    let mut positions = Vec::with_capacity(count * count - 3);
    for &y in &axis {
        for &x in &axis {
            let on_finder = (x == 6 && y == 6) || (x == last && y == 6) || (x == 6 && y == last);
            if !on_finder {
                positions.push((x, y));
            }
        }
    }
    positions
}

// ============================================================================
// Candidates
// ============================================================================

/// A QR symbol whose module grid has been sampled.
#[derive(Clone, Debug)]
pub struct QrCodeCandidate {
    /// Symbol version, 1 to 40.
    pub version: u32,
    /// Row-major modules, `1` for dark, `modules_per_side(version)` per side.
    pub modules: Vec<u8>,
    /// Mapping from code coordinates (modules) to image pixels.
    pub homography: Homography,
    /// Error correction level from the format information.
    pub error_correction: ErrorCorrection,
    /// Data mask pattern from the format information.
    pub mask: u8,
    /// Finder patterns as top-left, bottom-left, top-right.
    pub finder_patterns: [FinderPattern; 3],
    /// True if the symbol was found bright-on-dark.
    pub inverted: bool,
}

impl QrCodeCandidate {
    /// Modules per side.
    #[must_use]
    pub fn size(&self) -> usize {
        modules_per_side(self.version)
    }

    /// Module at column `x`, row `y`.
    #[must_use]
    pub fn module(&self, x: usize, y: usize) -> u8 {
        self.modules[y * self.size() + x]
    }
}

/// Detector for QR symbols in grayscale frames.
#[derive(Clone, Debug, Default)]
pub struct QrDetector2D {
    config: FinderPatternConfig,
}

impl QrDetector2D {
    /// Detector with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector with custom finder-pattern options.
    #[must_use]
    pub fn with_config(config: FinderPatternConfig) -> Self {
        Self { config }
    }

    /// The finder-pattern options.
    #[must_use]
    pub fn config(&self) -> &FinderPatternConfig {
        &self.config
    }

    /// Detect QR symbols and sample their module grids.
    ///
    /// If the frame yields no dark-on-bright symbol and inverted detection is enabled,
    /// the inverted frame is searched as well.
    #[must_use]
    pub fn detect(&self, image: &ImageView) -> Vec<QrCodeCandidate> {
        if image.width < MIN_IMAGE_SIZE || image.height < MIN_IMAGE_SIZE {
            return Vec::new();
        }
        let _span = tracing::info_span!("qr_extract").entered();

        let codes = self.extract_codes(image, false);
        if !codes.is_empty() || !self.config.detect_inverted {
            return codes;
        }
        let inverted = invert(image);
        self.extract_codes(&inverted.view(), true)
    }

    fn extract_codes(&self, image: &ImageView, inverted: bool) -> Vec<QrCodeCandidate> {
        let patterns = detect_finder_patterns(image, &self.config);
        if patterns.len() < 3 {
            return Vec::new();
        }
        if patterns.len() > self.config.max_finder_patterns {
            tracing::debug!(count = patterns.len(), "too many finder patterns, skipping frame");
            return Vec::new();
        }

        extract_index_triplets(&patterns, &self.config)
            .into_iter()
            .filter_map(|[tl, bl, tr]| {
                let triplet = [patterns[tl], patterns[bl], patterns[tr]];
                extract_code(image, &triplet, inverted)
            })
            .collect()
    }
}

/// Fit, verify and sample one symbol from a finder-pattern triplet.
fn extract_code(image: &ImageView, patterns: &[FinderPattern; 3], inverted: bool) -> Option<QrCodeCandidate> {
    let Some((version_x, version_y)) = provisional_version_range(patterns) else {
        tracing::trace!("triplet rejected: inconsistent provisional version");
        return None;
    };
    let outer = outer_most_corners(patterns);

    let (mut version, mut homography) = [version_x, version_y]
        .into_iter()
        .filter_map(|v| {
            let (code, pixels) = finder_correspondences(patterns, outer, v);
            let h = Homography::from_correspondences(&code, &pixels)?;
            Some((v, h, h.rms_error(&code, &pixels)))
        })
        .min_by(|a, b| a.2.total_cmp(&b.2))
        .map(|(v, h, _)| (v, h))?;

    if version >= 7 {
        let Some(decoded) = read_version_information(image, &homography, version, patterns) else {
            tracing::trace!(version, "triplet rejected: unreadable version information");
            return None;
        };
        if decoded != version {
            version = decoded;
            homography = initial_homography(patterns, outer, version)?;
        }
    }

    if !detect_timing_patterns(image, &homography, version, patterns) {
        tracing::trace!(version, "triplet rejected: timing patterns");
        return None;
    }

    match refine_homography(image, &homography, version, patterns, outer) {
        Some(refined) => homography = refined,
        None => tracing::debug!(version, "homography refinement failed, keeping initial fit"),
    }

    let Some((error_correction, mask)) = read_format_information(image, &homography, version, patterns) else {
        tracing::trace!(version, "triplet rejected: unreadable format information");
        return None;
    };
    let modules = extract_modules(image, &homography, version, patterns)?;

    Some(QrCodeCandidate {
        version,
        modules,
        homography,
        error_correction,
        mask,
        finder_patterns: *patterns,
        inverted,
    })
}

// ============================================================================
// Geometry
// ============================================================================

/// Version estimates along the top (`TL -> TR`) and left (`TL -> BL`) edges.
///
/// The finder centres are `size - 7` modules apart. Returns `None` if either estimate
/// lies outside 1..=40 or the two differ by more than two.
#[must_use]
pub fn provisional_version_range(patterns: &[FinderPattern; 3]) -> Option<(u32, u32)> {
    let [tl, bl, tr] = patterns;
    let estimate = |other: &FinderPattern| -> Option<u32> {
        let module = 0.5 * (tl.module_size + other.module_size);
        if module <= f64::EPSILON {
            return None;
        }
        let size = (other.position - tl.position).norm() / module + 7.0;
        let version = ((size - 17.0) / 4.0).round();
        (1.0..=f64::from(MAX_VERSION))
            .contains(&version)
            .then_some(version as u32)
    };
    let version_x = estimate(tr)?;
    let version_y = estimate(bl)?;
    (version_x.abs_diff(version_y) <= 2).then_some((version_x, version_y))
}

/// Index of the corner of every finder pattern that is also a corner of the symbol.
#[must_use]
pub fn outer_most_corners(patterns: &[FinderPattern; 3]) -> [usize; 3] {
    let [tl, bl, tr] = patterns;
    let away_from_code = -((bl.position - tl.position) + (tr.position - tl.position));
    let diagonal = tr.position - bl.position;
    let directions = [away_from_code, -diagonal, diagonal];

    std::array::from_fn(|i| {
        let p = &patterns[i];
        (0..4)
            .max_by(|&a, &b| {
                let da = (p.corners[a] - p.position).dot(&directions[i]);
                let db = (p.corners[b] - p.position).dot(&directions[i]);
                da.total_cmp(&db)
            })
            .unwrap_or(0)
    })
}

/// Code and image coordinates of the twelve finder corners.
fn finder_correspondences(
    patterns: &[FinderPattern; 3],
    outer: [usize; 3],
    version: u32,
) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
    let m = modules_per_side(version) as f64;
    let code: [[Vector2<f64>; 4]; 3] = [
        [
            Vector2::new(0.0, 0.0),
            Vector2::new(0.0, 7.0),
            Vector2::new(7.0, 7.0),
            Vector2::new(7.0, 0.0),
        ],
        [
            Vector2::new(0.0, m),
            Vector2::new(7.0, m),
            Vector2::new(7.0, m - 7.0),
            Vector2::new(0.0, m - 7.0),
        ],
        [
            Vector2::new(m, 0.0),
            Vector2::new(m - 7.0, 0.0),
            Vector2::new(m - 7.0, 7.0),
            Vector2::new(m, 7.0),
        ],
    ];

    let mut code_points = Vec::with_capacity(12);
    let mut image_points = Vec::with_capacity(12);
    for (pattern, (start, code)) in patterns.iter().zip(outer.iter().zip(&code)) {
        for (k, c) in code.iter().enumerate() {
            code_points.push(*c);
            image_points.push(pattern.corners[(start + k) & 3]);
        }
    }
    (code_points, image_points)
}

/// Least-squares homography from the twelve finder corners.
#[must_use]
pub fn initial_homography(patterns: &[FinderPattern; 3], outer: [usize; 3], version: u32) -> Option<Homography> {
    let (code, pixels) = finder_correspondences(patterns, outer, version);
    Homography::from_correspondences(&code, &pixels)
}

/// Intensity of the pixel under the centre of module `(x, y)`.
fn sample_module(image: &ImageView, homography: &Homography, x: f64, y: f64) -> Option<u32> {
    let p = homography.project(&Vector2::new(x + 0.5, y + 0.5))?;
    image
        .pixel_checked(p.x.round() as i32, p.y.round() as i32)
        .map(u32::from)
}

fn read_bits(image: &ImageView, homography: &Homography, positions: &[(f64, f64)], threshold: u32) -> Option<u32> {
    let mut bits = 0u32;
    for (i, &(x, y)) in positions.iter().enumerate() {
        if sample_module(image, homography, x, y)? < threshold {
            bits |= 1 << i;
        }
    }
    Some(bits)
}

/// Check the two timing patterns between the finder separators.
///
/// Passes if one line is perfect or both have at least 80 % correct modules.
#[must_use]
pub fn detect_timing_patterns(
    image: &ImageView,
    homography: &Homography,
    version: u32,
    patterns: &[FinderPattern; 3],
) -> bool {
    let [tl, bl, tr] = patterns;
    let length = modules_per_side(version) - 14;

    let count_correct = |start: (f64, f64), step: (f64, f64), threshold: u32| -> usize {
        (0..length)
            .filter(|&i| {
                let (x, y) = (start.0 + step.0 * i as f64, start.1 + step.1 * i as f64);
                // Starts and ends on a separator, so even modules are light.
                let expect_dark = i % 2 == 1;
                sample_module(image, homography, x, y).is_some_and(|v| (v < threshold) == expect_dark)
            })
            .count()
    };

    let horizontal = count_correct((7.0, 6.0), (1.0, 0.0), (tl.gray_threshold + tr.gray_threshold + 1) / 2);
    let vertical = count_correct((6.0, 7.0), (0.0, 1.0), (tl.gray_threshold + bl.gray_threshold + 1) / 2);

    let required = length * 8 / 10;
    horizontal == length || vertical == length || (horizontal >= required && vertical >= required)
}

/// Module positions of the two version fields; bit `i` first.
fn version_positions(version: u32) -> [[(f64, f64); 18]; 2] {
    let m = modules_per_side(version) as f64;
    let first = std::array::from_fn(|i| (m - 11.0 + (i % 3) as f64, (i / 3) as f64));
    let second = first.map(|(x, y)| (y, x));
    [first, second]
}

/// Decode the version information next to the top-right and bottom-left finders.
///
/// Only present from version 7 on; either field may be damaged.
#[must_use]
pub fn read_version_information(
    image: &ImageView,
    homography: &Homography,
    version: u32,
    patterns: &[FinderPattern; 3],
) -> Option<u32> {
    if version < 7 {
        return None;
    }
    let threshold = (patterns.iter().map(|p| p.gray_threshold).sum::<u32>() + 1) / 3;
    version_positions(version)
        .iter()
        .filter_map(|positions| read_bits(image, homography, positions, threshold))
        .find_map(decode_version)
}

/// Module positions of the two format fields; bit `i` first.
fn format_positions(version: u32) -> [[(f64, f64); 15]; 2] {
    let m = modules_per_side(version) as f64;
    let first = std::array::from_fn(|i| match i {
        0..=5 => (8.0, i as f64),
        6 => (8.0, 7.0),
        7 => (8.0, 8.0),
        8 => (7.0, 8.0),
        _ => ((14 - i) as f64, 8.0),
    });
    let second = std::array::from_fn(|i| {
        if i < 8 {
            (m - 1.0 - i as f64, 8.0)
        } else {
            (8.0, m - 15.0 + i as f64)
        }
    });
    [first, second]
}

/// Decode error correction level and mask from either format field.
#[must_use]
pub fn read_format_information(
    image: &ImageView,
    homography: &Homography,
    version: u32,
    patterns: &[FinderPattern; 3],
) -> Option<(ErrorCorrection, u8)> {
    let threshold = (patterns.iter().map(|p| p.gray_threshold).sum::<u32>() + 1) / 3;
    let format = format_positions(version)
        .iter()
        .filter_map(|positions| read_bits(image, homography, positions, threshold))
        .find_map(decode_format)?;
    Some((ErrorCorrection::from_bits(format >> 3), (format & 0b111) as u8))
}

/// Re-fit the homography with the centres of the alignment patterns.
///
/// Each centre is found from the darkest pixel near its predicted position and the
/// bright ring around it along the two code axes. Version 1 and symbols without any
/// located alignment pattern keep `homography`.
#[must_use]
pub fn refine_homography(
    image: &ImageView,
    homography: &Homography,
    version: u32,
    patterns: &[FinderPattern; 3],
    outer: [usize; 3],
) -> Option<Homography> {
    let positions = alignment_pattern_positions(version);
    if positions.is_empty() {
        return Some(*homography);
    }

    let [tl, bl, tr] = patterns;
    let threshold = patterns.iter().map(|p| p.gray_threshold).sum::<u32>() / 3;
    let module_sum: f64 = patterns.iter().map(|p| p.module_size).sum();
    let max_search = ((module_sum * 2.0 / 9.0).round() as u32).max(1);
    let radius = (max_search / 2).max(3) as i32;
    let axes = [tr.position - tl.position, bl.position - tl.position];

    let (mut code, mut pixels) = finder_correspondences(patterns, outer, version);
    let initial_count = code.len();
    for (x, y) in positions {
        let module_centre = Vector2::new(x as f64 + 0.5, y as f64 + 0.5);
        let Some(predicted) = homography.project(&module_centre) else {
            continue;
        };
        let Some(centre) = locate_alignment_centre(image, &predicted, radius, threshold, max_search, &axes) else {
            tracing::trace!(x, y, "alignment pattern not found");
            continue;
        };
        code.push(module_centre);
        pixels.push(centre);
    }

    if code.len() == initial_count {
        return Some(*homography);
    }
    Homography::from_correspondences(&code, &pixels)
}

fn locate_alignment_centre(
    image: &ImageView,
    predicted: &Vector2<f64>,
    radius: i32,
    threshold: u32,
    max_search: u32,
    axes: &[Vector2<f64>; 2],
) -> Option<Vector2<f64>> {
    let (px, py) = (predicted.x.round() as i32, predicted.y.round() as i32);
    // Darkest pixel, ties broken by distance to the prediction.
    let mut darkest: Option<(u8, f64, i32, i32)> = None;
    for y in py - radius..=py + radius {
        for x in px - radius..=px + radius {
            let Some(v) = image.pixel_checked(x, y) else {
                continue;
            };
            let distance = (Vector2::new(f64::from(x), f64::from(y)) - predicted).norm_squared();
            if darkest.is_none_or(|(d, dd, _, _)| v < d || (v == d && distance < dd)) {
                darkest = Some((v, distance, x, y));
            }
        }
    }
    let (value, _, sx, sy) = darkest?;
    if u32::from(value) >= threshold {
        return None;
    }

    let start = Vector2::new(f64::from(sx), f64::from(sy));
    let mut midpoints = [Vector2::zeros(); 2];
    for (midpoint, axis) in midpoints.iter_mut().zip(axes) {
        let mut ends = [Vector2::zeros(); 2];
        for (end, sign) in ends.iter_mut().zip([1.0, -1.0]) {
            let target = start + axis * sign;
            let mut line = Bresenham::new(sx, sy, target.x.round() as i32, target.y.round() as i32);
            if !line.is_valid() {
                return None;
            }
            let t = find_next_pixel::<false>(image, sx as u32, sy as u32, &mut line, max_search + 1, threshold)?;
            *end = transition_point_subpixel(image, t.last_inside, t.first_outside, threshold);
        }
        *midpoint = (ends[0] + ends[1]) * 0.5;
    }
    // Each midpoint is centred along its own axis only.
    Some(midpoints[0] + midpoints[1] - start)
}

/// Sample every module of the symbol; `1` is dark.
///
/// Returns `None` if a module centre falls outside the image.
#[must_use]
pub fn extract_modules(
    image: &ImageView,
    homography: &Homography,
    version: u32,
    patterns: &[FinderPattern; 3],
) -> Option<Vec<u8>> {
    let size = modules_per_side(version);
    let sum: u32 = patterns.iter().map(|p| p.gray_threshold).sum();
    let threshold = (sum * 1024 + 512) / 3072;

    let mut modules = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            let value = sample_module(image, homography, x as f64, y as f64)?;
            modules.push(u8::from(value < threshold));
        }
    }
    Some(modules)
}

/// Pose of a symbol with side length `code_size` from its grid homography.
///
/// The code frame has its origin at the outer top-left corner, x along the top edge,
/// y down the left edge and z into the symbol; the result is `camera_T_code`.
#[must_use]
pub fn compute_code_pose(camera: &dyn Camera, homography: &Homography, version: u32, code_size: f64) -> Option<Pose> {
    if !(code_size.is_finite() && code_size > 0.0) {
        return None;
    }
    let m = modules_per_side(version) as f64;
    let scale = code_size / m;

    // Symbol corners, finder centres and the symbol centre.
    let code_points = [
        (0.0, 0.0),
        (0.0, m),
        (m, m),
        (m, 0.0),
        (3.5, 3.5),
        (3.5, m - 3.5),
        (m - 3.5, 3.5),
        (0.5 * m, 0.5 * m),
    ];
    let mut object_xy = Vec::with_capacity(code_points.len());
    let mut image_points = Vec::with_capacity(code_points.len());
    for &(x, y) in &code_points {
        image_points.push(homography.project(&Vector2::new(x, y))?);
        object_xy.push(Vector2::new(x * scale, y * scale));
    }

    let initial = pose_from_planar_points(camera, &object_xy, &image_points)?;
    let object: Vec<Vector3<f64>> = object_xy.iter().map(|p| Vector3::new(p.x, p.y, 0.0)).collect();
    match refine_pose(camera, &initial, &object, &image_points, &RefineParams::default()) {
        Some(refinement) => Some(refinement.pose),
        None => {
            tracing::debug!(version, "code pose refinement failed, keeping closed-form pose");
            Some(initial)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use crate::test_utils::{qr_symbol_modules, render_module_grid};

    #[test]
    fn test_format_and_version_codes() {
        // Level L, mask 0.
        assert_eq!(encode_format(0b01_000), 0b111_0111_1100_0100);
        assert_eq!(encode_format(0), FORMAT_MASK);
        assert_eq!(encode_version(7), 0x07C94);

        for f in 0..32 {
            let code = encode_format(f);
            assert_eq!(decode_format(code), Some(f));
            assert_eq!(decode_format(code ^ 0b100_0000_0100_0001), Some(f));
        }
        for v in 7..=MAX_VERSION {
            let code = encode_version(v);
            assert_eq!(decode_version(code ^ 0b10_0000_0000_1000_0001), Some(v));
        }
        assert_eq!(ErrorCorrection::from_bits(ErrorCorrection::High.bits()), ErrorCorrection::High);
        assert_eq!(ErrorCorrection::from_bits(0b01).recovery_percent(), 7);
    }

    #[test]
    fn test_alignment_positions() {
        assert!(alignment_pattern_positions(1).is_empty());
        assert_eq!(alignment_pattern_positions(2), vec![(18, 18)]);
        let v7 = alignment_pattern_positions(7);
        assert_eq!(v7.len(), 6);
        assert_eq!(v7[0], (22, 6));
        assert_eq!(v7.last(), Some(&(38, 38)));
        // Version 32 uses the irregular step.
        let v32 = alignment_pattern_positions(32);
        assert!(v32.contains(&(34, 6)) && v32.contains(&(60, 112)) && v32.contains(&(138, 138)));
    }

    fn render(version: u32, error_correction: ErrorCorrection, mask: u8, module_px: usize) -> (Vec<u8>, crate::image::OwnedImage) {
        let modules = qr_symbol_modules(version, error_correction, mask, 11);
        let image = render_module_grid(&modules, modules_per_side(version), module_px, 4);
        (modules, image)
    }

    #[test]
    fn test_detects_version_2() {
        let (modules, image) = render(2, ErrorCorrection::Medium, 5, 6);
        let codes = QrDetector2D::new().detect(&image.view());
        assert_eq!(codes.len(), 1);
        let code = &codes[0];
        assert_eq!(code.version, 2);
        assert_eq!(code.error_correction, ErrorCorrection::Medium);
        assert_eq!(code.mask, 5);
        assert!(!code.inverted);
        assert_eq!(code.modules, modules);
    }

    #[test]
    fn test_detects_version_7_with_version_information() {
        let (modules, image) = render(7, ErrorCorrection::Quartile, 2, 5);
        let codes = QrDetector2D::new().detect(&image.view());
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].version, 7);
        assert_eq!(codes[0].modules, modules);
    }

    #[test]
    fn test_rotated_and_inverted_symbols() {
        let version = 3;
        let size = modules_per_side(version);
        let modules = qr_symbol_modules(version, ErrorCorrection::Low, 1, 3);
        // Quarter turn clockwise.
        let rotated: Vec<u8> = (0..size * size)
            .map(|i| {
                let (x, y) = (i % size, i / size);
                modules[(size - 1 - x) * size + y]
            })
            .collect();
        let image = render_module_grid(&rotated, size, 6, 4);
        let codes = QrDetector2D::new().detect(&image.view());
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].modules, modules);

        let normal = render_module_grid(&modules, size, 6, 4);
        let inverted = invert(&normal.view());
        let codes = QrDetector2D::new().detect(&inverted.view());
        assert_eq!(codes.len(), 1);
        assert!(codes[0].inverted);
        assert_eq!(codes[0].modules, modules);

        let config = FinderPatternConfig::builder().detect_inverted(false).build();
        assert!(QrDetector2D::with_config(config).detect(&inverted.view()).is_empty());
    }

    #[test]
    fn test_code_pose_from_homography() {
        let camera = PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0));
        let camera_t_code = Pose::from_euler(0.2, -0.3, 0.1, Vector3::new(-0.05, -0.02, 0.5));
        let version = 4;
        let size = 0.1;
        let m = modules_per_side(version) as f64;

        let code = [
            Vector2::new(0.0, 0.0),
            Vector2::new(0.0, m),
            Vector2::new(m, m),
            Vector2::new(m, 0.0),
        ];
        let pixels = code.map(|c| {
            camera
                .project_object(&camera_t_code, &Vector3::new(c.x * size / m, c.y * size / m, 0.0))
                .unwrap()
        });
        let h = Homography::from_pairs(&code, &pixels).unwrap();
        let pose = compute_code_pose(&camera, &h, version, size).unwrap();
        assert!(pose.translation_distance(&camera_t_code) < 1e-6);
        assert!(pose.angle_to(&camera_t_code) < 1e-6);
        assert!(compute_code_pose(&camera, &h, version, 0.0).is_none());
    }
}
