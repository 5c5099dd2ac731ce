//! Configuration types.
//!
//! - [`DetectorConfig`]: quad detector, tag reader and pose solver constants.
//! - [`TrackerConfig`]: tracker policy constants.
//! - [`FrameChangeConfig`]: keyframe detector options.
//! - [`FinderPatternConfig`]: finder pattern scan and QR grid extraction.
//!
//! All of them are plain `Copy` values with documented defaults and a builder.

use crate::error::{OcutagError, Result};
use crate::lines::LineParams;
use crate::pnp::{RansacParams, RefineParams};
use crate::quad::QuadParams;

// ============================================================================
// DetectorConfig
// ============================================================================

/// Pipeline-level configuration of the tag detector.
///
/// # Example
/// ```
/// use ocutag_core::config::DetectorConfig;
///
/// let config = DetectorConfig::builder()
///     .frame_border(16)
///     .min_intensity_contrast(20)
///     .build();
/// assert_eq!(config.frame_border, 16);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    // Quad detection
    /// Pixels along the image border ignored by the quad detector (default: 10).
    pub frame_border: usize,
    /// Minimal Sobel magnitude of an edge pixel (default: 40).
    pub edge_magnitude_threshold: u16,
    /// Maximal orientation difference inside a line segment in degrees (default: 22.5).
    pub edge_angle_tolerance_deg: f64,
    /// Minimal line segment length in pixels (default: 8).
    pub min_segment_length: f64,
    /// Minimal angle between the two arms of a corner in degrees (default: 30).
    pub min_corner_angle_deg: f64,
    /// Maximal gap between a segment endpoint and the corner it forms (default: 5).
    pub endpoint_tolerance: f64,
    /// Minimal quad side in pixels (default: 8).
    pub min_quad_side: f64,
    /// Refine the four quad corners with the corner refiner (default: true).
    pub refine_quad_corners: bool,

    // Tag reading
    /// Minimal difference between the foreground and background means (default: 10).
    pub min_intensity_contrast: u8,
    /// Fraction of samples per group that must classify correctly (default: 0.9).
    pub classification_quorum: f64,

    // Pose
    /// RANSAC inlier threshold in pixels (default: 2.5).
    pub ransac_inlier_threshold: f64,
    /// RANSAC iterations (default: 10).
    pub ransac_iterations: usize,
    /// Seed of the RANSAC sampler (default: 0).
    pub ransac_seed: u64,
    /// Average edge length above which interior and data corners join the pose (default: 30).
    pub interior_corners_min_edge: f64,
    /// Corner refinement window for interior corners (default: 2).
    pub interior_corner_window: usize,
    /// Levenberg-Marquardt iterations of the mono pose refinement (default: 200).
    pub refine_iterations: usize,
    /// Initial damping of the mono pose refinement (default: 1e-4).
    pub refine_initial_lambda: f64,
    /// Damping factor of the mono pose refinement (default: 2.5).
    pub refine_lambda_factor: f64,

    // Stereo
    /// Search radius of the stereo patch matcher (default: 5).
    pub stereo_search_radius: usize,
    /// Maximal distance between a predicted and a matched stereo point (default: 5).
    pub stereo_max_error: f64,
    /// Levenberg-Marquardt iterations of the stereo refinement (default: 20).
    pub stereo_refine_iterations: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_border: 10,
            edge_magnitude_threshold: 40,
            edge_angle_tolerance_deg: 22.5,
            min_segment_length: 8.0,
            min_corner_angle_deg: 30.0,
            endpoint_tolerance: 5.0,
            min_quad_side: 8.0,
            refine_quad_corners: true,
            min_intensity_contrast: 10,
            classification_quorum: 0.9,
            ransac_inlier_threshold: 2.5,
            ransac_iterations: 10,
            ransac_seed: 0,
            interior_corners_min_edge: 30.0,
            interior_corner_window: 2,
            refine_iterations: 200,
            refine_initial_lambda: 1e-4,
            refine_lambda_factor: 2.5,
            stereo_search_radius: 5,
            stereo_max_error: 5.0,
            stereo_refine_iterations: 20,
        }
    }
}

impl DetectorConfig {
    /// Create a new builder for `DetectorConfig`.
    #[must_use]
    pub fn builder() -> DetectorConfigBuilder {
        DetectorConfigBuilder::default()
    }

    /// Parameters of the quad detector.
    #[must_use]
    pub fn quad_params(&self) -> QuadParams {
        QuadParams {
            lines: LineParams {
                magnitude_threshold: self.edge_magnitude_threshold,
                angle_tolerance: self.edge_angle_tolerance_deg.to_radians(),
                min_length: self.min_segment_length,
                border: self.frame_border,
            },
            min_corner_angle: self.min_corner_angle_deg.to_radians(),
            endpoint_tolerance: self.endpoint_tolerance,
            min_side: self.min_quad_side,
            refine_corners: self.refine_quad_corners,
            ..QuadParams::default()
        }
    }

    /// Parameters of the P3P RANSAC run on the four outer corners.
    #[must_use]
    pub fn ransac_params(&self) -> RansacParams {
        RansacParams {
            iterations: self.ransac_iterations,
            inlier_threshold: self.ransac_inlier_threshold,
            seed: self.ransac_seed,
            ..RansacParams::default()
        }
    }

    /// Parameters of the final mono pose refinement.
    #[must_use]
    pub fn refine_params(&self) -> RefineParams {
        RefineParams {
            max_iterations: self.refine_iterations,
            initial_lambda: self.refine_initial_lambda,
            lambda_factor: self.refine_lambda_factor,
        }
    }

    /// Parameters of the stereo pose refinement.
    #[must_use]
    pub fn stereo_refine_params(&self) -> RefineParams {
        RefineParams {
            max_iterations: self.stereo_refine_iterations,
            ..RefineParams::default()
        }
    }
}

/// Builder for [`DetectorConfig`].
#[derive(Default)]
pub struct DetectorConfigBuilder {
    frame_border: Option<usize>,
    edge_magnitude_threshold: Option<u16>,
    edge_angle_tolerance_deg: Option<f64>,
    min_segment_length: Option<f64>,
    min_corner_angle_deg: Option<f64>,
    endpoint_tolerance: Option<f64>,
    min_quad_side: Option<f64>,
    refine_quad_corners: Option<bool>,
    min_intensity_contrast: Option<u8>,
    classification_quorum: Option<f64>,
    ransac_inlier_threshold: Option<f64>,
    ransac_iterations: Option<usize>,
    ransac_seed: Option<u64>,
    interior_corners_min_edge: Option<f64>,
    /// Window of the interior corner refinement.
    pub interior_corner_window: Option<usize>,
    /// Iterations of the mono refinement.
    pub refine_iterations: Option<usize>,
    stereo_search_radius: Option<usize>,
    stereo_max_error: Option<f64>,
}

impl DetectorConfigBuilder {
    /// Set the ignored image border.
    #[must_use]
    pub fn frame_border(mut self, border: usize) -> Self {
        self.frame_border = Some(border);
        self
    }

    /// Set the minimal edge magnitude.
    #[must_use]
    pub fn edge_magnitude_threshold(mut self, threshold: u16) -> Self {
        self.edge_magnitude_threshold = Some(threshold);
        self
    }

    /// Set the orientation tolerance inside a segment, in degrees.
    #[must_use]
    pub fn edge_angle_tolerance_deg(mut self, degrees: f64) -> Self {
        self.edge_angle_tolerance_deg = Some(degrees);
        self
    }

    /// Set the minimal segment length.
    #[must_use]
    pub fn min_segment_length(mut self, length: f64) -> Self {
        self.min_segment_length = Some(length);
        self
    }

    /// Set the minimal corner angle, in degrees.
    #[must_use]
    pub fn min_corner_angle_deg(mut self, degrees: f64) -> Self {
        self.min_corner_angle_deg = Some(degrees);
        self
    }

    /// Set the endpoint tolerance of L-shapes.
    #[must_use]
    pub fn endpoint_tolerance(mut self, tolerance: f64) -> Self {
        self.endpoint_tolerance = Some(tolerance);
        self
    }

    /// Set the minimal quad side.
    #[must_use]
    pub fn min_quad_side(mut self, side: f64) -> Self {
        self.min_quad_side = Some(side);
        self
    }

    /// Enable or disable quad corner refinement.
    #[must_use]
    pub fn refine_quad_corners(mut self, enable: bool) -> Self {
        self.refine_quad_corners = Some(enable);
        self
    }

    /// Set the minimal foreground/background contrast.
    #[must_use]
    pub fn min_intensity_contrast(mut self, contrast: u8) -> Self {
        self.min_intensity_contrast = Some(contrast);
        self
    }

    /// Set the classification quorum.
    #[must_use]
    pub fn classification_quorum(mut self, quorum: f64) -> Self {
        self.classification_quorum = Some(quorum);
        self
    }

    /// Set the RANSAC inlier threshold.
    #[must_use]
    pub fn ransac_inlier_threshold(mut self, threshold: f64) -> Self {
        self.ransac_inlier_threshold = Some(threshold);
        self
    }

    /// Set the RANSAC iteration count.
    #[must_use]
    pub fn ransac_iterations(mut self, iterations: usize) -> Self {
        self.ransac_iterations = Some(iterations);
        self
    }

    /// Set the RANSAC seed.
    #[must_use]
    pub fn ransac_seed(mut self, seed: u64) -> Self {
        self.ransac_seed = Some(seed);
        self
    }

    /// Set the edge length above which interior corners are used.
    #[must_use]
    pub fn interior_corners_min_edge(mut self, length: f64) -> Self {
        self.interior_corners_min_edge = Some(length);
        self
    }

    /// Set the interior corner refinement window.
    #[must_use]
    pub fn interior_corner_window(mut self, window: usize) -> Self {
        self.interior_corner_window = Some(window);
        self
    }

    /// Set the iterations of the mono refinement.
    #[must_use]
    pub fn refine_iterations(mut self, iterations: usize) -> Self {
        self.refine_iterations = Some(iterations);
        self
    }

    /// Set the stereo search radius.
    #[must_use]
    pub fn stereo_search_radius(mut self, radius: usize) -> Self {
        self.stereo_search_radius = Some(radius);
        self
    }

    /// Set the maximal stereo matching error.
    #[must_use]
    pub fn stereo_max_error(mut self, error: f64) -> Self {
        self.stereo_max_error = Some(error);
        self
    }

    /// Build the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(self) -> DetectorConfig {
        let d = DetectorConfig::default();
        DetectorConfig {
            frame_border: self.frame_border.unwrap_or(d.frame_border),
            edge_magnitude_threshold: self
                .edge_magnitude_threshold
                .unwrap_or(d.edge_magnitude_threshold),
            edge_angle_tolerance_deg: self
                .edge_angle_tolerance_deg
                .unwrap_or(d.edge_angle_tolerance_deg),
            min_segment_length: self.min_segment_length.unwrap_or(d.min_segment_length),
            min_corner_angle_deg: self.min_corner_angle_deg.unwrap_or(d.min_corner_angle_deg),
            endpoint_tolerance: self.endpoint_tolerance.unwrap_or(d.endpoint_tolerance),
            min_quad_side: self.min_quad_side.unwrap_or(d.min_quad_side),
            refine_quad_corners: self.refine_quad_corners.unwrap_or(d.refine_quad_corners),
            min_intensity_contrast: self
                .min_intensity_contrast
                .unwrap_or(d.min_intensity_contrast),
            classification_quorum: self
                .classification_quorum
                .unwrap_or(d.classification_quorum),
            ransac_inlier_threshold: self
                .ransac_inlier_threshold
                .unwrap_or(d.ransac_inlier_threshold),
            ransac_iterations: self.ransac_iterations.unwrap_or(d.ransac_iterations),
            ransac_seed: self.ransac_seed.unwrap_or(d.ransac_seed),
            interior_corners_min_edge: self
                .interior_corners_min_edge
                .unwrap_or(d.interior_corners_min_edge),
            interior_corner_window: self
                .interior_corner_window
                .unwrap_or(d.interior_corner_window),
            refine_iterations: self.refine_iterations.unwrap_or(d.refine_iterations),
            stereo_search_radius: self.stereo_search_radius.unwrap_or(d.stereo_search_radius),
            stereo_max_error: self.stereo_max_error.unwrap_or(d.stereo_max_error),
            ..d
        }
    }
}

// ============================================================================
// TrackerConfig
// ============================================================================

/// Policy constants of the tag tracker.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackerConfig {
    /// Observation histories longer than this stop receiving re-detections (default: 15).
    pub max_observations: usize,
    /// Full detection runs every this many frames (default: 15).
    pub detection_cadence: u64,
    /// Observations after which a tracked tag counts as static (default: 5).
    pub static_after_observations: usize,
    /// Reprojection error above which an observation point is an outlier (default: 0.5 px).
    pub max_projection_error: f64,
    /// Fraction of outlier points an observation may contain (default: 0.1).
    pub max_outlier_fraction: f64,
    /// Layers of the tracking pyramids (default: 6).
    pub pyramid_layers: usize,
    /// Patch size of the point tracker, odd (default: 7).
    pub tracking_patch_size: usize,
    /// Search radius of the point tracker on the coarsest layer (default: 2).
    pub coarsest_search_radius: usize,
    /// Corner refinement window for tracked corners (default: 3).
    pub tracked_corner_window: usize,
    /// Corners closer than this to the image border are not visible (default: 10).
    pub visibility_border: f64,
    /// Consecutive lost frames after which a tag is dropped, 0 keeps it forever (default: 0).
    pub max_lost_frames: usize,
    /// Levenberg-Marquardt iterations of the history refinement (default: 50).
    pub history_refine_iterations: usize,
    /// Side length of rectified tag images (default: 128).
    pub rectified_image_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_observations: 15,
            detection_cadence: 15,
            static_after_observations: 5,
            max_projection_error: 0.5,
            max_outlier_fraction: 0.1,
            pyramid_layers: 6,
            tracking_patch_size: 7,
            coarsest_search_radius: 2,
            tracked_corner_window: 3,
            visibility_border: 10.0,
            max_lost_frames: 0,
            history_refine_iterations: 50,
            rectified_image_size: 128,
        }
    }
}

impl TrackerConfig {
    /// Create a new builder for `TrackerConfig`.
    #[must_use]
    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder::default()
    }

    /// Parameters of the per-history pose refinement.
    #[must_use]
    pub fn history_refine_params(&self) -> RefineParams {
        RefineParams {
            max_iterations: self.history_refine_iterations,
            ..RefineParams::default()
        }
    }
}

/// Builder for [`TrackerConfig`].
#[derive(Default)]
pub struct TrackerConfigBuilder {
    max_observations: Option<usize>,
    detection_cadence: Option<u64>,
    static_after_observations: Option<usize>,
    max_projection_error: Option<f64>,
    max_outlier_fraction: Option<f64>,
    pyramid_layers: Option<usize>,
    max_lost_frames: Option<usize>,
}

impl TrackerConfigBuilder {
    /// Set the observation cap.
    #[must_use]
    pub fn max_observations(mut self, count: usize) -> Self {
        self.max_observations = Some(count);
        self
    }

    /// Set the detection cadence in frames.
    #[must_use]
    pub fn detection_cadence(mut self, frames: u64) -> Self {
        self.detection_cadence = Some(frames);
        self
    }

    /// Set the observation count after which a tag is static.
    #[must_use]
    pub fn static_after_observations(mut self, count: usize) -> Self {
        self.static_after_observations = Some(count);
        self
    }

    /// Set the pruning reprojection error.
    #[must_use]
    pub fn max_projection_error(mut self, error: f64) -> Self {
        self.max_projection_error = Some(error);
        self
    }

    /// Set the pruning outlier fraction.
    #[must_use]
    pub fn max_outlier_fraction(mut self, fraction: f64) -> Self {
        self.max_outlier_fraction = Some(fraction);
        self
    }

    /// Set the number of pyramid layers.
    #[must_use]
    pub fn pyramid_layers(mut self, layers: usize) -> Self {
        self.pyramid_layers = Some(layers);
        self
    }

    /// Set the lost-frame budget.
    #[must_use]
    pub fn max_lost_frames(mut self, frames: usize) -> Self {
        self.max_lost_frames = Some(frames);
        self
    }

    /// Build the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(self) -> TrackerConfig {
        let d = TrackerConfig::default();
        TrackerConfig {
            max_observations: self.max_observations.unwrap_or(d.max_observations),
            detection_cadence: self.detection_cadence.unwrap_or(d.detection_cadence).max(1),
            static_after_observations: self
                .static_after_observations
                .unwrap_or(d.static_after_observations),
            max_projection_error: self.max_projection_error.unwrap_or(d.max_projection_error),
            max_outlier_fraction: self.max_outlier_fraction.unwrap_or(d.max_outlier_fraction),
            pyramid_layers: self.pyramid_layers.unwrap_or(d.pyramid_layers).max(1),
            max_lost_frames: self.max_lost_frames.unwrap_or(d.max_lost_frames),
            ..d
        }
    }
}

// ============================================================================
// FrameChangeConfig
// ============================================================================

/// Options of the keyframe detector. Times are in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameChangeConfig {
    /// Width frames are resampled to (default: 160).
    pub target_width: usize,
    /// Height frames are resampled to (default: 120).
    pub target_height: usize,
    /// Side length of a histogram tile in resampled pixels (default: 20).
    pub tile_size: usize,
    /// Intensity bins per tile histogram (default: 32).
    pub histogram_bins: usize,
    /// Take keyframes on the time caps even without visual change (default: true).
    pub forced_keyframes: bool,
    /// Minimal time between two keyframes (default: 0.1).
    pub minimum_time_between_keyframes: f64,
    /// Time after which a keyframe is taken unless the device moves fast (default: 2.0).
    pub preferred_maximum_time_between_keyframes: f64,
    /// Time after which a keyframe is always taken (default: 5.0).
    pub absolute_maximum_time_between_keyframes: f64,
    /// Tile distances below this count as no change (default: 0.1).
    pub min_histogram_distance: f64,
    /// Tile distances above this count as full change (default: 0.5).
    pub max_histogram_distance: f64,
    /// Aggregate score at which a change is reported (default: 0.2).
    pub change_detection_threshold: f64,
    /// Linear acceleration magnitude marking fast motion, m/s^2 (default: 1.5).
    pub large_acceleration: f64,
    /// Angular velocity magnitude marking fast motion, rad/s (default: 0.5).
    pub large_rotation_rate: f64,
}

impl Default for FrameChangeConfig {
    fn default() -> Self {
        Self {
            target_width: 160,
            target_height: 120,
            tile_size: 20,
            histogram_bins: 32,
            forced_keyframes: true,
            minimum_time_between_keyframes: 0.1,
            preferred_maximum_time_between_keyframes: 2.0,
            absolute_maximum_time_between_keyframes: 5.0,
            min_histogram_distance: 0.1,
            max_histogram_distance: 0.5,
            change_detection_threshold: 0.2,
            large_acceleration: 1.5,
            large_rotation_rate: 0.5,
        }
    }
}

impl FrameChangeConfig {
    /// Create a new builder for `FrameChangeConfig`.
    #[must_use]
    pub fn builder() -> FrameChangeConfigBuilder {
        FrameChangeConfigBuilder::default()
    }

    /// Check that the options describe a usable detector.
    ///
    /// # Errors
    /// Returns [`OcutagError::InvalidConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(OcutagError::InvalidConfig(msg.to_string()));
        if self.tile_size == 0 || self.target_width < self.tile_size || self.target_height < self.tile_size {
            return fail("target resolution must hold at least one tile");
        }
        if self.histogram_bins < 3 || self.histogram_bins > 256 {
            return fail("histogram bins must be in [3, 256]");
        }
        if !(self.minimum_time_between_keyframes >= 0.0
            && self.minimum_time_between_keyframes <= self.preferred_maximum_time_between_keyframes
            && self.preferred_maximum_time_between_keyframes <= self.absolute_maximum_time_between_keyframes)
        {
            return fail("keyframe times must satisfy minimum <= preferred <= absolute");
        }
        if !(self.min_histogram_distance >= 0.0 && self.min_histogram_distance < self.max_histogram_distance) {
            return fail("histogram distance floor must be below its ceiling");
        }
        if !(self.change_detection_threshold > 0.0 && self.change_detection_threshold <= 1.0) {
            return fail("change detection threshold must be in (0, 1]");
        }
        if !(self.large_acceleration > 0.0 && self.large_rotation_rate > 0.0) {
            return fail("motion thresholds must be positive");
        }
        Ok(())
    }
}

/// Builder for [`FrameChangeConfig`].
#[derive(Default)]
pub struct FrameChangeConfigBuilder {
    target_width: Option<usize>,
    target_height: Option<usize>,
    tile_size: Option<usize>,
    histogram_bins: Option<usize>,
    forced_keyframes: Option<bool>,
    minimum_time_between_keyframes: Option<f64>,
    preferred_maximum_time_between_keyframes: Option<f64>,
    absolute_maximum_time_between_keyframes: Option<f64>,
    min_histogram_distance: Option<f64>,
    max_histogram_distance: Option<f64>,
    change_detection_threshold: Option<f64>,
    large_acceleration: Option<f64>,
    large_rotation_rate: Option<f64>,
}

impl FrameChangeConfigBuilder {
    /// Set the resampled resolution.
    #[must_use]
    pub fn target_resolution(mut self, width: usize, height: usize) -> Self {
        self.target_width = Some(width);
        self.target_height = Some(height);
        self
    }

    /// Set the tile size.
    #[must_use]
    pub fn tile_size(mut self, size: usize) -> Self {
        self.tile_size = Some(size);
        self
    }

    /// Set the histogram bin count.
    #[must_use]
    pub fn histogram_bins(mut self, bins: usize) -> Self {
        self.histogram_bins = Some(bins);
        self
    }

    /// Enable or disable time-forced keyframes.
    #[must_use]
    pub fn forced_keyframes(mut self, enable: bool) -> Self {
        self.forced_keyframes = Some(enable);
        self
    }

    /// Set the minimal, preferred maximal and absolute maximal keyframe intervals.
    #[must_use]
    pub fn keyframe_times(mut self, minimum: f64, preferred: f64, absolute: f64) -> Self {
        self.minimum_time_between_keyframes = Some(minimum);
        self.preferred_maximum_time_between_keyframes = Some(preferred);
        self.absolute_maximum_time_between_keyframes = Some(absolute);
        self
    }

    /// Set the tile distance floor and ceiling.
    #[must_use]
    pub fn histogram_distance_range(mut self, min: f64, max: f64) -> Self {
        self.min_histogram_distance = Some(min);
        self.max_histogram_distance = Some(max);
        self
    }

    /// Set the change detection threshold.
    #[must_use]
    pub fn change_detection_threshold(mut self, threshold: f64) -> Self {
        self.change_detection_threshold = Some(threshold);
        self
    }

    /// Set the IMU motion thresholds.
    #[must_use]
    pub fn motion_thresholds(mut self, acceleration: f64, rotation_rate: f64) -> Self {
        self.large_acceleration = Some(acceleration);
        self.large_rotation_rate = Some(rotation_rate);
        self
    }

    /// Build the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(self) -> FrameChangeConfig {
        let d = FrameChangeConfig::default();
        FrameChangeConfig {
            target_width: self.target_width.unwrap_or(d.target_width),
            target_height: self.target_height.unwrap_or(d.target_height),
            tile_size: self.tile_size.unwrap_or(d.tile_size),
            histogram_bins: self.histogram_bins.unwrap_or(d.histogram_bins),
            forced_keyframes: self.forced_keyframes.unwrap_or(d.forced_keyframes),
            minimum_time_between_keyframes: self
                .minimum_time_between_keyframes
                .unwrap_or(d.minimum_time_between_keyframes),
            preferred_maximum_time_between_keyframes: self
                .preferred_maximum_time_between_keyframes
                .unwrap_or(d.preferred_maximum_time_between_keyframes),
            absolute_maximum_time_between_keyframes: self
                .absolute_maximum_time_between_keyframes
                .unwrap_or(d.absolute_maximum_time_between_keyframes),
            min_histogram_distance: self
                .min_histogram_distance
                .unwrap_or(d.min_histogram_distance),
            max_histogram_distance: self
                .max_histogram_distance
                .unwrap_or(d.max_histogram_distance),
            change_detection_threshold: self
                .change_detection_threshold
                .unwrap_or(d.change_detection_threshold),
            large_acceleration: self.large_acceleration.unwrap_or(d.large_acceleration),
            large_rotation_rate: self.large_rotation_rate.unwrap_or(d.large_rotation_rate),
        }
    }
}

// ============================================================================
// FinderPatternConfig
// ============================================================================

/// Finder pattern scan and QR grid extraction constants.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FinderPatternConfig {
    /// Patterns closer than this are duplicates (default: 10 px).
    pub min_distance: f64,
    /// Rows skipped at the top and bottom of the image (default: 10).
    pub row_border: usize,
    /// Image height from which rows are scanned in parallel (default: 600).
    pub parallel_min_height: usize,
    /// Intensity step that counts as a transition (default: 30).
    pub transition_threshold: i32,
    /// Images with more patterns are not searched for codes (default: 15).
    pub max_finder_patterns: usize,
    /// Relative tolerance between the two legs of a triplet (default: 0.175).
    pub distance_scale_tolerance: f64,
    /// Relative tolerance between module sizes of a triplet (default: 0.35).
    pub module_size_scale_tolerance: f64,
    /// Tolerance of the right angle between triplet legs in degrees (default: 9).
    pub angle_tolerance_deg: f64,
    /// Also search the inverted frame for bright-on-dark codes (default: true).
    pub detect_inverted: bool,
}

impl Default for FinderPatternConfig {
    fn default() -> Self {
        Self {
            min_distance: 10.0,
            row_border: 10,
            parallel_min_height: 600,
            transition_threshold: 30,
            max_finder_patterns: 15,
            distance_scale_tolerance: 0.175,
            module_size_scale_tolerance: 0.35,
            angle_tolerance_deg: 9.0,
            detect_inverted: true,
        }
    }
}

impl FinderPatternConfig {
    /// Create a new builder for `FinderPatternConfig`.
    #[must_use]
    pub fn builder() -> FinderPatternConfigBuilder {
        FinderPatternConfigBuilder::default()
    }
}

/// Builder for [`FinderPatternConfig`].
#[derive(Default)]
pub struct FinderPatternConfigBuilder {
    min_distance: Option<f64>,
    parallel_min_height: Option<usize>,
    max_finder_patterns: Option<usize>,
    angle_tolerance_deg: Option<f64>,
    detect_inverted: Option<bool>,
}

impl FinderPatternConfigBuilder {
    /// Set the duplicate distance.
    #[must_use]
    pub fn min_distance(mut self, distance: f64) -> Self {
        self.min_distance = Some(distance);
        self
    }

    /// Set the height from which rows are scanned in parallel.
    #[must_use]
    pub fn parallel_min_height(mut self, height: usize) -> Self {
        self.parallel_min_height = Some(height);
        self
    }

    /// Set the pattern cap.
    #[must_use]
    pub fn max_finder_patterns(mut self, count: usize) -> Self {
        self.max_finder_patterns = Some(count);
        self
    }

    /// Set the triplet angle tolerance, in degrees.
    #[must_use]
    pub fn angle_tolerance_deg(mut self, degrees: f64) -> Self {
        self.angle_tolerance_deg = Some(degrees);
        self
    }

    /// Enable or disable the inverted pass.
    #[must_use]
    pub fn detect_inverted(mut self, enable: bool) -> Self {
        self.detect_inverted = Some(enable);
        self
    }

    /// Build the configuration, using defaults for unset fields.
    #[must_use]
    pub fn build(self) -> FinderPatternConfig {
        let d = FinderPatternConfig::default();
        FinderPatternConfig {
            min_distance: self.min_distance.unwrap_or(d.min_distance),
            parallel_min_height: self.parallel_min_height.unwrap_or(d.parallel_min_height),
            max_finder_patterns: self.max_finder_patterns.unwrap_or(d.max_finder_patterns),
            angle_tolerance_deg: self.angle_tolerance_deg.unwrap_or(d.angle_tolerance_deg),
            detect_inverted: self.detect_inverted.unwrap_or(d.detect_inverted),
            ..d
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_config_builder() {
        let config = DetectorConfig::builder()
            .frame_border(20)
            .ransac_iterations(30)
            .build();
        assert_eq!(config.frame_border, 20);
        assert_eq!(config.ransac_iterations, 30);
        // Check defaults
        assert_eq!(config.min_intensity_contrast, 10);
        assert_eq!(config.quad_params().lines.border, 20);
        assert_eq!(config.ransac_params().iterations, 30);
    }

    #[test]
    fn test_detector_config_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.frame_border, 10);
        assert!((config.ransac_params().inlier_threshold - 2.5).abs() < 1e-12);
        assert_eq!(config.refine_params().max_iterations, 200);
        assert_eq!(config.stereo_refine_params().max_iterations, 20);
    }

    #[test]
    fn test_tracker_config_clamps() {
        let config = TrackerConfig::builder().detection_cadence(0).pyramid_layers(0).build();
        assert_eq!(config.detection_cadence, 1);
        assert_eq!(config.pyramid_layers, 1);
        assert_eq!(config.max_observations, 15);
    }

    #[test]
    fn test_frame_change_validation() {
        assert!(FrameChangeConfig::default().validate().is_ok());
        let bad_times = FrameChangeConfig::builder().keyframe_times(3.0, 2.0, 5.0).build();
        assert!(matches!(bad_times.validate(), Err(OcutagError::InvalidConfig(_))));
        let no_tile = FrameChangeConfig::builder().target_resolution(8, 8).build();
        assert!(no_tile.validate().is_err());
        let bad_range = FrameChangeConfig::builder().histogram_distance_range(0.5, 0.5).build();
        assert!(bad_range.validate().is_err());
    }

    #[test]
    fn test_finder_config_builder() {
        let config = FinderPatternConfig::builder().detect_inverted(false).build();
        assert!(!config.detect_inverted);
        assert_eq!(config.transition_threshold, 30);
    }
}
