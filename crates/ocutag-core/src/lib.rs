//! Core detection and tracking logic of the Ocutag library.
//!
//! Ocutag finds and follows square fiducial markers ("Oculus tags") in 8-bit grayscale
//! images of calibrated cameras, estimates their 6-DoF pose, and carries a couple of
//! related building blocks: a QR finder-pattern and QR symbol detector, a Förstner
//! sub-pixel corner refiner and a keyframe (frame change) detector.
//!
//! # Architecture Overview
//!
//! 1. **Quad detection**:
//!    - Sobel gradients and gradient-direction line segments.
//!    - L-shapes from segment pairs, non-maximum suppression, 4-cycles.
//!    - Convexity and winding checks, sub-pixel corner refinement.
//!
//! 2. **Tag reading**:
//!    - P3P-RANSAC pose from the four outer corners.
//!    - Reflectance classification and intensity threshold from module samples.
//!    - Orientation from the four orientation modules, BCH(16,10) payload decoding.
//!
//! 3. **Pose refinement**:
//!    - Interior and data-matrix corners as extra correspondences.
//!    - Levenberg-Marquardt over one or several views.
//!
//! 4. **Tracking**:
//!    - Coarse-to-fine patch tracking of the outer corners over image pyramids.
//!    - Per-camera observation histories with pruning of stale observations.
//!    - Periodic re-detection and stereo optimization.
//!
//! # Example
//!
//! ```
//! # use ocutag_core::{Detector, config::DetectorConfig};
//! # use ocutag_core::camera::{CameraIntrinsics, PinholeCamera};
//! # use ocutag_core::image::ImageView;
//! # use ocutag_core::pose::Pose;
//! # use ocutag_core::tag::TagSizeMap;
//! let config = DetectorConfig::builder()
//!     .frame_border(12)
//!     .build();
//! let mut detector = Detector::with_config(config);
//!
//! # let pixels = vec![128u8; 64 * 64];
//! # let img = ImageView::new(&pixels, 64, 64, 64).unwrap();
//! let camera = PinholeCamera::new(64, 64, CameraIntrinsics::new(60.0, 60.0, 32.0, 32.0));
//! let sizes = TagSizeMap::new(0.1);
//! let tags = detector.detect_tags_mono(&camera, &img, &Pose::identity(), &Pose::identity(), &sizes);
//! assert!(tags.is_empty());
//! ```

/// Sensor abstraction: projection, unprojection and visibility.
pub mod camera;
/// BCH(16,10) payload codec.
pub mod codec;
/// Configuration types for detectors and trackers.
pub mod config;
/// Förstner sub-pixel corner refinement.
pub mod corner;
/// Error types.
pub mod error;
/// QR finder-pattern detection.
pub mod finder;
/// Keyframe detection from tile histograms and IMU samples.
pub mod frame_change;
/// Per-camera observation histories.
pub mod history;
/// Planar homographies.
pub mod homography;
/// Image buffer abstractions.
pub mod image;
/// Gradient line segments.
pub mod lines;
/// Patch matching for tracking and stereo correspondence.
pub mod matching;
/// Perspective-n-point solvers and Levenberg-Marquardt refinement.
pub mod pnp;
/// Rigid transforms and triangulation.
pub mod pose;
/// QR symbol detection.
pub mod qr;
/// Quad extraction and geometric primitives.
pub mod quad;
/// Tag reading from quads.
pub mod reader;
/// Tag layout, identity and rendering.
pub mod tag;
/// Utilities for testing and synthetic data generation.
pub mod test_utils;
/// Multi-frame tag tracking.
pub mod tracker;
/// Bresenham traversal and intensity transitions.
pub mod transition;

pub use crate::camera::Camera;
pub use crate::config::{DetectorConfig, FinderPatternConfig, FrameChangeConfig, TrackerConfig};
pub use crate::error::{OcutagError, Result};
pub use crate::image::ImageView;
pub use crate::reader::CameraView;
pub use crate::tag::{OculusTag, ReflectanceType, TagSizeMap};

use crate::corner::refine_corner;
use crate::history::TagObservationHistory;
use crate::image::OwnedImage;
use crate::pnp::RefineParams;
use crate::pose::{Pose, triangulate_point};
use crate::quad::Quad;
use crate::reader::{
    TagReading, add_tag_observation, add_tag_observation_and_optimize, compute_tag_pose, is_tag_visible,
    read_data_matrix, read_tag, refine_tag_pose, refine_tag_pose_stereo,
};
use crate::tag::object_corners;
use bumpalo::Bump;
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;

/// Corner refinement window used when re-locating a known tag.
const LOCATE_CORNER_WINDOW: usize = 2;

/// Pipeline-wide statistics for a single detection call.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineStats {
    /// Time taken for quad detection in milliseconds.
    pub quad_ms: f64,
    /// Time taken for reading and refining tags in milliseconds.
    pub reading_ms: f64,
    /// Total pipeline time in milliseconds.
    pub total_ms: f64,
    /// Number of quad candidates passed to the reader.
    pub num_candidates: usize,
    /// Number of final detections.
    pub num_detections: usize,
}

/// A tag read in one camera together with the observation history started for it.
#[derive(Clone, Debug)]
pub struct MonoDetection {
    /// Reading of the tag; `reading.tag` holds the pose refined over `history`.
    pub reading: TagReading,
    /// History holding the first observation.
    pub history: TagObservationHistory,
}

/// A tag found in both cameras of a stereo rig.
#[derive(Clone, Debug)]
pub struct StereoDetection {
    /// The tag with its triangulated size and stereo-optimized pose.
    pub tag: OculusTag,
    /// Observation histories of camera A and camera B.
    pub histories: [TagObservationHistory; 2],
}

/// The main entry point for detecting Oculus tags.
///
/// The detector holds reusable state (the arena allocator used for per-call scratch
/// buffers) and is configured at construction time via [`DetectorConfig`].
pub struct Detector {
    arena: Bump,
    config: DetectorConfig,
}

impl Detector {
    /// Create a new detector instance with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DetectorConfig::default())
    }

    /// Create a detector with custom pipeline configuration.
    #[must_use]
    pub fn with_config(config: DetectorConfig) -> Self {
        Self {
            arena: Bump::new(),
            config,
        }
    }

    /// Get the current detector configuration.
    #[must_use]
    pub fn config(&self) -> DetectorConfig {
        self.config
    }

    fn find_quads(&mut self, image: &ImageView) -> Vec<Quad> {
        self.arena.reset();
        crate::quad::detect_quads(&self.arena, image, &self.config.quad_params())
    }

    /// Detect tags in one image and return them with world poses.
    ///
    /// Every tag is read assuming `sizes.default_size`; ids with a size override get
    /// their translation scaled. Poses are refined with the interior corners when
    /// the tag appears large enough.
    pub fn detect_tags_mono(
        &mut self,
        camera: &dyn Camera,
        image: &ImageView,
        world_t_device: &Pose,
        device_t_camera: &Pose,
        sizes: &TagSizeMap,
    ) -> Vec<OculusTag> {
        self.detect_with_stats(camera, image, world_t_device, device_t_camera, sizes)
            .0
    }

    /// Mono detection with per-stage timing statistics.
    pub fn detect_with_stats(
        &mut self,
        camera: &dyn Camera,
        image: &ImageView,
        world_t_device: &Pose,
        device_t_camera: &Pose,
        sizes: &TagSizeMap,
    ) -> (Vec<OculusTag>, PipelineStats) {
        let mut stats = PipelineStats::default();
        let start_total = std::time::Instant::now();

        let start_quad = std::time::Instant::now();
        let quads = self.find_quads(image);
        stats.quad_ms = start_quad.elapsed().as_secs_f64() * 1000.0;
        stats.num_candidates = quads.len();

        let start_reading = std::time::Instant::now();
        let world_t_camera = world_t_device * device_t_camera;
        let config = self.config;
        let tags: Vec<OculusTag> = {
            let _span = tracing::info_span!("read_tags").entered();
            quads
                .par_iter()
                .filter_map(|quad| {
                    let reading = read_tag(camera, image, quad, &world_t_camera, sizes.default_size, sizes, &config)?;
                    let camera_t_tag = match refine_tag_pose(
                        camera,
                        image,
                        &reading.quad,
                        &reading.camera_t_tag,
                        reading.tag.size,
                        reading.data_matrix,
                        &config,
                    ) {
                        Some(pose) => pose,
                        None => {
                            tracing::debug!(id = reading.tag.id, "pose refinement failed, keeping initial pose");
                            reading.camera_t_tag
                        },
                    };
                    let mut tag = reading.tag;
                    tag.world_t_tag = world_t_camera * camera_t_tag;
                    Some(tag)
                })
                .collect()
        };
        stats.reading_ms = start_reading.elapsed().as_secs_f64() * 1000.0;
        stats.num_detections = tags.len();
        stats.total_ms = start_total.elapsed().as_secs_f64() * 1000.0;

        (tags, stats)
    }

    /// Detect tags in one camera and start an observation history for each of them.
    ///
    /// Tags are read at `tag_size`; the pose is refined over the new history with
    /// `params`. Tags whose corners come closer than the frame border to the image
    /// edge are skipped.
    pub fn detect_tags_with_history(
        &mut self,
        view: &CameraView<'_>,
        tag_size: f64,
        sizes: &TagSizeMap,
        params: &RefineParams,
    ) -> Vec<MonoDetection> {
        let quads = self.find_quads(&view.image);
        let config = self.config;
        let border = config.frame_border as f64;

        let _span = tracing::info_span!("read_tags").entered();
        quads
            .par_iter()
            .filter_map(|quad| {
                let mut reading =
                    read_tag(view.camera, &view.image, quad, &view.world_t_camera, tag_size, sizes, &config)?;
                let mut history = TagObservationHistory::new();
                let quad = reading.quad;
                if !add_tag_observation_and_optimize(
                    view.camera,
                    &view.image,
                    &view.world_t_camera,
                    &mut reading.tag,
                    &quad,
                    border,
                    &mut history,
                    params,
                ) {
                    tracing::trace!(id = reading.tag.id, "candidate rejected: no valid observation");
                    return None;
                }
                reading.camera_t_tag = reading.tag.camera_t_tag(&view.world_t_camera);
                Some(MonoDetection { reading, history })
            })
            .collect()
    }

    /// Detect tags seen by both cameras of a stereo rig.
    ///
    /// Both images are searched with unit tag size. Tags with the same id and
    /// reflectance are paired, their outer corners triangulated to recover the
    /// metric size, and the pose is re-estimated with that size and optimized over
    /// both cameras.
    pub fn detect_tags_stereo(
        &mut self,
        view_a: &CameraView<'_>,
        view_b: &CameraView<'_>,
        params: &RefineParams,
    ) -> Vec<StereoDetection> {
        let unit_sizes = TagSizeMap::new(1.0);
        let detections_a = self.detect_tags_with_history(view_a, 1.0, &unit_sizes, params);
        let mut detections_b: Vec<Option<MonoDetection>> = self
            .detect_tags_with_history(view_b, 1.0, &unit_sizes, params)
            .into_iter()
            .map(Some)
            .collect();

        let _span = tracing::info_span!("stereo_match").entered();
        let mut stereo = Vec::new();
        for a in &detections_a {
            for slot in &mut detections_b {
                let Some(b) = slot.as_ref() else {
                    continue;
                };
                if a.reading.tag.id != b.reading.tag.id || a.reading.tag.reflectance != b.reading.tag.reflectance {
                    continue;
                }
                if let Some(detection) = self.combine_stereo(view_a, view_b, &a.reading, &b.reading, params) {
                    stereo.push(detection);
                    *slot = None;
                    break;
                }
            }
        }
        stereo
    }

    fn combine_stereo(
        &self,
        view_a: &CameraView<'_>,
        view_b: &CameraView<'_>,
        a: &TagReading,
        b: &TagReading,
        params: &RefineParams,
    ) -> Option<StereoDetection> {
        let unit_corners = object_corners(1.0);
        let corners_a = project_corners(view_a, &a.tag, &unit_corners)?;
        let corners_b = project_corners(view_b, &b.tag, &unit_corners)?;

        let mut world_corners = [Vector3::zeros(); 4];
        for (i, corner) in world_corners.iter_mut().enumerate() {
            let Some(point) = triangulate_point(
                view_a.camera,
                &view_a.world_t_camera,
                &corners_a[i],
                view_b.camera,
                &view_b.world_t_camera,
                &corners_b[i],
            ) else {
                tracing::trace!(id = a.tag.id, corner = i, "stereo pair rejected: corner not triangulated");
                return None;
            };
            *corner = point;
        }
        let tag_size = (0..4)
            .map(|i| (world_corners[(i + 1) % 4] - world_corners[i]).norm())
            .sum::<f64>()
            * 0.25;
        if !(tag_size.is_finite() && tag_size > 0.0) {
            return None;
        }

        let ransac = self.config.ransac_params();
        let object = object_corners(tag_size);
        let world_t_tag = if let Some(pose) = compute_tag_pose(view_a.camera, &a.quad.corners, &object, &ransac) {
            let pose = refine_tag_pose_stereo(view_a, view_b, &a.quad, &pose, tag_size, a.data_matrix, &self.config)
                .unwrap_or(pose);
            view_a.world_t_camera * pose
        } else if let Some(pose) = compute_tag_pose(view_b.camera, &b.quad.corners, &object, &ransac) {
            let pose = refine_tag_pose_stereo(view_b, view_a, &b.quad, &pose, tag_size, b.data_matrix, &self.config)
                .unwrap_or(pose);
            view_b.world_t_camera * pose
        } else {
            tracing::trace!(id = a.tag.id, "stereo pair rejected: no pose at triangulated size");
            return None;
        };

        let threshold = ((u16::from(a.tag.threshold) + u16::from(b.tag.threshold) + 1) / 2) as u8;
        let mut tag = OculusTag::new(a.tag.id, a.tag.reflectance, threshold, world_t_tag, tag_size);

        let border = self.config.frame_border as f64;
        let mut history_a = TagObservationHistory::new();
        let mut history_b = TagObservationHistory::new();
        if !add_tag_observation(
            view_a.camera,
            &view_a.image,
            &view_a.world_t_camera,
            &tag,
            &a.quad,
            border,
            &mut history_a,
        ) || !add_tag_observation(
            view_b.camera,
            &view_b.image,
            &view_b.world_t_camera,
            &tag,
            &b.quad,
            border,
            &mut history_b,
        ) {
            tracing::trace!(id = tag.id, "stereo pair rejected: observation failed");
            return None;
        }

        match TagObservationHistory::optimize_pose_stereo(
            view_a.camera,
            view_b.camera,
            &history_a,
            &history_b,
            &tag.world_t_tag,
            params,
        ) {
            Some(pose) => tag.world_t_tag = pose,
            None => tracing::debug!(id = tag.id, "stereo optimization failed, keeping initial pose"),
        }

        Some(StereoDetection {
            tag,
            histories: [history_a, history_b],
        })
    }

    /// Find a known tag in a camera that did not detect it.
    ///
    /// The outer corners are projected with the current tag pose, refined in the
    /// image and read again. On success the observation is appended to `history`
    /// and the tag with its refined pose is returned.
    pub fn locate_tag_in_camera(
        &self,
        view: &CameraView<'_>,
        tag: &OculusTag,
        history: &mut TagObservationHistory,
        params: &RefineParams,
    ) -> Option<OculusTag> {
        let border = self.config.frame_border as f64;
        let camera_t_tag = tag.camera_t_tag(&view.world_t_camera);
        if !is_tag_visible(view.camera, &camera_t_tag, tag.size, border) {
            return None;
        }

        let mut corners = [Vector2::zeros(); 4];
        for (corner, object) in corners.iter_mut().zip(object_corners(tag.size).iter()) {
            let projected = view.camera.project_object(&camera_t_tag, object)?;
            *corner = refine_corner(&view.image, projected, LOCATE_CORNER_WINDOW)?;
        }
        let quad = Quad::new(corners);

        let sizes = TagSizeMap::new(tag.size);
        let reading = read_tag(view.camera, &view.image, &quad, &view.world_t_camera, tag.size, &sizes, &self.config)?;
        if reading.tag.id != tag.id {
            tracing::trace!(expected = tag.id, found = reading.tag.id, "located tag has a different id");
            return None;
        }

        let mut located = reading.tag;
        add_tag_observation_and_optimize(
            view.camera,
            &view.image,
            &view.world_t_camera,
            &mut located,
            &reading.quad,
            border,
            history,
            params,
        )
        .then_some(located)
    }

    /// True if the payload of `tag` can be read at its predicted location in `view`.
    #[must_use]
    pub fn confirm_detection_in_frame(&self, view: &CameraView<'_>, tag: &OculusTag) -> bool {
        let camera_t_tag = tag.camera_t_tag(&view.world_t_camera);
        if !is_tag_visible(view.camera, &camera_t_tag, tag.size, self.config.frame_border as f64) {
            return false;
        }
        let Some(dark_value) = tag.reflectance.dark_value() else {
            return false;
        };
        read_data_matrix(view.camera, &view.image, &camera_t_tag, tag.size, tag.threshold, dark_value)
            .and_then(codec::decode)
            .is_some_and(|id| id == tag.id)
    }

    /// Fronto-parallel image of `tag` with `size` x `size` pixels.
    ///
    /// The tag is sampled from the camera that sees it fully; if both do, from the
    /// one where the tag centre projects closer to the image centre.
    #[must_use]
    pub fn extract_rectified_tag_image(
        &self,
        view_a: &CameraView<'_>,
        view_b: &CameraView<'_>,
        tag: &OculusTag,
        size: usize,
    ) -> Option<OwnedImage> {
        if size == 0 {
            return None;
        }
        let border = self.config.frame_border as f64;
        let centre = Vector3::new(0.5 * tag.size, 0.5 * tag.size, 0.0);
        let centre_distance = |view: &CameraView<'_>| -> Option<f64> {
            let camera_t_tag = tag.camera_t_tag(&view.world_t_camera);
            if !is_tag_visible(view.camera, &camera_t_tag, tag.size, border) {
                return None;
            }
            let image_centre = Vector2::new(view.camera.width() as f64, view.camera.height() as f64) * 0.5;
            view.camera
                .project_object(&camera_t_tag, &centre)
                .map(|p| (p - image_centre).norm_squared())
        };

        let view = match (centre_distance(view_a), centre_distance(view_b)) {
            (Some(da), Some(db)) => {
                if db < da {
                    view_b
                } else {
                    view_a
                }
            },
            (Some(_), None) => view_a,
            (None, Some(_)) => view_b,
            (None, None) => return None,
        };

        let camera_t_tag = tag.camera_t_tag(&view.world_t_camera);
        let mut rectified = OwnedImage::new(size, size, 0);
        let step = tag.size / size as f64;
        for y in 0..size {
            for x in 0..size {
                let point = Vector3::new((x as f64 + 0.5) * step, (y as f64 + 0.5) * step, 0.0);
                let Some(p) = view.camera.project_object(&camera_t_tag, &point) else {
                    return None;
                };
                let value = view.image.interpolate_clamped(p.x, p.y).round().clamp(0.0, 255.0) as u8;
                rectified.set(x, y, value);
            }
        }
        Some(rectified)
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Project the outer corners of `tag` into `view`.
fn project_corners(view: &CameraView<'_>, tag: &OculusTag, corners: &[Vector3<f64>; 4]) -> Option<[Vector2<f64>; 4]> {
    let camera_t_tag = tag.camera_t_tag(&view.world_t_camera);
    let mut out = [Vector2::zeros(); 4];
    for (o, c) in out.iter_mut().zip(corners) {
        *o = view.camera.project_object(&camera_t_tag, c)?;
    }
    Some(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use crate::test_utils::TagScene;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0))
    }

    #[test]
    fn test_detect_mono_recovers_pose() {
        let cam = camera();
        let camera_t_tag = Pose::from_euler(0.2, -0.15, 0.4, Vector3::new(-0.06, -0.05, 0.45));
        let scene = TagScene::render(&cam, 77, ReflectanceType::Normal, 0.12, &camera_t_tag, 1.0, 3).unwrap();

        let mut detector = Detector::new();
        let (tags, stats) = detector.detect_with_stats(
            &cam,
            &scene.image.view(),
            &Pose::identity(),
            &Pose::identity(),
            &TagSizeMap::new(0.12),
        );
        assert_eq!(tags.len(), 1);
        assert_eq!(stats.num_detections, 1);
        assert!(stats.num_candidates >= 1);
        let tag = &tags[0];
        assert_eq!(tag.id, 77);
        assert_eq!(tag.reflectance, ReflectanceType::Normal);
        assert!(tag.world_t_tag.translation_distance(&camera_t_tag) < 5e-3);
        assert!(tag.world_t_tag.angle_to(&camera_t_tag) < 2e-2);
    }

    #[test]
    fn test_confirm_detection_and_rectify() {
        let cam = camera();
        let camera_t_tag = Pose::from_euler(0.1, 0.1, -0.2, Vector3::new(-0.05, -0.05, 0.4));
        let scene = TagScene::render(&cam, 5, ReflectanceType::Inverted, 0.1, &camera_t_tag, 0.0, 3).unwrap();
        let detector = Detector::new();
        let view = CameraView::new(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());

        let reading = read_tag(
            &cam,
            &view.image,
            &scene.quad,
            &Pose::identity(),
            0.1,
            &TagSizeMap::new(0.1),
            &detector.config(),
        )
        .unwrap();
        assert!(detector.confirm_detection_in_frame(&view, &reading.tag));

        let mut other = reading.tag.clone();
        other.id = 6;
        assert!(!detector.confirm_detection_in_frame(&view, &other));

        let rectified = detector
            .extract_rectified_tag_image(&view, &view, &reading.tag, 64)
            .unwrap();
        // Inverted tags have a bright border.
        assert!(rectified.get(2, 2) > 150);
        assert!(rectified.get(32, 2) > 150);
    }

    #[test]
    fn test_locate_tag_from_predicted_pose() {
        let cam = camera();
        let camera_t_tag = Pose::from_euler(-0.1, 0.2, 0.1, Vector3::new(-0.05, -0.04, 0.4));
        let scene = TagScene::render(&cam, 901, ReflectanceType::Normal, 0.1, &camera_t_tag, 0.0, 3).unwrap();
        let detector = Detector::new();
        let view = CameraView::new(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());

        let predicted = Pose::from_translation(Vector3::new(0.001, -0.001, 0.002)) * camera_t_tag;
        let tag = OculusTag::new(901, ReflectanceType::Normal, 128, predicted, 0.1);
        let mut history = TagObservationHistory::new();
        let located = detector
            .locate_tag_in_camera(&view, &tag, &mut history, &RefineParams::default())
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(located.world_t_tag.translation_distance(&camera_t_tag) < 2e-3);
    }
}
