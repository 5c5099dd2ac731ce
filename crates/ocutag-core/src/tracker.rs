//! Frame-to-frame tracking of Oculus tags.
//!
//! The tracker follows the outer corners of every known tag from the previous frame
//! into the current one, confirms the tag by reading it again, and keeps one
//! observation history per camera. Full detection runs whenever nothing is being
//! tracked and at a fixed frame cadence.

use crate::config::{DetectorConfig, TrackerConfig};
use crate::corner::refine_corner;
use crate::history::TagObservationHistory;
use crate::image::ImagePyramid;
use crate::matching::track_points_pyramid;
use crate::pnp::RefineParams;
use crate::pose::Pose;
use crate::quad::Quad;
use crate::reader::{CameraView, add_tag_observation_and_optimize, read_tag};
use crate::tag::{OculusTag, TagSizeMap};
use crate::{Camera, Detector, ImageView, StereoDetection};
use nalgebra::Vector2;
use std::collections::BTreeMap;

/// Tracking status of a tag in the current frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrackingState {
    /// Known, but neither tracked nor detected in this frame.
    #[default]
    NotTracking,
    /// Followed from the previous frame.
    Tracking,
    /// Found by full detection in this frame.
    NewDetection,
}

/// Whether a tag appears to move relative to the world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MotionType {
    /// Not enough evidence yet.
    #[default]
    Unknown,
    /// Consistent with a fixed world pose.
    Static,
    /// Recently moved.
    Dynamic,
}

/// A tag known to the tracker.
#[derive(Clone, Debug)]
pub struct TrackedTag {
    /// Latest tag estimate.
    pub tag: OculusTag,
    /// Observation histories per camera (index 1 stays empty for mono tracking).
    pub histories: [TagObservationHistory; 2],
    /// Status in the latest frame.
    pub state: TrackingState,
    /// Motion classification.
    pub motion: MotionType,
    /// Consecutive frames in which the tag was neither tracked nor detected.
    pub lost_frames: usize,
}

impl TrackedTag {
    fn from_detection(tag: OculusTag, histories: [TagObservationHistory; 2]) -> Self {
        Self {
            tag,
            histories,
            state: TrackingState::NewDetection,
            motion: MotionType::Unknown,
            lost_frames: 0,
        }
    }

    fn longest_history(&self) -> usize {
        self.histories.iter().map(TagObservationHistory::len).max().unwrap_or(0)
    }
}

/// Multi-frame tag tracker for one or two cameras.
///
/// Calls must be made in frame order on one thread; the tracker keeps the image
/// pyramids of the previous frame.
pub struct TagTracker {
    config: TrackerConfig,
    detector: Detector,
    sizes: TagSizeMap,
    tracked: BTreeMap<u32, TrackedTag>,
    previous: [Option<ImagePyramid>; 2],
    frame_index: u64,
}

impl TagTracker {
    /// Create a tracker. `sizes` is used for mono tracking; stereo detections
    /// measure the tag size by triangulation.
    #[must_use]
    pub fn new(config: TrackerConfig, detector_config: DetectorConfig, sizes: TagSizeMap) -> Self {
        Self {
            config,
            detector: Detector::with_config(detector_config),
            sizes,
            tracked: BTreeMap::new(),
            previous: [None, None],
            frame_index: 0,
        }
    }

    /// Tracker configuration.
    #[must_use]
    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// All known tags ordered by id.
    pub fn tracked_tags(&self) -> impl Iterator<Item = &TrackedTag> {
        self.tracked.values()
    }

    /// Forget all tags and the previous frame.
    pub fn reset(&mut self) {
        self.tracked.clear();
        self.previous = [None, None];
        self.frame_index = 0;
    }

    /// Track and detect tags in a synchronized stereo pair.
    ///
    /// Returns all known tags ordered by id with their state in this frame.
    #[allow(clippy::too_many_arguments)]
    pub fn track_tags_stereo(
        &mut self,
        camera_a: &dyn Camera,
        image_a: ImageView<'_>,
        camera_b: &dyn Camera,
        image_b: ImageView<'_>,
        world_t_device: &Pose,
        device_t_camera_a: &Pose,
        device_t_camera_b: &Pose,
    ) -> Vec<&TrackedTag> {
        let views = [
            CameraView::new(camera_a, image_a, world_t_device, device_t_camera_a),
            CameraView::new(camera_b, image_b, world_t_device, device_t_camera_b),
        ];
        self.process_frame(&views);
        self.tracked.values().collect()
    }

    /// Track and detect tags in a single camera.
    pub fn track_tags_mono(
        &mut self,
        camera: &dyn Camera,
        image: ImageView<'_>,
        world_t_device: &Pose,
        device_t_camera: &Pose,
    ) -> Vec<&TrackedTag> {
        let views = [CameraView::new(camera, image, world_t_device, device_t_camera)];
        self.process_frame(&views);
        self.tracked.values().collect()
    }

    fn process_frame(&mut self, views: &[CameraView<'_>]) {
        let _span = tracing::info_span!("track_tags", frame = self.frame_index).entered();
        let pyramids: Vec<ImagePyramid> = views
            .iter()
            .map(|v| ImagePyramid::new(&v.image, self.config.pyramid_layers))
            .collect();

        self.track_known_tags(views, &pyramids);

        let any_tracking = self.tracked.values().any(|t| t.state == TrackingState::Tracking);
        if !any_tracking || self.frame_index % self.config.detection_cadence.max(1) == 0 {
            let detections = self.detect(views);
            self.merge_detections(views, detections);
        }

        let max_lost = self.config.max_lost_frames;
        for tracked in self.tracked.values_mut() {
            if tracked.state == TrackingState::NotTracking {
                tracked.lost_frames += 1;
            } else {
                tracked.lost_frames = 0;
            }
        }
        if max_lost > 0 {
            self.tracked.retain(|id, t| {
                let keep = t.lost_frames <= max_lost;
                if !keep {
                    tracing::debug!(id, "dropping lost tag");
                }
                keep
            });
        }

        for (slot, pyramid) in self.previous.iter_mut().zip(pyramids) {
            *slot = Some(pyramid);
        }
        self.frame_index += 1;
    }

    fn track_known_tags(&mut self, views: &[CameraView<'_>], pyramids: &[ImagePyramid]) {
        let config = self.config;
        let detector_config = self.detector.config();
        let params = config.history_refine_params();
        let stereo = views.len() == 2;

        for tracked in self.tracked.values_mut() {
            // Lost tags come back through detection only; their tracking points are stale.
            let active = tracked.state != TrackingState::NotTracking;
            tracked.state = TrackingState::NotTracking;
            if !active {
                continue;
            }

            let mut tracked_in = [false; 2];
            for (index, view) in views.iter().enumerate() {
                let Some(previous) = self.previous[index].as_ref() else {
                    continue;
                };
                let Some((tag, mut new_history)) = track_in_camera(
                    view,
                    previous,
                    &pyramids[index],
                    tracked,
                    index,
                    &config,
                    &detector_config,
                    &params,
                ) else {
                    continue;
                };

                tracked.tag.world_t_tag = tag.world_t_tag;
                tracked.tag.threshold = tag.threshold;
                let history = &mut tracked.histories[index];
                history.remove_observations(
                    view.camera,
                    &tag.world_t_tag,
                    config.max_projection_error,
                    config.max_outlier_fraction,
                );
                history.append(&mut new_history);
                history.keep_newest(config.max_observations);
                tracked_in[index] = true;
            }

            if !tracked_in.iter().any(|&t| t) {
                continue;
            }

            let optimized = if stereo && tracked_in[0] && tracked_in[1] {
                TagObservationHistory::optimize_pose_stereo(
                    views[0].camera,
                    views[1].camera,
                    &tracked.histories[0],
                    &tracked.histories[1],
                    &tracked.tag.world_t_tag,
                    &params,
                )
            } else {
                let index = usize::from(!tracked_in[0]);
                tracked.histories[index].optimize_pose(views[index].camera, &tracked.tag.world_t_tag, &params)
            };
            match optimized {
                Some(pose) => tracked.tag.world_t_tag = pose,
                None => tracing::debug!(id = tracked.tag.id, "history optimization failed, keeping tracked pose"),
            }

            tracked.state = TrackingState::Tracking;
            tracked.motion = if tracked.longest_history() < config.static_after_observations {
                MotionType::Dynamic
            } else {
                MotionType::Static
            };
        }
    }

    fn detect(&mut self, views: &[CameraView<'_>]) -> Vec<StereoDetection> {
        let params = self.config.history_refine_params();
        match views {
            [a, b] => self.detector.detect_tags_stereo(a, b, &params),
            [view] => self
                .detector
                .detect_tags_with_history(view, self.sizes.default_size, &self.sizes, &params)
                .into_iter()
                .map(|d| StereoDetection {
                    tag: d.reading.tag,
                    histories: [d.history, TagObservationHistory::new()],
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn merge_detections(&mut self, views: &[CameraView<'_>], detections: Vec<StereoDetection>) {
        let config = self.config;
        for detection in detections {
            let StereoDetection { tag, mut histories } = detection;
            let Some(tracked) = self.tracked.get_mut(&tag.id) else {
                tracing::debug!(id = tag.id, "new tag");
                self.tracked.insert(tag.id, TrackedTag::from_detection(tag, histories));
                continue;
            };
            if tracked.state == TrackingState::Tracking {
                continue;
            }

            let mut removed = 0;
            for (index, view) in views.iter().enumerate() {
                let history = &mut tracked.histories[index];
                removed += history.remove_observations(
                    view.camera,
                    &tag.world_t_tag,
                    config.max_projection_error,
                    config.max_outlier_fraction,
                );
                if history.len() <= config.max_observations {
                    history.append(&mut histories[index]);
                    history.keep_newest(config.max_observations);
                }
            }
            tracked.tag = tag;
            tracked.state = TrackingState::NewDetection;
            tracked.motion = if removed == 0 {
                MotionType::Static
            } else {
                MotionType::Dynamic
            };
        }
    }
}

/// Follow `tracked` from the previous frame into `view`.
///
/// Returns the re-read tag and a history holding the new observation.
#[allow(clippy::too_many_arguments)]
fn track_in_camera(
    view: &CameraView<'_>,
    previous: &ImagePyramid,
    current: &ImagePyramid,
    tracked: &TrackedTag,
    index: usize,
    config: &TrackerConfig,
    detector_config: &DetectorConfig,
    params: &RefineParams,
) -> Option<(OculusTag, TagObservationHistory)> {
    let (object_points, image_points) = tracked.histories[index].latest_tracking_points()?;
    let camera_t_tag = tracked.tag.camera_t_tag(&view.world_t_camera);

    let mut predicted = Vec::with_capacity(object_points.len());
    for object in object_points {
        let p = view.camera.project_object(&camera_t_tag, object)?;
        if !view.camera.is_inside(&p, config.visibility_border) {
            return None;
        }
        predicted.push(p);
    }

    let Some(points) = track_points_pyramid(
        previous,
        current,
        image_points,
        &predicted,
        config.tracking_patch_size,
        config.coarsest_search_radius,
    ) else {
        tracing::trace!(id = tracked.tag.id, camera = index, "corner tracking lost");
        return None;
    };

    let mut corners = [Vector2::zeros(); 4];
    for (corner, &point) in corners.iter_mut().zip(&points) {
        let Some(refined) = refine_corner(&view.image, point, config.tracked_corner_window) else {
            tracing::trace!(id = tracked.tag.id, camera = index, "tracked corner refinement failed");
            return None;
        };
        *corner = refined;
    }
    let quad = Quad::new(corners);

    let sizes = TagSizeMap::new(tracked.tag.size);
    let reading = read_tag(
        view.camera,
        &view.image,
        &quad,
        &view.world_t_camera,
        tracked.tag.size,
        &sizes,
        detector_config,
    )?;
    if reading.tag.id != tracked.tag.id {
        tracing::trace!(id = tracked.tag.id, read = reading.tag.id, "tracked quad holds another tag");
        return None;
    }

    let mut tag = reading.tag;
    let mut history = TagObservationHistory::new();
    add_tag_observation_and_optimize(
        view.camera,
        &view.image,
        &view.world_t_camera,
        &mut tag,
        &reading.quad,
        config.visibility_border,
        &mut history,
        params,
    )
    .then_some((tag, history))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use crate::tag::ReflectanceType;
    use crate::test_utils::TagScene;
    use nalgebra::Vector3;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0))
    }

    fn world_t_tag() -> Pose {
        Pose::from_euler(0.1, -0.1, 0.2, Vector3::new(-0.01, -0.05, 0.6))
    }

    fn render(cam: &PinholeCamera, world_t_camera: &Pose) -> TagScene {
        let camera_t_tag = world_t_camera.inverse() * world_t_tag();
        TagScene::render(cam, 33, ReflectanceType::Normal, 0.12, &camera_t_tag, 0.5, 3).unwrap()
    }

    #[test]
    fn test_mono_detection_then_tracking() {
        let cam = camera();
        let mut tracker = TagTracker::new(TrackerConfig::default(), DetectorConfig::default(), TagSizeMap::new(0.12));

        for frame in 0..4 {
            let world_t_device = Pose::from_translation(Vector3::new(0.002 * f64::from(frame), 0.0, 0.0));
            let scene = render(&cam, &world_t_device);
            let tags = tracker.track_tags_mono(&cam, scene.image.view(), &world_t_device, &Pose::identity());
            assert_eq!(tags.len(), 1);
            let tracked = tags[0];
            assert_eq!(tracked.tag.id, 33);
            if frame == 0 {
                assert_eq!(tracked.state, TrackingState::NewDetection);
                assert_eq!(tracked.motion, MotionType::Unknown);
            } else {
                assert_eq!(tracked.state, TrackingState::Tracking);
                assert_eq!(tracked.motion, MotionType::Dynamic);
            }
            assert!(tracked.tag.world_t_tag.translation_distance(&world_t_tag()) < 5e-3);
            assert_eq!(tracked.histories[0].len(), frame as usize + 1);
            assert!(tracked.histories[1].is_empty());
        }

        tracker.reset();
        assert_eq!(tracker.tracked_tags().count(), 0);
    }

    #[test]
    fn test_stereo_detection_measures_size() {
        let cam = camera();
        let device_t_b = Pose::from_translation(Vector3::new(0.08, 0.0, 0.0));
        let mut tracker = TagTracker::new(TrackerConfig::default(), DetectorConfig::default(), TagSizeMap::new(1.0));

        let scene_a = render(&cam, &Pose::identity());
        let scene_b = render(&cam, &device_t_b);
        let tags = tracker.track_tags_stereo(
            &cam,
            scene_a.image.view(),
            &cam,
            scene_b.image.view(),
            &Pose::identity(),
            &Pose::identity(),
            &device_t_b,
        );
        assert_eq!(tags.len(), 1);
        let tracked = tags[0];
        assert_eq!(tracked.state, TrackingState::NewDetection);
        assert!((tracked.tag.size - 0.12).abs() < 3e-3, "size {}", tracked.tag.size);
        assert!(tracked.tag.world_t_tag.translation_distance(&world_t_tag()) < 1e-2);
        assert_eq!(tracked.histories[0].len(), 1);
        assert_eq!(tracked.histories[1].len(), 1);
    }

    #[test]
    fn test_lost_tags_return_through_detection() {
        let cam = camera();
        let mut tracker = TagTracker::new(TrackerConfig::default(), DetectorConfig::default(), TagSizeMap::new(0.12));
        let scene = render(&cam, &Pose::identity());
        tracker.track_tags_mono(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());

        // Lost in between: the old tracking points must not be followed again.
        tracker.tracked.get_mut(&33).unwrap().state = TrackingState::NotTracking;
        let tags = tracker.track_tags_mono(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].state, TrackingState::NewDetection);
        assert_eq!(tags[0].lost_frames, 0);

        let tags = tracker.track_tags_mono(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());
        assert_eq!(tags[0].state, TrackingState::Tracking);
    }

    #[test]
    fn test_unrefined_corners_drop_the_track() {
        let cam = camera();
        // A zero window makes every tracked corner refinement fail.
        let config = TrackerConfig {
            tracked_corner_window: 0,
            ..TrackerConfig::default()
        };
        let mut tracker = TagTracker::new(config, DetectorConfig::default(), TagSizeMap::new(0.12));
        let scene = render(&cam, &Pose::identity());
        for _ in 0..3 {
            let tags = tracker.track_tags_mono(&cam, scene.image.view(), &Pose::identity(), &Pose::identity());
            assert_eq!(tags.len(), 1);
            assert_eq!(tags[0].state, TrackingState::NewDetection);
        }
    }

    #[test]
    fn test_lost_tags_are_dropped() {
        let cam = camera();
        let config = TrackerConfig::builder().max_lost_frames(1).build();
        let mut tracker = TagTracker::new(config, DetectorConfig::default(), TagSizeMap::new(0.12));
        let scene = render(&cam, &Pose::identity());
        assert_eq!(tracker.track_tags_mono(&cam, scene.image.view(), &Pose::identity(), &Pose::identity()).len(), 1);

        let blank = crate::image::OwnedImage::new(640, 480, 128);
        let tags = tracker.track_tags_mono(&cam, blank.view(), &Pose::identity(), &Pose::identity());
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].state, TrackingState::NotTracking);
        assert_eq!(tags[0].lost_frames, 1);
        let tags = tracker.track_tags_mono(&cam, blank.view(), &Pose::identity(), &Pose::identity());
        assert!(tags.is_empty());
    }
}
