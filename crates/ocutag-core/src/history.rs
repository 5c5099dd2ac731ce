//! Per-camera observation history of a tracked tag.
//!
//! Every observation stores the camera pose at capture time, the 2D/3D
//! correspondences used for pose refinement and the subset that is followed from
//! frame to frame (the four outer corners).

use crate::camera::Camera;
use crate::pnp::{PoseView, RefineParams, refine_object_pose_multi_view};
use crate::pose::Pose;
use nalgebra::{Vector2, Vector3};

/// One sighting of a tag in one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct TagObservation {
    /// Camera pose when the observation was made.
    pub world_t_camera: Pose,
    /// Tag points in the tag frame.
    pub object_points: Vec<Vector3<f64>>,
    /// Their measured image locations.
    pub image_points: Vec<Vector2<f64>>,
    /// Tag points followed by the frame-to-frame tracker.
    pub tracking_object_points: Vec<Vector3<f64>>,
    /// Their image locations.
    pub tracking_image_points: Vec<Vector2<f64>>,
}

/// Observations of one tag in one camera, oldest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagObservationHistory {
    observations: Vec<TagObservation>,
}

impl TagObservationHistory {
    /// Empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the newest observation.
    ///
    /// Observations without correspondences or with fewer than four tracking points
    /// are ignored.
    pub fn add_observation(&mut self, observation: TagObservation) {
        if observation.object_points.is_empty()
            || observation.object_points.len() != observation.image_points.len()
            || observation.tracking_object_points.len() < 4
            || observation.tracking_object_points.len() != observation.tracking_image_points.len()
        {
            return;
        }
        self.observations.push(observation);
    }

    /// Move all observations of `other` to the end of this history.
    pub fn append(&mut self, other: &mut TagObservationHistory) {
        self.observations.append(&mut other.observations);
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// True if nothing has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// All observations, oldest first.
    #[must_use]
    pub fn observations(&self) -> &[TagObservation] {
        &self.observations
    }

    /// Newest observation.
    #[must_use]
    pub fn latest(&self) -> Option<&TagObservation> {
        self.observations.last()
    }

    /// Tracking points of the newest observation as `(object, image)` slices.
    #[must_use]
    pub fn latest_tracking_points(&self) -> Option<(&[Vector3<f64>], &[Vector2<f64>])> {
        self.latest()
            .map(|o| (o.tracking_object_points.as_slice(), o.tracking_image_points.as_slice()))
    }

    /// Evict the oldest observations until at most `max` remain.
    pub fn keep_newest(&mut self, max: usize) {
        let excess = self.observations.len().saturating_sub(max);
        self.observations.drain(..excess);
    }

    /// Drop all observations.
    pub fn clear(&mut self) {
        self.observations.clear();
    }

    /// Remove observations that contradict `world_t_tag`.
    ///
    /// Starting with the newest observation, the first one with more than
    /// `round(n * max_outlier_fraction)` points whose reprojection error exceeds
    /// `max_error` is removed together with everything older. Returns the number
    /// of removed observations.
    pub fn remove_observations(
        &mut self,
        camera: &dyn Camera,
        world_t_tag: &Pose,
        max_error: f64,
        max_outlier_fraction: f64,
    ) -> usize {
        let max_sq = max_error * max_error;
        let violating = self.observations.iter().rposition(|observation| {
            let camera_t_tag = observation.world_t_camera.inverse() * *world_t_tag;
            let n = observation.object_points.len();
            let max_outliers = (n as f64 * max_outlier_fraction).round() as usize;
            let mut outliers = 0usize;
            for (object, image) in observation.object_points.iter().zip(&observation.image_points) {
                let error = camera
                    .project_object(&camera_t_tag, object)
                    .map_or(f64::INFINITY, |p| (p - image).norm_squared());
                if error > max_sq {
                    outliers += 1;
                    if outliers > max_outliers {
                        return true;
                    }
                }
            }
            false
        });

        let Some(index) = violating else {
            return 0;
        };
        self.observations.drain(..=index);
        index + 1
    }

    fn views<'a>(&'a self, camera: &'a dyn Camera) -> impl Iterator<Item = PoseView<'a>> {
        self.observations.iter().map(move |o| PoseView {
            camera,
            camera_t_world: o.world_t_camera.inverse(),
            object_points: &o.object_points,
            image_points: &o.image_points,
        })
    }

    /// Refine `world_t_tag` over all observations of this history.
    #[must_use]
    pub fn optimize_pose(&self, camera: &dyn Camera, world_t_tag: &Pose, params: &RefineParams) -> Option<Pose> {
        if self.is_empty() {
            return None;
        }
        let views: Vec<PoseView<'_>> = self.views(camera).collect();
        refine_object_pose_multi_view(&views, world_t_tag, params)
            .map(|r| r.pose)
            .filter(Pose::is_valid)
    }

    /// Refine `world_t_tag` jointly over the histories of two cameras.
    #[must_use]
    pub fn optimize_pose_stereo(
        camera_a: &dyn Camera,
        camera_b: &dyn Camera,
        history_a: &TagObservationHistory,
        history_b: &TagObservationHistory,
        world_t_tag: &Pose,
        params: &RefineParams,
    ) -> Option<Pose> {
        if history_a.is_empty() || history_b.is_empty() {
            return None;
        }
        let views: Vec<PoseView<'_>> = history_a.views(camera_a).chain(history_b.views(camera_b)).collect();
        refine_object_pose_multi_view(&views, world_t_tag, params)
            .map(|r| r.pose)
            .filter(Pose::is_valid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use crate::tag::object_corners;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0))
    }

    fn observe(camera: &PinholeCamera, world_t_camera: Pose, world_t_tag: &Pose, size: f64) -> TagObservation {
        let camera_t_tag = world_t_camera.inverse() * *world_t_tag;
        let object: Vec<Vector3<f64>> = object_corners(size).to_vec();
        let image: Vec<Vector2<f64>> = object
            .iter()
            .map(|p| camera.project_object(&camera_t_tag, p).unwrap())
            .collect();
        TagObservation {
            world_t_camera,
            object_points: object.clone(),
            image_points: image.clone(),
            tracking_object_points: object,
            tracking_image_points: image,
        }
    }

    fn tag_pose() -> Pose {
        Pose::from_euler(0.1, -0.2, 0.05, Vector3::new(-0.05, -0.04, 0.6))
    }

    #[test]
    fn test_add_and_append() {
        let cam = camera();
        let mut a = TagObservationHistory::new();
        a.add_observation(observe(&cam, Pose::identity(), &tag_pose(), 0.1));
        let mut b = TagObservationHistory::new();
        b.add_observation(observe(&cam, Pose::from_translation(Vector3::new(0.01, 0.0, 0.0)), &tag_pose(), 0.1));
        a.append(&mut b);
        assert_eq!(a.len(), 2);
        assert!(b.is_empty());

        let newest = a.latest().unwrap().clone();
        a.keep_newest(1);
        assert_eq!(a.len(), 1);
        assert_eq!(a.latest(), Some(&newest));

        let mut bad = observe(&cam, Pose::identity(), &tag_pose(), 0.1);
        bad.tracking_image_points.pop();
        a.add_observation(bad);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_remove_observations_drops_stale_prefix() {
        let cam = camera();
        let old_tag = tag_pose();
        let moved_tag = Pose::from_translation(Vector3::new(0.03, 0.0, 0.0)) * old_tag;

        let mut history = TagObservationHistory::new();
        for i in 0..3 {
            let shift = Pose::from_translation(Vector3::new(0.002 * f64::from(i), 0.0, 0.0));
            history.add_observation(observe(&cam, shift, &old_tag, 0.1));
        }
        for i in 0..2 {
            let shift = Pose::from_translation(Vector3::new(0.0, 0.002 * f64::from(i), 0.0));
            history.add_observation(observe(&cam, shift, &moved_tag, 0.1));
        }

        let removed = history.remove_observations(&cam, &moved_tag, 0.5, 0.1);
        assert_eq!(removed, 3);
        assert_eq!(history.len(), 2);
        assert_eq!(history.remove_observations(&cam, &moved_tag, 0.5, 0.1), 0);
    }

    #[test]
    fn test_optimize_pose_recovers_truth() {
        let cam = camera();
        let truth = tag_pose();
        let mut history = TagObservationHistory::new();
        for i in 0..4 {
            let device = Pose::from_euler(0.0, 0.02 * f64::from(i), 0.0, Vector3::new(0.01 * f64::from(i), 0.0, 0.0));
            history.add_observation(observe(&cam, device, &truth, 0.1));
        }
        let start = Pose::from_euler(0.02, 0.01, -0.01, Vector3::new(0.004, -0.003, 0.01)) * truth;
        let refined = history.optimize_pose(&cam, &start, &RefineParams::default()).unwrap();
        assert!(refined.translation_distance(&truth) < 1e-5);
        assert!(refined.angle_to(&truth) < 1e-5);
    }

    #[test]
    fn test_stereo_optimization_requires_both_histories() {
        let cam = camera();
        let history = TagObservationHistory::new();
        let other = TagObservationHistory::new();
        let params = RefineParams::default();
        assert!(
            TagObservationHistory::optimize_pose_stereo(&cam, &cam, &history, &other, &tag_pose(), &params).is_none()
        );
    }
}
