//! Rigid 6DOF transforms and closed-form pose helpers.
//!
//! A [`Pose`] named `a_T_b` maps coordinates expressed in frame `b` into frame `a`.
//! Tag poses are kept as `camera_T_tag` while reading a single image and lifted to
//! `world_T_tag = world_T_device * device_T_camera * camera_T_tag` for tracking.

use crate::camera::Camera;
use nalgebra::{Matrix3, Rotation3, Vector2, Vector3};
use std::ops::Mul;

/// A 3D pose representing rotation and translation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pose {
    /// 3x3 Rotation matrix.
    pub rotation: Matrix3<f64>,
    /// 3x1 Translation vector.
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Create a new pose.
    #[must_use]
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The identity transform.
    #[must_use]
    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    /// Pure translation.
    #[must_use]
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self::new(Matrix3::identity(), translation)
    }

    /// Pose from a rotation vector (axis * angle) and a translation.
    #[must_use]
    pub fn from_scaled_axis(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(Rotation3::from_scaled_axis(axis_angle).into_inner(), translation)
    }

    /// Pose from roll/pitch/yaw (radians) and a translation.
    #[must_use]
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64, translation: Vector3<f64>) -> Self {
        Self::new(
            Rotation3::from_euler_angles(roll, pitch, yaw).into_inner(),
            translation,
        )
    }

    /// Apply the transform to a point.
    #[inline]
    #[must_use]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// The inverse transform (`b_T_a` for `a_T_b`).
    #[must_use]
    pub fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Self::new(rt, -(rt * self.translation))
    }

    /// Rotation vector (axis * angle) of the rotational part.
    #[must_use]
    pub fn scaled_axis(&self) -> Vector3<f64> {
        Rotation3::from_matrix(&self.rotation).scaled_axis()
    }

    /// True if all entries are finite and the rotation is orthonormal with det +1.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !self.rotation.iter().all(|v| v.is_finite()) || !self.translation.iter().all(|v| v.is_finite()) {
            return false;
        }
        let should_be_identity = self.rotation.transpose() * self.rotation;
        (should_be_identity - Matrix3::identity()).norm() < 1e-6
            && (self.rotation.determinant() - 1.0).abs() < 1e-6
    }

    /// Rotation angle (radians) between the rotational parts of two poses.
    #[must_use]
    pub fn angle_to(&self, other: &Pose) -> f64 {
        let relative = self.rotation.transpose() * other.rotation;
        let cos = ((relative.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
        cos.acos()
    }

    /// Euclidean distance between the translational parts.
    #[must_use]
    pub fn translation_distance(&self, other: &Pose) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Project an object point into a camera, `self` being `camera_T_object`.
    #[must_use]
    pub fn project<C: Camera + ?Sized>(&self, point: &Vector3<f64>, camera: &C) -> Option<Vector2<f64>> {
        camera.project_checked(&self.transform_point(point))
    }
}

impl Mul for Pose {
    type Output = Pose;

    fn mul(self, rhs: Pose) -> Pose {
        Pose::new(
            self.rotation * rhs.rotation,
            self.rotation * rhs.translation + self.translation,
        )
    }
}

impl Mul<&Pose> for &Pose {
    type Output = Pose;

    fn mul(self, rhs: &Pose) -> Pose {
        *self * *rhs
    }
}

/// Nearest rotation matrix (polar decomposition) with determinant +1.
#[must_use]
pub fn orthonormalize(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let vt = svd.v_t?;
    let mut rotation = u * vt;
    if rotation.determinant() < 0.0 {
        rotation = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)) * vt;
    }
    Some(rotation)
}

/// Planar pose from a homography between the object plane and normalized image coordinates.
///
/// `object_xy` are points on the object plane `z = 0`, `image_points` their pixels.
/// Returns `camera_T_object` or `None` for degenerate input. The result is a closed-form
/// estimate meant as an initial guess for iterative refinement.
#[must_use]
pub fn pose_from_planar_points<C: Camera + ?Sized>(
    camera: &C,
    object_xy: &[Vector2<f64>],
    image_points: &[Vector2<f64>],
) -> Option<Pose> {
    if object_xy.len() < 4 || object_xy.len() != image_points.len() {
        return None;
    }

    // Work in normalized coordinates so the decomposition does not need intrinsics.
    let normalized: Vec<Vector2<f64>> = image_points
        .iter()
        .map(|p| {
            let ray = camera.unproject_ray(p);
            Vector2::new(ray.x / ray.z, ray.y / ray.z)
        })
        .collect();

    let h = crate::homography::Homography::from_correspondences(object_xy, &normalized)?.h;

    // [r1 r2 t] = lambda * H
    let mut r1 = h.column(0).into_owned();
    let mut r2 = h.column(1).into_owned();
    let mut t = h.column(2).into_owned();

    let norm = (r1.norm() * r2.norm()).sqrt();
    if norm < f64::EPSILON {
        return None;
    }
    let mut scale = 1.0 / norm;

    // The object must lie in front of the camera.
    if t.z * scale < 0.0 {
        scale = -scale;
    }
    r1 *= scale;
    r2 *= scale;
    t *= scale;

    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let pose = Pose::new(rotation, t);
    pose.is_valid().then_some(pose)
}

/// Closest point between two rays given in a common frame.
///
/// Returns the midpoint of the shortest segment between the rays, or `None` if the rays
/// are (nearly) parallel or the point would lie behind either origin.
#[must_use]
pub fn triangulate_rays(
    origin_a: &Vector3<f64>,
    direction_a: &Vector3<f64>,
    origin_b: &Vector3<f64>,
    direction_b: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    let w0 = origin_a - origin_b;
    let a = direction_a.dot(direction_a);
    let b = direction_a.dot(direction_b);
    let c = direction_b.dot(direction_b);
    let d = direction_a.dot(&w0);
    let e = direction_b.dot(&w0);
    let denom = a * c - b * b;
    if denom.abs() < 1e-12 * a * c {
        return None;
    }
    let s = (b * e - c * d) / denom;
    let t = (a * e - b * d) / denom;
    if s <= 0.0 || t <= 0.0 {
        return None;
    }
    let pa = origin_a + direction_a * s;
    let pb = origin_b + direction_b * t;
    Some((pa + pb) * 0.5)
}

/// Triangulate an image point pair observed by two cameras with known world poses.
#[must_use]
pub fn triangulate_point<A: Camera + ?Sized, B: Camera + ?Sized>(
    camera_a: &A,
    world_t_camera_a: &Pose,
    point_a: &Vector2<f64>,
    camera_b: &B,
    world_t_camera_b: &Pose,
    point_b: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let ray_a = world_t_camera_a.rotation * camera_a.unproject_ray(point_a);
    let ray_b = world_t_camera_b.rotation * camera_b.unproject_ray(point_b);
    triangulate_rays(
        &world_t_camera_a.translation,
        &ray_a,
        &world_t_camera_b.translation,
        &ray_b,
    )
}

/// Squared reprojection errors of object points under `camera_T_object`.
///
/// Points behind the camera produce `f64::MAX`.
#[must_use]
pub fn squared_reprojection_errors<C: Camera + ?Sized>(
    camera: &C,
    camera_t_object: &Pose,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
) -> Vec<f64> {
    object_points
        .iter()
        .zip(image_points)
        .map(|(o, i)| {
            camera_t_object
                .project(o, camera)
                .map_or(f64::MAX, |p| (p - i).norm_squared())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use proptest::prelude::*;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(800, 600, CameraIntrinsics::new(800.0, 800.0, 400.0, 300.0))
    }

    #[test]
    fn test_pose_projection() {
        let camera = PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0));
        let pose = Pose::from_translation(Vector3::new(0.0, 0.0, 2.0));
        let p = pose.project(&Vector3::new(0.1, 0.1, 0.0), &camera).unwrap();
        assert!((p.x - 345.0).abs() < 1e-6);
        assert!((p.y - 265.0).abs() < 1e-6);
    }

    #[test]
    fn test_inverse_composition_is_identity() {
        let pose = Pose::from_euler(0.3, -0.2, 1.1, Vector3::new(1.0, -2.0, 0.5));
        let id = pose * pose.inverse();
        assert!((id.rotation - Matrix3::identity()).norm() < 1e-12);
        assert!(id.translation.norm() < 1e-12);
        assert!(pose.is_valid());
    }

    #[test]
    fn test_triangulation_recovers_point() {
        let cam = camera();
        let world_t_a = Pose::identity();
        let world_t_b = Pose::from_translation(Vector3::new(0.1, 0.0, 0.0));
        let point = Vector3::new(0.05, -0.02, 1.2);
        let pa = cam.project(&world_t_a.inverse().transform_point(&point));
        let pb = cam.project(&world_t_b.inverse().transform_point(&point));
        let estimate = triangulate_point(&cam, &world_t_a, &pa, &cam, &world_t_b, &pb).unwrap();
        assert!((estimate - point).norm() < 1e-9);
    }

    #[test]
    fn test_reprojection_errors() {
        let cam = camera();
        let pose = Pose::from_translation(Vector3::new(0.0, 0.0, 1.0));
        let object = [Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.0, -2.0)];
        let image = [Vector2::new(483.0, 304.0), Vector2::zeros()];
        let errors = squared_reprojection_errors(&cam, &pose, &object, &image);
        assert!((errors[0] - 25.0).abs() < 1e-9);
        assert_eq!(errors[1], f64::MAX);
    }

    #[test]
    fn test_parallel_rays_rejected() {
        let d = Vector3::new(0.0, 0.0, 1.0);
        assert!(triangulate_rays(&Vector3::zeros(), &d, &Vector3::new(1.0, 0.0, 0.0), &d).is_none());
    }

    proptest! {
        #[test]
        fn prop_planar_pose_recovery(
            tx in -0.3..0.3f64,
            ty in -0.3..0.3f64,
            tz in 0.5..3.0f64,
            roll in -0.5..0.5f64,
            pitch in -0.5..0.5f64,
            yaw in -3.0..3.0f64,
        ) {
            let cam = camera();
            let gt = Pose::from_euler(roll, pitch, yaw, Vector3::new(tx, ty, tz));
            let s = 0.16;
            let object = [
                Vector2::new(0.0, 0.0),
                Vector2::new(0.0, s),
                Vector2::new(s, s),
                Vector2::new(s, 0.0),
                Vector2::new(s * 0.25, s * 0.5),
            ];
            let image: Vec<Vector2<f64>> = object
                .iter()
                .map(|p| gt.project(&Vector3::new(p.x, p.y, 0.0), &cam).unwrap())
                .collect();
            let estimate = pose_from_planar_points(&cam, &object, &image).unwrap();
            prop_assert!(estimate.translation_distance(&gt) < 1e-6);
            prop_assert!(estimate.angle_to(&gt) < 1e-6);
        }
    }
}
