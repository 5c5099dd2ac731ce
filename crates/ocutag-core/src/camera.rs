//! Camera capability consumed by the detection and tracking core.
//!
//! The camera frame is x right, y down, z forward (looking along +z).

use crate::pose::Pose;
use nalgebra::{Matrix3, Vector2, Vector3};

/// Geometric camera model: projection, back-projection and bounds.
pub trait Camera: Send + Sync {
    /// Image width in pixels.
    fn width(&self) -> usize;

    /// Image height in pixels.
    fn height(&self) -> usize;

    /// Project a point given in camera coordinates into the image.
    ///
    /// Points at or behind the camera centre yield non-finite coordinates; use
    /// [`Camera::project_checked`] when that matters.
    fn project(&self, point: &Vector3<f64>) -> Vector2<f64>;

    /// Unit ray (camera coordinates) through an image point.
    fn unproject_ray(&self, image_point: &Vector2<f64>) -> Vector3<f64>;

    /// Projection that rejects points behind the camera.
    fn project_checked(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z <= f64::EPSILON {
            return None;
        }
        let p = self.project(point);
        (p.x.is_finite() && p.y.is_finite()).then_some(p)
    }

    /// Project an object point through `camera_T_object`.
    fn project_object(&self, camera_t_object: &Pose, object_point: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.project_checked(&camera_t_object.transform_point(object_point))
    }

    /// True if the point lies inside the image with at least `margin` pixels to every border.
    fn is_inside(&self, point: &Vector2<f64>, margin: f64) -> bool {
        point.x >= margin
            && point.y >= margin
            && point.x < self.width() as f64 - margin
            && point.y < self.height() as f64 - margin
    }
}

/// Camera intrinsics parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CameraIntrinsics {
    /// Focal length in x (pixels).
    pub fx: f64,
    /// Focal length in y (pixels).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Create new intrinsics.
    #[must_use]
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Convert to a 3x3 matrix.
    #[must_use]
    pub fn as_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Get inverse matrix.
    #[must_use]
    pub fn inv_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// Ideal pinhole camera without lens distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PinholeCamera {
    /// Image width in pixels.
    pub width: usize,
    /// Image height in pixels.
    pub height: usize,
    /// Intrinsic parameters.
    pub intrinsics: CameraIntrinsics,
}

impl PinholeCamera {
    /// Create a camera from its resolution and intrinsics.
    #[must_use]
    pub fn new(width: usize, height: usize, intrinsics: CameraIntrinsics) -> Self {
        Self {
            width,
            height,
            intrinsics,
        }
    }

    /// Camera with principal point at the image centre and the given horizontal field of view.
    #[must_use]
    pub fn with_fov(width: usize, height: usize, fov_x: f64) -> Self {
        let f = (width as f64 * 0.5) / (fov_x * 0.5).tan();
        Self::new(
            width,
            height,
            CameraIntrinsics::new(f, f, (width as f64 - 1.0) * 0.5, (height as f64 - 1.0) * 0.5),
        )
    }
}

impl Camera for PinholeCamera {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    #[inline]
    fn project(&self, point: &Vector3<f64>) -> Vector2<f64> {
        let k = &self.intrinsics;
        Vector2::new(
            (point.x / point.z) * k.fx + k.cx,
            (point.y / point.z) * k.fy + k.cy,
        )
    }

    #[inline]
    fn unproject_ray(&self, image_point: &Vector2<f64>) -> Vector3<f64> {
        let k = &self.intrinsics;
        Vector3::new(
            (image_point.x - k.cx) / k.fx,
            (image_point.y - k.cy) / k.fy,
            1.0,
        )
        .normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_projection() {
        let camera = PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0));
        let p = camera.project(&Vector3::new(0.1, 0.1, 2.0));
        // x = (0.1 / 2.0) * 500 + 320 = 345
        assert!((p.x - 345.0).abs() < 1e-9);
        assert!((p.y - 265.0).abs() < 1e-9);
        assert!(camera.project_checked(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_is_inside_margin() {
        let camera = PinholeCamera::with_fov(100, 80, 1.2);
        assert!(camera.is_inside(&Vector2::new(10.0, 10.0), 10.0));
        assert!(!camera.is_inside(&Vector2::new(9.9, 40.0), 10.0));
        assert!(!camera.is_inside(&Vector2::new(50.0, 70.5), 10.0));
    }

    proptest! {
        #[test]
        fn prop_intrinsics_inversion(
            fx in 100.0..2000.0f64,
            fy in 100.0..2000.0f64,
            cx in 0.0..1000.0f64,
            cy in 0.0..1000.0f64
        ) {
            let intrinsics = CameraIntrinsics::new(fx, fy, cx, cy);
            let identity = intrinsics.as_matrix() * intrinsics.inv_matrix();
            let expected = Matrix3::<f64>::identity();
            for i in 0..3 {
                for j in 0..3 {
                    prop_assert!((identity[(i, j)] - expected[(i, j)]).abs() < 1e-9);
                }
            }
        }

        #[test]
        fn prop_unproject_then_project(x in 0.0..640.0f64, y in 0.0..480.0f64, depth in 0.1..10.0f64) {
            let camera = PinholeCamera::with_fov(640, 480, 1.3);
            let ray = camera.unproject_ray(&Vector2::new(x, y));
            prop_assert!((ray.norm() - 1.0).abs() < 1e-12);
            let p = camera.project(&(ray * depth));
            prop_assert!((p.x - x).abs() < 1e-6 && (p.y - y).abs() < 1e-6);
        }
    }
}
