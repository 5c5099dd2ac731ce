//! Planar homographies between module grids and image pixels.

use nalgebra::{DMatrix, Matrix3, SMatrix, SVector, SymmetricEigen, Vector2, Vector3};

/// A 3x3 Homography matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    /// The 3x3 homography matrix.
    pub h: Matrix3<f64>,
}

impl Homography {
    /// Compute homography from 4 source points to 4 destination points using DLT.
    #[must_use]
    pub fn from_pairs(src: &[Vector2<f64>; 4], dst: &[Vector2<f64>; 4]) -> Option<Self> {
        let mut m = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for i in 0..4 {
            let (sx, sy) = (src[i].x, src[i].y);
            let (dx, dy) = (dst[i].x, dst[i].y);

            m[(i * 2, 0)] = -sx;
            m[(i * 2, 1)] = -sy;
            m[(i * 2, 2)] = -1.0;
            m[(i * 2, 6)] = sx * dx;
            m[(i * 2, 7)] = sy * dx;
            b[i * 2] = -dx;

            m[(i * 2 + 1, 3)] = -sx;
            m[(i * 2 + 1, 4)] = -sy;
            m[(i * 2 + 1, 5)] = -1.0;
            m[(i * 2 + 1, 6)] = sx * dy;
            m[(i * 2 + 1, 7)] = sy * dy;
            b[i * 2 + 1] = -dy;
        }

        // Fixing h33 = 1 turns the 8x9 system into a square one.
        let h_vec = m.lu().solve(&b)?;
        let h = Matrix3::new(
            h_vec[0], h_vec[1], h_vec[2], h_vec[3], h_vec[4], h_vec[5], h_vec[6], h_vec[7], 1.0,
        );
        let homography = Self { h };
        homography.is_valid().then_some(homography)
    }

    /// Least-squares homography from four or more correspondences (normalized DLT).
    #[must_use]
    pub fn from_correspondences(src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> Option<Self> {
        if src.len() < 4 || src.len() != dst.len() {
            return None;
        }

        let t_src = normalization(src)?;
        let t_dst = normalization(dst)?;

        let n = src.len();
        let mut a = DMatrix::<f64>::zeros(2 * n, 9);
        for i in 0..n {
            let s = t_src * Vector3::new(src[i].x, src[i].y, 1.0);
            let d = t_dst * Vector3::new(dst[i].x, dst[i].y, 1.0);
            let (sx, sy) = (s.x, s.y);
            let (dx, dy) = (d.x, d.y);

            a[(i * 2, 0)] = -sx;
            a[(i * 2, 1)] = -sy;
            a[(i * 2, 2)] = -1.0;
            a[(i * 2, 6)] = sx * dx;
            a[(i * 2, 7)] = sy * dx;
            a[(i * 2, 8)] = dx;

            a[(i * 2 + 1, 3)] = -sx;
            a[(i * 2 + 1, 4)] = -sy;
            a[(i * 2 + 1, 5)] = -1.0;
            a[(i * 2 + 1, 6)] = sx * dy;
            a[(i * 2 + 1, 7)] = sy * dy;
            a[(i * 2 + 1, 8)] = dy;
        }

        // Null vector of A from the normal equations; works for n == 4 where a thin SVD would not.
        let ata = a.transpose() * &a;
        let eigen = SymmetricEigen::new(ata);
        let (min_index, _) = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|x, y| x.1.total_cmp(y.1))?;
        let v = eigen.eigenvectors.column(min_index);
        let normalized = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

        let mut h = t_dst.try_inverse()? * normalized * t_src;
        let scale = h[(2, 2)];
        if scale.abs() > f64::EPSILON {
            h /= scale;
        }
        let homography = Self { h };
        homography.is_valid().then_some(homography)
    }

    /// Project a point using the homography.
    #[must_use]
    pub fn project(&self, p: &Vector2<f64>) -> Option<Vector2<f64>> {
        let res = self.h * Vector3::new(p.x, p.y, 1.0);
        if res.z.abs() < f64::EPSILON {
            return None;
        }
        Some(Vector2::new(res.x / res.z, res.y / res.z))
    }

    /// The inverse mapping.
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(|h| Self { h })
    }

    /// True if all entries are finite and the matrix is not singular.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.h.iter().all(|v| v.is_finite()) && self.h.determinant().abs() > 1e-12
    }

    /// Root-mean-square transfer error over correspondences.
    #[must_use]
    pub fn rms_error(&self, src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> f64 {
        if src.is_empty() {
            return 0.0;
        }
        let sum: f64 = src
            .iter()
            .zip(dst)
            .map(|(s, d)| self.project(s).map_or(f64::MAX, |p| (p - d).norm_squared()))
            .sum();
        (sum / src.len() as f64).sqrt()
    }
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2).
fn normalization(points: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist < f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_square_to_quad() {
        let src = [
            Vector2::new(-1.0, -1.0),
            Vector2::new(1.0, -1.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(-1.0, 1.0),
        ];
        let dst = [
            Vector2::new(100.0, 100.0),
            Vector2::new(200.0, 110.0),
            Vector2::new(190.0, 205.0),
            Vector2::new(95.0, 195.0),
        ];
        let h = Homography::from_pairs(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let p = h.project(s).unwrap();
            assert!((p - d).norm() < 1e-6);
        }
        let h_ls = Homography::from_correspondences(&src, &dst).unwrap();
        assert!((h_ls.h - h.h).norm() < 1e-6);
    }

    #[test]
    fn test_degenerate_points_rejected() {
        let p = Vector2::new(3.0, 3.0);
        assert!(Homography::from_correspondences(&[p; 4], &[p; 4]).is_none());
    }

    proptest! {
        #[test]
        fn prop_least_squares_matches_exact(
            offset_x in -50.0..50.0f64,
            offset_y in -50.0..50.0f64,
            skew in -0.2..0.2f64,
            persp in -0.001..0.001f64,
        ) {
            let gt = Homography {
                h: Matrix3::new(2.0, skew, 100.0 + offset_x, 0.1, 1.8, 80.0 + offset_y, persp, -persp, 1.0),
            };
            let src: Vec<Vector2<f64>> = (0..9)
                .map(|i| Vector2::new(f64::from(i % 3) * 20.0, f64::from(i / 3) * 20.0))
                .collect();
            let dst: Vec<Vector2<f64>> = src.iter().map(|p| gt.project(p).unwrap()).collect();
            let h = Homography::from_correspondences(&src, &dst).unwrap();
            prop_assert!(h.rms_error(&src, &dst) < 1e-6);
        }
    }
}
