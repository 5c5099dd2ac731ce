//! Perspective-n-point solvers: minimal P3P, RANSAC over P3P hypotheses and
//! Levenberg-Marquardt refinement of an object pose over one or many views.
//!
//! All errors reported here are average *squared* pixel distances.

use crate::camera::Camera;
use crate::error::{OcutagError, Result};
use crate::pose::Pose;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Vector2, Vector3, Vector6};
use rand::SeedableRng;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

// ============================================================================
// PARAMETERS
// ============================================================================

/// Parameters of the RANSAC P3P solver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RansacParams {
    /// Number of hypotheses (default: 10).
    pub iterations: usize,
    /// Maximal projection error in pixels for an inlier (default: 2.5).
    pub inlier_threshold: f64,
    /// Minimal number of inliers for a valid pose (default: 4).
    pub min_inliers: usize,
    /// Refine the best hypothesis on its inliers (default: true).
    pub refine: bool,
    /// Seed for hypothesis sampling (default: 0).
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            iterations: 10,
            inlier_threshold: 2.5,
            min_inliers: 4,
            refine: true,
            seed: 0,
        }
    }
}

/// Parameters of the Levenberg-Marquardt pose refinement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefineParams {
    /// Maximal number of iterations (default: 50).
    pub max_iterations: usize,
    /// Initial damping (default: 0.001).
    pub initial_lambda: f64,
    /// Damping adjustment factor (default: 5.0).
    pub lambda_factor: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            initial_lambda: 1e-3,
            lambda_factor: 5.0,
        }
    }
}

/// Result of [`ransac_p3p`].
#[derive(Clone, Debug)]
pub struct PnpResult {
    /// Pose mapping object points into the camera frame.
    pub camera_t_object: Pose,
    /// Indices of the inlier correspondences.
    pub inliers: Vec<usize>,
    /// Average squared projection error of the inliers.
    pub average_squared_error: f64,
}

/// Result of a pose refinement.
#[derive(Clone, Copy, Debug)]
pub struct Refinement {
    /// The refined pose.
    pub pose: Pose,
    /// Average squared error before refinement.
    pub initial_error: f64,
    /// Average squared error after refinement.
    pub final_error: f64,
}

/// Observations of an object in one camera with a known world pose.
#[derive(Clone, Copy)]
pub struct PoseView<'a> {
    /// Camera model of the view.
    pub camera: &'a dyn Camera,
    /// Transform from world into this camera.
    pub camera_t_world: Pose,
    /// Object points (object frame).
    pub object_points: &'a [Vector3<f64>],
    /// Matching image points.
    pub image_points: &'a [Vector2<f64>],
}

// ============================================================================
// P3P
// ============================================================================

/// Minimal absolute pose from three object points and their unit viewing rays.
///
/// Returns up to four `camera_T_object` candidates.
#[must_use]
pub fn p3p(object_points: &[Vector3<f64>; 3], rays: &[Vector3<f64>; 3]) -> Vec<Pose> {
    let [p1, p2, p3] = object_points;
    let j1 = rays[0].normalize();
    let j2 = rays[1].normalize();
    let j3 = rays[2].normalize();

    let a2 = (p2 - p3).norm_squared();
    let b2 = (p1 - p3).norm_squared();
    let c2 = (p1 - p2).norm_squared();
    if a2 < 1e-12 || b2 < 1e-12 || c2 < 1e-12 {
        return Vec::new();
    }

    let p = j2.dot(&j3);
    let q = j1.dot(&j3);
    let r = j1.dot(&j2);

    let k1 = a2 / b2;
    let k2 = c2 / b2;
    let kd = k1 - k2;

    // Depths s2 = u * s1, s3 = v * s1 with u = n(v) / d(v).
    let n = [1.0 + kd, -2.0 * kd * q, kd - 1.0];
    let d = [2.0 * r, -2.0 * p];
    let w = [1.0, -2.0 * q, 1.0];

    let dd = poly_mul(&d, &d);
    let quartic = poly_add(
        &poly_add(&dd, &poly_mul(&n, &n)),
        &poly_add(
            &poly_scale(&poly_mul(&n, &d), -2.0 * r),
            &poly_scale(&poly_mul(&w, &dd), -k2),
        ),
    );

    let mut solutions = Vec::with_capacity(4);
    for v in real_roots(&quartic) {
        let dv = poly_eval(&d, v);
        if dv.abs() < 1e-12 {
            continue;
        }
        let u = poly_eval(&n, v) / dv;
        let denom = poly_eval(&w, v);
        if denom <= 0.0 {
            continue;
        }
        let s1 = (b2 / denom).sqrt();
        let s2 = u * s1;
        let s3 = v * s1;
        if s1 <= 0.0 || s2 <= 0.0 || s3 <= 0.0 {
            continue;
        }
        let camera_points = [j1 * s1, j2 * s2, j3 * s3];
        if let Some(pose) = absolute_orientation(object_points, &camera_points) {
            solutions.push(pose);
        }
    }
    solutions
}

/// Rigid transform mapping `from` onto `to` in the least-squares sense (Kabsch).
#[must_use]
pub fn absolute_orientation(from: &[Vector3<f64>], to: &[Vector3<f64>]) -> Option<Pose> {
    if from.len() < 3 || from.len() != to.len() {
        return None;
    }
    let n = from.len() as f64;
    let cf = from.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let ct = to.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix3::zeros();
    for (f, t) in from.iter().zip(to) {
        h += (f - cf) * (t - ct).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        rotation = v * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)) * u.transpose();
    }
    let pose = Pose::new(rotation, ct - rotation * cf);
    pose.is_valid().then_some(pose)
}

// ============================================================================
// POLYNOMIALS (coefficients in ascending order)
// ============================================================================

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

fn poly_add(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len().max(b.len())];
    for (i, x) in a.iter().enumerate() {
        out[i] += x;
    }
    for (i, y) in b.iter().enumerate() {
        out[i] += y;
    }
    out
}

fn poly_scale(a: &[f64], s: f64) -> Vec<f64> {
    a.iter().map(|x| x * s).collect()
}

fn poly_eval(a: &[f64], x: f64) -> f64 {
    a.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn poly_derivative(a: &[f64]) -> Vec<f64> {
    a.iter()
        .enumerate()
        .skip(1)
        .map(|(i, c)| c * i as f64)
        .collect()
}

/// Real roots of a polynomial, isolated between the critical points and bisected.
pub(crate) fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    let scale = coefficients.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let mut degree = coefficients.len() - 1;
    while degree > 0 && coefficients[degree].abs() <= scale * 1e-14 {
        degree -= 1;
    }
    let poly = &coefficients[..=degree];

    match degree {
        0 => Vec::new(),
        1 => vec![-poly[0] / poly[1]],
        _ => {
            let lead = poly[degree];
            let bound = 1.0 + poly[..degree].iter().fold(0.0f64, |m, c| m.max((c / lead).abs()));

            let mut breaks = vec![-bound];
            let mut critical = real_roots(&poly_derivative(poly));
            critical.retain(|c| c.abs() < bound);
            critical.sort_by(f64::total_cmp);
            breaks.extend(critical);
            breaks.push(bound);

            let tolerance = scale * 1e-10;
            let mut roots: Vec<f64> = Vec::new();
            let push = |root: f64, roots: &mut Vec<f64>| {
                if roots.last().is_none_or(|last| (root - last).abs() > 1e-9) {
                    roots.push(root);
                }
            };

            for window in breaks.windows(2) {
                let (mut lo, mut hi) = (window[0], window[1]);
                let mut f_lo = poly_eval(poly, lo);
                let f_hi = poly_eval(poly, hi);

                if f_lo.abs() <= tolerance {
                    // Touching root at a critical point.
                    push(lo, &mut roots);
                    continue;
                }
                if f_lo.signum() == f_hi.signum() {
                    continue;
                }
                for _ in 0..200 {
                    let mid = 0.5 * (lo + hi);
                    let f_mid = poly_eval(poly, mid);
                    if f_mid.signum() == f_lo.signum() {
                        lo = mid;
                        f_lo = f_mid;
                    } else {
                        hi = mid;
                    }
                    if hi - lo <= 1e-15 * (1.0 + lo.abs()) {
                        break;
                    }
                }
                push(0.5 * (lo + hi), &mut roots);
            }
            if poly_eval(poly, bound).abs() <= tolerance {
                push(bound, &mut roots);
            }
            roots
        }
    }
}

// ============================================================================
// RANSAC
// ============================================================================

/// Robust `camera_T_object` from 2D/3D correspondences.
///
/// Hypotheses come from P3P on point triples: all triples when there are no more than
/// `params.iterations` of them, otherwise random triples drawn from a generator seeded
/// with `params.seed`. The hypothesis with the most inliers wins (ties broken by error),
/// and is optionally refined on its inliers.
///
/// # Errors
/// Returns an error if the inputs differ in length or hold fewer than three points.
pub fn ransac_p3p(
    camera: &dyn Camera,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    params: &RansacParams,
) -> Result<Option<PnpResult>> {
    if object_points.len() != image_points.len() {
        return Err(OcutagError::MismatchedLengths(
            object_points.len(),
            image_points.len(),
        ));
    }
    let n = object_points.len();
    if n < 3 {
        return Err(OcutagError::NotEnoughCorrespondences {
            required: 3,
            actual: n,
        });
    }
    if n < params.min_inliers {
        return Ok(None);
    }

    let rays: Vec<Vector3<f64>> = image_points.iter().map(|p| camera.unproject_ray(p)).collect();
    let threshold_sq = params.inlier_threshold * params.inlier_threshold;

    let mut best: Option<(Pose, Vec<usize>, f64)> = None;
    let mut evaluate = |triple: [usize; 3]| {
        let object = [
            object_points[triple[0]],
            object_points[triple[1]],
            object_points[triple[2]],
        ];
        let ray = [rays[triple[0]], rays[triple[1]], rays[triple[2]]];
        for pose in p3p(&object, &ray) {
            let (inliers, error) = collect_inliers(camera, &pose, object_points, image_points, threshold_sq);
            let better = best.as_ref().is_none_or(|(_, best_inliers, best_error)| {
                inliers.len() > best_inliers.len()
                    || (inliers.len() == best_inliers.len() && error < *best_error)
            });
            if better {
                best = Some((pose, inliers, error));
            }
        }
    };

    let total_triples = n * (n - 1) * (n - 2) / 6;
    if total_triples <= params.iterations {
        for a in 0..n {
            for b in a + 1..n {
                for c in b + 1..n {
                    evaluate([a, b, c]);
                }
            }
        }
    } else {
        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        for _ in 0..params.iterations {
            let picked = sample(&mut rng, n, 3);
            evaluate([picked.index(0), picked.index(1), picked.index(2)]);
        }
    }

    let Some((mut pose, mut inliers, mut error)) = best else {
        return Ok(None);
    };
    if inliers.len() < params.min_inliers {
        return Ok(None);
    }

    if params.refine {
        let obj: Vec<Vector3<f64>> = inliers.iter().map(|&i| object_points[i]).collect();
        let img: Vec<Vector2<f64>> = inliers.iter().map(|&i| image_points[i]).collect();
        if let Some(refined) = refine_pose(camera, &pose, &obj, &img, &RefineParams::default()) {
            let (refined_inliers, refined_error) =
                collect_inliers(camera, &refined.pose, object_points, image_points, threshold_sq);
            if refined_inliers.len() >= inliers.len() {
                pose = refined.pose;
                inliers = refined_inliers;
                error = refined_error;
            }
        }
    }

    Ok(Some(PnpResult {
        camera_t_object: pose,
        inliers,
        average_squared_error: error,
    }))
}

fn collect_inliers(
    camera: &dyn Camera,
    pose: &Pose,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    threshold_sq: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut sum = 0.0;
    for (i, (o, p)) in object_points.iter().zip(image_points).enumerate() {
        if let Some(projected) = pose.project(o, camera) {
            let e = (projected - p).norm_squared();
            if e <= threshold_sq {
                inliers.push(i);
                sum += e;
            }
        }
    }
    let error = if inliers.is_empty() {
        f64::MAX
    } else {
        sum / inliers.len() as f64
    };
    (inliers, error)
}

// ============================================================================
// LEVENBERG-MARQUARDT
// ============================================================================

/// Refine `camera_T_object` by minimizing the squared projection error.
///
/// Returns `None` if the initial pose puts a point behind the camera or the input is empty.
#[must_use]
pub fn refine_pose(
    camera: &dyn Camera,
    camera_t_object: &Pose,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    params: &RefineParams,
) -> Option<Refinement> {
    let view = PoseView {
        camera,
        camera_t_world: Pose::identity(),
        object_points,
        image_points,
    };
    refine_object_pose_multi_view(&[view], camera_t_object, params)
}

/// Refine `world_T_object` jointly over several views with known camera poses.
///
/// Serves both the multi-frame (history) and stereo cases.
#[must_use]
pub fn refine_object_pose_multi_view(
    views: &[PoseView<'_>],
    world_t_object: &Pose,
    params: &RefineParams,
) -> Option<Refinement> {
    let count: usize = views.iter().map(|v| v.object_points.len().min(v.image_points.len())).sum();
    if count == 0 {
        return None;
    }

    let mut pose = *world_t_object;
    let mut residual = residuals(views, &pose)?;
    let mut error = residual.norm_squared();
    let initial_error = error;
    let mut lambda = params.initial_lambda;
    let mut jacobian = numeric_jacobian(views, &pose)?;

    for _ in 0..params.max_iterations {
        let jt = jacobian.transpose();
        let jtj: Matrix6<f64> = (&jt * &jacobian).fixed_view::<6, 6>(0, 0).into_owned();
        let jtr: Vector6<f64> = (&jt * &residual).fixed_rows::<6>(0).into_owned();

        let mut damped = jtj;
        for i in 0..6 {
            damped[(i, i)] += lambda * jtj[(i, i)].max(1e-9);
        }
        let Some(delta) = damped.cholesky().map(|c| c.solve(&(-jtr))) else {
            lambda *= params.lambda_factor;
            continue;
        };

        let candidate = apply_update(&pose, &delta);
        match residuals(views, &candidate) {
            Some(candidate_residual) if candidate_residual.norm_squared() < error => {
                let candidate_error = candidate_residual.norm_squared();
                let improvement = (error - candidate_error) / error.max(f64::MIN_POSITIVE);
                pose = candidate;
                residual = candidate_residual;
                error = candidate_error;
                lambda /= params.lambda_factor;
                if improvement < 1e-12 || delta.norm() < 1e-14 || error < 1e-20 {
                    break;
                }
                jacobian = numeric_jacobian(views, &pose)?;
            }
            _ => {
                lambda *= params.lambda_factor;
                if lambda > 1e12 {
                    break;
                }
            }
        }
    }

    let n = count as f64;
    Some(Refinement {
        pose,
        initial_error: initial_error / n,
        final_error: error / n,
    })
}

/// Left rotation increment and additive translation increment.
fn apply_update(pose: &Pose, delta: &Vector6<f64>) -> Pose {
    let increment = Pose::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]), Vector3::zeros());
    Pose::new(
        increment.rotation * pose.rotation,
        pose.translation + Vector3::new(delta[3], delta[4], delta[5]),
    )
}

fn residuals(views: &[PoseView<'_>], world_t_object: &Pose) -> Option<DVector<f64>> {
    let mut out = Vec::new();
    for view in views {
        let camera_t_object = view.camera_t_world * *world_t_object;
        for (o, i) in view.object_points.iter().zip(view.image_points) {
            let p = view.camera.project_object(&camera_t_object, o)?;
            out.push(p.x - i.x);
            out.push(p.y - i.y);
        }
    }
    Some(DVector::from_vec(out))
}

fn numeric_jacobian(views: &[PoseView<'_>], pose: &Pose) -> Option<DMatrix<f64>> {
    const EPS: f64 = 1e-6;
    let rows = residuals(views, pose)?.len();
    let mut jacobian = DMatrix::zeros(rows, 6);
    for k in 0..6 {
        let mut step = Vector6::zeros();
        step[k] = EPS;
        let plus = residuals(views, &apply_update(pose, &step))?;
        let minus = residuals(views, &apply_update(pose, &(-step)))?;
        jacobian.set_column(k, &((plus - minus) / (2.0 * EPS)));
    }
    Some(jacobian)
}
