#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use divan::bench;
use nalgebra::{Vector2, Vector3};
use ocutag_core::Camera;
use ocutag_core::camera::{CameraIntrinsics, PinholeCamera};
use ocutag_core::codec;
use ocutag_core::pnp::{RansacParams, RefineParams, ransac_p3p, refine_pose};
use ocutag_core::pose::{Pose, pose_from_planar_points};
use ocutag_core::tag::{all_corners, object_corners_2d};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;

fn main() {
    divan::main();
}

struct Problem {
    camera: PinholeCamera,
    ground_truth: Pose,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
}

/// Corners of tag 421 seen at 0.8 m, with 0.3 px pixel noise.
fn problem() -> Problem {
    let camera = PinholeCamera::new(800, 600, CameraIntrinsics::new(800.0, 800.0, 400.0, 300.0));
    let ground_truth = Pose::from_euler(0.3, -0.2, 0.4, Vector3::new(-0.05, -0.04, 0.8));
    let object_points = all_corners(codec::encode(421).unwrap(), 0.1);
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let noise = Normal::new(0.0, 0.3).unwrap();
    let image_points = object_points
        .iter()
        .map(|p| {
            let q = camera.project_object(&ground_truth, p).unwrap();
            q + Vector2::new(noise.sample(&mut rng), noise.sample(&mut rng))
        })
        .collect();
    Problem {
        camera,
        ground_truth,
        object_points,
        image_points,
    }
}

#[bench]
fn bench_planar_pose(bencher: divan::Bencher) {
    let p = problem();
    let object = object_corners_2d(0.1);
    let image: Vec<Vector2<f64>> = p.image_points[..4].to_vec();

    bencher.bench_local(move || divan::black_box(pose_from_planar_points(&p.camera, &object, &image)));
}

#[bench]
fn bench_ransac_p3p(bencher: divan::Bencher) {
    let p = problem();
    let params = RansacParams::default();

    bencher.bench_local(move || {
        divan::black_box(ransac_p3p(&p.camera, &p.object_points, &p.image_points, &params).unwrap())
    });
}

#[bench]
fn bench_refine_pose(bencher: divan::Bencher) {
    let p = problem();
    let start = Pose::new(p.ground_truth.rotation, p.ground_truth.translation + Vector3::new(0.01, -0.01, 0.02));
    let params = RefineParams::default();

    bencher.bench_local(move || {
        divan::black_box(refine_pose(&p.camera, &start, &p.object_points, &p.image_points, &params))
    });
}
