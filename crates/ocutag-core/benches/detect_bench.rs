#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use divan::bench;
use nalgebra::Vector3;
use ocutag_core::camera::{CameraIntrinsics, PinholeCamera};
use ocutag_core::pose::Pose;
use ocutag_core::qr::{ErrorCorrection, QrDetector2D, modules_per_side};
use ocutag_core::test_utils::{TagScene, add_gaussian_noise, qr_symbol_modules, render_module_grid, textured_image};
use ocutag_core::{Detector, FinderPatternConfig, ReflectanceType, TagSizeMap};

fn main() {
    divan::main();
}

fn camera() -> PinholeCamera {
    PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0))
}

#[bench]
fn bench_detect_single_tag(bencher: divan::Bencher) {
    let cam = camera();
    let pose = Pose::from_euler(0.2, -0.1, 0.5, Vector3::new(-0.05, -0.05, 0.6));
    let scene = TagScene::render(&cam, 321, ReflectanceType::Normal, 0.1, &pose, 2.0, 2).unwrap();
    let sizes = TagSizeMap::new(0.1);
    let mut detector = Detector::new();

    bencher.bench_local(move || {
        divan::black_box(detector.detect_tags_mono(
            &cam,
            &scene.image.view(),
            &Pose::identity(),
            &Pose::identity(),
            &sizes,
        ))
    });
}

#[bench]
fn bench_detect_textured_no_tags(bencher: divan::Bencher) {
    let cam = camera();
    let image = textured_image(640, 480, 4);
    let sizes = TagSizeMap::new(0.1);
    let mut detector = Detector::new();

    bencher.bench_local(move || {
        divan::black_box(detector.detect_tags_mono(
            &cam,
            &image.view(),
            &Pose::identity(),
            &Pose::identity(),
            &sizes,
        ))
    });
}

#[bench(args = [2, 7, 15])]
fn bench_qr_detection(bencher: divan::Bencher, version: u32) {
    let modules = qr_symbol_modules(version, ErrorCorrection::Medium, 3, 1);
    let mut image = render_module_grid(&modules, modules_per_side(version), 5, 4);
    add_gaussian_noise(&mut image, 3.0, 1);
    let detector = QrDetector2D::new();

    bencher.bench_local(move || divan::black_box(detector.detect(&image.view())));
}

#[bench(args = [false, true])]
fn bench_finder_patterns(bencher: divan::Bencher, parallel: bool) {
    let modules = qr_symbol_modules(10, ErrorCorrection::Low, 0, 2);
    let image = render_module_grid(&modules, modules_per_side(10), 6, 4);
    let min_height = if parallel { 0 } else { usize::MAX };
    let config = FinderPatternConfig::builder().parallel_min_height(min_height).build();

    bencher.bench_local(move || {
        divan::black_box(ocutag_core::finder::detect_finder_patterns(&image.view(), &config))
    });
}
