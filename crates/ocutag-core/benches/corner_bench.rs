#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use divan::bench;
use nalgebra::Vector2;
use ocutag_core::corner::{GradientKernel, refine_corner_with};
use ocutag_core::test_utils::{add_gaussian_noise, render_junction};

fn main() {
    divan::main();
}

#[bench(args = [2, 3, 5])]
fn bench_refine_corner(bencher: divan::Bencher, neighbors: usize) {
    let mut image = render_junction(64, 64, Vector2::new(31.3, 32.6), 30, 220);
    add_gaussian_noise(&mut image, 2.0, 5);
    let start = Vector2::new(30.0, 34.0);

    bencher.bench_local(move || {
        divan::black_box(refine_corner_with(
            &image.view(),
            divan::black_box(start),
            neighbors,
            GradientKernel::Forward,
        ))
    });
}

#[bench]
fn bench_refine_corner_central(bencher: divan::Bencher) {
    let image = render_junction(64, 64, Vector2::new(31.3, 32.6), 30, 220);
    let start = Vector2::new(30.0, 34.0);

    bencher.bench_local(move || {
        divan::black_box(refine_corner_with(&image.view(), divan::black_box(start), 3, GradientKernel::Central))
    });
}
