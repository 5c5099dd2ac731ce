#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use nalgebra::{UnitQuaternion, Vector3};
use ocutag_core::FrameChangeConfig;
use ocutag_core::frame_change::{FrameChangeDetector, FrameChangeResult};
use ocutag_core::image::OwnedImage;
use ocutag_core::test_utils::textured_image;
use proptest::prelude::*;

/// One step of a synthetic stream: time step, scene index, and whether the device shakes.
type Step = (f64, usize, bool);

fn run(config: FrameChangeConfig, scenes: &[OwnedImage], steps: &[Step]) -> Vec<f64> {
    let mut detector = FrameChangeDetector::new(config).unwrap();
    let mut timestamp = 0.0;
    let mut keyframes = Vec::new();
    for &(dt, scene, shaking) in steps {
        timestamp += dt;
        if shaking {
            detector.add_gyro_sample(&Vector3::new(0.0, 2.0, 0.0), timestamp - 0.5 * dt);
        }
        let result = detector.detect_frame_change(&scenes[scene].view(), timestamp, &UnitQuaternion::identity());
        assert_ne!(result, FrameChangeResult::InvalidInput);
        if result == FrameChangeResult::ChangeDetected {
            keyframes.push(timestamp);
        }
    }
    keyframes
}

fn scenes() -> Vec<OwnedImage> {
    (0..3).map(|seed| textured_image(320, 240, seed)).collect()
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((0.02..0.2f64, 0usize..3, prop::bool::weighted(0.3)), 1..150)
}

#[test]
fn test_static_scene_keyframes_at_preferred_interval() {
    let scenes = scenes();
    let stream: Vec<Step> = (0..300).map(|_| (0.05, 0, false)).collect();
    let keyframes = run(FrameChangeConfig::default(), &scenes, &stream);
    // 15 s of video: the first frame plus one every two seconds.
    assert_eq!(keyframes.len(), 8);
    for pair in keyframes.windows(2) {
        assert!((pair[1] - pair[0] - 2.0).abs() < 0.051);
    }
}

#[test]
fn test_constant_shaking_waits_for_absolute_cap() {
    let scenes = scenes();
    let stream: Vec<Step> = (0..300).map(|i| (0.05, i / 20 % 3, true)).collect();
    let keyframes = run(FrameChangeConfig::default(), &scenes, &stream);
    for pair in keyframes.windows(2) {
        assert!((pair[1] - pair[0] - 5.0).abs() < 0.051, "gap {}", pair[1] - pair[0]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_keyframe_spacing(stream in steps()) {
        let scenes = scenes();
        let config = FrameChangeConfig::default();
        let keyframes = run(config, &scenes, &stream);
        let max_dt = stream.iter().map(|s| s.0).fold(0.0, f64::max);

        prop_assert!(!keyframes.is_empty());
        prop_assert!((keyframes[0] - stream[0].0).abs() < 1e-12);
        for pair in keyframes.windows(2) {
            let gap = pair[1] - pair[0];
            prop_assert!(gap >= config.minimum_time_between_keyframes - 1e-9);
            prop_assert!(gap <= config.absolute_maximum_time_between_keyframes + max_dt + 1e-9);
        }
    }

    #[test]
    fn prop_without_forcing_static_scenes_never_change(dts in prop::collection::vec(0.02..0.5f64, 1..80)) {
        let scenes = scenes();
        let config = FrameChangeConfig::builder().forced_keyframes(false).build();
        let stream: Vec<Step> = dts.into_iter().map(|dt| (dt, 1, false)).collect();
        let keyframes = run(config, &scenes, &stream);
        prop_assert_eq!(keyframes.len(), 1);
    }
}
