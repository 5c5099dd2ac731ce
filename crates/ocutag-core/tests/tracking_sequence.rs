#![cfg(feature = "extended-tests")]
#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use nalgebra::Vector3;
use ocutag_core::camera::{CameraIntrinsics, PinholeCamera};
use ocutag_core::pose::Pose;
use ocutag_core::test_utils::TagScene;
use ocutag_core::tracker::{MotionType, TagTracker, TrackingState};
use ocutag_core::{DetectorConfig, ReflectanceType, TagSizeMap, TrackerConfig};

fn world_t_tag() -> Pose {
    Pose::from_euler(0.2, 0.1, -0.4, Vector3::new(-0.06, -0.04, 0.7))
}

#[test]
fn test_static_tag_under_moving_camera() {
    let cam = PinholeCamera::new(640, 480, CameraIntrinsics::new(520.0, 520.0, 320.0, 240.0));
    let config = TrackerConfig::default();
    let mut tracker = TagTracker::new(config, DetectorConfig::default(), TagSizeMap::new(0.12));

    for frame in 0..20u32 {
        let t = f64::from(frame);
        let world_t_device = Pose::from_euler(0.0, 0.004 * t, 0.0, Vector3::new(0.003 * t, -0.001 * t, 0.0));
        let camera_t_tag = world_t_device.inverse() * world_t_tag();
        let scene = TagScene::render(&cam, 901, ReflectanceType::Normal, 0.12, &camera_t_tag, 1.0, 2).unwrap();

        let tags = tracker.track_tags_mono(&cam, scene.image.view(), &world_t_device, &Pose::identity());
        assert_eq!(tags.len(), 1, "frame {frame}");
        let tracked = tags[0];
        assert_ne!(tracked.state, TrackingState::NotTracking, "frame {frame}");
        assert!(tracked.histories[0].len() <= config.max_observations);
        assert!(
            tracked.tag.world_t_tag.translation_distance(&world_t_tag()) < 1e-2,
            "frame {frame}: drifted"
        );
        if frame as usize + 1 >= config.static_after_observations {
            assert_eq!(tracked.motion, MotionType::Static, "frame {frame}");
        }
    }
}
