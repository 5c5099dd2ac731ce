#![cfg(feature = "serde")]
#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use nalgebra::Vector3;
use ocutag_core::pose::Pose;
use ocutag_core::{DetectorConfig, FinderPatternConfig, FrameChangeConfig, OculusTag, ReflectanceType, TagSizeMap, TrackerConfig};

#[test]
fn test_configs_survive_json() {
    let detector = DetectorConfig::builder().frame_border(12).ransac_seed(3).build();
    let json = serde_json::to_string(&detector).unwrap();
    assert_eq!(serde_json::from_str::<DetectorConfig>(&json).unwrap(), detector);

    let tracker = TrackerConfig::default();
    let json = serde_json::to_string(&tracker).unwrap();
    assert_eq!(serde_json::from_str::<TrackerConfig>(&json).unwrap(), tracker);

    let frame_change = FrameChangeConfig::builder().forced_keyframes(false).build();
    let json = serde_json::to_string(&frame_change).unwrap();
    assert_eq!(serde_json::from_str::<FrameChangeConfig>(&json).unwrap(), frame_change);

    let finder = FinderPatternConfig::builder().detect_inverted(false).build();
    let json = serde_json::to_string(&finder).unwrap();
    assert_eq!(serde_json::from_str::<FinderPatternConfig>(&json).unwrap(), finder);
}

#[test]
fn test_tag_and_size_map_survive_json() {
    let tag = OculusTag::new(
        99,
        ReflectanceType::Inverted,
        117,
        Pose::from_euler(0.1, 0.2, 0.3, Vector3::new(1.0, -2.0, 0.5)),
        0.08,
    );
    let json = serde_json::to_string(&tag).unwrap();
    assert_eq!(serde_json::from_str::<OculusTag>(&json).unwrap(), tag);

    let mut sizes = TagSizeMap::new(0.1);
    sizes.insert(5, 0.25).unwrap();
    let json = serde_json::to_value(&sizes).unwrap();
    assert_eq!(json["default_size"], 0.1);
    let back: TagSizeMap = serde_json::from_value(json).unwrap();
    assert!((back.size_of(5) - 0.25).abs() < f64::EPSILON);
}
