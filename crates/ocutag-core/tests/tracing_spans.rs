#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use nalgebra::Vector3;
use ocutag_core::camera::{CameraIntrinsics, PinholeCamera};
use ocutag_core::pose::Pose;
use ocutag_core::test_utils::TagScene;
use ocutag_core::{Detector, ReflectanceType, TagSizeMap};
use std::sync::{Arc, Mutex};
use tracing::Subscriber;
use tracing::span::{Attributes, Id};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Records the name of every span opened while installed.
#[derive(Clone, Default)]
struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

impl<S: Subscriber> Layer<S> for SpanNames {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.0.lock().unwrap().push(attrs.metadata().name());
    }
}

#[test]
fn test_each_stage_opens_one_span() {
    let cam = PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0));
    let pose = Pose::from_euler(0.1, 0.2, 0.3, Vector3::new(-0.06, -0.06, 0.5));
    let scene = TagScene::render(&cam, 19, ReflectanceType::Normal, 0.12, &pose, 0.0, 2).unwrap();

    let names = SpanNames::default();
    let subscriber = tracing_subscriber::registry().with(names.clone());
    let tags = tracing::subscriber::with_default(subscriber, || {
        Detector::new().detect_tags_mono(
            &cam,
            &scene.image.view(),
            &Pose::identity(),
            &Pose::identity(),
            &TagSizeMap::new(0.12),
        )
    });
    assert_eq!(tags.len(), 1);

    let names = names.0.lock().unwrap();
    assert_eq!(names.iter().filter(|n| **n == "quad_detection").count(), 1, "{names:?}");
    assert_eq!(names.iter().filter(|n| **n == "read_tags").count(), 1, "{names:?}");
}
