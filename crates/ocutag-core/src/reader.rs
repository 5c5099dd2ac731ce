//! Reading a tag from an image quad.
//!
//! A candidate quad is turned into a tag in four steps: a rough pose from the four
//! corners, the reflectance type and module threshold from the border and inner
//! ring, the orientation from the four orientation modules, and finally the 16 data
//! modules which are decoded into the id.

use crate::camera::Camera;
use crate::codec;
use crate::config::DetectorConfig;
use crate::corner::refine_corner;
use crate::history::{TagObservation, TagObservationHistory};
use crate::image::ImageView;
use crate::matching::verify_stereo_location;
use crate::pnp::{PoseView, RansacParams, RefineParams, ransac_p3p, refine_object_pose_multi_view, refine_pose};
use crate::pose::Pose;
use crate::quad::{Quad, corner_search_window};
use crate::tag::{
    OculusTag, ReflectanceType, TagSizeMap, all_corners, background_points,
    data_module_centers, foreground_points, object_corners, orientation_points,
};
use nalgebra::{Matrix3, Vector2, Vector3};

/// Reflectance of a tag candidate and the threshold separating its modules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reflectance {
    /// Normal or inverted.
    pub reflectance: ReflectanceType,
    /// Pixels below are dark.
    pub threshold: u8,
    /// Binary module value of dark pixels.
    pub dark_value: u8,
}

/// A tag read from one quad.
#[derive(Clone, Debug, PartialEq)]
pub struct TagReading {
    /// The decoded tag.
    pub tag: OculusTag,
    /// Image corners, starting at the tag's top-left corner.
    pub quad: Quad,
    /// Pose of the tag in the camera, scaled to the tag's size.
    pub camera_t_tag: Pose,
    /// The data bits as read.
    pub data_matrix: u16,
}

fn sample(camera: &dyn Camera, image: &ImageView, camera_t_tag: &Pose, point: &Vector3<f64>) -> Option<u8> {
    let p = camera.project_object(camera_t_tag, point)?;
    image.interpolate(p.x, p.y).map(|v| v.round() as u8)
}

fn sample_all(
    camera: &dyn Camera,
    image: &ImageView,
    camera_t_tag: &Pose,
    points: &[Vector3<f64>],
) -> Option<Vec<u8>> {
    points.iter().map(|p| sample(camera, image, camera_t_tag, p)).collect()
}

/// Classify a candidate as normal or inverted and compute its module threshold.
///
/// The threshold is the midpoint of the rounded foreground and background means.
/// Candidates with too little contrast, or where less than the configured quorum of
/// either sample group falls on the expected side of the threshold, are rejected.
#[must_use]
pub fn determine_reflectance_type_and_threshold(
    camera: &dyn Camera,
    image: &ImageView,
    camera_t_tag: &Pose,
    tag_size: f64,
    config: &DetectorConfig,
) -> Option<Reflectance> {
    let foreground = sample_all(camera, image, camera_t_tag, &foreground_points(tag_size))?;
    let background = sample_all(camera, image, camera_t_tag, &background_points(tag_size))?;

    let mean = |values: &[u8]| -> u32 {
        let sum: u32 = values.iter().map(|&v| u32::from(v)).sum();
        (f64::from(sum) / values.len() as f64).round() as u32
    };
    let fg = mean(&foreground);
    let bg = mean(&background);
    if fg.abs_diff(bg) < u32::from(config.min_intensity_contrast) {
        tracing::trace!(fg, bg, "candidate rejected: low contrast");
        return None;
    }

    let threshold = ((fg + bg + 1) / 2) as u8;
    let (reflectance, dark_value) = if fg < bg {
        (ReflectanceType::Normal, 1)
    } else {
        (ReflectanceType::Inverted, 0)
    };

    let is_dark = |v: &u8| *v < threshold;
    let (fg_correct, bg_correct) = match reflectance {
        ReflectanceType::Normal => (
            foreground.iter().filter(|v| is_dark(v)).count(),
            background.iter().filter(|v| !is_dark(v)).count(),
        ),
        _ => (
            foreground.iter().filter(|v| !is_dark(v)).count(),
            background.iter().filter(|v| is_dark(v)).count(),
        ),
    };

    let quorum = config.classification_quorum;
    if (fg_correct as f64) < quorum * foreground.len() as f64 || (bg_correct as f64) < quorum * background.len() as f64 {
        tracing::trace!(fg_correct, bg_correct, "candidate rejected: inconsistent border");
        return None;
    }

    Some(Reflectance {
        reflectance,
        threshold,
        dark_value,
    })
}

/// Rotation of the tag frame by `quarter_turns` about the tag centre, mapping
/// outer corner `i` onto outer corner `i + quarter_turns`.
fn tag_rotation(quarter_turns: usize, tag_size: f64) -> Pose {
    let center = Vector3::new(tag_size * 0.5, tag_size * 0.5, 0.0);
    let angle = -std::f64::consts::FRAC_PI_2 * quarter_turns as f64;
    let (s, c) = angle.sin_cos();
    let rotation = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    Pose::new(rotation, center - rotation * center)
}

/// Find the top-left corner from the orientation modules.
///
/// Exactly one of the four modules must read as background; its index becomes the
/// new first corner. Returns the reordered quad and the matching `camera_T_tag`.
#[must_use]
pub fn determine_orientation(
    camera: &dyn Camera,
    image: &ImageView,
    quad: &Quad,
    camera_t_tag: &Pose,
    tag_size: f64,
    reflectance: &Reflectance,
) -> Option<(Quad, Pose)> {
    let values = sample_all(camera, image, camera_t_tag, &orientation_points(tag_size))?;

    let mut sum = 0u8;
    let mut top_left = None;
    for (i, &value) in values.iter().enumerate() {
        let module = if value < reflectance.threshold {
            reflectance.dark_value
        } else {
            1 - reflectance.dark_value
        };
        if module == 0 {
            top_left = Some(i);
        }
        sum += module;
    }

    let top_left = match (sum, top_left) {
        (3, Some(index)) => index,
        _ => {
            tracing::trace!(sum, "candidate rejected: orientation modules");
            return None;
        }
    };
    if top_left == 0 {
        return Some((*quad, *camera_t_tag));
    }

    let oriented = *camera_t_tag * tag_rotation(top_left, tag_size);
    oriented.is_valid().then(|| (quad.rotated(top_left), oriented))
}

/// Read the 16 data modules, bit 15 first.
#[must_use]
pub fn read_data_matrix(
    camera: &dyn Camera,
    image: &ImageView,
    camera_t_tag: &Pose,
    tag_size: f64,
    threshold: u8,
    dark_value: u8,
) -> Option<u16> {
    let light_value = 1 - dark_value;
    let mut data_matrix = 0u16;
    for (i, center) in data_module_centers(tag_size).iter().enumerate() {
        let value = sample(camera, image, camera_t_tag, center)?;
        let bit = if value >= threshold { light_value } else { dark_value };
        data_matrix |= u16::from(bit) << (15 - i);
    }
    Some(data_matrix)
}

/// `camera_T_tag` from correspondences, robustly (P3P + RANSAC, then refinement).
#[must_use]
pub fn compute_tag_pose(
    camera: &dyn Camera,
    image_points: &[Vector2<f64>],
    object_points: &[Vector3<f64>],
    params: &RansacParams,
) -> Option<Pose> {
    match ransac_p3p(camera, object_points, image_points, params) {
        Ok(result) => result.map(|r| r.camera_t_object).filter(Pose::is_valid),
        Err(err) => {
            tracing::debug!(%err, "pose estimation skipped");
            None
        }
    }
}

/// True if all outer corners project inside the image with `border` pixels to spare.
#[must_use]
pub fn is_tag_visible(camera: &dyn Camera, camera_t_tag: &Pose, tag_size: f64, border: f64) -> bool {
    object_corners(tag_size)
        .iter()
        .all(|c| camera.project_object(camera_t_tag, c).is_some_and(|p| camera.is_inside(&p, border)))
}

/// Read a tag from a quad.
///
/// `tag_size` is the size assumed while reading; if `sizes` holds a different size
/// for the decoded id, the translation is scaled accordingly.
#[must_use]
pub fn read_tag(
    camera: &dyn Camera,
    image: &ImageView,
    quad: &Quad,
    world_t_camera: &Pose,
    tag_size: f64,
    sizes: &TagSizeMap,
    config: &DetectorConfig,
) -> Option<TagReading> {
    let corners = object_corners(tag_size);
    let unoriented = compute_tag_pose(camera, &quad.corners, &corners, &config.ransac_params())?;
    let reflectance = determine_reflectance_type_and_threshold(camera, image, &unoriented, tag_size, config)?;
    let (quad, mut camera_t_tag) = determine_orientation(camera, image, quad, &unoriented, tag_size, &reflectance)?;
    let data_matrix = read_data_matrix(
        camera,
        image,
        &camera_t_tag,
        tag_size,
        reflectance.threshold,
        reflectance.dark_value,
    )?;
    let Some(id) = codec::decode(data_matrix) else {
        tracing::trace!(data_matrix, "candidate rejected: not a codeword");
        return None;
    };

    let mut size = tag_size;
    if let Some(&actual) = sizes.overrides.get(&id) {
        if (actual - tag_size).abs() > f64::EPSILON {
            camera_t_tag.translation *= actual / tag_size;
            size = actual;
        }
    }

    let tag = OculusTag::new(id, reflectance.reflectance, reflectance.threshold, world_t_camera * &camera_t_tag, size);
    tag.is_valid().then_some(TagReading {
        tag,
        quad,
        camera_t_tag,
        data_matrix,
    })
}

/// Corners beyond the outer four, refined in the image. Failed refinements are skipped.
fn refined_inner_corners(
    camera: &dyn Camera,
    image: &ImageView,
    camera_t_tag: &Pose,
    tag_size: f64,
    data_matrix: u16,
    window: usize,
) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
    let mut object_points = Vec::new();
    let mut image_points = Vec::new();
    for point in all_corners(data_matrix, tag_size).into_iter().skip(4) {
        let Some(projected) = camera.project_object(camera_t_tag, &point) else {
            continue;
        };
        if let Some(refined) = refine_corner(image, projected, window) {
            object_points.push(point);
            image_points.push(refined);
        }
    }
    (object_points, image_points)
}

/// Refine `camera_T_tag` with the outer corners and, for large enough tags, the
/// interior and data corners.
#[must_use]
pub fn refine_tag_pose(
    camera: &dyn Camera,
    image: &ImageView,
    quad: &Quad,
    camera_t_tag: &Pose,
    tag_size: f64,
    data_matrix: u16,
    config: &DetectorConfig,
) -> Option<Pose> {
    let mut object_points = object_corners(tag_size).to_vec();
    let mut image_points = quad.corners.to_vec();

    let average_edge = (0..4).map(|i| quad.edge_length(i)).sum::<f64>() * 0.25;
    if average_edge > config.interior_corners_min_edge {
        let (object, image_inner) = refined_inner_corners(
            camera,
            image,
            camera_t_tag,
            tag_size,
            data_matrix,
            config.interior_corner_window,
        );
        object_points.extend(object);
        image_points.extend(image_inner);
    }

    let refined = refine_pose(camera, camera_t_tag, &object_points, &image_points, &config.refine_params())
        .map_or(*camera_t_tag, |r| r.pose);
    refined.is_valid().then_some(refined)
}

/// One camera of a rig with its current image and world pose.
#[derive(Clone, Copy)]
pub struct CameraView<'a> {
    /// Camera model.
    pub camera: &'a dyn Camera,
    /// Current image.
    pub image: ImageView<'a>,
    /// Camera pose.
    pub world_t_camera: Pose,
}

impl<'a> CameraView<'a> {
    /// View of `camera` mounted at `device_t_camera` on a device at `world_t_device`.
    #[must_use]
    pub fn new(camera: &'a dyn Camera, image: ImageView<'a>, world_t_device: &Pose, device_t_camera: &Pose) -> Self {
        Self {
            camera,
            image,
            world_t_camera: world_t_device * device_t_camera,
        }
    }
}

/// Refine the pose of a tag seen in camera `a` using both cameras.
///
/// All corners are located in `a`; those projecting inside `b` are matched there by
/// patch search and kept when within the configured error. Without any match in `b`
/// the input pose is returned unchanged. Returns `camera_a_T_tag`.
#[must_use]
pub fn refine_tag_pose_stereo(
    a: &CameraView<'_>,
    b: &CameraView<'_>,
    quad: &Quad,
    camera_a_t_tag: &Pose,
    tag_size: f64,
    data_matrix: u16,
    config: &DetectorConfig,
) -> Option<Pose> {
    let mut object_a = object_corners(tag_size).to_vec();
    let mut image_a = quad.corners.to_vec();
    let (object_inner, image_inner) =
        refined_inner_corners(a.camera, &a.image, camera_a_t_tag, tag_size, data_matrix, config.interior_corner_window);
    object_a.extend(object_inner);
    image_a.extend(image_inner);

    let world_t_tag = a.world_t_camera * *camera_a_t_tag;
    let camera_b_t_tag = b.world_t_camera.inverse() * world_t_tag;
    let border = config.frame_border as f64;

    let mut object_b = Vec::new();
    let mut image_b = Vec::new();
    for (object, location_a) in object_a.iter().zip(&image_a) {
        let Some(predicted) = b.camera.project_object(&camera_b_t_tag, object) else {
            continue;
        };
        if !b.camera.is_inside(&predicted, border) {
            continue;
        }
        if let Some((location, error)) =
            verify_stereo_location(&a.image, &b.image, *location_a, predicted, config.stereo_search_radius)
        {
            if error < config.stereo_max_error {
                object_b.push(*object);
                image_b.push(location);
            }
        }
    }

    if image_b.is_empty() {
        return Some(*camera_a_t_tag);
    }

    let views = [
        PoseView {
            camera: a.camera,
            camera_t_world: a.world_t_camera.inverse(),
            object_points: &object_a,
            image_points: &image_a,
        },
        PoseView {
            camera: b.camera,
            camera_t_world: b.world_t_camera.inverse(),
            object_points: &object_b,
            image_points: &image_b,
        },
    ];
    let refined_world_t_tag = refine_object_pose_multi_view(&views, &world_t_tag, &config.stereo_refine_params())
        .map_or(world_t_tag, |r| r.pose);
    let camera_a_t_tag = a.world_t_camera.inverse() * refined_world_t_tag;
    camera_a_t_tag.is_valid().then_some(camera_a_t_tag)
}

/// Build an observation of `tag` from its quad in one image.
///
/// The outer corners are taken from the quad; the remaining corners are projected
/// with the tag pose and refined with a window chosen from the smallest quad edge.
/// Returns `None` if the tag is not fully visible.
#[must_use]
pub fn observe_tag(
    camera: &dyn Camera,
    image: &ImageView,
    world_t_camera: &Pose,
    tag: &OculusTag,
    quad: &Quad,
    border: f64,
) -> Option<TagObservation> {
    let camera_t_tag = tag.camera_t_tag(world_t_camera);
    if !is_tag_visible(camera, &camera_t_tag, tag.size, border) {
        return None;
    }
    let data_matrix = codec::encode(tag.id).ok()?;
    let window = corner_search_window(quad.min_edge_length());

    let corners = object_corners(tag.size).to_vec();
    let mut object_points = corners.clone();
    let mut image_points = quad.corners.to_vec();
    let (object_inner, image_inner) =
        refined_inner_corners(camera, image, &camera_t_tag, tag.size, data_matrix, window);
    object_points.extend(object_inner);
    image_points.extend(image_inner);

    Some(TagObservation {
        world_t_camera: *world_t_camera,
        object_points,
        image_points,
        tracking_object_points: corners,
        tracking_image_points: quad.corners.to_vec(),
    })
}

/// Observe `tag` and append the observation to `history`.
pub fn add_tag_observation(
    camera: &dyn Camera,
    image: &ImageView,
    world_t_camera: &Pose,
    tag: &OculusTag,
    quad: &Quad,
    border: f64,
    history: &mut TagObservationHistory,
) -> bool {
    match observe_tag(camera, image, world_t_camera, tag, quad, border) {
        Some(observation) => {
            history.add_observation(observation);
            true
        }
        None => false,
    }
}

/// Observe `tag`, append the observation and refine the tag pose over the history.
#[allow(clippy::too_many_arguments)]
pub fn add_tag_observation_and_optimize(
    camera: &dyn Camera,
    image: &ImageView,
    world_t_camera: &Pose,
    tag: &mut OculusTag,
    quad: &Quad,
    border: f64,
    history: &mut TagObservationHistory,
    params: &RefineParams,
) -> bool {
    if !add_tag_observation(camera, image, world_t_camera, tag, quad, border, history) {
        return false;
    }
    match history.optimize_pose(camera, &tag.world_t_tag, params) {
        Some(world_t_tag) => {
            tag.world_t_tag = world_t_tag;
            true
        }
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{CameraIntrinsics, PinholeCamera};
    use crate::test_utils::TagScene;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0))
    }

    fn frontal_scene(id: u32, reflectance: ReflectanceType) -> TagScene {
        let camera_t_tag = Pose::from_euler(0.15, -0.1, 0.3, Vector3::new(-0.08, -0.06, 0.5));
        TagScene::render(&camera(), id, reflectance, 0.16, &camera_t_tag, 0.0, 3).unwrap()
    }

    #[test]
    fn test_reflectance_normal_and_inverted() {
        let config = DetectorConfig::default();
        for (reflectance, dark) in [(ReflectanceType::Normal, 1), (ReflectanceType::Inverted, 0)] {
            let scene = frontal_scene(42, reflectance);
            let r = determine_reflectance_type_and_threshold(
                &camera(),
                &scene.image.view(),
                &scene.camera_t_tag,
                0.16,
                &config,
            )
            .unwrap();
            assert_eq!(r.reflectance, reflectance);
            assert_eq!(r.dark_value, dark);
            assert!(r.threshold > 60 && r.threshold < 200);
        }
    }

    /// Affine remap of a normal-reflectance scene to the given module intensities.
    fn recolor(scene: &TagScene, foreground: u8, background: u8) -> crate::image::OwnedImage {
        use crate::test_utils::{BRIGHT, DARK};
        let mut image = scene.image.clone();
        let span = f64::from(BRIGHT) - f64::from(DARK);
        for v in &mut image.data {
            let t = (f64::from(*v) - f64::from(DARK)) / span;
            *v = (f64::from(foreground) + t * (f64::from(background) - f64::from(foreground))).round() as u8;
        }
        image
    }

    #[test]
    fn test_threshold_lies_between_intensities() {
        let config = DetectorConfig::default();
        let contrast = config.min_intensity_contrast;
        let scene = frontal_scene(42, ReflectanceType::Normal);
        let mut pairs = vec![(100u8, 110u8), (0, 10), (245, 255), (127, 140)];
        for f in (0..=255u8).step_by(15) {
            for delta in [contrast, contrast + 1, 25, 90, 200] {
                pairs.extend(f.checked_add(delta).map(|b| (f, b)));
                pairs.extend(f.checked_sub(delta).map(|b| (f, b)));
            }
        }

        for (f, b) in pairs {
            for (foreground, background) in [(f, b), (b, f)] {
                let image = recolor(&scene, foreground, background);
                let r = determine_reflectance_type_and_threshold(
                    &camera(),
                    &image.view(),
                    &scene.camera_t_tag,
                    0.16,
                    &config,
                )
                .unwrap_or_else(|| panic!("no reflectance for fg {foreground} bg {background}"));
                let expected = if foreground < background {
                    ReflectanceType::Normal
                } else {
                    ReflectanceType::Inverted
                };
                assert_eq!(r.reflectance, expected, "fg {foreground} bg {background}");
                assert!(
                    foreground.min(background) < r.threshold && r.threshold < foreground.max(background),
                    "fg {foreground} bg {background} threshold {}",
                    r.threshold
                );
            }
        }
    }

    #[test]
    fn test_low_contrast_rejected() {
        let config = DetectorConfig::default();
        let image = crate::image::OwnedImage::new(640, 480, 128);
        let pose = Pose::from_translation(Vector3::new(-0.08, -0.08, 0.5));
        assert!(determine_reflectance_type_and_threshold(&camera(), &image.view(), &pose, 0.16, &config).is_none());
    }

    #[test]
    fn test_orientation_recovered_from_any_start() {
        let config = DetectorConfig::default();
        let scene = frontal_scene(7, ReflectanceType::Normal);
        let cam = camera();
        let view = scene.image.view();
        for k in 0..4 {
            let quad = scene.quad.rotated((4 - k) % 4);
            let unoriented = compute_tag_pose(&cam, &quad.corners, &object_corners(0.16), &config.ransac_params()).unwrap();
            let r = determine_reflectance_type_and_threshold(&cam, &view, &unoriented, 0.16, &config).unwrap();
            let (oriented, pose) = determine_orientation(&cam, &view, &quad, &unoriented, 0.16, &r).unwrap();
            for i in 0..4 {
                assert!((oriented.corners[i] - scene.quad.corners[i]).norm() < 1e-6);
            }
            assert!(pose.translation_distance(&scene.camera_t_tag) < 1e-3);
            assert!(pose.angle_to(&scene.camera_t_tag) < 1e-2);
        }
    }

    #[test]
    fn test_orientation_is_idempotent() {
        let config = DetectorConfig::default();
        let cam = camera();
        for reflectance in [ReflectanceType::Normal, ReflectanceType::Inverted] {
            let scene = frontal_scene(611, reflectance);
            let view = scene.image.view();
            for k in 0..4 {
                let quad = scene.quad.rotated(k);
                let pose = compute_tag_pose(&cam, &quad.corners, &object_corners(0.16), &config.ransac_params()).unwrap();
                let r = determine_reflectance_type_and_threshold(&cam, &view, &pose, 0.16, &config).unwrap();
                let (quad, pose) = determine_orientation(&cam, &view, &quad, &pose, 0.16, &r).unwrap();
                let (again_quad, again_pose) = determine_orientation(&cam, &view, &quad, &pose, 0.16, &r).unwrap();
                assert_eq!(again_quad, quad);
                assert_eq!(again_pose, pose);
            }
        }
    }

    #[test]
    fn test_read_tag_with_size_override() {
        let config = DetectorConfig::default();
        let scene = frontal_scene(300, ReflectanceType::Normal);
        let cam = camera();
        let mut sizes = TagSizeMap::new(0.08);
        let reading = read_tag(&cam, &scene.image.view(), &scene.quad, &Pose::identity(), 0.08, &sizes, &config).unwrap();
        assert_eq!(reading.tag.id, 300);
        assert!((reading.tag.size - 0.08).abs() < 1e-12);
        assert!((reading.camera_t_tag.translation.z - 0.25).abs() < 0.01);

        sizes.insert(300, 0.16).unwrap();
        let reading = read_tag(&cam, &scene.image.view(), &scene.quad, &Pose::identity(), 0.08, &sizes, &config).unwrap();
        assert!((reading.tag.size - 0.16).abs() < 1e-12);
        assert!(reading.tag.world_t_tag.translation_distance(&scene.camera_t_tag) < 0.01);
    }

    #[test]
    fn test_refine_and_observe() {
        let config = DetectorConfig::default();
        let scene = frontal_scene(512, ReflectanceType::Inverted);
        let cam = camera();
        let view = scene.image.view();
        let reading = read_tag(&cam, &view, &scene.quad, &Pose::identity(), 0.16, &TagSizeMap::new(0.16), &config).unwrap();
        let refined =
            refine_tag_pose(&cam, &view, &reading.quad, &reading.camera_t_tag, 0.16, reading.data_matrix, &config)
                .unwrap();
        assert!(refined.translation_distance(&scene.camera_t_tag) < 2e-3);

        let mut history = TagObservationHistory::new();
        let mut tag = reading.tag.clone();
        assert!(add_tag_observation_and_optimize(
            &cam,
            &view,
            &Pose::identity(),
            &mut tag,
            &reading.quad,
            10.0,
            &mut history,
            &RefineParams::default(),
        ));
        let observation = history.latest().unwrap();
        assert!(observation.object_points.len() > 4);
        assert_eq!(observation.tracking_image_points.len(), 4);
    }

    #[test]
    fn test_tag_rotation_maps_corners() {
        let corners = object_corners(8.0);
        for k in 0..4 {
            let r = tag_rotation(k, 8.0);
            for i in 0..4 {
                let mapped = r.transform_point(&corners[i]);
                assert!((mapped - corners[(i + k) % 4]).norm() < 1e-9);
            }
        }
    }
}
