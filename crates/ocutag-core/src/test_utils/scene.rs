#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]

use crate::camera::Camera;
use crate::codec;
use crate::error::{OcutagError, Result};
use crate::image::OwnedImage;
use crate::pose::Pose;
use crate::quad::Quad;
use crate::tag::{NUMBER_OF_MODULES, ReflectanceType, module_values, object_corners};
use nalgebra::{Vector2, Vector3};

/// Intensity of dark image regions.
pub const DARK: u8 = 30;
/// Intensity of bright image regions.
pub const BRIGHT: u8 = 220;

/// A single tag rendered through a camera.
#[derive(Clone, Debug)]
pub struct TagScene {
    /// The rendered image.
    pub image: OwnedImage,
    /// Ground-truth pose of the tag in the camera.
    pub camera_t_tag: Pose,
    /// Projected outer corners, corner 0 at the tag's top-left.
    pub quad: Quad,
}

impl TagScene {
    /// Render tag `id` of edge length `tag_size` at `camera_t_tag`.
    ///
    /// Every pixel averages `supersample`² rays. Everything off the tag plane or
    /// outside the tag shows the tag's background intensity. Gaussian noise with
    /// `noise_sigma` is added with a fixed seed.
    ///
    /// # Errors
    /// Fails for ids out of range, an undefined reflectance, or a tag whose corners
    /// do not project into the image.
    pub fn render(
        camera: &dyn Camera,
        id: u32,
        reflectance: ReflectanceType,
        tag_size: f64,
        camera_t_tag: &Pose,
        noise_sigma: f64,
        supersample: usize,
    ) -> Result<Self> {
        let data_matrix = codec::encode(id)?;
        let (foreground, background) = match reflectance {
            ReflectanceType::Normal => (f64::from(DARK), f64::from(BRIGHT)),
            ReflectanceType::Inverted => (f64::from(BRIGHT), f64::from(DARK)),
            ReflectanceType::Undefined => {
                return Err(OcutagError::InvalidConfig("reflectance must be defined".into()));
            }
        };

        let mut corners = [Vector2::zeros(); 4];
        for (corner, object) in corners.iter_mut().zip(object_corners(tag_size).iter()) {
            *corner = camera
                .project_object(camera_t_tag, object)
                .ok_or_else(|| OcutagError::InvalidConfig("tag corner behind the camera".into()))?;
        }

        let modules = module_values(data_matrix);
        let module = tag_size / NUMBER_OF_MODULES as f64;
        let tag_t_camera = camera_t_tag.inverse();
        let origin = tag_t_camera.translation;
        let ss = supersample.max(1);
        let weight = 1.0 / (ss * ss) as f64;

        let (width, height) = (camera.width(), camera.height());
        let mut image = OwnedImage::new(width, height, 0);
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0;
                for sy in 0..ss {
                    for sx in 0..ss {
                        let p = Vector2::new(
                            x as f64 - 0.5 + (sx as f64 + 0.5) / ss as f64,
                            y as f64 - 0.5 + (sy as f64 + 0.5) / ss as f64,
                        );
                        let direction = tag_t_camera.rotation * camera.unproject_ray(&p);
                        sum += match intersect_plane(&origin, &direction) {
                            Some(q) => {
                                let (mx, my) = (q.x / module, q.y / module);
                                let inside = (0.0..NUMBER_OF_MODULES as f64).contains(&mx)
                                    && (0.0..NUMBER_OF_MODULES as f64).contains(&my);
                                if inside && modules[my as usize * NUMBER_OF_MODULES + mx as usize] == 1 {
                                    foreground
                                } else {
                                    background
                                }
                            }
                            None => background,
                        };
                    }
                }
                image.set(x, y, (sum * weight).round().clamp(0.0, 255.0) as u8);
            }
        }

        if noise_sigma > 0.0 {
            super::add_gaussian_noise(&mut image, noise_sigma, u64::from(id));
        }

        Ok(Self {
            image,
            camera_t_tag: *camera_t_tag,
            quad: Quad::new(corners),
        })
    }
}

/// Intersection of a ray from `origin` with the plane `z = 0`.
fn intersect_plane(origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<Vector3<f64>> {
    if direction.z.abs() < 1e-12 {
        return None;
    }
    let t = -origin.z / direction.z;
    (t > 0.0).then(|| origin + direction * t)
}
