//! Tag model and the fixed 8x8 module layout.
//!
//! The tag frame has its origin at the outer top-left corner, x to the right, y down
//! and z into the tag, so the tag plane is `z = 0`. Coordinates below are in module
//! units and are scaled by `size / 8` when converted to object points.
//!
//! ```text
//!     0 -----> x ---- 3
//!     | # # # # # # # # |
//!     | # o . . . . # # |      # border (foreground)
//!     | # . d d d d . # |      . background ring
//!     y # . d d d d . # |      o orientation module
//!     | # . d d d d . # |      d data modules
//!     | # . d d d d . # |
//!     | # # . . . . # # |
//!     | # # # # # # # # |
//!     1 --------------- 2
//! ```

use crate::codec;
use crate::error::{OcutagError, Result};
use crate::image::OwnedImage;
use crate::pose::Pose;
use nalgebra::{Vector2, Vector3};
use std::collections::HashMap;

/// Modules per tag side.
pub const NUMBER_OF_MODULES: usize = 8;

/// Border ring samples, skipping the middle of each side.
const FOREGROUND_POINTS: [(f64, f64); 20] = [
    (0.5, 0.5),
    (1.5, 0.5),
    (2.5, 0.5),
    (5.5, 0.5),
    (6.5, 0.5),
    (7.5, 0.5),
    (0.5, 1.5),
    (0.5, 2.5),
    (0.5, 5.5),
    (0.5, 6.5),
    (7.5, 1.5),
    (7.5, 2.5),
    (7.5, 5.5),
    (7.5, 6.5),
    (0.5, 7.5),
    (1.5, 7.5),
    (2.5, 7.5),
    (5.5, 7.5),
    (6.5, 7.5),
    (7.5, 7.5),
];

/// Inner ring samples around the data area.
const BACKGROUND_POINTS: [(f64, f64); 16] = [
    (2.5, 1.5),
    (3.5, 1.5),
    (4.5, 1.5),
    (5.5, 1.5),
    (1.5, 2.5),
    (1.5, 3.5),
    (1.5, 4.5),
    (1.5, 5.5),
    (6.5, 2.5),
    (6.5, 3.5),
    (6.5, 4.5),
    (6.5, 5.5),
    (2.5, 6.5),
    (3.5, 6.5),
    (4.5, 6.5),
    (5.5, 6.5),
];

/// One orientation module per outer corner, in corner order. Only the first is background.
const ORIENTATION_POINTS: [(f64, f64); 4] = [(1.5, 1.5), (1.5, 6.5), (6.5, 6.5), (6.5, 1.5)];

/// Corners of the border and the orientation modules, present on every tag.
const INTERIOR_CORNERS: [(f64, f64); 10] = [
    (1.0, 1.0),
    (1.0, 6.0),
    (2.0, 6.0),
    (2.0, 7.0),
    (6.0, 7.0),
    (6.0, 6.0),
    (7.0, 6.0),
    (7.0, 2.0),
    (6.0, 2.0),
    (6.0, 1.0),
];

// ============================================================================
// TAG
// ============================================================================

/// Polarity of a printed tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReflectanceType {
    /// Dark modules on a bright background.
    Normal,
    /// Bright modules on a dark background.
    Inverted,
    /// Not determined.
    #[default]
    Undefined,
}

impl ReflectanceType {
    /// Binary module value assigned to dark pixels, `None` if undefined.
    #[must_use]
    pub fn dark_value(self) -> Option<u8> {
        match self {
            Self::Normal => Some(1),
            Self::Inverted => Some(0),
            Self::Undefined => None,
        }
    }
}

/// A decoded tag with its pose in the world.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OculusTag {
    /// Payload id in `[0, 1024)`.
    pub id: u32,
    /// Printed polarity.
    pub reflectance: ReflectanceType,
    /// Intensity threshold separating dark from bright modules.
    pub threshold: u8,
    /// Transformation from tag to world coordinates.
    pub world_t_tag: Pose,
    /// Edge length of the tag (outer border), in world units.
    pub size: f64,
}

impl OculusTag {
    /// Create a tag.
    #[must_use]
    pub fn new(id: u32, reflectance: ReflectanceType, threshold: u8, world_t_tag: Pose, size: f64) -> Self {
        Self {
            id,
            reflectance,
            threshold,
            world_t_tag,
            size,
        }
    }

    /// True if every field describes a usable tag.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id < codec::MAX_TAG_ID
            && self.reflectance != ReflectanceType::Undefined
            && self.world_t_tag.is_valid()
            && self.size > 0.0
    }

    /// `camera_T_tag` for a camera at `world_t_camera`.
    #[must_use]
    pub fn camera_t_tag(&self, world_t_camera: &Pose) -> Pose {
        world_t_camera.inverse() * self.world_t_tag
    }
}

/// Physical tag sizes, with per-id overrides of a default.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TagSizeMap {
    /// Size used for ids without an override.
    pub default_size: f64,
    /// Per-id sizes.
    pub overrides: HashMap<u32, f64>,
}

impl Default for TagSizeMap {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl TagSizeMap {
    /// A map without overrides.
    #[must_use]
    pub fn new(default_size: f64) -> Self {
        Self {
            default_size,
            overrides: HashMap::new(),
        }
    }

    /// Register the size of one tag.
    ///
    /// # Errors
    /// Rejects ids outside the payload range and non-positive sizes.
    pub fn insert(&mut self, id: u32, size: f64) -> Result<()> {
        if id >= codec::MAX_TAG_ID {
            return Err(OcutagError::TagIdOutOfRange(id));
        }
        if !(size > 0.0 && size.is_finite()) {
            return Err(OcutagError::InvalidConfig(format!("tag size must be positive, got {size}")));
        }
        self.overrides.insert(id, size);
        Ok(())
    }

    /// Size of the tag with `id`.
    #[must_use]
    pub fn size_of(&self, id: u32) -> f64 {
        self.overrides.get(&id).copied().unwrap_or(self.default_size)
    }
}

// ============================================================================
// LAYOUT
// ============================================================================

fn scaled(points: &[(f64, f64)], tag_size: f64) -> Vec<Vector3<f64>> {
    let module = tag_size / NUMBER_OF_MODULES as f64;
    points
        .iter()
        .map(|&(x, y)| Vector3::new(x * module, y * module, 0.0))
        .collect()
}

/// The four outer corners: `(0,0)`, `(0,s)`, `(s,s)`, `(s,0)`.
#[must_use]
pub fn object_corners(tag_size: f64) -> [Vector3<f64>; 4] {
    [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.0, tag_size, 0.0),
        Vector3::new(tag_size, tag_size, 0.0),
        Vector3::new(tag_size, 0.0, 0.0),
    ]
}

/// Outer corners on the tag plane.
#[must_use]
pub fn object_corners_2d(tag_size: f64) -> [Vector2<f64>; 4] {
    object_corners(tag_size).map(|c| c.xy())
}

/// Centres of border modules (dark on a normal tag).
#[must_use]
pub fn foreground_points(tag_size: f64) -> Vec<Vector3<f64>> {
    scaled(&FOREGROUND_POINTS, tag_size)
}

/// Centres of the inner ring modules (bright on a normal tag).
#[must_use]
pub fn background_points(tag_size: f64) -> Vec<Vector3<f64>> {
    scaled(&BACKGROUND_POINTS, tag_size)
}

/// Centres of the four orientation modules, in outer-corner order.
#[must_use]
pub fn orientation_points(tag_size: f64) -> Vec<Vector3<f64>> {
    scaled(&ORIENTATION_POINTS, tag_size)
}

/// Centres of the 16 data modules, row-major; index `i` carries bit `15 - i`.
#[must_use]
pub fn data_module_centers(tag_size: f64) -> Vec<Vector3<f64>> {
    let module = tag_size / NUMBER_OF_MODULES as f64;
    (0..16)
        .map(|i| {
            let (row, col) = (i / 4, i % 4);
            Vector3::new((2.5 + col as f64) * module, (2.5 + row as f64) * module, 0.0)
        })
        .collect()
}

/// The ten corners of the border and orientation modules.
#[must_use]
pub fn interior_corners(tag_size: f64) -> Vec<Vector3<f64>> {
    scaled(&INTERIOR_CORNERS, tag_size)
}

/// Module values of a whole tag, row-major, `1` for foreground.
#[must_use]
pub fn module_values(data_matrix: u16) -> [u8; NUMBER_OF_MODULES * NUMBER_OF_MODULES] {
    let mut modules = [0u8; NUMBER_OF_MODULES * NUMBER_OF_MODULES];
    for y in 0..NUMBER_OF_MODULES {
        for x in 0..NUMBER_OF_MODULES {
            let border = x == 0 || y == 0 || x == NUMBER_OF_MODULES - 1 || y == NUMBER_OF_MODULES - 1;
            let value = if border {
                1
            } else if (2..6).contains(&x) && (2..6).contains(&y) {
                let bit = 15 - ((y - 2) * 4 + (x - 2));
                ((data_matrix >> bit) & 1) as u8
            } else {
                // Inner ring: background except the three marked orientation corners.
                u8::from((x == 6 && y == 1) || (x == 1 && y == 6) || (x == 6 && y == 6))
            };
            modules[y * NUMBER_OF_MODULES + x] = value;
        }
    }
    modules
}

/// Module grid corners inside the data area, derived from the data bits.
///
/// A grid vertex is a corner when its 2x2 neighbourhood holds one or three
/// foreground modules, or two on a diagonal. With `skip_interior` the three vertices
/// already listed by [`interior_corners`] are left out.
#[must_use]
pub fn data_matrix_corners(data_matrix: u16, tag_size: f64, skip_interior: bool) -> Vec<Vector3<f64>> {
    let modules = module_values(data_matrix);
    let module = tag_size / NUMBER_OF_MODULES as f64;
    let n = NUMBER_OF_MODULES;

    let mut corners = Vec::new();
    for y in 2..n - 1 {
        let (start, end) = match (skip_interior, y) {
            (true, 2) => (2, 6),
            (true, 6) => (3, 6),
            _ => (2, 7),
        };
        for x in start..end {
            let top_left = modules[(y - 1) * n + x - 1];
            let top = modules[(y - 1) * n + x];
            let left = modules[y * n + x - 1];
            let here = modules[y * n + x];
            let sum = top_left + top + left + here;
            if sum == 1 || sum == 3 || (sum == 2 && top_left == here) {
                corners.push(Vector3::new(x as f64 * module, y as f64 * module, 0.0));
            }
        }
    }
    corners
}

/// Outer corners followed by the interior and data-area corners of a tag.
#[must_use]
pub fn all_corners(data_matrix: u16, tag_size: f64) -> Vec<Vector3<f64>> {
    let mut corners = object_corners(tag_size).to_vec();
    corners.extend(interior_corners(tag_size));
    corners.extend(data_matrix_corners(data_matrix, tag_size, true));
    corners
}

/// Render a fronto-parallel tag image.
///
/// `width` is the tag edge in pixels, `quiet_zone` the margin around it in modules.
///
/// # Errors
/// Fails for ids out of range, an undefined reflectance, or a width below eight pixels.
pub fn generate_tag_image(
    id: u32,
    reflectance: ReflectanceType,
    width: usize,
    quiet_zone: usize,
) -> Result<OwnedImage> {
    let data_matrix = codec::encode(id)?;
    let (foreground, background) = match reflectance {
        ReflectanceType::Normal => (0u8, 255u8),
        ReflectanceType::Inverted => (255u8, 0u8),
        ReflectanceType::Undefined => {
            return Err(OcutagError::InvalidConfig("reflectance must be defined".into()));
        }
    };
    if width < NUMBER_OF_MODULES {
        return Err(OcutagError::ImageTooSmall {
            width,
            height: width,
            min_width: NUMBER_OF_MODULES,
            min_height: NUMBER_OF_MODULES,
        });
    }

    let module = width as f64 / NUMBER_OF_MODULES as f64;
    let offset = (quiet_zone as f64 * module).round() as usize;
    let side = width + 2 * offset;
    let mut image = OwnedImage::new(side, side, background);

    let modules = module_values(data_matrix);
    for y in 0..width {
        let my = ((y as f64 / module) as usize).min(NUMBER_OF_MODULES - 1);
        for x in 0..width {
            let mx = ((x as f64 / module) as usize).min(NUMBER_OF_MODULES - 1);
            if modules[my * NUMBER_OF_MODULES + mx] == 1 {
                image.set(offset + x, offset + y, foreground);
            }
        }
    }
    Ok(image)
}
