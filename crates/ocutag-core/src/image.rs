//! Stride-aware image views, owned buffers and pyramids.
//!
//! Pixel centres sit at integer coordinates: pixel `(x, y)` covers the square
//! `[x - 0.5, x + 0.5] x [y - 0.5, y + 0.5]`. All sub-pixel sampling in the crate
//! follows this convention.

#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use crate::error::{OcutagError, Result};

/// A view into an 8-bit grayscale buffer with explicit stride support.
///
/// The stride may exceed the width (padded rows). The invariant `stride >= width`
/// and the buffer length are validated once in [`ImageView::new`].
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    /// Raw pixel data, row-major.
    pub data: &'a [u8],
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Elements between the starts of two consecutive rows.
    pub stride: usize,
}

impl<'a> ImageView<'a> {
    /// Create a new view after validating that the buffer matches the dimensions and stride.
    ///
    /// # Errors
    /// Returns [`OcutagError::InvalidStride`] if `stride < width` and
    /// [`OcutagError::BufferTooSmall`] if the buffer cannot hold the image.
    pub fn new(data: &'a [u8], width: usize, height: usize, stride: usize) -> Result<Self> {
        if stride < width {
            return Err(OcutagError::InvalidStride { stride, width });
        }
        let required = if height > 0 {
            (height - 1) * stride + width
        } else {
            0
        };
        if data.len() < required {
            return Err(OcutagError::BufferTooSmall {
                actual: data.len(),
                required,
                width,
                height,
                stride,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride,
        })
    }

    /// Safe accessor for a specific row.
    #[inline(always)]
    #[must_use]
    pub fn get_row(&self, y: usize) -> &'a [u8] {
        assert!(y < self.height, "Row index {y} out of bounds");
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Safe accessor for a specific pixel.
    #[inline(always)]
    #[must_use]
    pub fn get_pixel(&self, x: usize, y: usize) -> u8 {
        assert!(x < self.width, "Column index {x} out of bounds");
        self.get_row(y)[x]
    }

    /// Pixel access with signed coordinates, `None` outside the image.
    #[inline]
    #[must_use]
    pub fn pixel_checked(&self, x: i32, y: i32) -> Option<u8> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.stride + x as usize])
    }

    /// Returns true if the continuous location can be bilinearly interpolated.
    #[inline]
    #[must_use]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= (self.width as f64 - 1.0) && y <= (self.height as f64 - 1.0)
    }

    /// Bilinear interpolation at a sub-pixel location.
    ///
    /// Returns `None` if the location is outside `[0, width - 1] x [0, height - 1]`.
    #[must_use]
    pub fn interpolate(&self, x: f64, y: f64) -> Option<f64> {
        if self.width == 0 || self.height == 0 || !self.contains(x, y) {
            return None;
        }
        Some(self.interpolate_unchecked(x, y))
    }

    /// Bilinear interpolation with the location clamped into the image.
    #[must_use]
    pub fn interpolate_clamped(&self, x: f64, y: f64) -> f64 {
        if self.width == 0 || self.height == 0 {
            return 0.0;
        }
        let x = x.clamp(0.0, self.width as f64 - 1.0);
        let y = y.clamp(0.0, self.height as f64 - 1.0);
        self.interpolate_unchecked(x, y)
    }

    #[inline]
    fn interpolate_unchecked(&self, x: f64, y: f64) -> f64 {
        let x0 = (x.floor() as usize).min(self.width - 1);
        let y0 = (y.floor() as usize).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;

        let row0 = &self.data[y0 * self.stride..];
        let row1 = &self.data[y1 * self.stride..];
        let top = f64::from(row0[x0]) * (1.0 - fx) + f64::from(row0[x1]) * fx;
        let bottom = f64::from(row1[x0]) * (1.0 - fx) + f64::from(row1[x1]) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Interpolate a square `size x size` patch centred at `(cx, cy)`.
    ///
    /// Element `(c, r)` of the patch samples location `(cx + c - size/2, cy + r - size/2)`.
    /// Returns false if any sample falls outside the image.
    pub fn interpolate_patch(&self, cx: f64, cy: f64, size: usize, patch: &mut [f32]) -> bool {
        debug_assert!(patch.len() >= size * size);
        let half = (size / 2) as f64;
        let left = cx - half;
        let top = cy - half;
        if !self.contains(left, top) || !self.contains(left + (size - 1) as f64, top + (size - 1) as f64) {
            return false;
        }

        // The fractional offsets are shared by every sample of the patch.
        let x0 = left.floor();
        let y0 = top.floor();
        let fx = left - x0;
        let fy = top - y0;
        let x0 = x0 as usize;
        let y0 = y0 as usize;
        let w00 = ((1.0 - fx) * (1.0 - fy)) as f32;
        let w10 = (fx * (1.0 - fy)) as f32;
        let w01 = ((1.0 - fx) * fy) as f32;
        let w11 = (fx * fy) as f32;

        for r in 0..size {
            let ya = (y0 + r).min(self.height - 1);
            let yb = (ya + 1).min(self.height - 1);
            let row_a = &self.data[ya * self.stride..ya * self.stride + self.width];
            let row_b = &self.data[yb * self.stride..yb * self.stride + self.width];
            for c in 0..size {
                let xa = (x0 + c).min(self.width - 1);
                let xb = (xa + 1).min(self.width - 1);
                patch[r * size + c] = w00 * f32::from(row_a[xa])
                    + w10 * f32::from(row_a[xb])
                    + w01 * f32::from(row_b[xa])
                    + w11 * f32::from(row_b[xb]);
            }
        }
        true
    }

    /// Copy the view into an owned, tightly packed buffer.
    #[must_use]
    pub fn to_owned_image(&self) -> OwnedImage {
        let mut data = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            data.extend_from_slice(self.get_row(y));
        }
        OwnedImage {
            data,
            width: self.width,
            height: self.height,
            stride: self.width,
        }
    }
}

/// An owned 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedImage {
    /// Pixel buffer, `stride * height` elements.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Row stride in elements.
    pub stride: usize,
}

impl OwnedImage {
    /// Create an image filled with a constant value.
    #[must_use]
    pub fn new(width: usize, height: usize, value: u8) -> Self {
        Self {
            data: vec![value; width * height],
            width,
            height,
            stride: width,
        }
    }

    /// Create an image whose rows are padded to a multiple of `alignment` bytes.
    #[must_use]
    pub fn with_alignment(width: usize, height: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let stride = width.div_ceil(alignment) * alignment;
        Self {
            data: vec![0; stride * height],
            width,
            height,
            stride,
        }
    }

    /// Wrap a tightly packed buffer.
    ///
    /// # Errors
    /// Returns [`OcutagError::BufferTooSmall`] if `data` is shorter than `width * height`.
    pub fn from_vec(data: Vec<u8>, width: usize, height: usize) -> Result<Self> {
        if data.len() < width * height {
            return Err(OcutagError::BufferTooSmall {
                actual: data.len(),
                required: width * height,
                width,
                height,
                stride: width,
            });
        }
        Ok(Self {
            data,
            width,
            height,
            stride: width,
        })
    }

    /// Borrow as an [`ImageView`].
    #[must_use]
    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }

    /// Read a pixel.
    #[inline]
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride + x]
    }

    /// Write a pixel.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.stride + x] = value;
    }

    /// Mutable access to one row (without padding).
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        &mut self.data[start..start + self.width]
    }
}

/// Nearest-neighbour resampling into `dst`, whose dimensions define the target size.
pub fn resize_nearest_into(src: &ImageView, dst: &mut OwnedImage) {
    if dst.width == 0 || dst.height == 0 || src.width == 0 || src.height == 0 {
        return;
    }
    let (dw, dh) = (dst.width, dst.height);
    for y in 0..dh {
        let sy = ((y * src.height) / dh).min(src.height - 1);
        let src_row = src.get_row(sy);
        let dst_row = dst.row_mut(y);
        for (x, d) in dst_row.iter_mut().enumerate() {
            let sx = ((x * src.width) / dw).min(src.width - 1);
            *d = src_row[sx];
        }
    }
}

/// Nearest-neighbour resampling with rows aligned to 4 bytes.
#[must_use]
pub fn resize_nearest(src: &ImageView, width: usize, height: usize) -> OwnedImage {
    let mut dst = OwnedImage::with_alignment(width, height, 4);
    resize_nearest_into(src, &mut dst);
    dst
}

/// Photometric inversion (`255 - v`).
#[must_use]
pub fn invert(src: &ImageView) -> OwnedImage {
    let mut dst = OwnedImage::new(src.width, src.height, 0);
    for y in 0..src.height {
        for (d, s) in dst.row_mut(y).iter_mut().zip(src.get_row(y)) {
            *d = 255 - s;
        }
    }
    dst
}

/// Halve the resolution with a 2x2 box filter.
#[must_use]
pub fn downsample_2x(src: &ImageView) -> OwnedImage {
    let w = src.width / 2;
    let h = src.height / 2;
    let mut dst = OwnedImage::new(w, h, 0);
    for y in 0..h {
        let r0 = src.get_row(2 * y);
        let r1 = src.get_row(2 * y + 1);
        let out = dst.row_mut(y);
        for (x, o) in out.iter_mut().enumerate() {
            let sum = u16::from(r0[2 * x])
                + u16::from(r0[2 * x + 1])
                + u16::from(r1[2 * x])
                + u16::from(r1[2 * x + 1]);
            *o = ((sum + 2) / 4) as u8;
        }
    }
    dst
}

/// A Gaussian-free image pyramid, finest layer first.
#[derive(Clone, Debug)]
pub struct ImagePyramid {
    layers: Vec<OwnedImage>,
}

impl ImagePyramid {
    /// Smallest side length a coarser layer may have.
    pub const MIN_LAYER_SIZE: usize = 16;

    /// Build up to `max_layers` layers. Layer 0 is a copy of `image`.
    #[must_use]
    pub fn new(image: &ImageView, max_layers: usize) -> Self {
        let mut layers = Vec::with_capacity(max_layers.max(1));
        layers.push(image.to_owned_image());
        while layers.len() < max_layers {
            let Some(last) = layers.last() else { break };
            if last.width / 2 < Self::MIN_LAYER_SIZE || last.height / 2 < Self::MIN_LAYER_SIZE {
                break;
            }
            let next = downsample_2x(&last.view());
            layers.push(next);
        }
        Self { layers }
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True if the pyramid holds no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// View of one layer, `0` being the finest.
    #[must_use]
    pub fn layer(&self, index: usize) -> Option<ImageView<'_>> {
        self.layers.get(index).map(OwnedImage::view)
    }

    /// The finest layer.
    #[must_use]
    pub fn finest(&self) -> Option<ImageView<'_>> {
        self.layer(0)
    }
}
