//! Error types for invalid input.
//!
//! Failing to find something in an image is never an error; those paths return
//! `None` or an empty collection. [`OcutagError`] is reserved for arguments that
//! violate an API contract.

use thiserror::Error;

/// Errors surfaced for malformed arguments.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcutagError {
    /// The row stride is smaller than the image width.
    #[error("stride ({stride}) cannot be less than width ({width})")]
    InvalidStride {
        /// Provided stride in elements.
        stride: usize,
        /// Provided width in pixels.
        width: usize,
    },

    /// The pixel buffer cannot hold the declared image.
    #[error("buffer size ({actual}) is too small for {width}x{height} image with stride {stride} (required: {required})")]
    BufferTooSmall {
        /// Actual buffer length.
        actual: usize,
        /// Required buffer length.
        required: usize,
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
        /// Row stride.
        stride: usize,
    },

    /// The image is smaller than the operation supports.
    #[error("image of {width}x{height} is too small, minimum is {min_width}x{min_height}")]
    ImageTooSmall {
        /// Image width.
        width: usize,
        /// Image height.
        height: usize,
        /// Minimum supported width.
        min_width: usize,
        /// Minimum supported height.
        min_height: usize,
    },

    /// Two parallel inputs have different lengths.
    #[error("mismatched array lengths: {0} vs {1}")]
    MismatchedLengths(usize, usize),

    /// Not enough 2D-3D correspondences for the pose solver.
    #[error("pose solver requires at least {required} correspondences, got {actual}")]
    NotEnoughCorrespondences {
        /// Minimum number of correspondences.
        required: usize,
        /// Number provided.
        actual: usize,
    },

    /// Tag id outside the payload range.
    #[error("tag id {0} is out of range, must be below {max}", max = crate::codec::MAX_TAG_ID)]
    TagIdOutOfRange(u32),

    /// A configuration value is outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OcutagError>;
