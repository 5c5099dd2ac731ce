//! Keyframe detection from tile histograms and IMU samples.
//!
//! Every frame is resampled to a small fixed resolution and split into tiles. A
//! tile's intensity histogram is compared with the same tile of the last keyframe;
//! the per-tile distances are clamped into `[0, 1]` and averaged into a scene change
//! score.
//!
//! Time caps force keyframes even for static content, while large accelerations or
//! rotation rates suppress them until the device has calmed down.

#![allow(clippy::cast_possible_truncation)]

use crate::config::FrameChangeConfig;
use crate::error::Result;
use crate::image::{ImageView, OwnedImage, resize_nearest_into};
use multiversion::multiversion;
use nalgebra::{UnitQuaternion, Vector3};
use rayon::prelude::*;

/// Outcome of [`FrameChangeDetector::detect_frame_change`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameChangeResult {
    /// The frame or its timestamp cannot be used.
    InvalidInput,
    /// The frame does not become a keyframe.
    NoChangeDetected,
    /// The frame is the new keyframe.
    ChangeDetected,
}

/// Stateful keyframe detector for one image stream.
///
/// Frames must be passed in timestamp order; IMU samples may arrive at any time
/// between two frames.
#[derive(Clone, Debug)]
pub struct FrameChangeDetector {
    config: FrameChangeConfig,
    tiles_x: usize,
    tiles_y: usize,
    resampled: OwnedImage,
    /// `tiles_x * tiles_y` histograms of `histogram_bins` bins, row-major by tile.
    current: Vec<u32>,
    keyframe: Vec<u32>,
    distances: Vec<f64>,
    last_frame_timestamp: Option<f64>,
    previous_frame_timestamp: f64,
    last_keyframe_timestamp: f64,
    last_large_motion_timestamp: Option<f64>,
    keyframe_orientation: UnitQuaternion<f64>,
}

impl FrameChangeDetector {
    /// Create a detector.
    ///
    /// # Errors
    /// Returns [`crate::OcutagError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: FrameChangeConfig) -> Result<Self> {
        config.validate()?;
        let tiles_x = config.target_width.div_ceil(config.tile_size);
        let tiles_y = config.target_height.div_ceil(config.tile_size);
        let histogram_len = tiles_x * tiles_y * config.histogram_bins;
        Ok(Self {
            config,
            tiles_x,
            tiles_y,
            resampled: OwnedImage::with_alignment(config.target_width, config.target_height, 4),
            current: vec![0; histogram_len],
            keyframe: vec![0; histogram_len],
            distances: vec![0.0; tiles_x * tiles_y],
            last_frame_timestamp: None,
            previous_frame_timestamp: 0.0,
            last_keyframe_timestamp: 0.0,
            last_large_motion_timestamp: None,
            keyframe_orientation: UnitQuaternion::identity(),
        })
    }

    /// The options of this detector.
    #[must_use]
    pub fn config(&self) -> &FrameChangeConfig {
        &self.config
    }

    /// Tiles per row and per column.
    #[must_use]
    pub fn tile_grid(&self) -> (usize, usize) {
        (self.tiles_x, self.tiles_y)
    }

    /// Per-tile histogram distances of the last compared frame, row-major.
    #[must_use]
    pub fn tile_distances(&self) -> &[f64] {
        &self.distances
    }

    /// Timestamp of the last keyframe, if any frame was seen.
    #[must_use]
    pub fn last_keyframe_timestamp(&self) -> Option<f64> {
        self.last_frame_timestamp.map(|_| self.last_keyframe_timestamp)
    }

    /// Device orientation recorded with the last keyframe.
    #[must_use]
    pub fn keyframe_orientation(&self) -> &UnitQuaternion<f64> {
        &self.keyframe_orientation
    }

    /// Record a linear acceleration sample (m/s², gravity removed).
    pub fn add_acceleration_sample(&mut self, acceleration: &Vector3<f64>, timestamp: f64) {
        if acceleration.norm() > self.config.large_acceleration {
            self.register_large_motion(timestamp);
        }
    }

    /// Record an angular velocity sample (rad/s).
    pub fn add_gyro_sample(&mut self, rotation_rate: &Vector3<f64>, timestamp: f64) {
        if rotation_rate.norm() > self.config.large_rotation_rate {
            self.register_large_motion(timestamp);
        }
    }

    fn register_large_motion(&mut self, timestamp: f64) {
        if !timestamp.is_finite() {
            return;
        }
        tracing::trace!(timestamp, "large motion");
        self.last_large_motion_timestamp = Some(
            self.last_large_motion_timestamp
                .map_or(timestamp, |t| t.max(timestamp)),
        );
    }

    /// Decide whether `image`, taken at `timestamp` with device `orientation`,
    /// becomes a keyframe.
    ///
    /// The first frame always does. Later frames are rate limited by
    /// `minimum_time_between_keyframes`, forced by the time caps when
    /// `forced_keyframes` is set, suppressed after large motion, and otherwise
    /// decided by the tile histogram change score.
    pub fn detect_frame_change(
        &mut self,
        image: &ImageView,
        timestamp: f64,
        orientation: &UnitQuaternion<f64>,
    ) -> FrameChangeResult {
        if image.width < self.config.tile_size || image.height < self.config.tile_size || !timestamp.is_finite() {
            return FrameChangeResult::InvalidInput;
        }
        let _span = tracing::info_span!("frame_change").entered();

        let Some(last_frame) = self.last_frame_timestamp else {
            self.previous_frame_timestamp = timestamp;
            self.last_frame_timestamp = Some(timestamp);
            self.compute_tile_histograms(image);
            self.declare_keyframe(timestamp, orientation);
            return FrameChangeResult::ChangeDetected;
        };
        if timestamp < last_frame {
            tracing::debug!(timestamp, last_frame, "frame timestamp goes backwards");
            return FrameChangeResult::InvalidInput;
        }

        // Motion since the frame before the last one counts.
        let recent_motion = self
            .last_large_motion_timestamp
            .is_some_and(|t| t >= self.previous_frame_timestamp);
        self.previous_frame_timestamp = last_frame;
        self.last_frame_timestamp = Some(timestamp);

        let elapsed = timestamp - self.last_keyframe_timestamp;
        if elapsed < self.config.minimum_time_between_keyframes {
            return FrameChangeResult::NoChangeDetected;
        }

        let forced = self.config.forced_keyframes
            && (elapsed >= self.config.absolute_maximum_time_between_keyframes
                || (elapsed >= self.config.preferred_maximum_time_between_keyframes && !recent_motion));
        if !forced && recent_motion {
            tracing::trace!(timestamp, "keyframe suppressed by motion");
            return FrameChangeResult::NoChangeDetected;
        }

        self.compute_tile_histograms(image);
        if !forced {
            let score = self.change_score();
            tracing::trace!(timestamp, score, "frame change score");
            if score < self.config.change_detection_threshold {
                return FrameChangeResult::NoChangeDetected;
            }
        }

        self.declare_keyframe(timestamp, orientation);
        FrameChangeResult::ChangeDetected
    }

    fn declare_keyframe(&mut self, timestamp: f64, orientation: &UnitQuaternion<f64>) {
        std::mem::swap(&mut self.current, &mut self.keyframe);
        self.last_keyframe_timestamp = timestamp;
        self.keyframe_orientation = *orientation;
    }

    fn compute_tile_histograms(&mut self, image: &ImageView) {
        resize_nearest_into(image, &mut self.resampled);
        let view = self.resampled.view();
        let bins = self.config.histogram_bins;
        let tile = self.config.tile_size;
        let tiles_x = self.tiles_x;

        self.current
            .par_chunks_mut(bins)
            .enumerate()
            .for_each(|(index, histogram)| {
                histogram.fill(0);
                let (x0, y0) = ((index % tiles_x) * tile, (index / tiles_x) * tile);
                let x1 = (x0 + tile).min(view.width);
                for y in y0..(y0 + tile).min(view.height) {
                    accumulate_histogram(&view.get_row(y)[x0..x1], histogram);
                }
            });
    }

    /// Mean of the clamped per-tile distances to the keyframe.
    fn change_score(&mut self) -> f64 {
        let bins = self.config.histogram_bins;
        let (floor, ceiling) = (self.config.min_histogram_distance, self.config.max_histogram_distance);
        let current = &self.current;
        let keyframe = &self.keyframe;

        self.distances.par_iter_mut().enumerate().for_each(|(index, distance)| {
            let range = index * bins..(index + 1) * bins;
            *distance = histogram_distance(&current[range.clone()], &keyframe[range]);
        });

        let sum: f64 = self
            .distances
            .iter()
            .map(|&d| {
                if d < floor {
                    0.0
                } else if d > ceiling {
                    1.0
                } else {
                    (d - floor) / (ceiling - floor)
                }
            })
            .sum();
        sum / self.distances.len() as f64
    }
}

#[multiversion(targets(
    "x86_64+avx2+bmi1+bmi2+popcnt+lzcnt",
    "x86_64+avx512f+avx512bw+avx512dq+avx512vl",
    "aarch64+neon"
))]
fn accumulate_histogram(values: &[u8], histogram: &mut [u32]) {
    let bins = histogram.len();
    for &v in values {
        histogram[usize::from(v) * bins / 256] += 1;
    }
}

/// Distance between two histograms in `[0, 1]`.
///
/// Both histograms are normalized, then summed over windows of three neighbouring
/// bins so that mass moving into an adjacent bin costs little. The L1 difference of
/// the windowed sums over all interior bins is scaled by its maximum and
/// square-rooted.
#[must_use]
pub fn histogram_distance(a: &[u32], b: &[u32]) -> f64 {
    let count_a: u64 = a.iter().map(|&v| u64::from(v)).sum();
    let count_b: u64 = b.iter().map(|&v| u64::from(v)).sum();
    match (count_a, count_b) {
        (0, 0) => return 0.0,
        (0, _) | (_, 0) => return 1.0,
        _ => {}
    }
    let (scale_a, scale_b) = (1.0 / count_a as f64, 1.0 / count_b as f64);

    let l1: f64 = a
        .windows(3)
        .zip(b.windows(3))
        .map(|(wa, wb)| {
            let sa: u32 = wa.iter().sum();
            let sb: u32 = wb.iter().sum();
            (f64::from(sa) * scale_a - f64::from(sb) * scale_b).abs()
        })
        .sum();
    // Every bin is in at most three windows.
    (l1 / 6.0).clamp(0.0, 1.0).sqrt()
}
