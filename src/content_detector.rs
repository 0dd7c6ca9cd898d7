//! Frame-based content filters: scene cuts and low contrast
//!
//! `has_cut` compares consecutive frames of a segment in HSV color space and
//! reports a cut when the weighted mean pixel distance reaches a threshold.
//! `has_low_contrast` measures the luma spread of a few sample frames.

use std::sync::Arc;

use opencv::{
    core::{self, Mat, Vector},
    imgproc,
    prelude::*,
};
use tracing::{debug, instrument, trace};

use crate::common::{Result, SamplerError};
use crate::filters::{FilterRegistry, Memory, Predicate, HAS_CUT, HAS_LOW_CONTRAST};
use crate::segment::Segment;
use crate::video_stream::{SegmentReader, VideoStream};

/// Default content score at which two frames are considered a cut
pub const DEFAULT_CUT_THRESHOLD: f64 = 27.0;

/// Default luma standard deviation below which a frame is low contrast
pub const DEFAULT_CONTRAST_THRESHOLD: f64 = 20.0;

/// Component weights for frame score calculation
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentWeights {
    pub delta_hue: f64,
    pub delta_sat: f64,
    pub delta_lum: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            delta_hue: 1.0,
            delta_sat: 1.0,
            delta_lum: 1.0,
        }
    }
}

impl ComponentWeights {
    /// Weights for brightness changes only
    pub fn luma_only() -> Self {
        Self {
            delta_hue: 0.0,
            delta_sat: 0.0,
            delta_lum: 1.0,
        }
    }

    /// Get the sum of absolute weights (for normalization)
    pub fn sum_abs(&self) -> f64 {
        self.delta_hue.abs() + self.delta_sat.abs() + self.delta_lum.abs()
    }

    fn validate(&self) -> Result<()> {
        if self.sum_abs() <= 0.0 {
            return Err(SamplerError::config_error(
                "All component weights cannot be zero",
            ));
        }
        Ok(())
    }
}

/// HSV channels of one frame
#[derive(Debug)]
struct FrameData {
    hue: Mat,
    sat: Mat,
    lum: Mat,
}

impl FrameData {
    fn from_bgr_frame(frame: &Mat) -> Result<Self> {
        let mut hsv = Mat::default();
        imgproc::cvt_color_def(frame, &mut hsv, imgproc::COLOR_BGR2HSV)?;

        let mut channels = Vector::<Mat>::new();
        core::split(&hsv, &mut channels)?;

        if channels.len() != 3 {
            return Err(SamplerError::internal_error(format!(
                "Expected 3 HSV channels, got {}",
                channels.len()
            )));
        }

        Ok(Self {
            hue: channels.get(0)?,
            sat: channels.get(1)?,
            lum: channels.get(2)?,
        })
    }
}

/// Mean absolute difference between two single-channel images
fn mean_pixel_distance(left: &Mat, right: &Mat) -> Result<f64> {
    let left_size = left.size()?;
    let right_size = right.size()?;
    if left_size != right_size {
        return Err(SamplerError::internal_error(format!(
            "Image size mismatch: left={:?}, right={:?}",
            left_size, right_size
        )));
    }

    let mut diff = Mat::default();
    core::absdiff(left, right, &mut diff)?;
    let sum = core::sum_elems(&diff)?;

    let num_pixels = (left.rows() * left.cols()) as f64;
    Ok(sum[0] / num_pixels)
}

/// Weighted content score between two consecutive frames
fn frame_score(previous: &FrameData, current: &FrameData, weights: &ComponentWeights) -> Result<f64> {
    let delta_hue = mean_pixel_distance(&current.hue, &previous.hue)?;
    let delta_sat = mean_pixel_distance(&current.sat, &previous.sat)?;
    let delta_lum = mean_pixel_distance(&current.lum, &previous.lum)?;

    let weighted_sum = delta_hue * weights.delta_hue
        + delta_sat * weights.delta_sat
        + delta_lum * weights.delta_lum;
    let score = weighted_sum / weights.sum_abs();

    trace!(
        "components: hue={:.3}, sat={:.3}, lum={:.3}, final={:.3}",
        delta_hue,
        delta_sat,
        delta_lum,
        score
    );
    Ok(score)
}

/// Luma standard deviation of a BGR frame
fn luma_std_dev(frame: &Mat) -> Result<f64> {
    let mut gray = Mat::default();
    imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?;

    let mut mean = Mat::default();
    let mut std_dev = Mat::default();
    core::mean_std_dev_def(&gray, &mut mean, &mut std_dev)?;
    Ok(*std_dev.at::<f64>(0)?)
}

/// Detects scene changes between consecutive frames of a segment
#[derive(Debug, Clone)]
pub struct HasCut {
    threshold: f64,
    weights: ComponentWeights,
}

impl HasCut {
    /// # Panics
    /// Panics if threshold is negative
    pub fn new(threshold: f64) -> Self {
        assert!(threshold >= 0.0, "Threshold must be non-negative, got: {}", threshold);
        Self {
            threshold,
            weights: ComponentWeights::default(),
        }
    }

    pub fn with_weights(threshold: f64, weights: ComponentWeights) -> Result<Self> {
        assert!(threshold >= 0.0, "Threshold must be non-negative, got: {}", threshold);
        weights.validate()?;
        Ok(Self { threshold, weights })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn weights(&self) -> &ComponentWeights {
        &self.weights
    }

    /// Whether any pair of consecutive frames scores at or above the threshold
    pub fn detect(&self, frames: impl IntoIterator<Item = Result<Mat>>) -> Result<bool> {
        let mut previous: Option<FrameData> = None;
        for (index, frame) in frames.into_iter().enumerate() {
            let current = FrameData::from_bgr_frame(&frame?)?;
            if let Some(previous) = &previous {
                let score = frame_score(previous, &current, &self.weights)?;
                if score >= self.threshold {
                    debug!("Cut at frame {} (score {:.3} >= {})", index, score, self.threshold);
                    return Ok(true);
                }
            }
            previous = Some(current);
        }
        Ok(false)
    }
}

impl Default for HasCut {
    fn default() -> Self {
        Self::new(DEFAULT_CUT_THRESHOLD)
    }
}

impl Predicate for HasCut {
    #[instrument(skip(self, segment, _memory), fields(segment = %segment))]
    fn evaluate(&self, segment: &Segment, _memory: &Memory) -> Result<bool> {
        let mut reader = SegmentReader::open(segment)?;
        self.detect(std::iter::from_fn(|| reader.next_frame().transpose()))
    }
}

/// Detects segments whose sample frames are nearly uniform
#[derive(Debug, Clone)]
pub struct HasLowContrast {
    threshold: f64,
}

impl HasLowContrast {
    /// # Panics
    /// Panics if threshold is negative
    pub fn new(threshold: f64) -> Self {
        assert!(threshold >= 0.0, "Threshold must be non-negative, got: {}", threshold);
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether every given frame has a luma spread below the threshold
    pub fn detect(&self, frames: &[Mat]) -> Result<bool> {
        if frames.is_empty() {
            return Ok(false);
        }
        for frame in frames {
            let spread = luma_std_dev(frame)?;
            trace!("luma std dev {:.3} (threshold {})", spread, self.threshold);
            if spread >= self.threshold {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Default for HasLowContrast {
    fn default() -> Self {
        Self::new(DEFAULT_CONTRAST_THRESHOLD)
    }
}

impl Predicate for HasLowContrast {
    #[instrument(skip(self, segment, _memory), fields(segment = %segment))]
    fn evaluate(&self, segment: &Segment, _memory: &Memory) -> Result<bool> {
        let mut stream = VideoStream::open(segment.file())?;
        let last = (segment.end() - 1.0 / stream.fps()).max(segment.start());
        let middle = segment.start() + (last - segment.start()) / 2.0;

        let mut frames = Vec::with_capacity(3);
        for time in [segment.start(), middle, last] {
            stream.seek(time)?;
            if let Some(frame) = stream.read_frame()? {
                frames.push(frame);
            }
        }
        self.detect(&frames)
    }
}

/// Register the frame-based detectors with default thresholds
///
/// # Errors
/// * `InvalidConfig` - If a detector name is already taken
pub(crate) fn register_detectors(registry: &mut FilterRegistry) -> Result<()> {
    let detectors: [(&str, Arc<dyn Predicate>); 2] = [
        (HAS_CUT, Arc::new(HasCut::default())),
        (HAS_LOW_CONTRAST, Arc::new(HasLowContrast::default())),
    ];
    for (name, predicate) in detectors {
        registry.register(name, predicate)?;
    }
    Ok(())
}
