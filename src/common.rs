//! Common types, utilities, and error handling for the clip sampler.
//!
//! This module provides the foundational pieces used throughout the codebase:
//! time-range arithmetic, timecode formatting and the crate-wide error type.

use std::path::PathBuf;

/// Tolerance used when matching persisted times against rebuilt segments
pub const TIME_EPSILON: f64 = 1e-9;

/// Check whether two half-open time ranges `[a_start, a_end)` and
/// `[b_start, b_end)` intersect.
///
/// Ranges that merely touch (`a_end == b_start`) do not overlap, which keeps
/// neighbouring tiles of the same bucket independent.
pub fn ranges_overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> bool {
    a_start < b_end && b_start < a_end
}

/// Compare two times with [`TIME_EPSILON`] tolerance
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= TIME_EPSILON
}

/// Format seconds as an `HH:MM:SS.mmm` timecode
///
/// Negative inputs are clamped to zero.
pub fn seconds_to_time_code(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_seconds = total_millis / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

/// Validate a requested segment duration
pub fn validate_duration(duration: f64) -> Result<()> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(SamplerError::config_error(format!(
            "Segment duration must be positive and finite, got: {}",
            duration
        )));
    }
    Ok(())
}

/// Validate a relative source weight
pub fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(SamplerError::config_error(format!(
            "Source weight must be positive and finite, got: {}",
            weight
        )));
    }
    Ok(())
}

/// All possible errors from the sampling engine
///
/// Construction errors (`FileNotFound`, `ProbeFailed`) are scoped to a single
/// source; sampling errors abort a single `sample` call.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Source file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to probe media duration for {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    #[error("Unable to find a {duration}s segment that passes filters [{filters}]. Try adding more sources or removing some filters (not_is_repeat and not_has_cut are the most likely to cause this)")]
    SegmentNotFound { duration: f64, filters: String },

    #[error("Filter '{name}' has no implementation available in this build")]
    PredicateUnavailable { name: String },

    #[error("Filter '{name}' failed: {reason}")]
    PredicateFailed { name: String, reason: String },

    #[error("No file(s) found for {spec}")]
    NoSourcesFound { spec: String },

    #[error("Invalid glob pattern {pattern}: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl SamplerError {
    /// Create a configuration error with a descriptive message
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Create a probe error for a specific file
    pub fn probe_error(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a predicate evaluation error
    pub fn predicate_error(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PredicateFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error (for unexpected conditions)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether this error only disqualifies a single source during construction
    pub fn is_source_local(&self) -> bool {
        matches!(self, Self::FileNotFound { .. } | Self::ProbeFailed { .. })
    }
}

/// Convenient Result type for sampler operations
pub type Result<T> = std::result::Result<T, SamplerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_overlap() {
        assert!(ranges_overlap(0.0, 2.0, 1.0, 3.0));
        assert!(ranges_overlap(1.0, 3.0, 0.0, 2.0));
        assert!(ranges_overlap(0.0, 4.0, 1.0, 2.0));
        assert!(!ranges_overlap(0.0, 2.0, 2.0, 4.0));
        assert!(!ranges_overlap(2.0, 4.0, 0.0, 2.0));
        assert!(!ranges_overlap(0.0, 1.0, 5.0, 6.0));
    }

    #[test]
    fn test_seconds_to_time_code() {
        assert_eq!(seconds_to_time_code(0.0), "00:00:00.000");
        assert_eq!(seconds_to_time_code(1.5), "00:00:01.500");
        assert_eq!(seconds_to_time_code(3723.25), "01:02:03.250");
        assert_eq!(seconds_to_time_code(-4.0), "00:00:00.000");
    }

    #[test]
    fn test_validate_duration() {
        assert!(validate_duration(0.5).is_ok());
        assert!(validate_duration(0.0).is_err());
        assert!(validate_duration(-1.0).is_err());
        assert!(validate_duration(f64::NAN).is_err());
        assert!(validate_duration(f64::INFINITY).is_err());
    }

    #[test]
    fn test_validate_weight() {
        assert!(validate_weight(1.0).is_ok());
        assert!(validate_weight(0.0).is_err());
        assert!(validate_weight(f64::NAN).is_err());
    }

    #[test]
    fn test_error_types() {
        let error = SamplerError::config_error("bad duration");
        assert!(matches!(error, SamplerError::InvalidConfig { .. }));

        let error = SamplerError::probe_error("a.mp4", "no streams");
        assert!(error.is_source_local());

        let error = SamplerError::predicate_error("has_cut", "decode failed");
        assert!(!error.is_source_local());

        let error = SamplerError::internal_error("Unexpected condition");
        assert!(matches!(error, SamplerError::InternalError { .. }));
    }

    #[test]
    fn test_error_display() {
        let error = SamplerError::FileNotFound {
            path: PathBuf::from("clip.mp4"),
        };
        assert_eq!(error.to_string(), "Source file not found: clip.mp4");

        let error = SamplerError::PredicateUnavailable {
            name: "not_has_text".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Filter 'not_has_text' has no implementation available in this build"
        );
    }
}
