//! Filtered, weighted segment sampling for beat-synchronised video assembly
//!
//! Sources are tiled into fixed-duration segments, segments are checked
//! against named content filters (with cached results), and a request for a
//! duration returns a random passing segment, chosen by source weight, that
//! has never been used before.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rust_clipsampler::{build_sampler, FfprobeProbe, SamplerConfig, SourceSpec};
//!
//! let config = SamplerConfig {
//!     durations: vec![0.5, 1.0],
//!     seed: Some(7),
//!     ..SamplerConfig::default()
//! };
//! let spec = SourceSpec::List(vec!["clips/".into(), SourceSpec::weighted("intro.mp4", 2.0)]);
//!
//! let (mut sampler, skipped) = build_sampler(&spec, config, &FfprobeProbe::default())?;
//! for segment in sampler.sample_events(&[0.5, 1.0, 0.5])? {
//!     println!("{}", segment);
//! }
//! # Ok::<(), rust_clipsampler::SamplerError>(())
//! ```

mod collection;
mod common;
mod filters;
mod resolver;
mod segment;
mod session;
mod source;

#[cfg(feature = "opencv")]
mod content_detector;
#[cfg(feature = "opencv")]
mod video_stream;

// Re-export main types for public API
pub use collection::{SkippedSource, SourceCollection, SourceNode};
pub use common::{
    approx_eq, ranges_overlap, seconds_to_time_code, Result, SamplerError, TIME_EPSILON,
};
pub use filters::{
    describe, FilterRef, FilterRegistry, IsRepeat, Memory, Predicate, DEFAULT_FILTER_ORDER,
    HAS_CUT, HAS_LOW_CONTRAST, HAS_TEXT, IS_REPEAT, NEGATION_PREFIX, NOT_IS_REPEAT,
};
pub use resolver::{Resolver, SourceSpec, SourceTree};
pub use segment::{ClipCommand, ClipSource, FfmpegClips, FilteredSegment, Segment, Verdict};
pub use session::{Sampler, SamplerConfig, SegmentRecord, SessionState, SESSION_VERSION};
pub use source::{Bucket, FfprobeProbe, FilteredSource, MediaProbe};

#[cfg(feature = "opencv")]
pub use content_detector::{
    ComponentWeights, HasCut, HasLowContrast, DEFAULT_CONTRAST_THRESHOLD, DEFAULT_CUT_THRESHOLD,
};
#[cfg(feature = "opencv")]
pub use video_stream::{OpenCvClips, OpenCvProbe, SegmentReader, VideoStream};

use tracing::{info, instrument, warn};

/// Resolve, build and configure a sampler in one call
///
/// Restores the configured session file if it exists and preprocesses when
/// asked to.
///
/// # Arguments
/// * `spec` - Files, directories, globs or nested weighted lists
/// * `config` - Durations, filters, seed and session settings
/// * `probe` - Measures the length of each source file
///
/// # Returns
/// * The sampler and the sources that were skipped while building
///
/// # Errors
/// * `NoSourcesFound` - If a path, glob or directory matches nothing
/// * `PredicateUnavailable` - If a configured filter cannot be evaluated
#[instrument(skip(probe))]
pub fn build_sampler(
    spec: &SourceSpec,
    config: SamplerConfig,
    probe: &dyn MediaProbe,
) -> Result<(Sampler, Vec<SkippedSource>)> {
    let resolver = Resolver::new(&config.durations)?;
    let tree = resolver.resolve(spec)?;
    let (sources, skipped) = SourceCollection::build(&tree, probe)?;
    if sources.source_count() == 0 {
        warn!("No usable sources among {} resolved files", tree.file_count());
    }

    let session = config.session.clone();
    let preprocess = config.preprocess;
    let mut sampler = Sampler::new(sources, FilterRegistry::with_builtins(), config)?;

    if let Some(path) = session.filter(|path| path.is_file()) {
        sampler.restore_session(&path)?;
    }
    if preprocess {
        sampler.preprocess()?;
    }

    Ok((sampler, skipped))
}

/// Initialize tracing for the library
///
/// Call this once at the start of your application to enable log output.
///
/// # Arguments
/// * `level` - Tracing level filter (e.g., "debug", "info", "warn", "error")
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Clip sampler initialized with tracing level: {}", level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn library() -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in ["a.mp4", "b.mp4", "broken.mp4"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        dir
    }

    fn probe(path: &Path) -> Result<f64> {
        if path.ends_with("broken.mp4") {
            return Err(SamplerError::probe_error(path, "no video stream"));
        }
        Ok(4.0)
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            durations: vec![1.0],
            filters: Some(vec![NOT_IS_REPEAT.to_string()]),
            seed: Some(11),
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn test_build_sampler_skips_broken_sources() {
        let dir = library();
        let spec = SourceSpec::from(dir.path().to_str().unwrap());

        let (sampler, skipped) = build_sampler(&spec, config(), &probe).unwrap();
        assert_eq!(sampler.sources().source_count(), 2);
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].path.ends_with("broken.mp4"));
    }

    #[test]
    fn test_build_sampler_requires_durations() {
        let dir = library();
        let spec = SourceSpec::from(dir.path().to_str().unwrap());
        let result = build_sampler(&spec, SamplerConfig::default(), &probe);
        assert!(matches!(result, Err(SamplerError::InvalidConfig { .. })));
    }

    #[test]
    fn test_build_sampler_resumes_session() {
        let dir = library();
        let spec = SourceSpec::from(dir.path().to_str().unwrap());
        let state_dir = TempDir::new().unwrap();
        let session = state_dir.path().join("session.json");
        let config = SamplerConfig {
            session: Some(session.clone()),
            ..config()
        };

        let (mut first, _) = build_sampler(&spec, config.clone(), &probe).unwrap();
        let used = first.sample_events(&[1.0; 4]).unwrap();
        first.save_session(&session).unwrap();

        let (second, _) = build_sampler(&spec, config, &probe).unwrap();
        assert_eq!(second.memory().segments(), used.as_slice());
    }

    #[test]
    fn test_build_sampler_preprocess() {
        let dir = library();
        let spec = SourceSpec::from(dir.path().to_str().unwrap());
        let config = SamplerConfig {
            preprocess: true,
            ..config()
        };

        let (sampler, _) = build_sampler(&spec, config, &probe).unwrap();
        assert!(sampler.rejected_segments().is_empty());
        for (source, _) in sampler.sources().leaves() {
            for segment in source.bucket(1.0).unwrap().segments() {
                assert_eq!(segment.verdict(), Verdict::Unknown);
            }
        }
    }
}
