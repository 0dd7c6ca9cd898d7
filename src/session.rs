//! Sampling sessions: configuration, the sampler facade and resumable state
//!
//! A [`Sampler`] owns everything one assembly run needs: the source tree, the
//! filter registry, the default filter set, the memory of used segments and
//! the random number generator. Its state can be written to disk and applied
//! to a freshly built tree to resume a run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::collection::SourceCollection;
use crate::common::{approx_eq, validate_duration, Result, SamplerError};
use crate::filters::{describe, FilterRef, FilterRegistry, Memory};
use crate::segment::{Segment, Verdict};

/// Version written into session files
pub const SESSION_VERSION: u32 = 1;

/// Settings for one sampling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Durations every source is tiled for
    pub durations: Vec<f64>,
    /// Filter names in evaluation order; `None` uses the registry defaults
    pub filters: Option<Vec<String>>,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
    /// Evaluate every filter for every segment before sampling
    pub preprocess: bool,
    /// Evaluate segments in parallel during preprocessing
    pub parallel: bool,
    /// Session file to resume from and save to
    pub session: Option<PathBuf>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            durations: Vec::new(),
            filters: None,
            seed: None,
            preprocess: false,
            parallel: true,
            session: None,
        }
    }
}

impl SamplerConfig {
    /// Load a JSON configuration file
    #[instrument]
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Validate that settings are usable
    pub fn validate(&self) -> Result<()> {
        for &duration in &self.durations {
            validate_duration(duration)?;
        }
        if let Some(filters) = &self.filters {
            if filters.iter().any(|name| name.trim().is_empty()) {
                return Err(SamplerError::config_error("Filter names cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Persisted filter state of one segment, keyed by file, range and bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub file: PathBuf,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub filter_results: BTreeMap<String, bool>,
    pub verdict: Verdict,
}

/// Everything needed to resume a sampling run on a rebuilt source tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub segments: Vec<SegmentRecord>,
    pub memory: Memory,
}

impl SessionState {
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let state: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        if state.version != SESSION_VERSION {
            return Err(SamplerError::config_error(format!(
                "Unsupported session version {} (expected {})",
                state.version, SESSION_VERSION
            )));
        }
        Ok(state)
    }
}

/// Snapshot every segment that carries state beyond its initial seed
pub fn export_state(sources: &SourceCollection, memory: &Memory) -> SessionState {
    let mut segments = Vec::new();
    for (source, _) in sources.leaves() {
        for bucket in source.buckets() {
            for filtered in bucket.segments() {
                let seeded_only = filtered.filter_results().len() == 2
                    && !filtered.is_repeat()
                    && filtered.verdict() == Verdict::Unknown;
                if seeded_only {
                    continue;
                }

                let segment = filtered.segment();
                segments.push(SegmentRecord {
                    file: segment.file().to_path_buf(),
                    start: segment.start(),
                    end: segment.end(),
                    duration: bucket.duration(),
                    filter_results: filtered.filter_results().clone(),
                    verdict: filtered.verdict(),
                });
            }
        }
    }

    SessionState {
        version: SESSION_VERSION,
        segments,
        memory: memory.clone(),
    }
}

/// Apply persisted records to matching segments
///
/// # Returns
/// * Number of records that matched a segment
pub fn apply_state(sources: &mut SourceCollection, state: &SessionState) -> usize {
    let mut leaves = sources.leaves_mut();
    let mut applied = 0;

    for record in &state.segments {
        let matched = leaves
            .iter_mut()
            .find(|(source, _)| source.file() == record.file.as_path())
            .and_then(|(source, _)| source.bucket_mut_approx(record.duration))
            .and_then(|bucket| {
                bucket.segments_mut().iter_mut().find(|filtered| {
                    approx_eq(filtered.segment().start(), record.start)
                        && approx_eq(filtered.segment().end(), record.end)
                })
            });

        match matched {
            Some(filtered) => {
                filtered.restore(&record.filter_results, record.verdict);
                applied += 1;
            }
            None => debug!(
                "No segment for record {} [{}, {}) in {}s bucket",
                record.file.display(),
                record.start,
                record.end,
                record.duration
            ),
        }
    }

    if applied < state.segments.len() {
        warn!(
            "{} of {} session records did not match the current sources",
            state.segments.len() - applied,
            state.segments.len()
        );
    }
    applied
}

/// Mark every segment overlapping a remembered segment as a repeat
///
/// Covers buckets the saved records know nothing about, such as a duration
/// added since the session was written.
///
/// # Returns
/// * Number of segments marked
pub fn replay_memory(sources: &mut SourceCollection, memory: &Memory) -> usize {
    let mut leaves = sources.leaves_mut();
    let mut marked = 0;

    for used in memory.segments() {
        for (source, _) in leaves.iter_mut().filter(|(source, _)| source.file() == used.file()) {
            marked += source.cascade(used);
        }
    }

    debug!("Replayed {} used segments, {} marked", memory.len(), marked);
    marked
}

/// The sampling engine as one object
#[derive(Debug)]
pub struct Sampler {
    sources: SourceCollection,
    registry: FilterRegistry,
    filters: Vec<FilterRef>,
    memory: Memory,
    rng: StdRng,
    config: SamplerConfig,
}

impl Sampler {
    /// Create a sampler over a built source tree
    ///
    /// # Errors
    /// * `PredicateUnavailable` - If a configured filter has no implementation
    /// * `InvalidConfig` - If the configuration does not validate
    #[instrument(skip(sources, registry))]
    pub fn new(sources: SourceCollection, registry: FilterRegistry, config: SamplerConfig) -> Result<Self> {
        config.validate()?;

        let names = match &config.filters {
            Some(names) => names.clone(),
            None => registry.default_filter_names(),
        };
        let filters = registry.resolve(&names)?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            "Sampler ready: {} sources, filters [{}]",
            sources.source_count(),
            describe(&filters)
        );

        Ok(Self {
            sources,
            registry,
            filters,
            memory: Memory::new(),
            rng,
            config,
        })
    }

    pub fn sources(&self) -> &SourceCollection {
        &self.sources
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Default filter set, in evaluation order
    pub fn filters(&self) -> &[FilterRef] {
        &self.filters
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Evaluate the default filters for every segment up front
    pub fn preprocess(&mut self) -> Result<()> {
        self.sources
            .filter_all(&self.filters, &self.memory, self.config.parallel)
    }

    /// Sample one segment with the default filters
    pub fn sample(&mut self, duration: f64) -> Result<Segment> {
        self.sources
            .sample(duration, &self.filters, &mut self.memory, &mut self.rng)
    }

    /// Sample one segment with an explicit filter set
    ///
    /// # Errors
    /// * `PredicateUnavailable` - Before anything is evaluated, if a name is unknown
    pub fn sample_with<S: AsRef<str>>(&mut self, duration: f64, names: &[S]) -> Result<Segment> {
        let filters = self.registry.resolve(names)?;
        self.sources
            .sample(duration, &filters, &mut self.memory, &mut self.rng)
    }

    /// Satisfy an ordered sequence of event durations one at a time
    ///
    /// Stops at the first event that cannot be satisfied.
    #[instrument(skip(self, durations), fields(events = durations.len()))]
    pub fn sample_events(&mut self, durations: &[f64]) -> Result<Vec<Segment>> {
        let mut segments = Vec::with_capacity(durations.len());
        for (index, &duration) in durations.iter().enumerate() {
            let segment = self.sample(duration)?;
            debug!("Event {}/{}: {}", index + 1, durations.len(), segment);
            segments.push(segment);
        }

        info!("Sampled {} segments", segments.len());
        Ok(segments)
    }

    pub fn rejected_segments(&self) -> Vec<Segment> {
        self.sources.rejected_segments()
    }

    pub fn session_state(&self) -> SessionState {
        export_state(&self.sources, &self.memory)
    }

    /// Apply a saved state; the saved memory replaces the current one
    pub fn restore(&mut self, state: &SessionState) -> usize {
        let applied = apply_state(&mut self.sources, state);
        self.memory = state.memory.clone();
        replay_memory(&mut self.sources, &self.memory);
        applied
    }

    pub fn save_session(&self, path: &Path) -> Result<()> {
        let state = self.session_state();
        state.save(path)?;
        info!(
            "Saved session with {} segment records to {}",
            state.segments.len(),
            path.display()
        );
        Ok(())
    }

    pub fn restore_session(&mut self, path: &Path) -> Result<usize> {
        let state = SessionState::load(path)?;
        let applied = self.restore(&state);
        info!(
            "Restored {} segment records and {} used segments from {}",
            applied,
            self.memory.len(),
            path.display()
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SourceNode;
    use crate::filters::{IS_REPEAT, NOT_IS_REPEAT};
    use crate::source::FilteredSource;
    use tempfile::TempDir;

    fn collection() -> SourceCollection {
        let a = FilteredSource::with_length("a.mp4", 6.0, &[1.0, 2.0]).unwrap();
        let b = FilteredSource::with_length("b.mp4", 6.0, &[1.0, 2.0]).unwrap();
        SourceCollection::new(vec![SourceNode::from(a), SourceNode::from(b)])
    }

    fn seeded(seed: u64) -> SamplerConfig {
        SamplerConfig {
            filters: Some(vec![NOT_IS_REPEAT.to_string()]),
            seed: Some(seed),
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: SamplerConfig = serde_json::from_str(r#"{"durations": [0.5]}"#).unwrap();
        assert_eq!(config.durations, vec![0.5]);
        assert_eq!(config.filters, None);
        assert!(config.parallel);
        assert!(!config.preprocess);
    }

    #[test]
    fn test_config_validation() {
        let config = SamplerConfig {
            durations: vec![1.0, -2.0],
            ..SamplerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SamplerConfig {
            filters: Some(vec![" ".to_string()]),
            ..SamplerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unavailable_filter_detected_at_construction() {
        let config = SamplerConfig {
            filters: Some(vec!["not_is_repeat".to_string(), "not_has_text".to_string()]),
            ..SamplerConfig::default()
        };
        let result = Sampler::new(collection(), FilterRegistry::with_builtins(), config);
        assert!(matches!(result, Err(SamplerError::PredicateUnavailable { .. })));
    }

    #[test]
    fn test_default_filters_used() {
        let sampler =
            Sampler::new(collection(), FilterRegistry::with_builtins(), SamplerConfig::default()).unwrap();
        assert_eq!(sampler.filters()[0].name(), NOT_IS_REPEAT);
    }

    #[test]
    fn test_sample_events_never_repeats() {
        let mut sampler = Sampler::new(collection(), FilterRegistry::with_builtins(), seeded(2)).unwrap();
        let segments = sampler.sample_events(&[1.0, 2.0, 1.0, 2.0, 1.0]).unwrap();

        assert_eq!(segments.len(), 5);
        for (i, a) in segments.iter().enumerate() {
            for b in &segments[i + 1..] {
                assert!(!a.overlaps(b), "{} overlaps {}", a, b);
            }
        }
        assert_eq!(sampler.memory().len(), 5);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut first = Sampler::new(collection(), FilterRegistry::with_builtins(), seeded(9)).unwrap();
        let mut second = Sampler::new(collection(), FilterRegistry::with_builtins(), seeded(9)).unwrap();
        let events = [1.0, 1.0, 2.0, 1.0];

        assert_eq!(
            first.sample_events(&events).unwrap(),
            second.sample_events(&events).unwrap()
        );
    }

    #[test]
    fn test_sample_with_unknown_filter() {
        let mut sampler = Sampler::new(collection(), FilterRegistry::with_builtins(), seeded(3)).unwrap();
        let result = sampler.sample_with(1.0, &["not_has_text"]);
        assert!(matches!(result, Err(SamplerError::PredicateUnavailable { .. })));
        assert!(sampler.memory().is_empty());
    }

    #[test]
    fn test_session_roundtrip_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");

        let mut registry = FilterRegistry::with_builtins();
        registry
            .register_fn("late", |segment: &Segment| Ok(segment.start() >= 4.0))
            .unwrap();
        let config = SamplerConfig {
            filters: Some(vec!["not_is_repeat".to_string(), "not_late".to_string()]),
            seed: Some(4),
            ..SamplerConfig::default()
        };

        let mut sampler = Sampler::new(collection(), registry.clone(), config.clone()).unwrap();
        let used = sampler.sample_events(&[2.0, 1.0]).unwrap();
        sampler.save_session(&path).unwrap();

        let mut resumed = Sampler::new(collection(), registry, config).unwrap();
        let applied = resumed.restore_session(&path).unwrap();
        assert_eq!(applied, sampler.session_state().segments.len());
        assert_eq!(resumed.memory().segments(), used.as_slice());
        assert_eq!(resumed.rejected_segments(), sampler.rejected_segments());

        for segment in resumed.sample_events(&[1.0, 1.0]).unwrap() {
            assert!(used.iter().all(|u| !u.overlaps(&segment)));
            assert!(segment.start() < 4.0);
        }
    }

    #[test]
    fn test_resume_with_new_duration_never_repeats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let single = |durations: &[f64]| {
            let a = FilteredSource::with_length("a.mp4", 4.0, durations).unwrap();
            SourceCollection::new(vec![SourceNode::from(a)])
        };

        let mut sampler = Sampler::new(single(&[1.0]), FilterRegistry::with_builtins(), seeded(6)).unwrap();
        let used = sampler.sample_events(&[1.0, 1.0]).unwrap();
        sampler.save_session(&path).unwrap();

        let mut resumed =
            Sampler::new(single(&[1.0, 2.0]), FilterRegistry::with_builtins(), seeded(6)).unwrap();
        resumed.restore_session(&path).unwrap();

        let (a, _) = resumed.sources().leaves()[0];
        for segment in a.bucket(2.0).unwrap().segments() {
            let overlaps_used = used.iter().any(|u| segment.overlaps(u));
            assert_eq!(segment.is_repeat(), overlaps_used, "{}", segment.segment());
        }

        loop {
            match resumed.sample(2.0) {
                Ok(segment) => assert!(used.iter().all(|u| !u.overlaps(&segment)), "{}", segment),
                Err(SamplerError::SegmentNotFound { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn test_replay_memory_marks_only_same_file() {
        let mut sources = collection();
        let mut memory = Memory::new();
        memory.remember(Segment::new("a.mp4", 1.0, 2.0));

        assert_eq!(replay_memory(&mut sources, &memory), 2);
        let leaves = sources.leaves();
        let (a, _) = leaves[0];
        let (b, _) = leaves[1];
        assert!(a.bucket(1.0).unwrap().segments()[1].is_repeat());
        assert!(a.bucket(2.0).unwrap().segments()[0].is_repeat());
        assert!(b.buckets().iter().all(|bucket| bucket.segments().iter().all(|s| !s.is_repeat())));
    }

    #[test]
    fn test_export_skips_untouched_segments() {
        let sampler = Sampler::new(collection(), FilterRegistry::with_builtins(), seeded(5)).unwrap();
        let state = sampler.session_state();
        assert!(state.segments.is_empty());
        assert_eq!(state.version, SESSION_VERSION);
    }

    #[test]
    fn test_apply_state_repeat_flags() {
        let mut sources = collection();
        let mut filter_results = BTreeMap::new();
        filter_results.insert(IS_REPEAT.to_string(), true);
        filter_results.insert(NOT_IS_REPEAT.to_string(), false);
        let state = SessionState {
            version: SESSION_VERSION,
            segments: vec![
                SegmentRecord {
                    file: PathBuf::from("a.mp4"),
                    start: 2.0,
                    end: 4.0,
                    duration: 2.0,
                    filter_results,
                    verdict: Verdict::Unknown,
                },
                SegmentRecord {
                    file: PathBuf::from("gone.mp4"),
                    start: 0.0,
                    end: 1.0,
                    duration: 1.0,
                    filter_results: BTreeMap::new(),
                    verdict: Verdict::Rejected,
                },
            ],
            memory: Memory::new(),
        };

        assert_eq!(apply_state(&mut sources, &state), 1);
        let (a, _) = sources.leaves()[0];
        let bucket = a.bucket(2.0).unwrap();
        assert!(bucket.segments()[1].is_repeat());
        assert!(!bucket.segments()[0].is_repeat());
    }

    #[test]
    fn test_session_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.json");
        fs::write(&path, r#"{"version": 0, "segments": [], "memory": {"used": []}}"#).unwrap();
        assert!(matches!(
            SessionState::load(&path),
            Err(SamplerError::InvalidConfig { .. })
        ));
    }
}
