//! A single source file partitioned into filterable segments
//!
//! Each configured duration gets its own bucket: a tiling of the file into
//! back-to-back windows of exactly that length. Buckets are independent, so
//! the same stretch of video appears once per duration with its own filter
//! cache. Sampling a segment marks everything overlapping it, in every bucket,
//! as a repeat.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, instrument, trace};

use crate::common::{
    approx_eq, validate_duration, validate_weight, Result, SamplerError, TIME_EPSILON,
};
use crate::filters::{describe, FilterRef, Memory};
use crate::segment::{FilteredSegment, Segment};

/// Reports the playable length of a media file in seconds
pub trait MediaProbe: Send + Sync {
    fn duration(&self, path: &Path) -> Result<f64>;
}

impl<F> MediaProbe for F
where
    F: Fn(&Path) -> Result<f64> + Send + Sync,
{
    fn duration(&self, path: &Path) -> Result<f64> {
        self(path)
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Probe backed by the `ffprobe` executable
///
/// The reported length excludes the final frame interval, since seeking to
/// the very end of a stream does not reliably yield a frame.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    /// Fallback frame rate when a stream does not report one
    pub const DEFAULT_FPS: f64 = 24.0;

    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn parse_duration(path: &Path, json: &str) -> Result<f64> {
        let output: FfprobeOutput = serde_json::from_str(json)
            .map_err(|e| SamplerError::probe_error(path, format!("Invalid ffprobe output: {}", e)))?;

        let duration = output
            .format
            .and_then(|format| format.duration)
            .and_then(|duration| duration.parse::<f64>().ok())
            .ok_or_else(|| SamplerError::probe_error(path, "No duration reported"))?;

        let fps = output
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"))
            .and_then(|stream| stream.avg_frame_rate.as_deref())
            .and_then(parse_frame_rate)
            .unwrap_or(Self::DEFAULT_FPS);

        Ok((duration - 1.0 / fps).max(0.0))
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MediaProbe for FfprobeProbe {
    #[instrument(skip(self))]
    fn duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.binary)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .map_err(|e| SamplerError::probe_error(path, format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(SamplerError::probe_error(
                path,
                format!("ffprobe exited with {}", output.status),
            ));
        }

        Self::parse_duration(path, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse an ffprobe rational frame rate such as `30000/1001`
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (numerator, denominator) = rate.split_once('/')?;
    let numerator: f64 = numerator.parse().ok()?;
    let denominator: f64 = denominator.parse().ok()?;
    if numerator <= 0.0 || denominator <= 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

/// All segments of one duration, tiling the file from zero
#[derive(Debug, Clone)]
pub struct Bucket {
    duration: f64,
    segments: Vec<FilteredSegment>,
}

impl Bucket {
    fn tile(file: &Path, length: f64, duration: f64) -> Self {
        // Decimal multiples such as 0.6 / 0.2 land just below an integer
        let count = (length / duration + TIME_EPSILON).floor() as usize;
        let segments = (0..count)
            .map(|i| (i as f64 * duration, (i + 1) as f64 * duration))
            .filter(|&(_, end)| end <= length + TIME_EPSILON)
            .map(|(start, end)| FilteredSegment::new(Segment::new(file, start, end)))
            .collect();

        Self { duration, segments }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn segments(&self) -> &[FilteredSegment] {
        &self.segments
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [FilteredSegment] {
        &mut self.segments
    }
}

/// One source file and its duration buckets
#[derive(Debug, Clone)]
pub struct FilteredSource {
    file: PathBuf,
    length: f64,
    weight: f64,
    buckets: Vec<Bucket>,
}

impl FilteredSource {
    /// Partition a file into one bucket per distinct duration
    ///
    /// # Arguments
    /// * `file` - Source video file
    /// * `durations` - Segment durations this source can answer for
    /// * `probe` - Reports the file's length
    ///
    /// # Errors
    /// * `FileNotFound` - If `file` is missing or not a regular file
    /// * `InvalidConfig` - If a duration is not positive and finite
    /// * `ProbeFailed` - If the file's length cannot be determined
    #[instrument(skip(probe))]
    pub fn new(file: impl AsRef<Path> + fmt::Debug, durations: &[f64], probe: &dyn MediaProbe) -> Result<Self> {
        let file = file.as_ref();
        if !file.is_file() {
            return Err(SamplerError::FileNotFound {
                path: file.to_path_buf(),
            });
        }

        let length = probe.duration(file)?;
        Self::with_length(file, length, durations)
    }

    /// Partition a file whose length is already known
    pub fn with_length(file: impl Into<PathBuf>, length: f64, durations: &[f64]) -> Result<Self> {
        let file = file.into();
        if !length.is_finite() || length < 0.0 {
            return Err(SamplerError::probe_error(
                file,
                format!("Invalid media length: {}", length),
            ));
        }

        let mut unique: Vec<f64> = Vec::with_capacity(durations.len());
        for &duration in durations {
            validate_duration(duration)?;
            if !unique.contains(&duration) {
                unique.push(duration);
            }
        }
        unique.sort_by(|a, b| b.total_cmp(a));

        let buckets: Vec<Bucket> = unique
            .into_iter()
            .map(|duration| Bucket::tile(&file, length, duration))
            .collect();

        debug!(
            "Tiled {} ({:.3}s) into {} buckets, {} segments",
            file.display(),
            length,
            buckets.len(),
            buckets.iter().map(|b| b.segments.len()).sum::<usize>()
        );

        Ok(Self {
            file,
            length,
            weight: 1.0,
            buckets,
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn name(&self) -> String {
        self.file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.to_string_lossy().into_owned())
    }

    /// Probed length in seconds
    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f64) -> Result<()> {
        validate_weight(weight)?;
        self.weight = weight;
        Ok(())
    }

    pub fn with_weight(mut self, weight: f64) -> Result<Self> {
        self.set_weight(weight)?;
        Ok(self)
    }

    /// Configured durations, longest first
    pub fn durations(&self) -> Vec<f64> {
        self.buckets.iter().map(Bucket::duration).collect()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket(&self, duration: f64) -> Option<&Bucket> {
        self.buckets.iter().find(|bucket| bucket.duration == duration)
    }

    pub(crate) fn bucket_mut_approx(&mut self, duration: f64) -> Option<&mut Bucket> {
        self.buckets
            .iter_mut()
            .find(|bucket| approx_eq(bucket.duration, duration))
    }

    fn bucket_mut(&mut self, duration: f64) -> Option<&mut Bucket> {
        self.buckets
            .iter_mut()
            .find(|bucket| bucket.duration == duration)
    }

    /// Evaluate every unresolved filter for every segment in every bucket
    ///
    /// Only fills caches; no segment is rejected or selected.
    #[instrument(skip(self, filters, memory), fields(source = %self.file.display()))]
    pub fn filter_all(&mut self, filters: &[FilterRef], memory: &Memory, parallel: bool) -> Result<()> {
        let segments = self.buckets.iter_mut().flat_map(|bucket| bucket.segments.iter_mut());

        if parallel {
            segments
                .collect::<Vec<_>>()
                .into_par_iter()
                .try_for_each(|segment| segment.evaluate_all(filters, memory))?;
        } else {
            for segment in segments {
                segment.evaluate_all(filters, memory)?;
            }
        }

        trace!("Filtered all segments of {}", self.file.display());
        Ok(())
    }

    fn candidate_indices(&mut self, duration: f64, filters: &[FilterRef], memory: &Memory) -> Result<Vec<usize>> {
        let Some(bucket) = self.bucket_mut(duration) else {
            trace!("{} has no {}s bucket", self.file.display(), duration);
            return Ok(Vec::new());
        };

        let mut indices = Vec::new();
        for (index, segment) in bucket.segments.iter_mut().enumerate() {
            if segment.passes(filters, memory)? {
                indices.push(index);
            }
        }
        Ok(indices)
    }

    /// Segments of the `duration` bucket that currently pass every filter
    ///
    /// Failing segments are rejected permanently as a side effect.
    pub fn candidates(&mut self, duration: f64, filters: &[FilterRef], memory: &Memory) -> Result<Vec<&FilteredSegment>> {
        let indices = self.candidate_indices(duration, filters, memory)?;
        let bucket = match self.bucket(duration) {
            Some(bucket) => bucket,
            None => return Ok(Vec::new()),
        };
        Ok(indices.into_iter().map(|i| &bucket.segments[i]).collect())
    }

    /// Whether at least one segment of `duration` passes `filters`
    pub fn has_candidates(&mut self, duration: f64, filters: &[FilterRef], memory: &Memory) -> Result<bool> {
        Ok(!self.candidate_indices(duration, filters, memory)?.is_empty())
    }

    /// Pick a passing segment uniformly at random and mark its overlaps used
    ///
    /// # Errors
    /// * `SegmentNotFound` - If no segment of `duration` passes; nothing is marked
    #[instrument(skip(self, filters, memory, rng), fields(source = %self.file.display()))]
    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        duration: f64,
        filters: &[FilterRef],
        memory: &Memory,
        rng: &mut R,
    ) -> Result<Segment> {
        let indices = self.candidate_indices(duration, filters, memory)?;
        let index = *indices
            .choose(rng)
            .ok_or_else(|| SamplerError::SegmentNotFound {
                duration,
                filters: describe(filters),
            })?;

        let chosen = match self.bucket_mut(duration) {
            Some(bucket) => {
                let segment = &mut bucket.segments[index];
                segment.mark_repeat();
                segment.segment().clone()
            }
            None => return Err(SamplerError::internal_error("Bucket vanished during sampling")),
        };

        let marked = self.cascade(&chosen);
        debug!(
            "Sampled {} from {} candidates, {} overlapping segments marked",
            chosen,
            indices.len(),
            marked
        );

        Ok(chosen)
    }

    /// Mark every segment overlapping `chosen`, across all buckets, as a repeat
    pub(crate) fn cascade(&mut self, chosen: &Segment) -> usize {
        let mut marked = 0;
        for bucket in &mut self.buckets {
            for segment in bucket.segments.iter_mut().filter(|s| s.overlaps(chosen)) {
                segment.mark_repeat();
                marked += 1;
            }
        }
        marked
    }

    /// Segments that have been rejected
    pub fn rejected_segments(&self) -> Vec<Segment> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.segments.iter())
            .filter(|segment| segment.is_rejected())
            .map(|segment| segment.segment().clone())
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.segments.len()).sum()
    }
}

impl fmt::Display for FilteredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<FilteredSource: {}, length: {:.3}s, weight: {}>",
            self.name(),
            self.length,
            self.weight
        )
    }
}

/// Log a short summary of a freshly built source
pub(crate) fn log_source(source: &FilteredSource) {
    info!(
        "Loaded {} with {} segments over {} durations",
        source,
        source.segment_count(),
        source.buckets.len()
    );
}
