//! Segments and their per-segment filter state
//!
//! A [`Segment`] is a plain time range inside one source file. It knows nothing
//! about decoding; turning it into something playable goes through a
//! [`ClipSource`]. The mutable filter bookkeeping for a segment lives in
//! [`FilteredSegment`], owned by the source that tiled it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::common::{ranges_overlap, seconds_to_time_code, Result};
use crate::filters::{FilterRef, Memory, IS_REPEAT, NOT_IS_REPEAT};

/// An immutable time range `[start, end)` within one source file
///
/// Only these three fields are ever serialized. Any decoder handle needed to
/// play the segment is rebuilt from them on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    file: PathBuf,
    start: f64,
    end: f64,
}

impl Segment {
    /// Create a new segment
    ///
    /// # Panics
    /// Panics if the range is empty, reversed or starts before zero
    pub fn new(file: impl Into<PathBuf>, start: f64, end: f64) -> Self {
        assert!(start >= 0.0, "Segment start must be non-negative, got: {}", start);
        assert!(end > start, "Segment end ({}) must be after start ({})", end, start);

        Self {
            file: file.into(),
            start,
            end,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// File stem, used for display
    pub fn name(&self) -> String {
        self.file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.to_string_lossy().into_owned())
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn start_time_code(&self) -> String {
        seconds_to_time_code(self.start)
    }

    pub fn end_time_code(&self) -> String {
        seconds_to_time_code(self.end)
    }

    /// Same file and intersecting ranges
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.file == other.file && ranges_overlap(self.start, self.end, other.start, other.end)
    }

    /// Same file and `other` lies entirely within this segment
    pub fn contains(&self, other: &Segment) -> bool {
        self.file == other.file && self.start <= other.start && self.end >= other.end
    }

    /// Turn this segment into a playable clip using the given capability
    pub fn materialize<C: ClipSource>(&self, clips: &C) -> Result<C::Clip> {
        clips.open_clip(self)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} - {}]",
            self.name(),
            self.start_time_code(),
            self.end_time_code()
        )
    }
}

/// Capability that materializes a segment into a playable clip
///
/// Implementations must be able to rebuild the clip from the segment's file
/// and time range alone, without decoding the whole file.
pub trait ClipSource {
    type Clip;

    fn open_clip(&self, segment: &Segment) -> Result<Self::Clip>;
}

/// Builds ffmpeg sub-range extraction commands for segments
#[derive(Debug, Clone)]
pub struct FfmpegClips {
    binary: PathBuf,
}

impl FfmpegClips {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegClips {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl ClipSource for FfmpegClips {
    type Clip = ClipCommand;

    fn open_clip(&self, segment: &Segment) -> Result<ClipCommand> {
        // Input seeking keeps extraction proportional to the segment, not the file
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-ss".to_string(),
            format!("{:.6}", segment.start()),
            "-i".to_string(),
            segment.file().to_string_lossy().into_owned(),
            "-t".to_string(),
            format!("{:.6}", segment.duration()),
        ];

        Ok(ClipCommand {
            program: self.binary.clone(),
            args,
        })
    }
}

/// An ffmpeg invocation extracting one segment; the output path is appended last
#[derive(Debug, Clone, PartialEq)]
pub struct ClipCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ClipCommand {
    pub fn into_command(self, output: &Path) -> Command {
        let mut command = Command::new(self.program);
        command.args(self.args).arg("-y").arg(output);
        command
    }
}

impl fmt::Display for ClipCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Rejection state of a filtered segment
///
/// `Unknown -> Passed | Rejected`, `Passed -> Rejected`, `Rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Unknown,
    Passed,
    Rejected,
}

/// A segment together with its cached filter results and rejection verdict
#[derive(Debug, Clone)]
pub struct FilteredSegment {
    segment: Segment,
    filter_results: BTreeMap<String, bool>,
    verdict: Verdict,
}

impl FilteredSegment {
    pub fn new(segment: Segment) -> Self {
        let mut filter_results = BTreeMap::new();
        filter_results.insert(IS_REPEAT.to_string(), false);
        filter_results.insert(NOT_IS_REPEAT.to_string(), true);

        Self {
            segment,
            filter_results,
            verdict: Verdict::Unknown,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn filter_results(&self) -> &BTreeMap<String, bool> {
        &self.filter_results
    }

    pub fn cached(&self, name: &str) -> Option<bool> {
        self.filter_results.get(name).copied()
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_rejected(&self) -> bool {
        self.verdict == Verdict::Rejected
    }

    pub fn is_repeat(&self) -> bool {
        self.cached(IS_REPEAT).unwrap_or(false)
    }

    pub fn overlaps(&self, segment: &Segment) -> bool {
        self.segment.overlaps(segment)
    }

    /// Result of one filter for this segment, evaluating it at most once
    ///
    /// Both polarities are cached together, so a later request for the
    /// negation never reaches the predicate again.
    pub fn evaluate(&mut self, filter: &FilterRef, memory: &Memory) -> Result<bool> {
        if let Some(result) = self.cached(filter.name()) {
            return Ok(result);
        }

        let result = filter.evaluate(&self.segment, memory)?;
        trace!("{} -> {}={}", self.segment, filter.name(), result);

        self.filter_results.insert(filter.name().to_string(), result);
        self.filter_results
            .insert(filter.negation_name().to_string(), !result);

        Ok(result)
    }

    /// Evaluate every filter without short-circuiting; verdict is untouched
    pub fn evaluate_all(&mut self, filters: &[FilterRef], memory: &Memory) -> Result<()> {
        for filter in filters {
            self.evaluate(filter, memory)?;
        }
        Ok(())
    }

    /// Check filters in order, stopping at the first failure
    ///
    /// A failure rejects the segment permanently. A full pass moves an
    /// `Unknown` segment to `Passed`.
    pub fn passes(&mut self, filters: &[FilterRef], memory: &Memory) -> Result<bool> {
        if self.is_rejected() {
            return Ok(false);
        }

        for filter in filters {
            if !self.evaluate(filter, memory)? {
                trace!("{} rejected by {}", self.segment, filter.name());
                self.verdict = Verdict::Rejected;
                return Ok(false);
            }
        }

        if self.verdict == Verdict::Unknown {
            self.verdict = Verdict::Passed;
        }
        Ok(true)
    }

    /// Flip the repeat pair to "used". Never touches the verdict.
    pub fn mark_repeat(&mut self) {
        self.filter_results.insert(IS_REPEAT.to_string(), true);
        self.filter_results.insert(NOT_IS_REPEAT.to_string(), false);
    }

    /// Reapply persisted state. Repeat flags only move towards "used" and a
    /// rejection is never undone.
    pub(crate) fn restore(&mut self, filter_results: &BTreeMap<String, bool>, verdict: Verdict) {
        for (name, &result) in filter_results {
            if name == IS_REPEAT || name == NOT_IS_REPEAT {
                continue;
            }
            self.filter_results.entry(name.clone()).or_insert(result);
        }
        if filter_results.get(IS_REPEAT).copied().unwrap_or(false) {
            self.mark_repeat();
        }

        self.verdict = match (self.verdict, verdict) {
            (Verdict::Rejected, _) | (_, Verdict::Rejected) => Verdict::Rejected,
            (Verdict::Passed, _) | (_, Verdict::Passed) => Verdict::Passed,
            _ => Verdict::Unknown,
        };
    }
}
