//! Weighted, nested collections of filtered sources
//!
//! A collection mirrors the tree the resolver discovered: files under
//! directories under globs under explicit lists. Sampling is two-level: pick
//! an eligible leaf with probability proportional to its effective weight,
//! then let that leaf pick a segment.

use std::fmt;
use std::path::PathBuf;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::common::{validate_weight, Result, SamplerError};
use crate::filters::{describe, FilterRef, Memory};
use crate::resolver::SourceTree;
use crate::segment::Segment;
use crate::source::{log_source, FilteredSource, MediaProbe};

/// A child of a collection
#[derive(Debug, Clone)]
pub enum SourceNode {
    Source(FilteredSource),
    Collection(SourceCollection),
}

impl SourceNode {
    pub fn weight(&self) -> f64 {
        match self {
            SourceNode::Source(source) => source.weight(),
            SourceNode::Collection(collection) => collection.weight(),
        }
    }
}

impl From<FilteredSource> for SourceNode {
    fn from(source: FilteredSource) -> Self {
        SourceNode::Source(source)
    }
}

impl From<SourceCollection> for SourceNode {
    fn from(collection: SourceCollection) -> Self {
        SourceNode::Collection(collection)
    }
}

/// A leaf that could not be built and was left out of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: String,
}

/// An ordered, weighted group of sources and sub-collections
#[derive(Debug, Clone)]
pub struct SourceCollection {
    name: Option<String>,
    weight: f64,
    children: Vec<SourceNode>,
}

impl SourceCollection {
    pub fn new(children: Vec<SourceNode>) -> Self {
        Self {
            name: None,
            weight: 1.0,
            children,
        }
    }

    pub fn named(name: impl Into<String>, children: Vec<SourceNode>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(children)
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Result<Self> {
        validate_weight(weight)?;
        self.weight = weight;
        Ok(self)
    }

    /// Build a collection from a resolved source tree
    ///
    /// Leaves whose file is missing or cannot be probed are left out and
    /// reported; every other error aborts the build.
    ///
    /// # Returns
    /// * The collection and the list of skipped leaves
    #[instrument(skip(tree, probe))]
    pub fn build(tree: &SourceTree, probe: &dyn MediaProbe) -> Result<(Self, Vec<SkippedSource>)> {
        let mut skipped = Vec::new();
        let collection = match Self::build_node(tree, probe, &mut skipped)? {
            Some(SourceNode::Collection(collection)) => collection,
            Some(SourceNode::Source(source)) => Self::new(vec![SourceNode::Source(source)]),
            None => Self::new(Vec::new()),
        };

        info!(
            "Built source tree: {} sources, {} skipped",
            collection.source_count(),
            skipped.len()
        );
        Ok((collection, skipped))
    }

    fn build_node(
        tree: &SourceTree,
        probe: &dyn MediaProbe,
        skipped: &mut Vec<SkippedSource>,
    ) -> Result<Option<SourceNode>> {
        match tree {
            SourceTree::File {
                path,
                durations,
                weight,
            } => match FilteredSource::new(path, durations, probe)
                .and_then(|source| source.with_weight(*weight))
            {
                Ok(source) => {
                    log_source(&source);
                    Ok(Some(SourceNode::Source(source)))
                }
                Err(e) if e.is_source_local() => {
                    warn!("Skipping source {}: {}", path.display(), e);
                    skipped.push(SkippedSource {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            SourceTree::Group {
                name,
                weight,
                children,
            } => {
                let mut nodes = Vec::with_capacity(children.len());
                for child in children {
                    if let Some(node) = Self::build_node(child, probe, skipped)? {
                        nodes.push(node);
                    }
                }
                let collection = Self {
                    name: name.clone(),
                    weight: 1.0,
                    children: nodes,
                }
                .with_weight(*weight)?;
                Ok(Some(SourceNode::Collection(collection)))
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn children(&self) -> &[SourceNode] {
        &self.children
    }

    pub fn push(&mut self, node: impl Into<SourceNode>) {
        self.children.push(node.into());
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of leaves in the whole tree
    pub fn source_count(&self) -> usize {
        self.leaves().len()
    }

    /// Every leaf in tree order with its effective weight
    ///
    /// The effective weight is the product of the weights on the path from
    /// this collection's children down to the leaf.
    pub fn leaves(&self) -> Vec<(&FilteredSource, f64)> {
        let mut leaves = Vec::new();
        self.collect_leaves(1.0, &mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, factor: f64, out: &mut Vec<(&'a FilteredSource, f64)>) {
        for child in &self.children {
            match child {
                SourceNode::Source(source) => out.push((source, factor * source.weight())),
                SourceNode::Collection(collection) => {
                    collection.collect_leaves(factor * collection.weight, out)
                }
            }
        }
    }

    pub(crate) fn leaves_mut(&mut self) -> Vec<(&mut FilteredSource, f64)> {
        let mut leaves = Vec::new();
        self.collect_leaves_mut(1.0, &mut leaves);
        leaves
    }

    fn collect_leaves_mut<'a>(&'a mut self, factor: f64, out: &mut Vec<(&'a mut FilteredSource, f64)>) {
        for child in &mut self.children {
            match child {
                SourceNode::Source(source) => {
                    let weight = factor * source.weight();
                    out.push((source, weight));
                }
                SourceNode::Collection(collection) => {
                    let factor = factor * collection.weight;
                    collection.collect_leaves_mut(factor, out);
                }
            }
        }
    }

    /// Eagerly evaluate `filters` for every segment of every leaf
    #[instrument(skip(self, filters, memory))]
    pub fn filter_all(&mut self, filters: &[FilterRef], memory: &Memory, parallel: bool) -> Result<()> {
        let mut leaves = self.leaves_mut();
        let total = leaves.len();
        info!("Filtering {} sources with [{}]", total, describe(filters));

        for (done, (source, _)) in leaves.iter_mut().enumerate() {
            source.filter_all(filters, memory, parallel)?;
            debug!("Filtered {}/{} sources ({})", done + 1, total, source.name());
        }
        Ok(())
    }

    fn eligible_indices(
        leaves: &mut [(&mut FilteredSource, f64)],
        duration: f64,
        filters: &[FilterRef],
        memory: &Memory,
    ) -> Result<Vec<(usize, f64)>> {
        let mut eligible = Vec::new();
        for (index, (source, weight)) in leaves.iter_mut().enumerate() {
            if source.has_candidates(duration, filters, memory)? {
                eligible.push((index, *weight));
            }
        }
        Ok(eligible)
    }

    /// Leaves with at least one candidate for `duration`, with their weights
    pub fn eligible_sources(
        &mut self,
        duration: f64,
        filters: &[FilterRef],
        memory: &Memory,
    ) -> Result<Vec<(&FilteredSource, f64)>> {
        let eligible = {
            let mut leaves = self.leaves_mut();
            Self::eligible_indices(&mut leaves, duration, filters, memory)?
        };

        let leaves = self.leaves();
        Ok(eligible.into_iter().map(|(index, _)| leaves[index]).collect())
    }

    /// Pick an eligible leaf by weight, sample a segment from it and remember it
    ///
    /// # Errors
    /// * `SegmentNotFound` - If no leaf has a candidate; nothing is marked
    #[instrument(skip(self, filters, memory, rng))]
    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        duration: f64,
        filters: &[FilterRef],
        memory: &mut Memory,
        rng: &mut R,
    ) -> Result<Segment> {
        let mut leaves = self.leaves_mut();
        let eligible = Self::eligible_indices(&mut leaves, duration, filters, memory)?;

        if eligible.is_empty() {
            return Err(SamplerError::SegmentNotFound {
                duration,
                filters: describe(filters),
            });
        }

        let distribution = WeightedIndex::new(eligible.iter().map(|&(_, weight)| weight))
            .map_err(|e| SamplerError::internal_error(format!("Invalid source weights: {}", e)))?;
        let (index, weight) = eligible[distribution.sample(rng)];

        let (source, _) = &mut leaves[index];
        debug!(
            "Selected {} (weight {:.3}) among {} eligible sources",
            source.name(),
            weight,
            eligible.len()
        );

        let segment = source.sample(duration, filters, memory, rng)?;
        memory.remember(segment.clone());
        Ok(segment)
    }

    /// Rejected segments of every leaf, in tree order
    pub fn rejected_segments(&self) -> Vec<Segment> {
        self.leaves()
            .into_iter()
            .flat_map(|(source, _)| source.rejected_segments())
            .collect()
    }
}

impl fmt::Display for SourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(
                f,
                "<SourceCollection ({}): {}, weight: {}>",
                self.children.len(),
                name,
                self.weight
            ),
            None => write!(
                f,
                "<SourceCollection ({}), weight: {}>",
                self.children.len(),
                self.weight
            ),
        }
    }
}
