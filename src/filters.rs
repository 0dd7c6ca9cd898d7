//! Named content filters and their registry
//!
//! Every predicate is registered under a base name (`has_cut`) and is
//! automatically usable through its negation (`not_has_cut`). Resolving a list
//! of names yields an ordered filter set; evaluation order is the caller's,
//! so cheap filters should come first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::common::{Result, SamplerError};
use crate::segment::Segment;

/// Prefix that turns a predicate name into its negation
pub const NEGATION_PREFIX: &str = "not_";

/// Reserved repeat pair, seeded on every segment and flipped by the cascade
pub const IS_REPEAT: &str = "is_repeat";
pub const NOT_IS_REPEAT: &str = "not_is_repeat";

pub const HAS_TEXT: &str = "has_text";
pub const HAS_CUT: &str = "has_cut";
pub const HAS_LOW_CONTRAST: &str = "has_low_contrast";

/// Default filter order, cheapest first
pub const DEFAULT_FILTER_ORDER: [&str; 4] = [
    "not_is_repeat",
    "not_has_low_contrast",
    "not_has_text",
    "not_has_cut",
];

/// Segments already consumed during the current session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    used: Vec<Segment>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, segment: Segment) {
        self.used.push(segment);
    }

    /// Whether `segment` overlaps anything already used
    pub fn overlaps_any(&self, segment: &Segment) -> bool {
        self.used.iter().any(|used| used.overlaps(segment))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.used
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// A boolean test over a segment
///
/// Implementations must return the same answer for the same file and time
/// range; results are cached permanently.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, segment: &Segment, memory: &Memory) -> Result<bool>;
}

struct FnPredicate<F>(F);

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Segment) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, segment: &Segment, _memory: &Memory) -> Result<bool> {
        (self.0)(segment)
    }
}

struct ContextFnPredicate<F>(F);

impl<F> Predicate for ContextFnPredicate<F>
where
    F: Fn(&Segment, &Memory) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, segment: &Segment, memory: &Memory) -> Result<bool> {
        (self.0)(segment, memory)
    }
}

/// Segment overlaps a segment that was already used
#[derive(Debug, Clone, Copy, Default)]
pub struct IsRepeat;

impl Predicate for IsRepeat {
    fn evaluate(&self, segment: &Segment, memory: &Memory) -> Result<bool> {
        Ok(memory.overlaps_any(segment))
    }
}

/// One resolved entry of a filter set
#[derive(Clone)]
pub struct FilterRef {
    name: String,
    negation_name: String,
    negated: bool,
    predicate: Arc<dyn Predicate>,
}

impl FilterRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the opposite polarity
    pub fn negation_name(&self) -> &str {
        &self.negation_name
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Run the underlying predicate once and apply this entry's polarity
    pub fn evaluate(&self, segment: &Segment, memory: &Memory) -> Result<bool> {
        let raw = self.predicate.evaluate(segment, memory)?;
        Ok(if self.negated { !raw } else { raw })
    }
}

impl fmt::Debug for FilterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRef")
            .field("name", &self.name)
            .field("negated", &self.negated)
            .finish()
    }
}

/// Comma-separated names of a filter set, for messages
pub fn describe(filters: &[FilterRef]) -> String {
    filters
        .iter()
        .map(FilterRef::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps filter names to predicate implementations
#[derive(Clone, Default)]
pub struct FilterRegistry {
    predicates: BTreeMap<String, Arc<dyn Predicate>>,
}

impl FilterRegistry {
    /// Empty registry, not even `is_repeat`
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every predicate this build can provide
    #[instrument]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .predicates
            .insert(IS_REPEAT.to_string(), Arc::new(IsRepeat));

        #[cfg(feature = "opencv")]
        {
            if let Err(e) = crate::content_detector::register_detectors(&mut registry) {
                warn!("Frame detectors unavailable: {}", e);
            }
        }

        debug!("Built-in filters: {:?}", registry.base_names());
        registry
    }

    /// Register a predicate under its base name
    ///
    /// # Errors
    /// * `InvalidConfig` - If the name is empty, starts with `not_`, or is taken
    pub fn register(&mut self, name: &str, predicate: Arc<dyn Predicate>) -> Result<()> {
        if name.is_empty() {
            return Err(SamplerError::config_error("Filter name cannot be empty"));
        }
        if name.starts_with(NEGATION_PREFIX) {
            return Err(SamplerError::config_error(format!(
                "Filter '{}' must be registered by its positive name; '{}' is derived",
                name, NEGATION_PREFIX
            )));
        }
        if self.predicates.contains_key(name) {
            return Err(SamplerError::config_error(format!(
                "Filter '{}' is already registered",
                name
            )));
        }

        debug!("Registered filter: {}", name);
        self.predicates.insert(name.to_string(), predicate);
        Ok(())
    }

    /// Register a plain `(Segment) -> bool` predicate
    pub fn register_fn<F>(&mut self, name: &str, predicate: F) -> Result<()>
    where
        F: Fn(&Segment) -> Result<bool> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnPredicate(predicate)))
    }

    /// Register a predicate that also sees the used-segment memory
    pub fn register_context_fn<F>(&mut self, name: &str, predicate: F) -> Result<()>
    where
        F: Fn(&Segment, &Memory) -> Result<bool> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(ContextFnPredicate(predicate)))
    }

    /// Whether `name` (either polarity) has an implementation
    pub fn is_available(&self, name: &str) -> bool {
        self.split(name).is_some()
    }

    /// Registered positive names
    pub fn base_names(&self) -> Vec<&str> {
        self.predicates.keys().map(String::as_str).collect()
    }

    /// Resolve names into an ordered filter set
    ///
    /// # Errors
    /// * `PredicateUnavailable` - For the first name with no implementation
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<FilterRef>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let (base, negated) =
                    self.split(name)
                        .ok_or_else(|| SamplerError::PredicateUnavailable {
                            name: name.to_string(),
                        })?;
                let predicate = Arc::clone(&self.predicates[base]);
                let negation_name = if negated {
                    base.to_string()
                } else {
                    format!("{}{}", NEGATION_PREFIX, base)
                };

                Ok(FilterRef {
                    name: name.to_string(),
                    negation_name,
                    negated,
                    predicate,
                })
            })
            .collect()
    }

    /// The default filter order minus anything this build cannot evaluate
    pub fn default_filter_names(&self) -> Vec<String> {
        DEFAULT_FILTER_ORDER
            .iter()
            .filter(|name| {
                let available = self.is_available(name);
                if !available {
                    warn!("Default filter '{}' is unavailable and will be skipped", name);
                }
                available
            })
            .map(|name| name.to_string())
            .collect()
    }

    fn split<'a>(&self, name: &'a str) -> Option<(&'a str, bool)> {
        if self.predicates.contains_key(name) {
            return Some((name, false));
        }
        name.strip_prefix(NEGATION_PREFIX)
            .filter(|base| self.predicates.contains_key(*base))
            .map(|base| (base, true))
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.base_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_include_is_repeat() {
        let registry = FilterRegistry::with_builtins();
        assert!(registry.is_available(IS_REPEAT));
        assert!(registry.is_available(NOT_IS_REPEAT));
        assert!(!registry.is_available(HAS_TEXT));
        assert!(!registry.is_available("not_has_text"));
    }

    #[test]
    fn test_resolve_keeps_caller_order() {
        let mut registry = FilterRegistry::with_builtins();
        registry.register_fn("has_text", |_| Ok(false)).unwrap();

        let filters = registry
            .resolve(&["not_has_text", "not_is_repeat", "has_text"])
            .unwrap();
        let names: Vec<&str> = filters.iter().map(FilterRef::name).collect();
        assert_eq!(names, vec!["not_has_text", "not_is_repeat", "has_text"]);

        assert!(filters[0].is_negated());
        assert_eq!(filters[0].negation_name(), "has_text");
        assert!(!filters[2].is_negated());
        assert_eq!(filters[2].negation_name(), "not_has_text");
        assert_eq!(describe(&filters), "not_has_text, not_is_repeat, has_text");
    }

    #[test]
    fn test_resolve_unknown_filter() {
        let registry = FilterRegistry::with_builtins();
        let error = registry.resolve(&["not_is_repeat", "not_has_text"]).unwrap_err();
        match error {
            SamplerError::PredicateUnavailable { name } => assert_eq!(name, "not_has_text"),
            other => panic!("Expected PredicateUnavailable, got: {:?}", other),
        }
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut registry = FilterRegistry::new();
        assert!(registry.register_fn("", |_| Ok(true)).is_err());
        assert!(registry.register_fn("not_dark", |_| Ok(true)).is_err());
        registry.register_fn("dark", |_| Ok(true)).unwrap();
        assert!(registry.register_fn("dark", |_| Ok(false)).is_err());
    }

    #[test]
    fn test_negation_inverts_result() {
        let mut registry = FilterRegistry::new();
        registry.register_fn("has_cut", |_| Ok(true)).unwrap();
        let filters = registry.resolve(&["has_cut", "not_has_cut"]).unwrap();
        let segment = Segment::new("a.mp4", 0.0, 1.0);
        let memory = Memory::new();

        assert!(filters[0].evaluate(&segment, &memory).unwrap());
        assert!(!filters[1].evaluate(&segment, &memory).unwrap());
    }

    #[test]
    fn test_is_repeat_uses_memory() {
        let registry = FilterRegistry::with_builtins();
        let filters = registry.resolve(&[IS_REPEAT]).unwrap();
        let mut memory = Memory::new();
        let segment = Segment::new("a.mp4", 1.0, 2.0);

        assert!(!filters[0].evaluate(&segment, &memory).unwrap());
        memory.remember(Segment::new("a.mp4", 1.5, 2.5));
        assert!(filters[0].evaluate(&segment, &memory).unwrap());
        assert!(!filters[0]
            .evaluate(&Segment::new("b.mp4", 1.0, 2.0), &memory)
            .unwrap());
    }

    #[test]
    fn test_context_predicate_sees_memory() {
        let mut registry = FilterRegistry::new();
        registry
            .register_context_fn("after_three", |_segment, memory| Ok(memory.len() >= 3))
            .unwrap();
        let filters = registry.resolve(&["after_three"]).unwrap();
        let segment = Segment::new("a.mp4", 0.0, 1.0);

        let mut memory = Memory::new();
        assert!(!filters[0].evaluate(&segment, &memory).unwrap());
        for i in 0..3 {
            memory.remember(Segment::new("b.mp4", i as f64, i as f64 + 1.0));
        }
        assert!(filters[0].evaluate(&segment, &memory).unwrap());
    }

    #[test]
    fn test_default_filter_names_skip_unavailable() {
        let registry = FilterRegistry::with_builtins();
        let names = registry.default_filter_names();
        assert_eq!(names[0], NOT_IS_REPEAT);
        assert!(!names.iter().any(|name| name == "not_has_text"));

        let mut registry = FilterRegistry::with_builtins();
        registry.register_fn(HAS_TEXT, |_| Ok(false)).unwrap();
        assert!(registry
            .default_filter_names()
            .iter()
            .any(|name| name == "not_has_text"));
    }
}
