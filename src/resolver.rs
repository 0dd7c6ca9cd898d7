//! Turns path, glob, directory and list specifications into a source tree
//!
//! Resolution only looks at the file system layout. Whether a leaf is a
//! readable video is decided later, when the tree is built into a
//! [`SourceCollection`](crate::SourceCollection).

use std::path::{Path, PathBuf};

use glob::MatchOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::common::{validate_duration, validate_weight, Result, SamplerError};

const GLOB_STAR: char = '*';

/// What the caller asks for
///
/// Accepts arbitrarily nested files, directories, globs and lists. In JSON a
/// string is a path, an array is a list and `{"source": ..., "weight": 2.0}`
/// gives an entry a relative weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Path(String),
    Weighted { source: Box<SourceSpec>, weight: f64 },
    List(Vec<SourceSpec>),
}

impl From<&str> for SourceSpec {
    fn from(path: &str) -> Self {
        SourceSpec::Path(path.to_string())
    }
}

impl SourceSpec {
    pub fn weighted(source: impl Into<SourceSpec>, weight: f64) -> Self {
        SourceSpec::Weighted {
            source: Box::new(source.into()),
            weight,
        }
    }
}

/// The resolved shape a collection is built from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceTree {
    File {
        path: PathBuf,
        durations: Vec<f64>,
        weight: f64,
    },
    Group {
        name: Option<String>,
        weight: f64,
        children: Vec<SourceTree>,
    },
}

impl SourceTree {
    pub fn weight(&self) -> f64 {
        match self {
            SourceTree::File { weight, .. } | SourceTree::Group { weight, .. } => *weight,
        }
    }

    fn with_weight(mut self, new_weight: f64) -> Self {
        match &mut self {
            SourceTree::File { weight, .. } | SourceTree::Group { weight, .. } => {
                *weight = new_weight
            }
        }
        self
    }

    /// Number of file leaves
    pub fn file_count(&self) -> usize {
        match self {
            SourceTree::File { .. } => 1,
            SourceTree::Group { children, .. } => children.iter().map(SourceTree::file_count).sum(),
        }
    }
}

/// Resolves source specifications for a fixed set of durations
#[derive(Debug, Clone)]
pub struct Resolver {
    durations: Vec<f64>,
}

impl Resolver {
    /// # Errors
    /// * `InvalidConfig` - If no durations are given or one is not positive
    pub fn new(durations: &[f64]) -> Result<Self> {
        if durations.is_empty() {
            return Err(SamplerError::config_error("At least one segment duration is required"));
        }
        for &duration in durations {
            validate_duration(duration)?;
        }
        Ok(Self {
            durations: durations.to_vec(),
        })
    }

    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    /// Resolve a top-level specification into a group
    #[instrument(skip(self))]
    pub fn resolve(&self, spec: &SourceSpec) -> Result<SourceTree> {
        let tree = match spec {
            SourceSpec::Path(path) => self.group(Some(stem(path)), self.from_path(path)?),
            SourceSpec::List(items) => self.group(None, self.resolve_list(items)?),
            SourceSpec::Weighted { source, weight } => {
                validate_weight(*weight)?;
                self.resolve(source)?.with_weight(*weight)
            }
        };

        debug!("Resolved {} files", tree.file_count());
        Ok(tree)
    }

    fn resolve_list(&self, items: &[SourceSpec]) -> Result<Vec<SourceTree>> {
        items.iter().map(|item| self.resolve_item(item)).collect()
    }

    fn resolve_item(&self, item: &SourceSpec) -> Result<SourceTree> {
        match item {
            SourceSpec::Path(path) if !is_glob(path) && Path::new(path).is_file() => {
                Ok(self.file(PathBuf::from(path)))
            }
            SourceSpec::Path(path) => Ok(self.group(Some(stem(path)), self.from_path(path)?)),
            SourceSpec::List(items) => Ok(self.group(None, self.resolve_list(items)?)),
            SourceSpec::Weighted { source, weight } => {
                validate_weight(*weight)?;
                Ok(self.resolve_item(source)?.with_weight(*weight))
            }
        }
    }

    fn from_path(&self, path: &str) -> Result<Vec<SourceTree>> {
        let sources = if is_glob(path) {
            self.from_glob(path)?
        } else if Path::new(path).is_dir() {
            self.from_directory(Path::new(path))?
        } else {
            vec![self.file(PathBuf::from(path))]
        };

        if sources.is_empty() {
            return Err(SamplerError::NoSourcesFound {
                spec: path.to_string(),
            });
        }
        Ok(sources)
    }

    fn from_glob(&self, pattern: &str) -> Result<Vec<SourceTree>> {
        let escaped = escape_brackets(pattern);
        let options = MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        };
        let paths = glob::glob_with(&escaped, options).map_err(|e| SamplerError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let mut sources = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| SamplerError::Io(e.into_error()))?;
            if path.is_dir() {
                let children = self.from_directory(&path)?;
                if children.is_empty() {
                    warn!("Glob {} matched empty directory {}", pattern, path.display());
                    continue;
                }
                sources.push(self.group(Some(stem(&path.to_string_lossy())), children));
            } else {
                sources.push(self.file(path));
            }
        }
        Ok(sources)
    }

    /// Files directly inside `directory`, sorted by name, hidden files excluded
    fn from_directory(&self, directory: &Path) -> Result<Vec<SourceTree>> {
        let mut sources = Vec::new();
        let entries = WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for entry in entries {
            let entry = entry.map_err(|e| SamplerError::Io(e.into()))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type().is_file() && !hidden {
                sources.push(self.file(entry.into_path()));
            }
        }
        Ok(sources)
    }

    fn file(&self, path: PathBuf) -> SourceTree {
        SourceTree::File {
            path,
            durations: self.durations.clone(),
            weight: 1.0,
        }
    }

    fn group(&self, name: Option<String>, children: Vec<SourceTree>) -> SourceTree {
        SourceTree::Group {
            name,
            weight: 1.0,
            children,
        }
    }
}

fn is_glob(path: &str) -> bool {
    path.contains(GLOB_STAR)
}

fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Square brackets are common in file names; match them literally
fn escape_brackets(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn library() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        fs::write(dir.path().join("b.mp4"), b"b").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"x").unwrap();
        fs::create_dir(dir.path().join("show")).unwrap();
        fs::write(dir.path().join("show").join("ep1 [1080p].mkv"), b"c").unwrap();
        dir
    }

    fn file_names(tree: &SourceTree) -> Vec<String> {
        match tree {
            SourceTree::File { path, .. } => vec![path.file_name().unwrap().to_string_lossy().into_owned()],
            SourceTree::Group { children, .. } => children.iter().flat_map(file_names).collect(),
        }
    }

    #[test]
    fn test_resolver_requires_durations() {
        assert!(Resolver::new(&[]).is_err());
        assert!(Resolver::new(&[0.5, -1.0]).is_err());
        assert_eq!(Resolver::new(&[0.5]).unwrap().durations(), &[0.5]);
    }

    #[test]
    fn test_resolve_directory() {
        let dir = library();
        let resolver = Resolver::new(&[1.0]).unwrap();
        let spec = SourceSpec::Path(dir.path().to_string_lossy().into_owned());

        let tree = resolver.resolve(&spec).unwrap();
        assert_eq!(file_names(&tree), vec!["a.mp4", "b.mp4"]);
        match &tree {
            SourceTree::Group { name, .. } => assert!(name.is_some()),
            other => panic!("Expected group, got: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_glob_nests_directories() {
        let dir = library();
        let resolver = Resolver::new(&[1.0, 2.0]).unwrap();
        let pattern = format!("{}/*", dir.path().display());

        let tree = resolver.resolve(&SourceSpec::Path(pattern)).unwrap();
        let SourceTree::Group { children, .. } = &tree else {
            panic!("Expected group");
        };
        assert_eq!(children.len(), 3);
        match &children[2] {
            SourceTree::Group { name, children, .. } => {
                assert_eq!(name.as_deref(), Some("show"));
                assert_eq!(file_names(&children[0]), vec!["ep1 [1080p].mkv"]);
            }
            other => panic!("Expected nested group, got: {:?}", other),
        }
        match &children[0] {
            SourceTree::File { durations, .. } => assert_eq!(durations, &vec![1.0, 2.0]),
            other => panic!("Expected file, got: {:?}", other),
        }
    }

    #[test]
    fn test_glob_matches_brackets_literally() {
        let dir = library();
        let resolver = Resolver::new(&[1.0]).unwrap();
        let pattern = format!("{}/show/ep1 [1080p]*", dir.path().display());

        let tree = resolver.resolve(&SourceSpec::Path(pattern)).unwrap();
        assert_eq!(file_names(&tree), vec!["ep1 [1080p].mkv"]);
    }

    #[test]
    fn test_list_inlines_files_and_nests_others() {
        let dir = library();
        let resolver = Resolver::new(&[1.0]).unwrap();
        let a = dir.path().join("a.mp4").to_string_lossy().into_owned();
        let show = dir.path().join("show").to_string_lossy().into_owned();

        let spec = SourceSpec::List(vec![
            SourceSpec::weighted(a.as_str(), 2.0),
            SourceSpec::Path(show),
            SourceSpec::List(vec![SourceSpec::Path(a.clone())]),
        ]);
        let tree = resolver.resolve(&spec).unwrap();
        let SourceTree::Group { name, children, .. } = &tree else {
            panic!("Expected group");
        };
        assert!(name.is_none());
        assert!(matches!(&children[0], SourceTree::File { weight, .. } if *weight == 2.0));
        assert!(matches!(&children[1], SourceTree::Group { name: Some(n), .. } if n == "show"));
        assert!(matches!(&children[2], SourceTree::Group { name: None, .. }));
        assert_eq!(tree.file_count(), 3);
    }

    #[test]
    fn test_missing_path_becomes_leaf() {
        let resolver = Resolver::new(&[1.0]).unwrap();
        let tree = resolver
            .resolve(&SourceSpec::Path("missing/clip.mp4".to_string()))
            .unwrap();
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_empty_glob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(&[1.0]).unwrap();
        let pattern = format!("{}/*.mp4", dir.path().display());

        let result = resolver.resolve(&SourceSpec::Path(pattern));
        assert!(matches!(result, Err(SamplerError::NoSourcesFound { .. })));
    }

    #[test]
    fn test_spec_from_json() {
        let spec: SourceSpec = serde_json::from_str(
            r#"["clips/a.mp4", {"source": "clips/b/*", "weight": 3.0}, ["x.mp4", "y.mp4"]]"#,
        )
        .unwrap();

        assert_eq!(
            spec,
            SourceSpec::List(vec![
                SourceSpec::Path("clips/a.mp4".to_string()),
                SourceSpec::weighted("clips/b/*", 3.0),
                SourceSpec::List(vec!["x.mp4".into(), "y.mp4".into()]),
            ])
        );
    }

    #[test]
    fn test_escape_brackets() {
        assert_eq!(escape_brackets("a[1].mp4"), "a[[]1[]].mp4");
        assert_eq!(escape_brackets("*.mp4"), "*.mp4");
    }
}
