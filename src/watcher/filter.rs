//! Ignore-pattern filtering with gitignore syntax.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::Result;

/// Patterns ignored unless configured otherwise.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "*.tmp",
    "*.swp",
    "*.swo",
    "*~",
    ".git",
    "__pycache__",
    "*.pyc",
    ".DS_Store",
    "Thumbs.db",
];

fn build(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| crate::Error::config(format!("invalid pattern '{pattern}': {e}")))?;
    }
    builder
        .build()
        .map_err(|e| crate::Error::config(format!("failed to build ignore matcher: {e}")))
}

/// Check that every pattern parses.
///
/// # Errors
///
/// Returns a configuration error naming the first bad pattern.
pub fn validate_patterns(patterns: &[String]) -> Result<()> {
    build(Path::new("/"), patterns).map(|_| ())
}

/// Per-root path filter.
///
/// Paths under the root are matched against the patterns including their
/// parent directories, so `.git` also hides `.git/objects/...`. Paths outside
/// the root are matched by file name only.
#[derive(Debug, Clone)]
pub struct FileFilter {
    root: PathBuf,
    ignore: Gitignore,
    include: Option<Gitignore>,
}

impl FileFilter {
    /// Build a filter for `root` from ignore patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is invalid.
    pub fn new(root: impl AsRef<Path>, ignore_patterns: &[String]) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let ignore = build(&root, ignore_patterns)?;
        Ok(Self {
            root,
            ignore,
            include: None,
        })
    }

    /// Filter with [`DEFAULT_IGNORE_PATTERNS`].
    ///
    /// # Errors
    ///
    /// Never fails for the built-in patterns; the `Result` mirrors [`Self::new`].
    pub fn with_defaults(root: impl AsRef<Path>) -> Result<Self> {
        let defaults: Vec<String> = DEFAULT_IGNORE_PATTERNS.iter().map(|p| (*p).to_string()).collect();
        Self::new(root, &defaults)
    }

    /// Only accept files matching at least one of `patterns` (directories always pass).
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is invalid.
    pub fn with_includes(mut self, patterns: &[String]) -> Result<Self> {
        if !patterns.is_empty() {
            self.include = Some(build(&self.root, patterns)?);
        }
        Ok(self)
    }

    fn matches(&self, matcher: &Gitignore, path: &Path, is_dir: bool) -> bool {
        if path.starts_with(&self.root) && path != self.root {
            matcher.matched_path_or_any_parents(path, is_dir).is_ignore()
        } else {
            path.file_name()
                .is_some_and(|name| matcher.matched(Path::new(name), is_dir).is_ignore())
        }
    }

    /// Whether an ignore pattern hides `path`.
    #[must_use]
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.matches(&self.ignore, path, is_dir)
    }

    /// Whether `path` should be reported and indexed.
    #[must_use]
    pub fn accepts(&self, path: &Path, is_dir: bool) -> bool {
        if self.is_ignored(path, is_dir) {
            return false;
        }
        match &self.include {
            Some(include) if !is_dir => self.matches(include, path, false),
            _ => true,
        }
    }

    /// Root this filter was built for.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
