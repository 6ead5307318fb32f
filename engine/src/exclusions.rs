//! Exclusion patterns applied when gathering source files.
//!
//! Patterns are wildcard strings where `*` matches any run of characters,
//! directory separators included, and every other character is literal. A
//! pattern must match the whole path relative to the job root. Matching is
//! case-insensitive and always uses `/` as the separator.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{EngineError, EngineResult};

/// Compiled, read-only set of exclusion patterns.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExclusionSet {
    /// Compile patterns; blank entries are ignored.
    pub fn new<I, S>(patterns: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() || kept.iter().any(|p: &String| p == pattern) {
                continue;
            }

            let glob = GlobBuilder::new(&wildcard_to_glob(pattern))
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|source| EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }

        let set = builder.build().map_err(|source| EngineError::InvalidPattern {
            pattern: kept.join(", "),
            source,
        })?;

        Ok(ExclusionSet {
            set,
            patterns: kept,
        })
    }

    /// A set that excludes nothing.
    pub fn empty() -> Self {
        ExclusionSet {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// True if the path (relative to the job root) matches any pattern.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        self.set.is_match(normalize_relative(relative))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Escape everything but `*`, collapse runs of `*`, use `/` separators.
fn wildcard_to_glob(pattern: &str) -> String {
    let normalized = pattern.replace('\\', "/");
    let mut glob = String::with_capacity(normalized.len());
    let mut last_was_star = false;

    for (i, piece) in normalized.split('*').enumerate() {
        if i > 0 && !last_was_star {
            glob.push('*');
        }
        last_was_star = piece.is_empty() && i > 0;
        glob.push_str(&globset::escape(piece));
    }

    glob
}

fn normalize_relative(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
