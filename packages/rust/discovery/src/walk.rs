//! Source tree walk used by full reindex and boundary scoring.

use std::path::Path;

use contextsync_shared::{ContextSyncError, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

/// Directory names never descended into.
const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".contextsync",
    "target",
    "node_modules",
    "bin",
    "obj",
    "dist",
];

/// Which files a walk yields.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Extensions without the dot; empty means every file.
    pub extensions: Vec<String>,
    /// Glob patterns relative to the root. `*` stays within one path
    /// segment, `**` crosses directories; braces and classes are supported.
    pub exclude_patterns: Vec<String>,
}

/// Compiled form of [`WalkOptions`].
#[derive(Debug, Clone)]
pub struct SourceFilter {
    extensions: Vec<String>,
    excludes: GlobSet,
}

impl SourceFilter {
    pub fn new(options: &WalkOptions) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude_patterns {
            let glob = GlobBuilder::new(pattern.trim_start_matches("./"))
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    ContextSyncError::validation(format!("invalid exclude pattern '{pattern}': {e}"))
                })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| ContextSyncError::validation(format!("invalid exclude patterns: {e}")))?;

        Ok(Self {
            extensions: options
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            excludes,
        })
    }

    /// Whether a relative `/`-separated path is excluded by pattern.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes.is_match(relative)
    }

    /// Whether a relative path is a source file this filter accepts.
    pub fn accepts(&self, relative: &str) -> bool {
        if self.is_excluded(relative) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        let Some((_, ext)) = relative.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// Walk `dir` (a directory under `root`) and return accepted files as
/// root-relative `/`-separated paths, sorted.
pub fn walk_dir(root: &Path, dir: &Path, filter: &SourceFilter) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if DEFAULT_EXCLUDED_DIRS.iter().any(|d| *d == name) {
            return false;
        }
        relative_path(root, entry.path()).is_none_or(|rel| !filter.is_excluded(&rel))
    });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(relative) = relative_path(root, entry.path()) {
            if filter.accepts(&relative) {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Walk the whole source tree under `root`.
pub fn walk_source_tree(root: &Path, options: &WalkOptions) -> Result<Vec<String>> {
    let filter = SourceFilter::new(options)?;
    let files = walk_dir(root, root, &filter)?;
    debug!(root = %root.display(), count = files.len(), "walked source tree");
    Ok(files)
}

fn walk_error(e: walkdir::Error) -> ContextSyncError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    match e.into_io_error() {
        Some(io) => ContextSyncError::io(path, io),
        None => ContextSyncError::validation(format!(
            "filesystem loop while walking {}",
            path.display()
        )),
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
