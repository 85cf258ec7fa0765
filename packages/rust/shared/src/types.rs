//! Core domain types: identifiers, analysis results, and context artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ContextSyncError, Result};

/// File name of the generated context document inside a domain's artifact directory.
pub const CONTEXT_FILE_NAME: &str = "context.md";

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for update job identifiers (time-sortable).
///
/// The same identifier keys the job's rollback record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// DomainId
// ---------------------------------------------------------------------------

/// Hierarchical domain identifier such as `Analysis.Fractal`.
///
/// Ordering is lexical and only used for deterministic iteration; dependency
/// order comes from the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainId(String);

impl DomainId {
    /// Parse and validate a dotted domain identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ContextSyncError::validation("domain id is empty"));
        }
        for segment in id.split('.') {
            if segment.is_empty() {
                return Err(ContextSyncError::validation(format!(
                    "domain id '{id}' has an empty segment"
                )));
            }
            if !segment
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ContextSyncError::validation(format!(
                    "domain id '{id}' contains invalid characters"
                )));
            }
        }
        Ok(Self(id))
    }

    /// Build a domain id from directory segments, sanitizing each segment.
    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let joined = segments
            .into_iter()
            .map(sanitize_segment)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        Self::new(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent domain (`Analysis.Fractal` → `Analysis`), if any.
    pub fn parent(&self) -> Option<DomainId> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| DomainId(parent.to_string()))
    }

    /// Append a child segment.
    pub fn child(&self, segment: &str) -> Result<DomainId> {
        Self::new(format!("{}.{}", self.0, sanitize_segment(segment)))
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    pub fn is_ancestor_or_self(&self, other: &DomainId) -> bool {
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'.'))
    }

    /// Number of hierarchy levels.
    pub fn depth(&self) -> usize {
        self.0.split('.').count()
    }
}

/// Replace characters that would break the dotted hierarchy.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DomainId {
    type Err = ContextSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for DomainId {
    type Error = ContextSyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DomainId> for String {
    fn from(value: DomainId) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// AnalysisResult
// ---------------------------------------------------------------------------

/// Per-file output of the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Path relative to the source root.
    pub file_path: String,
    /// Language inferred from the file extension.
    pub language: String,
    /// Domain the file was resolved to.
    pub domain_context: DomainId,
    /// Business concepts (types, entities) found in the file.
    pub business_concepts: Vec<String>,
    /// Business rules (validations, invariants) found in the file.
    pub business_rules: Vec<String>,
    /// Import/using references extracted from the file.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Wall-clock time spent analyzing the file.
    pub analysis_time_ms: u64,
}

/// Infer a language label from a file extension.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "cs" => "csharp",
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "md" => "markdown",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// ContextArtifact
// ---------------------------------------------------------------------------

/// Template tier chosen from a domain's aggregate complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateTier {
    /// No analysis results matched the domain.
    Placeholder,
    Low,
    Medium,
    High,
}

impl TemplateTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Placeholder => "placeholder",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for TemplateTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated context document for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextArtifact {
    /// Domain the artifact describes.
    pub domain_path: DomainId,
    /// File name within the domain's artifact directory.
    pub relative_path: String,
    /// Rendered Markdown content.
    pub content: String,
    /// Estimated token count of `content`.
    pub token_count: usize,
    /// Template tier used to render the content.
    pub template_used: TemplateTier,
    /// SHA-256 of `content`.
    pub content_hash: String,
    /// When generation finished.
    pub generated_at: DateTime<Utc>,
}
