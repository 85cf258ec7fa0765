//! Lexical signal scanner.
//!
//! Extracts language-agnostic signals from source text with a handful of
//! regular expressions: declared types (business concepts), rule-like
//! statements, a branch count (complexity), and import/using references.
//! This is deliberately shallow; it backs boundary scoring and the default
//! heuristic analyzer, and is replaceable behind the analyzer interface.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Longest rule text kept, in characters.
const MAX_RULE_LEN: usize = 160;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Signals extracted from one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSignals {
    /// Declared type names, in first-seen order, deduplicated.
    pub concepts: Vec<String>,
    /// Trimmed rule-like lines, in first-seen order, deduplicated.
    pub rules: Vec<String>,
    /// Number of branch points.
    pub branches: usize,
    /// Raw import/using targets, in source order, deduplicated.
    pub references: Vec<String>,
}

impl FileSignals {
    /// CamelCase words of all concept names, lowercased.
    pub fn vocabulary(&self) -> BTreeSet<String> {
        self.concepts
            .iter()
            .flat_map(|c| split_camel(c))
            .filter(|w| w.len() > 2)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// `class Foo`, `struct Foo`, `interface IFoo`, `enum Foo`, `record Foo`, `trait Foo`.
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:class|struct|interface|enum|record|trait)\s+([A-Z][A-Za-z0-9_]*)")
        .expect("type regex")
});

/// Statements that enforce a business rule.
static RULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\bthrow\s+new\b|\bthrow\b|\bassert!?\s*\(|\bensure!\s*\(|\bbail!\s*\(|\breturn\s+Err\(|\bGuard\.|\bDebug\.Assert\b|\braise\s+\w*Error\b)",
    )
    .expect("rule regex")
});

/// Branch points.
static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|for|foreach|while|match|switch|case|catch|elif|except)\b|&&|\|\|")
        .expect("branch regex")
});

/// `using A.B;`, `use a::b;`, `import x from 'y'`, `from a.b import c`, `import a.b`.
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(?:using\s+(?:static\s+)?([A-Za-z_][\w.]*)\s*;|(?:pub\s+)?use\s+([A-Za-z_][\w:]*)|import\s+(?:[\w{}*,\s]+\s+from\s+)?['"]([^'"]+)['"]|from\s+([\w.]+)\s+import\b|import\s+([\w.]+)\s*;?\s*$)"#,
    )
    .expect("import regex")
});

/// Line comment prefixes stripped before counting branches and rules.
static LINE_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?://|#(?:\s|$)|--|\*)").expect("comment regex"));

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Scan source text for signals.
pub fn scan_source(content: &str) -> FileSignals {
    let mut signals = FileSignals::default();
    let mut seen_concepts = BTreeSet::new();
    let mut seen_rules = BTreeSet::new();
    let mut seen_refs = BTreeSet::new();

    for caps in TYPE_RE.captures_iter(content) {
        let name = caps[1].to_string();
        if seen_concepts.insert(name.clone()) {
            signals.concepts.push(name);
        }
    }

    for line in content.lines() {
        if LINE_COMMENT_RE.is_match(line) {
            continue;
        }
        signals.branches += BRANCH_RE.find_iter(line).count();
        if RULE_RE.is_match(line) {
            let rule: String = line.trim().chars().take(MAX_RULE_LEN).collect();
            if seen_rules.insert(rule.clone()) {
                signals.rules.push(rule);
            }
        }
    }

    for caps in IMPORT_RE.captures_iter(content) {
        let Some(target) = (1..=5).find_map(|i| caps.get(i)) else {
            continue;
        };
        let target = target.as_str().to_string();
        if seen_refs.insert(target.clone()) {
            signals.references.push(target);
        }
    }

    signals
}

/// Normalize an import target to dotted segments.
///
/// `crate::data::provider::Cache` → `data.provider.Cache`,
/// `../Data/Provider/cache` → `Data.Provider.cache`,
/// `MyApp.Data.Provider` stays as is.
pub fn normalize_reference(reference: &str) -> String {
    reference
        .replace("::", ".")
        .replace('/', ".")
        .split('.')
        .filter(|s| !s.is_empty() && !matches!(*s, "crate" | "self" | "super" | "@"))
        .map(|s| s.trim_start_matches('@'))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split a CamelCase identifier into lowercase words.
fn split_camel(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if (c.is_uppercase() || c == '_') && !current.is_empty() {
            words.push(current.to_lowercase());
            current.clear();
        }
        if c != '_' {
            current.push(c);
        }
    }
    if !current.is_empty() {
        words.push(current.to_lowercase());
    }
    words
}
