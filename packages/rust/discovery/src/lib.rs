//! Domain discovery for ContextSync.
//!
//! Given a set of changed source files, works out which logical domains they
//! belong to and how those domains depend on each other:
//!
//! - [`PrefixDomainMap`] maps path prefixes to [`DomainId`]s
//! - [`score_directory`] decides granular sub-domain promotion
//! - [`DomainResolver`] produces the affected domain set and an acyclic
//!   [`DependencyGraph`]
//! - [`walk_source_tree`] enumerates the tree for a full reindex
//!
//! [`DomainId`]: contextsync_shared::DomainId

mod boundary;
mod domain_map;
mod graph;
mod resolver;
mod signals;
mod walk;

pub use boundary::{BoundaryScore, score_directory};
pub use domain_map::{DomainMap, DomainMatch, PrefixDomainMap, normalize_path};
pub use graph::{DependencyGraph, Edge};
pub use resolver::{DomainResolver, ResolvedDomains};
pub use signals::{FileSignals, normalize_reference, scan_source};
pub use walk::{SourceFilter, WalkOptions, walk_dir, walk_source_tree};
