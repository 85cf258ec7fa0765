//! Context artifact storage and rendering.
//!
//! - [`ArtifactStore`] is the durable read/write interface keyed by
//!   `(domain, relative path)`; [`FsArtifactStore`] keeps one directory per
//!   domain under an artifact root.
//! - [`render_context`] turns aggregated analysis results into the Markdown
//!   context document for a domain.

mod render;
mod store;

pub use render::{estimate_tokens, render_context, select_tier};
pub use store::{ArtifactStore, FsArtifactStore};
