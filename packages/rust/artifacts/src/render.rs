//! Context document rendering.
//!
//! [`render_context`] is a pure function of its inputs apart from the
//! `generated_at` timestamp, which is kept out of the rendered content so
//! identical inputs always produce byte-identical documents.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use chrono::Utc;
use contextsync_shared::{
    AnalysisResult, CONTEXT_FILE_NAME, ContextArtifact, DomainId, TemplateThresholds,
    TemplateTier, sha256_hex,
};

/// Rough token estimate: one token per four characters.
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count().div_ceil(4)
}

/// Pick a tier from the number of distinct concepts plus rules.
pub fn select_tier(weight: usize, thresholds: &TemplateThresholds) -> TemplateTier {
    if weight >= thresholds.high {
        TemplateTier::High
    } else if weight >= thresholds.medium {
        TemplateTier::Medium
    } else {
        TemplateTier::Low
    }
}

/// Render the context document for one domain.
///
/// `related` are the domains this one depends on; they become links.
pub fn render_context(
    domain: &DomainId,
    results: &[AnalysisResult],
    related: &[DomainId],
    thresholds: &TemplateThresholds,
) -> ContextArtifact {
    let mut sorted: Vec<&AnalysisResult> = results.iter().collect();
    sorted.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    let mut concepts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut rules: BTreeSet<&str> = BTreeSet::new();
    for result in &sorted {
        let unique: BTreeSet<&str> = result.business_concepts.iter().map(String::as_str).collect();
        for concept in unique {
            *concepts.entry(concept).or_default() += 1;
        }
        rules.extend(result.business_rules.iter().map(String::as_str));
    }
    let related: BTreeSet<&DomainId> = related.iter().collect();

    let tier = if sorted.is_empty() {
        TemplateTier::Placeholder
    } else {
        select_tier(concepts.len() + rules.len(), thresholds)
    };

    let mut out = String::new();
    let _ = writeln!(out, "# {domain}");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "> Generated context for the `{domain}` domain. Regenerated on every update; do not edit."
    );
    let _ = writeln!(out);

    if tier == TemplateTier::Placeholder {
        let _ = writeln!(
            out,
            "No analyzed source files currently map to this domain. This placeholder keeps the domain's context directory populated until analysis results are available."
        );
    } else {
        let _ = writeln!(
            out,
            "**Tier:** {tier} | **Files:** {} | **Concepts:** {} | **Rules:** {}",
            sorted.len(),
            concepts.len(),
            rules.len()
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "## Files");
        let _ = writeln!(out);
        for result in &sorted {
            let _ = writeln!(out, "- `{}` ({})", result.file_path, result.language);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## Business concepts");
        let _ = writeln!(out);
        if concepts.is_empty() {
            let _ = writeln!(out, "_None detected._");
        }
        for (concept, count) in &concepts {
            if *count > 1 {
                let _ = writeln!(out, "- `{concept}` ({count} files)");
            } else {
                let _ = writeln!(out, "- `{concept}`");
            }
        }
        let _ = writeln!(out);

        if tier != TemplateTier::Low {
            let _ = writeln!(out, "## Business rules");
            let _ = writeln!(out);
            if rules.is_empty() {
                let _ = writeln!(out, "_None detected._");
            }
            for rule in &rules {
                let _ = writeln!(out, "- `{}`", rule.replace('`', "'"));
            }
            let _ = writeln!(out);
        }

        if tier == TemplateTier::High {
            let _ = writeln!(out, "## File breakdown");
            let _ = writeln!(out);
            for result in &sorted {
                let mut names: Vec<&str> =
                    result.business_concepts.iter().map(String::as_str).collect();
                names.sort_unstable();
                names.dedup();
                let _ = writeln!(
                    out,
                    "- `{}`: {} concepts, {} rules{}",
                    result.file_path,
                    names.len(),
                    result.business_rules.len(),
                    if names.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", names.join(", "))
                    }
                );
            }
            let _ = writeln!(out);
        }
    }

    if !related.is_empty() {
        let _ = writeln!(out, "## Related domains");
        let _ = writeln!(out);
        for other in &related {
            let _ = writeln!(out, "- [{other}](../{other}/{CONTEXT_FILE_NAME})");
        }
        let _ = writeln!(out);
    }

    let content = out.trim_end().to_string() + "\n";
    ContextArtifact {
        domain_path: domain.clone(),
        relative_path: CONTEXT_FILE_NAME.to_string(),
        token_count: estimate_tokens(&content),
        template_used: tier,
        content_hash: sha256_hex(content.as_bytes()),
        content,
        generated_at: Utc::now(),
    }
}
