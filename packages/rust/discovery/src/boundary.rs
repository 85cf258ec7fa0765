//! Granular boundary scoring.
//!
//! Decides whether a sub-directory of a mapped domain is promoted to its own
//! sub-domain. The score is a weighted mean of four signals in `[0, 1]`:
//!
//! | signal     | measure                                              |
//! |------------|------------------------------------------------------|
//! | density    | mean concepts per file / `concept_saturation`        |
//! | complexity | mean branches per file / `complexity_saturation`     |
//! | coherence  | share of files whose concept vocabulary overlaps a sibling |
//! | assistance | (concepts + rules) / `assistance_saturation`         |
//!
//! Promotion requires the score to strictly exceed the threshold.

use contextsync_shared::BoundaryPolicy;

use crate::signals::FileSignals;

/// Component scores and the weighted total for one candidate directory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundaryScore {
    pub density: f64,
    pub complexity: f64,
    pub coherence: f64,
    pub assistance: f64,
    pub total: f64,
}

impl BoundaryScore {
    /// Whether `policy` promotes a directory with this score.
    pub fn promotes(&self, policy: &BoundaryPolicy) -> bool {
        policy.enabled && self.total > policy.threshold
    }
}

/// Score a candidate directory from the signals of its files.
pub fn score_directory(policy: &BoundaryPolicy, files: &[FileSignals]) -> BoundaryScore {
    if files.is_empty() {
        return BoundaryScore::default();
    }
    let n = files.len() as f64;

    let concepts: usize = files.iter().map(|f| f.concepts.len()).sum();
    let rules: usize = files.iter().map(|f| f.rules.len()).sum();
    let branches: usize = files.iter().map(|f| f.branches).sum();

    let density = saturate(concepts as f64 / n, policy.concept_saturation);
    let complexity = saturate(branches as f64 / n, policy.complexity_saturation);
    let assistance = saturate((concepts + rules) as f64, policy.assistance_saturation);
    let coherence = coherence(files);

    let weights = policy.density_weight
        + policy.complexity_weight
        + policy.coherence_weight
        + policy.assistance_weight;
    let total = if weights > 0.0 {
        (density * policy.density_weight
            + complexity * policy.complexity_weight
            + coherence * policy.coherence_weight
            + assistance * policy.assistance_weight)
            / weights
    } else {
        0.0
    };

    BoundaryScore {
        density,
        complexity,
        coherence,
        assistance,
        total,
    }
}

fn saturate(value: f64, saturation: f64) -> f64 {
    if saturation <= 0.0 {
        return 0.0;
    }
    (value / saturation).clamp(0.0, 1.0)
}

/// A single file is coherent with itself when it declares anything.
fn coherence(files: &[FileSignals]) -> f64 {
    let vocabularies: Vec<_> = files.iter().map(FileSignals::vocabulary).collect();
    if vocabularies.len() == 1 {
        return if vocabularies[0].is_empty() { 0.0 } else { 1.0 };
    }
    let coherent = vocabularies
        .iter()
        .enumerate()
        .filter(|(i, vocab)| {
            vocabularies
                .iter()
                .enumerate()
                .any(|(j, other)| *i != j && !vocab.is_disjoint(other))
        })
        .count();
    coherent as f64 / vocabularies.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(concepts: &[&str], rules: usize, branches: usize) -> FileSignals {
        FileSignals {
            concepts: concepts.iter().map(|s| s.to_string()).collect(),
            rules: (0..rules).map(|i| format!("throw rule {i}")).collect(),
            branches,
            references: Vec::new(),
        }
    }

    #[test]
    fn rich_directory_is_promoted() {
        let policy = BoundaryPolicy::default();
        let files = vec![
            signals(
                &["FractalDimension", "FractalSeries", "HurstExponent", "BoxCount"],
                4,
                10,
            ),
            signals(&["FractalResult", "FractalCache"], 2, 6),
        ];
        let score = score_directory(&policy, &files);
        assert!(score.coherence > 0.99);
        assert!(score.total > policy.threshold, "{score:?}");
        assert!(score.promotes(&policy));
    }

    #[test]
    fn sparse_directory_rolls_up() {
        let policy = BoundaryPolicy::default();
        let files = vec![signals(&[], 0, 2)];
        let score = score_directory(&policy, &files);
        assert!(score.total < policy.threshold);
        assert!(!score.promotes(&policy));
    }

    #[test]
    fn tie_with_threshold_does_not_promote() {
        let policy = BoundaryPolicy {
            threshold: 1.0,
            ..BoundaryPolicy::default()
        };
        let files = vec![signals(&["Alpha", "Beta", "Gamma", "Delta"], 20, 50)];
        let score = score_directory(&policy, &files);
        assert!((score.total - 1.0).abs() < 1e-9);
        assert!(!score.promotes(&policy));
    }

    #[test]
    fn disabled_policy_never_promotes() {
        let policy = BoundaryPolicy {
            enabled: false,
            ..BoundaryPolicy::default()
        };
        let files = vec![signals(&["FractalDimension"], 10, 10)];
        assert!(!score_directory(&policy, &files).promotes(&policy));
    }

    #[test]
    fn empty_directory_scores_zero() {
        let score = score_directory(&BoundaryPolicy::default(), &[]);
        assert_eq!(score, BoundaryScore::default());
    }
}
