use crate::types::{Embedding, FaceTemplate};
use serde::Serialize;

/// Why a comparison ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Matched,
    BelowThreshold,
    NoEnrolledTemplate,
    /// A stored embedding came from a different extraction scheme or has a
    /// different length. The user has to re-register.
    IncompatibleTemplate,
}

/// Result of matching a live embedding against a template.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best clamped cosine similarity in [0, 1].
    pub similarity: f32,
    pub reason: MatchReason,
    /// Index of the best stored embedding, if any was compared.
    pub best_index: Option<usize>,
}

impl MatchResult {
    fn rejected(reason: MatchReason) -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            reason,
            best_index: None,
        }
    }
}

/// Strategy for comparing a live embedding against an enrolled template.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, template: &FaceTemplate, threshold: f32) -> MatchResult;
}

/// Best-of-N cosine matcher.
///
/// Iterates every stored embedding with no early exit so timing does not
/// leak the template size or the position of the best entry.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, template: &FaceTemplate, threshold: f32) -> MatchResult {
        if template.embeddings.is_empty() {
            return MatchResult::rejected(MatchReason::NoEnrolledTemplate);
        }
        if template.embeddings.iter().any(|stored| !probe.is_compatible(stored)) {
            tracing::warn!(
                user = %template.user,
                probe_dims = probe.len(),
                probe_scheme = probe.scheme().as_str(),
                "stored template is incompatible with the active extractor"
            );
            return MatchResult::rejected(MatchReason::IncompatibleTemplate);
        }

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, stored) in template.embeddings.iter().enumerate() {
            let sim = probe.similarity(stored);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        let similarity = best_sim.max(0.0);
        let matched = similarity >= threshold;
        MatchResult {
            matched,
            similarity,
            reason: if matched { MatchReason::Matched } else { MatchReason::BelowThreshold },
            best_index: best_idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EmbeddingScheme;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec(), EmbeddingScheme::Learned).unwrap()
    }

    fn template(embeddings: Vec<Embedding>) -> FaceTemplate {
        FaceTemplate::new("u", embeddings)
    }

    #[test]
    fn test_cosine_matcher_best_of_n() {
        // Best match is the last entry; every entry must be visited.
        let probe = emb(&[1.0, 0.0, 0.0]);
        let t = template(vec![emb(&[0.0, 1.0, 0.0]), emb(&[0.0, 0.0, 1.0]), emb(&[1.0, 0.0, 0.0])]);

        let result = CosineMatcher.compare(&probe, &t, 0.65);
        assert!(result.matched);
        assert_eq!(result.reason, MatchReason::Matched);
        assert_eq!(result.best_index, Some(2));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_below_threshold() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let t = template(vec![emb(&[0.0, 1.0, 0.0])]);

        let result = CosineMatcher.compare(&probe, &t, 0.65);
        assert!(!result.matched);
        assert_eq!(result.reason, MatchReason::BelowThreshold);
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // cos = 0.70 exactly
        let probe = emb(&[0.7, (1.0f32 - 0.49).sqrt()]);
        let t = template(vec![emb(&[1.0, 0.0])]);
        let result = CosineMatcher.compare(&probe, &t, 0.65);
        assert!(result.matched);
        assert!((result.similarity - 0.70).abs() < 1e-5);

        let strict = CosineMatcher.compare(&probe, &t, EmbeddingScheme::Geometric.default_threshold());
        assert!(!strict.matched);
    }

    #[test]
    fn test_cosine_matcher_empty_template() {
        let probe = emb(&[1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &template(vec![]), 0.5);
        assert!(!result.matched);
        assert_eq!(result.reason, MatchReason::NoEnrolledTemplate);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_dimension_mismatch_is_incompatible() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let t = template(vec![emb(&[1.0, 0.0])]);
        let result = CosineMatcher.compare(&probe, &t, 0.5);
        assert!(!result.matched);
        assert_eq!(result.reason, MatchReason::IncompatibleTemplate);
    }

    #[test]
    fn test_scheme_mismatch_is_incompatible() {
        let probe = emb(&[1.0, 0.0]);
        let geometric = Embedding::normalized(vec![1.0, 0.0], EmbeddingScheme::Geometric).unwrap();
        let result = CosineMatcher.compare(&probe, &template(vec![geometric]), 0.5);
        assert_eq!(result.reason, MatchReason::IncompatibleTemplate);
    }
}
