//! Scoring of a query descriptor against one user's reference set.
//!
//! Each descriptor kind has its own policy and the resulting scores are only
//! comparable within a kind.

use crate::types::{Descriptor, DescriptorKind};

/// Euclidean distance that maps to a similarity of zero for geometric
/// descriptors. Calibrated to the magnitude of pixel-space box coordinates;
/// changing it changes every stored threshold's meaning.
pub const DISTANCE_NORMALIZATION: f32 = 1000.0;

const COSINE_MEAN_WEIGHT: f32 = 0.5;
const COSINE_MAX_WEIGHT: f32 = 0.3;
const COSINE_MIN_WEIGHT: f32 = 0.2;

/// Strategy for comparing a query against a user's enrolled descriptors.
///
/// Implementations are pure: the same inputs always give the same score, and
/// the order of `references` does not matter.
pub trait Matcher: Send + Sync {
    fn score(&self, query: &Descriptor, references: &[Descriptor]) -> f32;
}

/// Minimum-distance matcher for geometric descriptors.
///
/// `similarity = max(0, 1 - min_distance / 1000)`.
pub struct DistanceMatcher;

impl Matcher for DistanceMatcher {
    fn score(&self, query: &Descriptor, references: &[Descriptor]) -> f32 {
        let min_distance = references
            .iter()
            .map(|r| query.euclidean_distance(r))
            .fold(f32::INFINITY, f32::min);

        if min_distance.is_infinite() {
            return 0.0;
        }
        (1.0 - min_distance / DISTANCE_NORMALIZATION).max(0.0)
    }
}

/// Weighted cosine matcher for learned embeddings.
///
/// `0.5 * mean + 0.3 * max + 0.2 * min` over the cosine similarity to every
/// reference, so a consistent reference set beats one lucky reference.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn score(&self, query: &Descriptor, references: &[Descriptor]) -> f32 {
        if references.is_empty() {
            return 0.0;
        }

        let mut sum = 0.0f32;
        let mut max = f32::NEG_INFINITY;
        let mut min = f32::INFINITY;

        for reference in references {
            let sim = query.cosine_similarity(reference);
            sum += sim;
            max = max.max(sim);
            min = min.min(sim);
        }

        let mean = sum / references.len() as f32;
        COSINE_MEAN_WEIGHT * mean + COSINE_MAX_WEIGHT * max + COSINE_MIN_WEIGHT * min
    }
}

/// Matcher paired with the given descriptor kind.
pub fn matcher_for(kind: DescriptorKind) -> Box<dyn Matcher> {
    match kind {
        DescriptorKind::Geometric => Box::new(DistanceMatcher),
        DescriptorKind::Learned => Box::new(CosineMatcher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    #[test]
    fn test_distance_exact_match_is_one() {
        let query = d(&[120.0, 80.0, 200.0, 210.0, 0.95, 131.5, 42.0]);
        let refs = vec![
            d(&[300.0, 10.0, 150.0, 160.0, 0.94, 90.0, 30.0]),
            query.clone(),
        ];
        assert_eq!(DistanceMatcher.score(&query, &refs), 1.0);
    }

    #[test]
    fn test_distance_uses_minimum() {
        let query = d(&[0.0, 0.0]);
        let refs = vec![d(&[600.0, 0.0]), d(&[300.0, 400.0]), d(&[0.0, 250.0])];
        // closest reference is 250 away
        assert!((DistanceMatcher.score(&query, &refs) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_distance_clamped_to_zero() {
        let query = d(&[0.0, 0.0]);
        let refs = vec![d(&[3000.0, 4000.0])];
        assert_eq!(DistanceMatcher.score(&query, &refs), 0.0);
    }

    #[test]
    fn test_distance_score_in_unit_range() {
        let query = d(&[10.0, 20.0, 30.0]);
        for offset in [0.0f32, 1.0, 57.0, 499.0, 999.0, 1001.0, 1e6] {
            let refs = vec![d(&[10.0 + offset, 20.0, 30.0])];
            let s = DistanceMatcher.score(&query, &refs);
            assert!((0.0..=1.0).contains(&s), "offset {offset} gave {s}");
        }
    }

    #[test]
    fn test_cosine_identical_references_is_one() {
        let query = d(&[0.2, -0.4, 0.9]);
        let refs = vec![query.clone(), query.clone(), query.clone()];
        assert!((CosineMatcher.score(&query, &refs) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_weighted_combination() {
        let query = d(&[1.0, 0.0]);
        // similarities: 1.0, 0.0
        let refs = vec![d(&[2.0, 0.0]), d(&[0.0, 3.0])];
        // mean 0.5, max 1.0, min 0.0 -> 0.25 + 0.3 + 0.0
        assert!((CosineMatcher.score(&query, &refs) - 0.55).abs() < 1e-6);
    }

    #[test]
    fn test_empty_references_score_zero() {
        let query = d(&[1.0, 2.0]);
        assert_eq!(CosineMatcher.score(&query, &[]), 0.0);
        assert_eq!(DistanceMatcher.score(&query, &[]), 0.0);
    }

    #[test]
    fn test_scores_order_independent() {
        let query = d(&[0.3, 0.1, -0.5]);
        let mut refs = vec![
            d(&[0.3, 0.2, -0.4]),
            d(&[-0.9, 0.1, 0.0]),
            d(&[0.0, 1.0, 0.0]),
            d(&[0.31, 0.09, -0.52]),
        ];
        let cos = CosineMatcher.score(&query, &refs);
        let dist = DistanceMatcher.score(&query, &refs);
        refs.reverse();
        refs.swap(0, 2);
        assert!((CosineMatcher.score(&query, &refs) - cos).abs() < 1e-6);
        assert_eq!(DistanceMatcher.score(&query, &refs), dist);
    }

    #[test]
    fn test_matcher_for_kind() {
        let query = d(&[1.0, 0.0]);
        let refs = vec![d(&[2.0, 0.0])];
        // cosine ignores magnitude, distance does not
        let learned = matcher_for(DescriptorKind::Learned).score(&query, &refs);
        let geometric = matcher_for(DescriptorKind::Geometric).score(&query, &refs);
        assert!((learned - 1.0).abs() < 1e-6);
        assert!((geometric - 0.999).abs() < 1e-6);
    }
}
