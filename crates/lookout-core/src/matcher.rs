//! Nearest-neighbour identity matching.

use crate::types::{Embedding, Identity, MatchResult};

/// Default maximum normalized distance for a positive match.
///
/// Under [`UnitEuclidean`] this accepts unit embeddings with cosine
/// similarity of at least 0.28.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Name reported for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Distance reported when there is nothing to compare against.
const NO_MATCHER_DISTANCE: f32 = 1.0;

/// Distance between two embeddings. Smaller is more similar.
pub trait DistanceMetric: Send + Sync {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;
}

/// Euclidean distance halved, so unit-length embeddings fall in `[0, 1]`.
///
/// `d = ‖a − b‖ / 2 = sqrt((1 − cos) / 2)` for unit vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitEuclidean;

impl DistanceMetric for UnitEuclidean {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b) / 2.0
    }
}

impl MatchResult {
    /// A non-match at the given distance.
    pub fn unknown(distance: f32) -> Self {
        Self {
            name: UNKNOWN_LABEL.to_string(),
            distance,
            confidence: confidence_for(distance),
            is_known: false,
        }
    }
}

fn confidence_for(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Frozen index over every (name, embedding) pair of a gallery snapshot.
///
/// Never mutated after construction; a gallery change builds a new index.
/// Each enrolled embedding is compared individually, so an identity matches
/// if any one of its embeddings is the global nearest neighbour.
#[derive(Debug)]
pub struct MatcherIndex<M = UnitEuclidean> {
    names: Vec<String>,
    /// (index into `names`, embedding)
    entries: Vec<(usize, Embedding)>,
    threshold: f32,
    metric: M,
}

impl MatcherIndex<UnitEuclidean> {
    /// Build an index with the default metric. Returns `None` for an empty gallery.
    pub fn build(identities: &[Identity], threshold: f32) -> Option<Self> {
        Self::with_metric(identities, threshold, UnitEuclidean)
    }
}

impl<M: DistanceMetric> MatcherIndex<M> {
    pub fn with_metric(identities: &[Identity], threshold: f32, metric: M) -> Option<Self> {
        let mut names = Vec::with_capacity(identities.len());
        let mut entries = Vec::new();

        for identity in identities {
            if identity.embeddings.is_empty() {
                continue;
            }
            let idx = names.len();
            names.push(identity.name.clone());
            entries.extend(identity.embeddings.iter().map(|e| (idx, e.clone())));
        }

        if entries.is_empty() {
            return None;
        }

        Some(Self {
            names,
            entries,
            threshold,
            metric,
        })
    }

    /// Number of indexed embeddings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the globally closest enrolled embedding.
    ///
    /// A nearest neighbour farther than the threshold is reported as unknown.
    pub fn find_best_match(&self, probe: &Embedding) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_name: Option<usize> = None;

        for (name_idx, embedding) in &self.entries {
            let d = self.metric.distance(probe, embedding);
            if d < best_distance {
                best_distance = d;
                best_name = Some(*name_idx);
            }
        }

        match best_name {
            Some(idx) if best_distance <= self.threshold => MatchResult {
                name: self.names[idx].clone(),
                distance: best_distance,
                confidence: confidence_for(best_distance),
                is_known: true,
            },
            Some(_) => MatchResult::unknown(best_distance),
            None => MatchResult::unknown(NO_MATCHER_DISTANCE),
        }
    }
}

/// Match against an optional index; an absent index is an empty gallery.
pub fn resolve<M: DistanceMetric>(matcher: Option<&MatcherIndex<M>>, probe: &Embedding) -> MatchResult {
    match matcher {
        Some(index) => index.find_best_match(probe),
        None => MatchResult::unknown(NO_MATCHER_DISTANCE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn identity(name: &str, embeddings: &[&[f32]]) -> Identity {
        Identity {
            name: name.into(),
            embeddings: embeddings.iter().map(|v| Embedding::new(v.to_vec())).collect(),
        }
    }

    #[derive(Default, Clone)]
    struct CountingMetric(Arc<AtomicUsize>);

    impl DistanceMetric for CountingMetric {
        fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
            self.0.fetch_add(1, Ordering::SeqCst);
            a.euclidean_distance(b)
        }
    }

    #[test]
    fn test_empty_gallery_builds_no_index() {
        assert!(MatcherIndex::build(&[], DEFAULT_MATCH_THRESHOLD).is_none());
        // An identity without embeddings contributes nothing.
        assert!(MatcherIndex::build(&[identity("ghost", &[])], 0.6).is_none());
    }

    #[test]
    fn test_resolve_without_index_skips_distance_computation() {
        let calls = CountingMetric::default();
        let index = MatcherIndex::with_metric(&[], 0.6, calls.clone());
        assert!(index.is_none());

        let result = resolve(index.as_ref(), &Embedding::new(vec![0.1, 0.2]));
        assert_eq!(result.name, UNKNOWN_LABEL);
        assert!(!result.is_known);
        assert_eq!(result.distance, 1.0);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(calls.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_alice_within_threshold() {
        let gallery = [identity("Alice", &[&[0.0, 0.0]])];
        let index = MatcherIndex::build(&gallery, 0.6).unwrap();

        let result = index.find_best_match(&Embedding::new(vec![0.8, 0.0]));
        assert!(result.is_known);
        assert_eq!(result.name, "Alice");
        assert!((result.distance - 0.4).abs() < 1e-6);
        assert!((result.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_alice_beyond_threshold_is_unknown() {
        let gallery = [identity("Alice", &[&[0.0, 0.0]])];
        let index = MatcherIndex::build(&gallery, 0.6).unwrap();

        let result = index.find_best_match(&Embedding::new(vec![0.0, 1.6]));
        assert!(!result.is_known);
        assert_eq!(result.name, UNKNOWN_LABEL);
        assert!((result.distance - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_exact_embedding_matches_at_zero_distance() {
        let gallery = [identity("Bob", &[&[0.3, 0.4, 0.5]])];
        let index = MatcherIndex::build(&gallery, 0.6).unwrap();

        let result = index.find_best_match(&Embedding::new(vec![0.3, 0.4, 0.5]));
        assert!(result.is_known);
        assert!(result.distance.abs() < 1e-6);
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_every_embedding_compared_individually() {
        // Bob's average would be far from the probe; one of his embeddings is not.
        let gallery = [
            identity("Alice", &[&[0.5, 0.0]]),
            identity("Bob", &[&[-1.0, 0.0], &[0.1, 0.0], &[0.0, 3.0]]),
        ];
        let calls = CountingMetric::default();
        let index = MatcherIndex::with_metric(&gallery, 0.6, calls.clone()).unwrap();
        assert_eq!(index.len(), 4);

        let result = index.find_best_match(&Embedding::new(vec![0.0, 0.0]));
        assert_eq!(result.name, "Bob");
        assert!((result.distance - 0.1).abs() < 1e-6);
        assert_eq!(calls.0.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_dimension_mismatch_never_matches() {
        let gallery = [identity("Alice", &[&[0.0, 0.0]])];
        let index = MatcherIndex::build(&gallery, 0.6).unwrap();

        let result = index.find_best_match(&Embedding::new(vec![0.0, 0.0, 0.0]));
        assert!(!result.is_known);
        assert_eq!(result.distance, 1.0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gallery = [identity("Alice", &[&[0.0]])];
        let index = MatcherIndex::build(&gallery, 0.5).unwrap();
        assert!(index.find_best_match(&Embedding::new(vec![1.0])).is_known);
    }

    /// Unit vector at cosine `cos` to the first basis vector of `dim` dims.
    fn unit_at_cosine(dim: usize, cos: f32) -> Embedding {
        let mut v = vec![0.0; dim];
        v[0] = cos;
        v[1] = (1.0 - cos * cos).sqrt();
        Embedding::new(v)
    }

    #[test]
    fn test_unit_embeddings_match_at_moderate_cosine() {
        let gallery = [Identity {
            name: "Alice".into(),
            embeddings: vec![unit_at_cosine(512, 1.0)],
        }];
        let index = MatcherIndex::build(&gallery, DEFAULT_MATCH_THRESHOLD).unwrap();

        let result = index.find_best_match(&unit_at_cosine(512, 0.5));
        assert!(result.is_known);
        assert_eq!(result.name, "Alice");
        assert!((result.distance - 0.5).abs() < 1e-5);
        assert!((result.confidence - 0.5).abs() < 1e-5);

        // Orthogonal faces stay unknown.
        let result = index.find_best_match(&unit_at_cosine(512, 0.0));
        assert!(!result.is_known);
        assert!((result.distance - 0.5f32.sqrt()).abs() < 1e-5);
    }
}
