//! Embedding comparison: Euclidean distance, linear confidence, fixed threshold.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};

/// Maximum Euclidean distance accepted as the same person.
pub const MATCH_THRESHOLD: f64 = 0.5;

/// Why a verification did not produce a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    FaceMismatch,
}

/// Outcome of comparing a probe embedding against a reference embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance, rounded to 4 decimal places.
    pub distance: f64,
    /// Linear score in [0, 100], rounded to 1 decimal place. Not a probability.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Strategy for comparing two embeddings.
pub trait Matcher {
    fn evaluate(&self, probe: &Embedding, reference: &Embedding) -> MatchResult;
}

/// Euclidean-distance matcher with the fixed [`MATCH_THRESHOLD`].
///
/// The decision uses the unrounded distance; rounding only shapes the
/// reported numbers.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn evaluate(&self, probe: &Embedding, reference: &Embedding) -> MatchResult {
        let distance = probe.euclidean_distance(reference);
        let matched = distance <= MATCH_THRESHOLD;

        MatchResult {
            matched,
            distance: round_to(distance, 4),
            confidence: round_to(confidence(distance), 1),
            reason: (!matched).then_some(FailureReason::FaceMismatch),
        }
    }
}

/// `clamp(0, 100, (1 - d) * 100)`.
pub fn confidence(distance: f64) -> f64 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(distance: f32) -> (Embedding, Embedding) {
        (
            Embedding::new(vec![0.0, 0.0]),
            Embedding::new(vec![distance, 0.0]),
        )
    }

    #[test]
    fn test_identical_embeddings_match_fully() {
        let (a, _) = pair(0.0);
        let result = EuclideanMatcher.evaluate(&a, &a);
        assert!(result.matched);
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.reason, None);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let (a, b) = pair(0.5);
        let result = EuclideanMatcher.evaluate(&a, &b);
        assert!(result.matched);
        assert_eq!(result.distance, 0.5);
        assert_eq!(result.confidence, 50.0);
    }

    #[test]
    fn test_just_above_threshold_rejected() {
        let a = Embedding::new(vec![0.0]);
        let b = Embedding::new(vec![0.5001]);
        let result = EuclideanMatcher.evaluate(&a, &b);
        assert!(!result.matched);
        assert_eq!(result.reason, Some(FailureReason::FaceMismatch));
    }

    #[test]
    fn test_confidence_linear_and_rounded() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.3, 0.4]); // distance 0.5 in f32 space
        let result = EuclideanMatcher.evaluate(&a, &b);
        assert!((result.distance - 0.5).abs() < 1e-4);

        let origin = Embedding::new(vec![0.0]);
        let c = Embedding::new(vec![0.12345]);
        let result = EuclideanMatcher.evaluate(&origin, &c);
        assert_eq!(result.distance, 0.1235);
        assert_eq!(result.confidence, 87.7);
    }

    #[test]
    fn test_confidence_clamped_at_zero() {
        let (a, b) = pair(1.7);
        let result = EuclideanMatcher.evaluate(&a, &b);
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(confidence(3.0), 0.0);
        assert_eq!(confidence(0.0), 100.0);
    }

    #[test]
    fn test_decision_follows_distance_for_a_sweep() {
        let zero = Embedding::new(vec![0.0]);
        for step in 0..=40 {
            let d = step as f32 * 0.025;
            let result = EuclideanMatcher.evaluate(&zero, &Embedding::new(vec![d]));
            assert_eq!(result.matched, f64::from(d) <= MATCH_THRESHOLD, "d = {d}");
            let expected = round_to(confidence(f64::from(d)), 1);
            assert_eq!(result.confidence, expected, "d = {d}");
        }
    }
}
