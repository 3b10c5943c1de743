//! 1:1 face verification.
//!
//! A probe is only ever compared against the template of the subject it
//! claims to be. There is no gallery and no population search, so a face
//! that belongs to a different enrolled subject is simply "not matched".

use crate::types::FaceEncoding;

/// Default acceptance tolerance on Euclidean distance.
pub const DEFAULT_TOLERANCE: f64 = 0.6;

/// Result of comparing one probe with one template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    Matched { distance: f64 },
    NotMatched { distance: f64 },
}

impl MatchDecision {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchDecision::Matched { .. })
    }

    pub fn distance(&self) -> f64 {
        match *self {
            MatchDecision::Matched { distance } | MatchDecision::NotMatched { distance } => {
                distance
            }
        }
    }
}

/// Strategy for verifying a probe against a single claimed template.
pub trait Matcher {
    fn verify(&self, probe: &FaceEncoding, template: &FaceEncoding) -> MatchDecision;
}

/// Euclidean distance matcher: accept when `distance <= tolerance`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f64,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self { tolerance: DEFAULT_TOLERANCE }
    }
}

impl Matcher for EuclideanMatcher {
    fn verify(&self, probe: &FaceEncoding, template: &FaceEncoding) -> MatchDecision {
        let distance = probe.euclidean_distance(template);
        if distance <= self.tolerance {
            MatchDecision::Matched { distance }
        } else {
            MatchDecision::NotMatched { distance }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENCODING_DIM;

    fn encoding(v: f64) -> FaceEncoding {
        FaceEncoding::from_values(vec![v; ENCODING_DIM]).unwrap()
    }

    #[test]
    fn test_identical_encodings_match() {
        let a = encoding(0.4);
        let decision = EuclideanMatcher::default().verify(&a, &a);
        assert!(decision.is_match());
        assert_eq!(decision.distance(), 0.0);
    }

    #[test]
    fn test_distant_encodings_do_not_match() {
        // sqrt(128) * 0.5 ≈ 5.66
        let decision = EuclideanMatcher::default().verify(&encoding(0.1), &encoding(0.6));
        assert!(!decision.is_match());
        assert!(decision.distance() > 5.0);
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let a = encoding(1.0);
        let b = encoding(1.05);
        let distance = a.euclidean_distance(&b);
        let matcher = EuclideanMatcher { tolerance: distance };
        assert!(matcher.verify(&a, &b).is_match());
        let stricter = EuclideanMatcher { tolerance: distance - 1e-9 };
        assert!(!stricter.verify(&a, &b).is_match());
    }

    #[test]
    fn test_tolerance_is_configurable() {
        // distance ≈ 1.13
        let a = encoding(0.2);
        let b = encoding(0.3);
        assert!(!EuclideanMatcher::default().verify(&a, &b).is_match());
        assert!(EuclideanMatcher { tolerance: 1.2 }.verify(&a, &b).is_match());
    }
}
