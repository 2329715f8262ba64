//! Nearest-neighbour matching of probe embeddings against a registry.

use crate::registry::Registry;
use crate::types::{Embedding, MatchResult};

/// Distance tolerance used when no threshold is configured.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;

/// Strategy for comparing a probe embedding against registered references.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, registry: &Registry, threshold: f64) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Visits every registry entry. Only a strictly smaller distance replaces
/// the current best, so ties resolve to the earliest-inserted entry.
/// A match is `distance <= threshold` (inclusive).
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, registry: &Registry, threshold: f64) -> MatchResult {
        let mut best_dist = f64::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, (_, reference)) in registry.iter().enumerate() {
            let dist = probe.euclidean_distance(reference);
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return MatchResult::no_match();
        };

        let matched = best_dist <= threshold;
        MatchResult {
            matched,
            distance: best_dist,
            index: Some(idx),
            identity_id: if matched {
                registry.get(idx).map(|(id, _)| id.to_string())
            } else {
                None
            },
        }
    }
}

/// Evaluate probes in detection order and return the first that matches.
///
/// Returns `None` when no probe is within `threshold` of any entry.
pub fn first_match<'a, M, I>(
    matcher: &M,
    probes: I,
    registry: &Registry,
    threshold: f64,
) -> Option<MatchResult>
where
    M: Matcher + ?Sized,
    I: IntoIterator<Item = &'a Embedding>,
{
    probes
        .into_iter()
        .map(|probe| matcher.compare(probe, registry, threshold))
        .find(|result| result.matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f64]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn registry(entries: &[(&str, &[f64])]) -> Registry {
        let mut r = Registry::new();
        for (id, v) in entries {
            r.push(*id, emb(v));
        }
        r
    }

    #[test]
    fn test_matcher_visits_all_entries() {
        // Best match is the last entry
        let gallery = registry(&[
            ("decoy1", &[0.0, 1.0, 0.0]),
            ("decoy2", &[0.0, 0.0, 1.0]),
            ("match", &[1.0, 0.0, 0.0]),
        ]);
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.identity_id.as_deref(), Some("match"));
        assert_eq!(result.index, Some(2));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_threshold_boundary_inclusive() {
        let gallery = registry(&[("E1", &[3.0, 4.0])]);
        let probe = emb(&[0.0, 0.0]);
        let eps = 1e-9;

        let at = EuclideanMatcher.compare(&probe, &gallery, 5.0);
        assert!(at.matched, "d == t must match");
        assert_eq!(at.identity_id.as_deref(), Some("E1"));

        let above = EuclideanMatcher.compare(&probe, &gallery, 5.0 + eps);
        assert!(above.matched, "d < t must match");

        let below = EuclideanMatcher.compare(&probe, &gallery, 5.0 - eps);
        assert!(!below.matched, "d > t must not match");
        assert_eq!(below.identity_id, None);
        assert_eq!(below.index, Some(0));
        assert_eq!(below.distance, 5.0);
    }

    #[test]
    fn test_tie_breaks_to_earliest_entry() {
        let gallery = registry(&[("first", &[1.0, 0.0]), ("second", &[-1.0, 0.0])]);
        let result = EuclideanMatcher.compare(&emb(&[0.0, 0.0]), &gallery, 1.0);
        assert!(result.matched);
        assert_eq!(result.index, Some(0));
        assert_eq!(result.identity_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_no_match_beyond_threshold() {
        let gallery = registry(&[("a", &[1.0, 1.0]), ("b", &[-1.0, -1.0])]);
        let result = EuclideanMatcher.compare(&emb(&[5.0, 5.0]), &gallery, 0.6);
        assert!(!result.matched);
        assert_eq!(result.identity_id, None);
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn test_empty_registry() {
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0]), &Registry::new(), 0.6);
        assert!(!result.matched);
        assert_eq!(result.index, None);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_first_match_respects_detection_order() {
        let gallery = registry(&[("a", &[0.0, 0.0]), ("b", &[10.0, 0.0])]);
        let probes = [emb(&[50.0, 50.0]), emb(&[10.1, 0.0]), emb(&[0.0, 0.1])];
        let result = first_match(&EuclideanMatcher, &probes, &gallery, 0.6).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_first_match_none_when_exhausted() {
        let gallery = registry(&[("a", &[0.0, 0.0])]);
        let probes = [emb(&[5.0, 5.0]), emb(&[-5.0, 5.0])];
        assert!(first_match(&EuclideanMatcher, &probes, &gallery, 0.6).is_none());
    }
}
