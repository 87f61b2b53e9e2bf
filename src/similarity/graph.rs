// src/similarity/graph.rs

use std::collections::HashSet;

use crate::models::core::EntityId;

/// Jaccard overlap of two entities' immediate relationship neighborhoods.
///
/// Two mentions of the same real-world thing tend to interact with the same
/// other entities, so neighborhood overlap is a proxy for identity. Returns
/// `None` when both neighborhoods are empty (the signal is undefined, not
/// zero); a one-sided empty neighborhood scores 0.0.
pub fn graph_similarity(a: &HashSet<EntityId>, b: &HashSet<EntityId>) -> Option<f64> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return None;
    }
    Some(intersection as f64 / union as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> HashSet<EntityId> {
        names.iter().map(|n| EntityId(n.to_string())).collect()
    }

    #[test]
    fn identical_neighborhoods_score_one() {
        let n = ids(&["x", "y", "z"]);
        assert_eq!(graph_similarity(&n, &n.clone()), Some(1.0));
    }

    #[test]
    fn disjoint_neighborhoods_score_zero() {
        assert_eq!(graph_similarity(&ids(&["x"]), &ids(&["y"])), Some(0.0));
    }

    #[test]
    fn partial_overlap() {
        let sim = graph_similarity(&ids(&["x", "y"]), &ids(&["y", "z"])).unwrap();
        assert!((sim - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn both_empty_is_undefined() {
        assert_eq!(graph_similarity(&ids(&[]), &ids(&[])), None);
    }

    #[test]
    fn one_sided_empty_scores_zero() {
        assert_eq!(graph_similarity(&ids(&[]), &ids(&["x"])), Some(0.0));
    }
}
