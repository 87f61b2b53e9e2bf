// src/decision.rs

//! Decision policy: pure mapping from a combined confidence to an action.
//!
//! Boundaries are inclusive toward the higher action: a pair scoring exactly
//! the auto-merge threshold merges, a pair scoring exactly the review
//! threshold is queued.

use crate::models::config::ConsolidationConfig;
use crate::models::scoring::MergeDecision;

pub fn decide(confidence: f64, config: &ConsolidationConfig) -> MergeDecision {
    if confidence >= config.auto_merge_threshold {
        MergeDecision::AutoMerge
    } else if confidence >= config.review_threshold {
        MergeDecision::Review {
            priority: review_priority(confidence, config),
        }
    } else {
        MergeDecision::Reject
    }
}

/// Review priority peaks at the review-band midpoint — the point of maximal
/// uncertainty — and decays linearly to 0 at both band edges.
///
/// The midpoint is the configured band's actual midpoint, not a fixed 0.5:
/// with shifted thresholds a fixed peak would rank the most ambiguous pairs
/// below clear-cut ones. For the default 0.50/0.90 band the peak sits at
/// 0.70.
pub fn review_priority(confidence: f64, config: &ConsolidationConfig) -> f64 {
    let half_band = (config.auto_merge_threshold - config.review_threshold) / 2.0;
    if half_band <= 0.0 {
        return 0.0;
    }
    let midpoint = config.review_band_midpoint();
    (1.0 - (confidence - midpoint).abs() / half_band).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::ScopeId;

    fn config() -> ConsolidationConfig {
        ConsolidationConfig::default_for(ScopeId("test".into()))
    }

    #[test]
    fn auto_merge_boundary_is_inclusive() {
        assert_eq!(decide(0.90, &config()), MergeDecision::AutoMerge);
        assert_eq!(decide(0.95, &config()), MergeDecision::AutoMerge);
    }

    #[test]
    fn review_boundary_is_inclusive() {
        assert!(matches!(decide(0.50, &config()), MergeDecision::Review { .. }));
    }

    #[test]
    fn below_review_threshold_rejects() {
        assert_eq!(decide(0.4999, &config()), MergeDecision::Reject);
        assert_eq!(decide(0.0, &config()), MergeDecision::Reject);
    }

    #[test]
    fn just_below_auto_threshold_reviews() {
        assert!(matches!(decide(0.8999, &config()), MergeDecision::Review { .. }));
    }

    #[test]
    fn priority_peaks_at_band_midpoint() {
        let cfg = config();
        assert!((review_priority(0.70, &cfg) - 1.0).abs() < 1e-9);
        assert!(review_priority(0.60, &cfg) < review_priority(0.70, &cfg));
        assert!(review_priority(0.80, &cfg) < review_priority(0.70, &cfg));
    }

    #[test]
    fn priority_decays_to_zero_at_band_edges() {
        let cfg = config();
        assert!(review_priority(0.50, &cfg).abs() < 1e-9);
        assert!(review_priority(0.90, &cfg).abs() < 1e-9);
    }

    #[test]
    fn priority_follows_configured_band_not_fixed_midpoint() {
        let mut cfg = config();
        cfg.review_threshold = 0.20;
        cfg.auto_merge_threshold = 0.40;
        // Band midpoint is 0.30; 0.5 is outside the band entirely.
        assert!((review_priority(0.30, &cfg) - 1.0).abs() < 1e-9);
        assert!(review_priority(0.39, &cfg) < 0.2);
    }
}
