// src/models/config.rs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::merge::strategy::MergeStrategyKind;
use crate::models::core::ScopeId;

pub const DEFAULT_AUTO_MERGE_THRESHOLD: f64 = 0.90;
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.50;
pub const DEFAULT_MAX_CANDIDATES: usize = 50;
pub const DEFAULT_MAX_GROUP_SIZE: usize = 25;

/// Named weight for each similarity signal.
///
/// Missing signals are omitted from the weighted sum and the remaining
/// weights renormalized, so these do not need to sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalWeights {
    pub name: f64,
    pub phonetic: f64,
    pub embedding: f64,
    pub graph: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            name: 0.4,
            phonetic: 0.1,
            embedding: 0.35,
            graph: 0.15,
        }
    }
}

/// Per-scope consolidation configuration.
///
/// Read by the scoring pipeline and decision policy on every run; mutated
/// only through an administrative interface, never by the engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub scope_id: ScopeId,

    /// Confidence at or above which a pair merges without review
    pub auto_merge_threshold: f64,

    /// Confidence at or above which a pair is queued for review.
    /// Strictly less than `auto_merge_threshold`; enforced by `validate`.
    pub review_threshold: f64,

    /// Cap on candidates returned per blocking strategy
    pub max_group_size: usize,

    /// Cap on the total blocking candidate set
    pub max_candidates: usize,

    pub embedding_enabled: bool,
    pub graph_enabled: bool,

    /// Master switch for automatic merge execution; when off, auto-band
    /// pairs are queued for review instead
    pub auto_consolidation_enabled: bool,

    /// When set, a Stage-B signal timeout fails the pair instead of
    /// degrading to the available signals
    pub strict_signals: bool,

    pub weights: SignalWeights,

    /// Property-name -> merge strategy overrides; anything unlisted uses
    /// `MergeStrategyKind::PreferCanonical`
    pub property_strategies: HashMap<String, MergeStrategyKind>,
}

impl ConsolidationConfig {
    pub fn default_for(scope_id: ScopeId) -> Self {
        Self {
            scope_id,
            auto_merge_threshold: DEFAULT_AUTO_MERGE_THRESHOLD,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            embedding_enabled: true,
            graph_enabled: true,
            auto_consolidation_enabled: true,
            strict_signals: false,
            weights: SignalWeights::default(),
            property_strategies: HashMap::new(),
        }
    }

    /// Rejects invalid configuration; never clamps.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for value in [self.auto_merge_threshold, self.review_threshold] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::ThresholdOutOfRange { value });
            }
        }
        if self.review_threshold >= self.auto_merge_threshold {
            return Err(ValidationError::ThresholdOrder {
                review: self.review_threshold,
                auto: self.auto_merge_threshold,
            });
        }
        for (signal, value) in [
            ("name", self.weights.name),
            ("phonetic", self.weights.phonetic),
            ("embedding", self.weights.embedding),
            ("graph", self.weights.graph),
        ] {
            if value < 0.0 {
                return Err(ValidationError::NegativeWeight {
                    signal: signal.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Midpoint of the review band, where review priority peaks.
    pub fn review_band_midpoint(&self) -> f64 {
        (self.review_threshold + self.auto_merge_threshold) / 2.0
    }

    pub fn strategy_for(&self, property: &str) -> MergeStrategyKind {
        self.property_strategies
            .get(property)
            .copied()
            .unwrap_or(MergeStrategyKind::PreferCanonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsolidationConfig {
        ConsolidationConfig::default_for(ScopeId("test".into()))
    }

    #[test]
    fn default_config_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected_not_clamped() {
        let mut cfg = config();
        cfg.review_threshold = 0.95;
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::ThresholdOrder { .. })
        ));
        // unchanged by validation
        assert_eq!(cfg.review_threshold, 0.95);
    }

    #[test]
    fn equal_thresholds_are_rejected() {
        let mut cfg = config();
        cfg.review_threshold = cfg.auto_merge_threshold;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut cfg = config();
        cfg.weights.graph = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::NegativeWeight { .. })
        ));
    }

    #[test]
    fn default_band_midpoint_is_070() {
        assert!((config().review_band_midpoint() - 0.70).abs() < f64::EPSILON);
    }
}
