// src/merge/strategy.rs

//! Per-field property merge strategies.
//!
//! Strategy selection is a map lookup by property name with a default
//! fallback — a tagged-variant dispatch, not inheritance. Fields without an
//! override keep the canonical value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::config::ConsolidationConfig;
use crate::models::core::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyKind {
    /// Keep the canonical entity's value
    PreferCanonical,

    /// Keep the value from whichever entity carried the higher extraction
    /// confidence
    PreferHigherConfidence,

    /// Join distinct string values with "; "
    ConcatDistinct,

    /// Union of set-valued (array) properties, canonical elements first
    UnionSet,

    /// Recursive merge of nested maps, canonical winning at leaves
    MergeNested,
}

impl MergeStrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreferCanonical => "prefer_canonical",
            Self::PreferHigherConfidence => "prefer_higher_confidence",
            Self::ConcatDistinct => "concat_distinct",
            Self::UnionSet => "union_set",
            Self::MergeNested => "merge_nested",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prefer_higher_confidence" => Self::PreferHigherConfidence,
            "concat_distinct" => Self::ConcatDistinct,
            "union_set" => Self::UnionSet,
            "merge_nested" => Self::MergeNested,
            _ => Self::PreferCanonical,
        }
    }

    /// Whether undo can restore the canonical side of this field from the
    /// pre-merge snapshot alone. Concat/union/nested merges mix values from
    /// both entities and are not unpicked on undo.
    pub fn is_reversible(&self) -> bool {
        matches!(self, Self::PreferCanonical | Self::PreferHigherConfidence)
    }
}

/// Reconciles canonical vs. absorbed properties into the canonical record.
///
/// Fields present on only one side are carried over as-is; the strategy
/// applies only when both sides carry the field.
pub fn merge_properties(
    canonical: &Entity,
    absorbed: &Entity,
    config: &ConsolidationConfig,
) -> Map<String, Value> {
    let mut merged = canonical.properties.clone();

    for (key, absorbed_value) in &absorbed.properties {
        match merged.get(key) {
            None => {
                merged.insert(key.clone(), absorbed_value.clone());
            }
            Some(canonical_value) => {
                let strategy = config.strategy_for(key);
                let resolved = apply_strategy(
                    strategy,
                    canonical_value,
                    absorbed_value,
                    canonical.extraction_confidence,
                    absorbed.extraction_confidence,
                );
                merged.insert(key.clone(), resolved);
            }
        }
    }
    merged
}

fn apply_strategy(
    strategy: MergeStrategyKind,
    canonical_value: &Value,
    absorbed_value: &Value,
    canonical_confidence: f64,
    absorbed_confidence: f64,
) -> Value {
    match strategy {
        MergeStrategyKind::PreferCanonical => canonical_value.clone(),
        MergeStrategyKind::PreferHigherConfidence => {
            if absorbed_confidence > canonical_confidence {
                absorbed_value.clone()
            } else {
                canonical_value.clone()
            }
        }
        MergeStrategyKind::ConcatDistinct => concat_distinct(canonical_value, absorbed_value),
        MergeStrategyKind::UnionSet => union_set(canonical_value, absorbed_value),
        MergeStrategyKind::MergeNested => merge_nested(canonical_value, absorbed_value),
    }
}

fn concat_distinct(canonical_value: &Value, absorbed_value: &Value) -> Value {
    match (canonical_value.as_str(), absorbed_value.as_str()) {
        (Some(a), Some(b)) => {
            if a == b || a.split("; ").any(|part| part == b) {
                canonical_value.clone()
            } else {
                Value::String(format!("{}; {}", a, b))
            }
        }
        _ => canonical_value.clone(),
    }
}

fn union_set(canonical_value: &Value, absorbed_value: &Value) -> Value {
    let mut elements: Vec<Value> = match canonical_value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let incoming: Vec<Value> = match absorbed_value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    for item in incoming {
        if !elements.contains(&item) {
            elements.push(item);
        }
    }
    Value::Array(elements)
}

fn merge_nested(canonical_value: &Value, absorbed_value: &Value) -> Value {
    match (canonical_value, absorbed_value) {
        (Value::Object(canonical_map), Value::Object(absorbed_map)) => {
            let mut merged = canonical_map.clone();
            for (key, absorbed_inner) in absorbed_map {
                match merged.get(key) {
                    None => {
                        merged.insert(key.clone(), absorbed_inner.clone());
                    }
                    Some(canonical_inner) => {
                        let resolved = merge_nested(canonical_inner, absorbed_inner);
                        merged.insert(key.clone(), resolved);
                    }
                }
            }
            Value::Object(merged)
        }
        _ => canonical_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strategy_round_trips_through_strings() {
        for kind in [
            MergeStrategyKind::PreferCanonical,
            MergeStrategyKind::PreferHigherConfidence,
            MergeStrategyKind::ConcatDistinct,
            MergeStrategyKind::UnionSet,
            MergeStrategyKind::MergeNested,
        ] {
            assert_eq!(MergeStrategyKind::from_str(kind.as_str()), kind);
        }
    }

    #[test]
    fn prefer_higher_confidence_picks_absorbed_when_stronger() {
        let resolved = apply_strategy(
            MergeStrategyKind::PreferHigherConfidence,
            &json!("weak"),
            &json!("strong"),
            0.4,
            0.9,
        );
        assert_eq!(resolved, json!("strong"));
    }

    #[test]
    fn prefer_higher_confidence_keeps_canonical_on_tie() {
        let resolved = apply_strategy(
            MergeStrategyKind::PreferHigherConfidence,
            &json!("canonical"),
            &json!("absorbed"),
            0.7,
            0.7,
        );
        assert_eq!(resolved, json!("canonical"));
    }

    #[test]
    fn concat_distinct_joins_and_dedupes() {
        assert_eq!(
            concat_distinct(&json!("a"), &json!("b")),
            json!("a; b")
        );
        assert_eq!(concat_distinct(&json!("a; b"), &json!("b")), json!("a; b"));
        assert_eq!(concat_distinct(&json!("a"), &json!("a")), json!("a"));
    }

    #[test]
    fn union_set_preserves_canonical_order() {
        assert_eq!(
            union_set(&json!(["x", "y"]), &json!(["y", "z"])),
            json!(["x", "y", "z"])
        );
    }

    #[test]
    fn union_set_wraps_scalars() {
        assert_eq!(union_set(&json!("x"), &json!("y")), json!(["x", "y"]));
    }

    #[test]
    fn merge_nested_recurses() {
        let canonical = json!({"contact": {"email": "a@x.org"}, "kind": "org"});
        let absorbed = json!({"contact": {"phone": "555"}, "kind": "other"});
        let merged = merge_nested(&canonical, &absorbed);
        assert_eq!(
            merged,
            json!({"contact": {"email": "a@x.org", "phone": "555"}, "kind": "org"})
        );
    }

    #[test]
    fn reversibility_is_limited_to_prefer_strategies() {
        assert!(MergeStrategyKind::PreferCanonical.is_reversible());
        assert!(MergeStrategyKind::PreferHigherConfidence.is_reversible());
        assert!(!MergeStrategyKind::ConcatDistinct.is_reversible());
        assert!(!MergeStrategyKind::UnionSet.is_reversible());
        assert!(!MergeStrategyKind::MergeNested.is_reversible());
    }
}
