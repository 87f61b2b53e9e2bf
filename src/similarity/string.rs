// src/similarity/string.rs

use strsim::jaro_winkler;

/// Normalized [0,1] similarity between two name strings.
///
/// Jaro-Winkler: favors common prefixes and tolerates minor edits, which is
/// the shape of most duplicate-mention name drift ("Robert" vs "Rob",
/// transposed characters, truncation). Inputs are expected to be normalized
/// names; empty input scores 0.0.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    jaro_winkler(a, b).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_score_one() {
        assert!((string_similarity("robert smith", "robert smith") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disjoint_names_score_low() {
        assert!(string_similarity("robert smith", "xyzzy") < 0.5);
    }

    #[test]
    fn empty_input_scores_zero() {
        assert_eq!(string_similarity("", "robert"), 0.0);
        assert_eq!(string_similarity("robert", ""), 0.0);
        assert_eq!(string_similarity("", ""), 0.0);
    }

    #[test]
    fn truncated_first_name_stays_high() {
        let sim = string_similarity("robert smith", "rob smith");
        assert!(sim > 0.85, "got {sim}");
    }

    #[test]
    fn symmetric() {
        assert_eq!(
            string_similarity("acme corp", "acme inc"),
            string_similarity("acme inc", "acme corp")
        );
    }
}
