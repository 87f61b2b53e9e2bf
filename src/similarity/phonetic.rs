// src/similarity/phonetic.rs

use once_cell::sync::Lazy;
use rphonetic::{Encoder, Soundex};

static SOUNDEX: Lazy<Soundex> = Lazy::new(Soundex::default);

/// Soundex code of a name, computed over its letters only.
///
/// Returns `None` when the name carries no encodable letters. This is the
/// code the blocking engine indexes on.
pub fn phonetic_code(name: &str) -> Option<String> {
    let letters: String = name.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let code = SOUNDEX.encode(&letters);
    if code.is_empty() {
        None
    } else {
        Some(code)
    }
}

/// Per-token Soundex codes of a name.
fn token_codes(name: &str) -> Vec<String> {
    name.split_whitespace().filter_map(phonetic_code).collect()
}

/// Near-binary phonetic similarity between two names.
///
/// 1.0 when the whole-name codes match or any token code is shared
/// ("robert smith" / "rob smith" share S530), 0.5 when only the leading
/// sound matches, 0.0 otherwise. More a blocking-time aid than a
/// scoring-time discriminator; it carries a low weight in the combine.
pub fn phonetic_similarity(name_a: &str, name_b: &str) -> f64 {
    let (code_a, code_b) = match (phonetic_code(name_a), phonetic_code(name_b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return 0.0,
    };
    if code_a == code_b {
        return 1.0;
    }
    let tokens_a = token_codes(name_a);
    let tokens_b = token_codes(name_b);
    if tokens_a.iter().any(|c| tokens_b.contains(c)) {
        return 1.0;
    }
    if code_a.chars().next() == code_b.chars().next() {
        return 0.5;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_for_known_names() {
        assert_eq!(phonetic_code("robert").as_deref(), Some("R163"));
        assert_eq!(phonetic_code("rupert").as_deref(), Some("R163"));
        assert_eq!(phonetic_code("smith").as_deref(), Some("S530"));
    }

    #[test]
    fn no_letters_means_no_code() {
        assert_eq!(phonetic_code("12345"), None);
        assert_eq!(phonetic_code(""), None);
    }

    #[test]
    fn sound_alike_names_score_one() {
        assert_eq!(phonetic_similarity("robert", "rupert"), 1.0);
    }

    #[test]
    fn shared_token_code_scores_one() {
        assert_eq!(phonetic_similarity("robert smith", "rob smith"), 1.0);
    }

    #[test]
    fn unrelated_names_score_zero() {
        assert_eq!(phonetic_similarity("smith", "jones"), 0.0);
    }

    #[test]
    fn missing_code_scores_zero() {
        assert_eq!(phonetic_similarity("123", "smith"), 0.0);
    }
}
