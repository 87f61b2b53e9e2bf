// src/normalize.rs

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Folds a display name for matching: lowercase, diacritics stripped,
/// punctuation removed, whitespace collapsed.
///
/// "Café  Müller, Inc." -> "cafe muller inc"
pub fn normalize_name(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    let stripped = NON_ALNUM.replace_all(&folded, " ");
    WHITESPACE.replace_all(stripped.trim(), " ").to_string()
}

/// Whitespace-split tokens of a normalized name.
pub fn name_tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

/// Character trigrams of a normalized name, used by the approximate string
/// index. Names shorter than three characters yield the name itself.
pub fn trigrams(normalized: &str) -> Vec<String> {
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() < 3 {
        return vec![normalized.to_string()];
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_case_whitespace_and_punctuation() {
        assert_eq!(normalize_name("  Robert   Smith "), "robert smith");
        assert_eq!(normalize_name("Smith, Robert J."), "smith robert j");
    }

    #[test]
    fn strips_diacritics() {
        assert_eq!(normalize_name("Café Müller"), "cafe muller");
        assert_eq!(normalize_name("Dvořák"), "dvorak");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("!!!"), "");
    }

    #[test]
    fn trigrams_of_short_names() {
        assert_eq!(trigrams("ab"), vec!["ab".to_string()]);
        assert_eq!(trigrams(""), Vec::<String>::new());
        assert_eq!(trigrams("abcd"), vec!["abc".to_string(), "bcd".to_string()]);
    }
}
