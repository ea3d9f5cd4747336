//! Reply-language heuristic.

use std::sync::LazyLock;

use regex::Regex;

static CYRILLIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Cyrillic}").expect("valid cyrillic pattern"));

/// Language the model is asked to reply in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Russian,
    English,
}

impl Language {
    /// Instruction appended to the system prompt.
    pub fn directive(&self) -> &'static str {
        match self {
            Language::Russian => "Отвечай на русском языке.",
            Language::English => "Reply in English.",
        }
    }
}

/// Picks a reply language from the triggering text.
///
/// A plain function pointer so a smarter detector can be swapped in
/// without touching the prompt builder.
pub type LanguageDetector = fn(&str) -> Language;

/// Any Cyrillic codepoint selects Russian; everything else is English.
pub fn detect_language(text: &str) -> Language {
    if CYRILLIC.is_match(text) {
        Language::Russian
    } else {
        Language::English
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_is_english() {
        assert_eq!(detect_language("Alice: what's the weather?"), Language::English);
        assert_eq!(detect_language(""), Language::English);
    }

    #[test]
    fn test_cyrillic_is_russian() {
        assert_eq!(detect_language("Привет"), Language::Russian);
    }

    #[test]
    fn test_mixed_with_one_cyrillic_char_is_russian() {
        assert_eq!(detect_language("Bob: hello there, ж"), Language::Russian);
    }

    #[test]
    fn test_other_scripts_are_english() {
        assert_eq!(detect_language("こんにちは"), Language::English);
    }

    #[test]
    fn test_directives() {
        assert_eq!(Language::English.directive(), "Reply in English.");
        assert!(Language::Russian.directive().contains("русском"));
    }
}
