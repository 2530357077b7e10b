//! Post-processing for delegated topic extraction results.

use std::collections::HashMap;

/// Punctuation stripped from both ends of every returned keyword.
const STRIPPED_PUNCTUATION: &[char] = &[
    '.', ',', ';', ':', '!', '?', '"', '\'', '`', '(', ')', '[', ']', '{', '}', '<', '>', '«',
    '»', '„', '“', '”',
];

/// Strip the fixed punctuation set and surrounding whitespace from one
/// keyword. `None` when nothing survives.
#[must_use]
pub fn sanitize_keyword(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim_matches(|c: char| c.is_whitespace() || STRIPPED_PUNCTUATION.contains(&c))
        .trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Clean a whole extraction result, dropping keywords that sanitize to
/// nothing (each drop is logged with the article it came from).
#[must_use]
pub fn sanitize_topics(topics: HashMap<String, f64>, article_url: &str) -> Vec<(String, f64)> {
    let mut cleaned = Vec::with_capacity(topics.len());
    for (raw, relevancy) in topics {
        match sanitize_keyword(&raw) {
            Some(keyword) => cleaned.push((keyword, relevancy)),
            None => {
                tracing::debug!(
                    article = article_url,
                    keyword = %raw,
                    "dropping keyword that is empty after sanitation"
                );
            }
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("  inflation, ", "inflation")]
    #[case("(election)", "election")]
    #[case("\"monetary policy\"", "monetary policy")]
    #[case("u.s. economy", "u.s. economy")]
    fn strips_punctuation_and_keeps_the_core(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_keyword(raw), Some(expected.to_string()));
    }

    #[rstest]
    #[case("...")]
    #[case("  ")]
    #[case("(!?)")]
    fn drops_keywords_that_sanitize_to_nothing(#[case] raw: &str) {
        assert_eq!(sanitize_keyword(raw), None);
    }

    #[test]
    fn sanitize_topics_preserves_relevancy() {
        let mut topics = HashMap::new();
        topics.insert("economy.".to_string(), 0.8);
        topics.insert("???".to_string(), 0.5);

        let cleaned = sanitize_topics(topics, "https://outlet.example/a");
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].0, "economy");
        assert!((cleaned[0].1 - 0.8).abs() < f64::EPSILON);
    }
}
