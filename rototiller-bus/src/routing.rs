//! Topic routing
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern,
//! `*` matches exactly one word and `#` matches zero or more words.

use crate::error::{BusError, Result};

/// Checks that a binding pattern is well formed
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() || pattern.split('.').any(str::is_empty) {
        return Err(BusError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

/// Whether `routing_key` is routed by a binding on `pattern`
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(_), None) => false,
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((key_word, key_rest))) => {
            word == key_word && match_words(rest, key_rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("job.created", "job.created"));
        assert!(!matches("job.created", "job.completed"));
        assert!(!matches("job.created", "job.created.extra"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(matches("job.*", "job.created"));
        assert!(!matches("job.*", "job"));
        assert!(!matches("job.*", "job.created.v2"));
        assert!(matches("*.created", "storage.created"));
    }

    #[test]
    fn test_hash_matches_any_suffix() {
        assert!(matches("job.#", "job.created"));
        assert!(matches("job.#", "job"));
        assert!(matches("job.#", "job.a.b.c"));
        assert!(!matches("job.#", "storage.created"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("#.completed", "job.completed"));
        assert!(matches("job.#.done", "job.x.y.done"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("job.#").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("job..created").is_err());
        assert!(validate_pattern(".job").is_err());
    }
}
