//! Cheap token accounting for context-budget decisions.
//!
//! Counts are approximated as serialized JSON length in UTF-16 units / 4.

use serde::Serialize;

/// Fraction of the context budget past which history is compressed.
pub const COMPRESSION_RATIO: f64 = 0.8;

const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of any serializable value.
pub fn estimate_tokens<T: Serialize + ?Sized>(data: &T) -> usize {
    let chars = serde_json::to_string(data)
        .map(|s| s.encode_utf16().count())
        .unwrap_or(0);
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// True when `estimated_tokens` is strictly above 80% of `max_tokens`.
pub fn should_compress(estimated_tokens: usize, max_tokens: usize) -> bool {
    estimated_tokens as f64 > max_tokens as f64 * COMPRESSION_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        // "\"abc\"" is 5 chars -> 2 tokens
        assert_eq!(estimate_tokens("abc"), 2);
        // "[]" is 2 chars -> 1 token
        assert_eq!(estimate_tokens(&Vec::<u8>::new()), 1);
        // {"a":1} is 7 chars -> 2 tokens
        assert_eq!(estimate_tokens(&json!({"a": 1})), 2);
    }

    #[test]
    fn test_estimate_tokens_counts_utf16_units() {
        // "ção" serializes to 5 units but 7 bytes
        assert_eq!(estimate_tokens("ção"), 2);
        // each emoji is a surrogate pair: 2 quotes + 4 units
        assert_eq!(estimate_tokens("🎉🎉"), 2);
        assert_eq!(estimate_tokens(&"🎉".repeat(4)), 3);
    }

    #[test]
    fn test_should_compress_boundary() {
        assert!(!should_compress(800, 1000));
        assert!(should_compress(801, 1000));
        assert!(!should_compress(0, 1000));
        assert!(!should_compress(80, 100));
        assert!(should_compress(81, 100));
    }
}
