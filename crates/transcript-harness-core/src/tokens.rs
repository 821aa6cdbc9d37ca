//! Token estimation.
//!
//! Budgets are enforced against a character heuristic rather than a real
//! tokenizer. The estimate is subadditive: the token count of a
//! concatenation never exceeds the sum of its parts' counts, so a budget
//! checked piece by piece also holds for the joined text.

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text` (rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Largest character count that fits in `tokens`.
pub fn chars_for_tokens(tokens: usize) -> usize {
    tokens.saturating_mul(CHARS_PER_TOKEN)
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Shorten `text` to fit `max_tokens`, marking the cut.
///
/// The result, marker included, never exceeds `max_tokens`.
pub fn excerpt(text: &str, max_tokens: usize) -> String {
    const MARKER: &str = " [...]";
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = chars_for_tokens(max_tokens);
    let marker_chars = MARKER.chars().count();
    if max_chars <= marker_chars {
        return truncate_chars(text, max_chars).to_string();
    }
    let mut out = truncate_chars(text, max_chars - marker_chars)
        .trim_end()
        .to_string();
    out.push_str(MARKER);
    out
}
