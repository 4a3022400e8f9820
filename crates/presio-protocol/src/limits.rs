//! Per-field byte limits for the presence payload.
//!
//! The presence service silently truncates or rejects over-long fields, so
//! every text field is passed through [`sanitize`] before transmission.

/// Details / state line limit.
pub const MAX_LINE_BYTES: usize = 128;

/// Large / small image key limit.
pub const MAX_IMAGE_KEY_BYTES: usize = 256;

/// Large / small image hover text limit.
pub const MAX_IMAGE_TEXT_BYTES: usize = 128;

/// Party id limit.
pub const MAX_PARTY_ID_BYTES: usize = 128;

/// Join / match / spectate secret limit.
pub const MAX_SECRET_BYTES: usize = 128;

/// Button label limit.
pub const MAX_BUTTON_LABEL_BYTES: usize = 32;

/// Button url limit.
pub const MAX_BUTTON_URL_BYTES: usize = 512;

/// Minimum trimmed length for a non-empty field.
pub const MIN_FIELD_CHARS: usize = 2;

/// Remove any invalid data from a presence field.
///
/// The input is trimmed, then rejected if the trimmed length is below
/// [`MIN_FIELD_CHARS`] or the UTF-8 byte length reaches `max_bytes`.
/// Rejected input degrades to the (trimmed) fallback; sanitization is
/// never an error.
#[must_use]
pub fn sanitize(input: &str, max_bytes: usize, fallback: &str) -> String {
    let trimmed = input.trim();
    if trimmed.chars().count() < MIN_FIELD_CHARS || trimmed.len() >= max_bytes {
        fallback.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Remove any invalid data from a presence field, degrading to empty.
#[must_use]
pub fn sanitize_or_empty(input: &str, max_bytes: usize) -> String {
    sanitize(input, max_bytes, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_passthrough() {
        let input = "a".repeat(127);
        assert_eq!(sanitize_or_empty(&input, MAX_LINE_BYTES), input);
    }

    #[test]
    fn test_sanitize_rejects_over_limit() {
        // 129 bytes >= 128 limit
        let input = "a".repeat(129);
        assert_eq!(sanitize_or_empty(&input, MAX_LINE_BYTES), "");
        // Exactly at the limit is also rejected
        let input = "a".repeat(128);
        assert_eq!(sanitize_or_empty(&input, MAX_LINE_BYTES), "");
    }

    #[test]
    fn test_sanitize_rejects_short() {
        assert_eq!(sanitize_or_empty("x", MAX_LINE_BYTES), "");
        assert_eq!(sanitize_or_empty("  x  ", MAX_LINE_BYTES), "");
        assert_eq!(sanitize_or_empty("", MAX_LINE_BYTES), "");
    }

    #[test]
    fn test_sanitize_trims() {
        assert_eq!(sanitize_or_empty("  hello  ", MAX_LINE_BYTES), "hello");
    }

    #[test]
    fn test_sanitize_fallback() {
        assert_eq!(sanitize("x", MAX_LINE_BYTES, "fallback"), "fallback");
        assert_eq!(sanitize("", MAX_LINE_BYTES, " padded "), "padded");
    }

    #[test]
    fn test_sanitize_counts_bytes_not_chars() {
        // 43 four-byte chars = 172 bytes, over a 128-byte limit
        let input = "\u{1F600}".repeat(43);
        assert_eq!(sanitize_or_empty(&input, MAX_LINE_BYTES), "");
        // 31 four-byte chars = 124 bytes, passes
        let input = "\u{1F600}".repeat(31);
        assert_eq!(sanitize_or_empty(&input, MAX_LINE_BYTES), input);
    }
}
