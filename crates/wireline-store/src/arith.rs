//! Base-10 parsing for `incr`/`decr` item values.

use thiserror::Error;

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithError {
    #[error("item not found")]
    NotFound,
    #[error("cannot increment or decrement non-numeric value")]
    NonNumeric,
}

/// Parses a decimal, non-negative `u64` from an item's raw bytes.
///
/// Rejects anything with a sign, leading/trailing whitespace, or non-digit
/// characters rather than stopping at the first one, matching the strict
/// "the whole value is a number" rule `incr`/`decr` rely on.
pub fn parse_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    if !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_digits() {
        assert_eq!(parse_u64(b"42"), Some(42));
        assert_eq!(parse_u64(b"0"), Some(0));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(parse_u64(b"4a2"), None);
        assert_eq!(parse_u64(b"-4"), None);
        assert_eq!(parse_u64(b" 4"), None);
        assert_eq!(parse_u64(b""), None);
    }
}
