//! Price text parsing.

use regex::Regex;
use std::sync::OnceLock;

fn price_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // First number-looking run, allowing thousands separators.
        Regex::new(r"(\d[\d,]*(?:\.\d+)?)").unwrap()
    })
}

/// Parse a displayed price like "₹2,499.00", "Rs. 1,299" or "MRP: ₹450"
/// into a numeric amount. Returns None when no number is present or the
/// number is zero.
pub fn parse_price(text: &str) -> Option<f64> {
    let captures = price_pattern().captures(text)?;
    let raw = captures.get(1)?.as_str().replace(',', "");
    let value: f64 = raw.parse().ok()?;
    if value > 0.0 {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rupee_formats() {
        assert_eq!(parse_price("₹2,499.00"), Some(2_499.0));
        assert_eq!(parse_price("Rs. 1,299"), Some(1_299.0));
        assert_eq!(parse_price("MRP: ₹450"), Some(450.0));
        assert_eq!(parse_price("₹ 52,000"), Some(52_000.0));
        assert_eq!(parse_price("1,23,456"), Some(123_456.0));
    }

    #[test]
    fn rejects_non_prices() {
        assert_eq!(parse_price("Out of stock"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("₹0"), None);
    }

    #[test]
    fn picks_first_number_in_mixed_text() {
        assert_eq!(parse_price("₹999 ₹1,499 33% off"), Some(999.0));
    }
}
