use regex::Regex;
use serde::Serialize;

/// Category of a parsed coupon value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponKind {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Coupon {
    pub kind: CouponKind,
    pub value: f64,
    pub raw_text: String,
}

trait CouponPattern: Send + Sync {
    fn label(&self) -> &'static str;
    fn parse(&self, text: &str) -> Option<Coupon>;
}

/// "Save 20%", "节省 20%".
struct PercentagePattern {
    regex: Regex,
}

impl PercentagePattern {
    fn new() -> Self {
        Self {
            regex: Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("static regex"),
        }
    }
}

impl CouponPattern for PercentagePattern {
    fn label(&self) -> &'static str {
        "percentage"
    }

    fn parse(&self, text: &str) -> Option<Coupon> {
        let captures = self.regex.captures(text)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        Some(Coupon {
            kind: CouponKind::Percentage,
            value,
            raw_text: text.to_string(),
        })
    }
}

/// "Save $30", "Save US$12.50"; whitespace-insensitive.
struct FixedAmountPattern {
    regex: Regex,
}

impl FixedAmountPattern {
    fn new() -> Self {
        Self {
            regex: Regex::new(r"(?:US)?\$(\d+(?:\.\d{1,2})?)").expect("static regex"),
        }
    }
}

impl CouponPattern for FixedAmountPattern {
    fn label(&self) -> &'static str {
        "fixed"
    }

    fn parse(&self, text: &str) -> Option<Coupon> {
        let normalized: String = text.split_whitespace().collect();
        let captures = self.regex.captures(&normalized)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        Some(Coupon {
            kind: CouponKind::Fixed,
            value,
            raw_text: text.to_string(),
        })
    }
}

/// "Save 30", "节省 30" — a number with no unit marker. The kind comes from
/// a percent sign elsewhere in the text, fixed amount otherwise.
struct BareNumberPattern {
    regex: Regex,
}

impl BareNumberPattern {
    fn new() -> Self {
        Self {
            regex: Regex::new(r"(?:Save|节省)\s*(\d+(?:\.\d{1,2})?)").expect("static regex"),
        }
    }
}

impl CouponPattern for BareNumberPattern {
    fn label(&self) -> &'static str {
        "bare_number"
    }

    fn parse(&self, text: &str) -> Option<Coupon> {
        let captures = self.regex.captures(text)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        let kind = if text.contains('%') {
            CouponKind::Percentage
        } else {
            CouponKind::Fixed
        };
        Some(Coupon {
            kind,
            value,
            raw_text: text.to_string(),
        })
    }
}

/// Ordered chain of tagged value parsers. Each variant is tried in sequence;
/// the first match wins, no match means the element carries no coupon.
pub struct CouponParser {
    patterns: Vec<Box<dyn CouponPattern>>,
}

impl CouponParser {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                Box::new(PercentagePattern::new()),
                Box::new(FixedAmountPattern::new()),
                Box::new(BareNumberPattern::new()),
            ],
        }
    }

    pub fn parse(&self, text: &str) -> Option<Coupon> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        for pattern in &self.patterns {
            if let Some(coupon) = pattern.parse(trimmed) {
                tracing::trace!(pattern = pattern.label(), value = coupon.value, "coupon matched");
                return Some(coupon);
            }
        }
        None
    }
}

impl Default for CouponParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_percentage_badge() {
        let parser = CouponParser::new();
        let coupon = parser.parse("Save 20%").unwrap();
        assert_eq!(coupon.kind, CouponKind::Percentage);
        assert_eq!(coupon.value, 20.0);
    }

    #[test]
    fn parses_fixed_amount_with_currency_prefix() {
        let parser = CouponParser::new();
        let coupon = parser.parse("Save US$12.50").unwrap();
        assert_eq!(coupon.kind, CouponKind::Fixed);
        assert_eq!(coupon.value, 12.5);
    }

    #[test]
    fn parses_fixed_amount_with_spaces() {
        let parser = CouponParser::new();
        let coupon = parser.parse("Save US$ 30").unwrap();
        assert_eq!(coupon.kind, CouponKind::Fixed);
        assert_eq!(coupon.value, 30.0);
    }

    #[test]
    fn percentage_wins_over_amount_when_both_present() {
        // "20% off orders over $100" is a percentage coupon.
        let parser = CouponParser::new();
        let coupon = parser.parse("20% off orders over $100").unwrap();
        assert_eq!(coupon.kind, CouponKind::Percentage);
        assert_eq!(coupon.value, 20.0);
    }

    #[test]
    fn bare_number_after_save_is_a_fixed_amount() {
        let parser = CouponParser::new();
        let coupon = parser.parse("Save 30").unwrap();
        assert_eq!(coupon.kind, CouponKind::Fixed);
        assert_eq!(coupon.value, 30.0);

        let coupon = parser.parse("节省 12.50").unwrap();
        assert_eq!(coupon.kind, CouponKind::Fixed);
        assert_eq!(coupon.value, 12.5);
    }

    #[test]
    fn bare_number_with_stray_percent_sign_is_a_percentage() {
        // The % is not adjacent to the digits, so the percentage pattern
        // itself does not match.
        let parser = CouponParser::new();
        let coupon = parser.parse("% voucher: Save 15").unwrap();
        assert_eq!(coupon.kind, CouponKind::Percentage);
        assert_eq!(coupon.value, 15.0);
    }

    #[test]
    fn plain_text_is_not_a_coupon() {
        let parser = CouponParser::new();
        assert!(parser.parse("Best seller").is_none());
        assert!(parser.parse("").is_none());
        assert!(parser.parse("   ").is_none());
    }
}
