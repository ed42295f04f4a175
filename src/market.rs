//! The `Market` entity: a `{base, quote}` pair restricted to quote `EUR`,
//! carrying the precision metadata the executor and exit guard truncate
//! against.

use serde::{Deserialize, Serialize};

pub const QUOTE: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Market {
    pub base: String,
    pub quote: String,
}

impl Market {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: QUOTE.to_string(),
        }
    }

    /// Parses a `"BASE-QUOTE"` symbol such as `"BTC-EUR"`.
    pub fn parse(symbol: &str) -> Option<Self> {
        let (base, quote) = symbol.split_once('-')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    pub fn symbol(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    pub fn is_eur_quoted(&self) -> bool {
        self.quote == QUOTE
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Precision metadata for a market: decimal counts and minimum order sizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketPrecision {
    pub price_decimals: u32,
    pub amount_decimals: u32,
    pub min_order_base: f64,
    pub min_order_quote: f64,
}

impl Default for MarketPrecision {
    fn default() -> Self {
        // Conservative defaults when exchange metadata hasn't been fetched yet,
        // matching original_source's order_guard_bitvavo.py fallback.
        Self {
            price_decimals: 5,
            amount_decimals: 8,
            min_order_base: 0.0,
            min_order_quote: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_base_and_quote() {
        let m = Market::parse("BTC-EUR").unwrap();
        assert_eq!(m.base, "BTC");
        assert_eq!(m.quote, "EUR");
        assert!(m.is_eur_quoted());
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(Market::parse("BTCEUR").is_none());
    }

    #[test]
    fn symbol_round_trips() {
        let m = Market::new("ETH");
        assert_eq!(m.symbol(), "ETH-EUR");
    }
}
