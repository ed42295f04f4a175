//! Trading intent classification (§3 data model). Grounded on
//! original_source's `services/trading_core/trading_core/decision.py`:
//! intents carry the raw signal fields plus the `details` map the signal
//! engine produced, and `classify_intent` is a pure function of which keys
//! are present in `details` — no side channel, no additional state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    Momentum,
    MeanReversion,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub signal_id: String,
    pub market: String,
    pub side: Side,
    pub price: f64,
    pub size_eur: f64,
    pub score: f64,
    pub reasons: Vec<String>,
    pub details: HashMap<String, String>,
    pub kind: IntentKind,
}

/// `details` carrying `wick_ratio` signals a mean-reversion entry (wick
/// rejection); `vol_std` signals a momentum entry (volatility breakout). A
/// signal can plausibly carry both in its `details` map; mean-reversion
/// takes precedence, matching original_source's `classify_intent`, which
/// checks `details.get("wick_ratio")` before `details.get("vol_std")`.
pub fn classify_intent(details: &HashMap<String, String>) -> IntentKind {
    if details.contains_key("wick_ratio") {
        IntentKind::MeanReversion
    } else if details.contains_key("vol_std") {
        IntentKind::Momentum
    } else {
        IntentKind::Generic
    }
}

impl Intent {
    pub fn new(
        signal_id: impl Into<String>,
        market: impl Into<String>,
        side: Side,
        price: f64,
        size_eur: f64,
        score: f64,
        reasons: Vec<String>,
        details: HashMap<String, String>,
    ) -> Self {
        let kind = classify_intent(&details);
        Self {
            signal_id: signal_id.into(),
            market: market.into(),
            side,
            price,
            size_eur,
            score,
            reasons,
            details,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details_with(key: &str) -> HashMap<String, String> {
        let mut d = HashMap::new();
        d.insert(key.to_string(), "1".to_string());
        d
    }

    #[test]
    fn vol_std_key_classifies_as_momentum() {
        assert_eq!(classify_intent(&details_with("vol_std")), IntentKind::Momentum);
    }

    #[test]
    fn wick_ratio_key_classifies_as_mean_reversion() {
        assert_eq!(classify_intent(&details_with("wick_ratio")), IntentKind::MeanReversion);
    }

    #[test]
    fn neither_key_classifies_as_generic() {
        assert_eq!(classify_intent(&HashMap::new()), IntentKind::Generic);
    }

    #[test]
    fn both_keys_present_prefers_mean_reversion() {
        let mut d = details_with("vol_std");
        d.insert("wick_ratio".to_string(), "2.5".to_string());
        assert_eq!(classify_intent(&d), IntentKind::MeanReversion);
    }

    #[test]
    fn intent_new_derives_kind_from_details() {
        let intent = Intent::new(
            "sig-1",
            "BTC-EUR",
            Side::Buy,
            50_000.0,
            100.0,
            2.0,
            vec!["vol_std>=0.002".to_string()],
            details_with("vol_std"),
        );
        assert_eq!(intent.kind, IntentKind::Momentum);
    }
}
