//! Decimal-precision helpers: floor-truncation to a market's accepted
//! decimal count, the "with N decimal digits" hint parser, and the
//! persisted `market -> accepted_amount_decimals` cache.
//!
//! Grounded on original_source's `scripts/trade_watcher_final.py`
//! (`qdown`, `parse_decimals_hint`, `load_cache`/`save_cache`).

use crate::atomic_file::write_atomic;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Floor-truncates `value` to `decimals` digits. Never rounds up.
pub fn truncate_floor(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Parses an exchange error message for a "with N decimal digits" hint,
/// as Bitvavo returns on an over-precise amount.
pub fn parse_decimals_hint(message: &str) -> Option<u32> {
    let re = Regex::new(r"with (\d+) decimal digits").ok()?;
    let caps = re.captures(message)?;
    caps.get(1)?.as_str().parse::<u32>().ok()
}

/// In-memory view of `market -> accepted_amount_decimals`, backed by an
/// atomically-written JSON file (§6.2 `precision_cache`).
#[derive(Debug, Clone, Default)]
pub struct PrecisionCache {
    path: PathBuf,
    entries: HashMap<String, u32>,
}

impl PrecisionCache {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, u32>>(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    pub fn get(&self, market: &str) -> Option<u32> {
        self.entries.get(market).copied()
    }

    /// Records the accepted decimal count and persists the whole cache
    /// atomically. Future orders for this market should start at this count.
    pub fn set(&mut self, market: &str, decimals: u32) -> std::io::Result<()> {
        self.entries.insert(market.to_string(), decimals);
        let body = serde_json::to_string(&self.entries).unwrap_or_else(|_| "{}".to_string());
        write_atomic(&self.path, &body)
    }
}

/// Tries `amount` at `start_decimals`, then `start_decimals-1, ..., 0`,
/// invoking `attempt` once per decimal count until it returns `Ok` or the
/// range is exhausted. Mirrors the executor's (§4.E.4) and exit guard's
/// (§4.F.4) shared decimal-fallback procedure, parameterized over the
/// actual order-placement call so both components reuse it.
pub fn decimal_fallback_range(start_decimals: u32) -> Vec<u32> {
    (0..=start_decimals).rev().collect()
}

pub fn format_amount(amount: Decimal, decimals: u32) -> String {
    truncate_floor(amount, decimals).to_string()
}

pub fn parse_amount(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw).ok()
}

pub fn cache_path_default() -> PathBuf {
    Path::new(&std::env::var("PRECISION_CACHE_PATH").unwrap_or_else(|_| "precision_cache.json".to_string()))
        .to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_floor_never_rounds_up() {
        let v = Decimal::from_str("0.123456").unwrap();
        assert_eq!(truncate_floor(v, 2).to_string(), "0.12");
        assert_eq!(truncate_floor(v, 0).to_string(), "0");
    }

    #[test]
    fn parse_decimals_hint_extracts_n() {
        assert_eq!(
            parse_decimals_hint("Amount must be with 2 decimal digits or less"),
            Some(2)
        );
        assert_eq!(parse_decimals_hint("unrelated error"), None);
    }

    #[test]
    fn decimal_fallback_range_walks_downward_including_zero() {
        assert_eq!(decimal_fallback_range(3), vec![3, 2, 1, 0]);
        assert_eq!(decimal_fallback_range(0), vec![0]);
    }

    #[test]
    fn precision_cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("precision-cache-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("precision_cache.json");
        let mut cache = PrecisionCache::load(&path);
        assert_eq!(cache.get("BTC-EUR"), None);
        cache.set("BTC-EUR", 2).unwrap();

        let reloaded = PrecisionCache::load(&path);
        assert_eq!(reloaded.get("BTC-EUR"), Some(2));
        std::fs::remove_dir_all(&dir).ok();
    }
}
