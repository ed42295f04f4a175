//! Environment-variable configuration, loaded once per process via `dotenvy`
//! then read with typed defaults — the Rust equivalent of original_source's
//! `_clean_env`/`_env_float`/`_env_int`/`_env_bool` coercion helpers.

use std::str::FromStr;

/// Call once at the top of every binary's `main`.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

pub fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Shared config surface for the signal engine (§4.C / §6.4).
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub redis_url: String,
    pub spread_bps_max: f64,
    pub vol_window: usize,
    pub vol_std_min: f64,
    pub vol_spike_window: usize,
    pub vol_spike_mult: f64,
    pub wick_ratio_min: f64,
    pub signal_stream: String,
    pub idle_flush_sec: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            spread_bps_max: env_parse("SPREAD_BPS_MAX", 15.0),
            vol_window: env_parse("VOL_WINDOW", 30),
            vol_std_min: env_parse("VOL_STD_MIN", 0.002),
            vol_spike_window: env_parse("VOL_SPIKE_WINDOW", 60),
            vol_spike_mult: env_parse("VOL_SPIKE_MULT", 3.0),
            wick_ratio_min: env_parse("WICK_RATIO_MIN", 2.0),
            signal_stream: env_str("SIGNAL_STREAM", "signals:baseline"),
            idle_flush_sec: env_parse("IDLE_FLUSH_SEC", 1.0),
        }
    }
}

/// Shared config surface for the trading core (§4.D / §6.4).
#[derive(Debug, Clone)]
pub struct TradingCoreConfig {
    pub redis_url: String,
    pub signal_stream: String,
    pub order_outbox_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub dry_run: bool,
    pub max_concurrent_pos: i64,
    pub max_global_exposure_eur: Option<f64>,
    pub max_per_asset_eur: Option<f64>,
    pub per_asset_frac: Option<f64>,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub trailing_pct: f64,
}

impl Default for TradingCoreConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            signal_stream: env_str("SIGNAL_STREAM", "signals:baseline"),
            order_outbox_stream: env_str("ORDER_OUTBOX_STREAM", "orders:shadow"),
            consumer_group: env_str("CONSUMER_GROUP", "trading_core"),
            consumer_name: env_str("CONSUMER_NAME", "core"),
            dry_run: env_bool("DRY_RUN", true),
            max_concurrent_pos: env_parse("MAX_CONCURRENT_POS", 0),
            max_global_exposure_eur: std::env::var("MAX_GLOBAL_EXPOSURE_EUR")
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok()),
            max_per_asset_eur: std::env::var("MAX_PER_ASSET_EUR")
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok()),
            per_asset_frac: std::env::var("PER_ASSET_FRAC")
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok()),
            tp_pct: env_parse("TP_PCT", 0.01),
            sl_pct: env_parse("SL_PCT", 0.01),
            trailing_pct: env_parse("TRAILING_PCT", 0.04),
        }
    }
}

/// Shared config surface for the consolidated ingest binary (§4.B).
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub redis_url: String,
    pub markets: Vec<String>,
    pub channels: Vec<String>,
    pub orderbook_depth: usize,
    pub drain_grace_ms: u64,
    pub rate_min: u32,
    pub parquet_flush_sec: f64,
    pub metrics_port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            markets: env_csv("INGEST_MARKETS", &["BTC-EUR", "ETH-EUR"]),
            channels: env_csv("INGEST_CHANNELS", &["book"]),
            orderbook_depth: env_parse("ORDERBOOK_DEPTH", 25),
            drain_grace_ms: env_parse("DRAIN_GRACE_MS", 250),
            rate_min: env_parse("RATE_MIN", 150),
            parquet_flush_sec: env_parse("PARQUET_FLUSH_SEC", 5.0),
            metrics_port: env_parse("METRICS_PORT", 9101),
        }
    }
}

/// Shared config surface for the executor (§4.E).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub redis_url: String,
    pub order_outbox_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub executed_stream: String,
    pub errors_stream: String,
    pub event_stream: String,
    pub bitvavo_api_key: String,
    pub bitvavo_api_secret: String,
    pub bitvavo_operator_id: Option<i64>,
    pub metrics_port: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            order_outbox_stream: env_str("ORDER_OUTBOX_STREAM", "orders:shadow"),
            consumer_group: env_str("CONSUMER_GROUP", "executor"),
            consumer_name: env_str("CONSUMER_NAME", "exec"),
            executed_stream: env_str("ORDERS_EXECUTED_STREAM", "orders:executed"),
            errors_stream: env_str("ORDERS_ERRORS_STREAM", "orders:errors"),
            event_stream: env_str("EVENT_STREAM", "trading:events"),
            bitvavo_api_key: env_str("BITVAVO_API_KEY", ""),
            bitvavo_api_secret: env_str("BITVAVO_API_SECRET", ""),
            bitvavo_operator_id: std::env::var("BITVAVO_OPERATOR_ID")
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok()),
            metrics_port: env_parse("METRICS_PORT", 9102),
        }
    }
}

/// Shared config surface for the per-market exit guard (§4.F).
#[derive(Debug, Clone)]
pub struct ExitGuardConfig {
    pub redis_url: String,
    pub order_exec_stream: String,
    pub poll_sec: f64,
    pub lease_ttl_sec: u64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trail_sl_pct: f64,
    pub allow_live: bool,
    pub metrics_port: u16,
}

impl Default for ExitGuardConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            order_exec_stream: env_str("ORDER_EXEC_STREAM", "orders:executed"),
            poll_sec: env_parse("GUARD_POLL_SEC", 0.5),
            lease_ttl_sec: env_parse("GUARD_LEASE_TTL_SEC", 10),
            take_profit_pct: env_parse("TAKE_PROFIT_PCT", 0.01),
            stop_loss_pct: env_parse("STOP_LOSS_PCT", 0.01),
            trail_sl_pct: env_parse("TRAILING_PCT", 0.04),
            allow_live: env_bool("GUARD_ALLOW_LIVE", false),
            metrics_port: env_parse("METRICS_PORT", 9105),
        }
    }
}

/// Shared config surface for the reconciler + metrics mux (§4.G).
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub redis_url: String,
    pub max_concurrency: usize,
    pub prom_base: u16,
    pub prom_range: u16,
    pub reconciler_prom_port: u16,
    pub deny_bases: Vec<String>,
    pub loop_sleep_sec: f64,
    pub env_dir: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            redis_url: env_str("REDIS_URL", "redis://127.0.0.1:6379/0"),
            max_concurrency: env_parse("GUARD_MAX_CONCURRENCY", 5),
            prom_base: env_parse("GUARD_PROM_BASE", 9105),
            prom_range: env_parse("GUARD_PROM_RANGE", 50),
            reconciler_prom_port: env_parse("RECONCILER_PROM_PORT", 9111),
            deny_bases: env_csv(
                "PAIRSEL_DENY_BASES",
                &[
                    "BTC", "ETH", "BNB", "ADA", "SOL", "XRP", "USDT", "USDC", "EUR", "USD", "DAI",
                    "TUSD", "FDUSD", "EURS", "USDE",
                ],
            ),
            loop_sleep_sec: env_parse("LOOP_SLEEP_SEC", 3.0),
            env_dir: env_str("GUARD_ENV_DIR", "/etc/trading/guard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_truthy_spellings() {
        std::env::set_var("TEST_BOOL_FLAG_A", "yes");
        assert!(env_bool("TEST_BOOL_FLAG_A", false));
        std::env::remove_var("TEST_BOOL_FLAG_A");
    }

    #[test]
    fn env_bool_falls_back_to_default_when_unset() {
        std::env::remove_var("TEST_BOOL_FLAG_B");
        assert!(!env_bool("TEST_BOOL_FLAG_B", false));
    }

    #[test]
    fn env_csv_splits_and_trims() {
        std::env::set_var("TEST_CSV_KEY", "BTC, ETH ,,SOL");
        let v = env_csv("TEST_CSV_KEY", &[]);
        assert_eq!(v, vec!["BTC", "ETH", "SOL"]);
        std::env::remove_var("TEST_CSV_KEY");
    }
}
