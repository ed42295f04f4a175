//! Event-bus topic and KV key names shared across every binary (§6.1, §6.2).
//! Centralized here so the producer and consumer of each topic never drift
//! apart on a literal string.

pub const BOOK_TOPIC_PREFIX: &str = "bitvavo:book:";
pub const BOOK_TOPIC_AGG: &str = "bitvavo:book";
pub const CANDLES_TOPIC_PREFIX: &str = "bitvavo:candles:";
pub const TICKER24H_TOPIC: &str = "bitvavo:ticker24h";
pub const TRADES_TOPIC: &str = "bitvavo:trades";

pub const SIGNAL_STREAM_DEFAULT: &str = "signals:baseline";
pub const ORDER_OUTBOX_SHADOW: &str = "orders:shadow";
pub const ORDER_OUTBOX_LIVE: &str = "orders:live";
pub const ORDERS_EXECUTED: &str = "orders:executed";
pub const ORDERS_ERRORS: &str = "orders:errors";
pub const TRADING_EVENTS: &str = "trading:events";

pub const KEY_EUR_AVAILABLE: &str = "account:eur_available";
pub const KEY_SLOT_BUDGET_EUR: &str = "account:slot_budget_eur";
pub const KEY_EXPOSURE: &str = "trading:exposure";
pub const KEY_POSITIONS: &str = "trading:positions";
pub const KEY_KILL_SWITCH: &str = "trading:kill";
pub const EXPOSURE_GLOBAL_FIELD: &str = "_global";

pub const LOCK_GUARD_PREFIX: &str = "lock:guard:";
pub const VIRTPOS_PREFIX: &str = "virtpos:";

pub const ACTIVE_MARKETS_SET: &str = "active_markets";
pub const ACTIVE_MARKETS_LIST: &str = "active_markets:list";
pub const ACTIVE_MARKETS_VERSION: &str = "active_markets:version";
pub const GUARD_ACTIVE_MARKETS_LIST: &str = "guard:active_markets";

pub fn book_topic(market: &str) -> String {
    format!("{}{}", BOOK_TOPIC_PREFIX, market)
}

pub fn candles_topic(interval: &str) -> String {
    format!("{}{}", CANDLES_TOPIC_PREFIX, interval)
}

pub fn lock_key(market: &str) -> String {
    format!("{}{}", LOCK_GUARD_PREFIX, market)
}

pub fn virtpos_key(market: &str) -> String {
    format!("{}{}", VIRTPOS_PREFIX, market)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_topic_namespaces_by_market() {
        assert_eq!(book_topic("BTC-EUR"), "bitvavo:book:BTC-EUR");
    }

    #[test]
    fn lock_and_virtpos_keys_namespace_by_market() {
        assert_eq!(lock_key("ETH-EUR"), "lock:guard:ETH-EUR");
        assert_eq!(virtpos_key("ETH-EUR"), "virtpos:ETH-EUR");
    }
}
