//! Shared decimal-precision fallback procedure used by the executor (§4.E.4)
//! and the exit guard (§4.F.4): on a precision rejection, walk the accepted
//! decimal count downward and retry, caching the first count that sticks.
//! Grounded on original_source's `scripts/trade_watcher_final.py` retry loop
//! around `qdown`/`parse_decimals_hint`.

use crate::error::PipelineError;
use crate::exchange_client::{ExchangeClient, OrderRequest, OrderResponse};
use crate::precision::{decimal_fallback_range, parse_decimals_hint, PrecisionCache};

/// Places `req` via `client`, starting at `start_decimals`. If Bitvavo
/// rejects the amount with a "with N decimal digits" hint, truncates to that
/// hint (or the next lower candidate in the fallback range) and retries,
/// until an order is accepted or the range is exhausted. Records the
/// accepted decimal count in `cache` on success.
pub async fn place_with_fallback(
    client: &mut dyn ExchangeClient,
    cache: &mut PrecisionCache,
    market: &str,
    req: &OrderRequest,
    start_decimals: u32,
) -> Result<OrderResponse, PipelineError> {
    let mut candidates = decimal_fallback_range(start_decimals).into_iter();
    let mut decimals = candidates.next().unwrap_or(0);

    loop {
        let attempt = req.with_amount_decimals(decimals);
        let resp = client.place_order(&attempt).await?;
        if resp.status != "rejected" {
            let _ = cache.set(market, decimals);
            return Ok(resp);
        }

        let hint = resp.error.as_deref().and_then(parse_decimals_hint);
        decimals = match hint.filter(|&h| h < decimals) {
            Some(hinted) => hinted,
            None => match candidates.next() {
                Some(next) => next,
                None => return Ok(resp),
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_client::SimExchange;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn req(amount: &str) -> OrderRequest {
        OrderRequest {
            market: "BTC-EUR".into(),
            side: "sell".into(),
            order_type: "market".into(),
            amount: Some(Decimal::from_str(amount).unwrap()),
            amount_quote: None,
            price: None,
            time_in_force: None,
            post_only: false,
            trigger_price: None,
            trigger_amount: None,
            operator_id: None,
        }
    }

    #[tokio::test]
    async fn falls_back_until_the_exchange_accepts_and_caches_the_decimals() {
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.reject_until_decimals = Some(4);
        sim.set_price("BTC-EUR", Decimal::from_str("50000").unwrap());

        let dir = std::env::temp_dir().join(format!("decimal-fallback-test-{}", uuid::Uuid::new_v4()));
        let mut cache = PrecisionCache::load(dir.join("cache.json"));

        let resp = place_with_fallback(&mut sim, &mut cache, "BTC-EUR", &req("0.123456"), 8)
            .await
            .unwrap();
        assert_eq!(resp.status, "filled");
        assert_eq!(cache.get("BTC-EUR"), Some(4));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn accepts_immediately_when_starting_precision_already_fits() {
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.set_price("BTC-EUR", Decimal::from_str("50000").unwrap());

        let dir = std::env::temp_dir().join(format!("decimal-fallback-test-{}", uuid::Uuid::new_v4()));
        let mut cache = PrecisionCache::load(dir.join("cache.json"));

        let resp = place_with_fallback(&mut sim, &mut cache, "BTC-EUR", &req("0.01"), 8)
            .await
            .unwrap();
        assert_eq!(resp.status, "filled");
        std::fs::remove_dir_all(&dir).ok();
    }
}
