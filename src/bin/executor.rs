//! Executor binary (§4.E). Consumes the order outbox as a consumer group,
//! places each order against the exchange with the shared decimal-precision
//! fallback, and emits to the executed/errors streams. Acknowledges in a
//! finally-clause so a poison message never stalls the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::Decimal;

use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{load_dotenv, ExecutorConfig};
use bitvavo_trading_core::decimal_fallback::place_with_fallback;
use bitvavo_trading_core::exchange_client::{BitvavoClient, ExchangeClient, OrderRequest};
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::precision::{cache_path_default, PrecisionCache};

async fn shutdown_signal() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let f = flag.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        f.store(true, Ordering::SeqCst);
    });
    flag
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();
    let cfg = ExecutorConfig::default();

    if let Err(e) = metrics_server::install(cfg.metrics_port) {
        warn!("metrics server failed to install: {}", e);
    }

    let mut bus = match RedisEventBus::connect(&cfg.redis_url).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("cannot connect to event bus, exiting: {}", e);
            return;
        }
    };

    if let Err(e) = bus.ensure_group(&cfg.order_outbox_stream, &cfg.consumer_group).await {
        log::error!("cannot create consumer group: {}", e);
        return;
    }

    let mut client = BitvavoClient::new(cfg.bitvavo_api_key.clone(), cfg.bitvavo_api_secret.clone());
    let mut cache = PrecisionCache::load(cache_path_default());

    let stop = shutdown_signal().await;
    info!("executor: listening on {}", cfg.order_outbox_stream);

    while !stop.load(Ordering::SeqCst) {
        let records = match bus
            .read_group(&cfg.order_outbox_stream, &cfg.consumer_group, &cfg.consumer_name, 20, 1000)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("read_group failed: {}", e);
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        for rec in records {
            process_order(&mut bus, &cfg, &mut client, &mut cache, &rec.fields).await;
            let _ = bus.ack(&cfg.order_outbox_stream, &cfg.consumer_group, &rec.id).await;
        }
    }
    info!("executor: shutdown signal observed, exiting");
}

async fn process_order(
    bus: &mut dyn EventBus,
    cfg: &ExecutorConfig,
    client: &mut dyn ExchangeClient,
    cache: &mut PrecisionCache,
    fields: &std::collections::HashMap<String, String>,
) {
    let market = fields.get("market").cloned().unwrap_or_default();
    let side = fields.get("side").cloned().unwrap_or_else(|| "buy".to_string());
    let size_eur: f64 = fields.get("size_eur").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let price: f64 = fields.get("price").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let dry_run = fields.get("dry_run").map(|v| v == "true" || v == "1").unwrap_or(false);

    if market.is_empty() || size_eur <= 0.0 || price <= 0.0 {
        emit_error(bus, cfg, &market, "malformed_input", "order record missing market/size/price").await;
        return;
    }

    if dry_run {
        let ts = chrono::Utc::now().to_rfc3339();
        let amount_s = if side == "buy" { (size_eur / price).to_string() } else { size_eur.to_string() };
        let _ = bus
            .append(
                &cfg.executed_stream,
                &[
                    ("id", "DRY_OK"),
                    ("market", market.as_str()),
                    ("side", side.as_str()),
                    ("type", "market"),
                    ("amount", amount_s.as_str()),
                    ("price", price.to_string().as_str()),
                    ("ts", ts.as_str()),
                    ("resp", "{\"dry_run\":true}"),
                ],
            )
            .await;
        metrics::counter!(names::ORDERS_PLACED_TOTAL, "market" => market.clone()).increment(1);
        return;
    }

    // Market buys against a EUR quote spend amount in quote; everything else
    // converts the EUR notional to base using the signal's observed price.
    let (amount, amount_quote) = if side == "buy" {
        (None, Decimal::try_from(size_eur).ok())
    } else {
        let base_amount = Decimal::try_from(size_eur / price).ok();
        (base_amount, None)
    };

    let req = OrderRequest {
        market: market.clone(),
        side: side.clone(),
        order_type: "market".to_string(),
        amount,
        amount_quote,
        price: None,
        time_in_force: None,
        post_only: false,
        trigger_price: None,
        trigger_amount: None,
        operator_id: cfg.bitvavo_operator_id,
    };

    let start_decimals = cache.get(&market).unwrap_or(8);

    match place_with_fallback(client, cache, &market, &req, start_decimals).await {
        Ok(resp) if resp.status != "rejected" => {
            let ts = chrono::Utc::now().to_rfc3339();
            let amount_s = resp.fills.first().map(|f| f.amount.to_string()).unwrap_or_default();
            let price_s = resp.fills.first().map(|f| f.price.to_string()).unwrap_or_default();
            let resp_s = serde_json::to_string(&resp).unwrap_or_default();
            let _ = bus
                .append(
                    &cfg.executed_stream,
                    &[
                        ("id", resp.order_id.as_str()),
                        ("market", market.as_str()),
                        ("side", side.as_str()),
                        ("type", resp.order_type.as_str()),
                        ("amount", amount_s.as_str()),
                        ("price", price_s.as_str()),
                        ("ts", ts.as_str()),
                        ("resp", resp_s.as_str()),
                    ],
                )
                .await;
            metrics::counter!(names::ORDERS_PLACED_TOTAL, "market" => market.clone()).increment(1);
        }
        Ok(resp) => {
            let reason = resp.error.unwrap_or_else(|| "rejected".to_string());
            emit_error(bus, cfg, &market, "exchange_rejected", &reason).await;
        }
        Err(e) => {
            emit_error(bus, cfg, &market, "transport_error", &e.to_string()).await;
        }
    }
}

async fn emit_error(bus: &mut dyn EventBus, cfg: &ExecutorConfig, market: &str, error_class: &str, message: &str) {
    let ts = chrono::Utc::now().to_rfc3339();
    let _ = bus
        .append(
            &cfg.errors_stream,
            &[("ts", ts.as_str()), ("market", market), ("error_class", error_class), ("message", message)],
        )
        .await;
    metrics::counter!(names::ORDERS_REJECTED_TOTAL, "market" => market.to_string(), "reason" => error_class.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvavo_trading_core::bus::InMemoryEventBus;
    use bitvavo_trading_core::exchange_client::SimExchange;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn cfg() -> ExecutorConfig {
        ExecutorConfig {
            redis_url: String::new(),
            order_outbox_stream: "orders:shadow".into(),
            consumer_group: "executor".into(),
            consumer_name: "exec".into(),
            executed_stream: "orders:executed".into(),
            errors_stream: "orders:errors".into(),
            event_stream: "trading:events".into(),
            bitvavo_api_key: String::new(),
            bitvavo_api_secret: String::new(),
            bitvavo_operator_id: None,
            metrics_port: 9102,
        }
    }

    fn fields(extra: &[(&str, &str)]) -> std::collections::HashMap<String, String> {
        let mut f: std::collections::HashMap<String, String> = [
            ("market", "BTC-EUR"),
            ("side", "buy"),
            ("size_eur", "50"),
            ("price", "50000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            f.insert(k.to_string(), v.to_string());
        }
        f
    }

    /// A dry-run record must never reach `place_order` on the exchange client
    /// — it should be recorded onto the executed stream directly.
    #[tokio::test]
    async fn dry_run_record_is_recorded_without_placing_an_order() {
        let mut bus = InMemoryEventBus::default();
        let cfg = cfg();
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.set_price("BTC-EUR", Decimal::from_str("50000").unwrap());
        let mut cache = PrecisionCache::load(std::env::temp_dir().join("executor-test-unused.json"));

        process_order(&mut bus, &cfg, &mut sim, &mut cache, &fields(&[("dry_run", "true")])).await;

        assert!(sim.orders_placed.is_empty(), "dry-run must not place a real order");
        let executed = bus.streams.get("orders:executed").cloned().unwrap_or_default();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].fields.get("id").map(String::as_str), Some("DRY_OK"));
    }

    #[tokio::test]
    async fn live_record_places_an_order_through_the_exchange_client() {
        let mut bus = InMemoryEventBus::default();
        let cfg = cfg();
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.set_price("BTC-EUR", Decimal::from_str("50000").unwrap());
        let mut cache = PrecisionCache::load(std::env::temp_dir().join("executor-test-unused2.json"));

        process_order(&mut bus, &cfg, &mut sim, &mut cache, &fields(&[("dry_run", "false")])).await;

        assert_eq!(sim.orders_placed.len(), 1);
        let executed = bus.streams.get("orders:executed").cloned().unwrap_or_default();
        assert_eq!(executed.len(), 1);
        assert_ne!(executed[0].fields.get("id").map(String::as_str), Some("DRY_OK"));
    }
}
