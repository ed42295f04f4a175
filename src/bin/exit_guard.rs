//! Per-market exit guard binary (§4.F). One process per market (launched by
//! the reconciler with `MARKET`/`GUARD_ENV_FILE` set in its environment).
//! Holds a `lock:guard:<market>` lease, tracks a virtual position, keeps a
//! take-profit limit order live, and fires a market sell on stop-loss or
//! trailing-stop breach. Grounded on original_source's
//! `tools/order_guard_virtual.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rust_decimal::Decimal;

use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{load_dotenv, ExitGuardConfig};
use bitvavo_trading_core::decimal_fallback::place_with_fallback;
use bitvavo_trading_core::exchange_client::{BitvavoClient, ExchangeClient, OrderRequest};
use bitvavo_trading_core::market::MarketPrecision;
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::precision::{cache_path_default, PrecisionCache};
use bitvavo_trading_core::topics::lock_key;
use bitvavo_trading_core::virtpos::{read_virt, write_virt, VirtualPosition};

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
    let cfg = ExitGuardConfig::default();
    let market = std::env::var("MARKET").unwrap_or_else(|_| "BTC-EUR".to_string());

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

    let lease_key = lock_key(&market);
    if !bus.set_nx_ex(&lease_key, "1", cfg.lease_ttl_sec).await.unwrap_or(false) {
        log::error!("{}: another guard already holds the lease, exiting", market);
        return;
    }
    metrics::gauge!(names::LEASE_HELD, "market" => market.clone()).set(1.0);

    let mut client: Box<dyn ExchangeClient> = if cfg.allow_live {
        Box::new(BitvavoClient::new(
            std::env::var("BITVAVO_API_KEY").unwrap_or_default(),
            std::env::var("BITVAVO_API_SECRET").unwrap_or_default(),
        ))
    } else {
        Box::new(bitvavo_trading_core::exchange_client::SimExchange::new(Decimal::ZERO))
    };
    let mut cache = PrecisionCache::load(cache_path_default());
    let precision = MarketPrecision::default();

    let stop = shutdown_signal().await;
    let half_ttl = Duration::from_secs((cfg.lease_ttl_sec / 2).max(1));
    let mut last_renew = tokio::time::Instant::now();
    let poll_interval = Duration::from_secs_f64(cfg.poll_sec);

    info!("exit_guard[{}]: started (allow_live={})", market, cfg.allow_live);

    while !stop.load(Ordering::SeqCst) {
        if last_renew.elapsed() >= half_ttl {
            let _ = bus.expire(&lease_key, cfg.lease_ttl_sec).await;
            last_renew = tokio::time::Instant::now();
        }

        let mut vp = match read_virt(&mut bus, &market).await {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: failed to read virtual position: {}", market, e);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        if vp.qty <= Decimal::ZERO {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        let last_price = match client.get_last_price(&market).await {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: failed to fetch last price: {}", market, e);
                metrics::counter!(names::GUARD_ERRORS_TOTAL, "market" => market.clone()).increment(1);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        vp.last_px = last_price;
        vp.update_peak(last_price);
        let (tp_px, sl_px) = vp.tp_sl(&cfg, precision.price_decimals);

        if vp.tp_order_id.is_none() {
            let tp_req = OrderRequest {
                market: market.clone(),
                side: "sell".to_string(),
                order_type: "limit".to_string(),
                amount: Some(vp.qty),
                amount_quote: None,
                price: Some(tp_px),
                time_in_force: Some("GTC".to_string()),
                post_only: false,
                trigger_price: None,
                trigger_amount: None,
                operator_id: None,
            };
            if cfg.allow_live {
                match place_with_fallback(&mut *client, &mut cache, &market, &tp_req, precision.amount_decimals).await {
                    Ok(resp) if resp.status != "rejected" => {
                        vp.tp_order_id = Some(resp.order_id);
                        metrics::gauge!(names::TP_ORDERS_OPEN, "market" => market.clone()).set(1.0);
                    }
                    Ok(resp) => warn!("{}: TP order rejected: {:?}", market, resp.error),
                    Err(e) => warn!("{}: TP order failed: {}", market, e),
                }
            } else {
                info!("{}: dry-run TP at {} for qty {}", market, tp_px, vp.qty);
                vp.tp_order_id = Some(format!("dry-tp-{}", market));
            }
        }

        if vp.stop_triggered(last_price, sl_px) {
            if let Some(tp_id) = vp.tp_order_id.take() {
                if cfg.allow_live && !tp_id.starts_with("dry-") {
                    let _ = client.cancel_order(&market, &tp_id).await;
                }
            }

            let sell_req = OrderRequest {
                market: market.clone(),
                side: "sell".to_string(),
                order_type: "market".to_string(),
                amount: Some(vp.qty),
                amount_quote: None,
                price: None,
                time_in_force: None,
                post_only: false,
                trigger_price: None,
                trigger_amount: None,
                operator_id: None,
            };
            if cfg.allow_live {
                match place_with_fallback(&mut *client, &mut cache, &market, &sell_req, precision.amount_decimals).await
                {
                    Ok(_) => {
                        metrics::counter!(names::MARKET_SELLS_TOTAL, "market" => market.clone()).increment(1);
                        metrics::counter!(names::EXITS_TRIGGERED_TOTAL, "market" => market.clone()).increment(1);
                    }
                    Err(e) => warn!("{}: market sell failed: {}", market, e),
                }
            } else {
                info!("{}: DRY market-sell qty {} at/through sl_px {}", market, vp.qty, sl_px);
                metrics::counter!(names::EXITS_TRIGGERED_TOTAL, "market" => market.clone()).increment(1);
            }
            metrics::counter!(names::SL_TRIGGERS_TOTAL, "market" => market.clone()).increment(1);
            vp.reset();
            metrics::gauge!(names::TP_ORDERS_OPEN, "market" => market.clone()).set(0.0);
            let _ = write_virt(&mut bus, &market, &vp).await;
            tokio::time::sleep(poll_interval.max(Duration::from_secs_f64(cfg.poll_sec))).await;
            continue;
        }

        let _ = write_virt(&mut bus, &market, &vp).await;
        tokio::time::sleep(poll_interval).await;
    }

    metrics::gauge!(names::LEASE_HELD, "market" => market.clone()).set(0.0);
    info!("exit_guard[{}]: shutdown signal observed, exiting", market);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_position_reset_clears_qty_and_tp_order() {
        let mut vp = VirtualPosition {
            qty: Decimal::from(1),
            avg: Decimal::from(100),
            peak: Decimal::from(110),
            tp_order_id: Some("abc".to_string()),
            last_px: Decimal::from(105),
        };
        vp.reset();
        assert_eq!(vp.qty, Decimal::ZERO);
        assert!(vp.tp_order_id.is_none());
    }
}
