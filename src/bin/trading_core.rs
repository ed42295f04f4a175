//! Trading core binary (§4.D). Consumes `signals:baseline` as a consumer
//! group, classifies each signal into an intent, runs it through the guard
//! rail chain, and on success appends an outbox order (shadow or live,
//! depending on `DRY_RUN`) while bumping the exposure/position counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{load_dotenv, TradingCoreConfig};
use bitvavo_trading_core::guards::{blocked_by_guards, GuardContext};
use bitvavo_trading_core::intent::classify_intent;
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::topics::{
    KEY_EUR_AVAILABLE, KEY_EXPOSURE, KEY_KILL_SWITCH, KEY_POSITIONS, KEY_SLOT_BUDGET_EUR, ORDER_OUTBOX_LIVE,
    ORDER_OUTBOX_SHADOW, TRADING_EVENTS,
};

const METRICS_PORT: u16 = 9104;

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

async fn log_event(bus: &mut dyn EventBus, level: &str, where_: &str, msg: &str) {
    let ts = chrono::Utc::now().to_rfc3339();
    let _ = bus
        .append(TRADING_EVENTS, &[("ts", ts.as_str()), ("level", level), ("where", where_), ("msg", msg)])
        .await;
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();
    let cfg = TradingCoreConfig::default();

    if let Err(e) = metrics_server::install(METRICS_PORT) {
        warn!("metrics server failed to install: {}", e);
    }

    let mut bus = match RedisEventBus::connect(&cfg.redis_url).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("cannot connect to event bus, exiting: {}", e);
            return;
        }
    };

    if let Err(e) = bus.ensure_group(&cfg.signal_stream, &cfg.consumer_group).await {
        log::error!("cannot create consumer group: {}", e);
        return;
    }

    let stop = shutdown_signal().await;
    info!("trading_core: listening on {} (dry_run={})", cfg.signal_stream, cfg.dry_run);

    while !stop.load(Ordering::SeqCst) {
        let records = match bus
            .read_group(&cfg.signal_stream, &cfg.consumer_group, &cfg.consumer_name, 50, 1000)
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
            handle_signal(&mut bus, &cfg, &rec.fields).await;
            let _ = bus.ack(&cfg.signal_stream, &cfg.consumer_group, &rec.id).await;
        }
    }
    info!("trading_core: shutdown signal observed, exiting");
}

async fn handle_signal(
    bus: &mut dyn EventBus,
    cfg: &TradingCoreConfig,
    fields: &std::collections::HashMap<String, String>,
) {
    let market = match fields.get("market") {
        Some(m) if !m.is_empty() => m.clone(),
        _ => {
            log_event(bus, "warn", "trading_core", "signal missing market, dropped").await;
            return;
        }
    };
    let price: f64 = match fields.get("price").and_then(|v| v.parse().ok()) {
        Some(p) => p,
        None => {
            log_event(bus, "warn", "trading_core", &format!("{}: signal missing price, dropped", market)).await;
            return;
        }
    };
    let score: f64 = fields.get("score").and_then(|v| v.parse().ok()).unwrap_or(0.0);
    let reasons: Vec<String> = fields
        .get("reasons")
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default();
    let details: std::collections::HashMap<String, String> = fields
        .get("details")
        .and_then(|v| serde_json::from_str::<serde_json::Value>(v).ok())
        .map(|v| {
            v.as_object()
                .map(|obj| {
                    obj.iter()
                        .filter(|(_, val)| !val.is_null())
                        .map(|(k, val)| (k.clone(), val.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let kind = classify_intent(&details);
    let signal_id = fields.get("t").cloned().unwrap_or_default();

    let kill_switch_engaged = bus.get(KEY_KILL_SWITCH).await.ok().flatten().is_some();
    let eur_available: f64 = bus
        .get(KEY_EUR_AVAILABLE)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let current_global: f64 = bus
        .hget(KEY_EXPOSURE, "_global")
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let current_asset: f64 = bus
        .hget(KEY_EXPOSURE, &market)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let open_positions: i64 = bus.hlen(KEY_POSITIONS).await.unwrap_or(0) as i64;
    let slot_budget_eur: f64 = bus
        .get(KEY_SLOT_BUDGET_EUR)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(eur_available);

    let size_eur = slot_budget_eur.min(eur_available).max(0.0);

    let ctx = GuardContext {
        kill_switch_engaged,
        open_positions,
        current_global_exposure_eur: current_global,
        current_asset_exposure_eur: current_asset,
        available_balance_eur: eur_available,
        slot_budget_eur,
    };

    if size_eur <= 0.0 {
        log_event(bus, "info", "trading_core", &format!("{}: no budget available, skipped", market)).await;
        return;
    }

    match blocked_by_guards(cfg, &ctx, size_eur) {
        Some(rejection) => {
            metrics::counter!(names::INTENTS_BLOCKED_TOTAL, "market" => market.clone(), "reason" => rejection.label())
                .increment(1);
            log_event(
                bus,
                "info",
                "trading_core",
                &format!("{}: intent blocked by {}", market, rejection.label()),
            )
            .await;
        }
        None => {
            let topic = if cfg.dry_run { ORDER_OUTBOX_SHADOW } else { ORDER_OUTBOX_LIVE };
            let ts = chrono::Utc::now().to_rfc3339();
            let price_s = price.to_string();
            let size_s = size_eur.to_string();
            let dry_run_s = cfg.dry_run.to_string();
            let kind_s = format!("{:?}", kind);
            let reasons_s = serde_json::to_string(&reasons).unwrap_or_else(|_| "[]".to_string());
            let tp_pct_s = cfg.tp_pct.to_string();
            let sl_pct_s = cfg.sl_pct.to_string();
            let trail_pct_s = cfg.trailing_pct.to_string();
            let _ = bus
                .append(
                    topic,
                    &[
                        ("ts", ts.as_str()),
                        ("version", "1"),
                        ("dry_run", dry_run_s.as_str()),
                        ("action", "OPEN"),
                        ("signal_id", signal_id.as_str()),
                        ("market", market.as_str()),
                        ("side", "buy"),
                        ("price", price_s.as_str()),
                        ("size_eur", size_s.as_str()),
                        ("mode", kind_s.as_str()),
                        ("tp_pct", tp_pct_s.as_str()),
                        ("sl_pct", sl_pct_s.as_str()),
                        ("trail_pct", trail_pct_s.as_str()),
                        ("score", score.to_string().as_str()),
                        ("reasons", reasons_s.as_str()),
                    ],
                )
                .await;

            let _ = bus.hincrbyfloat(KEY_EXPOSURE, "_global", size_eur).await;
            let _ = bus.hincrbyfloat(KEY_EXPOSURE, &market, size_eur).await;
            let _ = bus.hincrbyfloat(KEY_POSITIONS, &market, 1.0).await;

            metrics::counter!(names::INTENTS_ACCEPTED_TOTAL, "market" => market.clone()).increment(1);
            log_event(bus, "info", "trading_core", &format!("{}: intent accepted, size_eur={}", market, size_eur)).await;
        }
    }
}
