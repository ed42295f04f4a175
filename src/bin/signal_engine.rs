//! Signal engine binary (§4.C). Consumes the aggregate top-of-book stream,
//! the candle stream, and the 24h ticker stream; maintains per-market
//! rolling state; publishes scored signals to `signals:baseline` whenever
//! any filter-bank predicate fires.
//!
//! Evaluation order follows SPEC_FULL.md's §9 Open Question resolution:
//! `eval_filters` never reads a wick flag set by the candle handler on the
//! same pass — the wick predicate is folded in exactly once, inside
//! `evaluate_candle`, which runs only on a real candle event (the only
//! place OHLC is available). Book and ticker events update rolling state
//! (top-of-book, `last_close`) without themselves triggering evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{env_str, load_dotenv, SignalConfig};
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::signals::{evaluate_candle, MktState};
use bitvavo_trading_core::topics::{candles_topic, BOOK_TOPIC_AGG, TICKER24H_TOPIC};

const CONSUMER_GROUP: &str = "signal_engine";

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

fn state_for<'a>(states: &'a mut HashMap<String, MktState>, market: &str, cfg: &SignalConfig) -> &'a mut MktState {
    states
        .entry(market.to_string())
        .or_insert_with(|| MktState::new(cfg.vol_window, cfg.vol_spike_window))
}

async fn emit_signal(bus: &mut RedisEventBus, cfg: &SignalConfig, market: &str, price: f64, outcome: &bitvavo_trading_core::signals::FilterOutcome, wick_ratio: Option<f64>) {
    let details = serde_json::json!({
        "spread_bps": outcome.details.spread_bps,
        "vol_std": outcome.details.vol_std,
        "vol_last": outcome.details.vol_last,
        "vol_mean": outcome.details.vol_mean,
        "wick_ratio": wick_ratio,
    })
    .to_string();
    let reasons = serde_json::to_string(&outcome.reasons).unwrap_or_else(|_| "[]".to_string());
    let score = outcome.score.to_string();
    let ts = chrono::Utc::now().to_rfc3339();
    let price_s = price.to_string();
    let _ = bus
        .append(
            &cfg.signal_stream,
            &[
                ("market", market),
                ("price", price_s.as_str()),
                ("score", score.as_str()),
                ("reasons", reasons.as_str()),
                ("details", details.as_str()),
                ("t", ts.as_str()),
            ],
        )
        .await;
    metrics::counter!(names::SIGNALS_EMITTED_TOTAL, "market" => market.to_string()).increment(1);
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();
    let cfg = SignalConfig::default();
    let candle_interval = env_str("CANDLE_INTERVAL", "1m");
    let candle_topic = candles_topic(&candle_interval);

    if let Err(e) = metrics_server::install(9103) {
        warn!("metrics server failed to install: {}", e);
    }

    let mut bus = match RedisEventBus::connect(&cfg.redis_url).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("cannot connect to event bus, exiting: {}", e);
            return;
        }
    };

    for topic in [BOOK_TOPIC_AGG, candle_topic.as_str(), TICKER24H_TOPIC] {
        if let Err(e) = bus.ensure_group(topic, CONSUMER_GROUP).await {
            log::error!("cannot create consumer group on {}: {}", topic, e);
            return;
        }
    }

    let mut states: HashMap<String, MktState> = HashMap::new();
    let stop = shutdown_signal().await;

    info!("signal_engine: listening on {}, {}, {}", BOOK_TOPIC_AGG, candle_topic, TICKER24H_TOPIC);
    while !stop.load(Ordering::SeqCst) {
        // Book ticks: update top-of-book only (spread_bps is recomputed at
        // evaluation time from the latest `last_bidask`).
        match bus.read_group(BOOK_TOPIC_AGG, CONSUMER_GROUP, "engine", 100, 200).await {
            Ok(records) => {
                for rec in records {
                    if let Some(market) = rec.fields.get("market").cloned() {
                        let data_raw = rec.fields.get("data").cloned().unwrap_or_default();
                        let parsed: serde_json::Value = serde_json::from_str(&data_raw).unwrap_or_default();
                        let bid = parsed.get("bid").and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok());
                        let ask = parsed.get("ask").and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok());
                        if let (Some(bid), Some(ask)) = (bid, ask) {
                            state_for(&mut states, &market, &cfg).last_bidask = Some((bid, ask));
                        }
                    }
                    bus.ack(BOOK_TOPIC_AGG, CONSUMER_GROUP, &rec.id).await.ok();
                }
            }
            Err(e) => warn!("read_group({}) failed: {}", BOOK_TOPIC_AGG, e),
        }

        // Ticker: maintain `last_close` for markets with infrequent candles
        // (§4.C "Book/ticker handlers"). Never triggers evaluation itself.
        match bus.read_group(TICKER24H_TOPIC, CONSUMER_GROUP, "engine", 100, 50).await {
            Ok(records) => {
                for rec in records {
                    if let Some(market) = rec.fields.get("market").cloned() {
                        let data_raw = rec.fields.get("data").cloned().unwrap_or_default();
                        let parsed: serde_json::Value = serde_json::from_str(&data_raw).unwrap_or_default();
                        if let Some(last_price) = parsed.get("lastPrice").and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok()) {
                            let state = state_for(&mut states, &market, &cfg);
                            if state.last_close.is_none() {
                                state.last_close = Some(last_price);
                            }
                        }
                    }
                    bus.ack(TICKER24H_TOPIC, CONSUMER_GROUP, &rec.id).await.ok();
                }
            }
            Err(e) => warn!("read_group({}) failed: {}", TICKER24H_TOPIC, e),
        }

        // Candles: the only event carrying full OHLCV, so the only trigger
        // for the wick predicate and full filter-bank evaluation (§4.C).
        match bus.read_group(&candle_topic, CONSUMER_GROUP, "engine", 50, 500).await {
            Ok(records) => {
                for rec in records {
                    if let Some(market) = rec.fields.get("market").cloned() {
                        let candle_raw = rec.fields.get("candle").cloned().unwrap_or_default();
                        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&candle_raw) {
                            let ohlcv = parsed
                                .as_array()
                                .and_then(|arr| arr.first())
                                .cloned()
                                .unwrap_or(parsed);
                            let get = |key: &str, idx: usize| -> Option<f64> {
                                ohlcv
                                    .get(key)
                                    .or_else(|| ohlcv.as_array().and_then(|a| a.get(idx)))
                                    .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
                            };
                            let o = get("open", 1);
                            let h = get("high", 2);
                            let l = get("low", 3);
                            let c = get("close", 4);
                            let v = get("volume", 5);
                            if let (Some(o), Some(h), Some(l), Some(c)) = (o, h, l, c) {
                                let state = state_for(&mut states, &market, &cfg);
                                if let Some(v) = v {
                                    state.push_volume(v);
                                }
                                state.observe_close(c);
                                let (outcome, wick_ratio, wick_ok) = evaluate_candle(state, &cfg, o, h, l, c);
                                if outcome.any_true {
                                    emit_signal(&mut bus, &cfg, &market, c, &outcome, if wick_ok { Some(wick_ratio) } else { None }).await;
                                }
                            }
                        }
                    }
                    bus.ack(&candle_topic, CONSUMER_GROUP, &rec.id).await.ok();
                }
            }
            Err(e) => warn!("read_group({}) failed: {}", candle_topic, e),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("signal_engine: shutdown signal observed, exiting");
}
