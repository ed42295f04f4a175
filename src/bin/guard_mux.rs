//! Metrics multiplexer binary (§4.G). Periodically refreshes the guard port
//! map from the reconciler's own `/metrics` endpoint, concurrently scrapes
//! each guard, and serves a merged Prometheus response that dedups the
//! `# HELP`/`# TYPE` lines of each metric family. Served with `axum`,
//! matching `cooprefr-bettersys`'s web-framework choice for its own
//! HTTP-facing surfaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{info, warn};

use bitvavo_trading_core::config::load_dotenv;
use bitvavo_trading_core::metrics_server::names;

const RECONCILER_METRICS_URL_DEFAULT: &str = "http://127.0.0.1:9111/metrics";

#[derive(Clone)]
struct AppState {
    http_client: reqwest::Client,
    ports: Arc<Mutex<HashMap<String, u16>>>,
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

/// Parses `guard_port_assignment{market="BTC-EUR"} 9120` style sample lines
/// out of the reconciler's scrape body into a `market -> port` map.
fn parse_port_assignments(body: &str) -> HashMap<String, u16> {
    let mut out = HashMap::new();
    for line in body.lines() {
        if !line.starts_with("guard_port_assignment{") {
            continue;
        }
        let Some(market_start) = line.find("market=\"") else { continue };
        let rest = &line[market_start + "market=\"".len()..];
        let Some(market_end) = rest.find('"') else { continue };
        let market = &rest[..market_end];
        let Some(value_str) = line.rsplit(' ').next() else { continue };
        if let Ok(port) = value_str.trim().parse::<f64>() {
            out.insert(market.to_string(), port as u16);
        }
    }
    out
}

/// Merges scrape bodies, keeping only the first `# HELP`/`# TYPE` line seen
/// per metric family and passing every sample line through unchanged.
fn merge_scrapes(bodies: &[String]) -> String {
    let mut seen_meta: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out = String::new();
    for body in bodies {
        for line in body.lines() {
            if line.starts_with("# HELP") || line.starts_with("# TYPE") {
                let family = line.split_whitespace().nth(2).unwrap_or("").to_string();
                let key = format!("{}:{}", &line[..6], family);
                if !seen_meta.insert(key) {
                    continue;
                }
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

async fn refresh_port_map(client: &reqwest::Client, url: &str, ports: &Arc<Mutex<HashMap<String, u16>>>) {
    match client.get(url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => {
                let parsed = parse_port_assignments(&body);
                *ports.lock().expect("port map mutex poisoned") = parsed;
            }
            Err(e) => warn!("guard_mux: failed to read reconciler metrics body: {}", e),
        },
        Err(e) => warn!("guard_mux: failed to scrape reconciler: {}", e),
    }
}

async fn scrape_guards(client: &reqwest::Client, ports: &Arc<Mutex<HashMap<String, u16>>>) -> String {
    let snapshot: Vec<(String, u16)> = ports.lock().expect("port map mutex poisoned").clone().into_iter().collect();

    if snapshot.is_empty() {
        metrics::gauge!(names::GUARD_MUX_TARGETS).set(0.0);
        return "# no guard targets\nguard_mux_targets 0\n".to_string();
    }

    metrics::gauge!(names::GUARD_MUX_TARGETS).set(snapshot.len() as f64);

    let futures = snapshot.into_iter().map(|(market, port)| {
        let client = client.clone();
        async move {
            let url = format!("http://127.0.0.1:{}/metrics", port);
            match tokio::time::timeout(Duration::from_secs(3), client.get(&url).send()).await {
                Ok(Ok(resp)) => match resp.text().await {
                    Ok(body) => Some(body),
                    Err(_) => {
                        metrics::counter!(names::GUARD_MUX_SCRAPE_ERRORS_TOTAL, "market" => market).increment(1);
                        None
                    }
                },
                _ => {
                    metrics::counter!(names::GUARD_MUX_SCRAPE_ERRORS_TOTAL, "market" => market).increment(1);
                    None
                }
            }
        }
    });

    let bodies: Vec<String> = futures_util::future::join_all(futures).await.into_iter().flatten().collect();
    merge_scrapes(&bodies)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    scrape_guards(&state.http_client, &state.ports).await
}

async fn healthz_handler() -> impl IntoResponse {
    "ok"
}

async fn root_handler() -> impl IntoResponse {
    "guard_mux: see /metrics"
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();

    let bind_port: u16 = std::env::var("GUARD_MUX_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9110);
    let reconciler_url =
        std::env::var("RECONCILER_METRICS_URL").unwrap_or_else(|_| RECONCILER_METRICS_URL_DEFAULT.to_string());
    let refresh_interval = Duration::from_secs(
        std::env::var("GUARD_MUX_REFRESH_SEC").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build reqwest client");
    let ports: Arc<Mutex<HashMap<String, u16>>> = Arc::new(Mutex::new(HashMap::new()));

    let stop = shutdown_signal().await;
    let refresh_client = http_client.clone();
    let refresh_ports = ports.clone();
    let refresh_url = reconciler_url.clone();
    let refresh_stop = stop.clone();
    tokio::spawn(async move {
        while !refresh_stop.load(Ordering::SeqCst) {
            refresh_port_map(&refresh_client, &refresh_url, &refresh_ports).await;
            tokio::time::sleep(refresh_interval).await;
        }
    });

    let state = AppState { http_client, ports };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/-/ready", get(healthz_handler))
        .route("/", get(root_handler))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], bind_port));
    info!("guard_mux: serving merged guard metrics on :{}", bind_port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("guard_mux: failed to bind {}: {}", addr, e);
            return;
        }
    };
    let shutdown_stop = stop.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        while !shutdown_stop.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
    if let Err(e) = server.await {
        warn!("guard_mux: server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_assignments_extracts_market_port_pairs() {
        let body = "# HELP guard_port_assignment x\n# TYPE guard_port_assignment gauge\nguard_port_assignment{market=\"BTC-EUR\"} 9120\n";
        let parsed = parse_port_assignments(body);
        assert_eq!(parsed.get("BTC-EUR"), Some(&9120));
    }

    #[test]
    fn merge_scrapes_dedups_help_and_type_lines_per_family() {
        let a = "# HELP x_total x\n# TYPE x_total counter\nx_total{market=\"A\"} 1\n".to_string();
        let b = "# HELP x_total x\n# TYPE x_total counter\nx_total{market=\"B\"} 2\n".to_string();
        let merged = merge_scrapes(&[a, b]);
        assert_eq!(merged.matches("# HELP x_total").count(), 1);
        assert_eq!(merged.matches("# TYPE x_total").count(), 1);
        assert!(merged.contains("x_total{market=\"A\"} 1"));
        assert!(merged.contains("x_total{market=\"B\"} 2"));
    }

    #[test]
    fn merge_scrapes_is_empty_for_no_bodies() {
        assert_eq!(merge_scrapes(&[]), "");
    }
}
