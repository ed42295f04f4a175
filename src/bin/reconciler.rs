//! Reconciler binary (§4.G). Reads the desired market universe from KV,
//! filters and truncates it, reconciles the running exit-guard processes
//! against it, assigns each a stable metrics port, and writes per-market
//! environment files the guard reads on startup. Grounded on
//! original_source's `tools/guard_reconciler.py`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use bitvavo_trading_core::atomic_file::write_atomic;
use bitvavo_trading_core::bus::{EventBus, RedisEventBus};
use bitvavo_trading_core::config::{load_dotenv, ReconcilerConfig};
use bitvavo_trading_core::metrics_server::{self, names};
use bitvavo_trading_core::process_registry::{ChildProcessRegistry, ProcessRegistry};
use bitvavo_trading_core::topics::{ACTIVE_MARKETS_LIST, ACTIVE_MARKETS_SET, GUARD_ACTIVE_MARKETS_LIST};

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

/// Filters `candidates` to EUR-quoted markets whose base asset is not in
/// `deny_bases`, preserving order, then truncates to `max_concurrency`.
fn desired_markets(candidates: &[String], deny_bases: &[String], max_concurrency: usize) -> Vec<String> {
    let deny: HashSet<&str> = deny_bases.iter().map(String::as_str).collect();
    candidates
        .iter()
        .filter(|m| {
            m.ends_with("-EUR")
                && m.split_once('-')
                    .map(|(base, _)| !deny.contains(base))
                    .unwrap_or(false)
        })
        .take(max_concurrency)
        .cloned()
        .collect()
}

/// Picks a port for `market`: the previously-assigned port if still free,
/// else the first free port scanning forward from `prom_base`.
fn assign_port(
    market: &str,
    previous: &HashMap<String, u16>,
    in_use: &HashSet<u16>,
    prom_base: u16,
    prom_range: u16,
) -> Option<u16> {
    if let Some(&p) = previous.get(market) {
        if !in_use.contains(&p) {
            return Some(p);
        }
    }
    (prom_base..prom_base.saturating_add(prom_range)).find(|p| !in_use.contains(p))
}

async fn reconcile_once(
    bus: &mut dyn EventBus,
    registry: &mut dyn ProcessRegistry,
    cfg: &ReconcilerConfig,
    ports: &mut HashMap<String, u16>,
    bin_path: &str,
) {
    let list = bus.lrange(ACTIVE_MARKETS_LIST, 0, -1).await.unwrap_or_default();
    let set: HashSet<String> = bus.smembers(ACTIVE_MARKETS_SET).await.unwrap_or_default().into_iter().collect();
    let candidates: Vec<String> = if !list.is_empty() {
        list.into_iter().filter(|m| set.contains(m)).collect()
    } else {
        let mut v: Vec<String> = set.into_iter().collect();
        v.sort();
        v
    };

    let desired = desired_markets(&candidates, &cfg.deny_bases, cfg.max_concurrency);
    let desired_set: HashSet<&str> = desired.iter().map(String::as_str).collect();

    let running = registry.running_markets();
    for market in &running {
        if !desired_set.contains(market.as_str()) {
            let _ = registry.stop(market).await;
            ports.remove(market);
            info!("reconciler: stopped guard for {} (no longer desired)", market);
        }
    }

    let mut in_use: HashSet<u16> = ports.values().copied().collect();
    for market in &desired {
        let still_running = registry.running_markets().contains(market);
        // Exclude this market's own previously-assigned port from `in_use`
        // before checking it, so "prefer previous" can actually keep it.
        let own_prev = ports.get(market).copied();
        if let Some(p) = own_prev {
            in_use.remove(&p);
        }
        let assigned = assign_port(market, ports, &in_use, cfg.prom_base, cfg.prom_range);
        let Some(port) = assigned else {
            if let Some(p) = own_prev {
                in_use.insert(p);
            }
            warn!("reconciler: no free port in range for {}", market);
            continue;
        };
        let port_changed = ports.get(market).copied() != Some(port);
        ports.insert(market.clone(), port);
        in_use.insert(port);

        let env_path = format!("{}/{}.env", cfg.env_dir, market);
        let body = format!("MARKET={}\nMETRICS_PORT={}\nREDIS_URL={}\n", market, port, cfg.redis_url);
        if let Err(e) = write_atomic(std::path::Path::new(&env_path), &body) {
            warn!("reconciler: failed to write env file for {}: {}", market, e);
            continue;
        }

        if !still_running {
            if let Err(e) = registry.start(market, bin_path, &env_path).await {
                warn!("reconciler: failed to start guard for {}: {}", market, e);
            }
        } else if port_changed {
            if let Err(e) = registry.restart(market, bin_path, &env_path).await {
                warn!("reconciler: failed to restart guard for {}: {}", market, e);
            }
        }

        metrics::gauge!(names::GUARD_PORT_ASSIGNMENT, "market" => market.clone()).set(port as f64);
    }

    let running_now = registry.running_markets();
    let _ = bus.delete(GUARD_ACTIVE_MARKETS_LIST).await;
    if !running_now.is_empty() {
        let _ = bus.rpush(GUARD_ACTIVE_MARKETS_LIST, &running_now).await;
    }
    metrics::gauge!(names::MARKETS_SUPERVISED).set(running_now.len() as f64);
    metrics::counter!(names::RECONCILER_RUNS_TOTAL).increment(1);
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::init();
    let cfg = ReconcilerConfig::default();
    let bin_path = std::env::var("GUARD_BIN_PATH").unwrap_or_else(|_| "exit_guard".to_string());

    if let Err(e) = metrics_server::install(cfg.reconciler_prom_port) {
        warn!("metrics server failed to install: {}", e);
    }

    let mut bus = match RedisEventBus::connect(&cfg.redis_url).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("cannot connect to event bus, exiting: {}", e);
            return;
        }
    };

    let mut registry = ChildProcessRegistry::new();
    let mut ports: HashMap<String, u16> = HashMap::new();
    let stop = shutdown_signal().await;

    info!("reconciler: starting loop, max_concurrency={}", cfg.max_concurrency);
    while !stop.load(Ordering::SeqCst) {
        reconcile_once(&mut bus, &mut registry, &cfg, &mut ports, &bin_path).await;
        tokio::time::sleep(Duration::from_secs_f64(cfg.loop_sleep_sec)).await;
    }
    info!("reconciler: shutdown signal observed, exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_markets_filters_deny_bases_and_non_eur_pairs() {
        let candidates = vec!["BTC-EUR".to_string(), "DOGE-EUR".to_string(), "DOGE-USDT".to_string()];
        let deny = vec!["BTC".to_string()];
        let out = desired_markets(&candidates, &deny, 10);
        assert_eq!(out, vec!["DOGE-EUR".to_string()]);
    }

    #[test]
    fn desired_markets_truncates_to_max_concurrency() {
        let candidates = vec!["A-EUR".to_string(), "B-EUR".to_string(), "C-EUR".to_string()];
        let out = desired_markets(&candidates, &[], 2);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn assign_port_prefers_previous_port_if_still_free() {
        let mut previous = HashMap::new();
        previous.insert("BTC-EUR".to_string(), 9120u16);
        let in_use = HashSet::new();
        assert_eq!(assign_port("BTC-EUR", &previous, &in_use, 9105, 50), Some(9120));
    }

    #[test]
    fn assign_port_scans_forward_when_previous_port_is_taken() {
        let mut previous = HashMap::new();
        previous.insert("BTC-EUR".to_string(), 9105u16);
        let mut in_use = HashSet::new();
        in_use.insert(9105u16);
        assert_eq!(assign_port("BTC-EUR", &previous, &in_use, 9105, 50), Some(9106));
    }

    /// Regression test for the "own port counted as in-use" bug: a market's
    /// own previously-assigned port must be excluded from `in_use` before it
    /// is checked against itself, or "prefer previous" can never fire and
    /// every market restarts on every reconcile loop.
    #[test]
    fn assign_port_keeps_the_same_port_across_reconcile_iterations() {
        let mut ports: HashMap<String, u16> = HashMap::new();
        ports.insert("BTC-EUR".to_string(), 9105);
        ports.insert("ETH-EUR".to_string(), 9106);

        for market in ["BTC-EUR", "ETH-EUR"] {
            let mut in_use: HashSet<u16> = ports.values().copied().collect();
            let own_prev = ports.get(market).copied();
            if let Some(p) = own_prev {
                in_use.remove(&p);
            }
            let assigned = assign_port(market, &ports, &in_use, 9105, 50);
            assert_eq!(assigned, own_prev, "market {} should keep its own port", market);
        }
    }
}
