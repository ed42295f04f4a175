//! Prometheus metrics endpoint shared by every long-lived process (§6.5).
//! Grounded on `cooprefr-bettersys`'s `metrics` + `metrics-exporter-prometheus`
//! dependency pair, applied here via that crate's standard HTTP-listener
//! recorder install.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Installs the global Prometheus recorder and binds its scrape endpoint to
/// `0.0.0.0:<port>`. Call once near the top of a binary's `main`; every
/// `metrics::counter!`/`gauge!`/`histogram!` call afterwards is exported.
pub fn install(port: u16) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

pub mod names {
    pub const BOOK_UPDATES_TOTAL: &str = "ingest_book_updates_total";
    pub const BOOK_RESYNCS_TOTAL: &str = "ingest_book_resyncs_total";
    pub const SIGNALS_EMITTED_TOTAL: &str = "signal_engine_signals_emitted_total";
    pub const INTENTS_BLOCKED_TOTAL: &str = "trading_core_intents_blocked_total";
    pub const INTENTS_ACCEPTED_TOTAL: &str = "trading_core_intents_accepted_total";
    pub const ORDERS_PLACED_TOTAL: &str = "executor_orders_placed_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "executor_orders_rejected_total";
    pub const EXITS_TRIGGERED_TOTAL: &str = "exit_guard_exits_triggered_total";
    pub const LEASE_HELD: &str = "exit_guard_lease_held";
    pub const TP_ORDERS_OPEN: &str = "exit_guard_tp_orders_open";
    pub const SL_TRIGGERS_TOTAL: &str = "exit_guard_sl_triggers_total";
    pub const MARKET_SELLS_TOTAL: &str = "exit_guard_market_sells_total";
    pub const GUARD_ERRORS_TOTAL: &str = "exit_guard_errors_total";
    pub const MARKETS_SUPERVISED: &str = "reconciler_markets_supervised";
    pub const RECONCILER_RUNS_TOTAL: &str = "reconciler_runs_total";
    pub const GUARD_PORT_ASSIGNMENT: &str = "guard_port_assignment";
    pub const GUARD_MUX_TARGETS: &str = "guard_mux_targets";
    pub const GUARD_MUX_SCRAPE_ERRORS_TOTAL: &str = "guard_mux_scrape_errors_total";
}
