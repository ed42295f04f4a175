//! Shared domain types and infrastructure for the Bitvavo EUR trading pipeline.
//!
//! Each long-lived process (see `src/bin/*.rs`) links against this crate and
//! owns one component of the pipeline: ingest, signal engine, trading core,
//! executor, exit guard, reconciler, or metrics mux.

pub mod atomic_file;
pub mod book;
pub mod bus;
pub mod config;
pub mod decimal_fallback;
pub mod error;
pub mod exchange_client;
pub mod guards;
pub mod intent;
pub mod market;
pub mod metrics_server;
pub mod parquet_sink;
pub mod precision;
pub mod process_registry;
pub mod signals;
pub mod signing;
pub mod topics;
pub mod virtpos;
