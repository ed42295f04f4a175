//! Supervised-process backend for the reconciler. Modeled as a trait so the
//! supervisor is swappable; original_source's `tools/guard_reconciler.py`
//! shells out to `systemctl enable/restart/disable --now
//! trading-guard@<market>.service`, but a systemd-specific supervisor isn't
//! required here, so the shipped implementation tracks guard child
//! processes directly via `tokio::process::Child` handles — the trait
//! boundary mirrors the `ExchangeClient`-over-concrete split in
//! `exchange_client.rs`, applied to process supervision instead of the
//! exchange boundary.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::{Child, Command};

use crate::error::PipelineError;

#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Markets with a currently-supervised, not-yet-exited process.
    fn running_markets(&mut self) -> Vec<String>;

    /// Starts a guard for `market`, passing `env_path` so the child can load
    /// its own per-market configuration via `dotenvy`.
    async fn start(&mut self, market: &str, bin_path: &str, env_path: &str) -> Result<(), PipelineError>;

    /// Stops (kills) the guard for `market`, if one is running. No-op if not running.
    async fn stop(&mut self, market: &str) -> Result<(), PipelineError>;

    /// Stops then starts the guard for `market` — used when its assigned port changes.
    async fn restart(&mut self, market: &str, bin_path: &str, env_path: &str) -> Result<(), PipelineError> {
        self.stop(market).await?;
        self.start(market, bin_path, env_path).await
    }
}

/// Tracks supervised guard processes via `tokio::process::Child` handles,
/// one per market.
#[derive(Default)]
pub struct ChildProcessRegistry {
    children: HashMap<String, Child>,
}

impl ChildProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reaps exited children so `running_markets` reflects reality without
    /// a background poller.
    fn reap(&mut self) {
        self.children.retain(|_, child| {
            matches!(child.try_wait(), Ok(None))
        });
    }
}

#[async_trait]
impl ProcessRegistry for ChildProcessRegistry {
    fn running_markets(&mut self) -> Vec<String> {
        self.reap();
        self.children.keys().cloned().collect()
    }

    async fn start(&mut self, market: &str, bin_path: &str, env_path: &str) -> Result<(), PipelineError> {
        self.reap();
        if self.children.contains_key(market) {
            return Ok(());
        }
        let child = Command::new(bin_path)
            .env("MARKET", market)
            .env("GUARD_ENV_FILE", env_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::TransientIo(format!("spawn guard for {}: {}", market, e)))?;
        self.children.insert(market.to_string(), child);
        Ok(())
    }

    async fn stop(&mut self, market: &str) -> Result<(), PipelineError> {
        if let Some(mut child) = self.children.remove(market) {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}

/// In-memory test double: no real processes, just bookkeeping.
#[derive(Default)]
pub struct InMemoryProcessRegistry {
    running: HashMap<String, (String, String)>,
}

impl InMemoryProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRegistry for InMemoryProcessRegistry {
    fn running_markets(&mut self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    async fn start(&mut self, market: &str, bin_path: &str, env_path: &str) -> Result<(), PipelineError> {
        self.running
            .insert(market.to_string(), (bin_path.to_string(), env_path.to_string()));
        Ok(())
    }

    async fn stop(&mut self, market: &str) -> Result<(), PipelineError> {
        self.running.remove(market);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_registry_tracks_start_stop() {
        let mut reg = InMemoryProcessRegistry::new();
        reg.start("BTC-EUR", "/bin/true", "/etc/trading/guard/BTC-EUR.env")
            .await
            .unwrap();
        assert_eq!(reg.running_markets(), vec!["BTC-EUR".to_string()]);
        reg.stop("BTC-EUR").await.unwrap();
        assert!(reg.running_markets().is_empty());
    }

    #[tokio::test]
    async fn restart_stops_then_starts() {
        let mut reg = InMemoryProcessRegistry::new();
        reg.start("ETH-EUR", "/bin/true", "/etc/trading/guard/ETH-EUR.env")
            .await
            .unwrap();
        reg.restart("ETH-EUR", "/bin/true", "/etc/trading/guard/ETH-EUR.env")
            .await
            .unwrap();
        assert_eq!(reg.running_markets(), vec!["ETH-EUR".to_string()]);
    }
}
