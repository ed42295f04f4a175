//! Per-market virtual position tracking for the exit guard (§4.F), grounded
//! on original_source's `tools/order_guard_virtual.py` (`_read_virt`,
//! `_write_virt`, `_reset_virt`). The guard never fetches fills itself —
//! this struct is the guard's own view of `{qty, avg, peak, tp_order_id,
//! last_px}`, persisted to the bus KV under `virtpos:<market>` as a JSON
//! blob with a 7-day TTL so a long-dead market's state doesn't linger
//! forever.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::config::ExitGuardConfig;
use crate::error::PipelineError;
use crate::precision::truncate_floor;
use crate::topics::virtpos_key;

/// `virtpos:<market>` keys expire after 7 days of inactivity.
pub const VIRTPOS_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub qty: Decimal,
    pub avg: Decimal,
    pub peak: Decimal,
    #[serde(rename = "tpOrderId")]
    pub tp_order_id: Option<String>,
    #[serde(rename = "lastPx")]
    pub last_px: Decimal,
}

impl Default for VirtualPosition {
    fn default() -> Self {
        Self {
            qty: Decimal::ZERO,
            avg: Decimal::ZERO,
            peak: Decimal::ZERO,
            tp_order_id: None,
            last_px: Decimal::ZERO,
        }
    }
}

impl VirtualPosition {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update_peak(&mut self, px: Decimal) {
        if px > self.peak {
            self.peak = px;
        }
    }

    /// Take-profit limit price and virtual stop price for this tick, per
    /// §4.F step 2: `sl_px = max(hard_sl, trail_sl)`.
    pub fn tp_sl(&self, cfg: &ExitGuardConfig, price_decimals: u32) -> (Decimal, Decimal) {
        let one = Decimal::ONE;
        let tp_pct = Decimal::try_from(cfg.take_profit_pct).unwrap_or_default();
        let sl_pct = Decimal::try_from(cfg.stop_loss_pct).unwrap_or_default();
        let trail_pct = Decimal::try_from(cfg.trail_sl_pct).unwrap_or_default();

        let tp_px = truncate_floor(self.avg * (one + tp_pct), price_decimals);
        let hard_sl = self.avg * (one - sl_pct);
        let trail_sl = self.peak * (one - trail_pct);
        let sl_px = hard_sl.max(trail_sl);
        (tp_px, sl_px)
    }

    /// True once `px` has fallen to or through the virtual stop.
    pub fn stop_triggered(&self, px: Decimal, sl_px: Decimal) -> bool {
        self.qty > Decimal::ZERO && px <= sl_px
    }
}

pub async fn read_virt(bus: &mut dyn EventBus, market: &str) -> Result<VirtualPosition, PipelineError> {
    match bus.get(&virtpos_key(market)).await? {
        Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
        None => Ok(VirtualPosition::default()),
    }
}

pub async fn write_virt(bus: &mut dyn EventBus, market: &str, vp: &VirtualPosition) -> Result<(), PipelineError> {
    let raw = serde_json::to_string(vp)
        .map_err(|e| PipelineError::MalformedInput(format!("serialize virtpos: {}", e)))?;
    bus.set(&virtpos_key(market), &raw).await?;
    bus.expire(&virtpos_key(market), VIRTPOS_TTL_SECS).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use std::str::FromStr;

    fn cfg() -> ExitGuardConfig {
        ExitGuardConfig {
            redis_url: String::new(),
            order_exec_stream: String::new(),
            poll_sec: 0.5,
            lease_ttl_sec: 10,
            take_profit_pct: 0.01,
            stop_loss_pct: 0.01,
            trail_sl_pct: 0.04,
            allow_live: false,
            metrics_port: 9105,
        }
    }

    #[test]
    fn tp_sl_uses_entry_for_tp_and_peak_for_trailing_stop() {
        let mut vp = VirtualPosition {
            qty: Decimal::from_str("1.0").unwrap(),
            avg: Decimal::from_str("100").unwrap(),
            peak: Decimal::from_str("100").unwrap(),
            tp_order_id: None,
            last_px: Decimal::from_str("100").unwrap(),
        };
        vp.update_peak(Decimal::from_str("120").unwrap());
        let (tp_px, sl_px) = vp.tp_sl(&cfg(), 2);
        assert_eq!(tp_px, Decimal::from_str("101.00").unwrap());
        // hard_sl = 100*0.99 = 99; trail_sl = 120*0.96 = 115.2 -> sl_px takes the max.
        assert_eq!(sl_px, Decimal::from_str("115.2").unwrap());
    }

    #[test]
    fn stop_triggers_once_price_falls_to_or_through_sl() {
        let vp = VirtualPosition {
            qty: Decimal::from_str("1.0").unwrap(),
            avg: Decimal::from_str("100").unwrap(),
            peak: Decimal::from_str("100").unwrap(),
            tp_order_id: None,
            last_px: Decimal::from_str("100").unwrap(),
        };
        assert!(vp.stop_triggered(Decimal::from_str("99").unwrap(), Decimal::from_str("99").unwrap()));
        assert!(!vp.stop_triggered(Decimal::from_str("99.01").unwrap(), Decimal::from_str("99").unwrap()));
    }

    #[test]
    fn flat_position_never_triggers_a_stop() {
        let vp = VirtualPosition::default();
        assert!(!vp.stop_triggered(Decimal::from_str("1").unwrap(), Decimal::from_str("100").unwrap()));
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_the_bus() {
        let mut bus = InMemoryEventBus::default();
        let mut vp = VirtualPosition::default();
        vp.qty = Decimal::from_str("0.5").unwrap();
        vp.avg = Decimal::from_str("30000").unwrap();
        vp.tp_order_id = Some("abc123".to_string());
        write_virt(&mut bus, "BTC-EUR", &vp).await.unwrap();
        let read_back = read_virt(&mut bus, "BTC-EUR").await.unwrap();
        assert_eq!(read_back, vp);
    }

    #[tokio::test]
    async fn missing_key_reads_back_as_a_flat_default_position() {
        let mut bus = InMemoryEventBus::default();
        let vp = read_virt(&mut bus, "ETH-EUR").await.unwrap();
        assert_eq!(vp, VirtualPosition::default());
    }
}
