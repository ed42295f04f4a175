//! Trading core guard rails (§4.D). Grounded on original_source's
//! `services/trading_core/trading_core/executor.py`: an ordered chain of
//! checks run against every intent before it is allowed onto the outbox.
//! The first failing guard wins; its label is the reason recorded on the
//! rejected intent.

use crate::config::TradingCoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardRejection {
    KillSwitch,
    SlotCapExceeded,
    GlobalExposureExceeded,
    AssetExposureExceeded,
    InsufficientBalance,
}

impl GuardRejection {
    pub fn label(&self) -> &'static str {
        match self {
            GuardRejection::KillSwitch => "kill_switch",
            GuardRejection::SlotCapExceeded => "slot_cap",
            GuardRejection::GlobalExposureExceeded => "global_exposure_cap",
            GuardRejection::AssetExposureExceeded => "asset_exposure_cap",
            GuardRejection::InsufficientBalance => "insufficient_balance",
        }
    }
}

/// Effective global exposure cap (§4.D `compute_caps`): the configured flat
/// `MAX_GLOBAL_EXPOSURE_EUR` if set, else `current_global + eur_available`.
pub fn compute_global_cap(cfg: &TradingCoreConfig, ctx: &GuardContext) -> f64 {
    cfg.max_global_exposure_eur
        .unwrap_or(ctx.current_global_exposure_eur + ctx.available_balance_eur)
}

/// Combined exposure cap for a single asset: the lesser of the configured
/// flat `max_per_asset_eur`, `per_asset_frac * global_cap`, and
/// `slot_budget_eur`, among whichever of the three are configured/available.
/// None of them configured means no asset-level cap.
pub fn compute_asset_cap(cfg: &TradingCoreConfig, ctx: &GuardContext, global_cap: f64) -> Option<f64> {
    let frac_cap = cfg.per_asset_frac.map(|frac| frac * global_cap);
    let flat_and_frac = match (cfg.max_per_asset_eur, frac_cap) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    match flat_and_frac {
        Some(a) => Some(a.min(ctx.slot_budget_eur)),
        None => Some(ctx.slot_budget_eur),
    }
}

/// Tolerance applied to every exposure/balance comparison, matching the
/// `+ ε` slack in the cap checks (floating-point EUR sums accumulate via
/// `hincrbyfloat`-style increments and should not trip a cap on rounding
/// noise alone).
const EPSILON_EUR: f64 = 1e-6;

pub struct GuardContext {
    pub kill_switch_engaged: bool,
    pub open_positions: i64,
    pub current_global_exposure_eur: f64,
    pub current_asset_exposure_eur: f64,
    pub available_balance_eur: f64,
    pub slot_budget_eur: f64,
}

/// Runs the ordered guard chain: kill switch, concurrent-position slot cap,
/// global exposure cap, per-asset exposure cap, available balance. Returns
/// the first failing guard, or `None` if the intent clears every rail.
pub fn blocked_by_guards(
    cfg: &TradingCoreConfig,
    ctx: &GuardContext,
    intent_size_eur: f64,
) -> Option<GuardRejection> {
    if ctx.kill_switch_engaged {
        return Some(GuardRejection::KillSwitch);
    }

    if cfg.max_concurrent_pos > 0 && ctx.open_positions >= cfg.max_concurrent_pos {
        return Some(GuardRejection::SlotCapExceeded);
    }

    let global_cap = compute_global_cap(cfg, ctx);
    if ctx.current_global_exposure_eur + intent_size_eur > global_cap + EPSILON_EUR {
        return Some(GuardRejection::GlobalExposureExceeded);
    }

    if let Some(asset_cap) = compute_asset_cap(cfg, ctx, global_cap) {
        if asset_cap > 0.0 && ctx.current_asset_exposure_eur + intent_size_eur > asset_cap + EPSILON_EUR {
            return Some(GuardRejection::AssetExposureExceeded);
        }
    }

    if intent_size_eur > ctx.available_balance_eur + EPSILON_EUR {
        return Some(GuardRejection::InsufficientBalance);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TradingCoreConfig {
        TradingCoreConfig {
            redis_url: String::new(),
            signal_stream: String::new(),
            order_outbox_stream: String::new(),
            consumer_group: "trading_core".into(),
            consumer_name: "core".into(),
            dry_run: true,
            max_concurrent_pos: 3,
            max_global_exposure_eur: Some(1000.0),
            max_per_asset_eur: Some(400.0),
            per_asset_frac: Some(0.5),
            tp_pct: 0.01,
            sl_pct: 0.01,
            trailing_pct: 0.04,
        }
    }

    fn ctx() -> GuardContext {
        GuardContext {
            kill_switch_engaged: false,
            open_positions: 0,
            current_global_exposure_eur: 0.0,
            current_asset_exposure_eur: 0.0,
            available_balance_eur: 1000.0,
            slot_budget_eur: 1000.0,
        }
    }

    #[test]
    fn kill_switch_blocks_before_any_other_check() {
        let mut c = ctx();
        c.kill_switch_engaged = true;
        assert_eq!(blocked_by_guards(&cfg(), &c, 10.0), Some(GuardRejection::KillSwitch));
    }

    #[test]
    fn slot_cap_blocks_when_open_positions_at_or_above_max() {
        let mut c = ctx();
        c.open_positions = 3;
        assert_eq!(blocked_by_guards(&cfg(), &c, 10.0), Some(GuardRejection::SlotCapExceeded));
    }

    #[test]
    fn global_exposure_cap_blocks_when_intent_would_exceed_it() {
        let mut c = ctx();
        c.current_global_exposure_eur = 995.0;
        assert_eq!(
            blocked_by_guards(&cfg(), &c, 10.0),
            Some(GuardRejection::GlobalExposureExceeded)
        );
    }

    #[test]
    fn asset_cap_takes_the_lesser_of_flat_fractional_and_slot_budget_caps() {
        // max_per_asset_eur=400, per_asset_frac*global=0.5*1000=500, slot_budget=1000 -> cap is 400.
        let c = ctx();
        let global_cap = compute_global_cap(&cfg(), &c);
        assert_eq!(compute_asset_cap(&cfg(), &c, global_cap), Some(400.0));
    }

    #[test]
    fn asset_cap_is_further_bounded_by_slot_budget() {
        let mut c = ctx();
        c.slot_budget_eur = 50.0;
        let global_cap = compute_global_cap(&cfg(), &c);
        assert_eq!(compute_asset_cap(&cfg(), &c, global_cap), Some(50.0));
    }

    #[test]
    fn global_cap_falls_back_to_current_plus_available_when_unconfigured() {
        let mut c = ctx();
        c.current_global_exposure_eur = 20.0;
        c.available_balance_eur = 30.0;
        let mut no_cap_cfg = cfg();
        no_cap_cfg.max_global_exposure_eur = None;
        assert_eq!(compute_global_cap(&no_cap_cfg, &c), 50.0);
    }

    #[test]
    fn asset_exposure_cap_blocks_when_intent_would_exceed_combined_cap() {
        let mut c = ctx();
        c.current_asset_exposure_eur = 395.0;
        assert_eq!(
            blocked_by_guards(&cfg(), &c, 10.0),
            Some(GuardRejection::AssetExposureExceeded)
        );
    }

    #[test]
    fn insufficient_balance_blocks_last() {
        let mut c = ctx();
        c.available_balance_eur = 5.0;
        assert_eq!(
            blocked_by_guards(&cfg(), &c, 10.0),
            Some(GuardRejection::InsufficientBalance)
        );
    }

    #[test]
    fn clears_every_rail_when_within_all_limits() {
        assert_eq!(blocked_by_guards(&cfg(), &ctx(), 10.0), None);
    }
}
