//! Signal engine (§4.C): per-market rolling return/volume windows and the
//! filter-bank scoring function. Grounded on original_source's
//! `ai/baseline_signals.py` (`MktState`, `stddev`, `wick_ratio`,
//! `eval_filters`).

use crate::config::SignalConfig;
use std::collections::VecDeque;

const WICK_EPSILON: f64 = 1e-12;

pub struct MktState {
    pub returns: VecDeque<f64>,
    pub volumes: VecDeque<f64>,
    pub last_close: Option<f64>,
    pub last_bidask: Option<(f64, f64)>,
    returns_cap: usize,
    volumes_cap: usize,
}

impl MktState {
    pub fn new(returns_cap: usize, volumes_cap: usize) -> Self {
        Self {
            returns: VecDeque::with_capacity(returns_cap),
            volumes: VecDeque::with_capacity(volumes_cap),
            last_close: None,
            last_bidask: None,
            returns_cap,
            volumes_cap,
        }
    }

    pub fn push_return(&mut self, r: f64) {
        if self.returns.len() == self.returns_cap {
            self.returns.pop_front();
        }
        self.returns.push_back(r);
    }

    pub fn push_volume(&mut self, v: f64) {
        if self.volumes.len() == self.volumes_cap {
            self.volumes.pop_front();
        }
        self.volumes.push_back(v);
    }

    /// Appends a candle's close as a return relative to the prior close, then
    /// updates `last_close`. No-op on the first candle (no prior close yet).
    pub fn observe_close(&mut self, close: f64) {
        if let Some(prev) = self.last_close {
            if prev > 0.0 {
                self.push_return((close - prev) / prev);
            }
        }
        self.last_close = Some(close);
    }
}

/// Sample standard deviation (n-1 denominator); `0.0` below 2 samples.
pub fn stddev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt()
}

/// `wick = max(upper, lower) / body`, with `body` epsilon-floored so a doji
/// candle never divides by zero.
pub fn wick_ratio(o: f64, h: f64, l: f64, c: f64) -> f64 {
    let body = (c - o).abs().max(WICK_EPSILON);
    let upper = (h - o.max(c)).max(0.0);
    let lower = (o.min(c) - l).max(0.0);
    upper.max(lower) / body
}

#[derive(Debug, Clone, Default)]
pub struct FilterDetails {
    pub spread_bps: Option<f64>,
    pub vol_std: Option<f64>,
    pub vol_last: Option<f64>,
    pub vol_mean: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub any_true: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub details: FilterDetails,
}

/// The book/volume-derived predicates only: spread, volatility, and volume
/// spike. Does **not** see the wick predicate — see the module doc on
/// evaluation order below.
pub fn eval_filters(ms: &MktState, cfg: &SignalConfig) -> FilterOutcome {
    let mut out = FilterOutcome::default();

    if let Some((bid, ask)) = ms.last_bidask {
        if bid > 0.0 && ask > 0.0 {
            let mid = 0.5 * (ask + bid);
            let spread_bps = (ask - bid) / mid * 1e4;
            out.details.spread_bps = Some(spread_bps);
            if spread_bps <= cfg.spread_bps_max {
                out.reasons.push(format!("spread<={}bps", cfg.spread_bps_max));
                out.score += 1.0;
                out.any_true = true;
            }
        }
    }

    if ms.returns.len() >= (cfg.vol_window / 3).max(5) {
        let returns: Vec<f64> = ms.returns.iter().copied().collect();
        let vol_std = stddev(&returns);
        out.details.vol_std = Some(vol_std);
        if vol_std >= cfg.vol_std_min {
            out.reasons.push(format!("vol_std>={}", cfg.vol_std_min));
            out.score += 1.0;
            out.any_true = true;
        }
    }

    if ms.volumes.len() >= 5 {
        let volumes: Vec<f64> = ms.volumes.iter().copied().collect();
        let (hist, last) = volumes.split_at(volumes.len() - 1);
        let last_v = last[0];
        let mean_v = if hist.is_empty() {
            0.0
        } else {
            hist.iter().sum::<f64>() / hist.len() as f64
        };
        out.details.vol_last = Some(last_v);
        out.details.vol_mean = Some(mean_v);
        if mean_v > 0.0 && last_v >= cfg.vol_spike_mult * mean_v {
            out.reasons.push(format!("volume>={}x", cfg.vol_spike_mult));
            out.score += 1.0;
            out.any_true = true;
        }
    }

    out
}

/// The candle handler's full evaluation: book/volume predicates from
/// `eval_filters`, plus the wick predicate computed from this candle,
/// folded in explicitly.
///
/// original_source's `eval_filters` reads `details.get("wick_ok", False)`
/// before the candle handler has set it on that same `details` dict, so the
/// read is always `False` — the wick contribution only ever reaches
/// `any_true` through the candle handler's own later check. This function
/// makes that the only path: `eval_filters` never sees `wick_ok` at all, and
/// the wick predicate is folded in exactly once, here.
pub fn evaluate_candle(
    ms: &MktState,
    cfg: &SignalConfig,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
) -> (FilterOutcome, f64, bool) {
    let mut outcome = eval_filters(ms, cfg);
    let wr = wick_ratio(o, h, l, c);
    let wick_ok = wr >= cfg.wick_ratio_min;
    if wick_ok {
        outcome.reasons.push(format!("wick>={}x", cfg.wick_ratio_min));
        outcome.score += 1.0;
        outcome.any_true = true;
    }
    (outcome, wr, wick_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SignalConfig {
        SignalConfig {
            redis_url: String::new(),
            spread_bps_max: 15.0,
            vol_window: 30,
            vol_std_min: 0.002,
            vol_spike_window: 60,
            vol_spike_mult: 3.0,
            wick_ratio_min: 2.0,
            signal_stream: "signals:baseline".into(),
            idle_flush_sec: 1.0,
        }
    }

    #[test]
    fn stddev_below_two_samples_is_zero() {
        assert_eq!(stddev(&[0.01]), 0.0);
        assert_eq!(stddev(&[]), 0.0);
    }

    #[test]
    fn wick_ratio_floors_body_at_epsilon_for_doji_candles() {
        let wr = wick_ratio(100.0, 101.0, 99.0, 100.0);
        assert!(wr > 0.0);
        assert!(wr.is_finite());
    }

    #[test]
    fn volatility_predicate_suppressed_below_minimum_sample_threshold() {
        let c = cfg();
        let mut ms = MktState::new(c.vol_window, c.vol_spike_window);
        // vol_window/3 == 10; only 3 samples pushed.
        for _ in 0..3 {
            ms.push_return(0.05);
        }
        let outcome = eval_filters(&ms, &c);
        assert!(outcome.details.vol_std.is_none());
    }

    #[test]
    fn volume_spike_predicate_suppressed_below_five_samples() {
        let c = cfg();
        let mut ms = MktState::new(c.vol_window, c.vol_spike_window);
        for v in [1.0, 1.0, 1.0] {
            ms.push_volume(v);
        }
        let outcome = eval_filters(&ms, &c);
        assert!(outcome.details.vol_last.is_none());
    }

    #[test]
    fn volume_spike_fires_at_three_times_mean() {
        let c = cfg();
        let mut ms = MktState::new(c.vol_window, c.vol_spike_window);
        for v in [10.0, 10.0, 10.0, 10.0] {
            ms.push_volume(v);
        }
        ms.push_volume(30.0); // 3x mean of history
        let outcome = eval_filters(&ms, &c);
        assert!(outcome.any_true);
        assert!(outcome.reasons.iter().any(|r| r.starts_with("volume>=")));
    }

    #[test]
    fn wick_predicate_is_folded_in_by_evaluate_candle_not_eval_filters() {
        let c = cfg();
        let ms = MktState::new(c.vol_window, c.vol_spike_window);
        // A long lower wick candle with a tiny body: wick ratio far above the
        // 2.0 threshold.
        let (outcome, wr, wick_ok) = evaluate_candle(&ms, &c, 100.0, 100.05, 90.0, 100.0);
        assert!(wick_ok);
        assert!(wr >= c.wick_ratio_min);
        assert!(outcome.any_true);
        assert!(outcome.reasons.iter().any(|r| r.starts_with("wick>=")));

        // eval_filters alone (no book/volume state) never sees wick_ok.
        let bare = eval_filters(&ms, &c);
        assert!(!bare.any_true);
    }
}
