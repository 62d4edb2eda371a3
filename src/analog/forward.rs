use serde::{Deserialize, Serialize};

use crate::analog::retrieval::HistoricalMatch;
use crate::model::{Candle, Direction};

/// Realized return and worst drawdown after a window ending at `end_idx`.
///
/// Returns `None` when the forward window is not fully inside `candles`, which keeps the
/// aggregator from ever reading an unrealized future.
pub fn forward_outcome(candles: &[Candle], end_idx: usize, horizon_bars: usize) -> Option<(f64, f64)> {
    let exit_idx = end_idx.checked_add(horizon_bars)?;
    if horizon_bars == 0 || exit_idx >= candles.len() {
        return None;
    }
    let entry = candles[end_idx].close;
    if entry.abs() <= f64::EPSILON {
        return None;
    }
    let ret = candles[exit_idx].close / entry - 1.0;
    let mut drawdown: f64 = 0.0;
    for c in &candles[end_idx + 1..=exit_idx] {
        let low = if c.low > 0.0 { c.low.min(c.close) } else { c.close };
        drawdown = drawdown.min(low / entry - 1.0);
    }
    Some((ret, drawdown))
}

/// Linear-interpolated percentile of an ascending slice, `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Percentiles {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl Percentiles {
    pub fn of(values: &[f64]) -> Self {
        let sorted = sorted_copy(values);
        Self {
            p10: percentile(&sorted, 0.10),
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
        }
    }

    pub fn spread(&self) -> f64 {
        (self.p90 - self.p10).max(0.0)
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.p10 && v <= self.p90
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ForwardStats {
    pub horizon_days: u32,
    pub sample_size: usize,
    pub effective_n: f64,
    pub stability_score: f64,
    pub returns: Percentiles,
    pub drawdowns: Percentiles,
    pub weighted_mean_return: f64,
    /// Fraction of matches whose forward return was positive.
    pub up_fraction: f64,
    /// Fraction of matches agreeing with the majority sign.
    pub agreement: f64,
}

impl ForwardStats {
    pub fn empty(horizon_days: u32) -> Self {
        Self {
            horizon_days,
            ..Self::default()
        }
    }

    pub fn dispersion(&self) -> f64 {
        self.returns.spread()
    }

    /// Direction of the median forward return; HOLD without matches or inside the flat band.
    pub fn implied_direction(&self, flat_band: f64) -> Direction {
        if self.sample_size == 0 {
            return Direction::Hold;
        }
        Direction::from_return(self.returns.p50, flat_band)
    }

    /// Binary entropy (bits) of the up/down split, 1.0 for a coin flip.
    pub fn direction_entropy(&self) -> f64 {
        if self.sample_size == 0 {
            return 1.0;
        }
        let p = self.up_fraction.clamp(0.0, 1.0);
        if p <= 0.0 || p >= 1.0 {
            return 0.0;
        }
        -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
    }

    /// Worst-decile drawdown scaled so `scale` maps to 1.0.
    pub fn tail_risk(&self, scale: f64) -> f64 {
        if self.sample_size == 0 {
            return 1.0;
        }
        (self.drawdowns.p10.abs() / scale.max(1e-9)).clamp(0.0, 1.0)
    }
}

pub fn aggregate_forward(matches: &[HistoricalMatch], horizon_days: u32, top_k: usize) -> ForwardStats {
    if matches.is_empty() {
        return ForwardStats::empty(horizon_days);
    }
    let returns: Vec<f64> = matches.iter().map(|m| m.forward_return).collect();
    let drawdowns: Vec<f64> = matches.iter().map(|m| m.max_drawdown).collect();

    let effective_n: f64 = matches.iter().map(|m| m.final_score.max(0.0)).sum();
    let weighted_mean_return = if effective_n > f64::EPSILON {
        matches
            .iter()
            .map(|m| m.final_score.max(0.0) * m.forward_return)
            .sum::<f64>()
            / effective_n
    } else {
        returns.iter().sum::<f64>() / returns.len() as f64
    };

    let n = matches.len();
    let ups = returns.iter().filter(|r| **r > 0.0).count();
    let downs = returns.iter().filter(|r| **r < 0.0).count();

    ForwardStats {
        horizon_days,
        sample_size: n,
        effective_n,
        stability_score: (n as f64 / top_k.max(10) as f64).min(1.0),
        returns: Percentiles::of(&returns),
        drawdowns: Percentiles::of(&drawdowns),
        weighted_mean_return,
        up_fraction: ups as f64 / n as f64,
        agreement: ups.max(downs) as f64 / n as f64,
    }
}
