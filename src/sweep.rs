use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::analog::engine::{match_series, MatchRequest};
use crate::analog::retrieval::minimum_history;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{Candle, Direction};
use crate::outcome::is_hit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardOptions {
    pub step_bars: usize,
    pub max_points: usize,
    /// Only evaluate points whose cutoff is strictly after this timestamp.
    pub start_after_ms: Option<u64>,
}

impl Default for WalkForwardOptions {
    fn default() -> Self {
        Self {
            step_bars: 5,
            max_points: 100,
            start_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardPoint {
    pub as_of_ms: u64,
    pub direction: Direction,
    pub confidence: f64,
    pub realized_return: f64,
    pub hit: bool,
}

impl WalkForwardPoint {
    pub fn signed_return(&self) -> f64 {
        self.direction.sign() * self.realized_return
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub horizon_days: u32,
    /// Chronological.
    pub points: Vec<WalkForwardPoint>,
    pub hits: usize,
    pub hit_rate: f64,
    pub mean_signed_return: f64,
    pub skipped_no_matches: usize,
}

impl WalkForwardReport {
    pub fn evaluated(&self) -> usize {
        self.points.len()
    }

    pub fn last_as_of_ms(&self) -> Option<u64> {
        self.points.last().map(|p| p.as_of_ms)
    }
}

/// Replay the engine at evenly spaced cutoffs and score each call against what followed.
///
/// Cutoffs are taken backwards from the most recent bar whose forward window is realized, so
/// `max_points` keeps the newest history.
pub fn walk_forward(
    candles: &[Candle],
    cfg: &EngineConfig,
    horizon_days: u32,
    opts: &WalkForwardOptions,
) -> Result<WalkForwardReport, EngineError> {
    let h = cfg.horizon_bars(horizon_days);
    let n = candles.len();
    let min_len = minimum_history(cfg.retrieval.window_len, h, cfg.retrieval.history_buffer);
    let mut report = WalkForwardReport {
        horizon_days,
        ..WalkForwardReport::default()
    };
    if n <= h || n - h < min_len {
        return Ok(report);
    }

    let step = opts.step_bars.max(1);
    let req = MatchRequest::new("", &cfg.timeframe, horizon_days);
    let mut points = Vec::new();
    let mut i = n - 1 - h;
    loop {
        if points.len() >= opts.max_points || i + 1 < min_len {
            break;
        }
        let as_of_ms = candles[i + 1].open_time_ms;
        if opts.start_after_ms.is_some_and(|w| as_of_ms <= w) {
            break;
        }
        let resp = match_series(&candles[..=i], &req, cfg)?;
        if resp.matches.is_empty() {
            report.skipped_no_matches += 1;
        } else {
            let direction = resp.forward_stats.implied_direction(cfg.flat_band);
            let entry = candles[i].close;
            let realized_return = candles[i + h].close / entry - 1.0;
            points.push(WalkForwardPoint {
                as_of_ms,
                direction,
                confidence: resp.confidence,
                realized_return,
                hit: is_hit(direction, realized_return, cfg.flat_band, cfg.hold_band),
            });
        }
        if i < step {
            break;
        }
        i -= step;
    }
    points.reverse();

    report.hits = points.iter().filter(|p| p.hit).count();
    if !points.is_empty() {
        report.hit_rate = report.hits as f64 / points.len() as f64;
        report.mean_signed_return =
            points.iter().map(WalkForwardPoint::signed_return).sum::<f64>() / points.len() as f64;
    }
    report.points = points;
    Ok(report)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub label: String,
    pub report: Option<WalkForwardReport>,
    pub error: Option<String>,
}

/// Variants of `base` across window lengths and fixed similarity floors; invalid combos are skipped.
pub fn sweep_grid(base: &EngineConfig, window_lens: &[usize], min_similarities: &[f64]) -> Vec<(String, EngineConfig)> {
    let mut out = Vec::new();
    for w in window_lens {
        for sim in min_similarities {
            match base.to_builder().window_len(*w).min_similarity(*sim).build() {
                Ok(cfg) => out.push((format!("w{}_sim{:.2}", w, sim), cfg)),
                Err(err) => tracing::debug!(window_len = *w, min_similarity = *sim, error = %err, "sweep variant skipped"),
            }
        }
    }
    out
}

/// Evaluate every config on its own blocking task; results keep the input order.
pub async fn run_sweep(
    candles: Arc<Vec<Candle>>,
    configs: Vec<(String, EngineConfig)>,
    horizon_days: u32,
    opts: WalkForwardOptions,
) -> Vec<SweepResult> {
    let mut set = JoinSet::new();
    let total = configs.len();
    for (idx, (label, cfg)) in configs.into_iter().enumerate() {
        let candles = candles.clone();
        let opts = opts.clone();
        set.spawn_blocking(move || {
            let result = walk_forward(&candles, &cfg, horizon_days, &opts);
            (idx, label, result)
        });
    }

    let mut slots: Vec<Option<SweepResult>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, label, Ok(report))) => {
                slots[idx] = Some(SweepResult {
                    label,
                    report: Some(report),
                    error: None,
                });
            }
            Ok((idx, label, Err(err))) => {
                slots[idx] = Some(SweepResult {
                    label,
                    report: None,
                    error: Some(err.to_string()),
                });
            }
            Err(err) => tracing::warn!(error = %err, "sweep task failed"),
        }
    }
    slots.into_iter().flatten().collect()
}
