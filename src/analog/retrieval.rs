use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::analog::forward::{forward_outcome, percentile, sorted_copy};
use crate::analog::regime::{classify_window, regime_features, Regime, RegimeFeatures};
use crate::analog::vector::WindowVector;
use crate::clock::{calendar_year, DAY_MS, YEAR_MS};
use crate::config::{EngineConfig, Representation, SimilarityFloor, SUPPORTED_WINDOW_LENS};
use crate::error::EngineError;
use crate::model::candle::closes;
use crate::model::Candle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalMatch {
    pub start_ts: u64,
    pub end_ts: u64,
    #[serde(skip)]
    pub end_index: usize,
    /// Raw cosine similarity in [-1, 1].
    pub similarity: f64,
    pub regime: Regime,
    pub age_weight: f64,
    /// `similarity * age_weight`; the ranking key. Non-negative, since floors are >= 0.
    pub final_score: f64,
    pub distance_days: i64,
    pub forward_return: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternInfo {
    pub window_len: usize,
    pub representation: Representation,
    pub start_ts: u64,
    pub end_ts: u64,
    pub last_close: f64,
    pub regime: Regime,
    pub features: RegimeFeatures,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub pattern: Option<PatternInfo>,
    pub matches: Vec<HistoricalMatch>,
    pub candidates_scanned: usize,
    pub candidates_after_regime: usize,
    pub candidates_after_floor: usize,
    pub similarity_floor: f64,
    pub regime_fallback: bool,
    pub insufficient_history: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    end_idx: usize,
    similarity: f64,
    regime: Regime,
    age_weight: f64,
    final_score: f64,
    distance_days: i64,
}

/// `exp(-rate * elapsed_years)`; 1.0 when decay is disabled.
pub fn age_weight(elapsed_ms: u64, decay_per_year: Option<f64>) -> f64 {
    match decay_per_year {
        Some(rate) if rate > 0.0 => (-rate * elapsed_ms as f64 / YEAR_MS).exp(),
        _ => 1.0,
    }
}

pub fn minimum_history(window_len: usize, horizon_bars: usize, buffer: usize) -> usize {
    window_len + horizon_bars + buffer
}

/// Scan `candles` for windows analogous to the most recent one.
///
/// `candles` must already be cut at the request's `as_of`; nothing here looks past the slice.
pub fn retrieve(
    candles: &[Candle],
    cfg: &EngineConfig,
    horizon_days: u32,
) -> Result<RetrievalResult, EngineError> {
    let p = &cfg.retrieval;
    let w = p.window_len;
    if !SUPPORTED_WINDOW_LENS.contains(&w) {
        return Err(EngineError::InvalidWindowSize(w));
    }
    let horizon_bars = cfg.horizon_bars(horizon_days);
    let n = candles.len();
    if n < minimum_history(w, horizon_bars, p.history_buffer) {
        return Ok(RetrievalResult {
            insufficient_history: true,
            ..RetrievalResult::default()
        });
    }

    let all_closes = closes(candles);
    let cur_end = n - 1;
    let cur_start = n - w;
    let cur_slice = &all_closes[cur_start..=cur_end];
    let current = WindowVector::from_closes(cur_slice, p.representation);
    let features = regime_features(cur_slice);
    let current_regime = classify_window(cur_slice);
    let cur_end_ts = candles[cur_end].open_time_ms;

    let pattern = PatternInfo {
        window_len: w,
        representation: p.representation,
        start_ts: candles[cur_start].open_time_ms,
        end_ts: cur_end_ts,
        last_close: all_closes[cur_end],
        regime: current_regime,
        features,
    };

    // Candidate windows end early enough that their forward window is fully realized.
    let last_candidate_end = cur_end - horizon_bars;
    let stride = p.candidate_stride.max(1);
    let mut scanned = Vec::new();
    let mut e = w - 1;
    while e <= last_candidate_end {
        let end_ts = candles[e].open_time_ms;
        let elapsed_ms = cur_end_ts.saturating_sub(end_ts);
        let distance_days = (elapsed_ms / DAY_MS) as i64;
        if distance_days >= p.min_gap_days as i64 {
            let slice = &all_closes[e + 1 - w..=e];
            let similarity = WindowVector::from_closes(slice, p.representation).cosine(&current);
            let aw = age_weight(elapsed_ms, p.age_decay_per_year);
            scanned.push(Candidate {
                end_idx: e,
                similarity,
                regime: classify_window(slice),
                age_weight: aw,
                final_score: similarity * aw,
                distance_days,
            });
        }
        e += stride;
    }
    let candidates_scanned = scanned.len();

    let mut regime_fallback = false;
    let pool: Vec<Candidate> = if p.regime_conditioning {
        let same: Vec<Candidate> = scanned
            .iter()
            .copied()
            .filter(|c| c.regime == current_regime)
            .collect();
        if same.len() < p.regime_min_candidates {
            regime_fallback = true;
            scanned
        } else {
            same
        }
    } else {
        scanned
    };
    let candidates_after_regime = pool.len();

    let similarity_floor = match p.floor {
        SimilarityFloor::Fixed { min_similarity } => min_similarity,
        SimilarityFloor::Quantile { q, floor_min } => {
            let sims: Vec<f64> = pool.iter().map(|c| c.similarity).collect();
            percentile(&sorted_copy(&sims), q).max(floor_min)
        }
    };
    let mut survivors: Vec<Candidate> = pool
        .into_iter()
        .filter(|c| c.similarity >= similarity_floor)
        .collect();
    let candidates_after_floor = survivors.len();

    survivors.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.end_idx.cmp(&a.end_idx))
    });

    let admitted = admit_dispersed(&survivors, candles, p.top_k, p.max_matches_per_year, w);
    let matches = admitted
        .into_iter()
        .filter_map(|c| {
            let (forward_return, max_drawdown) = forward_outcome(candles, c.end_idx, horizon_bars)?;
            Some(HistoricalMatch {
                start_ts: candles[c.end_idx + 1 - w].open_time_ms,
                end_ts: candles[c.end_idx].open_time_ms,
                end_index: c.end_idx,
                similarity: c.similarity,
                regime: c.regime,
                age_weight: c.age_weight,
                final_score: c.final_score,
                distance_days: c.distance_days,
                forward_return,
                max_drawdown,
            })
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        window_len = w,
        horizon_days,
        scanned = candidates_scanned,
        after_regime = candidates_after_regime,
        after_floor = candidates_after_floor,
        matches = matches.len(),
        floor = similarity_floor,
        regime = current_regime.as_str(),
        regime_fallback,
        "analog retrieval complete"
    );

    Ok(RetrievalResult {
        pattern: Some(pattern),
        matches,
        candidates_scanned,
        candidates_after_regime,
        candidates_after_floor,
        similarity_floor,
        regime_fallback,
        insufficient_history: false,
    })
}

/// Walk candidates best-first, skipping ones whose calendar year is full or that overlap an
/// already admitted window, so one historical episode cannot fill the result set.
fn admit_dispersed(
    ranked: &[Candidate],
    candles: &[Candle],
    top_k: usize,
    max_per_year: Option<usize>,
    window_len: usize,
) -> Vec<Candidate> {
    let min_spacing = (window_len / 2).max(1);
    let mut per_year: HashMap<i32, usize> = HashMap::new();
    let mut out: Vec<Candidate> = Vec::with_capacity(top_k);
    for c in ranked {
        if out.len() >= top_k {
            break;
        }
        if out
            .iter()
            .any(|a| a.end_idx.abs_diff(c.end_idx) < min_spacing)
        {
            continue;
        }
        let year = calendar_year(candles[c.end_idx].open_time_ms);
        if let Some(cap) = max_per_year {
            if per_year.get(&year).copied().unwrap_or(0) >= cap {
                continue;
            }
        }
        *per_year.entry(year).or_default() += 1;
        out.push(*c);
    }
    out
}
