use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::analog::cache::series_key;
use crate::clock::DAY_MS;
use crate::confidence::calibration::CalibrationKey;
use crate::confidence::reliability::{
    assess_reliability, ReliabilityParams, ReliabilitySnapshot, ReliabilityStore, ResolvedSample,
};
use crate::consensus::Tier;
use crate::model::candle::close_at_or_before;
use crate::model::{Candle, Direction};
use crate::sizing::Preset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotRole {
    Active,
    Shadow,
}

impl SnapshotRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotRole::Active => "ACTIVE",
            SnapshotRole::Shadow => "SHADOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDirection {
    pub tier: Tier,
    pub direction: Direction,
}

/// `symbol|date|horizon|role|preset`, the one-outcome-per-snapshot key.
pub fn snapshot_key(symbol: &str, date: &str, horizon_days: u32, role: SnapshotRole, preset: Preset) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        symbol.trim().to_ascii_uppercase(),
        date,
        horizon_days,
        role.as_str(),
        preset.as_str()
    )
}

/// Decision state at issuance; never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub key: String,
    pub symbol: String,
    pub timeframe: String,
    pub date: String,
    pub issued_at_ms: u64,
    pub maturity_ms: u64,
    pub horizon_days: u32,
    pub tier: Tier,
    pub role: SnapshotRole,
    pub preset: Preset,
    pub model_id: String,
    pub direction: Direction,
    pub raw_evidence: f64,
    pub final_confidence: f64,
    pub entry_price: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub tier_directions: Vec<TierDirection>,
    /// Full decision output at issuance.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PredictionSnapshot {
    pub fn maturity_for(issued_at_ms: u64, horizon_days: u32) -> u64 {
        issued_at_ms.saturating_add(horizon_days as u64 * DAY_MS)
    }

    pub fn calibration_key(&self) -> CalibrationKey {
        CalibrationKey::new(&self.model_id, self.preset.as_str(), self.horizon_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeLabel {
    Up,
    Down,
    Flat,
}

impl OutcomeLabel {
    pub fn from_return(realized: f64, flat_band: f64) -> Self {
        if realized > flat_band {
            OutcomeLabel::Up
        } else if realized < -flat_band {
            OutcomeLabel::Down
        } else {
            OutcomeLabel::Flat
        }
    }
}

pub fn is_hit(direction: Direction, realized: f64, flat_band: f64, hold_band: f64) -> bool {
    match direction {
        Direction::Buy => OutcomeLabel::from_return(realized, flat_band) == OutcomeLabel::Up,
        Direction::Sell => OutcomeLabel::from_return(realized, flat_band) == OutcomeLabel::Down,
        Direction::Hold => realized.abs() <= hold_band,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTruth {
    pub tier: Tier,
    pub direction: Direction,
    pub hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub snapshot_key: String,
    pub symbol: String,
    pub model_id: String,
    pub preset: Preset,
    pub horizon_days: u32,
    pub tier: Tier,
    pub direction: Direction,
    pub maturity_ms: u64,
    pub resolved_at_ms: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_return: f64,
    pub label: OutcomeLabel,
    pub hit: bool,
    pub tier_truth: Vec<TierTruth>,
    /// Realized return fell inside the issued `[p10, p90]` band.
    pub band_hit: bool,
    pub raw_evidence: f64,
    pub final_confidence: f64,
}

impl PredictionOutcome {
    pub fn to_sample(&self) -> ResolvedSample {
        ResolvedSample {
            confidence: self.final_confidence,
            hit: self.hit,
            direction: self.direction,
            realized_return: self.realized_return,
        }
    }
}

pub trait SnapshotStore: Send + Sync {
    /// Returns `false` when a snapshot with the same key already exists.
    fn insert_snapshot(&self, snapshot: &PredictionSnapshot) -> Result<bool>;

    /// Matured snapshots without an outcome, earliest maturity first.
    fn pending_snapshots(&self, now_ms: u64, max: usize) -> Result<Vec<PredictionSnapshot>>;

    /// Insert the outcome if none exists for its key and, in the same atomic step, add it to
    /// the calibration bucket of its raw evidence. Returns `false` when already resolved.
    fn commit_outcome(
        &self,
        outcome: &PredictionOutcome,
        key: &CalibrationKey,
        bucket_count: usize,
    ) -> Result<bool>;

    fn outcome(&self, snapshot_key: &str) -> Result<Option<PredictionOutcome>>;

    /// Most recent outcomes for a model, returned oldest first.
    fn recent_outcomes(&self, model_id: &str, limit: usize) -> Result<Vec<PredictionOutcome>>;
}

pub trait PriceLookup: Send + Sync {
    /// Last close at or before `ts_ms`, or `None` if the series does not reach that far.
    fn close_at(&self, symbol: &str, timeframe: &str, ts_ms: u64) -> Option<f64>;
}

#[derive(Debug, Clone)]
struct LoadedSeries {
    bar_ms: u64,
    candles: Arc<Vec<Candle>>,
}

/// In-memory lookup over preloaded series, one per (symbol, timeframe).
#[derive(Debug, Clone, Default)]
pub struct SeriesPriceLookup {
    series: HashMap<String, LoadedSeries>,
}

impl SeriesPriceLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, timeframe: &str, bar_ms: u64, candles: Arc<Vec<Candle>>) {
        self.series
            .insert(series_key(symbol, timeframe), LoadedSeries { bar_ms, candles });
    }

    pub fn with_series(
        mut self,
        symbol: &str,
        timeframe: &str,
        bar_ms: u64,
        candles: Arc<Vec<Candle>>,
    ) -> Self {
        self.insert(symbol, timeframe, bar_ms, candles);
        self
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl PriceLookup for SeriesPriceLookup {
    fn close_at(&self, symbol: &str, timeframe: &str, ts_ms: u64) -> Option<f64> {
        let loaded = self.series.get(&series_key(symbol, timeframe))?;
        let last = loaded.candles.last()?;
        if last.open_time_ms.saturating_add(loaded.bar_ms) <= ts_ms {
            return None;
        }
        close_at_or_before(&loaded.candles, ts_ms).filter(|p| *p > 0.0)
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub flat_band: f64,
    pub hold_band: f64,
    pub bucket_count: usize,
    pub reliability: ReliabilityParams,
    /// Outcomes read back when refreshing a model's reliability.
    pub reliability_lookback: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            flat_band: 0.0025,
            hold_band: 0.01,
            bucket_count: 10,
            reliability: ReliabilityParams::default(),
            reliability_lookback: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveReport {
    pub examined: usize,
    pub resolved: usize,
    pub skipped_existing: usize,
    pub no_price: usize,
    pub reliability: Vec<ReliabilitySnapshot>,
}

pub fn resolve_snapshot(
    snapshot: &PredictionSnapshot,
    exit_price: f64,
    entry_override: Option<f64>,
    cfg: &ResolverConfig,
    now_ms: u64,
) -> Option<PredictionOutcome> {
    let entry_price = entry_override.unwrap_or(snapshot.entry_price);
    if entry_price <= 0.0 || exit_price <= 0.0 {
        return None;
    }
    let realized_return = exit_price / entry_price - 1.0;
    let tier_truth = snapshot
        .tier_directions
        .iter()
        .map(|t| TierTruth {
            tier: t.tier,
            direction: t.direction,
            hit: is_hit(t.direction, realized_return, cfg.flat_band, cfg.hold_band),
        })
        .collect();
    Some(PredictionOutcome {
        snapshot_key: snapshot.key.clone(),
        symbol: snapshot.symbol.clone(),
        model_id: snapshot.model_id.clone(),
        preset: snapshot.preset,
        horizon_days: snapshot.horizon_days,
        tier: snapshot.tier,
        direction: snapshot.direction,
        maturity_ms: snapshot.maturity_ms,
        resolved_at_ms: now_ms,
        entry_price,
        exit_price,
        realized_return,
        label: OutcomeLabel::from_return(realized_return, cfg.flat_band),
        hit: is_hit(snapshot.direction, realized_return, cfg.flat_band, cfg.hold_band),
        tier_truth,
        band_hit: realized_return >= snapshot.p10 && realized_return <= snapshot.p90,
        raw_evidence: snapshot.raw_evidence,
        final_confidence: snapshot.final_confidence,
    })
}

/// Matures snapshots into outcomes and feeds calibration and reliability.
pub struct OutcomeResolver<S> {
    store: Arc<S>,
    cfg: ResolverConfig,
}

impl<S: SnapshotStore + ReliabilityStore> OutcomeResolver<S> {
    pub fn new(store: Arc<S>, cfg: ResolverConfig) -> Self {
        Self { store, cfg }
    }

    /// Resolve at most `max` matured snapshots. Safe to re-run; already resolved snapshots
    /// are skipped and snapshots without prices stay pending.
    pub fn run<P: PriceLookup>(&self, prices: &P, now_ms: u64, max: usize) -> Result<ResolveReport> {
        let pending = self.store.pending_snapshots(now_ms, max)?;
        let mut report = ResolveReport {
            examined: pending.len(),
            ..ResolveReport::default()
        };
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for snapshot in &pending {
            let Some(exit) = prices.close_at(&snapshot.symbol, &snapshot.timeframe, snapshot.maturity_ms) else {
                report.no_price += 1;
                continue;
            };
            let entry = (snapshot.entry_price <= 0.0)
                .then(|| prices.close_at(&snapshot.symbol, &snapshot.timeframe, snapshot.issued_at_ms))
                .flatten();
            let Some(outcome) = resolve_snapshot(snapshot, exit, entry, &self.cfg, now_ms) else {
                report.no_price += 1;
                continue;
            };
            if self
                .store
                .commit_outcome(&outcome, &snapshot.calibration_key(), self.cfg.bucket_count)?
            {
                report.resolved += 1;
                touched.insert(snapshot.model_id.clone());
                tracing::debug!(
                    key = %snapshot.key,
                    realized = outcome.realized_return,
                    hit = outcome.hit,
                    "prediction resolved"
                );
            } else {
                report.skipped_existing += 1;
            }
        }

        for model_id in touched {
            let samples: Vec<ResolvedSample> = self
                .store
                .recent_outcomes(&model_id, self.cfg.reliability_lookback)?
                .iter()
                .map(PredictionOutcome::to_sample)
                .collect();
            let snap = assess_reliability(&model_id, &samples, None, &self.cfg.reliability, now_ms);
            self.store.append_reliability(&snap)?;
            report.reliability.push(snap);
        }

        tracing::info!(
            examined = report.examined,
            resolved = report.resolved,
            skipped_existing = report.skipped_existing,
            no_price = report.no_price,
            "outcome resolution finished"
        );
        Ok(report)
    }
}
