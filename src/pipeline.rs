use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::analog::engine::{match_series, AnalogEngine, CandleSource, MatchRequest, SafetyFlags};
use crate::analog::forward::ForwardStats;
use crate::analog::regime::Regime;
use crate::clock::{format_date, Clock};
use crate::confidence::calibration::{CalibrationKey, CalibrationStore};
use crate::confidence::reliability::{ReliabilitySnapshot, ReliabilityStore};
use crate::confidence::{assess_confidence, ConfidenceBreakdown};
use crate::config::EngineConfig;
use crate::consensus::{resolve_consensus, tier_for_horizon, Blocker, ConsensusResult, Tier, VoteInput};
use crate::error::EngineError;
use crate::model::candle::truncate_before;
use crate::model::Direction;
use crate::outcome::{snapshot_key, PredictionSnapshot, SnapshotRole, SnapshotStore, TierDirection};
use crate::shadow::{spawn_shadow_evaluation, ShadowRegistry};
use crate::sizing::{
    assess_conflict, size_position, ConflictAssessment, Preset, RiskFactors, SampleCoverage,
    SizingResult,
};
use crate::store::EngineStore;
use crate::sweep::WalkForwardOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub symbol: String,
    pub timeframe: String,
    pub as_of_ms: Option<u64>,
    pub preset: Preset,
    /// Persist one prediction snapshot per voting horizon.
    pub record: bool,
}

impl SignalRequest {
    pub fn new(symbol: &str, timeframe: &str, preset: Preset) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_uppercase(),
            timeframe: timeframe.trim().to_string(),
            as_of_ms: None,
            preset,
            record: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonSignal {
    pub horizon_days: u32,
    pub tier: Tier,
    pub insufficient_history: bool,
    pub match_count: usize,
    pub direction: Direction,
    pub forward_stats: ForwardStats,
    pub confidence: Option<ConfidenceBreakdown>,
    pub entropy: f64,
    pub tail_risk: f64,
    pub blockers: Vec<Blocker>,
}

impl HorizonSignal {
    pub fn votes(&self) -> bool {
        !self.insufficient_history && self.match_count > 0 && self.confidence.is_some()
    }

    pub fn final_confidence(&self) -> f64 {
        self.confidence.as_ref().map_or(0.0, |c| c.final_confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDecision {
    pub symbol: String,
    pub timeframe: String,
    pub as_of_ms: Option<u64>,
    pub issued_at_ms: u64,
    pub model_id: String,
    pub preset: Preset,
    pub regime: Option<Regime>,
    pub entry_price: Option<f64>,
    pub horizons: Vec<HorizonSignal>,
    pub consensus: ConsensusResult,
    pub conflict: ConflictAssessment,
    pub risk: RiskFactors,
    pub reliability: ReliabilitySnapshot,
    pub sizing: SizingResult,
    pub snapshots_written: usize,
    pub safety: SafetyFlags,
}

/// Per-horizon blockers handed to the consensus resolver.
pub fn vote_blockers(
    confidence: f64,
    entropy: f64,
    tail_risk: f64,
    reliability: &ReliabilitySnapshot,
    cfg: &EngineConfig,
) -> Vec<Blocker> {
    let t = &cfg.votes;
    let mut out = Vec::new();
    if confidence < t.low_confidence {
        out.push(Blocker::LowConfidence);
    }
    if entropy > t.high_entropy {
        out.push(Blocker::HighEntropy);
    }
    if tail_risk > t.high_tail_risk {
        out.push(Blocker::HighTailRisk);
    }
    if reliability.badge.is_degraded() {
        out.push(Blocker::DegradedReliability);
    }
    out
}

/// Full request path: retrieval per horizon, confidence, consensus, sizing, snapshots.
pub struct SignalPipeline<S, St> {
    engine: AnalogEngine<S>,
    store: Arc<St>,
    cfg: EngineConfig,
    shadows: Option<Arc<ShadowRegistry<St>>>,
    shadow_opts: WalkForwardOptions,
    shadow_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, St> SignalPipeline<S, St>
where
    S: CandleSource,
    St: EngineStore + 'static,
{
    pub fn new(engine: AnalogEngine<S>, store: Arc<St>, cfg: EngineConfig) -> Self {
        Self {
            engine,
            store,
            cfg,
            shadows: None,
            shadow_opts: WalkForwardOptions::default(),
            shadow_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_shadows(mut self, registry: Arc<ShadowRegistry<St>>, opts: WalkForwardOptions) -> Self {
        self.shadows = Some(registry);
        self.shadow_opts = opts;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn engine(&self) -> &AnalogEngine<S> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    /// Wait up to `timeout` for shadow evaluations started by this pipeline. Returns false if
    /// some were still running; those stay detached.
    pub async fn flush_shadows(&self, timeout: Duration) -> bool {
        let tasks = match self.shadow_tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return false,
        };
        if tasks.is_empty() {
            return true;
        }
        let count = tasks.len();
        let waited = tokio::time::timeout(timeout, async move {
            for task in tasks {
                if let Err(err) = task.await {
                    tracing::warn!(error = %err, "shadow evaluation task failed");
                }
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(tasks = count, timeout_ms = timeout.as_millis() as u64, "shadow evaluation still running");
        }
        waited.is_ok()
    }

    pub async fn run(&self, req: &SignalRequest) -> Result<SignalDecision, EngineError> {
        let cfg = &self.cfg;
        let candles = self.engine.history(&req.symbol, &req.timeframe).await?;
        let now = self.engine.clock().now_ms();
        let issued_at_ms = req.as_of_ms.unwrap_or(now);

        let reliability = self
            .store
            .latest_reliability(&cfg.model_id)?
            .unwrap_or_else(|| ReliabilitySnapshot::baseline(&cfg.model_id, now));

        let mut horizons = Vec::with_capacity(cfg.horizons.len());
        let mut votes = Vec::new();
        let mut regime = None;
        let mut entry_price = None;
        let mut coverage = SampleCoverage {
            horizons: cfg.horizons.len(),
            ..SampleCoverage::default()
        };

        for &h in &cfg.horizons {
            let mreq = MatchRequest::new(&req.symbol, &req.timeframe, h).as_of(req.as_of_ms);
            let resp = match_series(&candles, &mreq, cfg)?;
            let tier = tier_for_horizon(h);
            if resp.insufficient_history {
                coverage.insufficient += 1;
                horizons.push(HorizonSignal {
                    horizon_days: h,
                    tier,
                    insufficient_history: true,
                    match_count: 0,
                    direction: Direction::Hold,
                    forward_stats: resp.forward_stats,
                    confidence: None,
                    entropy: 1.0,
                    tail_risk: 1.0,
                    blockers: Vec::new(),
                });
                continue;
            }
            if let Some(p) = &resp.pattern {
                regime.get_or_insert(p.regime);
                entry_price.get_or_insert(p.last_close);
            }

            let key = CalibrationKey::new(&cfg.model_id, req.preset.as_str(), h);
            let table = self.store.load_or_init(&key, cfg.calibration.buckets)?;
            let confidence = assess_confidence(&resp.forward_stats, &table, &reliability, cfg);
            let direction = resp.forward_stats.implied_direction(cfg.flat_band);
            let entropy = resp.forward_stats.direction_entropy();
            let tail_risk = resp.forward_stats.tail_risk(cfg.votes.tail_drawdown_scale);
            let blockers = vote_blockers(confidence.final_confidence, entropy, tail_risk, &reliability, cfg);

            if !resp.matches.is_empty() {
                coverage.with_matches += 1;
                votes.push(VoteInput {
                    horizon_days: h,
                    tier,
                    direction,
                    confidence: confidence.vote_confidence(),
                    reliability_modifier: reliability.modifier,
                    blockers: blockers.clone(),
                });
            }
            horizons.push(HorizonSignal {
                horizon_days: h,
                tier,
                insufficient_history: false,
                match_count: resp.matches.len(),
                direction,
                forward_stats: resp.forward_stats,
                confidence: Some(confidence),
                entropy,
                tail_risk,
                blockers,
            });
        }

        let consensus = resolve_consensus(&votes, &cfg.consensus);
        let conflict = assess_conflict(&consensus, &cfg.conflict);
        let voting: Vec<&HorizonSignal> = horizons.iter().filter(|h| h.votes()).collect();
        let risk = if voting.is_empty() {
            RiskFactors {
                avg_confidence: 0.0,
                entropy: 1.0,
                tail_risk: 1.0,
                reliability: reliability.score,
                phase_risk: regime.map_or(0.0, Regime::phase_risk),
            }
        } else {
            let n = voting.len() as f64;
            RiskFactors {
                avg_confidence: voting.iter().map(|h| h.final_confidence()).sum::<f64>() / n,
                entropy: voting.iter().map(|h| h.entropy).sum::<f64>() / n,
                tail_risk: voting.iter().map(|h| h.tail_risk).fold(0.0, f64::max),
                reliability: reliability.score,
                phase_risk: regime.map_or(0.0, Regime::phase_risk),
            }
        };
        let policy = cfg.presets.get(req.preset);
        let sizing = size_position(req.preset, policy, &consensus, &conflict, &risk, coverage);

        let mut decision = SignalDecision {
            symbol: req.symbol.clone(),
            timeframe: req.timeframe.clone(),
            as_of_ms: req.as_of_ms,
            issued_at_ms,
            model_id: cfg.model_id.clone(),
            preset: req.preset,
            regime,
            entry_price,
            horizons,
            consensus,
            conflict,
            risk,
            reliability,
            sizing,
            snapshots_written: 0,
            safety: SafetyFlags::default(),
        };

        if req.record {
            decision.snapshots_written = self.record_snapshots(&decision)?;
        }

        if let Some(registry) = &self.shadows {
            let visible = Arc::new(truncate_before(&candles, req.as_of_ms).to_vec());
            let primary = cfg
                .horizons
                .iter()
                .copied()
                .find(|h| tier_for_horizon(*h) == Tier::Tactical)
                .unwrap_or(cfg.horizons[0]);
            // Detached: the decision never waits on shadow models.
            let handle = spawn_shadow_evaluation(
                registry.clone(),
                visible,
                cfg.clone(),
                primary,
                self.shadow_opts.clone(),
            );
            if let Ok(mut tasks) = self.shadow_tasks.lock() {
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
        }

        tracing::info!(
            symbol = %decision.symbol,
            preset = decision.preset.as_str(),
            direction = decision.consensus.direction.as_str(),
            score = decision.consensus.score,
            mode = decision.sizing.mode.as_str(),
            final_size = decision.sizing.final_size,
            blockers = decision.sizing.blockers.len(),
            "signal decided"
        );
        Ok(decision)
    }

    fn record_snapshots(&self, decision: &SignalDecision) -> Result<usize, EngineError> {
        let Some(entry_price) = decision.entry_price else {
            return Ok(0);
        };
        let date = format_date(decision.issued_at_ms);
        let tier_directions: Vec<TierDirection> = decision
            .consensus
            .tiers
            .iter()
            .filter(|t| t.votes > 0)
            .map(|t| TierDirection {
                tier: t.tier,
                direction: t.direction(),
            })
            .collect();
        let mut written = 0;
        for h in decision.horizons.iter().filter(|h| h.votes()) {
            let Some(confidence) = &h.confidence else {
                continue;
            };
            let snapshot = PredictionSnapshot {
                key: snapshot_key(
                    &decision.symbol,
                    &date,
                    h.horizon_days,
                    SnapshotRole::Active,
                    decision.preset,
                ),
                symbol: decision.symbol.clone(),
                timeframe: decision.timeframe.clone(),
                date: date.clone(),
                issued_at_ms: decision.issued_at_ms,
                maturity_ms: PredictionSnapshot::maturity_for(decision.issued_at_ms, h.horizon_days),
                horizon_days: h.horizon_days,
                tier: h.tier,
                role: SnapshotRole::Active,
                preset: decision.preset,
                model_id: decision.model_id.clone(),
                direction: h.direction,
                raw_evidence: confidence.raw_evidence(),
                final_confidence: confidence.final_confidence,
                entry_price,
                p10: h.forward_stats.returns.p10,
                p50: h.forward_stats.returns.p50,
                p90: h.forward_stats.returns.p90,
                tier_directions: tier_directions.clone(),
                payload: serde_json::json!({
                    "horizon": h,
                    "consensus_direction": decision.consensus.direction,
                    "consensus_score": decision.consensus.score,
                    "sizing": decision.sizing,
                }),
            };
            if self.store.insert_snapshot(&snapshot)? {
                written += 1;
            }
        }
        Ok(written)
    }
}
