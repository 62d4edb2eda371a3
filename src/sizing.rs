use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusResult, Tier};
use crate::model::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Preset {
    Conservative,
    Balanced,
    Aggressive,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Conservative, Preset::Balanced, Preset::Aggressive];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Conservative => "CONSERVATIVE",
            Preset::Balanced => "BALANCED",
            Preset::Aggressive => "AGGRESSIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONSERVATIVE" => Some(Preset::Conservative),
            "BALANCED" => Some(Preset::Balanced),
            "AGGRESSIVE" => Some(Preset::Aggressive),
            _ => None,
        }
    }
}

/// Size bounds and hard thresholds for one preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetPolicy {
    pub base_size: f64,
    pub max_size: f64,
    pub min_confidence: f64,
    pub max_entropy: f64,
    pub max_tail_risk: f64,
    pub min_reliability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetTable {
    pub conservative: PresetPolicy,
    pub balanced: PresetPolicy,
    pub aggressive: PresetPolicy,
}

impl Default for PresetTable {
    fn default() -> Self {
        Self {
            conservative: PresetPolicy {
                base_size: 0.25,
                max_size: 0.50,
                min_confidence: 0.55,
                max_entropy: 0.60,
                max_tail_risk: 0.40,
                min_reliability: 0.70,
            },
            balanced: PresetPolicy {
                base_size: 0.50,
                max_size: 1.00,
                min_confidence: 0.45,
                max_entropy: 0.75,
                max_tail_risk: 0.55,
                min_reliability: 0.55,
            },
            aggressive: PresetPolicy {
                base_size: 0.75,
                max_size: 1.50,
                min_confidence: 0.35,
                max_entropy: 0.85,
                max_tail_risk: 0.70,
                min_reliability: 0.40,
            },
        }
    }
}

impl PresetTable {
    pub fn get(&self, preset: Preset) -> &PresetPolicy {
        match preset {
            Preset::Conservative => &self.conservative,
            Preset::Balanced => &self.balanced,
            Preset::Aggressive => &self.aggressive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConflictLevel {
    None,
    Moderate,
    Severe,
    Wait,
}

impl ConflictLevel {
    pub fn multiplier(self) -> f64 {
        match self {
            ConflictLevel::None => 1.0,
            ConflictLevel::Moderate => 0.6,
            ConflictLevel::Severe | ConflictLevel::Wait => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictLevel::None => "NONE",
            ConflictLevel::Moderate => "MODERATE",
            ConflictLevel::Severe => "SEVERE",
            ConflictLevel::Wait => "WAIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictThresholds {
    /// Net tier weight below this counts as flat.
    pub min_strength: f64,
    /// Weaker/stronger ratio below this is MODERATE, at or above SEVERE.
    pub moderate_ratio: f64,
}

impl Default for ConflictThresholds {
    fn default() -> Self {
        Self {
            min_strength: 0.05,
            moderate_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAssessment {
    pub level: ConflictLevel,
    /// Buy minus sell weight over TIMING and TACTICAL.
    pub short_net: f64,
    /// Buy minus sell weight over STRUCTURE.
    pub long_net: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SideWeights {
    votes: usize,
    buy: f64,
    sell: f64,
    hold: f64,
}

impl SideWeights {
    fn net(&self) -> f64 {
        self.buy - self.sell
    }

    fn hold_dominated(&self) -> bool {
        self.votes > 0 && self.hold > self.buy.max(self.sell)
    }
}

fn side_weights(consensus: &ConsensusResult, short: bool) -> SideWeights {
    consensus
        .tiers
        .iter()
        .filter(|t| t.tier.is_short() == short)
        .fold(SideWeights::default(), |acc, t| SideWeights {
            votes: acc.votes + t.votes,
            buy: acc.buy + t.buy_weight,
            sell: acc.sell + t.sell_weight,
            hold: acc.hold + t.hold_weight,
        })
}

/// Compare short-horizon tiers against STRUCTURE.
pub fn assess_conflict(consensus: &ConsensusResult, t: &ConflictThresholds) -> ConflictAssessment {
    let short = side_weights(consensus, true);
    let long = side_weights(consensus, false);
    let (short_net, long_net) = (short.net(), long.net());
    let (s_abs, l_abs) = (short_net.abs(), long_net.abs());

    let level = if short.votes == 0 || long.votes == 0 {
        ConflictLevel::None
    } else if (s_abs < t.min_strength && long.hold_dominated())
        || (l_abs < t.min_strength && short.hold_dominated())
    {
        ConflictLevel::Wait
    } else if s_abs < t.min_strength || l_abs < t.min_strength || short_net.signum() == long_net.signum() {
        ConflictLevel::None
    } else {
        let ratio = s_abs.min(l_abs) / s_abs.max(l_abs);
        if ratio < t.moderate_ratio {
            ConflictLevel::Moderate
        } else {
            ConflictLevel::Severe
        }
    };

    ConflictAssessment {
        level,
        short_net,
        long_net,
        multiplier: level.multiplier(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub avg_confidence: f64,
    /// Directional entropy of the matched outcomes, in [0, 1].
    pub entropy: f64,
    pub tail_risk: f64,
    /// Composite reliability score of the active model.
    pub reliability: f64,
    pub phase_risk: f64,
}

impl RiskFactors {
    /// Product of the per-factor penalty terms, clamped to [0.2, 1].
    pub fn multiplier(&self) -> f64 {
        let entropy = 1.0 - 0.5 * self.entropy.clamp(0.0, 1.0);
        let tail = 1.0 - 0.6 * self.tail_risk.clamp(0.0, 1.0);
        let reliability = 0.5 + 0.5 * self.reliability.clamp(0.0, 1.0);
        let phase = 1.0 - 0.4 * self.phase_risk.clamp(0.0, 1.0);
        (entropy * tail * reliability * phase).clamp(0.2, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionMode {
    NoData,
    InsufficientSample,
    NoTrade,
    TrendFollow,
    CounterTrend,
}

impl DecisionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoData => "NO_DATA",
            Self::InsufficientSample => "INSUFFICIENT_SAMPLE",
            Self::NoTrade => "NO_TRADE",
            Self::TrendFollow => "TREND_FOLLOW",
            Self::CounterTrend => "COUNTER_TREND",
        }
    }

    pub fn is_tradeable(self) -> bool {
        matches!(self, Self::TrendFollow | Self::CounterTrend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingBlocker {
    LowConfidence,
    HighEntropy,
    HighTailRisk,
    LowReliability,
    SevereConflict,
    ConflictWait,
    ConsensusHold,
}

impl SizingBlocker {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "sizing.low_confidence",
            Self::HighEntropy => "sizing.high_entropy",
            Self::HighTailRisk => "sizing.high_tail_risk",
            Self::LowReliability => "sizing.low_reliability",
            Self::SevereConflict => "sizing.severe_conflict",
            Self::ConflictWait => "sizing.conflict_wait",
            Self::ConsensusHold => "sizing.consensus_hold",
        }
    }
}

/// How many horizons produced usable evidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCoverage {
    pub horizons: usize,
    pub with_matches: usize,
    pub insufficient: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    pub mode: DecisionMode,
    pub preset: Preset,
    pub direction: Direction,
    pub base_size: f64,
    pub max_size: f64,
    pub consensus_multiplier: f64,
    pub conflict_multiplier: f64,
    pub risk_multiplier: f64,
    pub final_size: f64,
    pub conflict: ConflictLevel,
    pub blockers: Vec<SizingBlocker>,
}

impl SizingResult {
    fn flat(mode: DecisionMode, preset: Preset, policy: &PresetPolicy, conflict: ConflictLevel) -> Self {
        Self {
            mode,
            preset,
            direction: Direction::Hold,
            base_size: policy.base_size,
            max_size: policy.max_size,
            consensus_multiplier: 0.0,
            conflict_multiplier: 0.0,
            risk_multiplier: 0.0,
            final_size: 0.0,
            conflict,
            blockers: Vec::new(),
        }
    }
}

pub fn hard_blockers(
    policy: &PresetPolicy,
    consensus: &ConsensusResult,
    conflict: &ConflictAssessment,
    risk: &RiskFactors,
) -> Vec<SizingBlocker> {
    let mut out = Vec::new();
    if risk.avg_confidence < policy.min_confidence {
        out.push(SizingBlocker::LowConfidence);
    }
    if risk.entropy > policy.max_entropy {
        out.push(SizingBlocker::HighEntropy);
    }
    if risk.tail_risk > policy.max_tail_risk {
        out.push(SizingBlocker::HighTailRisk);
    }
    if risk.reliability < 0.5 * policy.min_reliability {
        out.push(SizingBlocker::LowReliability);
    }
    match conflict.level {
        ConflictLevel::Severe => out.push(SizingBlocker::SevereConflict),
        ConflictLevel::Wait => out.push(SizingBlocker::ConflictWait),
        _ => {}
    }
    if consensus.direction == Direction::Hold {
        out.push(SizingBlocker::ConsensusHold);
    }
    out
}

/// Turn consensus, conflict and risk into a mode and size.
///
/// Coverage gates run first, then hard blockers; any blocker yields `NO_TRADE` with every
/// multiplier zeroed. Only when nothing blocks is the multiplicative size computed.
pub fn size_position(
    preset: Preset,
    policy: &PresetPolicy,
    consensus: &ConsensusResult,
    conflict: &ConflictAssessment,
    risk: &RiskFactors,
    coverage: SampleCoverage,
) -> SizingResult {
    if coverage.horizons > 0 && coverage.insufficient == coverage.horizons {
        return SizingResult::flat(DecisionMode::InsufficientSample, preset, policy, conflict.level);
    }
    if coverage.with_matches == 0 || consensus.votes.is_empty() {
        return SizingResult::flat(DecisionMode::NoData, preset, policy, conflict.level);
    }

    let blockers = hard_blockers(policy, consensus, conflict, risk);
    if !blockers.is_empty() {
        return SizingResult {
            blockers,
            ..SizingResult::flat(DecisionMode::NoTrade, preset, policy, conflict.level)
        };
    }

    let risk_multiplier = risk.multiplier();
    let raw = policy.base_size * consensus.multiplier * conflict.multiplier * risk_multiplier;
    let mode = if conflict.level == ConflictLevel::Moderate {
        DecisionMode::CounterTrend
    } else {
        DecisionMode::TrendFollow
    };

    SizingResult {
        mode,
        preset,
        direction: consensus.direction,
        base_size: policy.base_size,
        max_size: policy.max_size,
        consensus_multiplier: consensus.multiplier,
        conflict_multiplier: conflict.multiplier,
        risk_multiplier,
        final_size: raw.min(policy.max_size).max(0.0),
        conflict: conflict.level,
        blockers: Vec::new(),
    }
}
