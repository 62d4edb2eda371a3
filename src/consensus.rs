use serde::{Deserialize, Serialize};

use crate::model::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Timing,
    Tactical,
    Structure,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Timing, Tier::Tactical, Tier::Structure];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Timing => "TIMING",
            Tier::Tactical => "TACTICAL",
            Tier::Structure => "STRUCTURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TIMING" => Some(Tier::Timing),
            "TACTICAL" => Some(Tier::Tactical),
            "STRUCTURE" => Some(Tier::Structure),
            _ => None,
        }
    }

    /// Short-horizon tiers are weighed against STRUCTURE in the conflict check.
    pub fn is_short(self) -> bool {
        !matches!(self, Tier::Structure)
    }
}

/// 7d/14d are TIMING, 30d TACTICAL, 90d and longer STRUCTURE.
pub fn tier_for_horizon(horizon_days: u32) -> Tier {
    match horizon_days {
        0..=14 => Tier::Timing,
        15..=60 => Tier::Tactical,
        _ => Tier::Structure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Blocker {
    LowConfidence,
    HighEntropy,
    HighTailRisk,
    DegradedReliability,
}

impl Blocker {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::HighEntropy => "HIGH_ENTROPY",
            Self::HighTailRisk => "HIGH_TAIL_RISK",
            Self::DegradedReliability => "DEGRADED_RELIABILITY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerPenalties {
    pub low_confidence: f64,
    pub high_entropy: f64,
    pub high_tail_risk: f64,
    pub degraded_reliability: f64,
}

impl Default for BlockerPenalties {
    fn default() -> Self {
        Self {
            low_confidence: 0.30,
            high_entropy: 0.25,
            high_tail_risk: 0.35,
            degraded_reliability: 0.20,
        }
    }
}

impl BlockerPenalties {
    pub fn penalty(&self, blocker: Blocker) -> f64 {
        match blocker {
            Blocker::LowConfidence => self.low_confidence,
            Blocker::HighEntropy => self.high_entropy,
            Blocker::HighTailRisk => self.high_tail_risk,
            Blocker::DegradedReliability => self.degraded_reliability,
        }
    }

    /// Sum of distinct blocker penalties, capped at 1.
    pub fn total(&self, blockers: &[Blocker]) -> f64 {
        let mut seen: Vec<Blocker> = Vec::with_capacity(blockers.len());
        let mut total = 0.0;
        for b in blockers {
            if !seen.contains(b) {
                seen.push(*b);
                total += self.penalty(*b).max(0.0);
            }
        }
        total.min(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub timing_weight: f64,
    pub tactical_weight: f64,
    pub structure_weight: f64,
    /// Scores at or below `band_lo` map to `min_multiplier`.
    pub band_lo: f64,
    /// Scores at or above `band_hi` map to `max_multiplier`.
    pub band_hi: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    pub penalties: BlockerPenalties,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timing_weight: 0.25,
            tactical_weight: 0.35,
            structure_weight: 0.40,
            band_lo: 0.25,
            band_hi: 0.80,
            min_multiplier: 0.2,
            max_multiplier: 1.0,
            penalties: BlockerPenalties::default(),
        }
    }
}

impl ConsensusConfig {
    pub fn tier_weight(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Timing => self.timing_weight,
            Tier::Tactical => self.tactical_weight,
            Tier::Structure => self.structure_weight,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.timing_weight, self.tactical_weight, self.structure_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("tier weights must be finite and >= 0".to_string());
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err("tier weights must not all be zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.band_lo)
            || !(0.0..=1.0).contains(&self.band_hi)
            || self.band_lo >= self.band_hi
        {
            return Err(format!(
                "consensus band [{}, {}] must satisfy 0 <= lo < hi <= 1",
                self.band_lo, self.band_hi
            ));
        }
        if self.min_multiplier < 0.0 || self.min_multiplier > self.max_multiplier {
            return Err("consensus multipliers must satisfy 0 <= min <= max".to_string());
        }
        let p = &self.penalties;
        for v in [
            p.low_confidence,
            p.high_entropy,
            p.high_tail_risk,
            p.degraded_reliability,
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("blocker penalty {} outside [0, 1]", v));
            }
        }
        Ok(())
    }
}

/// One horizon's signal as handed to the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteInput {
    pub horizon_days: u32,
    pub tier: Tier,
    pub direction: Direction,
    pub confidence: f64,
    pub reliability_modifier: f64,
    pub blockers: Vec<Blocker>,
}

impl VoteInput {
    pub fn new(horizon_days: u32, direction: Direction, confidence: f64) -> Self {
        Self {
            horizon_days,
            tier: tier_for_horizon(horizon_days),
            direction,
            confidence,
            reliability_modifier: 1.0,
            blockers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonVote {
    pub horizon_days: u32,
    pub tier: Tier,
    pub direction: Direction,
    pub confidence: f64,
    pub reliability_modifier: f64,
    pub blockers: Vec<Blocker>,
    pub total_penalty: f64,
    /// This horizon's share of its tier budget.
    pub tier_weight: f64,
    pub effective_weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSummary {
    pub tier: Tier,
    pub votes: usize,
    pub buy_weight: f64,
    pub sell_weight: f64,
    pub hold_weight: f64,
}

impl TierSummary {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            votes: 0,
            buy_weight: 0.0,
            sell_weight: 0.0,
            hold_weight: 0.0,
        }
    }

    pub fn net(&self) -> f64 {
        self.buy_weight - self.sell_weight
    }

    pub fn direction(&self) -> Direction {
        dominant(self.buy_weight, self.sell_weight, self.hold_weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub direction: Direction,
    /// Dominant weight over total weight, in [0, 1].
    pub score: f64,
    pub dispersion: f64,
    pub multiplier: f64,
    pub net_contribution: f64,
    pub buy_weight: f64,
    pub sell_weight: f64,
    pub hold_weight: f64,
    pub total_weight: f64,
    pub votes: Vec<HorizonVote>,
    pub tiers: Vec<TierSummary>,
}

impl ConsensusResult {
    pub fn tier(&self, tier: Tier) -> Option<&TierSummary> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    pub fn average_confidence(&self) -> f64 {
        if self.votes.is_empty() {
            return 0.0;
        }
        self.votes.iter().map(|v| v.confidence).sum::<f64>() / self.votes.len() as f64
    }
}

fn dominant(buy: f64, sell: f64, hold: f64) -> Direction {
    if buy > sell && buy > hold {
        Direction::Buy
    } else if sell > buy && sell > hold {
        Direction::Sell
    } else {
        Direction::Hold
    }
}

/// Map a consensus score onto `[min_multiplier, max_multiplier]` with a smoothstep ramp.
pub fn smoothstep_multiplier(score: f64, cfg: &ConsensusConfig) -> f64 {
    if score <= cfg.band_lo {
        return cfg.min_multiplier;
    }
    if score >= cfg.band_hi {
        return cfg.max_multiplier;
    }
    let t = (score - cfg.band_lo) / (cfg.band_hi - cfg.band_lo);
    let s = t * t * (3.0 - 2.0 * t);
    cfg.min_multiplier + (cfg.max_multiplier - cfg.min_multiplier) * s
}

pub fn resolve_consensus(inputs: &[VoteInput], cfg: &ConsensusConfig) -> ConsensusResult {
    let mut tier_counts = [0usize; 3];
    for v in inputs {
        tier_counts[v.tier as usize] += 1;
    }

    let votes: Vec<HorizonVote> = inputs
        .iter()
        .map(|v| {
            let count = tier_counts[v.tier as usize].max(1) as f64;
            let tier_weight = cfg.tier_weight(v.tier) / count;
            let total_penalty = cfg.penalties.total(&v.blockers);
            let confidence = v.confidence.clamp(0.0, 1.0);
            let modifier = v.reliability_modifier.clamp(0.0, 1.0);
            let effective_weight = (tier_weight * confidence * modifier * (1.0 - total_penalty)).max(0.0);
            HorizonVote {
                horizon_days: v.horizon_days,
                tier: v.tier,
                direction: v.direction,
                confidence,
                reliability_modifier: modifier,
                blockers: v.blockers.clone(),
                total_penalty,
                tier_weight,
                effective_weight,
                contribution: effective_weight * v.direction.sign(),
            }
        })
        .collect();

    let mut tiers: Vec<TierSummary> = Tier::ALL.iter().map(|t| TierSummary::new(*t)).collect();
    let (mut buy, mut sell, mut hold) = (0.0, 0.0, 0.0);
    for v in &votes {
        let summary = &mut tiers[v.tier as usize];
        summary.votes += 1;
        match v.direction {
            Direction::Buy => {
                buy += v.effective_weight;
                summary.buy_weight += v.effective_weight;
            }
            Direction::Sell => {
                sell += v.effective_weight;
                summary.sell_weight += v.effective_weight;
            }
            Direction::Hold => {
                hold += v.effective_weight;
                summary.hold_weight += v.effective_weight;
            }
        }
    }

    let total = buy + sell + hold;
    let (direction, score) = if total <= f64::EPSILON {
        (Direction::Hold, 0.0)
    } else {
        let direction = dominant(buy, sell, hold);
        let top = match direction {
            Direction::Buy => buy,
            Direction::Sell => sell,
            Direction::Hold => buy.max(sell).max(hold),
        };
        (direction, (top / total).clamp(0.0, 1.0))
    };

    ConsensusResult {
        direction,
        score,
        dispersion: if total <= f64::EPSILON { 1.0 } else { 1.0 - score },
        multiplier: smoothstep_multiplier(score, cfg),
        net_contribution: votes.iter().map(|v| v.contribution).sum(),
        buy_weight: buy,
        sell_weight: sell,
        hold_weight: hold,
        total_weight: total,
        votes,
        tiers,
    }
}
