pub mod calibration;
pub mod evidence;
pub mod floor;
pub mod reliability;

use serde::{Deserialize, Serialize};

use crate::analog::forward::ForwardStats;
use crate::config::EngineConfig;

pub use calibration::{
    CalibratedEvidence, CalibrationBucket, CalibrationKey, CalibrationStore, CalibrationTable,
};
pub use evidence::{evidence_score, EvidenceScore};
pub use floor::confidence_floor;
pub use reliability::{
    assess_reliability, ReliabilityBadge, ReliabilityParams, ReliabilitySnapshot,
    ReliabilityStore, ResolvedSample,
};

/// Every layer of the confidence computation for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub evidence: EvidenceScore,
    pub calibration: CalibratedEvidence,
    pub reliability_badge: ReliabilityBadge,
    pub reliability_modifier: f64,
    pub floor_cap: f64,
    /// `min(calibrated * modifier, floor_cap)`, clamped to [0, 1].
    pub final_confidence: f64,
}

impl ConfidenceBreakdown {
    pub fn raw_evidence(&self) -> f64 {
        self.evidence.score
    }

    /// Calibrated evidence under the floor cap, before reliability suppression. Consensus
    /// applies the reliability modifier itself.
    pub fn vote_confidence(&self) -> f64 {
        self.calibration.calibrated.min(self.floor_cap).clamp(0.0, 1.0)
    }

    pub fn capped_by_floor(&self) -> bool {
        self.calibration.calibrated * self.reliability_modifier > self.floor_cap
    }
}

pub fn final_confidence(calibrated: f64, modifier: f64, effective_n: f64) -> (f64, f64) {
    let cap = confidence_floor(effective_n);
    let suppressed = calibrated * modifier.clamp(0.0, 1.0);
    (suppressed.min(cap).clamp(0.0, 1.0), cap)
}

/// Evidence, calibration, reliability and floor for one set of forward stats.
pub fn assess_confidence(
    stats: &ForwardStats,
    table: &CalibrationTable,
    reliability: &ReliabilitySnapshot,
    cfg: &EngineConfig,
) -> ConfidenceBreakdown {
    let evidence = evidence_score(stats, &cfg.evidence);
    let calibration = table.calibrate(evidence.score, &cfg.calibration);
    let (final_confidence, floor_cap) =
        final_confidence(calibration.calibrated, reliability.modifier, stats.effective_n);
    ConfidenceBreakdown {
        evidence,
        calibration,
        reliability_badge: reliability.badge,
        reliability_modifier: reliability.modifier.min(1.0),
        floor_cap,
        final_confidence,
    }
}
