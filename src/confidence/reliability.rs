use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReliabilityBadge {
    Ok,
    Warn,
    Degraded,
    Critical,
}

impl ReliabilityBadge {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            Self::Ok
        } else if score >= 0.55 {
            Self::Warn
        } else if score >= 0.35 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    /// Confidence multiplier; never above 1.
    pub fn modifier(self) -> f64 {
        match self {
            Self::Ok => 1.0,
            Self::Warn => 0.85,
            Self::Degraded => 0.60,
            Self::Critical => 0.30,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Degraded => "DEGRADED",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "WARN" => Some(Self::Warn),
            "DEGRADED" => Some(Self::Degraded),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded | Self::Critical)
    }
}

/// Health components, each in [0, 1] where 1 is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityComponents {
    pub drift: f64,
    pub calibration: f64,
    pub rolling_performance: f64,
    pub tail_risk: f64,
}

impl ReliabilityComponents {
    pub fn composite(&self) -> f64 {
        ((self.drift + self.calibration + self.rolling_performance + self.tail_risk) / 4.0)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilitySnapshot {
    pub model_id: String,
    pub computed_at_ms: u64,
    pub badge: ReliabilityBadge,
    pub components: ReliabilityComponents,
    pub score: f64,
    pub modifier: f64,
    pub sample_count: usize,
}

impl ReliabilitySnapshot {
    pub fn from_components(
        model_id: &str,
        components: ReliabilityComponents,
        sample_count: usize,
        now_ms: u64,
    ) -> Self {
        let score = components.composite();
        let badge = ReliabilityBadge::from_score(score);
        Self {
            model_id: model_id.to_string(),
            computed_at_ms: now_ms,
            badge,
            components,
            score,
            modifier: badge.modifier().min(1.0),
            sample_count,
        }
    }

    /// Starting point before any outcome has resolved: WARN-level suppression.
    pub fn baseline(model_id: &str, now_ms: u64) -> Self {
        Self::from_components(
            model_id,
            ReliabilityComponents {
                drift: 0.65,
                calibration: 0.65,
                rolling_performance: 0.65,
                tail_risk: 0.65,
            },
            0,
            now_ms,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilityParams {
    pub min_samples: usize,
    pub rolling_window: usize,
    pub ece_bins: usize,
    pub ece_cap: f64,
    pub drift_cap: f64,
    pub tail_loss: f64,
    pub tail_freq_cap: f64,
    pub perf_lo: f64,
    pub perf_hi: f64,
}

impl Default for ReliabilityParams {
    fn default() -> Self {
        Self {
            min_samples: 20,
            rolling_window: 50,
            ece_bins: 10,
            ece_cap: 0.25,
            drift_cap: 0.20,
            tail_loss: 0.05,
            tail_freq_cap: 0.20,
            perf_lo: 0.40,
            perf_hi: 0.60,
        }
    }
}

/// One resolved prediction, oldest first when passed as a slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedSample {
    pub confidence: f64,
    pub hit: bool,
    pub direction: Direction,
    pub realized_return: f64,
}

fn hit_rate(samples: &[ResolvedSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().filter(|s| s.hit).count() as f64 / samples.len() as f64
}

pub fn expected_calibration_error(samples: &[ResolvedSample], bins: usize) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let bins = bins.max(1);
    let mut conf_sum = vec![0.0; bins];
    let mut hits = vec![0.0; bins];
    let mut counts = vec![0usize; bins];
    for s in samples {
        let c = s.confidence.clamp(0.0, 1.0);
        let idx = ((c * bins as f64).floor() as usize).min(bins - 1);
        conf_sum[idx] += c;
        hits[idx] += if s.hit { 1.0 } else { 0.0 };
        counts[idx] += 1;
    }
    let total = samples.len() as f64;
    (0..bins)
        .filter(|i| counts[*i] > 0)
        .map(|i| {
            let n = counts[i] as f64;
            (hits[i] / n - conf_sum[i] / n).abs() * n / total
        })
        .sum()
}

fn rescale(v: f64, lo: f64, hi: f64) -> f64 {
    if hi <= lo {
        return 0.0;
    }
    ((v - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Score model health from resolved predictions (oldest first).
///
/// Returns the baseline when fewer than `min_samples` outcomes exist. A walk-forward hit rate,
/// when supplied, is averaged into the rolling-performance component.
pub fn assess_reliability(
    model_id: &str,
    samples: &[ResolvedSample],
    walk_forward_hit_rate: Option<f64>,
    p: &ReliabilityParams,
    now_ms: u64,
) -> ReliabilitySnapshot {
    if samples.len() < p.min_samples {
        return ReliabilitySnapshot::baseline(model_id, now_ms);
    }

    let mid = samples.len() / 2;
    let drift_gap = (hit_rate(&samples[..mid]) - hit_rate(&samples[mid..])).abs();
    let drift = 1.0 - (drift_gap / p.drift_cap.max(1e-9)).min(1.0);

    let ece = expected_calibration_error(samples, p.ece_bins);
    let calibration = 1.0 - (ece / p.ece_cap.max(1e-9)).min(1.0);

    let start = samples.len().saturating_sub(p.rolling_window.max(1));
    let rolling = rescale(hit_rate(&samples[start..]), p.perf_lo, p.perf_hi);
    let rolling_performance = match walk_forward_hit_rate {
        Some(wf) => 0.5 * rolling + 0.5 * rescale(wf, p.perf_lo, p.perf_hi),
        None => rolling,
    };

    let directional: Vec<&ResolvedSample> = samples
        .iter()
        .filter(|s| s.direction != Direction::Hold)
        .collect();
    let tail_risk = if directional.is_empty() {
        1.0
    } else {
        let adverse = directional
            .iter()
            .filter(|s| -s.direction.sign() * s.realized_return >= p.tail_loss)
            .count() as f64;
        let freq = adverse / directional.len() as f64;
        1.0 - (freq / p.tail_freq_cap.max(1e-9)).min(1.0)
    };

    ReliabilitySnapshot::from_components(
        model_id,
        ReliabilityComponents {
            drift,
            calibration,
            rolling_performance,
            tail_risk,
        },
        samples.len(),
        now_ms,
    )
}

pub trait ReliabilityStore: Send + Sync {
    fn latest_reliability(&self, model_id: &str) -> Result<Option<ReliabilitySnapshot>>;
    fn append_reliability(&self, snapshot: &ReliabilitySnapshot) -> Result<()>;
}
