use serde::{Deserialize, Serialize};

use crate::analog::forward::ForwardStats;
use crate::config::EvidenceParams;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EvidenceScore {
    pub sample: f64,
    pub dispersion: f64,
    pub agreement: f64,
    /// Weighted combination before the sigmoid.
    pub linear: f64,
    /// Final evidence score in [0, 1].
    pub score: f64,
}

pub fn saturate(n: f64, scale: f64) -> f64 {
    if n <= 0.0 || !n.is_finite() {
        return 0.0;
    }
    1.0 - (-n / scale.max(1e-9)).exp()
}

pub fn inverse_dispersion(d: f64, scale: f64) -> f64 {
    1.0 / (1.0 + d.max(0.0) / scale.max(1e-9))
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn evidence_score(stats: &ForwardStats, p: &EvidenceParams) -> EvidenceScore {
    if stats.sample_size == 0 {
        return EvidenceScore::default();
    }
    let sample = saturate(stats.effective_n, p.n_scale);
    let dispersion = inverse_dispersion(stats.dispersion(), p.dispersion_scale);
    let agreement = stats.agreement.clamp(0.0, 1.0);
    let w_total = (p.w_sample + p.w_dispersion + p.w_agreement).max(1e-9);
    let linear =
        (p.w_sample * sample + p.w_dispersion * dispersion + p.w_agreement * agreement) / w_total;
    let score = sigmoid((linear - 0.5) / p.temperature.max(1e-6)).clamp(0.0, 1.0);
    EvidenceScore {
        sample,
        dispersion,
        agreement,
        linear,
        score,
    }
}
