use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::CalibrationParams;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalibrationKey {
    pub model_id: String,
    pub preset: String,
    pub horizon_days: u32,
}

impl CalibrationKey {
    pub fn new(model_id: &str, preset: &str, horizon_days: u32) -> Self {
        Self {
            model_id: model_id.trim().to_ascii_lowercase(),
            preset: preset.trim().to_ascii_lowercase(),
            horizon_days,
        }
    }
}

/// Beta-Binomial bucket over the evidence axis, `[lo, hi)` (the last bucket includes 1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
    pub index: usize,
    pub lo: f64,
    pub hi: f64,
    pub n: u64,
    pub k: u64,
}

impl CalibrationBucket {
    pub fn posterior_mean(&self, prior_a: f64, prior_b: f64) -> f64 {
        (self.k as f64 + prior_a) / (self.n as f64 + prior_a + prior_b).max(1e-9)
    }

    /// ~95% credible interval from the normal approximation of the Beta posterior.
    pub fn credible_interval(&self, prior_a: f64, prior_b: f64) -> (f64, f64) {
        let a = self.k as f64 + prior_a;
        let b = (self.n - self.k.min(self.n)) as f64 + prior_b;
        let s = (a + b).max(1e-9);
        let mean = a / s;
        let var = a * b / (s * s * (s + 1.0));
        let half = 1.96 * var.max(0.0).sqrt();
        ((mean - half).max(0.0), (mean + half).min(1.0))
    }
}

pub fn bucket_index(score: f64, bucket_count: usize) -> usize {
    let count = bucket_count.max(1);
    let s = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
    ((s * count as f64).floor() as usize).min(count - 1)
}

pub fn bucket_bounds(index: usize, bucket_count: usize) -> (f64, f64) {
    let count = bucket_count.max(1) as f64;
    let lo = index as f64 / count;
    let hi = if index + 1 >= bucket_count {
        1.0
    } else {
        (index + 1) as f64 / count
    };
    (lo, hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedEvidence {
    pub raw: f64,
    pub bucket_index: usize,
    pub bucket_n: u64,
    pub posterior: f64,
    /// Share given to the bucket posterior, `n / (n + blend_k)`.
    pub weight: f64,
    pub calibrated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub key: CalibrationKey,
    pub buckets: Vec<CalibrationBucket>,
}

impl CalibrationTable {
    /// Conservative baseline: every bucket empty, so calibration defers to raw evidence.
    pub fn baseline(key: CalibrationKey, bucket_count: usize) -> Self {
        let count = bucket_count.max(1);
        let buckets = (0..count)
            .map(|i| {
                let (lo, hi) = bucket_bounds(i, count);
                CalibrationBucket {
                    index: i,
                    lo,
                    hi,
                    n: 0,
                    k: 0,
                }
            })
            .collect();
        Self { key, buckets }
    }

    pub fn bucket_for(&self, score: f64) -> &CalibrationBucket {
        &self.buckets[bucket_index(score, self.buckets.len())]
    }

    pub fn record(&mut self, score: f64, hit: bool) {
        let idx = bucket_index(score, self.buckets.len());
        let b = &mut self.buckets[idx];
        b.n = b.n.saturating_add(1);
        if hit {
            b.k = b.k.saturating_add(1);
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.buckets.iter().map(|b| b.n).sum()
    }

    /// Buckets start at 0, end at 1, and each `hi` equals the next `lo`.
    pub fn is_partition(&self) -> bool {
        let Some(first) = self.buckets.first() else {
            return false;
        };
        let Some(last) = self.buckets.last() else {
            return false;
        };
        first.lo == 0.0
            && last.hi == 1.0
            && self
                .buckets
                .windows(2)
                .all(|w| (w[0].hi - w[1].lo).abs() < 1e-12 && w[0].lo < w[0].hi)
    }

    pub fn calibrate(&self, raw: f64, p: &CalibrationParams) -> CalibratedEvidence {
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.0 };
        let bucket = self.bucket_for(raw);
        let posterior = bucket.posterior_mean(p.prior_a, p.prior_b);
        let n = bucket.n as f64;
        let weight = n / (n + p.blend_k.max(1e-9));
        CalibratedEvidence {
            raw,
            bucket_index: bucket.index,
            bucket_n: bucket.n,
            posterior,
            weight,
            calibrated: (weight * posterior + (1.0 - weight) * raw).clamp(0.0, 1.0),
        }
    }
}

/// Persisted calibration tables keyed by (model, preset, horizon).
pub trait CalibrationStore: Send + Sync {
    /// Load the table, creating and persisting the baseline when it does not exist yet.
    fn load_or_init(&self, key: &CalibrationKey, bucket_count: usize) -> Result<CalibrationTable>;

    /// Atomically add one observation to the bucket containing `score`.
    fn increment(
        &self,
        key: &CalibrationKey,
        bucket_count: usize,
        score: f64,
        hit: bool,
    ) -> Result<()>;
}
