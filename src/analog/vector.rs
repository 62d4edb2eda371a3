use crate::config::Representation;

/// Numeric representation of one window of closes.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowVector {
    pub representation: Representation,
    pub values: Vec<f64>,
}

impl WindowVector {
    pub fn from_closes(closes: &[f64], representation: Representation) -> Self {
        let values = match representation {
            Representation::RawReturns => simple_returns(closes),
            Representation::ZScore => zscore(closes),
            Representation::Blended => {
                let mut v: Vec<f64> = zscore(&simple_returns(closes))
                    .into_iter()
                    .map(|x| 0.5 * x)
                    .collect();
                v.extend(zscore(closes).into_iter().map(|x| 0.5 * x));
                v
            }
        };
        Self {
            representation,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn cosine(&self, other: &WindowVector) -> f64 {
        cosine_similarity(&self.values, &other.values)
    }
}

pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .map(|w| {
            if w[0].abs() <= f64::EPSILON {
                0.0
            } else {
                w[1] / w[0] - 1.0
            }
        })
        .collect()
}

/// Standardize by mean/std; a constant input maps to zeros.
pub fn zscore(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = var.sqrt();
    if std <= 1e-12 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - mean) / std).collect()
}

/// Cosine similarity clamped to [-1, 1]. Zero-norm or mismatched inputs give 0.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if !denom.is_finite() || denom <= 1e-18 {
        return 0.0;
    }
    let sim = dot / denom;
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
