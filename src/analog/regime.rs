use serde::{Deserialize, Serialize};

use crate::analog::vector::simple_returns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Bull,
    Bear,
    Side,
    Crash,
    Bubble,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Bull => "BULL",
            Regime::Bear => "BEAR",
            Regime::Side => "SIDE",
            Regime::Crash => "CRASH",
            Regime::Bubble => "BUBBLE",
        }
    }

    /// Phase risk in [0, 1] fed into the sizing risk multiplier.
    pub fn phase_risk(self) -> f64 {
        match self {
            Regime::Bull => 0.10,
            Regime::Side => 0.20,
            Regime::Bear => 0.35,
            Regime::Bubble => 0.60,
            Regime::Crash => 0.80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeFeatures {
    /// Close-to-close return over the whole window.
    pub total_return: f64,
    /// Regression slope of closes, normalized by the window mean (per bar).
    pub slope: f64,
    /// Std of bar returns scaled to the window length.
    pub window_vol: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RegimeThresholds {
    pub trend: f64,
    pub crash: f64,
    pub bubble: f64,
    pub stress_vol: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            trend: 0.05,
            crash: -0.20,
            bubble: 0.35,
            stress_vol: 0.25,
        }
    }
}

pub fn regime_features(closes: &[f64]) -> RegimeFeatures {
    if closes.len() < 2 {
        return RegimeFeatures {
            total_return: 0.0,
            slope: 0.0,
            window_vol: 0.0,
        };
    }
    let first = closes[0];
    let last = closes[closes.len() - 1];
    let total_return = if first.abs() > f64::EPSILON {
        last / first - 1.0
    } else {
        0.0
    };

    let n = closes.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = closes.iter().sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, &y) in closes.iter().enumerate() {
        num += (i as f64 - x_mean) * (y - y_mean);
        den += (i as f64 - x_mean).powi(2);
    }
    let raw_slope = if den == 0.0 { 0.0 } else { num / den };
    let slope = if y_mean.abs() > f64::EPSILON {
        raw_slope / y_mean
    } else {
        0.0
    };

    let rets = simple_returns(closes);
    let m = rets.len() as f64;
    let mean = rets.iter().sum::<f64>() / m;
    let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / m;
    let window_vol = var.sqrt() * m.sqrt();

    RegimeFeatures {
        total_return,
        slope,
        window_vol,
    }
}

pub fn classify_features(f: &RegimeFeatures, t: &RegimeThresholds) -> Regime {
    let stressed = f.window_vol >= t.stress_vol;
    if f.total_return <= t.crash || (stressed && f.total_return <= t.crash / 2.0) {
        Regime::Crash
    } else if f.total_return >= t.bubble || (stressed && f.total_return >= t.bubble * 0.6) {
        Regime::Bubble
    } else if f.total_return > t.trend && f.slope > 0.0 {
        Regime::Bull
    } else if f.total_return < -t.trend && f.slope < 0.0 {
        Regime::Bear
    } else {
        Regime::Side
    }
}

pub fn classify_window(closes: &[f64]) -> Regime {
    classify_features(&regime_features(closes), &RegimeThresholds::default())
}
