use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    /// Upstream data-quality score in [0, 1].
    #[serde(default = "default_quality")]
    pub quality: f64,
}

fn default_quality() -> f64 {
    1.0
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Flat candle at a single price, used for close-only series.
    pub fn from_close(open_time_ms: u64, close: f64) -> Self {
        Self {
            open_time_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            quality: 1.0,
        }
    }
}

/// Return the prefix of `candles` strictly before `as_of_ms`.
///
/// Candles are expected in ascending `open_time_ms` order.
pub fn truncate_before(candles: &[Candle], as_of_ms: Option<u64>) -> &[Candle] {
    match as_of_ms {
        Some(cutoff) => {
            let end = candles.partition_point(|c| c.open_time_ms < cutoff);
            &candles[..end]
        }
        None => candles,
    }
}

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Last close at or before `ts_ms`.
pub fn close_at_or_before(candles: &[Candle], ts_ms: u64) -> Option<f64> {
    let end = candles.partition_point(|c| c.open_time_ms <= ts_ms);
    end.checked_sub(1).map(|i| candles[i].close)
}

/// Sort ascending by time and drop duplicate timestamps (first wins) and non-positive closes.
pub fn normalize_series(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.retain(|c| c.close.is_finite() && c.close > 0.0);
    candles.sort_by_key(|c| c.open_time_ms);
    candles.dedup_by_key(|c| c.open_time_ms);
    candles
}
