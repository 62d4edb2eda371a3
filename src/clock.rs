use std::sync::atomic::{AtomicU64, Ordering};

pub const DAY_MS: u64 = 86_400_000;
pub const YEAR_MS: f64 = 365.25 * 86_400_000.0;

/// Source of "now" for cache expiry, snapshot issuance and outcome maturity.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    now_ms: AtomicU64,
}

impl FixedClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Parse `YYYY-MM-DD` (UTC midnight) into epoch milliseconds.
pub fn parse_date_ms(s: &str) -> Option<u64> {
    let date = chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
    let ms = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    (ms >= 0).then_some(ms as u64)
}

pub fn format_date(ts_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub fn calendar_year(ts_ms: u64) -> i32 {
    use chrono::Datelike;
    chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.year())
        .unwrap_or(1970)
}
