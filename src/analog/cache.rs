use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::model::Candle;

#[derive(Debug, Clone)]
struct CachedSeries {
    fetched_at_ms: u64,
    candles: Arc<Vec<Candle>>,
}

/// Engine-owned price-series cache with a fixed TTL.
///
/// Entries are never invalidated on new data; a series may be up to `ttl_ms` stale.
#[derive(Debug)]
pub struct HistoryCache {
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CachedSeries>>,
}

pub fn series_key(symbol: &str, timeframe: &str) -> String {
    format!(
        "{}::{}",
        symbol.trim().to_ascii_uppercase(),
        timeframe.trim()
    )
}

impl HistoryCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn get(&self, key: &str, now_ms: u64) -> Option<Arc<Vec<Candle>>> {
        let guard = self.entries.lock().ok()?;
        let entry = guard.get(key)?;
        (now_ms.saturating_sub(entry.fetched_at_ms) < self.ttl_ms).then(|| entry.candles.clone())
    }

    pub fn insert(&self, key: &str, candles: Arc<Vec<Candle>>, now_ms: u64) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.insert(
                key.to_string(),
                CachedSeries {
                    fetched_at_ms: now_ms,
                    candles,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let cache = HistoryCache::new(1_000);
        let key = series_key("btcusdt", "1d");
        assert_eq!(key, "BTCUSDT::1d");
        cache.insert(&key, Arc::new(vec![Candle::from_close(0, 1.0)]), 10_000);
        assert!(cache.get(&key, 10_999).is_some());
        assert!(cache.get(&key, 11_000).is_none());
        cache.insert(&key, Arc::new(vec![Candle::from_close(0, 2.0)]), 11_000);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key, 11_500).unwrap()[0].close, 2.0);
    }
}
