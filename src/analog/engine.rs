use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analog::cache::{series_key, HistoryCache};
use crate::analog::forward::{aggregate_forward, ForwardStats};
use crate::analog::retrieval::{retrieve, HistoricalMatch, PatternInfo};
use crate::clock::Clock;
use crate::confidence::evidence::{evidence_score, EvidenceScore};
use crate::config::{EngineConfig, SUPPORTED_WINDOW_LENS};
use crate::error::EngineError;
use crate::model::candle::{normalize_series, truncate_before};
use crate::model::Candle;

/// Read-only provider of ordered candle series.
pub trait CandleSource: Send + Sync {
    fn load_candles(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;
}

/// Candles stored as JSON arrays on disk.
///
/// A file path serves that one series for every symbol; a directory is searched for
/// `{SYMBOL}_{timeframe}.json`.
#[derive(Debug, Clone)]
pub struct JsonFileCandleSource {
    root: PathBuf,
}

impl JsonFileCandleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, symbol: &str, timeframe: &str) -> PathBuf {
        if self.root.is_dir() {
            self.root.join(format!(
                "{}_{}.json",
                symbol.trim().to_ascii_uppercase(),
                timeframe.trim()
            ))
        } else {
            self.root.clone()
        }
    }
}

pub fn parse_candles_json(raw: &str) -> Result<Vec<Candle>> {
    let candles: Vec<Candle> = serde_json::from_str(raw).context("invalid candle json")?;
    Ok(normalize_series(candles))
}

async fn read_candle_file(path: &Path) -> Result<Vec<Candle>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_candles_json(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

impl CandleSource for JsonFileCandleSource {
    async fn load_candles(&self, symbol: &str, timeframe: &str) -> Result<Vec<Candle>> {
        read_candle_file(&self.path_for(symbol, timeframe)).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub symbol: String,
    pub timeframe: String,
    pub horizon_days: u32,
    /// Exclusive cutoff; nothing at or after it is visible to the match.
    pub as_of_ms: Option<u64>,
}

impl MatchRequest {
    pub fn new(symbol: &str, timeframe: &str, horizon_days: u32) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_uppercase(),
            timeframe: timeframe.trim().to_string(),
            horizon_days,
            as_of_ms: None,
        }
    }

    pub fn as_of(mut self, as_of_ms: Option<u64>) -> Self {
        self.as_of_ms = as_of_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFlags {
    pub context_only: bool,
    pub training_eligible: bool,
}

impl Default for SafetyFlags {
    fn default() -> Self {
        Self {
            context_only: true,
            training_eligible: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub ok: bool,
    pub symbol: String,
    pub timeframe: String,
    pub horizon_days: u32,
    pub as_of_ms: Option<u64>,
    pub pattern: Option<PatternInfo>,
    pub matches: Vec<HistoricalMatch>,
    pub forward_stats: ForwardStats,
    pub evidence: EvidenceScore,
    /// Raw evidence score; calibration happens downstream.
    pub confidence: f64,
    pub stability: f64,
    /// Mean candle quality over the current window.
    pub data_quality: f64,
    pub safety: SafetyFlags,
    pub insufficient_history: bool,
    pub regime_fallback: bool,
    pub similarity_floor: f64,
    pub candidates_scanned: usize,
}

impl MatchResponse {
    fn empty(req: &MatchRequest) -> Self {
        Self {
            ok: true,
            symbol: req.symbol.clone(),
            timeframe: req.timeframe.clone(),
            horizon_days: req.horizon_days,
            as_of_ms: req.as_of_ms,
            pattern: None,
            matches: Vec::new(),
            forward_stats: ForwardStats::empty(req.horizon_days),
            evidence: EvidenceScore::default(),
            confidence: 0.0,
            stability: 0.0,
            data_quality: 0.0,
            safety: SafetyFlags::default(),
            insufficient_history: true,
            regime_fallback: false,
            similarity_floor: 0.0,
            candidates_scanned: 0,
        }
    }
}

/// Run retrieval and aggregation over an in-memory series.
pub fn match_series(
    candles: &[Candle],
    req: &MatchRequest,
    cfg: &EngineConfig,
) -> Result<MatchResponse, EngineError> {
    let w = cfg.retrieval.window_len;
    if !SUPPORTED_WINDOW_LENS.contains(&w) {
        return Err(EngineError::InvalidWindowSize(w));
    }
    let visible = truncate_before(candles, req.as_of_ms);
    let result = retrieve(visible, cfg, req.horizon_days)?;
    if result.insufficient_history {
        return Ok(MatchResponse::empty(req));
    }

    let forward_stats = aggregate_forward(&result.matches, req.horizon_days, cfg.retrieval.top_k);
    let evidence = evidence_score(&forward_stats, &cfg.evidence);
    let window = &visible[visible.len() - w..];
    let data_quality = window.iter().map(|c| c.quality.clamp(0.0, 1.0)).sum::<f64>() / w as f64;

    Ok(MatchResponse {
        ok: true,
        symbol: req.symbol.clone(),
        timeframe: req.timeframe.clone(),
        horizon_days: req.horizon_days,
        as_of_ms: req.as_of_ms,
        pattern: result.pattern,
        matches: result.matches,
        stability: forward_stats.stability_score,
        forward_stats,
        confidence: evidence.score,
        evidence,
        data_quality,
        safety: SafetyFlags::default(),
        insufficient_history: false,
        regime_fallback: result.regime_fallback,
        similarity_floor: result.similarity_floor,
        candidates_scanned: result.candidates_scanned,
    })
}

/// Analog engine bound to one candle source, one clock and its own history cache.
pub struct AnalogEngine<S> {
    source: S,
    clock: Arc<dyn Clock>,
    cache: HistoryCache,
}

impl<S: CandleSource> AnalogEngine<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>, cache_ttl_ms: u64) -> Self {
        Self {
            source,
            clock,
            cache: HistoryCache::new(cache_ttl_ms),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    /// Cached full history for `(symbol, timeframe)`; empty series is `DataNotFound`.
    pub async fn history(&self, symbol: &str, timeframe: &str) -> Result<Arc<Vec<Candle>>, EngineError> {
        let key = series_key(symbol, timeframe);
        if let Some(hit) = self.cache.get(&key, self.clock.now_ms()) {
            return Ok(hit);
        }
        let candles = normalize_series(self.source.load_candles(symbol, timeframe).await?);
        if candles.is_empty() {
            return Err(EngineError::DataNotFound {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
            });
        }
        tracing::debug!(symbol, timeframe, bars = candles.len(), "history loaded");
        let candles = Arc::new(candles);
        self.cache.insert(&key, candles.clone(), self.clock.now_ms());
        Ok(candles)
    }

    pub async fn match_pattern(
        &self,
        req: &MatchRequest,
        cfg: &EngineConfig,
    ) -> Result<MatchResponse, EngineError> {
        if !SUPPORTED_WINDOW_LENS.contains(&cfg.retrieval.window_len) {
            return Err(EngineError::InvalidWindowSize(cfg.retrieval.window_len));
        }
        let candles = self.history(&req.symbol, &req.timeframe).await?;
        match_series(&candles, req, cfg)
    }
}
