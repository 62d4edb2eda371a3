use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusConfig;
use crate::error::EngineError;
use crate::sizing::{ConflictThresholds, PresetPolicy, PresetTable};

pub const SUPPORTED_WINDOW_LENS: [usize; 3] = [30, 60, 90];

/// On-disk configuration (`config/default.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub presets: PresetSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSection {
    pub model_id: Option<String>,
    pub timeframe: Option<String>,
    pub window_len: Option<usize>,
    pub representation: Option<Representation>,
    pub floor_mode: Option<String>,
    pub min_similarity: Option<f64>,
    pub floor_quantile: Option<f64>,
    pub top_k: Option<usize>,
    pub min_gap_days: Option<u32>,
    pub age_decay_per_year: Option<f64>,
    pub regime_conditioning: Option<bool>,
    pub regime_min_candidates: Option<usize>,
    pub max_matches_per_year: Option<usize>,
    pub horizons: Option<Vec<u32>>,
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresetSection {
    pub conservative: Option<PresetPolicy>,
    pub balanced: Option<PresetPolicy>,
    pub aggressive: Option<PresetPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/analog_quant.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var("AQ_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/default.toml"))
}

impl Config {
    /// Load `.env`, then the TOML file (missing file means all defaults).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::load_from_path(&config_path())?;
        if let Ok(db) = std::env::var("AQ_DB_PATH") {
            if !db.trim().is_empty() {
                config.storage.db_path = PathBuf::from(db.trim());
            }
        }
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::parse("");
        }
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&config_str).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("invalid config toml")?;
        config.engine_config().context("engine section is invalid")?;
        Ok(config)
    }

    /// Resolve the file sections into one validated, immutable engine config.
    pub fn engine_config(&self) -> Result<EngineConfig, EngineError> {
        let e = &self.engine;
        let mut b = EngineConfig::builder();
        if let Some(v) = &e.model_id {
            b = b.model_id(v);
        }
        if let Some(v) = &e.timeframe {
            let ms = parse_interval_ms(v).map_err(|err| EngineError::InvalidConfig(format!("{err:#}")))?;
            b = b.timeframe(v, ms);
        }
        if let Some(v) = e.window_len {
            b = b.window_len(v);
        }
        if let Some(v) = e.representation {
            b = b.representation(v);
        }
        match e.floor_mode.as_deref().map(str::trim) {
            None | Some("fixed") => {
                if let Some(v) = e.min_similarity {
                    b = b.floor(SimilarityFloor::Fixed { min_similarity: v });
                }
            }
            Some("quantile") => {
                b = b.floor(SimilarityFloor::Quantile {
                    q: e.floor_quantile.unwrap_or(0.6),
                    floor_min: e.min_similarity.unwrap_or(0.0),
                });
            }
            Some(other) => {
                return Err(EngineError::InvalidConfig(format!(
                    "unsupported floor_mode '{}', expected fixed/quantile",
                    other
                )))
            }
        }
        if let Some(v) = e.top_k {
            b = b.top_k(v);
        }
        if let Some(v) = e.min_gap_days {
            b = b.min_gap_days(v);
        }
        if let Some(v) = e.age_decay_per_year {
            b = b.age_decay(if v > 0.0 { Some(v) } else { None });
        }
        if let Some(v) = e.regime_conditioning {
            b = b.regime_conditioning(v);
        }
        if let Some(v) = e.regime_min_candidates {
            b = b.regime_min_candidates(v);
        }
        if let Some(v) = e.max_matches_per_year {
            b = b.max_matches_per_year(if v > 0 { Some(v) } else { None });
        }
        if let Some(v) = &e.horizons {
            b = b.horizons(v.clone());
        }
        if let Some(v) = e.cache_ttl_secs {
            b = b.cache_ttl_ms(v.saturating_mul(1_000));
        }
        let mut presets = PresetTable::default();
        if let Some(p) = &self.presets.conservative {
            presets.conservative = p.clone();
        }
        if let Some(p) = &self.presets.balanced {
            presets.balanced = p.clone();
        }
        if let Some(p) = &self.presets.aggressive {
            presets.aggressive = p.clone();
        }
        b.presets(presets).build()
    }
}

/// Parse an interval string (e.g. "1h", "1d", "1w") into milliseconds.
pub fn parse_interval_ms(s: &str) -> Result<u64> {
    if s.len() < 2 {
        bail!("invalid interval '{}': expected format like '1d'", s);
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid interval '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid interval '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => bail!(
            "invalid interval '{}': unsupported suffix '{}', expected one of m/h/d/w",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .with_context(|| format!("invalid interval '{}': value is too large", s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Bar-to-bar simple returns.
    RawReturns,
    /// Closes standardized by the window mean and std.
    ZScore,
    /// Standardized returns followed by standardized closes.
    Blended,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SimilarityFloor {
    Fixed { min_similarity: f64 },
    /// Quantile of the observed candidate similarities, never below `floor_min`.
    Quantile { q: f64, floor_min: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub window_len: usize,
    pub representation: Representation,
    pub floor: SimilarityFloor,
    pub top_k: usize,
    pub min_gap_days: u32,
    /// Exponential decay rate per elapsed year; `None` disables age decay.
    pub age_decay_per_year: Option<f64>,
    pub regime_conditioning: bool,
    pub regime_min_candidates: usize,
    /// Calendar-year cap; `None` disables temporal dispersion.
    pub max_matches_per_year: Option<usize>,
    pub history_buffer: usize,
    pub candidate_stride: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            window_len: 60,
            representation: Representation::Blended,
            floor: SimilarityFloor::Fixed {
                min_similarity: 0.30,
            },
            top_k: 20,
            min_gap_days: 60,
            age_decay_per_year: Some(0.15),
            regime_conditioning: true,
            regime_min_candidates: 20,
            max_matches_per_year: Some(3),
            history_buffer: 30,
            candidate_stride: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceParams {
    pub w_sample: f64,
    pub w_dispersion: f64,
    pub w_agreement: f64,
    pub temperature: f64,
    pub n_scale: f64,
    pub dispersion_scale: f64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            w_sample: 0.45,
            w_dispersion: 0.35,
            w_agreement: 0.20,
            temperature: 0.15,
            n_scale: 10.0,
            dispersion_scale: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub buckets: usize,
    pub prior_a: f64,
    pub prior_b: f64,
    pub blend_k: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            buckets: 10,
            prior_a: 2.0,
            prior_b: 2.0,
            blend_k: 30.0,
        }
    }
}

/// Per-vote blocker thresholds applied before consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteThresholds {
    pub low_confidence: f64,
    pub high_entropy: f64,
    pub high_tail_risk: f64,
    /// Drawdown magnitude that maps to a tail-risk score of 1.0.
    pub tail_drawdown_scale: f64,
}

impl Default for VoteThresholds {
    fn default() -> Self {
        Self {
            low_confidence: 0.35,
            high_entropy: 0.90,
            high_tail_risk: 0.60,
            tail_drawdown_scale: 0.25,
        }
    }
}

/// Validated engine settings, produced by `EngineConfigBuilder::build` or `Default`. Fields are
/// read through accessors so a built config cannot be changed afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub(crate) model_id: String,
    pub(crate) timeframe: String,
    pub(crate) timeframe_ms: u64,
    pub(crate) retrieval: RetrievalParams,
    pub(crate) evidence: EvidenceParams,
    pub(crate) calibration: CalibrationParams,
    pub(crate) votes: VoteThresholds,
    pub(crate) consensus: ConsensusConfig,
    pub(crate) conflict: ConflictThresholds,
    pub(crate) presets: PresetTable,
    pub(crate) horizons: Vec<u32>,
    /// UP/DOWN/FLAT band for realized and predicted returns.
    pub(crate) flat_band: f64,
    /// HOLD predictions count as hits within this band.
    pub(crate) hold_band: f64,
    pub(crate) cache_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: "analog-v1".to_string(),
            timeframe: "1d".to_string(),
            timeframe_ms: 86_400_000,
            retrieval: RetrievalParams::default(),
            evidence: EvidenceParams::default(),
            calibration: CalibrationParams::default(),
            votes: VoteThresholds::default(),
            consensus: ConsensusConfig::default(),
            conflict: ConflictThresholds::default(),
            presets: PresetTable::default(),
            horizons: vec![7, 14, 30, 90],
            flat_band: 0.0025,
            hold_band: 0.01,
            cache_ttl_ms: 3_600_000,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn timeframe_ms(&self) -> u64 {
        self.timeframe_ms
    }

    pub fn retrieval(&self) -> &RetrievalParams {
        &self.retrieval
    }

    pub fn evidence(&self) -> &EvidenceParams {
        &self.evidence
    }

    pub fn calibration(&self) -> &CalibrationParams {
        &self.calibration
    }

    pub fn votes(&self) -> &VoteThresholds {
        &self.votes
    }

    pub fn consensus(&self) -> &ConsensusConfig {
        &self.consensus
    }

    pub fn conflict(&self) -> &ConflictThresholds {
        &self.conflict
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    pub fn horizons(&self) -> &[u32] {
        &self.horizons
    }

    pub fn flat_band(&self) -> f64 {
        self.flat_band
    }

    pub fn hold_band(&self) -> f64 {
        self.hold_band
    }

    pub fn cache_ttl_ms(&self) -> u64 {
        self.cache_ttl_ms
    }

    /// Builder seeded from this config, for deriving variants (shadow models, sweeps).
    pub fn to_builder(&self) -> EngineConfigBuilder {
        EngineConfigBuilder { cfg: self.clone() }
    }

    /// Number of bars spanning `horizon_days` at this config's timeframe.
    pub fn horizon_bars(&self, horizon_days: u32) -> usize {
        let span = horizon_days as u64 * 86_400_000;
        let tf = self.timeframe_ms.max(1);
        (span.div_ceil(tf)).max(1) as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    cfg: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn model_id(mut self, v: impl Into<String>) -> Self {
        self.cfg.model_id = v.into();
        self
    }

    pub fn timeframe(mut self, label: impl Into<String>, ms: u64) -> Self {
        self.cfg.timeframe = label.into();
        self.cfg.timeframe_ms = ms;
        self
    }

    pub fn window_len(mut self, v: usize) -> Self {
        self.cfg.retrieval.window_len = v;
        self
    }

    pub fn representation(mut self, v: Representation) -> Self {
        self.cfg.retrieval.representation = v;
        self
    }

    pub fn floor(mut self, v: SimilarityFloor) -> Self {
        self.cfg.retrieval.floor = v;
        self
    }

    pub fn min_similarity(self, v: f64) -> Self {
        self.floor(SimilarityFloor::Fixed { min_similarity: v })
    }

    pub fn top_k(mut self, v: usize) -> Self {
        self.cfg.retrieval.top_k = v;
        self
    }

    pub fn min_gap_days(mut self, v: u32) -> Self {
        self.cfg.retrieval.min_gap_days = v;
        self
    }

    pub fn age_decay(mut self, v: Option<f64>) -> Self {
        self.cfg.retrieval.age_decay_per_year = v;
        self
    }

    pub fn regime_conditioning(mut self, v: bool) -> Self {
        self.cfg.retrieval.regime_conditioning = v;
        self
    }

    pub fn regime_min_candidates(mut self, v: usize) -> Self {
        self.cfg.retrieval.regime_min_candidates = v;
        self
    }

    pub fn max_matches_per_year(mut self, v: Option<usize>) -> Self {
        self.cfg.retrieval.max_matches_per_year = v;
        self
    }

    pub fn history_buffer(mut self, v: usize) -> Self {
        self.cfg.retrieval.history_buffer = v;
        self
    }

    pub fn candidate_stride(mut self, v: usize) -> Self {
        self.cfg.retrieval.candidate_stride = v;
        self
    }

    pub fn horizons(mut self, v: Vec<u32>) -> Self {
        self.cfg.horizons = v;
        self
    }

    pub fn evidence(mut self, v: EvidenceParams) -> Self {
        self.cfg.evidence = v;
        self
    }

    pub fn calibration(mut self, v: CalibrationParams) -> Self {
        self.cfg.calibration = v;
        self
    }

    pub fn votes(mut self, v: VoteThresholds) -> Self {
        self.cfg.votes = v;
        self
    }

    pub fn consensus(mut self, v: ConsensusConfig) -> Self {
        self.cfg.consensus = v;
        self
    }

    pub fn conflict(mut self, v: ConflictThresholds) -> Self {
        self.cfg.conflict = v;
        self
    }

    pub fn presets(mut self, v: PresetTable) -> Self {
        self.cfg.presets = v;
        self
    }

    pub fn cache_ttl_ms(mut self, v: u64) -> Self {
        self.cfg.cache_ttl_ms = v;
        self
    }

    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let cfg = self.cfg;
        let r = &cfg.retrieval;
        if !SUPPORTED_WINDOW_LENS.contains(&r.window_len) {
            return Err(EngineError::InvalidWindowSize(r.window_len));
        }
        if r.top_k == 0 {
            return Err(EngineError::InvalidConfig("top_k must be > 0".to_string()));
        }
        if r.candidate_stride == 0 {
            return Err(EngineError::InvalidConfig(
                "candidate_stride must be > 0".to_string(),
            ));
        }
        match r.floor {
            // Age decay only ranks correctly for non-negative similarities.
            SimilarityFloor::Fixed { min_similarity } if !(0.0..=1.0).contains(&min_similarity) => {
                return Err(EngineError::InvalidConfig(format!(
                    "min_similarity {} outside [0, 1]",
                    min_similarity
                )));
            }
            SimilarityFloor::Quantile { q, .. } if !(0.0..=1.0).contains(&q) => {
                return Err(EngineError::InvalidConfig(format!(
                    "floor quantile {} outside [0, 1]",
                    q
                )));
            }
            SimilarityFloor::Quantile { floor_min, .. } if !(0.0..=1.0).contains(&floor_min) => {
                return Err(EngineError::InvalidConfig(format!(
                    "floor_min {} outside [0, 1]",
                    floor_min
                )));
            }
            _ => {}
        }
        if let Some(rate) = r.age_decay_per_year {
            if !rate.is_finite() || rate < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "age_decay_per_year {} must be finite and >= 0",
                    rate
                )));
            }
        }
        if cfg.horizons.is_empty() || cfg.horizons.contains(&0) {
            return Err(EngineError::InvalidConfig(
                "horizons must be non-empty and > 0".to_string(),
            ));
        }
        if cfg.calibration.buckets == 0 {
            return Err(EngineError::InvalidConfig(
                "calibration.buckets must be > 0".to_string(),
            ));
        }
        if cfg.timeframe_ms == 0 {
            return Err(EngineError::InvalidConfig("timeframe must be > 0".to_string()));
        }
        if cfg.evidence.temperature <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "evidence.temperature must be > 0".to_string(),
            ));
        }
        cfg.consensus
            .validate()
            .map_err(EngineError::InvalidConfig)?;
        Ok(cfg)
    }
}
