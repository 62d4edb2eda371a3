use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::Candle;
use crate::sweep::{walk_forward, WalkForwardOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelStatus {
    Shadow,
    Candidate,
    Promoted,
    Archived,
    Rejected,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shadow => "SHADOW",
            Self::Candidate => "CANDIDATE",
            Self::Promoted => "PROMOTED",
            Self::Archived => "ARCHIVED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SHADOW" => Some(Self::Shadow),
            "CANDIDATE" => Some(Self::Candidate),
            "PROMOTED" => Some(Self::Promoted),
            "ARCHIVED" => Some(Self::Archived),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Models still being compared against the active one.
    pub fn is_tracking(self) -> bool {
        matches!(self, Self::Shadow | Self::Candidate)
    }

    pub fn can_transition(self, to: ModelStatus) -> bool {
        matches!(
            (self, to),
            (Self::Shadow, Self::Candidate)
                | (Self::Shadow, Self::Rejected)
                | (Self::Candidate, Self::Promoted)
                | (Self::Candidate, Self::Rejected)
                | (Self::Candidate, Self::Archived)
                | (Self::Promoted, Self::Archived)
        )
    }
}

/// Retrieval parameters a research model changes relative to its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamOverrides {
    pub window_len: Option<usize>,
    pub min_similarity: Option<f64>,
    pub top_k: Option<usize>,
    pub age_decay_per_year: Option<f64>,
    pub regime_conditioning: Option<bool>,
    pub max_matches_per_year: Option<usize>,
}

impl ParamOverrides {
    pub fn apply(&self, base: &EngineConfig) -> Result<EngineConfig, EngineError> {
        let mut b = base.to_builder();
        if let Some(v) = self.window_len {
            b = b.window_len(v);
        }
        if let Some(v) = self.min_similarity {
            b = b.min_similarity(v);
        }
        if let Some(v) = self.top_k {
            b = b.top_k(v);
        }
        if let Some(v) = self.age_decay_per_year {
            b = b.age_decay(if v > 0.0 { Some(v) } else { None });
        }
        if let Some(v) = self.regime_conditioning {
            b = b.regime_conditioning(v);
        }
        if let Some(v) = self.max_matches_per_year {
            b = b.max_matches_per_year(if v > 0 { Some(v) } else { None });
        }
        b.build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchModel {
    pub id: String,
    pub name: String,
    /// Model id of the active version this variant is compared against.
    pub parent_version: String,
    pub params: ParamOverrides,
    pub status: ModelStatus,
    pub samples: u64,
    pub hits: u64,
    pub active_hits: u64,
    pub return_sum: f64,
    pub active_return_sum: f64,
    /// Latest walk-forward cutoff already counted.
    pub evaluated_through_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ResearchModel {
    pub fn hit_rate(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.hits as f64 / self.samples as f64
    }

    /// Shadow hit rate minus active hit rate over the same cutoffs.
    pub fn hit_rate_delta(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        (self.hits as f64 - self.active_hits as f64) / self.samples as f64
    }

    pub fn return_delta(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        (self.return_sum - self.active_return_sum) / self.samples as f64
    }
}

pub trait ResearchStore: Send + Sync {
    fn upsert_research_model(&self, model: &ResearchModel) -> Result<()>;
    fn research_model(&self, id: &str) -> Result<Option<ResearchModel>>;
    fn research_models(&self) -> Result<Vec<ResearchModel>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    pub min_samples: u64,
    pub promote_delta: f64,
    pub reject_delta: f64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_samples: 30,
            promote_delta: 0.05,
            reject_delta: 0.05,
        }
    }
}

impl PromotionPolicy {
    /// Next status implied by the model's record, if any.
    pub fn next_status(&self, m: &ResearchModel) -> Option<ModelStatus> {
        let delta = m.hit_rate_delta();
        match m.status {
            ModelStatus::Shadow | ModelStatus::Candidate
                if m.samples >= self.min_samples && delta <= -self.reject_delta =>
            {
                Some(ModelStatus::Rejected)
            }
            ModelStatus::Shadow
                if m.samples >= self.min_samples && delta >= self.promote_delta / 2.0 =>
            {
                Some(ModelStatus::Candidate)
            }
            ModelStatus::Candidate
                if m.samples >= 2 * self.min_samples && delta >= self.promote_delta =>
            {
                Some(ModelStatus::Promoted)
            }
            _ => None,
        }
    }
}

/// One cutoff scored for both the research model and the active model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub as_of_ms: u64,
    pub shadow_hit: bool,
    pub active_hit: bool,
    pub shadow_return: f64,
    pub active_return: f64,
}

/// Research model bookkeeping. Every read-modify-write of a model record runs under one
/// registry-wide lock, so overlapping evaluations cannot count a cutoff twice.
pub struct ShadowRegistry<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: PromotionPolicy,
    writes: Mutex<()>,
}

impl<S: ResearchStore> ShadowRegistry<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: PromotionPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            writes: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    fn write_lock(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.writes
            .lock()
            .map_err(|_| EngineError::Storage(anyhow!("shadow registry lock poisoned")))
    }

    pub fn register(
        &self,
        name: &str,
        base: &EngineConfig,
        params: ParamOverrides,
    ) -> Result<ResearchModel, EngineError> {
        params.apply(base)?;
        let now = self.clock.now_ms();
        let model = ResearchModel {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            parent_version: base.model_id.clone(),
            params,
            status: ModelStatus::Shadow,
            samples: 0,
            hits: 0,
            active_hits: 0,
            return_sum: 0.0,
            active_return_sum: 0.0,
            evaluated_through_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.store.upsert_research_model(&model)?;
        tracing::info!(id = %model.id, name, parent = %model.parent_version, "research model registered");
        Ok(model)
    }

    pub fn get(&self, id: &str) -> Result<ResearchModel, EngineError> {
        self.store
            .research_model(id)?
            .ok_or_else(|| EngineError::ModelNotFound(id.to_string()))
    }

    pub fn tracking(&self) -> Result<Vec<ResearchModel>, EngineError> {
        Ok(self
            .store
            .research_models()?
            .into_iter()
            .filter(|m| m.status.is_tracking())
            .collect())
    }

    /// Fold comparisons into the record, ignoring cutoffs already counted.
    pub fn record_comparisons(&self, id: &str, batch: &[Comparison]) -> Result<ResearchModel, EngineError> {
        let _guard = self.write_lock()?;
        let mut model = self.get(id)?;
        for c in batch {
            if model.evaluated_through_ms.is_some_and(|w| c.as_of_ms <= w) {
                continue;
            }
            model.samples += 1;
            model.hits += u64::from(c.shadow_hit);
            model.active_hits += u64::from(c.active_hit);
            model.return_sum += c.shadow_return;
            model.active_return_sum += c.active_return;
            model.evaluated_through_ms = Some(c.as_of_ms);
        }
        model.updated_at_ms = self.clock.now_ms();
        self.store.upsert_research_model(&model)?;
        Ok(model)
    }

    pub fn transition(&self, id: &str, to: ModelStatus) -> Result<ResearchModel, EngineError> {
        let _guard = self.write_lock()?;
        self.transition_locked(id, to)
    }

    fn transition_locked(&self, id: &str, to: ModelStatus) -> Result<ResearchModel, EngineError> {
        let mut model = self.get(id)?;
        if !model.status.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                from: model.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        model.status = to;
        model.updated_at_ms = self.clock.now_ms();
        self.store.upsert_research_model(&model)?;
        tracing::info!(id = %model.id, status = to.as_str(), "research model status changed");
        Ok(model)
    }

    /// Apply the promotion policy once. Promoting a model archives a promoted model it
    /// descends from.
    pub fn evaluate(&self, id: &str) -> Result<ModelStatus, EngineError> {
        let _guard = self.write_lock()?;
        let model = self.get(id)?;
        let Some(next) = self.policy.next_status(&model) else {
            return Ok(model.status);
        };
        let model = self.transition_locked(id, next)?;
        if next == ModelStatus::Promoted {
            if let Some(parent) = self.store.research_model(&model.parent_version)? {
                if parent.status == ModelStatus::Promoted {
                    self.transition_locked(&parent.id, ModelStatus::Archived)?;
                }
            }
        }
        Ok(model.status)
    }
}

/// Compare every tracking model against `active` on the tail of `candles`.
pub fn evaluate_shadows<S: ResearchStore>(
    registry: &ShadowRegistry<S>,
    candles: &[Candle],
    active: &EngineConfig,
    horizon_days: u32,
    opts: &WalkForwardOptions,
) -> Result<HashMap<String, ModelStatus>, EngineError> {
    let mut out = HashMap::new();
    for model in registry.tracking()? {
        let shadow_cfg = model.params.apply(active)?;
        let opts = WalkForwardOptions {
            start_after_ms: model.evaluated_through_ms,
            ..opts.clone()
        };
        let shadow = walk_forward(candles, &shadow_cfg, horizon_days, &opts)?;
        let baseline = walk_forward(candles, active, horizon_days, &opts)?;
        let by_cutoff: HashMap<u64, _> = baseline.points.iter().map(|p| (p.as_of_ms, p)).collect();
        let batch: Vec<Comparison> = shadow
            .points
            .iter()
            .filter_map(|s| {
                let a = by_cutoff.get(&s.as_of_ms)?;
                Some(Comparison {
                    as_of_ms: s.as_of_ms,
                    shadow_hit: s.hit,
                    active_hit: a.hit,
                    shadow_return: s.signed_return(),
                    active_return: a.signed_return(),
                })
            })
            .collect();
        registry.record_comparisons(&model.id, &batch)?;
        let status = registry.evaluate(&model.id)?;
        out.insert(model.id.clone(), status);
    }
    Ok(out)
}

/// Run shadow evaluation off the request path. Failures are logged, never returned.
pub fn spawn_shadow_evaluation<S>(
    registry: Arc<ShadowRegistry<S>>,
    candles: Arc<Vec<Candle>>,
    active: EngineConfig,
    horizon_days: u32,
    opts: WalkForwardOptions,
) -> JoinHandle<()>
where
    S: ResearchStore + 'static,
{
    tokio::spawn(async move {
        let joined = tokio::task::spawn_blocking(move || {
            evaluate_shadows(&registry, &candles, &active, horizon_days, &opts)
        })
        .await;
        match joined {
            Ok(Ok(statuses)) => {
                tracing::debug!(models = statuses.len(), horizon_days, "shadow evaluation finished")
            }
            Ok(Err(err)) => tracing::warn!(error = %err, "shadow evaluation failed"),
            Err(err) => tracing::warn!(error = %err, "shadow evaluation task panicked"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        assert!(ModelStatus::Shadow.can_transition(ModelStatus::Candidate));
        assert!(ModelStatus::Candidate.can_transition(ModelStatus::Promoted));
        assert!(ModelStatus::Promoted.can_transition(ModelStatus::Archived));
        assert!(!ModelStatus::Shadow.can_transition(ModelStatus::Promoted));
        assert!(!ModelStatus::Rejected.can_transition(ModelStatus::Shadow));
        assert!(!ModelStatus::Archived.can_transition(ModelStatus::Promoted));
    }

    #[test]
    fn overrides_are_validated() {
        let base = EngineConfig::default();
        let bad = ParamOverrides {
            window_len: Some(45),
            ..ParamOverrides::default()
        };
        assert!(bad.apply(&base).is_err());
        let good = ParamOverrides {
            window_len: Some(30),
            top_k: Some(10),
            ..ParamOverrides::default()
        };
        let cfg = good.apply(&base).unwrap();
        assert_eq!(cfg.retrieval.window_len, 30);
        assert_eq!(cfg.retrieval.top_k, 10);
    }
}
