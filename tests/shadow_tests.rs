use std::sync::Arc;

use analog_quant::clock::{parse_date_ms, Clock, FixedClock, DAY_MS};
use analog_quant::config::EngineConfig;
use analog_quant::error::EngineError;
use analog_quant::model::Candle;
use analog_quant::shadow::{
    evaluate_shadows, spawn_shadow_evaluation, Comparison, ModelStatus, ParamOverrides,
    PromotionPolicy, ShadowRegistry,
};
use analog_quant::store::{MemoryStore, SqliteStore};
use analog_quant::sweep::WalkForwardOptions;

fn registry() -> ShadowRegistry<MemoryStore> {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(1_700_000_000_000));
    ShadowRegistry::new(Arc::new(MemoryStore::new()), clock, PromotionPolicy::default())
}

fn batch(from: u64, count: u64, shadow_hit: bool, active_hit: bool) -> Vec<Comparison> {
    (0..count)
        .map(|i| Comparison {
            as_of_ms: from + i * DAY_MS,
            shadow_hit,
            active_hit,
            shadow_return: if shadow_hit { 0.02 } else { -0.02 },
            active_return: if active_hit { 0.02 } else { -0.02 },
        })
        .collect()
}

fn short_window() -> ParamOverrides {
    ParamOverrides {
        window_len: Some(30),
        ..ParamOverrides::default()
    }
}

fn lcg_series(n: usize, seed: u64) -> Vec<Candle> {
    let start = parse_date_ms("2019-01-01").unwrap();
    let mut state = seed;
    let mut price = 50.0;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let u = (state >> 11) as f64 / (1u64 << 53) as f64;
            price *= 1.0 + (u - 0.5) * 0.05;
            Candle::from_close(start + i as u64 * DAY_MS, price)
        })
        .collect()
}

#[test]
/// SHADOW -> CANDIDATE after enough winning samples, CANDIDATE -> PROMOTED after twice as many.
fn winning_model_walks_the_lifecycle() {
    let reg = registry();
    let base = EngineConfig::default();
    let model = reg.register("short-window", &base, short_window()).unwrap();
    assert_eq!(model.status, ModelStatus::Shadow);
    assert_eq!(model.parent_version, "analog-v1");

    reg.record_comparisons(&model.id, &batch(0, 30, true, false)).unwrap();
    assert_eq!(reg.evaluate(&model.id).unwrap(), ModelStatus::Candidate);
    assert_eq!(reg.evaluate(&model.id).unwrap(), ModelStatus::Candidate);

    reg.record_comparisons(&model.id, &batch(30 * DAY_MS, 30, true, false)).unwrap();
    assert_eq!(reg.evaluate(&model.id).unwrap(), ModelStatus::Promoted);
    assert!(reg.tracking().unwrap().is_empty());
}

#[test]
fn losing_model_is_rejected() {
    let reg = registry();
    let model = reg
        .register("loose-floor", &EngineConfig::default(), ParamOverrides {
            min_similarity: Some(0.0),
            ..ParamOverrides::default()
        })
        .unwrap();
    reg.record_comparisons(&model.id, &batch(0, 40, false, true)).unwrap();
    assert_eq!(reg.evaluate(&model.id).unwrap(), ModelStatus::Rejected);
    assert!(reg.get(&model.id).unwrap().hit_rate_delta() < 0.0);
}

#[test]
/// Re-submitting already counted cutoffs changes nothing.
fn comparisons_are_counted_once() {
    let reg = registry();
    let model = reg.register("short", &EngineConfig::default(), short_window()).unwrap();
    let b = batch(0, 10, true, true);
    reg.record_comparisons(&model.id, &b).unwrap();
    let again = reg.record_comparisons(&model.id, &b).unwrap();
    assert_eq!(again.samples, 10);
    assert_eq!(again.evaluated_through_ms, Some(9 * DAY_MS));
}

#[test]
fn invalid_transitions_and_unknown_models_fail() {
    let reg = registry();
    let model = reg.register("short", &EngineConfig::default(), short_window()).unwrap();
    let err = reg.transition(&model.id, ModelStatus::Promoted).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert!(err.is_rejection());
    assert!(matches!(
        reg.get("missing"),
        Err(EngineError::ModelNotFound(_))
    ));
    let bad = ParamOverrides {
        window_len: Some(45),
        ..ParamOverrides::default()
    };
    assert!(matches!(
        reg.register("bad", &EngineConfig::default(), bad),
        Err(EngineError::InvalidWindowSize(45))
    ));
}

#[test]
/// Promoting a descendant archives the promoted model it was compared against.
fn promotion_archives_promoted_parent() {
    let reg = registry();
    let parent = reg.register("v2", &EngineConfig::default(), short_window()).unwrap();
    reg.transition(&parent.id, ModelStatus::Candidate).unwrap();
    reg.transition(&parent.id, ModelStatus::Promoted).unwrap();

    let base = EngineConfig::builder()
        .model_id(parent.id.clone())
        .window_len(30)
        .build()
        .unwrap();
    let child = reg
        .register("v3", &base, ParamOverrides {
            top_k: Some(10),
            ..ParamOverrides::default()
        })
        .unwrap();
    assert_eq!(child.parent_version, parent.id);
    reg.record_comparisons(&child.id, &batch(0, 60, true, false)).unwrap();
    assert_eq!(reg.evaluate(&child.id).unwrap(), ModelStatus::Candidate);
    assert_eq!(reg.evaluate(&child.id).unwrap(), ModelStatus::Promoted);
    assert_eq!(reg.get(&parent.id).unwrap().status, ModelStatus::Archived);
}

#[test]
fn walk_forward_evaluation_advances_watermark() {
    let reg = registry();
    let active = EngineConfig::builder().min_similarity(0.0).build().unwrap();
    let model = reg.register("short", &active, short_window()).unwrap();
    let candles = lcg_series(700, 41);
    let opts = WalkForwardOptions {
        step_bars: 10,
        max_points: 20,
        start_after_ms: None,
    };

    let statuses = evaluate_shadows(&reg, &candles, &active, 30, &opts).unwrap();
    assert_eq!(statuses.get(&model.id), Some(&ModelStatus::Shadow));
    let first = reg.get(&model.id).unwrap();
    assert_eq!(first.samples, 20);
    assert!(first.evaluated_through_ms.is_some());

    evaluate_shadows(&reg, &candles, &active, 30, &opts).unwrap();
    assert_eq!(reg.get(&model.id).unwrap().samples, 20);
}

#[tokio::test]
async fn detached_evaluation_persists_progress() {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(0));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let reg = Arc::new(ShadowRegistry::new(store, clock, PromotionPolicy::default()));
    let active = EngineConfig::builder().min_similarity(0.0).build().unwrap();
    let model = reg.register("short", &active, short_window()).unwrap();
    let opts = WalkForwardOptions {
        step_bars: 10,
        max_points: 5,
        start_after_ms: None,
    };

    let handle = spawn_shadow_evaluation(reg.clone(), Arc::new(lcg_series(500, 9)), active, 30, opts);
    handle.await.unwrap();
    assert_eq!(reg.get(&model.id).unwrap().samples, 5);
}

#[test]
/// Many threads folding the same batch count every cutoff exactly once.
fn concurrent_recording_counts_each_cutoff_once() {
    let reg = Arc::new(registry());
    let model = reg
        .register("short", &EngineConfig::default(), short_window())
        .unwrap();
    let comparisons = batch(1_600_000_000_000, 25, true, false);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            let reg = reg.clone();
            let id = model.id.clone();
            let comparisons = &comparisons;
            scope.spawn(move || reg.record_comparisons(&id, comparisons).unwrap());
        }
    });
    let stored = reg.get(&model.id).unwrap();
    assert_eq!(stored.samples, 25);
    assert_eq!(stored.hits, 25);
    assert_eq!(stored.active_hits, 0);
}

#[tokio::test]
async fn overlapping_detached_evaluations_do_not_double_count() {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(0));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let reg = Arc::new(ShadowRegistry::new(store, clock, PromotionPolicy::default()));
    let active = EngineConfig::builder().min_similarity(0.0).build().unwrap();
    let model = reg.register("short", &active, short_window()).unwrap();
    let candles = Arc::new(lcg_series(500, 9));
    let opts = WalkForwardOptions {
        step_bars: 10,
        max_points: 5,
        start_after_ms: None,
    };

    let first = spawn_shadow_evaluation(reg.clone(), candles.clone(), active.clone(), 30, opts.clone());
    let second = spawn_shadow_evaluation(reg.clone(), candles, active, 30, opts);
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(reg.get(&model.id).unwrap().samples, 5);
}
