use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use analog_quant::analog::{AnalogEngine, CandleSource, JsonFileCandleSource, MatchRequest};
use analog_quant::clock::{parse_date_ms, Clock, FixedClock, DAY_MS};
use analog_quant::config::EngineConfig;
use analog_quant::error::EngineError;
use analog_quant::model::Candle;
use analog_quant::outcome::SnapshotStore;
use analog_quant::pipeline::{SignalPipeline, SignalRequest};
use analog_quant::shadow::{ParamOverrides, PromotionPolicy, ShadowRegistry};
use analog_quant::sizing::{DecisionMode, Preset};
use analog_quant::store::MemoryStore;
use analog_quant::sweep::WalkForwardOptions;

struct StaticSource {
    series: HashMap<String, Vec<Candle>>,
}

impl CandleSource for StaticSource {
    fn load_candles(
        &self,
        symbol: &str,
        _timeframe: &str,
    ) -> impl Future<Output = anyhow::Result<Vec<Candle>>> + Send {
        let candles = self.series.get(symbol).cloned().unwrap_or_default();
        async move { Ok(candles) }
    }
}

fn lcg_series(n: usize, seed: u64) -> Vec<Candle> {
    let start = parse_date_ms("2016-01-01").unwrap();
    let mut state = seed;
    let mut price = 400.0;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let u = (state >> 11) as f64 / (1u64 << 53) as f64;
            price *= 1.0 + (u - 0.49) * 0.035;
            Candle::from_close(start + i as u64 * DAY_MS, price)
        })
        .collect()
}

fn pipeline(
    series: Vec<(&str, Vec<Candle>)>,
) -> (SignalPipeline<StaticSource, MemoryStore>, Arc<MemoryStore>) {
    let source = StaticSource {
        series: series
            .into_iter()
            .map(|(s, c)| (s.to_string(), c))
            .collect(),
    };
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(parse_date_ms("2024-01-01").unwrap()));
    let cfg = EngineConfig::builder().min_similarity(0.0).build().unwrap();
    let engine = AnalogEngine::new(source, clock, cfg.cache_ttl_ms());
    let store = Arc::new(MemoryStore::new());
    (SignalPipeline::new(engine, store.clone(), cfg), store)
}

#[test]
fn unknown_symbol_is_data_not_found() {
    let (p, _) = pipeline(vec![("BTCUSDT", lcg_series(1500, 1))]);
    let err = tokio_test::block_on(p.run(&SignalRequest::new("DOGEUSDT", "1d", Preset::Balanced)))
        .unwrap_err();
    assert!(matches!(err, EngineError::DataNotFound { .. }));
    assert!(!err.is_rejection());
}

#[tokio::test]
/// Every voting horizon is recorded once; the same request on the same day writes nothing new.
async fn recorded_snapshots_are_idempotent() {
    let (p, store) = pipeline(vec![("BTCUSDT", lcg_series(1500, 2))]);
    let as_of = parse_date_ms("2019-06-01").unwrap();
    let mut req = SignalRequest::new("btcusdt", "1d", Preset::Balanced);
    req.as_of_ms = Some(as_of);
    req.record = true;

    let decision = p.run(&req).await.unwrap();
    assert_eq!(decision.symbol, "BTCUSDT");
    assert_eq!(decision.horizons.len(), 4);
    assert_eq!(decision.issued_at_ms, as_of);
    let voting = decision.horizons.iter().filter(|h| h.votes()).count();
    assert!(voting > 0);
    assert_eq!(decision.consensus.votes.len(), voting);
    assert_eq!(decision.snapshots_written, voting);
    assert!(decision.safety.context_only);

    let again = p.run(&req).await.unwrap();
    assert_eq!(again.snapshots_written, 0);

    let maturity_90 = as_of + 90 * DAY_MS;
    assert_eq!(store.pending_snapshots(maturity_90, 100).unwrap().len(), voting);
    assert!(store.pending_snapshots(as_of, 100).unwrap().is_empty());
}

#[tokio::test]
/// The decision is built only from bars strictly before `as_of`.
async fn as_of_pins_entry_price() {
    let candles = lcg_series(1500, 3);
    let as_of = candles[900].open_time_ms;
    let expected_entry = candles[899].close;
    let (p, _) = pipeline(vec![("ETHUSDT", candles)]);
    let mut req = SignalRequest::new("ETHUSDT", "1d", Preset::Conservative);
    req.as_of_ms = Some(as_of);
    let decision = p.run(&req).await.unwrap();
    assert_eq!(decision.entry_price, Some(expected_entry));
    for h in decision.horizons.iter().filter(|h| h.votes()) {
        let c = h.confidence.as_ref().unwrap();
        assert!(c.final_confidence <= c.floor_cap);
        assert!(c.final_confidence <= c.calibration.calibrated + 1e-12);
    }
    if !decision.sizing.blockers.is_empty() {
        assert_eq!(decision.sizing.mode, DecisionMode::NoTrade);
        assert_eq!(decision.sizing.final_size, 0.0);
    }
    assert!(decision.sizing.final_size <= decision.sizing.max_size);
}

#[tokio::test]
async fn short_history_yields_insufficient_sample() {
    let (p, _) = pipeline(vec![("SOLUSDT", lcg_series(100, 4))]);
    let mut req = SignalRequest::new("SOLUSDT", "1d", Preset::Aggressive);
    req.record = true;
    let decision = p.run(&req).await.unwrap();
    assert!(decision.horizons.iter().all(|h| h.insufficient_history));
    assert_eq!(decision.sizing.mode, DecisionMode::InsufficientSample);
    assert_eq!(decision.sizing.final_size, 0.0);
    assert_eq!(decision.snapshots_written, 0);
}

#[tokio::test]
async fn json_file_source_serves_directory_layout() {
    let dir = std::env::temp_dir().join(format!("analog-quant-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let candles = lcg_series(400, 5);
    std::fs::write(
        dir.join("BTCUSDT_1d.json"),
        serde_json::to_string(&candles).unwrap(),
    )
    .unwrap();

    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(0));
    let engine = AnalogEngine::new(JsonFileCandleSource::new(&dir), clock, 60_000);
    let history = engine.history("btcusdt", "1d").await.unwrap();
    assert_eq!(history.len(), 400);
    assert_eq!(engine.cache().len(), 1);

    let resp = engine
        .match_pattern(&MatchRequest::new("BTCUSDT", "1d", 30), &EngineConfig::default())
        .await
        .unwrap();
    assert!(resp.ok);
    assert!(matches!(
        engine.history("ETHUSDT", "1d").await,
        Err(EngineError::DataNotFound { .. })
    ));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
/// A one-shot caller can wait for the detached shadow run the request started.
async fn flushing_waits_for_shadow_evaluation() {
    let (p, store) = pipeline(vec![("BTCUSDT", lcg_series(1500, 4))]);
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(parse_date_ms("2024-01-01").unwrap()));
    let registry = Arc::new(ShadowRegistry::new(store, clock, PromotionPolicy::default()));
    let model = registry
        .register(
            "short",
            p.config(),
            ParamOverrides {
                window_len: Some(30),
                ..ParamOverrides::default()
            },
        )
        .unwrap();
    let opts = WalkForwardOptions {
        step_bars: 20,
        max_points: 8,
        start_after_ms: None,
    };
    let p = p.with_shadows(registry.clone(), opts);
    assert!(p.flush_shadows(Duration::from_millis(10)).await);

    p.run(&SignalRequest::new("BTCUSDT", "1d", Preset::Balanced))
        .await
        .unwrap();
    assert!(p.flush_shadows(Duration::from_secs(60)).await);
    let tracked = registry.get(&model.id).unwrap();
    assert!(tracked.evaluated_through_ms.is_some());
    assert!(tracked.samples > 0 && tracked.samples <= 8);
}
