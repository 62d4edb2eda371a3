use analog_quant::analog::forward::{ForwardStats, Percentiles};
use analog_quant::confidence::reliability::ReliabilityComponents;
use analog_quant::confidence::{
    assess_confidence, evidence_score, CalibrationKey, CalibrationTable, ReliabilityBadge,
    ReliabilitySnapshot,
};
use analog_quant::config::EngineConfig;

fn stats(sample_size: usize, effective_n: f64) -> ForwardStats {
    ForwardStats {
        horizon_days: 30,
        sample_size,
        effective_n,
        stability_score: 1.0,
        returns: Percentiles {
            p10: 0.01,
            p50: 0.04,
            p90: 0.06,
        },
        up_fraction: 1.0,
        agreement: 1.0,
        ..ForwardStats::default()
    }
}

fn healthy(model: &str) -> ReliabilitySnapshot {
    ReliabilitySnapshot::from_components(
        model,
        ReliabilityComponents {
            drift: 1.0,
            calibration: 1.0,
            rolling_performance: 1.0,
            tail_risk: 1.0,
        },
        100,
        0,
    )
}

fn confident_table(cfg: &EngineConfig, raw: f64) -> CalibrationTable {
    let mut table = CalibrationTable::baseline(
        CalibrationKey::new(cfg.model_id(), "balanced", 30),
        cfg.calibration().buckets,
    );
    for _ in 0..200 {
        table.record(raw, true);
    }
    table
}

#[test]
/// Four effective samples cannot carry more than the 0.45 cap, whatever calibration says.
fn thin_evidence_is_capped_by_floor() {
    let cfg = EngineConfig::default();
    let s = stats(4, 4.0);
    let raw = evidence_score(&s, cfg.evidence()).score;
    let table = confident_table(&cfg, raw);
    let c = assess_confidence(&s, &table, &healthy(cfg.model_id()), &cfg);
    assert!(c.calibration.calibrated > 0.8);
    assert_eq!(c.floor_cap, 0.45);
    assert_eq!(c.final_confidence, 0.45);
    assert!(c.capped_by_floor());
    assert_eq!(c.vote_confidence(), 0.45);
}

#[test]
fn degraded_reliability_suppresses_calibrated_confidence() {
    let cfg = EngineConfig::default();
    let s = stats(30, 30.0);
    let raw = evidence_score(&s, cfg.evidence()).score;
    let table = confident_table(&cfg, raw);
    let degraded = ReliabilitySnapshot::from_components(
        cfg.model_id(),
        ReliabilityComponents {
            drift: 0.4,
            calibration: 0.4,
            rolling_performance: 0.4,
            tail_risk: 0.4,
        },
        50,
        0,
    );
    assert_eq!(degraded.badge, ReliabilityBadge::Degraded);
    let c = assess_confidence(&s, &table, &degraded, &cfg);
    assert_eq!(c.floor_cap, 1.0);
    assert!((c.final_confidence - c.calibration.calibrated * 0.60).abs() < 1e-12);
    assert!(!c.capped_by_floor());
}

#[test]
/// An empty table leaves raw evidence untouched; the WARN baseline still suppresses it.
fn baseline_state_defers_to_raw_evidence() {
    let cfg = EngineConfig::default();
    let s = stats(30, 30.0);
    let table = CalibrationTable::baseline(CalibrationKey::new("analog-v1", "BALANCED", 30), 10);
    assert_eq!(table.key.preset, "balanced");
    let baseline = ReliabilitySnapshot::baseline("analog-v1", 0);
    assert_eq!(baseline.badge, ReliabilityBadge::Warn);
    let c = assess_confidence(&s, &table, &baseline, &cfg);
    assert_eq!(c.calibration.weight, 0.0);
    assert!((c.calibration.calibrated - c.raw_evidence()).abs() < 1e-12);
    assert!((c.final_confidence - (c.raw_evidence() * 0.85).min(1.0)).abs() < 1e-12);
}

#[test]
fn no_matches_means_no_evidence() {
    let cfg = EngineConfig::default();
    let s = ForwardStats::empty(30);
    let table = CalibrationTable::baseline(CalibrationKey::new("m", "balanced", 30), 10);
    let c = assess_confidence(&s, &table, &healthy("m"), &cfg);
    assert_eq!(c.raw_evidence(), 0.0);
    assert_eq!(c.final_confidence, 0.0);
    assert_eq!(c.floor_cap, 0.35);
}
