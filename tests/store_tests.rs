use std::sync::Arc;

use analog_quant::confidence::{
    CalibrationKey, CalibrationStore, ReliabilitySnapshot, ReliabilityStore,
};
use analog_quant::shadow::{ModelStatus, ResearchModel, ResearchStore};
use analog_quant::store::SqliteStore;

#[test]
/// First access creates the baseline partition; later reads see persisted counts.
fn calibration_tables_are_created_lazily() {
    let store = SqliteStore::open_in_memory().unwrap();
    let key = CalibrationKey::new("analog-v1", "BALANCED", 30);
    let table = store.load_or_init(&key, 10).unwrap();
    assert_eq!(table.buckets.len(), 10);
    assert!(table.is_partition());
    assert_eq!(table.total_samples(), 0);

    store.increment(&key, 10, 0.71, true).unwrap();
    store.increment(&key, 10, 0.74, false).unwrap();
    let table = store.load_or_init(&key, 10).unwrap();
    let b = table.bucket_for(0.72);
    assert_eq!((b.n, b.k), (2, 1));

    let other = store
        .load_or_init(&CalibrationKey::new("analog-v1", "balanced", 7), 10)
        .unwrap();
    assert_eq!(other.total_samples(), 0);
}

#[test]
/// Concurrent increments on one bucket are never lost.
fn concurrent_increments_are_atomic() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let key = CalibrationKey::new("analog-v1", "aggressive", 14);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    store.increment(&key, 10, 0.55, (t + i) % 2 == 0).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let table = store.load_or_init(&key, 10).unwrap();
    assert_eq!(table.bucket_for(0.55).n, 200);
    assert_eq!(table.bucket_for(0.55).k, 100);
}

#[test]
fn latest_reliability_wins() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.latest_reliability("analog-v1").unwrap().is_none());
    store
        .append_reliability(&ReliabilitySnapshot::baseline("analog-v1", 1_000))
        .unwrap();
    let mut newer = ReliabilitySnapshot::baseline("analog-v1", 2_000);
    newer.sample_count = 42;
    store.append_reliability(&newer).unwrap();
    let latest = store.latest_reliability("analog-v1").unwrap().unwrap();
    assert_eq!(latest.computed_at_ms, 2_000);
    assert_eq!(latest.sample_count, 42);
}

#[test]
fn research_models_round_trip_through_upsert() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut model = ResearchModel {
        id: "m-1".to_string(),
        name: "short-window".to_string(),
        parent_version: "analog-v1".to_string(),
        params: Default::default(),
        status: ModelStatus::Shadow,
        samples: 0,
        hits: 0,
        active_hits: 0,
        return_sum: 0.0,
        active_return_sum: 0.0,
        evaluated_through_ms: None,
        created_at_ms: 1,
        updated_at_ms: 1,
    };
    store.upsert_research_model(&model).unwrap();
    model.status = ModelStatus::Candidate;
    model.samples = 31;
    store.upsert_research_model(&model).unwrap();

    let loaded = store.research_model("m-1").unwrap().unwrap();
    assert_eq!(loaded.status, ModelStatus::Candidate);
    assert_eq!(loaded.samples, 31);
    assert_eq!(store.research_models().unwrap().len(), 1);
    assert!(store.research_model("missing").unwrap().is_none());
}

#[test]
fn file_backed_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!("aq-{}/store.sqlite", uuid::Uuid::new_v4()));
    let key = CalibrationKey::new("analog-v1", "balanced", 90);
    {
        let store = SqliteStore::open(&path).unwrap();
        store.increment(&key, 10, 0.95, true).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let table = store.load_or_init(&key, 10).unwrap();
    assert_eq!(table.bucket_for(0.95).k, 1);
    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir).unwrap();
    }
}
