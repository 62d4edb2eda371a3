use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::confidence::calibration::{
    bucket_index, CalibrationBucket, CalibrationKey, CalibrationStore, CalibrationTable,
};
use crate::confidence::reliability::{ReliabilitySnapshot, ReliabilityStore};
use crate::outcome::{PredictionOutcome, PredictionSnapshot, SnapshotStore};
use crate::shadow::{ResearchModel, ResearchStore};

/// Everything the pipeline and the resolver persist.
pub trait EngineStore: CalibrationStore + ReliabilityStore + SnapshotStore + ResearchStore {}

impl<T> EngineStore for T where T: CalibrationStore + ReliabilityStore + SnapshotStore + ResearchStore {}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS calibration_buckets (
    model_id TEXT NOT NULL,
    preset TEXT NOT NULL,
    horizon_days INTEGER NOT NULL,
    bucket_index INTEGER NOT NULL,
    lo REAL NOT NULL,
    hi REAL NOT NULL,
    n INTEGER NOT NULL DEFAULT 0,
    k INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(model_id, preset, horizon_days, bucket_index)
);

CREATE TABLE IF NOT EXISTS reliability_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id TEXT NOT NULL,
    computed_at_ms INTEGER NOT NULL,
    badge TEXT NOT NULL,
    score REAL NOT NULL,
    modifier REAL NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reliability_model
    ON reliability_snapshots(model_id, computed_at_ms);

CREATE TABLE IF NOT EXISTS prediction_snapshots (
    snapshot_key TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    model_id TEXT NOT NULL,
    horizon_days INTEGER NOT NULL,
    issued_at_ms INTEGER NOT NULL,
    maturity_ms INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_maturity
    ON prediction_snapshots(maturity_ms);

CREATE TABLE IF NOT EXISTS prediction_outcomes (
    snapshot_key TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    maturity_ms INTEGER NOT NULL,
    resolved_at_ms INTEGER NOT NULL,
    hit INTEGER NOT NULL,
    realized_return REAL NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outcomes_model
    ON prediction_outcomes(model_id, maturity_ms);

CREATE TABLE IF NOT EXISTS research_models (
    id TEXT PRIMARY KEY,
    parent_version TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);
"#;

/// SQLite-backed store. One connection guarded by a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
        f(&mut *guard)
    }
}

fn ensure_buckets(tx: &Transaction<'_>, key: &CalibrationKey, bucket_count: usize) -> Result<()> {
    let baseline = CalibrationTable::baseline(key.clone(), bucket_count);
    for b in &baseline.buckets {
        tx.execute(
            r#"
            INSERT OR IGNORE INTO calibration_buckets (
                model_id, preset, horizon_days, bucket_index, lo, hi, n, k
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)
            "#,
            params![
                key.model_id,
                key.preset,
                key.horizon_days as i64,
                b.index as i64,
                b.lo,
                b.hi,
            ],
        )?;
    }
    Ok(())
}

fn increment_bucket(
    tx: &Transaction<'_>,
    key: &CalibrationKey,
    bucket_count: usize,
    score: f64,
    hit: bool,
) -> Result<()> {
    ensure_buckets(tx, key, bucket_count)?;
    tx.execute(
        r#"
        UPDATE calibration_buckets
        SET n = n + 1, k = k + ?5
        WHERE model_id = ?1 AND preset = ?2 AND horizon_days = ?3 AND bucket_index = ?4
        "#,
        params![
            key.model_id,
            key.preset,
            key.horizon_days as i64,
            bucket_index(score, bucket_count) as i64,
            i64::from(hit),
        ],
    )?;
    Ok(())
}

impl CalibrationStore for SqliteStore {
    fn load_or_init(&self, key: &CalibrationKey, bucket_count: usize) -> Result<CalibrationTable> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            ensure_buckets(&tx, key, bucket_count)?;
            let buckets = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT bucket_index, lo, hi, n, k FROM calibration_buckets
                    WHERE model_id = ?1 AND preset = ?2 AND horizon_days = ?3 AND bucket_index < ?4
                    ORDER BY bucket_index ASC
                    "#,
                )?;
                let rows = stmt.query_map(
                    params![
                        key.model_id,
                        key.preset,
                        key.horizon_days as i64,
                        bucket_count as i64
                    ],
                    |row| {
                        Ok(CalibrationBucket {
                            index: row.get::<_, i64>(0)? as usize,
                            lo: row.get(1)?,
                            hi: row.get(2)?,
                            n: row.get::<_, i64>(3)?.max(0) as u64,
                            k: row.get::<_, i64>(4)?.max(0) as u64,
                        })
                    },
                )?;
                let buckets = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                buckets
            };
            tx.commit()?;
            Ok(CalibrationTable {
                key: key.clone(),
                buckets,
            })
        })
    }

    fn increment(&self, key: &CalibrationKey, bucket_count: usize, score: f64, hit: bool) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            increment_bucket(&tx, key, bucket_count, score, hit)?;
            tx.commit()?;
            Ok(())
        })
    }
}

impl ReliabilityStore for SqliteStore {
    fn latest_reliability(&self, model_id: &str) -> Result<Option<ReliabilitySnapshot>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    r#"
                    SELECT payload_json FROM reliability_snapshots
                    WHERE model_id = ?1
                    ORDER BY computed_at_ms DESC, id DESC
                    LIMIT 1
                    "#,
                    params![model_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).context("corrupt reliability snapshot"))
                .transpose()
        })
    }

    fn append_reliability(&self, snapshot: &ReliabilitySnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO reliability_snapshots (
                    model_id, computed_at_ms, badge, score, modifier, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    snapshot.model_id,
                    snapshot.computed_at_ms as i64,
                    snapshot.badge.as_str(),
                    snapshot.score,
                    snapshot.modifier,
                    payload,
                ],
            )?;
            Ok(())
        })
    }
}

impl SnapshotStore for SqliteStore {
    fn insert_snapshot(&self, snapshot: &PredictionSnapshot) -> Result<bool> {
        let payload = serde_json::to_string(snapshot)?;
        self.with_conn(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO prediction_snapshots (
                    snapshot_key, symbol, model_id, horizon_days, issued_at_ms, maturity_ms, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    snapshot.key,
                    snapshot.symbol,
                    snapshot.model_id,
                    snapshot.horizon_days as i64,
                    snapshot.issued_at_ms as i64,
                    snapshot.maturity_ms as i64,
                    payload,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    fn pending_snapshots(&self, now_ms: u64, max: usize) -> Result<Vec<PredictionSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT s.payload_json FROM prediction_snapshots s
                WHERE s.maturity_ms <= ?1
                  AND NOT EXISTS (
                      SELECT 1 FROM prediction_outcomes o WHERE o.snapshot_key = s.snapshot_key
                  )
                ORDER BY s.maturity_ms ASC, s.snapshot_key ASC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![now_ms as i64, max as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for payload in rows {
                out.push(serde_json::from_str(&payload?).context("corrupt prediction snapshot")?);
            }
            Ok(out)
        })
    }

    fn commit_outcome(
        &self,
        outcome: &PredictionOutcome,
        key: &CalibrationKey,
        bucket_count: usize,
    ) -> Result<bool> {
        let payload = serde_json::to_string(outcome)?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO prediction_outcomes (
                    snapshot_key, model_id, maturity_ms, resolved_at_ms, hit, realized_return, payload_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    outcome.snapshot_key,
                    outcome.model_id,
                    outcome.maturity_ms as i64,
                    outcome.resolved_at_ms as i64,
                    i64::from(outcome.hit),
                    outcome.realized_return,
                    payload,
                ],
            )?;
            if inserted == 1 {
                increment_bucket(&tx, key, bucket_count, outcome.raw_evidence, outcome.hit)?;
            }
            tx.commit()?;
            Ok(inserted == 1)
        })
    }

    fn outcome(&self, snapshot_key: &str) -> Result<Option<PredictionOutcome>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload_json FROM prediction_outcomes WHERE snapshot_key = ?1",
                    params![snapshot_key],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).context("corrupt prediction outcome"))
                .transpose()
        })
    }

    fn recent_outcomes(&self, model_id: &str, limit: usize) -> Result<Vec<PredictionOutcome>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT payload_json FROM prediction_outcomes
                WHERE model_id = ?1
                ORDER BY maturity_ms DESC, snapshot_key DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![model_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out: Vec<PredictionOutcome> = Vec::new();
            for payload in rows {
                out.push(serde_json::from_str(&payload?).context("corrupt prediction outcome")?);
            }
            out.reverse();
            Ok(out)
        })
    }
}

impl ResearchStore for SqliteStore {
    fn upsert_research_model(&self, model: &ResearchModel) -> Result<()> {
        let payload = serde_json::to_string(model)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO research_models (id, parent_version, status, updated_at_ms, payload_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    parent_version = excluded.parent_version,
                    status = excluded.status,
                    updated_at_ms = excluded.updated_at_ms,
                    payload_json = excluded.payload_json
                "#,
                params![
                    model.id,
                    model.parent_version,
                    model.status.as_str(),
                    model.updated_at_ms as i64,
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    fn research_model(&self, id: &str) -> Result<Option<ResearchModel>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload_json FROM research_models WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).context("corrupt research model"))
                .transpose()
        })
    }

    fn research_models(&self) -> Result<Vec<ResearchModel>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT payload_json FROM research_models ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for payload in rows {
                out.push(serde_json::from_str(&payload?).context("corrupt research model")?);
            }
            Ok(out)
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    calibration: HashMap<CalibrationKey, CalibrationTable>,
    reliability: Vec<ReliabilitySnapshot>,
    snapshots: BTreeMap<String, PredictionSnapshot>,
    outcomes: BTreeMap<String, PredictionOutcome>,
    research: BTreeMap<String, ResearchModel>,
}

impl MemoryState {
    fn table_mut(&mut self, key: &CalibrationKey, bucket_count: usize) -> &mut CalibrationTable {
        self.calibration
            .entry(key.clone())
            .or_insert_with(|| CalibrationTable::baseline(key.clone(), bucket_count))
    }
}

/// In-process store for tests and dry runs. Every operation runs under one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl CalibrationStore for MemoryStore {
    fn load_or_init(&self, key: &CalibrationKey, bucket_count: usize) -> Result<CalibrationTable> {
        let mut guard = self.lock()?;
        Ok(guard.table_mut(key, bucket_count).clone())
    }

    fn increment(&self, key: &CalibrationKey, bucket_count: usize, score: f64, hit: bool) -> Result<()> {
        let mut guard = self.lock()?;
        guard.table_mut(key, bucket_count).record(score, hit);
        Ok(())
    }
}

impl ReliabilityStore for MemoryStore {
    fn latest_reliability(&self, model_id: &str) -> Result<Option<ReliabilitySnapshot>> {
        let guard = self.lock()?;
        Ok(guard
            .reliability
            .iter()
            .rev()
            .find(|s| s.model_id == model_id)
            .cloned())
    }

    fn append_reliability(&self, snapshot: &ReliabilitySnapshot) -> Result<()> {
        self.lock()?.reliability.push(snapshot.clone());
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn insert_snapshot(&self, snapshot: &PredictionSnapshot) -> Result<bool> {
        let mut guard = self.lock()?;
        if guard.snapshots.contains_key(&snapshot.key) {
            return Ok(false);
        }
        guard.snapshots.insert(snapshot.key.clone(), snapshot.clone());
        Ok(true)
    }

    fn pending_snapshots(&self, now_ms: u64, max: usize) -> Result<Vec<PredictionSnapshot>> {
        let guard = self.lock()?;
        let mut pending: Vec<PredictionSnapshot> = guard
            .snapshots
            .values()
            .filter(|s| s.maturity_ms <= now_ms && !guard.outcomes.contains_key(&s.key))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.maturity_ms.cmp(&b.maturity_ms).then(a.key.cmp(&b.key)));
        pending.truncate(max);
        Ok(pending)
    }

    fn commit_outcome(
        &self,
        outcome: &PredictionOutcome,
        key: &CalibrationKey,
        bucket_count: usize,
    ) -> Result<bool> {
        let mut guard = self.lock()?;
        if guard.outcomes.contains_key(&outcome.snapshot_key) {
            return Ok(false);
        }
        guard
            .outcomes
            .insert(outcome.snapshot_key.clone(), outcome.clone());
        guard
            .table_mut(key, bucket_count)
            .record(outcome.raw_evidence, outcome.hit);
        Ok(true)
    }

    fn outcome(&self, snapshot_key: &str) -> Result<Option<PredictionOutcome>> {
        Ok(self.lock()?.outcomes.get(snapshot_key).cloned())
    }

    fn recent_outcomes(&self, model_id: &str, limit: usize) -> Result<Vec<PredictionOutcome>> {
        let guard = self.lock()?;
        let mut out: Vec<PredictionOutcome> = guard
            .outcomes
            .values()
            .filter(|o| o.model_id == model_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.maturity_ms
                .cmp(&b.maturity_ms)
                .then(a.snapshot_key.cmp(&b.snapshot_key))
        });
        let skip = out.len().saturating_sub(limit);
        Ok(out.split_off(skip))
    }
}

impl ResearchStore for MemoryStore {
    fn upsert_research_model(&self, model: &ResearchModel) -> Result<()> {
        self.lock()?.research.insert(model.id.clone(), model.clone());
        Ok(())
    }

    fn research_model(&self, id: &str) -> Result<Option<ResearchModel>> {
        Ok(self.lock()?.research.get(id).cloned())
    }

    fn research_models(&self) -> Result<Vec<ResearchModel>> {
        Ok(self.lock()?.research.values().cloned().collect())
    }
}
