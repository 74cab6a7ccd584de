use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use ingest_core::{
    plan_join, validate_entry, AnalyzedStatus, AnalyzedTestVariant, BuildId, BuildResult, ControlEntry, Error,
    JoinFact, JoinOutcome, JoinPlan, JoinSummary, PresubmitJoinStatistics, PresubmitResult, Result, TaskId,
    TaskPayload, TestVariantKey, PRESUBMIT_JOIN_STATS_HOURS,
};
use ingest_storage::{
    ensure_unique, hours_since, ControlStore, Outbox, OutboxTask, VariantPlanner, VariantStore,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

trait SqlContext<T> {
    fn ctx(self, what: &str) -> Result<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn ctx(self, what: &str) -> Result<T> {
        self.map_err(|e| Error::storage_with_source(what.to_string(), e))
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::Serialization(e.to_string()))
}

fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(v: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(v).ok_or_else(|| Error::storage(format!("timestamp {v} out of range")))
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage_with_source(format!("create database directory {}", parent.display()), e)
            })?;
        }
        let conn = Connection::open(db_path).ctx(&format!("open sqlite db {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .ctx("set pragmas")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().ctx("open in-memory sqlite db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).ctx("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::storage("sqlite connection lock poisoned"))
    }
}

struct EntryRow {
    project: String,
    is_presubmit: bool,
    build_result_json: Option<String>,
    presubmit_result_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl EntryRow {
    fn decode(self, build_id: BuildId) -> Result<ControlEntry> {
        Ok(ControlEntry {
            project: self.project,
            build_id,
            is_presubmit: self.is_presubmit,
            build_result: self.build_result_json.as_deref().map(from_json).transpose()?,
            presubmit_result: self.presubmit_result_json.as_deref().map(from_json).transpose()?,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

fn load_entry(conn: &Connection, build: &BuildId) -> Result<Option<ControlEntry>> {
    let row = conn
        .query_row(
            "SELECT project, is_presubmit, build_result_json, presubmit_result_json, created_at, updated_at
             FROM ingestion_control WHERE build_host = ?1 AND build_id = ?2",
            params![build.host, build.id],
            |r| {
                Ok(EntryRow {
                    project: r.get(0)?,
                    is_presubmit: r.get(1)?,
                    build_result_json: r.get(2)?,
                    presubmit_result_json: r.get(3)?,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            },
        )
        .optional()
        .ctx("read control entry")?;
    row.map(|r| r.decode(build.clone())).transpose()
}

fn write_entry(conn: &Connection, e: &ControlEntry) -> Result<()> {
    let build_json = e.build_result.as_ref().map(to_json).transpose()?;
    let presubmit_json = e.presubmit_result.as_ref().map(to_json).transpose()?;
    conn.execute(
        "INSERT INTO ingestion_control(build_host, build_id, project, is_presubmit, build_result_json, presubmit_result_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(build_host, build_id) DO UPDATE SET
           project = excluded.project,
           is_presubmit = excluded.is_presubmit,
           build_result_json = excluded.build_result_json,
           presubmit_result_json = excluded.presubmit_result_json,
           updated_at = excluded.updated_at",
        params![
            e.build_id.host,
            e.build_id.id,
            e.project,
            e.is_presubmit,
            build_json,
            presubmit_json,
            micros(e.created_at),
            micros(e.updated_at)
        ],
    )
    .ctx("write control entry")?;
    Ok(())
}

/// Returns false when a task with the same dedup key is already recorded.
fn insert_task(conn: &Connection, task: &OutboxTask) -> Result<bool> {
    let changed = conn
        .execute(
            "INSERT OR IGNORE INTO task_outbox(id, kind, dedup_key, payload_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id.as_str(),
                task.payload.kind(),
                task.dedup_key,
                to_json(&task.payload)?,
                micros(task.created_at)
            ],
        )
        .ctx("insert outbox task")?;
    Ok(changed == 1)
}

fn apply_fact(conn: &Connection, project: &str, build: &BuildId, fact: &JoinFact, now: DateTime<Utc>) -> Result<JoinOutcome> {
    let existing = load_entry(conn, build)?;
    match plan_join(project, build, existing.as_ref(), fact, now)? {
        JoinPlan::Duplicate => Ok(JoinOutcome::Duplicate),
        JoinPlan::Write { entry, created, task } => {
            validate_entry(&entry)?;
            write_entry(conn, &entry)?;
            let task_created = match task {
                Some(task) => {
                    let queued = insert_task(conn, &OutboxTask::new(TaskPayload::IngestTestResults(task), now))?;
                    if !queued {
                        debug!(build = %build, "ingestion task already recorded");
                    }
                    queued
                }
                None => false,
            };
            Ok(JoinOutcome::Written { created, task_created })
        }
    }
}

impl ControlStore for SqliteStorage {
    fn join_build_result(&self, build: &BuildResult, is_presubmit: bool, now: DateTime<Utc>) -> Result<JoinOutcome> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("begin join transaction")?;
        let fact = JoinFact::Build { is_presubmit, result: build.clone() };
        let outcome = apply_fact(&tx, &build.project, &build.build_id(), &fact, now)?;
        tx.commit().ctx("commit join transaction")?;
        if outcome == JoinOutcome::Duplicate {
            info!(build = %build.build_id(), "build result already joined; dropping duplicate");
        }
        Ok(outcome)
    }

    fn join_presubmit_results(
        &self,
        project: &str,
        results: &[(BuildId, PresubmitResult)],
        now: DateTime<Utc>,
    ) -> Result<JoinSummary> {
        let ids: Vec<BuildId> = results.iter().map(|(b, _)| b.clone()).collect();
        ensure_unique(&ids)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("begin join transaction")?;
        let mut summary = JoinSummary::default();
        for (build, result) in results {
            let fact = JoinFact::Presubmit(result.clone());
            let outcome = apply_fact(&tx, project, build, &fact, now)?;
            summary.push(build.clone(), outcome);
        }
        tx.commit().ctx("commit join transaction")?;

        for r in summary.reports.iter().filter(|r| r.outcome == JoinOutcome::Duplicate) {
            info!(build = %r.build_id, "presubmit result already joined; skipping");
        }
        Ok(summary)
    }

    fn read_entries(&self, builds: &[BuildId]) -> Result<Vec<Option<ControlEntry>>> {
        ensure_unique(builds)?;
        let conn = self.lock()?;
        builds.iter().map(|b| load_entry(&conn, b)).collect()
    }

    fn presubmit_join_stats(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, PresubmitJoinStatistics>> {
        let conn = self.lock()?;
        let since = now - Duration::hours(PRESUBMIT_JOIN_STATS_HOURS as i64);
        let mut stmt = conn
            .prepare(
                "SELECT project, build_result_json IS NOT NULL, presubmit_result_json IS NOT NULL, created_at
                 FROM ingestion_control WHERE is_presubmit = 1 AND created_at > ?1",
            )
            .ctx("prepare join stats query")?;
        let rows = stmt
            .query_map([micros(since)], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, bool>(1)?, r.get::<_, bool>(2)?, r.get::<_, i64>(3)?))
            })
            .ctx("query join stats")?;

        let mut out: BTreeMap<String, PresubmitJoinStatistics> = BTreeMap::new();
        for row in rows {
            let (project, has_build, has_presubmit, created_at) = row.ctx("read join stats row")?;
            let Some(hour) = hours_since(from_micros(created_at)?, now) else {
                continue;
            };
            out.entry(project)
                .or_insert_with(PresubmitJoinStatistics::empty)
                .record(hour, has_build, has_presubmit);
        }
        Ok(out)
    }
}

struct VariantRow {
    status: String,
    variant_json: String,
    tags_json: String,
    test_metadata_json: Option<String>,
    builder: Option<String>,
    next_update_task_enqueue_time: Option<i64>,
    created_at: i64,
    status_updated_at: i64,
}

impl VariantRow {
    fn decode(self, realm: &str, key: &TestVariantKey) -> Result<AnalyzedTestVariant> {
        let status = AnalyzedStatus::parse(&self.status)
            .ok_or_else(|| Error::storage(format!("unknown analyzed status {:?}", self.status)))?;
        Ok(AnalyzedTestVariant {
            realm: realm.to_string(),
            test_id: key.test_id.clone(),
            variant_hash: key.variant_hash.clone(),
            status,
            variant: from_json(&self.variant_json)?,
            tags: from_json(&self.tags_json)?,
            test_metadata: self.test_metadata_json.as_deref().map(from_json).transpose()?,
            builder: self.builder,
            next_update_task_enqueue_time: self.next_update_task_enqueue_time.map(from_micros).transpose()?,
            created_at: from_micros(self.created_at)?,
            status_updated_at: from_micros(self.status_updated_at)?,
        })
    }
}

fn load_variant(conn: &Connection, realm: &str, key: &TestVariantKey) -> Result<Option<AnalyzedTestVariant>> {
    let row = conn
        .query_row(
            "SELECT status, variant_json, tags_json, test_metadata_json, builder, next_update_task_enqueue_time, created_at, status_updated_at
             FROM analyzed_test_variants WHERE realm = ?1 AND test_id = ?2 AND variant_hash = ?3",
            params![realm, key.test_id, key.variant_hash],
            |r| {
                Ok(VariantRow {
                    status: r.get(0)?,
                    variant_json: r.get(1)?,
                    tags_json: r.get(2)?,
                    test_metadata_json: r.get(3)?,
                    builder: r.get(4)?,
                    next_update_task_enqueue_time: r.get(5)?,
                    created_at: r.get(6)?,
                    status_updated_at: r.get(7)?,
                })
            },
        )
        .optional()
        .ctx("read analyzed test variant")?;
    row.map(|r| r.decode(realm, key)).transpose()
}

fn write_variant(conn: &Connection, v: &AnalyzedTestVariant) -> Result<()> {
    let metadata_json = v.test_metadata.as_ref().map(to_json).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO analyzed_test_variants(realm, test_id, variant_hash, status, variant_json, tags_json, test_metadata_json, builder, next_update_task_enqueue_time, created_at, status_updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            v.realm,
            v.test_id,
            v.variant_hash,
            v.status.as_str(),
            to_json(&v.variant)?,
            to_json(&v.tags)?,
            metadata_json,
            v.builder,
            v.next_update_task_enqueue_time.map(micros),
            micros(v.created_at),
            micros(v.status_updated_at)
        ],
    )
    .ctx("write analyzed test variant")?;
    Ok(())
}

impl VariantStore for SqliteStorage {
    fn read_variants(&self, realm: &str, keys: &[TestVariantKey]) -> Result<Vec<AnalyzedTestVariant>> {
        let conn = self.lock()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = load_variant(&conn, realm, key)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn update_variants(&self, realm: &str, keys: &[TestVariantKey], plan: &mut VariantPlanner<'_>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("begin variant transaction")?;
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(row) = load_variant(&tx, realm, key)? {
                found.insert(key.clone(), row);
            }
        }
        let writes = plan(&found)?;
        for w in &writes {
            write_variant(&tx, &w.row)?;
            if let Some(task) = &w.update_task {
                let payload = TaskPayload::UpdateTestVariant(task.clone());
                insert_task(&tx, &OutboxTask::new(payload, task.enqueue_time))?;
            }
        }
        tx.commit().ctx("commit variant transaction")?;
        Ok(writes.len())
    }
}

fn load_tasks(conn: &Connection, sql: &str, limit: i64) -> Result<Vec<OutboxTask>> {
    let mut stmt = conn.prepare(sql).ctx("prepare outbox query")?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, Option<i64>>(4)?,
            ))
        })
        .ctx("query outbox")?;
    let mut out = vec![];
    for row in rows {
        let (id, dedup_key, payload_json, created_at, dispatched_at) = row.ctx("read outbox row")?;
        out.push(OutboxTask {
            id: TaskId::from_str(id),
            dedup_key,
            payload: from_json(&payload_json)?,
            created_at: from_micros(created_at)?,
            dispatched_at: dispatched_at.map(from_micros).transpose()?,
        });
    }
    Ok(out)
}

impl Outbox for SqliteStorage {
    fn record_task(&self, payload: TaskPayload, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        insert_task(&conn, &OutboxTask::new(payload, now))
    }

    fn pending_tasks(&self, limit: usize) -> Result<Vec<OutboxTask>> {
        let conn = self.lock()?;
        load_tasks(
            &conn,
            "SELECT id, dedup_key, payload_json, created_at, dispatched_at FROM task_outbox
             WHERE dispatched_at IS NULL ORDER BY seq LIMIT ?1",
            i64::try_from(limit).unwrap_or(i64::MAX),
        )
    }

    fn mark_dispatched(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().ctx("begin outbox transaction")?;
        for id in ids {
            tx.execute(
                "UPDATE task_outbox SET dispatched_at = COALESCE(dispatched_at, ?1) WHERE id = ?2",
                params![micros(now), id.as_str()],
            )
            .ctx("mark task dispatched")?;
        }
        tx.commit().ctx("commit outbox transaction")?;
        Ok(())
    }

    fn list_tasks(&self) -> Result<Vec<OutboxTask>> {
        let conn = self.lock()?;
        load_tasks(
            &conn,
            "SELECT id, dedup_key, payload_json, created_at, dispatched_at FROM task_outbox ORDER BY seq LIMIT ?1",
            -1,
        )
    }
}
