use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use ingest_core::{
    plan_join, validate_entry, AnalyzedTestVariant, BuildId, BuildResult, ControlEntry, Error, JoinFact, JoinOutcome,
    JoinPlan, JoinSummary, PresubmitJoinStatistics, PresubmitResult, Result, TaskId, TaskPayload, TestVariantKey,
};
use tracing::info;

use crate::traits::{
    ensure_unique, hours_since, ControlStore, Outbox, OutboxTask, VariantPlanner, VariantStore,
};

/// In-memory storage for tests. Not durable; a single lock makes every
/// method atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    control: HashMap<BuildId, ControlEntry>,
    variants: HashMap<(String, TestVariantKey), AnalyzedTestVariant>,
    outbox: Vec<OutboxTask>,
    dedup_keys: HashSet<String>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("in-memory storage lock poisoned")
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(poison_err)
    }

    /// Seeds a variant row directly, bypassing the status rule.
    pub fn insert_variant(&self, row: AnalyzedTestVariant) -> Result<()> {
        let mut inner = self.lock()?;
        inner.variants.insert((row.realm.clone(), row.key()), row);
        Ok(())
    }
}

impl Inner {
    /// Records a task unless one with the same dedup key exists.
    fn push_task(&mut self, payload: TaskPayload, now: DateTime<Utc>) -> bool {
        let task = OutboxTask::new(payload, now);
        let fresh = self.dedup_keys.insert(task.dedup_key.clone());
        if fresh {
            self.outbox.push(task);
        }
        fresh
    }

    /// Plans every fact against a scratch copy of the touched entries so the
    /// caller can commit all or nothing.
    fn plan_all(
        &self,
        project: &str,
        facts: &[(BuildId, JoinFact)],
        now: DateTime<Utc>,
    ) -> Result<Vec<(BuildId, JoinPlan)>> {
        let mut scratch: HashMap<BuildId, ControlEntry> = HashMap::new();
        let mut plans = Vec::with_capacity(facts.len());
        for (build, fact) in facts {
            let existing = scratch.get(build).or_else(|| self.control.get(build)).cloned();
            let plan = plan_join(project, build, existing.as_ref(), fact, now)?;
            if let JoinPlan::Write { entry, .. } = &plan {
                validate_entry(entry)?;
                scratch.insert(build.clone(), entry.clone());
            }
            plans.push((build.clone(), plan));
        }
        Ok(plans)
    }

    fn commit(&mut self, plans: Vec<(BuildId, JoinPlan)>, now: DateTime<Utc>) -> JoinSummary {
        let mut summary = JoinSummary::default();
        for (build, plan) in plans {
            match plan {
                JoinPlan::Duplicate => summary.push(build, JoinOutcome::Duplicate),
                JoinPlan::Write { entry, created, task } => {
                    let task_created = task.is_some();
                    if let Some(task) = task {
                        self.push_task(TaskPayload::IngestTestResults(task), now);
                    }
                    self.control.insert(build.clone(), entry);
                    summary.push(build, JoinOutcome::Written { created, task_created });
                }
            }
        }
        summary
    }
}

impl ControlStore for InMemoryStorage {
    fn join_build_result(&self, build: &BuildResult, is_presubmit: bool, now: DateTime<Utc>) -> Result<JoinOutcome> {
        let mut inner = self.lock()?;
        let fact = JoinFact::Build { is_presubmit, result: build.clone() };
        let plans = inner.plan_all(&build.project, &[(build.build_id(), fact)], now)?;
        let summary = inner.commit(plans, now);
        let outcome = summary
            .reports
            .first()
            .map(|r| r.outcome)
            .ok_or_else(|| Error::storage("join produced no outcome"))?;
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
        let facts: Vec<(BuildId, JoinFact)> = results
            .iter()
            .map(|(b, r)| (b.clone(), JoinFact::Presubmit(r.clone())))
            .collect();

        let mut inner = self.lock()?;
        let plans = inner.plan_all(project, &facts, now)?;
        let summary = inner.commit(plans, now);
        for r in summary.reports.iter().filter(|r| r.outcome == JoinOutcome::Duplicate) {
            info!(build = %r.build_id, "presubmit result already joined; skipping");
        }
        Ok(summary)
    }

    fn read_entries(&self, builds: &[BuildId]) -> Result<Vec<Option<ControlEntry>>> {
        ensure_unique(builds)?;
        let inner = self.lock()?;
        Ok(builds.iter().map(|b| inner.control.get(b).cloned()).collect())
    }

    fn presubmit_join_stats(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, PresubmitJoinStatistics>> {
        let inner = self.lock()?;
        let mut out: BTreeMap<String, PresubmitJoinStatistics> = BTreeMap::new();
        for e in inner.control.values().filter(|e| e.is_presubmit) {
            let Some(hour) = hours_since(e.created_at, now) else {
                continue;
            };
            if hour >= ingest_core::PRESUBMIT_JOIN_STATS_HOURS {
                continue;
            }
            out.entry(e.project.clone())
                .or_insert_with(PresubmitJoinStatistics::empty)
                .record(hour, e.build_result.is_some(), e.presubmit_result.is_some());
        }
        Ok(out)
    }
}

impl VariantStore for InMemoryStorage {
    fn read_variants(&self, realm: &str, keys: &[TestVariantKey]) -> Result<Vec<AnalyzedTestVariant>> {
        let inner = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|k| inner.variants.get(&(realm.to_string(), k.clone())).cloned())
            .collect())
    }

    fn update_variants(&self, realm: &str, keys: &[TestVariantKey], plan: &mut VariantPlanner<'_>) -> Result<usize> {
        let mut inner = self.lock()?;
        let found: BTreeMap<TestVariantKey, AnalyzedTestVariant> = keys
            .iter()
            .filter_map(|k| {
                inner
                    .variants
                    .get(&(realm.to_string(), k.clone()))
                    .map(|row| (k.clone(), row.clone()))
            })
            .collect();
        let writes = plan(&found)?;

        let n = writes.len();
        for w in writes {
            if let Some(task) = w.update_task {
                let at = task.enqueue_time;
                inner.push_task(TaskPayload::UpdateTestVariant(task), at);
            }
            inner.variants.insert((w.row.realm.clone(), w.row.key()), w.row);
        }
        Ok(n)
    }
}

impl Outbox for InMemoryStorage {
    fn record_task(&self, payload: TaskPayload, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.lock()?.push_task(payload, now))
    }

    fn pending_tasks(&self, limit: usize) -> Result<Vec<OutboxTask>> {
        let inner = self.lock()?;
        Ok(inner
            .outbox
            .iter()
            .filter(|t| t.dispatched_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_dispatched(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        for t in inner.outbox.iter_mut().filter(|t| ids.contains(&t.id)) {
            t.dispatched_at.get_or_insert(now);
        }
        Ok(())
    }

    fn list_tasks(&self) -> Result<Vec<OutboxTask>> {
        Ok(self.lock()?.outbox.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ingest_core::{AnalyzedStatus, PresubmitMode, PresubmitRunId, RunOwner, UpdateTestVariant};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn build(id: i64) -> BuildResult {
        BuildResult {
            host: "bb".into(),
            id,
            project: "chromium".into(),
            creation_time: now(),
        }
    }

    fn presubmit() -> PresubmitResult {
        PresubmitResult {
            presubmit_run_id: PresubmitRunId::cv("chromium", "run-1"),
            succeeded: true,
            owner: RunOwner::User,
            mode: PresubmitMode::FullRun,
            cls: vec![],
            creation_time: now(),
            critical: true,
        }
    }

    fn ingestion_tasks(s: &InMemoryStorage) -> usize {
        s.list_tasks()
            .unwrap()
            .iter()
            .filter(|t| matches!(t.payload, TaskPayload::IngestTestResults(_)))
            .count()
    }

    #[test]
    fn test_new_creates_empty_storage() {
        let storage = InMemoryStorage::new();
        assert!(storage.list_tasks().unwrap().is_empty());
        assert_eq!(storage.read_entries(&[BuildId::new("bb", 1)]).unwrap(), vec![None]);
    }

    #[test]
    fn test_ci_build_creates_one_task() {
        let storage = InMemoryStorage::new();
        let out = storage.join_build_result(&build(1), false, now()).unwrap();
        assert_eq!(out, JoinOutcome::Written { created: true, task_created: true });
        let again = storage.join_build_result(&build(1), false, now()).unwrap();
        assert_eq!(again, JoinOutcome::Duplicate);
        assert_eq!(ingestion_tasks(&storage), 1);
    }

    #[test]
    fn test_presubmit_batch_is_all_or_nothing() {
        let storage = InMemoryStorage::new();
        storage.join_build_result(&build(2), false, now()).unwrap();
        let err = storage
            .join_presubmit_results(
                "chromium",
                &[(BuildId::new("bb", 1), presubmit()), (BuildId::new("bb", 2), presubmit())],
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistent { .. }));
        assert_eq!(storage.read_entries(&[BuildId::new("bb", 1)]).unwrap(), vec![None]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let storage = InMemoryStorage::new();
        let ids = [BuildId::new("bb", 1), BuildId::new("bb", 1)];
        assert!(storage.read_entries(&ids).is_err());
    }

    #[test]
    fn test_join_stats_buckets_by_hour() {
        let storage = InMemoryStorage::new();
        storage
            .join_presubmit_results("chromium", &[(BuildId::new("bb", 1), presubmit())], now() - Duration::minutes(90))
            .unwrap();
        storage.join_build_result(&build(2), true, now()).unwrap();
        let stats = storage.presubmit_join_stats(now()).unwrap();
        let s = &stats["chromium"];
        assert_eq!(s.total_builds_by_hour[0], 1);
        assert_eq!(s.awaiting_presubmit_result_by_hour[0], 1);
        assert_eq!(s.total_builds_by_hour[1], 1);
        assert_eq!(s.awaiting_build_by_hour[1], 1);
    }

    #[test]
    fn test_mark_dispatched() {
        let storage = InMemoryStorage::new();
        storage.join_build_result(&build(1), false, now()).unwrap();
        let pending = storage.pending_tasks(10).unwrap();
        assert_eq!(pending.len(), 1);
        storage.mark_dispatched(&[pending[0].id.clone()], now()).unwrap();
        assert!(storage.pending_tasks(10).unwrap().is_empty());
        assert_eq!(storage.list_tasks().unwrap().len(), 1);
    }

    #[test]
    fn test_update_variants_records_update_tasks() {
        let storage = InMemoryStorage::new();
        let key = TestVariantKey::new("ninja://t", "hash");
        let row = AnalyzedTestVariant {
            realm: "chromium:ci".into(),
            test_id: key.test_id.clone(),
            variant_hash: key.variant_hash.clone(),
            status: AnalyzedStatus::HasUnexpectedResults,
            variant: BTreeMap::new(),
            tags: vec![],
            test_metadata: None,
            builder: None,
            next_update_task_enqueue_time: Some(now()),
            created_at: now(),
            status_updated_at: now(),
        };
        let task = UpdateTestVariant {
            realm: "chromium:ci".into(),
            test_id: key.test_id.clone(),
            variant_hash: key.variant_hash.clone(),
            interval_secs: 3600,
            enqueue_time: now(),
        };
        let keys = vec![key.clone()];
        let written = storage
            .update_variants("chromium:ci", &keys, &mut |found| {
                assert!(found.is_empty());
                Ok(vec![crate::VariantWrite { row: row.clone(), update_task: Some(task.clone()) }])
            })
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(storage.read_variants("chromium:ci", &keys).unwrap(), vec![row]);
        assert_eq!(storage.list_tasks().unwrap().len(), 1);
    }
}
