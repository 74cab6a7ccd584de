use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ingest_core::{
    AnalyzedTestVariant, BuildId, BuildResult, ControlEntry, JoinOutcome, JoinSummary, PresubmitJoinStatistics,
    PresubmitResult, Result, TaskId, TaskPayload, TestVariantKey, UpdateTestVariant,
};

/// The join/control table. Each method is one atomic read-modify-write:
/// the entry write and any resulting ingestion task commit together.
pub trait ControlStore: Send + Sync {
    fn join_build_result(
        &self,
        build: &BuildResult,
        is_presubmit: bool,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome>;

    /// Joins one presubmit result per build. All builds share a single
    /// transaction; any failure rolls back the whole batch.
    fn join_presubmit_results(
        &self,
        project: &str,
        results: &[(BuildId, PresubmitResult)],
        now: DateTime<Utc>,
    ) -> Result<JoinSummary>;

    /// One slot per requested build, in request order; `None` if absent.
    /// Duplicate ids in one request are rejected.
    fn read_entries(&self, builds: &[BuildId]) -> Result<Vec<Option<ControlEntry>>>;

    /// Join health for presubmit entries created in the trailing 24 hours.
    fn presubmit_join_stats(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, PresubmitJoinStatistics>>;
}

/// A row to persist, plus the follow-up task to record in the same commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantWrite {
    pub row: AnalyzedTestVariant,
    pub update_task: Option<UpdateTestVariant>,
}

/// Plans writes from the rows currently stored for the requested keys.
pub type VariantPlanner<'a> =
    dyn FnMut(&BTreeMap<TestVariantKey, AnalyzedTestVariant>) -> Result<Vec<VariantWrite>> + 'a;

pub trait VariantStore: Send + Sync {
    fn read_variants(&self, realm: &str, keys: &[TestVariantKey]) -> Result<Vec<AnalyzedTestVariant>>;

    /// Reads the rows for `keys`, calls `plan`, and applies its writes in one
    /// transaction. Returns the number of rows written.
    fn update_variants(&self, realm: &str, keys: &[TestVariantKey], plan: &mut VariantPlanner<'_>) -> Result<usize>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxTask {
    pub id: TaskId,
    pub dedup_key: String,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxTask {
    pub fn new(payload: TaskPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            dedup_key: payload.dedup_key(),
            payload,
            created_at: now,
            dispatched_at: None,
        }
    }
}

/// Tasks written alongside state changes, waiting to be relayed to a queue.
pub trait Outbox: Send + Sync {
    /// Records a standalone task. Returns false if its dedup key is taken.
    fn record_task(&self, payload: TaskPayload, now: DateTime<Utc>) -> Result<bool>;
    fn pending_tasks(&self, limit: usize) -> Result<Vec<OutboxTask>>;
    fn mark_dispatched(&self, ids: &[TaskId], now: DateTime<Utc>) -> Result<()>;
    /// Every task ever recorded, oldest first.
    fn list_tasks(&self) -> Result<Vec<OutboxTask>>;
}

pub trait Storage: ControlStore + VariantStore + Outbox {}

impl<T: ControlStore + VariantStore + Outbox> Storage for T {}

/// Rejects duplicate ids in a batch request.
pub fn ensure_unique(builds: &[BuildId]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for b in builds {
        if !seen.insert(b) {
            return Err(ingest_core::Error::InvalidArgument(format!("duplicate build ID {b}")));
        }
    }
    Ok(())
}

/// Hours elapsed since `created`, for bucketing join statistics.
pub fn hours_since(created: DateTime<Utc>, now: DateTime<Utc>) -> Option<usize> {
    let hours = (now - created).num_hours();
    usize::try_from(hours).ok()
}
