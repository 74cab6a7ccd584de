use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*};

/// A changelist under presubmit evaluation.
///
/// Field order defines the derived ordering: host, change, patchset.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Changelist {
    pub host: String,
    pub change: i64,
    pub patchset: i32,
}

/// Build facts captured from a build-completion notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub host: String,
    pub id: i64,
    pub project: String,
    pub creation_time: DateTime<Utc>,
}

impl BuildResult {
    pub fn build_id(&self) -> BuildId {
        BuildId::new(self.host.clone(), self.id)
    }
}

/// Presubmit facts captured from a run-completion notification, specialised
/// to one try-job build (`critical` is per build).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresubmitResult {
    pub presubmit_run_id: PresubmitRunId,
    pub succeeded: bool,
    pub owner: RunOwner,
    pub mode: PresubmitMode,
    pub cls: Vec<Changelist>,
    pub creation_time: DateTime<Utc>,
    pub critical: bool,
}

impl PresubmitResult {
    /// Whether the build this result is attached to could have contributed
    /// to a change being submitted.
    pub fn contributed_to_submission(&self) -> bool {
        self.succeeded && self.mode == PresubmitMode::FullRun
    }
}

/// The durable join record, one per build identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEntry {
    pub project: String,
    pub build_id: BuildId,
    pub is_presubmit: bool,
    pub build_result: Option<BuildResult>,
    pub presubmit_result: Option<PresubmitResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Work item handed to the result-ingestion orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTask {
    pub build: Option<BuildResult>,
    pub partition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run: Option<PresubmitResult>,
}

impl IngestionTask {
    /// Derives the task for a control entry that has become ready.
    /// Presubmit builds are partitioned by the run's creation time so all
    /// builds of a run land in the same partition.
    pub fn for_entry(build: &BuildResult, presubmit: Option<&PresubmitResult>) -> Self {
        let partition_time = presubmit.map(|p| p.creation_time).unwrap_or(build.creation_time);
        Self {
            build: Some(build.clone()),
            partition_time,
            presubmit_run: presubmit.cloned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StringPair {
    pub key: String,
    pub value: String,
}

impl StringPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLocation {
    pub repo: String,
    pub file_name: String,
    #[serde(default)]
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TestLocation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub result_id: String,
    pub expected: bool,
    pub status: TestStatus,
    #[serde(default)]
    pub tags: Vec<StringPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl TestResult {
    /// An unexpected result that is neither a pass nor a skip.
    pub fn is_unexpected_failure(&self) -> bool {
        !self.expected && !matches!(self.status, TestStatus::Pass | TestStatus::Skip)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExoneration {
    pub exoneration_id: String,
    #[serde(default)]
    pub explanation: String,
}

/// One test variant as returned by the results service's variant query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVariant {
    pub test_id: String,
    pub variant_hash: String,
    #[serde(default)]
    pub variant: BTreeMap<String, String>,
    pub status: TestVariantStatus,
    #[serde(default)]
    pub results: Vec<TestResult>,
    #[serde(default)]
    pub exonerations: Vec<TestExoneration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_metadata: Option<TestMetadata>,
}

impl TestVariant {
    pub fn key(&self) -> TestVariantKey {
        TestVariantKey::new(self.test_id.clone(), self.variant_hash.clone())
    }
}

/// Aggregate status row for one (realm, test, variant).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzedTestVariant {
    pub realm: String,
    pub test_id: String,
    pub variant_hash: String,
    pub status: AnalyzedStatus,
    pub variant: BTreeMap<String, String>,
    pub tags: Vec<StringPair>,
    pub test_metadata: Option<TestMetadata>,
    pub builder: Option<String>,
    pub next_update_task_enqueue_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}

impl AnalyzedTestVariant {
    pub fn key(&self) -> TestVariantKey {
        TestVariantKey::new(self.test_id.clone(), self.variant_hash.clone())
    }
}

/// Per-project counters of how well presubmit runs join with builds,
/// indexed by hours since the control entry was created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresubmitJoinStatistics {
    pub total_builds_by_hour: Vec<i64>,
    pub awaiting_build_by_hour: Vec<i64>,
    pub awaiting_presubmit_result_by_hour: Vec<i64>,
}

/// Number of trailing hours covered by [`PresubmitJoinStatistics`].
pub const PRESUBMIT_JOIN_STATS_HOURS: usize = 24;

impl PresubmitJoinStatistics {
    pub fn empty() -> Self {
        Self {
            total_builds_by_hour: vec![0; PRESUBMIT_JOIN_STATS_HOURS],
            awaiting_build_by_hour: vec![0; PRESUBMIT_JOIN_STATS_HOURS],
            awaiting_presubmit_result_by_hour: vec![0; PRESUBMIT_JOIN_STATS_HOURS],
        }
    }

    /// Counts one presubmit entry created `hour` hours ago. Entries outside
    /// the window are ignored.
    pub fn record(&mut self, hour: usize, has_build: bool, has_presubmit: bool) {
        if hour >= PRESUBMIT_JOIN_STATS_HOURS {
            return;
        }
        self.total_builds_by_hour[hour] += 1;
        if !has_build {
            self.awaiting_build_by_hour[hour] += 1;
        }
        if !has_presubmit {
            self.awaiting_presubmit_result_by_hour[hour] += 1;
        }
    }
}
