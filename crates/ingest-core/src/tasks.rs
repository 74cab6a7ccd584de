use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ids::BuildId, types::IngestionTask};

/// Follow-up work for one analyzed test variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTestVariant {
    pub realm: String,
    pub test_id: String,
    pub variant_hash: String,
    pub interval_secs: u64,
    pub enqueue_time: DateTime<Utc>,
}

/// Bookkeeping handed to the later result-collection step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectTestResults {
    pub invocation: String,
    pub realm: String,
    pub results_host: String,
    pub builder: String,
    pub is_presubmit: bool,
    pub contributed_to_cl_submission: bool,
}

/// Every task payload this system produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskPayload {
    IngestTestResults(IngestionTask),
    UpdateTestVariant(UpdateTestVariant),
    CollectTestResults(CollectTestResults),
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::IngestTestResults(_) => "ingest-test-results",
            TaskPayload::UpdateTestVariant(_) => "update-test-variant",
            TaskPayload::CollectTestResults(_) => "collect-test-results",
        }
    }

    /// Key under which the queue deduplicates this payload. Ingestion keys
    /// are per build, so a second enqueue for the same build collides.
    pub fn dedup_key(&self) -> String {
        match self {
            TaskPayload::IngestTestResults(t) => match &t.build {
                Some(b) => ingestion_dedup_key(&b.build_id()),
                None => format!("{}/unknown/{}", self.kind(), t.partition_time.timestamp_micros()),
            },
            TaskPayload::UpdateTestVariant(u) => format!(
                "{}/{}/{}/{}/{}",
                self.kind(),
                u.realm,
                u.test_id,
                u.variant_hash,
                u.enqueue_time.timestamp_micros()
            ),
            TaskPayload::CollectTestResults(c) => format!("{}/{}", self.kind(), c.invocation),
        }
    }
}

pub fn ingestion_dedup_key(build: &BuildId) -> String {
    format!("ingest-test-results/{}/{}", build.host, build.id)
}
