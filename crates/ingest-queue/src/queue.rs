use ingest_core::Result;
use ingest_storage::OutboxTask;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued,
    /// A task with the same dedup key was already accepted.
    Deduplicated,
}

/// A push task queue. Implementations deduplicate on `OutboxTask::dedup_key`.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: &OutboxTask) -> Result<EnqueueResult>;
}
