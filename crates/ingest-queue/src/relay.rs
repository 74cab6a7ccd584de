use chrono::{DateTime, Utc};
use ingest_core::Result;
use ingest_storage::Outbox;
use tracing::{debug, info};

use crate::queue::{EnqueueResult, TaskQueue};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub enqueued: usize,
    pub deduplicated: usize,
}

/// Moves up to `limit` pending outbox tasks to `queue`, oldest first, and
/// marks them dispatched. If an enqueue fails, the tasks relayed before it are
/// still marked and the error is returned; the rest stay pending.
pub fn relay_outbox<O, Q>(outbox: &O, queue: &Q, limit: usize, now: DateTime<Utc>) -> Result<RelayReport>
where
    O: Outbox + ?Sized,
    Q: TaskQueue + ?Sized,
{
    let pending = outbox.pending_tasks(limit)?;
    let mut report = RelayReport::default();
    let mut sent = Vec::with_capacity(pending.len());
    let mut failure = None;
    for task in &pending {
        match queue.enqueue(task) {
            Ok(EnqueueResult::Enqueued) => report.enqueued += 1,
            Ok(EnqueueResult::Deduplicated) => {
                debug!(dedup_key = %task.dedup_key, "queue already holds task");
                report.deduplicated += 1;
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
        sent.push(task.id.clone());
    }
    if !sent.is_empty() {
        outbox.mark_dispatched(&sent, now)?;
    }
    if let Some(err) = failure {
        return Err(err);
    }
    if report.enqueued > 0 {
        info!(enqueued = report.enqueued, deduplicated = report.deduplicated, "relayed outbox tasks");
    }
    Ok(report)
}
